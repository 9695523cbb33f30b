use std::fmt;
use std::time::{Duration, Instant};

use resource::ResourceRef;
use serde::{Deserialize, Serialize};

/// One resource waiting in the retry queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchWorkItem {
    pub resource: ResourceRef,
    pub target_version: String,
    pub retry_count: u32,
    /// First enqueue; survives requeues so durations cover every attempt.
    pub enqueue_time: Instant,
}

impl BatchWorkItem {
    pub fn new(resource: ResourceRef, target_version: impl Into<String>) -> Self {
        Self {
            resource,
            target_version: target_version.into(),
            retry_count: 0,
            enqueue_time: Instant::now(),
        }
    }

    /// Copy for the next attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchStatus {
    Success,
    Failed,
    Skipped,
    /// Intermediate; only ever reported to a [`BatchObserver`](crate::BatchObserver).
    Retrying,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Success => "success",
            BatchStatus::Failed => "failed",
            BatchStatus::Skipped => "skipped",
            BatchStatus::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::Retrying)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConversionResult {
    pub resource: ResourceRef,
    pub status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "resource::serde_millis")]
    pub duration: Duration,
    pub retry_count: u32,
}

impl BatchConversionResult {
    pub(crate) fn new(item: &BatchWorkItem, status: BatchStatus, error: Option<String>) -> Self {
        Self {
            resource: item.resource.clone(),
            status,
            error,
            duration: item.enqueue_time.elapsed(),
            retry_count: item.retry_count,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == BatchStatus::Success
    }
}
