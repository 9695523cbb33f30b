use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{BatchConversionResult, BatchStatus};

/// Counters across every batch a processor has run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchMetrics {
    pub total_batches: u64,
    pub total_resources: u64,
    pub successful_conversions: u64,
    pub failed_conversions: u64,
    pub skipped_resources: u64,
    pub largest_batch: usize,
    #[serde(with = "resource::serde_millis")]
    pub average_batch_time: Duration,
    #[serde(with = "resource::serde_millis")]
    pub average_resource_time: Duration,
    /// Live gauges, filled in when the snapshot is taken.
    pub active_workers: usize,
    pub queue_size: usize,
}

impl BatchMetrics {
    fn record_batch(&mut self, size: usize, elapsed: Duration, results: &[BatchConversionResult]) {
        self.total_batches += 1;
        self.largest_batch = self.largest_batch.max(size);
        self.average_batch_time = running_mean(self.average_batch_time, elapsed, self.total_batches);

        for result in results {
            self.total_resources += 1;
            match result.status {
                BatchStatus::Success => self.successful_conversions += 1,
                BatchStatus::Failed => self.failed_conversions += 1,
                BatchStatus::Skipped => self.skipped_resources += 1,
                BatchStatus::Retrying => {}
            }
            self.average_resource_time =
                running_mean(self.average_resource_time, result.duration, self.total_resources);
        }
    }
}

/// `mean + (sample - mean) / n`, where `n` counts `sample`.
fn running_mean(mean: Duration, sample: Duration, n: u64) -> Duration {
    if n <= 1 {
        return sample;
    }
    let mean = mean.as_secs_f64();
    Duration::from_secs_f64((mean + (sample.as_secs_f64() - mean) / n as f64).max(0.0))
}

/// Owned by one processor; the lock is held only for counter updates.
#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    inner: Mutex<BatchMetrics>,
}

impl MetricsRecorder {
    fn lock(&self) -> MutexGuard<'_, BatchMetrics> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn record_batch(&self, size: usize, elapsed: Duration, results: &[BatchConversionResult]) {
        self.lock().record_batch(size, elapsed, results);
    }

    pub(crate) fn snapshot(&self) -> BatchMetrics {
        self.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resource::ResourceRef;

    fn result(status: BatchStatus, millis: u64) -> BatchConversionResult {
        BatchConversionResult {
            resource: ResourceRef::new("Widget", "default", "w"),
            status,
            error: None,
            duration: Duration::from_millis(millis),
            retry_count: 0,
        }
    }

    #[test]
    fn running_mean_matches_the_plain_mean() {
        let samples = [10, 20, 60].map(Duration::from_millis);
        let mut mean = Duration::ZERO;
        for (i, sample) in samples.iter().enumerate() {
            mean = running_mean(mean, *sample, i as u64 + 1);
        }
        assert!((mean.as_secs_f64() - 0.030).abs() < 1e-9);
    }

    #[test]
    fn batches_accumulate() {
        let recorder = MetricsRecorder::default();
        recorder.record_batch(
            2,
            Duration::from_millis(100),
            &[result(BatchStatus::Success, 10), result(BatchStatus::Skipped, 30)],
        );
        recorder.record_batch(1, Duration::from_millis(300), &[result(BatchStatus::Failed, 50)]);

        let metrics = recorder.snapshot();
        assert_eq!(metrics.total_batches, 2);
        assert_eq!(metrics.total_resources, 3);
        assert_eq!(metrics.successful_conversions, 1);
        assert_eq!(metrics.skipped_resources, 1);
        assert_eq!(metrics.failed_conversions, 1);
        assert_eq!(metrics.largest_batch, 2);
        assert!((metrics.average_batch_time.as_secs_f64() - 0.200).abs() < 1e-6);
        assert!((metrics.average_resource_time.as_secs_f64() - 0.030).abs() < 1e-6);
    }
}
