//! Content-addressed conversion cache.
//!
//! One mutex guards the LRU order, the entries, and the counters. Expiry is
//! checked on every lookup; an optional background thread also sweeps
//! expired entries on a fixed interval and stops when the cache is dropped.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use lru::LruCache;
use resource::Resource;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::CacheError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub capacity: usize,
    #[serde(with = "resource::serde_millis")]
    pub ttl: Duration,
    /// Zero disables the background sweep.
    #[serde(with = "resource::serde_millis")]
    pub sweep_interval: Duration,
    pub max_entry_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            max_entry_bytes: 1 << 20,
        }
    }
}

impl CacheConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_max_entry_bytes(mut self, bytes: usize) -> Self {
        self.max_entry_bytes = bytes;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub result: Resource,
    /// Out-of-line values `result` refers to, keyed by reference.
    pub attachments: BTreeMap<String, Value>,
    pub hash_key: String,
    pub timestamp: Instant,
    pub last_access: Instant,
    pub access_count: u64,
    pub size_bytes: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug)]
struct CacheState {
    entries: LruCache<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl CacheState {
    fn sweep(&mut self, ttl: Duration) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.timestamp.elapsed() > ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.entries.pop(key);
        }
        self.expirations += expired.len() as u64;
        expired.len()
    }
}

struct Sweeper {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub struct ConversionCache {
    config: CacheConfig,
    state: Arc<Mutex<CacheState>>,
    _sweeper: Option<Sweeper>,
}

impl ConversionCache {
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        let capacity = NonZeroUsize::new(config.capacity).ok_or(CacheError::ZeroCapacity)?;
        let state = Arc::new(Mutex::new(CacheState {
            entries: LruCache::new(capacity),
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        }));
        let sweeper = if config.sweep_interval.is_zero() {
            None
        } else {
            Some(spawn_sweeper(Arc::clone(&state), config.ttl, config.sweep_interval)?)
        };
        Ok(Self {
            config,
            state,
            _sweeper: sweeper,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Deep copy of the cached result, or `None` on a miss. An expired entry
    /// is dropped and counted as a miss.
    pub fn get(&self, key: &str) -> Option<Resource> {
        self.get_with_attachments(key).map(|(result, _)| result)
    }

    /// Like [`get`](Self::get), with copies of the entry's attachments.
    pub fn get_with_attachments(&self, key: &str) -> Option<(Resource, BTreeMap<String, Value>)> {
        let mut state = self.lock();
        let expired = state
            .entries
            .peek(key)
            .map(|entry| entry.timestamp.elapsed() > self.config.ttl);
        match expired {
            None => {
                state.misses += 1;
                None
            }
            Some(true) => {
                state.entries.pop(key);
                state.expirations += 1;
                state.misses += 1;
                None
            }
            Some(false) => {
                state.hits += 1;
                let entry = state.entries.get_mut(key)?;
                entry.access_count += 1;
                entry.last_access = Instant::now();
                Some((entry.result.clone(), entry.attachments.clone()))
            }
        }
    }

    /// Store a deep copy of `result`. The least recently used entry is
    /// evicted when the cache is full.
    pub fn insert(&self, key: impl Into<String>, result: &Resource) -> Result<(), CacheError> {
        self.insert_with_attachments(key, result, BTreeMap::new())
    }

    /// Store `result` together with the values it refers to out of line.
    /// Attachments count toward `max_entry_bytes` and leave the cache with
    /// their entry.
    pub fn insert_with_attachments(
        &self,
        key: impl Into<String>,
        result: &Resource,
        attachments: BTreeMap<String, Value>,
    ) -> Result<(), CacheError> {
        let size = result.size_bytes()
            + attachments
                .values()
                .map(|value| serde_json::to_vec(value).map(|bytes| bytes.len()).unwrap_or(0))
                .sum::<usize>();
        if size > self.config.max_entry_bytes {
            return Err(CacheError::EntryTooLarge {
                size,
                max: self.config.max_entry_bytes,
            });
        }
        let key = key.into();
        let now = Instant::now();
        let entry = CacheEntry {
            result: result.clone(),
            attachments,
            hash_key: key.clone(),
            timestamp: now,
            last_access: now,
            access_count: 0,
            size_bytes: size,
        };

        let mut state = self.lock();
        let evicted = match state.entries.push(key.clone(), entry) {
            Some((evicted, _)) if evicted != key => {
                state.evictions += 1;
                Some(evicted)
            }
            _ => None,
        };
        drop(state);
        if let Some(evicted) = evicted {
            debug!(key = %evicted, "cache_evicted");
        }
        Ok(())
    }

    /// Drop every expired entry now. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        self.lock().sweep(self.config.ttl)
    }

    /// Remove all entries and reset the counters.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.hits = 0;
        state.misses = 0;
        state.evictions = 0;
        state.expirations = 0;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            entries: state.entries.len(),
            capacity: self.config.capacity,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            expirations: state.expirations,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ConversionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

fn spawn_sweeper(
    state: Arc<Mutex<CacheState>>,
    ttl: Duration,
    interval: Duration,
) -> Result<Sweeper, CacheError> {
    let (stop, stopped) = mpsc::channel::<()>();
    let handle = thread::Builder::new()
        .name("conversion-cache-sweeper".into())
        .spawn(move || loop {
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let removed = match state.lock() {
                        Ok(mut guard) => guard.sweep(ttl),
                        Err(_) => {
                            warn!("cache_sweeper_poisoned");
                            return;
                        }
                    };
                    if removed > 0 {
                        debug!(removed, "cache_swept");
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
        })
        .map_err(|e| CacheError::Sweeper(e.to_string()))?;
    Ok(Sweeper {
        stop,
        handle: Some(handle),
    })
}

/// SHA-256 over the identity, version, target and spec of `source`,
/// with a separator byte between parts.
pub fn cache_key(source: &Resource, target_version: &str) -> String {
    let spec = source
        .spec()
        .map(|spec| serde_json::to_vec(spec).unwrap_or_default())
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    for part in [
        source.api_version().as_bytes(),
        source.kind().as_bytes(),
        source.namespace().as_bytes(),
        source.name().as_bytes(),
        source.resource_version().as_bytes(),
        target_version.as_bytes(),
        spec.as_slice(),
    ] {
        hasher.update(part);
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}
