//! Two-tier key/value cache: a fast in-process LRU in front of an optional
//! persistent manifest store, composed behind one async facade.
//!
//! Reads fall through memory to disk with per-key single-flight
//! deduplication; writes land in memory synchronously and reach disk through
//! a per-key debounced coalescer. Values cross the disk boundary through a
//! pluggable [`Codec`]; keys pass through a pluggable [`KeyEncoder`].

pub mod codec;
pub mod config;
pub mod error;
pub mod metrics;

mod memory;
mod single_flight;
mod write_coalescer;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use manifest_store::{ManifestStore, TrimObserver};
use tracing::{debug, warn};

pub use crate::codec::{Codec, DigestKeyEncoder, IdentityCodec, IdentityKeyEncoder, JsonCodec, KeyEncoder};
pub use crate::config::{CacheConfig, DiskConfig, MemoryConfig, StorageMode};
pub use crate::error::CacheError;
pub use crate::metrics::{CacheMetrics, MetricsSnapshot};

use crate::memory::MemoryTier;
use crate::single_flight::SingleFlight;
use crate::write_coalescer::{PerformFn, WriteCoalescer, WritePayload, DEFAULT_SILENCE_WINDOW};

/// A two-tier cache instance. Cheap to clone and safe to share; all state
/// lives in the tiers it owns.
pub struct TierCache<V> {
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for TierCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct CacheInner<V> {
    config: CacheConfig,
    memory: MemoryTier<V>,
    disk: Option<ManifestStore>,
    flights: SingleFlight<Result<Option<V>, CacheError>>,
    coalescer: Option<WriteCoalescer>,
    codec: Arc<dyn Codec<V>>,
    key_encoder: Arc<dyn KeyEncoder>,
    metrics: Arc<CacheMetrics>,
}

impl TierCache<Bytes> {
    /// A cache of raw byte values.
    pub fn bytes(config: CacheConfig) -> Self {
        Self::new(config, IdentityCodec)
    }
}

impl<V: Clone + Send + Sync + 'static> TierCache<V> {
    pub fn new(config: CacheConfig, codec: impl Codec<V> + 'static) -> Self {
        Self::with_key_encoder(config, codec, IdentityKeyEncoder)
    }

    pub fn with_key_encoder(
        config: CacheConfig,
        codec: impl Codec<V> + 'static,
        key_encoder: impl KeyEncoder + 'static,
    ) -> Self {
        let metrics = Arc::new(CacheMetrics::new(config.metrics_enabled));
        let memory = MemoryTier::new(config.memory.clone());

        let disk = if config.disk.enabled {
            let store_config = config.disk.store_config(config.store_root());
            let observer: TrimObserver = {
                let metrics = metrics.clone();
                Arc::new(move |deleted_count, deleted_bytes| {
                    metrics.record_trim(deleted_count, deleted_bytes);
                })
            };
            match ManifestStore::open(store_config, Some(observer)) {
                Ok(store) => Some(store),
                Err(e) => {
                    // a cache without its disk tier is still a cache
                    warn!(name = %config.name, "failed to open disk tier, running memory-only: {e}");
                    None
                },
            }
        } else {
            None
        };

        let coalescer = disk.as_ref().map(|store| {
            let perform: PerformFn = {
                let store = store.clone();
                let metrics = metrics.clone();
                Arc::new(move |key: String, payload: WritePayload| {
                    let store = store.clone();
                    let metrics = metrics.clone();
                    Box::pin(async move {
                        let len = payload.bytes.len() as u64;
                        match store.write(&key, payload.bytes, payload.ttl).await {
                            Ok(()) => metrics.record_writes_bytes(len),
                            // memory already holds the value; a miss later is acceptable
                            Err(e) => warn!("disk write failed: {e}"),
                        }
                    })
                })
            };
            WriteCoalescer::new(DEFAULT_SILENCE_WINDOW, perform)
        });

        Self {
            inner: Arc::new(CacheInner {
                config,
                memory,
                disk,
                flights: SingleFlight::new(),
                coalescer,
                codec: Arc::new(codec),
                key_encoder: Arc::new(key_encoder),
                metrics,
            }),
        }
    }

    /// Read through the tiers. Disk and store failures degrade to a miss;
    /// decode failures propagate to every caller of the deduplicated read.
    pub async fn get(&self, key: &str) -> Result<Option<V>, CacheError> {
        let inner = &self.inner;
        let key = encode_key(inner, key)?;
        let started = Instant::now();

        if let Some(value) = inner.memory.get(&key).await {
            inner.metrics.record_memory_hit();
            inner.metrics.record_get(started.elapsed());
            return Ok(Some(value));
        }
        inner.metrics.record_memory_miss();

        let Some(disk) = inner.disk.clone() else {
            inner.metrics.record_get(started.elapsed());
            return Ok(None);
        };

        let work = {
            let memory = inner.memory.clone();
            let codec = inner.codec.clone();
            let metrics = inner.metrics.clone();
            let key = key.clone();
            async move {
                // a flight that raced a just-completed one may find the value
                // already repopulated
                if let Some(value) = memory.get(&key).await {
                    return Ok(Some(value));
                }
                let bytes = match disk.read(&key).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        // cache misses are always acceptable
                        warn!("disk read failed, treating as miss: {e}");
                        None
                    },
                };
                let Some(bytes) = bytes else {
                    return Ok(None);
                };
                metrics.record_reads_bytes(bytes.len() as u64);
                let value = codec.decode(&bytes)?;
                memory.put(key, value.clone(), bytes.len() as u64, None).await;
                metrics.record_disk_hit();
                Ok(Some(value))
            }
        };

        let value = inner
            .flights
            .run(&key, work)
            .await
            .map_err(|_| CacheError::Cancelled)??;
        if value.is_none() {
            inner.metrics.record_disk_miss();
        }
        inner.metrics.record_get(started.elapsed());
        Ok(value)
    }

    /// Write to memory synchronously and schedule the disk write. Encoding
    /// failures propagate and leave both tiers untouched; disk failures are
    /// logged and the memory write stands.
    pub async fn set(&self, key: &str, value: V, cost: u64, ttl: Option<Duration>) -> Result<(), CacheError> {
        let inner = &self.inner;
        let key = encode_key(inner, key)?;
        let started = Instant::now();

        let bytes = inner.codec.encode(&value)?;
        inner.memory.put(key.clone(), value, cost, ttl).await;
        if let Some(coalescer) = &inner.coalescer {
            coalescer.submit(&key, WritePayload { bytes, ttl });
        }

        inner.metrics.record_set(started.elapsed());
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<(), CacheError> {
        let inner = &self.inner;
        let key = encode_key(inner, key)?;

        if let Some(coalescer) = &inner.coalescer {
            // a still-debouncing write must not resurrect the key
            coalescer.cancel(&key);
        }
        inner.memory.remove(&key).await;
        if let Some(disk) = &inner.disk {
            if let Err(e) = disk.remove(&key).await {
                warn!("disk remove failed: {e}");
            }
        }
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        let inner = &self.inner;
        if inner.config.logging_enabled {
            debug!(name = %inner.config.name, "clearing cache");
        }

        if let Some(coalescer) = &inner.coalescer {
            coalescer.cancel_all();
        }
        inner.memory.clear().await;
        if let Some(disk) = &inner.disk {
            if let Err(e) = disk.clear().await {
                warn!("disk clear failed: {e}");
            }
        }
        Ok(())
    }

    /// Probe both tiers without loading the disk payload. Store failures
    /// degrade to `false`.
    pub async fn contains(&self, key: &str) -> Result<bool, CacheError> {
        let inner = &self.inner;
        let key = encode_key(inner, key)?;

        if inner.memory.contains(&key).await {
            return Ok(true);
        }
        let Some(disk) = &inner.disk else {
            return Ok(false);
        };
        match disk.contains(&key).await {
            Ok(present) => Ok(present),
            Err(e) => {
                warn!("disk contains probe failed: {e}");
                Ok(false)
            },
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}

fn encode_key<V>(inner: &CacheInner<V>, key: &str) -> Result<String, CacheError> {
    if key.is_empty() {
        return Err(CacheError::InvalidKey);
    }
    let encoded = inner.key_encoder.encode(key);
    if inner.config.logging_enabled {
        debug!(name = %inner.config.name, key = %encoded, "cache op");
    }
    Ok(encoded)
}
