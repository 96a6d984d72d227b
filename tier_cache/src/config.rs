use std::path::PathBuf;
use std::time::Duration;

pub use manifest_store::StorageMode;

/// Default in-memory cost budget: 50 MiB.
pub const DEFAULT_MEMORY_COST_LIMIT: u64 = 50 * 1024 * 1024;
/// Default on-disk byte budget: 1 GiB.
pub const DEFAULT_DISK_BYTE_LIMIT: u64 = 1 << 30;
/// Default inline/sidecar boundary for mixed-mode storage: 20 KiB.
pub const DEFAULT_INLINE_THRESHOLD: u64 = 20 * 1024;

/// Configuration for a [`TierCache`](crate::TierCache) instance.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Instance name; the disk tier lives at `<directory>/<name>/`.
    pub name: String,
    /// Override of the data root. Defaults to the system temp directory.
    pub directory: Option<PathBuf>,
    pub memory: MemoryConfig,
    pub disk: DiskConfig,
    /// Gates per-operation debug logs; warnings always fire.
    pub logging_enabled: bool,
    /// When false, all metric recorders are no-ops.
    pub metrics_enabled: bool,
}

impl CacheConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            directory: None,
            memory: MemoryConfig::default(),
            disk: DiskConfig::default(),
            logging_enabled: true,
            metrics_enabled: true,
        }
    }

    pub(crate) fn store_root(&self) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(std::env::temp_dir)
            .join(&self.name)
    }
}

/// Budgets for the in-memory LRU tier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryConfig {
    pub count_limit: usize,
    pub cost_limit: u64,
    /// Entries older than this (by last access) are evicted. `None` = no limit.
    pub age_limit: Option<Duration>,
    /// Background trim cadence. `None` disables the periodic trimmer.
    pub auto_trim_interval: Option<Duration>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            count_limit: 1000,
            cost_limit: DEFAULT_MEMORY_COST_LIMIT,
            age_limit: None,
            auto_trim_interval: Some(Duration::from_secs(5)),
        }
    }
}

/// Budgets and placement policy for the on-disk tier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskConfig {
    pub enabled: bool,
    pub byte_limit: u64,
    pub count_limit: u64,
    pub age_limit: Option<Duration>,
    pub auto_trim_interval: Option<Duration>,
    /// In mixed mode, values at or under this size are stored inline in the
    /// manifest; larger ones become sidecar files.
    pub inline_threshold: u64,
    pub storage_mode: StorageMode,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            byte_limit: DEFAULT_DISK_BYTE_LIMIT,
            count_limit: 100_000,
            age_limit: None,
            auto_trim_interval: Some(Duration::from_secs(30)),
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            storage_mode: StorageMode::Mixed,
        }
    }
}

impl DiskConfig {
    pub(crate) fn store_config(&self, root: PathBuf) -> manifest_store::StoreConfig {
        let mut config = manifest_store::StoreConfig::new(root);
        config.byte_limit = self.byte_limit;
        config.count_limit = self.count_limit;
        config.age_limit = self.age_limit;
        config.auto_trim_interval = self.auto_trim_interval;
        config.inline_threshold = self.inline_threshold;
        config.storage_mode = self.storage_mode;
        config
    }
}
