//! Persistent key→blob manifest store, the disk tier of the cache.
//!
//! Values live either inline in a SQLite manifest row or as sidecar files
//! under `data/`, with TTL, age, count, and byte-budget trimming. All
//! operations are serialized through a single actor thread that owns the
//! database connection, so synchronous SQLite calls never block the async
//! executor and every invariant is maintained without locks.

pub mod error;

mod db;
mod sidecar;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::db::{now_secs, DoomedRecord, ManifestDb};
pub use crate::error::StoreError;

const MANIFEST_FILE: &str = "manifest.sqlite3";
const DATA_DIR: &str = "data";
const CACHEDIR_TAG: &str = "CACHEDIR.TAG";

/// Rows examined per TTL trim pass.
const TTL_PASS_LIMIT: u64 = 512;
/// Rows examined per age trim pass.
const AGE_PASS_LIMIT: u64 = 256;

/// Where a written value is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageMode {
    /// Inline iff the value fits under the inline threshold.
    #[default]
    Mixed,
    /// Always inline in the manifest row.
    Inline,
    /// Always a sidecar file.
    File,
}

/// Observer invoked with `(deleted_count, deleted_bytes)` after each trim
/// pass that removed anything.
pub type TrimObserver = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Clone)]
pub struct StoreConfig {
    /// The store's directory; the manifest and `data/` live directly under it.
    pub root: PathBuf,
    pub byte_limit: u64,
    pub count_limit: u64,
    pub age_limit: Option<Duration>,
    pub auto_trim_interval: Option<Duration>,
    pub inline_threshold: u64,
    pub storage_mode: StorageMode,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            byte_limit: 1 << 30,
            count_limit: 100_000,
            age_limit: None,
            auto_trim_interval: Some(Duration::from_secs(30)),
            inline_threshold: 20 * 1024,
            storage_mode: StorageMode::Mixed,
        }
    }

    fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR)
    }
}

enum StoreOp {
    Read {
        key: String,
        reply: oneshot::Sender<Result<Option<Vec<u8>>, StoreError>>,
    },
    Write {
        key: String,
        bytes: Bytes,
        ttl: Option<Duration>,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Remove {
        key: String,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Clear {
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Contains {
        key: String,
        reply: oneshot::Sender<Result<bool, StoreError>>,
    },
    Trim {
        reply: Option<oneshot::Sender<Result<(), StoreError>>>,
    },
    Stats {
        reply: oneshot::Sender<Result<(u64, u64), StoreError>>,
    },
}

/// Cheap-clone handle to a manifest store. Dropping the last handle stops the
/// trim ticker and lets the actor drain its queue and exit.
#[derive(Clone)]
pub struct ManifestStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    tx: mpsc::Sender<StoreOp>,
    cancel: CancellationToken,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl ManifestStore {
    /// Open (or create) the store at `config.root` and start its actor.
    ///
    /// Only directory creation can fail here; a manifest database that cannot
    /// open keeps the actor alive, and every operation retries the open and
    /// answers `Unavailable` until it succeeds.
    pub fn open(config: StoreConfig, trim_observer: Option<TrimObserver>) -> Result<Self, StoreError> {
        std::fs::create_dir_all(config.data_dir())?;
        write_cachedir_tag(&config.root)?;

        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let actor = StoreActor {
            db: None,
            config: config.clone(),
            trim_observer,
        };
        std::thread::Builder::new()
            .name("manifest-store".into())
            .spawn(move || actor.run(rx))?;

        if let Some(interval) = config.auto_trim_interval.filter(|d| !d.is_zero()) {
            spawn_trim_ticker(tx.clone(), cancel.clone(), interval);
        }

        Ok(Self {
            inner: Arc::new(StoreInner { tx, cancel }),
        })
    }

    pub async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreOp::Read { key: key.to_owned(), reply }).await?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    pub async fn write(&self, key: &str, bytes: Bytes, ttl: Option<Duration>) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreOp::Write {
            key: key.to_owned(),
            bytes,
            ttl,
            reply,
        })
        .await?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    pub async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreOp::Remove { key: key.to_owned(), reply }).await?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreOp::Clear { reply }).await?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Probe the manifest for a live record without loading its payload.
    pub async fn contains(&self, key: &str) -> Result<bool, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreOp::Contains { key: key.to_owned(), reply }).await?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Run the trim passes now and wait for them to finish.
    pub async fn trim(&self) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreOp::Trim { reply: Some(reply) }).await?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Current `(record_count, total_bytes)` of the manifest.
    pub async fn stats(&self) -> Result<(u64, u64), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreOp::Stats { reply }).await?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    async fn send(&self, op: StoreOp) -> Result<(), StoreError> {
        self.inner.tx.send(op).await.map_err(|_| StoreError::Closed)
    }
}

fn spawn_trim_ticker(tx: mpsc::Sender<StoreOp>, cancel: CancellationToken, interval: Duration) {
    // outside a runtime (plain sync construction) there is simply no ticker;
    // explicit trim() still works
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        debug!("no async runtime at store open, periodic trim disabled");
        return;
    };
    handle.spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    if tx.send(StoreOp::Trim { reply: None }).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// `CACHEDIR.TAG` marks the tree as regenerable cache data so that backup and
/// archival tooling honoring the tag skips it.
fn write_cachedir_tag(root: &Path) -> std::io::Result<()> {
    let path = root.join(CACHEDIR_TAG);
    if path.exists() {
        return Ok(());
    }
    std::fs::write(
        path,
        "Signature: 8a477f597d28d172789f06886806bc55\n# This directory contains cache data.\n",
    )
}

struct StoreActor {
    db: Option<ManifestDb>,
    config: StoreConfig,
    trim_observer: Option<TrimObserver>,
}

impl StoreActor {
    fn run(mut self, mut rx: mpsc::Receiver<StoreOp>) {
        while let Some(op) = rx.blocking_recv() {
            // replies may race caller cancellation; a dropped receiver is fine
            match op {
                StoreOp::Read { key, reply } => {
                    let _ = reply.send(self.read(&key));
                },
                StoreOp::Write { key, bytes, ttl, reply } => {
                    let _ = reply.send(self.write(&key, &bytes, ttl));
                },
                StoreOp::Remove { key, reply } => {
                    let _ = reply.send(self.remove(&key));
                },
                StoreOp::Clear { reply } => {
                    let _ = reply.send(self.clear());
                },
                StoreOp::Contains { key, reply } => {
                    let _ = reply.send(self.contains(&key));
                },
                StoreOp::Trim { reply } => {
                    let result = self.trim();
                    if let Err(e) = &result {
                        // retried on the next scheduled pass
                        warn!("manifest trim failed: {e}");
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                },
                StoreOp::Stats { reply } => {
                    let _ = reply.send(self.stats());
                },
            }
        }
        debug!("manifest store actor exiting");
    }

    /// Open the manifest lazily, retrying on every operation after a failure.
    fn ensure_db(&mut self) -> Result<&ManifestDb, StoreError> {
        if self.db.is_none() {
            match ManifestDb::open(&self.config.root.join(MANIFEST_FILE)) {
                Ok(db) => self.db = Some(db),
                Err(e) => {
                    warn!("manifest open failed: {e}");
                    return Err(StoreError::unavailable(e));
                },
            }
        }
        Ok(self.db.as_ref().expect("just initialized"))
    }

    fn read(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let data_dir = self.config.data_dir();
        let db = self.ensure_db()?;
        let Some(row) = db.lookup(key)? else {
            return Ok(None);
        };

        let now = now_secs();
        if row.expire_at.is_some_and(|t| t <= now) {
            remove_record(db, &data_dir, key, row.filename.as_deref())?;
            return Ok(None);
        }

        let bytes = match (row.inline_value, row.filename) {
            (Some(inline), _) => inline,
            (None, Some(filename)) => match sidecar::read(&data_dir.join(&filename))? {
                Some(bytes) => bytes,
                None => {
                    // the sidecar vanished underneath us; discard the orphan row
                    warn!("sidecar missing for key, dropping record");
                    db.delete(key)?;
                    return Ok(None);
                },
            },
            (None, None) => {
                // a record must hold exactly one of inline blob or filename
                db.delete(key)?;
                return Ok(None);
            },
        };

        // inside the actor turn, so trimming observes the refreshed time
        db.touch(key, now)?;
        Ok(Some(bytes))
    }

    fn write(&mut self, key: &str, bytes: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        let data_dir = self.config.data_dir();
        let inline = match self.config.storage_mode {
            StorageMode::Inline => true,
            StorageMode::File => false,
            StorageMode::Mixed => bytes.len() as u64 <= self.config.inline_threshold,
        };

        let db = self.ensure_db()?;
        let now = now_secs();
        let expire_at = ttl.map(|d| now + d.as_secs_f64());

        if inline {
            let previous_sidecar = db.lookup_filename(key)?;
            db.upsert_inline(key, bytes, now, expire_at)?;
            // the replaced record may have owned a sidecar; drop it now that
            // the row points inline
            if let Some(filename) = previous_sidecar {
                if let Err(e) = sidecar::remove(&data_dir.join(&filename)) {
                    warn!("failed to remove replaced sidecar {filename}: {e}");
                }
            }
        } else {
            let filename = sidecar::file_name(key);
            // an I/O failure here leaves the manifest row uncommitted
            sidecar::write(&data_dir, &filename, bytes)?;
            db.upsert_sidecar(key, &filename, bytes.len() as u64, now, expire_at)?;
        }

        if let Err(e) = self.trim() {
            warn!("post-write trim failed: {e}");
        }
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        let data_dir = self.config.data_dir();
        let db = self.ensure_db()?;
        let filename = db.lookup_filename(key)?;
        remove_record(db, &data_dir, key, filename.as_deref())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        let data_dir = self.config.data_dir();
        let db = self.ensure_db()?;
        db.delete_all()?;
        if let Err(e) = std::fs::remove_dir_all(&data_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        std::fs::create_dir_all(&data_dir)?;
        db.vacuum()?;
        Ok(())
    }

    fn contains(&mut self, key: &str) -> Result<bool, StoreError> {
        let data_dir = self.config.data_dir();
        let db = self.ensure_db()?;
        match db.lookup_meta(key)? {
            None => Ok(false),
            Some(expire_at) => {
                if expire_at.is_some_and(|t| t <= now_secs()) {
                    let filename = db.lookup_filename(key)?;
                    remove_record(db, &data_dir, key, filename.as_deref())?;
                    Ok(false)
                } else {
                    Ok(true)
                }
            },
        }
    }

    fn stats(&mut self) -> Result<(u64, u64), StoreError> {
        let db = self.ensure_db()?;
        Ok((db.count()?, db.total_size()?))
    }

    /// The four trim passes, in order: TTL, age, count, byte budget. Each pass
    /// reports what it deleted through the trim observer.
    fn trim(&mut self) -> Result<(), StoreError> {
        let data_dir = self.config.data_dir();
        let config = self.config.clone();
        let observer = self.trim_observer.clone();
        let db = self.ensure_db()?;

        let now = now_secs();

        let expired = db.expired_batch(now, TTL_PASS_LIMIT)?;
        report_pass(&observer, delete_records(db, &data_dir, &expired)?);

        if let Some(age_limit) = config.age_limit {
            let aged = db.aged_batch(now - age_limit.as_secs_f64(), AGE_PASS_LIMIT)?;
            report_pass(&observer, delete_records(db, &data_dir, &aged)?);
        }

        let count = db.count()?;
        if count > config.count_limit {
            let overflow = db.oldest_batch(count - config.count_limit)?;
            report_pass(&observer, delete_records(db, &data_dir, &overflow)?);
        }

        let total = db.total_size()?;
        if total > config.byte_limit {
            let oversize = db.oldest_until(total - config.byte_limit)?;
            report_pass(&observer, delete_records(db, &data_dir, &oversize)?);
        }

        Ok(())
    }
}

fn report_pass(observer: &Option<TrimObserver>, (deleted_count, deleted_bytes): (u64, u64)) {
    if deleted_count > 0 {
        debug!("trim pass deleted {deleted_count} records, {deleted_bytes} bytes");
        if let Some(observer) = observer {
            observer(deleted_count, deleted_bytes);
        }
    }
}

/// Deletions always remove both sidecar file and row.
fn delete_records(
    db: &ManifestDb,
    data_dir: &Path,
    doomed: &[DoomedRecord],
) -> Result<(u64, u64), StoreError> {
    let mut deleted_bytes = 0;
    for record in doomed {
        remove_record(db, data_dir, &record.key, record.filename.as_deref())?;
        deleted_bytes += record.size;
    }
    Ok((doomed.len() as u64, deleted_bytes))
}

fn remove_record(
    db: &ManifestDb,
    data_dir: &Path,
    key: &str,
    filename: Option<&str>,
) -> Result<(), StoreError> {
    if let Some(filename) = filename {
        // best effort, ENOENT is not an error
        if let Err(e) = sidecar::remove(&data_dir.join(filename)) {
            warn!("failed to remove sidecar {filename}: {e}");
        }
    }
    db.delete(key)?;
    Ok(())
}
