use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

/// Default quiet period a key must hold before its pending write is performed.
pub(crate) const DEFAULT_SILENCE_WINDOW: Duration = Duration::from_millis(100);

/// The payload a debounced write carries to the disk tier.
#[derive(Clone)]
pub(crate) struct WritePayload {
    pub bytes: Bytes,
    pub ttl: Option<Duration>,
}

type PerformFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub(crate) type PerformFn = Arc<dyn Fn(String, WritePayload) -> PerformFuture + Send + Sync>;

/// Per-key pending state. An entry exists in the map iff a runner task is
/// active for that key.
struct Slot {
    latest: Option<WritePayload>,
    cancelled: bool,
}

/// Collapses bursts of writes per key into the last submitted payload.
///
/// `submit` returns immediately after storing the payload; a per-key runner
/// task waits out a silence window (restarting it whenever a newer payload
/// lands), performs the write with whatever payload is current, then loops to
/// catch submissions that arrived mid-write. For any key the final perform of
/// a burst always carries the most recent payload.
pub(crate) struct WriteCoalescer {
    pending: Arc<Mutex<HashMap<String, Slot>>>,
    silence_window: Duration,
    perform: PerformFn,
}

impl WriteCoalescer {
    pub fn new(silence_window: Duration, perform: PerformFn) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            silence_window,
            perform,
        }
    }

    pub fn submit(&self, key: &str, payload: WritePayload) {
        let spawn_runner = {
            let Ok(mut pending) = self.pending.lock() else {
                return;
            };
            match pending.get_mut(key) {
                Some(slot) => {
                    // the active runner will observe the replacement
                    slot.latest = Some(payload);
                    slot.cancelled = false;
                    false
                },
                None => {
                    pending.insert(
                        key.to_owned(),
                        Slot {
                            latest: Some(payload),
                            cancelled: false,
                        },
                    );
                    true
                },
            }
        };

        if spawn_runner {
            let pending = self.pending.clone();
            let perform = self.perform.clone();
            let silence_window = self.silence_window;
            let key = key.to_owned();
            tokio::spawn(run_key(pending, perform, silence_window, key));
        }
    }

    /// Drop any not-yet-performed payload for `key` and flag the runner so an
    /// already-captured payload is discarded instead of written.
    pub fn cancel(&self, key: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(slot) = pending.get_mut(key) {
                slot.latest = None;
                slot.cancelled = true;
            }
        }
    }

    pub fn cancel_all(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            for slot in pending.values_mut() {
                slot.latest = None;
                slot.cancelled = true;
            }
        }
    }
}

async fn run_key(
    pending: Arc<Mutex<HashMap<String, Slot>>>,
    perform: PerformFn,
    silence_window: Duration,
    key: String,
) {
    loop {
        // take the pending payload; an empty slot ends the runner and removes
        // the entry in the same critical section submit uses to detect it
        let Some(mut taken) = take_latest(&pending, &key) else {
            break;
        };

        // hold the silence window, restarting while newer payloads land
        loop {
            tokio::time::sleep(silence_window).await;
            match replace_latest(&pending, &key) {
                Some(newer) => taken = newer,
                None => break,
            }
        }

        if is_cancelled(&pending, &key) {
            // key was removed while we debounced; the captured payload must
            // not resurrect it
            debug!("discarding coalesced write for removed key");
            continue;
        }

        perform(key.clone(), taken).await;
    }
}

fn take_latest(pending: &Mutex<HashMap<String, Slot>>, key: &str) -> Option<WritePayload> {
    let Ok(mut pending) = pending.lock() else {
        return None;
    };
    let Some(slot) = pending.get_mut(key) else {
        return None;
    };
    match slot.latest.take() {
        Some(payload) => Some(payload),
        None => {
            pending.remove(key);
            None
        },
    }
}

fn replace_latest(pending: &Mutex<HashMap<String, Slot>>, key: &str) -> Option<WritePayload> {
    let mut pending = pending.lock().ok()?;
    pending.get_mut(key)?.latest.take()
}

fn is_cancelled(pending: &Mutex<HashMap<String, Slot>>, key: &str) -> bool {
    match pending.lock() {
        Ok(mut pending) => match pending.get_mut(key) {
            Some(slot) => std::mem::replace(&mut slot.cancelled, false),
            None => true,
        },
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use more_asserts::{assert_ge, assert_le};

    use super::*;

    struct Recorder {
        performs: AtomicUsize,
        last_len: AtomicUsize,
        total_bytes: AtomicU64,
    }

    fn recording_coalescer(silence_window: Duration) -> (WriteCoalescer, Arc<Recorder>) {
        let recorder = Arc::new(Recorder {
            performs: AtomicUsize::new(0),
            last_len: AtomicUsize::new(0),
            total_bytes: AtomicU64::new(0),
        });
        let perform: PerformFn = {
            let recorder = recorder.clone();
            Arc::new(move |_key, payload| {
                let recorder = recorder.clone();
                Box::pin(async move {
                    recorder.performs.fetch_add(1, Ordering::SeqCst);
                    recorder.last_len.store(payload.bytes.len(), Ordering::SeqCst);
                    recorder.total_bytes.fetch_add(payload.bytes.len() as u64, Ordering::SeqCst);
                })
            })
        };
        (WriteCoalescer::new(silence_window, perform), recorder)
    }

    fn payload(len: usize) -> WritePayload {
        WritePayload {
            bytes: Bytes::from(vec![0u8; len]),
            ttl: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_burst_collapses_to_last_payload() {
        let (coalescer, recorder) = recording_coalescer(Duration::from_millis(30));
        for i in 1..=20 {
            coalescer.submit("k", payload(i * 10));
        }
        coalescer.submit("k", payload(123));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(recorder.performs.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.last_len.load(Ordering::SeqCst), 123);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spaced_submissions_each_perform() {
        let (coalescer, recorder) = recording_coalescer(Duration::from_millis(10));
        coalescer.submit("k", payload(5));
        tokio::time::sleep(Duration::from_millis(60)).await;
        coalescer.submit("k", payload(7));
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(recorder.performs.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.total_bytes.load(Ordering::SeqCst), 12);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_distinct_keys_run_independently() {
        let (coalescer, recorder) = recording_coalescer(Duration::from_millis(10));
        coalescer.submit("a", payload(1));
        coalescer.submit("b", payload(2));
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(recorder.performs.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.total_bytes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_discards_pending_write() {
        let (coalescer, recorder) = recording_coalescer(Duration::from_millis(30));
        coalescer.submit("k", payload(50));
        coalescer.cancel("k");
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(recorder.performs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_submit_after_cancel_writes_again() {
        let (coalescer, recorder) = recording_coalescer(Duration::from_millis(10));
        coalescer.submit("k", payload(50));
        coalescer.cancel("k");
        coalescer.submit("k", payload(9));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(recorder.performs.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.last_len.load(Ordering::SeqCst), 9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_steady_bursts_bound_performs() {
        let (coalescer, recorder) = recording_coalescer(Duration::from_millis(15));
        // several bursts with quiet gaps: one perform per burst, always the
        // burst's final payload
        for burst in 0..3 {
            for i in 0..5 {
                coalescer.submit("k", payload(burst * 100 + i + 1));
            }
            tokio::time::sleep(Duration::from_millis(60)).await;
        }

        let performs = recorder.performs.load(Ordering::SeqCst);
        assert_ge!(performs, 3);
        assert_le!(performs, 6);
        assert_eq!(recorder.last_len.load(Ordering::SeqCst), 205);
    }
}
