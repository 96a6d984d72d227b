use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::debug;

/// The shared work for a flight died without producing a value (runtime
/// shutdown or a panic in the work). Reported only to the affected callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FlightAborted;

type Waiters<T> = Vec<oneshot::Sender<T>>;

/// Deduplicates concurrent fetches per key: the first caller for a key spawns
/// the work as a detached task, every concurrent caller for the same key
/// awaits the same broadcast result, and the work runs exactly once per
/// contention group.
///
/// Because the work runs in its own task, cancelling an individual caller
/// only abandons that caller's await; the shared fetch continues and its side
/// effects (memory population) still land.
pub(crate) struct SingleFlight<T> {
    inflight: Arc<Mutex<HashMap<String, Waiters<T>>>>,
}

impl<T> Clone for SingleFlight<T> {
    fn clone(&self) -> Self {
        Self {
            inflight: self.inflight.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Join the in-flight computation for `key`, starting it with `work` if
    /// none is running.
    pub async fn run<Fut>(&self, key: &str, work: Fut) -> Result<T, FlightAborted>
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let is_leader = {
            let mut inflight = self.inflight.lock().map_err(|_| FlightAborted)?;
            match inflight.get_mut(key) {
                Some(waiters) => {
                    waiters.push(tx);
                    false
                },
                None => {
                    inflight.insert(key.to_owned(), vec![tx]);
                    true
                },
            }
        };

        if is_leader {
            let inflight = self.inflight.clone();
            let key = key.to_owned();
            tokio::spawn(async move {
                // dropping the guard on any exit path (value produced or work
                // panicked) clears the entry; pending waiters then observe a
                // closed channel rather than hanging on a dead flight
                let mut guard = FlightGuard {
                    inflight,
                    key: key.clone(),
                    armed: true,
                };
                let value = work.await;
                let waiters = guard.take();
                for tx in waiters {
                    // a waiter may have been cancelled; that is its problem alone
                    let _ = tx.send(value.clone());
                }
            });
        }

        rx.await.map_err(|_| {
            debug!("single-flight work dropped before broadcasting its result");
            FlightAborted
        })
    }
}

struct FlightGuard<T> {
    inflight: Arc<Mutex<HashMap<String, Waiters<T>>>>,
    key: String,
    armed: bool,
}

impl<T> FlightGuard<T> {
    /// Remove the flight entry and hand back its waiters for the broadcast.
    fn take(&mut self) -> Waiters<T> {
        self.armed = false;
        match self.inflight.lock() {
            Ok(mut inflight) => inflight.remove(&self.key).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }
}

impl<T> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        // only clean up flights that never reached their broadcast; a second
        // removal here could tear down an unrelated successor flight
        if !self.armed {
            return;
        }
        if let Ok(mut inflight) = self.inflight.lock() {
            inflight.remove(&self.key);
        }
    }
}
