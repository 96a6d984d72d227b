use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::MemoryConfig;

/// Sentinel arena index for "no node".
const NIL: usize = usize::MAX;

struct Node<V> {
    key: String,
    value: V,
    cost: u64,
    expires_at: Option<Instant>,
    last_access: Instant,
    prev: usize,
    next: usize,
}

/// Doubly-linked LRU over arena-allocated nodes addressed by index, with a
/// hash index for O(1) lookup. Head is most recently used.
struct LruState<V> {
    nodes: Vec<Option<Node<V>>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    head: usize,
    tail: usize,
    total_cost: u64,
}

impl<V> LruState<V> {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: NIL,
            tail: NIL,
            total_cost: 0,
        }
    }

    fn node(&self, idx: usize) -> &Node<V> {
        self.nodes[idx].as_ref().expect("indexed node is live")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node<V> {
        self.nodes[idx].as_mut().expect("indexed node is live")
    }

    fn alloc(&mut self, node: Node<V>) -> usize {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.node(idx);
            (node.prev, node.next)
        };
        match prev {
            NIL => self.head = next,
            _ => self.node_mut(prev).next = next,
        }
        match next {
            NIL => self.tail = prev,
            _ => self.node_mut(next).prev = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.node_mut(idx);
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head != NIL {
            self.node_mut(old_head).prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    fn evict(&mut self, idx: usize) {
        self.unlink(idx);
        let node = self.nodes[idx].take().expect("indexed node is live");
        self.free.push(idx);
        self.index.remove(&node.key);
        self.total_cost -= node.cost;
    }

    fn get(&mut self, key: &str, now: Instant) -> Option<&V> {
        let idx = *self.index.get(key)?;
        if self.node(idx).expires_at.is_some_and(|t| t <= now) {
            self.evict(idx);
            return None;
        }
        self.node_mut(idx).last_access = now;
        self.move_to_front(idx);
        Some(&self.node(idx).value)
    }

    fn contains(&mut self, key: &str, now: Instant) -> bool {
        let Some(&idx) = self.index.get(key) else {
            return false;
        };
        if self.node(idx).expires_at.is_some_and(|t| t <= now) {
            self.evict(idx);
            return false;
        }
        true
    }

    fn put(&mut self, key: String, value: V, cost: u64, ttl: Option<Duration>, now: Instant) {
        let expires_at = ttl.map(|d| now + d);
        if let Some(&idx) = self.index.get(&key) {
            let node = self.node_mut(idx);
            let old_cost = node.cost;
            node.value = value;
            node.cost = cost;
            node.expires_at = expires_at;
            node.last_access = now;
            self.total_cost = self.total_cost - old_cost + cost;
            self.move_to_front(idx);
        } else {
            let idx = self.alloc(Node {
                key: key.clone(),
                value,
                cost,
                expires_at,
                last_access: now,
                prev: NIL,
                next: NIL,
            });
            self.index.insert(key, idx);
            self.push_front(idx);
            self.total_cost += cost;
        }
    }

    fn remove(&mut self, key: &str) {
        if let Some(&idx) = self.index.get(key) {
            self.evict(idx);
        }
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.index.clear();
        self.head = NIL;
        self.tail = NIL;
        self.total_cost = 0;
    }

    /// Three passes from the tail (LRU end) forward: age, then count, then
    /// cost. The age pass also sweeps TTL-expired tail entries.
    fn trim(&mut self, config: &MemoryConfig, now: Instant) {
        loop {
            if self.tail == NIL {
                break;
            }
            let node = self.node(self.tail);
            let stale = config
                .age_limit
                .is_some_and(|limit| now.saturating_duration_since(node.last_access) >= limit)
                || node.expires_at.is_some_and(|t| t <= now);
            if !stale {
                break;
            }
            self.evict(self.tail);
        }
        while self.index.len() > config.count_limit && self.tail != NIL {
            self.evict(self.tail);
        }
        while self.total_cost > config.cost_limit && self.tail != NIL {
            self.evict(self.tail);
        }
    }
}

/// The in-process tier: a bounded LRU with per-entry cost, access time, and
/// TTL, plus an optional background trimmer. All operations are total.
pub(crate) struct MemoryTier<V> {
    inner: Arc<MemoryInner<V>>,
}

struct MemoryInner<V> {
    state: Arc<Mutex<LruState<V>>>,
    config: MemoryConfig,
    trim_cancel: CancellationToken,
}

impl<V> Clone for MemoryTier<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> Drop for MemoryInner<V> {
    fn drop(&mut self) {
        self.trim_cancel.cancel();
    }
}

impl<V: Clone + Send + 'static> MemoryTier<V> {
    pub fn new(config: MemoryConfig) -> Self {
        let state = Arc::new(Mutex::new(LruState::new()));
        let trim_cancel = CancellationToken::new();

        if let Some(interval) = config.auto_trim_interval.filter(|d| !d.is_zero()) {
            // the trimmer holds only the state, not the tier, so dropping the
            // last handle cancels it rather than leaking a keep-alive cycle
            spawn_trimmer(state.clone(), config.clone(), trim_cancel.clone(), interval);
        }

        Self {
            inner: Arc::new(MemoryInner {
                state,
                config,
                trim_cancel,
            }),
        }
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        let mut state = self.inner.state.lock().await;
        state.get(key, Instant::now()).cloned()
    }

    pub async fn contains(&self, key: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        state.contains(key, Instant::now())
    }

    pub async fn put(&self, key: String, value: V, cost: u64, ttl: Option<Duration>) {
        let mut state = self.inner.state.lock().await;
        let now = Instant::now();
        state.put(key, value, cost, ttl, now);
        state.trim(&self.inner.config, now);
    }

    pub async fn remove(&self, key: &str) {
        self.inner.state.lock().await.remove(key);
    }

    pub async fn clear(&self) {
        self.inner.state.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.index.len()
    }

    pub async fn total_cost(&self) -> u64 {
        self.inner.state.lock().await.total_cost
    }
}

fn spawn_trimmer<V: Send + 'static>(
    state: Arc<Mutex<LruState<V>>>,
    config: MemoryConfig,
    cancel: CancellationToken,
    interval: Duration,
) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        debug!("no async runtime at cache construction, periodic memory trim disabled");
        return;
    };
    handle.spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    state.lock().await.trim(&config, Instant::now());
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use more_asserts::assert_le;
    use rand::Rng;

    use super::*;

    fn unbounded() -> MemoryConfig {
        MemoryConfig {
            count_limit: usize::MAX,
            cost_limit: u64::MAX,
            age_limit: None,
            auto_trim_interval: None,
        }
    }

    #[tokio::test]
    async fn test_put_get_basic() {
        let tier = MemoryTier::new(unbounded());
        tier.put("answer".into(), 42u32, 1, None).await;
        assert_eq!(tier.get("answer").await, Some(42));
        assert!(tier.contains("answer").await);
        assert_eq!(tier.get("question").await, None);
    }

    #[tokio::test]
    async fn test_lru_discipline() {
        let config = MemoryConfig {
            count_limit: 2,
            ..unbounded()
        };
        let tier = MemoryTier::new(config);
        tier.put("a".into(), 1u32, 0, None).await;
        tier.put("b".into(), 2, 0, None).await;
        // touching "a" makes "b" the LRU victim
        assert_eq!(tier.get("a").await, Some(1));
        tier.put("c".into(), 3, 0, None).await;

        assert!(tier.contains("a").await);
        assert!(!tier.contains("b").await);
        assert!(tier.contains("c").await);
        assert_eq!(tier.len().await, 2);
    }

    #[tokio::test]
    async fn test_cost_trim() {
        let config = MemoryConfig {
            cost_limit: 100,
            ..unbounded()
        };
        let tier = MemoryTier::new(config);
        tier.put("a".into(), (), 50, None).await;
        tier.put("b".into(), (), 50, None).await;
        tier.put("c".into(), (), 50, None).await;

        assert_le!(tier.total_cost().await, 100);
        assert!(!tier.contains("a").await);
        assert!(tier.contains("b").await);
        assert!(tier.contains("c").await);
    }

    #[tokio::test]
    async fn test_replace_adjusts_cost() {
        let tier = MemoryTier::new(unbounded());
        tier.put("k".into(), 1u8, 80, None).await;
        tier.put("k".into(), 2, 10, None).await;
        assert_eq!(tier.total_cost().await, 10);
        assert_eq!(tier.len().await, 1);
        assert_eq!(tier.get("k").await, Some(2));
    }

    #[tokio::test]
    async fn test_ttl_expiry_on_read() {
        let tier = MemoryTier::new(unbounded());
        tier.put("k".into(), 7u8, 1, Some(Duration::from_millis(20))).await;
        assert_eq!(tier.get("k").await, Some(7));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(tier.get("k").await, None);
        assert_eq!(tier.len().await, 0);
        assert_eq!(tier.total_cost().await, 0);
    }

    #[tokio::test]
    async fn test_age_pass_evicts_idle_entries() {
        let config = MemoryConfig {
            age_limit: Some(Duration::from_millis(30)),
            ..unbounded()
        };
        let tier = MemoryTier::new(config);
        tier.put("idle".into(), 1u8, 0, None).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        // trim runs as part of put
        tier.put("fresh".into(), 2, 0, None).await;

        assert!(!tier.contains("idle").await);
        assert!(tier.contains("fresh").await);
    }

    #[tokio::test]
    async fn test_background_trimmer_sweeps_without_access() {
        let config = MemoryConfig {
            auto_trim_interval: Some(Duration::from_millis(20)),
            ..unbounded()
        };
        let tier = MemoryTier::new(config);
        tier.put("k".into(), 1u8, 1, Some(Duration::from_millis(10))).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(tier.len().await, 0);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let tier = MemoryTier::new(unbounded());
        tier.put("a".into(), 1u8, 5, None).await;
        tier.put("b".into(), 2, 5, None).await;

        tier.remove("a").await;
        assert!(!tier.contains("a").await);
        assert_eq!(tier.total_cost().await, 5);

        tier.clear().await;
        assert_eq!(tier.len().await, 0);
        assert_eq!(tier.total_cost().await, 0);
        // removal of an absent key is a no-op
        tier.remove("a").await;
    }

    #[tokio::test]
    async fn test_budgets_hold_after_random_puts() {
        let config = MemoryConfig {
            count_limit: 16,
            cost_limit: 400,
            ..unbounded()
        };
        let tier = MemoryTier::new(config.clone());
        let mut rng = rand::thread_rng();
        for i in 0..500 {
            let key = format!("k{}", rng.gen_range(0..40));
            let cost = rng.gen_range(0..60);
            tier.put(key, i, cost, None).await;
            assert_le!(tier.len().await, config.count_limit);
            assert_le!(tier.total_cost().await, config.cost_limit);
        }
    }
}
