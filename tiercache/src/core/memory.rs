use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use super::types::MemoryConfig;

/// Contract for the volatile tier placed in front of the disk engine.
///
/// Implementations evict under their own limits without notifying the
/// coordinator, and must be safe to call from any thread.
pub trait MemoryTier<V>: Send + Sync {
    fn get(&self, key: &str) -> Option<V>;
    fn set(&self, key: &str, value: V, cost: u64);
    fn remove(&self, key: &str);
    fn remove_all(&self);
}

/// Cost- and count-bounded in-memory LRU
pub struct MemoryCache<V> {
    state: Mutex<LruState<V>>,
}

struct LruState<V> {
    /// Cached values
    data: HashMap<String, MemoryEntry<V>>,

    /// Recency order, oldest tick first
    order: BTreeMap<u64, String>,

    /// Last issued recency tick
    tick: u64,

    total_cost: u64,
    cost_limit: u64,
    count_limit: usize,
    stats: MemoryStats,
}

struct MemoryEntry<V> {
    value: V,
    cost: u64,
    tick: u64,
}

/// Memory tier statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub total_cost: u64,
}

impl<V: Clone> MemoryCache<V> {
    /// Create a cache bounded by total cost and entry count (0 = unlimited)
    pub fn new(cost_limit: u64, count_limit: usize) -> Self {
        Self {
            state: Mutex::new(LruState {
                data: HashMap::new(),
                order: BTreeMap::new(),
                tick: 0,
                total_cost: 0,
                cost_limit,
                count_limit,
                stats: MemoryStats::default(),
            }),
        }
    }

    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::new(config.cost_limit, config.count_limit)
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_cost(&self) -> u64 {
        self.state.lock().total_cost
    }

    pub fn stats(&self) -> MemoryStats {
        let state = self.state.lock();
        MemoryStats {
            entries: state.data.len(),
            total_cost: state.total_cost,
            ..state.stats.clone()
        }
    }
}

impl<V> LruState<V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn detach(&mut self, key: &str) -> Option<MemoryEntry<V>> {
        let entry = self.data.remove(key)?;
        self.order.remove(&entry.tick);
        self.total_cost = self.total_cost.saturating_sub(entry.cost);
        Some(entry)
    }

    fn over_limits(&self) -> bool {
        (self.count_limit > 0 && self.data.len() > self.count_limit)
            || (self.cost_limit > 0 && self.total_cost > self.cost_limit)
    }

    fn evict_to_limits(&mut self) {
        while self.over_limits() {
            let Some((_, key)) = self.order.pop_first() else {
                break;
            };
            if let Some(evicted) = self.data.remove(&key) {
                self.total_cost = self.total_cost.saturating_sub(evicted.cost);
                self.stats.evictions += 1;
                debug!(key = %key, cost = evicted.cost, "Memory tier EVICT");
            }
        }
    }
}

impl<V: Clone + Send> MemoryTier<V> for MemoryCache<V> {
    fn get(&self, key: &str) -> Option<V> {
        let mut state = self.state.lock();
        let tick = state.next_tick();
        let LruState {
            data, order, stats, ..
        } = &mut *state;

        match data.get_mut(key) {
            Some(entry) => {
                order.remove(&entry.tick);
                entry.tick = tick;
                order.insert(tick, key.to_string());
                stats.hits += 1;
                Some(entry.value.clone())
            }
            None => {
                stats.misses += 1;
                None
            }
        }
    }

    fn set(&self, key: &str, value: V, cost: u64) {
        let mut state = self.state.lock();
        state.detach(key);

        if state.cost_limit > 0 && cost > state.cost_limit {
            debug!(key = %key, cost, limit = state.cost_limit, "Memory tier SKIP: cost exceeds limit");
            return;
        }

        let tick = state.next_tick();
        state.data.insert(key.to_string(), MemoryEntry { value, cost, tick });
        state.order.insert(tick, key.to_string());
        state.total_cost += cost;
        state.evict_to_limits();
    }

    fn remove(&self, key: &str) {
        self.state.lock().detach(key);
    }

    fn remove_all(&self) {
        let mut state = self.state.lock();
        let count = state.data.len();
        state.data.clear();
        state.order.clear();
        state.total_cost = 0;
        debug!(count, "Memory tier INVALIDATE ALL");
    }
}
