use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::residency::ResidencyState;

/// Logical identity of a GPU texture.
///
/// `group` separates texture families (atlas pages vs. per-item full-res
/// upgrades); `name` identifies the texture within its family.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TextureKey {
    pub group: String,
    pub name: String,
}

impl TextureKey {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }
}

/// Opaque handle to a GPU texture owned by the embedder.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionPolicy {
    Lru,
    Fifo,
    Lfu,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheBudget {
    /// Maximum number of resident textures.
    pub max_entries: usize,
    /// Maximum estimated GPU byte footprint.
    pub max_bytes: usize,
}

impl CacheBudget {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            max_entries,
            max_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    BudgetExceeded { requested: usize, max: usize },
    NoEvictableEntries,
    UnknownKey,
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::BudgetExceeded { requested, max } => {
                write!(
                    f,
                    "texture too large for budget: requested={requested} max={max}"
                )
            }
            CacheError::NoEvictableEntries => write!(f, "no evictable entries (all referenced?)"),
            CacheError::UnknownKey => write!(f, "unknown texture key"),
        }
    }
}

impl std::error::Error for CacheError {}

#[derive(Debug, Clone)]
struct CacheEntry {
    state: ResidencyState,
    handle: Option<TextureHandle>,
    bytes: usize,
    ref_count: u32,
    last_used_tick: u64,
    insert_order: u64,
    use_count: u64,
}

/// Outcome of a coalescing texture request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Already resident; the handle was returned and recency bumped.
    Resident(TextureHandle),
    /// A load for this key is already in flight; no new load was started.
    InFlight,
    /// The caller's loader was invoked to start a fresh load.
    Started,
}

/// Bounded, reference-counted cache over GPU textures.
///
/// Notes on determinism:
/// - Entries are keyed in a `BTreeMap` for stable traversal order.
/// - Every eviction policy tie-breaks on key ordering, so victim selection
///   is reproducible across runs.
///
/// The cache never owns GPU objects. It returns evicted keys so the owner
/// can route disposal through the resource registry.
#[derive(Debug)]
pub struct TextureCache {
    policy: EvictionPolicy,
    budget: CacheBudget,
    used_bytes: usize,
    tick: u64,
    insert_counter: u64,
    entries: BTreeMap<TextureKey, CacheEntry>,
}

impl TextureCache {
    pub fn new(budget: CacheBudget, policy: EvictionPolicy) -> Self {
        Self {
            policy,
            budget,
            used_bytes: 0,
            tick: 0,
            insert_counter: 0,
            entries: BTreeMap::new(),
        }
    }

    pub fn budget(&self) -> CacheBudget {
        self.budget
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    /// Number of resident textures.
    pub fn resident_len(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.state == ResidencyState::Resident)
            .count()
    }

    pub fn state(&self, key: &TextureKey) -> Option<ResidencyState> {
        self.entries.get(key).map(|e| e.state)
    }

    /// Returns the resident handle and bumps recency, or `None`.
    pub fn get(&mut self, key: &TextureKey) -> Option<TextureHandle> {
        self.tick += 1;
        let entry = self.entries.get_mut(key)?;
        if entry.state != ResidencyState::Resident {
            return None;
        }
        entry.last_used_tick = self.tick;
        entry.use_count += 1;
        entry.handle
    }

    /// Coalescing request: invokes `start_load` at most once per in-flight
    /// key. Concurrent requests for the same key share the single load.
    pub fn request(&mut self, key: TextureKey, start_load: impl FnOnce()) -> RequestOutcome {
        self.tick += 1;
        if let Some(entry) = self.entries.get_mut(&key) {
            match entry.state {
                ResidencyState::Resident => {
                    entry.last_used_tick = self.tick;
                    entry.use_count += 1;
                    if let Some(handle) = entry.handle {
                        return RequestOutcome::Resident(handle);
                    }
                }
                ResidencyState::Requested | ResidencyState::Fetching => {
                    return RequestOutcome::InFlight;
                }
                ResidencyState::Failed | ResidencyState::Evicted => {}
            }
        }

        let tick = self.tick;
        let insert_order = self.insert_counter;
        self.insert_counter += 1;
        self.entries.insert(
            key,
            CacheEntry {
                state: ResidencyState::Fetching,
                handle: None,
                bytes: 0,
                ref_count: 0,
                last_used_tick: tick,
                insert_order,
                use_count: 0,
            },
        );
        start_load();
        RequestOutcome::Started
    }

    /// Resolves an in-flight load, evicting as needed to honor both
    /// budgets. Returns the evicted keys so the caller can dispose their
    /// GPU textures.
    pub fn complete(
        &mut self,
        key: &TextureKey,
        handle: TextureHandle,
        bytes: usize,
    ) -> Result<Vec<TextureKey>, CacheError> {
        if bytes > self.budget.max_bytes {
            // A single allocation that can never fit fails up front; the
            // entry stays non-resident.
            if let Some(entry) = self.entries.get_mut(key) {
                entry.state = ResidencyState::Failed;
            }
            return Err(CacheError::BudgetExceeded {
                requested: bytes,
                max: self.budget.max_bytes,
            });
        }

        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(key).ok_or(CacheError::UnknownKey)?;

        if entry.state == ResidencyState::Resident {
            self.used_bytes = self.used_bytes.saturating_sub(entry.bytes);
        }
        entry.state = ResidencyState::Resident;
        entry.handle = Some(handle);
        entry.bytes = bytes;
        entry.last_used_tick = tick;
        self.used_bytes += bytes;

        self.evict_as_needed(Some(key))
    }

    pub fn fail(&mut self, key: &TextureKey) -> Result<(), CacheError> {
        let entry = self.entries.get_mut(key).ok_or(CacheError::UnknownKey)?;
        entry.state = ResidencyState::Failed;
        entry.handle = None;
        Ok(())
    }

    /// Pins an entry against eviction for the duration of a frame or an
    /// active reference.
    pub fn add_ref(&mut self, key: &TextureKey) -> Result<(), CacheError> {
        let entry = self.entries.get_mut(key).ok_or(CacheError::UnknownKey)?;
        entry.ref_count = entry.ref_count.saturating_add(1);
        Ok(())
    }

    pub fn release(&mut self, key: &TextureKey) -> Result<(), CacheError> {
        let entry = self.entries.get_mut(key).ok_or(CacheError::UnknownKey)?;
        entry.ref_count = entry.ref_count.saturating_sub(1);
        Ok(())
    }

    /// Evicts everything unconditionally (item-set replacement, teardown).
    /// Returns the keys that held GPU textures.
    pub fn clear(&mut self) -> Vec<TextureKey> {
        let had_textures: Vec<TextureKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.handle.is_some())
            .map(|(k, _)| k.clone())
            .collect();
        self.entries.clear();
        self.used_bytes = 0;
        had_textures
    }

    fn over_budget(&self) -> bool {
        self.used_bytes > self.budget.max_bytes || self.resident_len() > self.budget.max_entries
    }

    fn evict(&mut self, key: &TextureKey) -> Result<(), CacheError> {
        let entry = self.entries.get_mut(key).ok_or(CacheError::UnknownKey)?;
        if entry.state == ResidencyState::Resident {
            self.used_bytes = self.used_bytes.saturating_sub(entry.bytes);
        }
        entry.bytes = 0;
        entry.handle = None;
        entry.state = ResidencyState::Evicted;
        Ok(())
    }

    fn pick_victim(&self, exclude: Option<&TextureKey>) -> Option<TextureKey> {
        let candidates = self.entries.iter().filter(|(k, e)| {
            e.state == ResidencyState::Resident
                && e.ref_count == 0
                && exclude.map(|p| p != *k).unwrap_or(true)
        });

        let best = match self.policy {
            EvictionPolicy::Lru => candidates.min_by(|(ka, ea), (kb, eb)| {
                ea.last_used_tick
                    .cmp(&eb.last_used_tick)
                    .then_with(|| ka.cmp(kb))
            }),
            EvictionPolicy::Fifo => candidates.min_by(|(ka, ea), (kb, eb)| {
                ea.insert_order
                    .cmp(&eb.insert_order)
                    .then_with(|| ka.cmp(kb))
            }),
            EvictionPolicy::Lfu => candidates.min_by(|(ka, ea), (kb, eb)| {
                ea.use_count
                    .cmp(&eb.use_count)
                    .then_with(|| ea.last_used_tick.cmp(&eb.last_used_tick))
                    .then_with(|| ka.cmp(kb))
            }),
        };

        best.map(|(k, _)| k.clone())
    }

    /// Evicts until both budgets hold.
    ///
    /// The just-completed entry is evicted only as a last resort; if even
    /// that cannot restore the budget (everything referenced), the
    /// allocation fails rather than silently exceeding the limits.
    fn evict_as_needed(
        &mut self,
        protected: Option<&TextureKey>,
    ) -> Result<Vec<TextureKey>, CacheError> {
        let mut evicted: Vec<TextureKey> = Vec::new();
        while self.over_budget() {
            let candidate = self
                .pick_victim(protected)
                .or_else(|| self.pick_victim(None));

            let Some(key) = candidate else {
                return Err(CacheError::NoEvictableEntries);
            };

            let failed_allocation = protected == Some(&key);
            self.evict(&key)?;
            evicted.push(key);
            if failed_allocation {
                // The new entry itself was the only evictable one: the
                // budget is honored but the allocation did not stick.
                return Err(CacheError::NoEvictableEntries);
            }
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CacheBudget, CacheError, EvictionPolicy, RequestOutcome, TextureCache, TextureHandle,
        TextureKey,
    };
    use crate::residency::ResidencyState;

    fn cache(max_entries: usize, max_bytes: usize, policy: EvictionPolicy) -> TextureCache {
        TextureCache::new(CacheBudget::new(max_entries, max_bytes), policy)
    }

    fn key(name: &str) -> TextureKey {
        TextureKey::new("atlas", name)
    }

    #[test]
    fn concurrent_requests_invoke_the_loader_once() {
        let mut c = cache(8, 1024, EvictionPolicy::Lru);
        let mut loader_calls = 0;

        let first = c.request(key("a"), || loader_calls += 1);
        let second = c.request(key("a"), || loader_calls += 1);

        assert_eq!(first, RequestOutcome::Started);
        assert_eq!(second, RequestOutcome::InFlight);
        assert_eq!(loader_calls, 1);

        c.complete(&key("a"), TextureHandle(7), 16).unwrap();
        let third = c.request(key("a"), || loader_calls += 1);
        assert_eq!(third, RequestOutcome::Resident(TextureHandle(7)));
        assert_eq!(loader_calls, 1);
    }

    #[test]
    fn lru_evicts_the_least_recently_used() {
        let mut c = cache(8, 10, EvictionPolicy::Lru);
        c.request(key("a"), || {});
        c.complete(&key("a"), TextureHandle(1), 6).unwrap();
        c.request(key("b"), || {});
        let evicted = c.complete(&key("b"), TextureHandle(2), 6).unwrap();

        assert_eq!(evicted, vec![key("a")]);
        assert_eq!(c.state(&key("a")), Some(ResidencyState::Evicted));
        assert_eq!(c.state(&key("b")), Some(ResidencyState::Resident));
        assert!(c.used_bytes() <= c.budget().max_bytes);
    }

    #[test]
    fn recency_bump_protects_an_entry_under_lru() {
        let mut c = cache(2, 1024, EvictionPolicy::Lru);
        c.request(key("a"), || {});
        c.complete(&key("a"), TextureHandle(1), 1).unwrap();
        c.request(key("b"), || {});
        c.complete(&key("b"), TextureHandle(2), 1).unwrap();

        // Touch "a" so "b" becomes the LRU victim.
        assert_eq!(c.get(&key("a")), Some(TextureHandle(1)));

        c.request(key("c"), || {});
        let evicted = c.complete(&key("c"), TextureHandle(3), 1).unwrap();
        assert_eq!(evicted, vec![key("b")]);
    }

    #[test]
    fn fifo_evicts_the_oldest_insertion_regardless_of_use() {
        let mut c = cache(2, 1024, EvictionPolicy::Fifo);
        c.request(key("a"), || {});
        c.complete(&key("a"), TextureHandle(1), 1).unwrap();
        c.request(key("b"), || {});
        c.complete(&key("b"), TextureHandle(2), 1).unwrap();

        // Heavy use of "a" must not save it under FIFO.
        for _ in 0..10 {
            c.get(&key("a"));
        }

        c.request(key("c"), || {});
        let evicted = c.complete(&key("c"), TextureHandle(3), 1).unwrap();
        assert_eq!(evicted, vec![key("a")]);
    }

    #[test]
    fn lfu_evicts_the_least_frequently_used() {
        let mut c = cache(2, 1024, EvictionPolicy::Lfu);
        c.request(key("a"), || {});
        c.complete(&key("a"), TextureHandle(1), 1).unwrap();
        c.request(key("b"), || {});
        c.complete(&key("b"), TextureHandle(2), 1).unwrap();

        // "a" is used often, "b" only via its initial request.
        for _ in 0..5 {
            c.get(&key("a"));
        }
        // Make "b" more recently used than "a": LFU must still pick "b".
        c.get(&key("b"));

        c.request(key("c"), || {});
        let evicted = c.complete(&key("c"), TextureHandle(3), 1).unwrap();
        assert_eq!(evicted, vec![key("b")]);
    }

    #[test]
    fn referenced_entries_are_never_evicted() {
        let mut c = cache(8, 10, EvictionPolicy::Lru);
        c.request(key("a"), || {});
        c.complete(&key("a"), TextureHandle(1), 6).unwrap();
        c.add_ref(&key("a")).unwrap();

        c.request(key("b"), || {});
        let err = c.complete(&key("b"), TextureHandle(2), 6).unwrap_err();

        // With "a" pinned, the only evictable entry was "b" itself: the
        // allocation fails and the budget still holds.
        assert_eq!(err, CacheError::NoEvictableEntries);
        assert_eq!(c.state(&key("a")), Some(ResidencyState::Resident));
        assert!(c.used_bytes() <= c.budget().max_bytes);

        // Releasing the pin makes "a" evictable again.
        c.release(&key("a")).unwrap();
        c.request(key("c"), || {});
        let evicted = c.complete(&key("c"), TextureHandle(3), 6).unwrap();
        assert_eq!(evicted, vec![key("a")]);
    }

    #[test]
    fn oversized_allocation_fails_up_front() {
        let mut c = cache(8, 10, EvictionPolicy::Lru);
        c.request(key("big"), || {});
        let err = c.complete(&key("big"), TextureHandle(1), 11).unwrap_err();
        assert_eq!(
            err,
            CacheError::BudgetExceeded {
                requested: 11,
                max: 10
            }
        );
        assert_eq!(c.state(&key("big")), Some(ResidencyState::Failed));
        assert_eq!(c.used_bytes(), 0);
    }

    #[test]
    fn entry_count_budget_is_enforced_independently() {
        let mut c = cache(1, 1024, EvictionPolicy::Lru);
        c.request(key("a"), || {});
        c.complete(&key("a"), TextureHandle(1), 1).unwrap();
        c.request(key("b"), || {});
        let evicted = c.complete(&key("b"), TextureHandle(2), 1).unwrap();
        assert_eq!(evicted, vec![key("a")]);
        assert_eq!(c.resident_len(), 1);
    }

    #[test]
    fn clear_reports_every_key_with_a_texture() {
        let mut c = cache(8, 1024, EvictionPolicy::Lru);
        c.request(key("a"), || {});
        c.complete(&key("a"), TextureHandle(1), 1).unwrap();
        c.request(key("pending"), || {});

        let disposed = c.clear();
        assert_eq!(disposed, vec![key("a")]);
        assert_eq!(c.resident_len(), 0);
        assert_eq!(c.used_bytes(), 0);
    }

    #[test]
    fn failed_entries_can_be_rerequested() {
        let mut c = cache(8, 1024, EvictionPolicy::Lru);
        let mut calls = 0;
        c.request(key("a"), || calls += 1);
        c.fail(&key("a")).unwrap();
        let outcome = c.request(key("a"), || calls += 1);
        assert_eq!(outcome, RequestOutcome::Started);
        assert_eq!(calls, 2);
    }
}
