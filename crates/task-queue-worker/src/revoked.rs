//! Worker-local set of revoked task ids.
//!
//! Entries expire after a configurable age but are only dropped when
//! [`RevocationRegistry::purge`] is called; nothing runs in the background.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use task_queue_core::TaskId;

pub const DEFAULT_REVOKES_EXPIRES: Duration = Duration::from_secs(10800);
pub const DEFAULT_REVOKES_MAX: usize = 50000;

/// Monotonic time source
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct Entries<K> {
    by_id: HashMap<K, (Instant, u64)>,
    by_age: BTreeMap<(Instant, u64), K>,
    next_seq: u64,
}

impl<K> Default for Entries<K> {
    fn default() -> Self {
        Entries {
            by_id: HashMap::new(),
            by_age: BTreeMap::new(),
            next_seq: 0,
        }
    }
}

impl<K: Eq + Hash + Clone> Entries<K> {
    fn remove(&mut self, id: &K) -> Option<K> {
        let stamp = self.by_id.remove(id)?;
        self.by_age.remove(&stamp)
    }

    fn pop_oldest(&mut self) -> Option<K> {
        let (_, id) = self.by_age.pop_first()?;
        self.by_id.remove(&id);
        Some(id)
    }
}

/// Time-bounded set of task ids.
///
/// Ids compare with their own type's equality, so an integer id and its
/// string form are different entries.
pub struct RevocationRegistry<K = TaskId> {
    entries: RwLock<Entries<K>>,
    expires: RwLock<Duration>,
    max_entries: Option<usize>,
    clock: Arc<dyn Clock>,
}

impl<K: Eq + Hash + Clone> RevocationRegistry<K> {
    pub fn new(expires: Duration) -> Self {
        Self::with_clock(expires, Arc::new(MonotonicClock))
    }

    pub fn with_clock(expires: Duration, clock: Arc<dyn Clock>) -> Self {
        RevocationRegistry {
            entries: RwLock::new(Entries::default()),
            expires: RwLock::new(expires),
            max_entries: None,
            clock,
        }
    }

    /// Cap the number of entries; inserting beyond it evicts the oldest
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn add(&self, id: K) {
        let now = self.clock.now();
        self.add_at(id, now);
    }

    /// Insert `id` stamped at `now`. Re-adding refreshes the stamp.
    pub fn add_at(&self, id: K, now: Instant) {
        let mut entries = self.entries.write();
        entries.remove(&id);

        let stamp = (now, entries.next_seq);
        entries.next_seq += 1;
        entries.by_id.insert(id.clone(), stamp);
        entries.by_age.insert(stamp, id);

        if let Some(max) = self.max_entries {
            while entries.by_id.len() > max {
                entries.pop_oldest();
            }
        }
    }

    pub fn update(&self, ids: impl IntoIterator<Item = K>) {
        let now = self.clock.now();
        for id in ids {
            self.add_at(id, now);
        }
    }

    pub fn discard(&self, id: &K) {
        self.entries.write().remove(id);
    }

    /// Remove `id`, returning it if it was present
    pub fn pop_value(&self, id: &K) -> Option<K> {
        self.entries.write().remove(id)
    }

    pub fn pop_oldest(&self) -> Option<K> {
        self.entries.write().pop_oldest()
    }

    pub fn clear(&self) {
        let old = std::mem::take(&mut *self.entries.write());
        drop(old);
    }

    pub fn contains(&self, id: &K) -> bool {
        self.entries.read().by_id.contains_key(id)
    }

    pub fn purge(&self) -> usize {
        let now = self.clock.now();
        self.purge_at(now)
    }

    /// Drop every entry older than `expires` at `now`, returning how many went
    pub fn purge_at(&self, now: Instant) -> usize {
        let expires = self.expires();
        let mut entries = self.entries.write();
        let mut removed = 0;

        loop {
            let oldest = entries.by_age.keys().next().map(|&(inserted_at, _)| inserted_at);
            match oldest {
                Some(inserted_at) if now.saturating_duration_since(inserted_at) > expires => {
                    entries.pop_oldest();
                    removed += 1;
                }
                _ => break,
            }
        }

        removed
    }

    pub fn expires(&self) -> Duration {
        *self.expires.read()
    }

    pub fn set_expires(&self, expires: Duration) {
        *self.expires.write() = expires;
    }

    pub fn len(&self) -> usize {
        self.entries.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone> Default for RevocationRegistry<K> {
    fn default() -> Self {
        Self::new(DEFAULT_REVOKES_EXPIRES).with_max_entries(DEFAULT_REVOKES_MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Clock advanced by hand
    struct ManualClock(Mutex<Instant>);

    impl ManualClock {
        fn advance(&self, by: Duration) {
            *self.0.lock() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.0.lock()
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    enum RawId {
        Int(i64),
        Text(String),
    }

    #[test]
    fn test_add_discard() {
        let registry: RevocationRegistry = RevocationRegistry::default();
        let id = TaskId::new("a8f3");

        registry.add(id.clone());
        registry.add(id.clone());
        assert!(registry.contains(&id));
        assert_eq!(registry.len(), 1);

        registry.discard(&id);
        assert!(!registry.contains(&id));

        // absent ids are fine
        registry.discard(&id);
        assert_eq!(registry.pop_value(&id), None);
    }

    #[test]
    fn test_type_sensitive() {
        let registry = RevocationRegistry::new(Duration::from_secs(60));
        registry.add(RawId::Int(123));

        assert!(registry.contains(&RawId::Int(123)));
        assert!(!registry.contains(&RawId::Text("123".to_string())));
    }

    #[test]
    fn test_update_and_clear() {
        let registry = RevocationRegistry::new(Duration::from_secs(60));

        registry.update(Vec::<u32>::new());
        assert!(registry.is_empty());

        registry.update(1..=5u32);
        assert_eq!(registry.len(), 5);

        registry.clear();
        assert!(registry.is_empty());
        assert!(!registry.contains(&3));
    }

    #[test]
    fn test_purge_keeps_younger_entries() {
        let clock = Arc::new(ManualClock(Mutex::new(Instant::now())));
        let registry = RevocationRegistry::with_clock(Duration::from_secs(10), clock.clone());

        registry.add("old");
        clock.advance(Duration::from_secs(6));
        registry.add("young");

        clock.advance(Duration::from_secs(5));
        assert_eq!(registry.purge(), 1);
        assert!(!registry.contains(&"old"));
        assert!(registry.contains(&"young"));

        // exactly at the boundary is not yet expired
        clock.advance(Duration::from_secs(5));
        assert_eq!(registry.purge(), 0);
        clock.advance(Duration::from_secs(1));
        assert_eq!(registry.purge(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_readding_refreshes_timestamp() {
        let start = Instant::now();
        let registry = RevocationRegistry::new(Duration::from_secs(10));

        registry.add_at("a", start);
        registry.add_at("a", start + Duration::from_secs(8));

        assert_eq!(registry.purge_at(start + Duration::from_secs(15)), 0);
        assert!(registry.contains(&"a"));
    }

    #[test]
    fn test_set_expires_at_runtime() {
        let start = Instant::now();
        let registry = RevocationRegistry::new(Duration::from_secs(3600));
        registry.add_at("a", start);

        assert_eq!(registry.purge_at(start + Duration::from_secs(60)), 0);
        registry.set_expires(Duration::from_secs(30));
        assert_eq!(registry.purge_at(start + Duration::from_secs(60)), 1);
    }

    #[test]
    fn test_max_entries_evicts_oldest() {
        let registry = RevocationRegistry::new(Duration::from_secs(60)).with_max_entries(3);
        registry.update(["a", "b", "c", "d"]);

        assert_eq!(registry.len(), 3);
        assert!(!registry.contains(&"a"));
        assert_eq!(registry.pop_oldest(), Some("b"));
    }

    #[test]
    fn test_concurrent_reads_during_mutation() {
        let base = Instant::now();
        let later = base + Duration::from_secs(100);
        let registry = Arc::new(RevocationRegistry::new(Duration::from_secs(60)));
        for i in 10_000..10_100u32 {
            registry.add_at(i, base);
        }

        std::thread::scope(|scope| {
            let writer = Arc::clone(&registry);
            scope.spawn(move || {
                for i in 0..1000u32 {
                    writer.add_at(i, later);
                    if i % 3 == 0 {
                        writer.discard(&i);
                    }
                    if i % 50 == 0 {
                        writer.purge_at(later);
                    }
                }
            });

            let purger = Arc::clone(&registry);
            scope.spawn(move || {
                for _ in 0..200 {
                    purger.purge_at(later);
                }
            });

            for _ in 0..4 {
                let reader = Arc::clone(&registry);
                scope.spawn(move || {
                    for i in 0..1000u32 {
                        let _ = reader.contains(&i);
                        let _ = reader.len();
                    }
                });
            }
        });

        assert!(!registry.contains(&10_000));
        assert!(!registry.contains(&10_099));
        assert!(registry.contains(&998));
        assert!(!registry.contains(&999));
        assert_eq!(registry.len(), 666);
    }
}
