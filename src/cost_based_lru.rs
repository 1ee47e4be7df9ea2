//! [CostBasedLru] bounds what it holds by the summed cost of its entries instead of by how many there are.
//!
//! This is implemented as a vec-backed doubly linked list where the items are allocated on the heap behind `Arc`, plus
//! an auxiliary hash-based index from key to slot.  Vacated slots are chained into a free list and reused, so after
//! warming up the cache doesn't allocate for the list itself.
//!
//! The head of the list is the most recently used entry and the tail the least.  Every time an entry is inserted or
//! read it receives a fresh tick from a monotonic counter, so list order and tick order always agree and two entries
//! never tie.
//!
//! The budget is soft.  An insertion is always admitted and eviction runs afterwards, removing entries from the tail
//! until the total fits again.  The entry which was just inserted is never evicted by its own insertion, so a single
//! item which is larger than the whole budget stays resident on its own until something else displaces it.
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use ahash::RandomState;

use crate::EstimateCost;

struct OccupiedEntry<K: ?Sized, V> {
    key: Arc<K>,
    item: Arc<V>,
    prev: Option<usize>,
    next: Option<usize>,
    cost: u64,
    /// Tick of the last insert or read.
    last_used: u64,
}

struct EmptyEntry {
    next_empty: Option<usize>,
}

enum CacheEntry<K: ?Sized, V> {
    /// This entry is empty, possibly with a pointer at the next empty entry.
    Empty(EmptyEntry),
    /// This entry is occupied, and doubly linked to the previous and next entry.
    Occupied(OccupiedEntry<K, V>),
}

impl<K: ?Sized, V> CacheEntry<K, V> {
    fn as_occupied_mut(&mut self) -> &mut OccupiedEntry<K, V> {
        match self {
            Self::Occupied(ref mut x) => x,
            _ => panic!("Entry should be occupied"),
        }
    }

    fn as_occupied(&self) -> &OccupiedEntry<K, V> {
        match self {
            Self::Occupied(ref x) => x,
            _ => panic!("Entry should be occupied"),
        }
    }

    fn as_empty(&self) -> &EmptyEntry {
        match self {
            CacheEntry::Empty(ref x) => x,
            _ => panic!("Entry should be empty"),
        }
    }
}

/// An entry which eviction pushed out of the cache.
#[derive(Debug)]
pub struct Evicted<K: ?Sized> {
    pub key: Arc<K>,
    pub cost: u64,
}

/// What happened as a consequence of [CostBasedLru::insert].
#[derive(Debug)]
pub struct Inserted<K: ?Sized, V> {
    /// The value previously stored under the same key, if any.
    pub replaced: Option<Arc<V>>,
    /// What the new entry is accounted at.
    pub cost: u64,
    /// Entries evicted to bring the cache back under budget, least recently used first.
    pub evicted: Vec<Evicted<K>>,
}

/// Ways in which the bookkeeping of a [CostBasedLru] can disagree with itself.
///
/// None of these can happen unless there is a bug in this module; they exist so that tests can check the structure
/// after every operation.
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum InvariantViolation {
    #[error("recorded cost is {recorded} but entries add up to {actual}")]
    CostMismatch { recorded: u64, actual: u64 },
    #[error("index holds {indexed} keys but the list links {linked} entries")]
    LengthMismatch { indexed: usize, linked: usize },
    #[error("{empty} empty slots on the free list but {expected} slots are unoccupied")]
    FreeListMismatch { empty: usize, expected: usize },
    #[error("slot {slot} has a broken back link")]
    BrokenLink { slot: usize },
    #[error("slot {slot} is not the tail but the list ends there")]
    BrokenTail { slot: usize },
    #[error("slot {slot} is out of recency order")]
    RecencyOrder { slot: usize },
    #[error("index points a key at slot {slot}, which holds a different key")]
    StaleIndex { slot: usize },
    #[error("cost {cost} exceeds budget {budget} with {len} entries resident")]
    OverBudget { cost: u64, budget: u64, len: usize },
}

pub struct CostBasedLru<K: ?Sized + Hash + Eq, V> {
    entries: Vec<CacheEntry<K, V>>,
    /// Points at the index of the key.
    index: HashMap<Arc<K>, usize, RandomState>,
    // At what cost do we start evicting?
    max_cost: u64,
    entries_head: Option<usize>,
    entries_tail: Option<usize>,
    empty_head: Option<usize>,
    /// Current cost of the items in the cache.
    current_cost: u64,
    /// Last tick handed out to an entry.
    tick: u64,
}

impl<K: ?Sized + Hash + Eq, V> CostBasedLru<K, V> {
    pub fn new(max_cost: u64) -> CostBasedLru<K, V> {
        CostBasedLru {
            entries: Default::default(),
            index: Default::default(),
            max_cost,
            entries_head: None,
            entries_tail: None,
            empty_head: None,
            current_cost: 0,
            tick: 0,
        }
    }

    pub fn max_cost(&self) -> u64 {
        self.max_cost
    }

    /// Sum of the costs of everything currently held.
    pub fn current_cost(&self) -> u64 {
        self.current_cost
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Entirely unlink an occupied index from the list, patching up the head and tail.
    fn unlink_index(&mut self, index: usize) {
        let (prev, next) = {
            let e = self.entries[index].as_occupied();
            (e.prev, e.next)
        };

        match prev {
            Some(p) => self.entries[p].as_occupied_mut().next = next,
            None => self.entries_head = next,
        }
        match next {
            Some(n) => self.entries[n].as_occupied_mut().prev = prev,
            None => self.entries_tail = prev,
        }

        let e = self.entries[index].as_occupied_mut();
        e.prev = None;
        e.next = None;
    }

    /// Link an occupied but currently unlinked index in as the most recent item.
    fn link_at_head(&mut self, index: usize) {
        self.tick += 1;
        let old_head = self.entries_head;
        {
            let e = self.entries[index].as_occupied_mut();
            e.prev = None;
            e.next = old_head;
            e.last_used = self.tick;
        }

        match old_head {
            Some(h) => self.entries[h].as_occupied_mut().prev = Some(index),
            // If there's no head there's no tail either, and this is now both.
            None => self.entries_tail = Some(index),
        }
        self.entries_head = Some(index);
    }

    /// Given the index of an occupied entry, make it the most recent item.
    fn make_most_recent(&mut self, index: usize) {
        self.unlink_index(index);
        self.link_at_head(index);
    }

    /// Get an item, marking it as the most recently used.
    pub fn get(&mut self, key: &K) -> Option<Arc<V>> {
        self.get_with_cost(key).map(|x| x.0)
    }

    /// Like [CostBasedLru::get], but also return the cost the item was inserted with.
    pub fn get_with_cost(&mut self, key: &K) -> Option<(Arc<V>, u64)> {
        let ind = *self.index.get(key)?;
        self.make_most_recent(ind);
        let e = self.entries[ind].as_occupied();
        Some((e.item.clone(), e.cost))
    }

    /// Get an item without changing its position in the eviction order.
    pub fn peek(&self, key: &K) -> Option<Arc<V>> {
        let ind = *self.index.get(key)?;
        Some(self.entries[ind].as_occupied().item.clone())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Make a specific index of the map become empty, returning what was there.
    fn become_empty(&mut self, index: usize) -> (Arc<K>, Arc<V>, u64) {
        self.unlink_index(index);
        let mut old = CacheEntry::Empty(EmptyEntry {
            next_empty: self.empty_head,
        });
        std::mem::swap(&mut old, &mut self.entries[index]);
        self.empty_head = Some(index);
        match old {
            CacheEntry::Occupied(OccupiedEntry {
                key, item, cost, ..
            }) => {
                self.index.remove(&*key);
                self.current_cost -= cost;
                (key, item, cost)
            }
            _ => panic!("Should have been occupied"),
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<Arc<V>> {
        let ind = *self.index.get(key)?;
        Some(self.become_empty(ind).1)
    }

    /// Find an available empty index, or make one if necessary.
    fn find_empty(&mut self) -> usize {
        if let Some(e) = self.empty_head {
            self.empty_head = self.entries[e].as_empty().next_empty;
            return e;
        }

        self.entries
            .push(CacheEntry::Empty(EmptyEntry { next_empty: None }));
        self.entries.len() - 1
    }

    /// Add an entry to the cache, then evict least recently used entries until the cost fits the budget again.
    ///
    /// If the key was already present its old value is replaced, and its old cost no longer counts.  If adding `cost`
    /// would overflow the running total, older entries are evicted first to make room.
    pub fn insert(&mut self, key: Arc<K>, value: Arc<V>, cost: u64) -> Inserted<K, V> {
        let replaced = self.remove(&*key);

        // Only possible when an oversized entry is already resident; everything there now is older than this one.
        let mut evicted = vec![];
        while self.current_cost.checked_add(cost).is_none() {
            let cur = match self.entries_tail {
                Some(t) => t,
                None => panic!("Not enough entries to explain cost"),
            };
            let (old_key, _, old_cost) = self.become_empty(cur);
            evicted.push(Evicted {
                key: old_key,
                cost: old_cost,
            });
        }

        let ind = self.find_empty();
        self.entries[ind] = CacheEntry::Occupied(OccupiedEntry {
            key: key.clone(),
            item: value,
            prev: None,
            next: None,
            cost,
            last_used: 0,
        });
        self.link_at_head(ind);
        self.index.insert(key, ind);
        self.current_cost += cost;

        evicted.extend(self.evict_down_to(self.max_cost, true));
        Inserted {
            replaced,
            cost,
            evicted,
        }
    }

    /// [CostBasedLru::insert], charging the value whatever it estimates itself at.
    pub fn insert_estimated(&mut self, key: Arc<K>, value: Arc<V>) -> Inserted<K, V>
    where
        V: EstimateCost,
    {
        let cost = value.estimate_cost();
        self.insert(key, value, cost)
    }

    /// Evict least recently used entries until the total cost is at most `target`, which may empty the cache.
    ///
    /// This doesn't change the budget; it's for shedding memory on demand.
    pub fn trim_to(&mut self, target: u64) -> Vec<Evicted<K>> {
        self.evict_down_to(target, false)
    }

    /// Run a cache eviction if required.
    ///
    /// With `keep_head` the most recent entry survives even if it alone is over `target`.
    fn evict_down_to(&mut self, target: u64, keep_head: bool) -> Vec<Evicted<K>> {
        let mut evicted = vec![];
        while self.current_cost > target {
            let cur = match self.entries_tail {
                Some(t) => t,
                None => panic!("Not enough entries to explain cost"),
            };
            if keep_head && Some(cur) == self.entries_head {
                break;
            }

            let (key, _, cost) = self.become_empty(cur);
            evicted.push(Evicted { key, cost });
        }
        evicted
    }

    /// Drop everything, returning how many entries were held.
    pub fn clear(&mut self) -> usize {
        let count = self.index.len();
        self.entries.clear();
        self.index.clear();
        self.entries_head = None;
        self.entries_tail = None;
        self.empty_head = None;
        self.current_cost = 0;
        count
    }

    /// Iterator visiting entries in most-recently-used order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.iter_entries().map(|e| (&*e.key, &*e.item))
    }

    /// Iterator visiting keys and costs in most-recently-used order.
    pub fn iter_costs(&self) -> impl Iterator<Item = (&K, u64)> {
        self.iter_entries().map(|e| (&*e.key, e.cost))
    }

    fn iter_entries(&self) -> impl Iterator<Item = &OccupiedEntry<K, V>> {
        let mut ind = self.entries_head;
        std::iter::from_fn(move || {
            let next = ind?;
            let ret = self.entries[next].as_occupied();
            ind = ret.next;
            Some(ret)
        })
    }

    /// Walk the whole structure and verify that the list, the index, the free list, and the running cost agree.
    ///
    /// This is linear in the size of the cache and is meant for tests and debugging.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let mut linked = 0;
        let mut actual_cost = 0u64;
        let mut prev: Option<usize> = None;
        let mut prev_tick: Option<u64> = None;
        let mut ind = self.entries_head;

        while let Some(i) = ind {
            let e = match &self.entries[i] {
                CacheEntry::Occupied(e) => e,
                CacheEntry::Empty(_) => return Err(InvariantViolation::BrokenLink { slot: i }),
            };
            if e.prev != prev {
                return Err(InvariantViolation::BrokenLink { slot: i });
            }
            if prev_tick.map_or(false, |t| t <= e.last_used) {
                return Err(InvariantViolation::RecencyOrder { slot: i });
            }
            if self.index.get(&*e.key) != Some(&i) {
                return Err(InvariantViolation::StaleIndex { slot: i });
            }
            if e.next.is_none() && self.entries_tail != Some(i) {
                return Err(InvariantViolation::BrokenTail { slot: i });
            }

            linked += 1;
            actual_cost += e.cost;
            prev = Some(i);
            prev_tick = Some(e.last_used);
            ind = e.next;
        }

        if self.entries_tail != prev {
            return Err(InvariantViolation::BrokenTail {
                slot: self.entries_tail.unwrap_or(usize::MAX),
            });
        }
        if linked != self.index.len() {
            return Err(InvariantViolation::LengthMismatch {
                indexed: self.index.len(),
                linked,
            });
        }
        if actual_cost != self.current_cost {
            return Err(InvariantViolation::CostMismatch {
                recorded: self.current_cost,
                actual: actual_cost,
            });
        }

        let mut empty = 0;
        let mut e = self.empty_head;
        while let Some(i) = e {
            empty += 1;
            e = match &self.entries[i] {
                CacheEntry::Empty(x) => x.next_empty,
                CacheEntry::Occupied(_) => return Err(InvariantViolation::BrokenLink { slot: i }),
            };
        }
        if empty != self.entries.len() - linked {
            return Err(InvariantViolation::FreeListMismatch {
                empty,
                expected: self.entries.len() - linked,
            });
        }

        if self.current_cost > self.max_cost && linked > 1 {
            return Err(InvariantViolation::OverBudget {
                cost: self.current_cost,
                budget: self.max_cost,
                len: linked,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DecodedImage, PixelFormat};

    use lru::LruCache;
    use proptest::prelude::*;

    /// Simple helper to build proptest strategies so that we can test the one-based base case against [LruCache].
    #[derive(Copy, Clone, Debug, Ord, Eq, PartialOrd, PartialEq)]
    enum CacheCommand {
        Put(u64, u64),
        Get(u64),
        Delete(u64),
    }

    fn cache_command_strat(
        max_key: std::ops::Range<u64>,
        max_value: std::ops::Range<u64>,
    ) -> prop::strategy::BoxedStrategy<CacheCommand> {
        proptest::prop_oneof![
            max_key.clone().prop_map(CacheCommand::Get),
            (max_key.clone(), max_value).prop_map(|(x, y)| CacheCommand::Put(x, y)),
            max_key.prop_map(CacheCommand::Delete),
        ]
        .boxed()
    }

    // Run some tests against bounded lru caches.  When we set max_cost to the capacity and the cost of
    // all inputted keys as 1, we get something exactly equivalent to `[LruCache].
    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            max_shrink_iters: 10000,
            ..Default::default()
        })]
        #[test]
        fn test_against_lru_cache_bounded(
            bound in 1..200u64,
            commands in prop::collection::vec(cache_command_strat(0..100, 0..10000), 0..2000)
        ) {
            let mut known_good = LruCache::<u64, u64>::new(bound as usize);
            let mut ours = CostBasedLru::<u64, u64>::new(bound);

            for c in commands {
                use CacheCommand::*;

                match c {
                    Get(k) => {
                        let left: Option<u64> = known_good.get(&k).cloned();
                        let right: Option<u64> = ours.get(&k).as_deref().cloned();
                        prop_assert_eq!(left, right);
                    },
                    Put(k, v) => prop_assert_eq!(
                        known_good.put(k, v),
                        ours.insert(Arc::new(k), Arc::new(v), 1).replaced.as_deref().cloned()
                    ),
                    Delete(k) => prop_assert_eq!(known_good.pop(&k), ours.remove(&k).as_deref().cloned()),
                }

                let good_state = known_good.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>();
                let our_state = ours.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>();
                prop_assert_eq!(&good_state, &our_state);
                prop_assert_eq!(good_state.len() as u64, ours.current_cost());
                prop_assert_eq!(ours.check_invariants(), Ok(()));
            }
        }
    }

    /// Commands with arbitrary costs, for checking the accounting rather than the ordering.
    #[derive(Copy, Clone, Debug)]
    enum CostCommand {
        Put(u8, u64),
        Get(u8),
        Delete(u8),
        Trim(u64),
    }

    fn cost_command_strat() -> prop::strategy::BoxedStrategy<CostCommand> {
        proptest::prop_oneof![
            4 => (0..32u8, 0..120u64).prop_map(|(k, c)| CostCommand::Put(k, c)),
            2 => (0..32u8).prop_map(CostCommand::Get),
            2 => (0..32u8).prop_map(CostCommand::Delete),
            1 => (0..300u64).prop_map(CostCommand::Trim),
        ]
        .boxed()
    }

    proptest! {
        #[test]
        fn test_cost_accounting(
            budget in 0..300u64,
            commands in prop::collection::vec(cost_command_strat(), 0..500)
        ) {
            let mut cache = CostBasedLru::<str, u8>::new(budget);

            for c in commands {
                match c {
                    CostCommand::Put(k, cost) => {
                        let key: Arc<str> = k.to_string().into();
                        let res = cache.insert(key.clone(), Arc::new(k), cost);
                        prop_assert!(cache.contains_key(&*key));
                        prop_assert!(res.evicted.iter().all(|e| *e.key != *key));
                        if cache.current_cost() > budget {
                            prop_assert_eq!(cache.len(), 1);
                            prop_assert!(cost > budget);
                        }
                    }
                    CostCommand::Get(k) => {
                        let before = cache.current_cost();
                        cache.get(&*k.to_string());
                        prop_assert_eq!(before, cache.current_cost());
                    }
                    CostCommand::Delete(k) => {
                        cache.remove(&*k.to_string());
                        prop_assert!(!cache.contains_key(&*k.to_string()));
                    }
                    CostCommand::Trim(target) => {
                        cache.trim_to(target);
                        prop_assert!(cache.current_cost() <= target);
                    }
                }

                let summed: u64 = cache.iter_costs().map(|x| x.1).sum();
                prop_assert_eq!(summed, cache.current_cost());
                prop_assert_eq!(cache.iter().count(), cache.len());
                prop_assert_eq!(cache.check_invariants(), Ok(()));
            }
        }
    }

    // We know everything else works, including complex linked lists for eviction, but let's still check what happens
    // without a cost of zero.
    #[test]
    fn test_eviction() {
        let mut cache = CostBasedLru::<u64, u64>::new(10);
        for i in 1..=5 {
            cache.insert(Arc::new(i), Arc::new(i), i);
        }

        let state = cache
            .iter()
            .map(|x| (*x.0, *x.1))
            .collect::<Vec<(u64, u64)>>();
        assert_eq!(state, vec![(5, 5), (4, 4)]);
        assert_eq!(cache.current_cost(), 9);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut cache = CostBasedLru::<str, u64>::new(30);
        cache.insert("a".into(), Arc::new(1), 10);
        cache.insert("b".into(), Arc::new(2), 10);
        cache.insert("c".into(), Arc::new(3), 10);

        // Reading a makes b the oldest.
        cache.get("a").unwrap();
        let res = cache.insert("d".into(), Arc::new(4), 10);
        assert_eq!(res.evicted.len(), 1);
        assert_eq!(&*res.evicted[0].key, "b");
        assert_eq!(res.evicted[0].cost, 10);

        // Peeking and checking membership doesn't save c.
        assert!(cache.contains_key("c"));
        assert_eq!(cache.peek("c").as_deref(), Some(&3));
        let res = cache.insert("e".into(), Arc::new(5), 10);
        assert_eq!(&*res.evicted[0].key, "c");
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_oversized_entry_is_admitted() {
        let mut cache = CostBasedLru::<str, u64>::new(100);
        cache.insert("a".into(), Arc::new(1), 40);
        cache.insert("b".into(), Arc::new(2), 40);
        let res = cache.insert("big".into(), Arc::new(3), 500);

        let evicted = res.evicted.iter().map(|e| &*e.key).collect::<Vec<_>>();
        assert_eq!(evicted, vec!["a", "b"]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.current_cost(), 500);
        cache.check_invariants().unwrap();

        // The next insertion pushes it out.
        let res = cache.insert("c".into(), Arc::new(4), 1);
        assert_eq!(&*res.evicted[0].key, "big");
        assert_eq!(cache.current_cost(), 1);
    }

    #[test]
    fn test_replace_adjusts_cost() {
        let mut cache = CostBasedLru::<str, u64>::new(100);
        cache.insert("a".into(), Arc::new(1), 30);
        cache.insert("b".into(), Arc::new(2), 30);
        let res = cache.insert("a".into(), Arc::new(3), 60);

        assert_eq!(res.replaced.as_deref(), Some(&1));
        assert!(res.evicted.is_empty());
        assert_eq!(cache.current_cost(), 90);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a").as_deref(), Some(&3));
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_trim_and_clear() {
        let mut cache = CostBasedLru::<str, u64>::new(100);
        cache.insert("a".into(), Arc::new(1), 30);
        cache.insert("b".into(), Arc::new(2), 30);
        cache.insert("c".into(), Arc::new(3), 30);

        let evicted = cache.trim_to(40);
        assert_eq!(evicted.len(), 2);
        assert_eq!(cache.iter().map(|x| *x.1).collect::<Vec<_>>(), vec![3]);

        cache.trim_to(0);
        assert!(cache.is_empty());
        cache.check_invariants().unwrap();

        cache.insert("d".into(), Arc::new(4), 10);
        cache.insert("e".into(), Arc::new(5), 10);
        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.current_cost(), 0);
        assert!(cache.get("d").is_none());
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_huge_costs_do_not_overflow() {
        let mut cache = CostBasedLru::<str, u64>::new(10);
        cache.insert("a".into(), Arc::new(1), u64::MAX);
        let res = cache.insert("b".into(), Arc::new(2), 1);

        assert_eq!(&*res.evicted[0].key, "a");
        assert_eq!(cache.current_cost(), 1);
        cache.check_invariants().unwrap();

        let res = cache.insert("c".into(), Arc::new(3), u64::MAX);
        assert_eq!(&*res.evicted[0].key, "b");
        let res = cache.insert("d".into(), Arc::new(4), u64::MAX);
        assert_eq!(&*res.evicted[0].key, "c");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.current_cost(), u64::MAX);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_insert_estimated() {
        let mut cache = CostBasedLru::<str, DecodedImage>::new(100);
        let img = DecodedImage::new(4, 4, PixelFormat::Rgba8, vec![0; 64]).unwrap();
        let res = cache.insert_estimated("a".into(), Arc::new(img));

        assert_eq!(res.cost, 64);
        assert_eq!(cache.current_cost(), 64);
        assert_eq!(cache.iter_costs().collect::<Vec<_>>(), vec![("a", 64)]);
    }

    #[test]
    fn test_evicted_values_outlive_the_cache_entry() {
        let mut cache = CostBasedLru::<str, String>::new(10);
        cache.insert("a".into(), Arc::new("held".to_string()), 10);
        let held = cache.get("a").unwrap();
        cache.insert("b".into(), Arc::new("other".to_string()), 10);

        assert!(!cache.contains_key("a"));
        assert_eq!(&*held, "held");
    }
}
