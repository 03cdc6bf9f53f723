//! Segment-Locked Concurrent Hopscotch Hash Map.
//!
//! # Protocol
//!
//! - **Writers** hash the key, pick the home segment and take only that
//!   segment's TTAS lock. Inserts probe for the key, linear-scan up to
//!   `add_range` buckets for an empty slot, and displace entries backward
//!   until the slot sits within `hop_range` of the home bucket.
//! - **Readers** take no lock. A probe walks the home bucket's neighborhood
//!   bitmap; on a miss it re-reads the segment's displacement timestamp and
//!   retries (up to `max_tries` times) if an entry moved mid-probe.
//! - **Resize** is a global pause: every segment lock in ascending order,
//!   rebuild into a table with doubled bucket rings, swap the table pointer,
//!   retire the old table through the epoch collector.
//!
//! Removed and displaced entries are reclaimed with `crossbeam-epoch`, so a
//! reader that raced a writer keeps a valid view until it unpins.

use std::borrow::Borrow;
use std::hash::{BuildHasher, Hash};
use std::num::NonZeroU64;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use foldhash::fast::FixedState;

use crate::config::TableConfig;
use crate::error::Error;
use crate::segment::{Entry, Segment};

/// Ceiling on the total bucket count; growth past this fails the triggering
/// insert instead of doubling forever on degenerate hash input.
const MAXIMUM_CAPACITY: usize = 1 << 30;

/// What a single locked insertion attempt did.
enum InsertOutcome<K, V> {
    /// A new entry was written.
    Inserted,
    /// The key was already present; the map is unchanged.
    Exists(V),
    /// No empty bucket within `add_range`, or the displacement cascade could
    /// not drag one into the neighborhood. Ownership returns to the caller
    /// for the retry after a resize.
    Stuck(K, V),
}

/// The segment array plus the geometry derived from its power-of-two sizes.
/// Replaced wholesale by resize; reached through an epoch-protected pointer.
struct Table<K, V> {
    segments: Box<[Segment<K, V>]>,
    /// Right-shift mapping the top bits of a hashed key to a segment index.
    segment_shift: u32,
    bucket_mask: usize,
}

impl<K, V> Table<K, V> {
    fn new(n_segments: usize, n_buckets: usize) -> Self {
        let mut segments = Vec::with_capacity(n_segments);
        for _ in 0..n_segments {
            segments.push(Segment::new(n_buckets));
        }
        Self {
            segments: segments.into_boxed_slice(),
            segment_shift: u64::BITS - n_segments.trailing_zeros(),
            bucket_mask: n_buckets - 1,
        }
    }

    /// Maps a hashed key to (segment index, home bucket index): the top
    /// `log2(n_segments)` bits select the segment, the low bits the bucket.
    /// `checked_shr` covers the single-segment table, where the shift spans
    /// the whole word.
    #[inline]
    fn locate(&self, hkey: NonZeroU64) -> (usize, usize) {
        let seg = hkey.get().checked_shr(self.segment_shift).unwrap_or(0) as usize;
        let home = (hkey.get() as usize) & self.bucket_mask;
        (seg, home)
    }

    fn n_buckets(&self) -> usize {
        self.bucket_mask + 1
    }

    fn capacity(&self) -> usize {
        self.segments.len() * self.n_buckets()
    }

    fn len(&self) -> usize {
        self.segments
            .iter()
            .map(|seg| seg.len.load(Ordering::Relaxed))
            .sum()
    }
}

impl<K, V> Table<K, V>
where
    K: Eq + Clone,
    V: Clone,
{
    /// The insert algorithm: probe, scan, displace, write. The caller must
    /// hold the home segment's lock, or otherwise have exclusive write access
    /// as during a rebuild.
    fn insert_entry(
        &self,
        hkey: NonZeroU64,
        key: K,
        value: V,
        hop_range: usize,
        add_range: usize,
        guard: &Guard,
    ) -> InsertOutcome<K, V> {
        let (si, home) = self.locate(hkey);
        let seg = &self.segments[si];

        if let Some((_, entry)) = seg.probe(home, hkey, &key, guard) {
            return InsertOutcome::Exists(unsafe { entry.deref() }.value.clone());
        }

        let Some((mut idx, mut dist)) = seg.free_slot(home, add_range, guard) else {
            return InsertOutcome::Stuck(key, value);
        };
        while dist >= hop_range {
            match seg.find_closer_free_bucket(idx, dist, hop_range, guard) {
                Some((closer_idx, closer_dist)) => {
                    idx = closer_idx;
                    dist = closer_dist;
                }
                None => return InsertOutcome::Stuck(key, value),
            }
        }

        // Slot before bit: a reader that sees the bit must see the entry.
        let entry = Owned::new(Entry { hkey, key, value }).into_shared(guard);
        seg.bucket(idx).slot.store(entry, Ordering::Release);
        seg.bucket(home).hop_info.fetch_or(1 << dist, Ordering::Release);
        seg.len.fetch_add(1, Ordering::Relaxed);
        InsertOutcome::Inserted
    }

    /// Reinserts every live entry into `target`, reusing the stored hashed
    /// key rather than rehashing. Returns false if `target` is still too
    /// tight and the caller should double again.
    fn rehash_into(
        &self,
        target: &Table<K, V>,
        hop_range: usize,
        add_range: usize,
        guard: &Guard,
    ) -> bool {
        for seg in self.segments.iter() {
            for idx in 0..self.n_buckets() {
                let entry = seg.bucket(idx).slot.load(Ordering::Acquire, guard);
                if let Some(e) = unsafe { entry.as_ref() } {
                    match target.insert_entry(
                        e.hkey,
                        e.key.clone(),
                        e.value.clone(),
                        hop_range,
                        add_range,
                        guard,
                    ) {
                        InsertOutcome::Inserted => {}
                        InsertOutcome::Exists(_) => {}
                        InsertOutcome::Stuck(..) => return false,
                    }
                }
            }
        }
        true
    }
}

/// A concurrent hash map based on hopscotch hashing, with per-segment
/// locking for writers and a lock-free, retry-bounded read path.
///
/// `insert` never replaces: inserting a key that is already present leaves
/// the map unchanged and hands back the existing value. Callers that want
/// replace semantics remove first.
pub struct HopscotchMap<K, V, S = FixedState> {
    table: Atomic<Table<K, V>>,
    hop_range: usize,
    add_range: usize,
    max_tries: u32,
    hasher: S,
}

impl<K, V> HopscotchMap<K, V, FixedState>
where
    K: Hash + Eq + Clone + 'static,
    V: Clone + 'static,
{
    /// Creates a map with the default configuration and hasher.
    pub fn new() -> Self {
        Self::from_parts(TableConfig::default(), FixedState::default())
    }

    /// Creates a map with the given configuration and the default hasher.
    pub fn with_config(config: TableConfig) -> Result<Self, Error> {
        Self::with_config_and_hasher(config, FixedState::default())
    }
}

impl<K, V, S> HopscotchMap<K, V, S>
where
    K: Hash + Eq + Clone + 'static,
    V: Clone + 'static,
    S: BuildHasher,
{
    /// Creates a map with the default configuration and a custom hasher.
    pub fn with_hasher(hasher: S) -> Self {
        Self::from_parts(TableConfig::default(), hasher)
    }

    /// Creates a map with a custom configuration and hasher, rejecting any
    /// configuration that breaks the construction-time constraints.
    pub fn with_config_and_hasher(config: TableConfig, hasher: S) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self::from_parts(config, hasher))
    }

    fn from_parts(config: TableConfig, hasher: S) -> Self {
        Self {
            table: Atomic::new(Table::new(
                config.n_segments,
                config.n_buckets_per_segment,
            )),
            hop_range: config.hop_range,
            add_range: config.add_range,
            max_tries: config.max_tries,
            hasher,
        }
    }

    /// The hash adapter: zero is reserved as the empty marker in the hashed
    /// key domain, so it folds onto 1.
    #[inline]
    fn hash_key<Q>(&self, key: &Q) -> NonZeroU64
    where
        Q: Hash + ?Sized,
    {
        NonZeroU64::new(self.hasher.hash_one(key)).unwrap_or(NonZeroU64::MIN)
    }

    /// Inserts a key-value pair unless the key is already present.
    ///
    /// Returns `Ok(None)` when the entry was inserted and `Ok(Some(existing))`
    /// when the key was already there (the map is left unchanged). Fails only
    /// when the table hit the growth ceiling while making room.
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>, Error> {
        let hkey = self.hash_key(&key);
        let mut key = key;
        let mut value = value;

        loop {
            let guard = epoch::pin();
            let table_ptr = self.table.load(Ordering::Acquire, &guard);
            let table = unsafe { table_ptr.deref() };
            let (si, _) = table.locate(hkey);
            {
                let _write = table.segments[si].lock.lock();
                // A resize may have swapped the table while we waited.
                if self.table.load(Ordering::Acquire, &guard) != table_ptr {
                    continue;
                }
                match table.insert_entry(
                    hkey,
                    key,
                    value,
                    self.hop_range,
                    self.add_range,
                    &guard,
                ) {
                    InsertOutcome::Inserted => return Ok(None),
                    InsertOutcome::Exists(existing) => return Ok(Some(existing)),
                    InsertOutcome::Stuck(k, v) => {
                        key = k;
                        value = v;
                    }
                }
            }
            self.grow(table_ptr, &guard)?;
        }
    }

    /// Returns the value for `key`, inserting `value` if absent.
    pub fn get_or_insert(&self, key: K, value: V) -> Result<V, Error> {
        match self.insert(key, value.clone())? {
            Some(existing) => Ok(existing),
            None => Ok(value),
        }
    }

    /// Looks up `key` without taking any lock.
    ///
    /// A displacement racing with the probe can hide the entry for one pass;
    /// the segment timestamp detects that, and the probe reruns up to the
    /// configured retry budget. A stable timestamp on a miss means the key
    /// was genuinely absent.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hkey = self.hash_key(key);
        let guard = epoch::pin();
        let table = unsafe { self.table.load(Ordering::Acquire, &guard).deref() };
        let (si, home) = table.locate(hkey);
        let seg = &table.segments[si];

        let mut tries = 0;
        loop {
            let stamp = seg.timestamp.load(Ordering::Acquire);
            if let Some((_, entry)) = seg.probe(home, hkey, key, &guard) {
                return Some(unsafe { entry.deref() }.value.clone());
            }
            tries += 1;
            if tries >= self.max_tries || seg.timestamp.load(Ordering::Acquire) == stamp {
                return None;
            }
        }
    }

    /// Returns true if the map holds an entry for `key`.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Removes `key` under the home segment's lock, returning its value.
    ///
    /// Removal moves nothing, so the displacement timestamp stays put: a
    /// reader that witnesses the cleared slot correctly reports absent.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hkey = self.hash_key(key);

        loop {
            let guard = epoch::pin();
            let table_ptr = self.table.load(Ordering::Acquire, &guard);
            let table = unsafe { table_ptr.deref() };
            let (si, home) = table.locate(hkey);
            let seg = &table.segments[si];

            let _write = seg.lock.lock();
            if self.table.load(Ordering::Acquire, &guard) != table_ptr {
                continue;
            }

            let (offset, entry) = seg.probe(home, hkey, key, &guard)?;
            let value = unsafe { entry.deref() }.value.clone();
            let idx = (home + offset) & table.bucket_mask;
            seg.bucket(idx).slot.store(Shared::null(), Ordering::Release);
            seg.bucket(home)
                .hop_info
                .fetch_and(!(1u32 << offset), Ordering::Release);
            unsafe { guard.defer_destroy(entry) };
            seg.len.fetch_sub(1, Ordering::Relaxed);
            return Some(value);
        }
    }

    /// Stop-the-world rebuild into a table with doubled bucket rings.
    ///
    /// Doubling the ring (rather than the segment count) widens the home
    /// bucket mask, so entries that crowded one neighborhood spread out —
    /// which is what the stuck insert needs. Reinsertion reuses stored hashed
    /// keys; if the doubled table is still too tight it doubles again, up to
    /// the capacity ceiling.
    fn grow(&self, stale: Shared<'_, Table<K, V>>, guard: &Guard) -> Result<(), Error> {
        let table_ptr = self.table.load(Ordering::Acquire, guard);
        if table_ptr != stale {
            // Another thread already rebuilt the table.
            return Ok(());
        }
        let table = unsafe { table_ptr.deref() };

        // Global pause: every segment lock, in ascending index order.
        let _locks: Vec<_> = table.segments.iter().map(|seg| seg.lock.lock()).collect();
        if self.table.load(Ordering::Acquire, guard) != table_ptr {
            return Ok(());
        }

        let n_segments = table.segments.len();
        let mut n_buckets = table.n_buckets();
        loop {
            n_buckets *= 2;
            if n_segments.saturating_mul(n_buckets) > MAXIMUM_CAPACITY {
                return Err(Error::CapacityExhausted {
                    capacity: table.capacity(),
                });
            }
            let new_table = Table::new(n_segments, n_buckets);
            if table.rehash_into(&new_table, self.hop_range, self.add_range, guard) {
                self.table.store(Owned::new(new_table), Ordering::Release);
                // Readers pinned in the old table keep it alive until they
                // unpin; the epoch collector frees it afterwards.
                unsafe { guard.defer_destroy(table_ptr) };
                return Ok(());
            }
        }
    }

    /// Number of entries across all segments.
    pub fn len(&self) -> usize {
        let guard = epoch::pin();
        unsafe { self.table.load(Ordering::Acquire, &guard).deref() }.len()
    }

    /// Returns true if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bucket count of the current table.
    pub fn capacity(&self) -> usize {
        let guard = epoch::pin();
        unsafe { self.table.load(Ordering::Acquire, &guard).deref() }.capacity()
    }
}

impl<K, V> Default for HopscotchMap<K, V, FixedState>
where
    K: Hash + Eq + Clone + 'static,
    V: Clone + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<K: Send + Sync, V: Send + Sync, S: Send> Send for HopscotchMap<K, V, S> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync> Sync for HopscotchMap<K, V, S> {}

impl<K, V, S> Drop for HopscotchMap<K, V, S> {
    fn drop(&mut self) {
        // Exclusive access: tear the table down without deferral.
        let guard = unsafe { epoch::unprotected() };
        let table = self.table.swap(Shared::null(), Ordering::Relaxed, guard);
        if !table.is_null() {
            drop(unsafe { table.into_owned() });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hash::Hasher;

    /// Hashes unsigned integers to themselves so segment and bucket
    /// placement is deterministic in the scenarios below.
    #[derive(Clone, Copy, Default)]
    struct IdentityState;

    struct IdentityHasher(u64);

    impl Hasher for IdentityHasher {
        fn finish(&self) -> u64 {
            self.0
        }

        fn write(&mut self, bytes: &[u8]) {
            for &b in bytes {
                self.0 = (self.0 << 8) | u64::from(b);
            }
        }

        fn write_u64(&mut self, n: u64) {
            self.0 = n;
        }
    }

    impl BuildHasher for IdentityState {
        type Hasher = IdentityHasher;

        fn build_hasher(&self) -> IdentityHasher {
            IdentityHasher(0)
        }
    }

    fn small_map() -> HopscotchMap<u64, &'static str, IdentityState> {
        HopscotchMap::with_config_and_hasher(
            TableConfig {
                n_segments: 2,
                n_buckets_per_segment: 16,
                hop_range: 4,
                add_range: 8,
                max_tries: 2,
            },
            IdentityState,
        )
        .unwrap()
    }

    fn segment_hop_info(
        map: &HopscotchMap<u64, &'static str, IdentityState>,
        seg: usize,
        bucket: usize,
    ) -> u32 {
        let guard = epoch::pin();
        let table = unsafe { map.table.load(Ordering::Acquire, &guard).deref() };
        table.segments[seg].bucket(bucket).hop_info.load(Ordering::Acquire)
    }

    #[test]
    fn insert_get_remove_lifecycle() {
        let map = small_map();
        assert_eq!(map.insert(1, "a").unwrap(), None);
        assert_eq!(map.get(&1), Some("a"));
        assert_eq!(map.remove(&1), Some("a"));
        assert_eq!(map.get(&1), None);
        assert!(map.is_empty());
    }

    #[test]
    fn insert_ignores_existing_key() {
        let map = small_map();
        assert_eq!(map.insert(1, "a").unwrap(), None);
        assert_eq!(map.insert(1, "b").unwrap(), Some("a"));
        assert_eq!(map.get(&1), Some("a"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn colliding_keys_share_a_neighborhood() {
        let map = small_map();
        map.insert(1, "a").unwrap();
        map.insert(17, "b").unwrap();

        // Both keys are homed at bucket 1 of segment 0, at offsets 0 and 1.
        assert_eq!(segment_hop_info(&map, 0, 1), 0b11);
        assert_eq!(map.get(&1), Some("a"));
        assert_eq!(map.get(&17), Some("b"));
    }

    #[test]
    fn displacement_drags_a_free_slot_into_range() {
        let map = small_map();
        // Buckets 1..=4 fill up: keys 2 and 18 homed at bucket 2, keys 1 and
        // 17 homed at bucket 1 (17 lands at offset 3 after the linear scan).
        map.insert(2, "b0").unwrap();
        map.insert(18, "b1").unwrap();
        map.insert(1, "a0").unwrap();
        map.insert(17, "a1").unwrap();

        // The next free bucket is at distance 4 from home bucket 1, outside
        // hop_range: the cascade moves key 18 from bucket 3 to bucket 5 and
        // the new entry takes bucket 3.
        map.insert(33, "a2").unwrap();

        assert_eq!(segment_hop_info(&map, 0, 1), 0b1101);
        assert_eq!(segment_hop_info(&map, 0, 2), 0b1001);

        let guard = epoch::pin();
        let table = unsafe { map.table.load(Ordering::Acquire, &guard).deref() };
        assert_eq!(table.segments[0].timestamp.load(Ordering::Acquire), 1);
        table.segments[0].check_invariants(4);

        for (key, value) in [(2, "b0"), (18, "b1"), (1, "a0"), (17, "a1"), (33, "a2")] {
            assert_eq!(map.get(&key), Some(value), "missing key {}", key);
        }
        assert_eq!(map.len(), 5);
    }

    #[test]
    fn stuck_neighborhood_forces_growth() {
        let map = small_map();
        let before = map.capacity();

        // Five keys homed at bucket 1 with nothing movable between them:
        // the displacement engine reports stuck and the table doubles.
        for (i, key) in [1u64, 17, 33, 49, 65].into_iter().enumerate() {
            map.insert(key, ["a", "b", "c", "d", "e"][i]).unwrap();
        }

        assert!(map.capacity() > before);
        for key in [1u64, 17, 33, 49, 65] {
            assert!(map.get(&key).is_some(), "missing key {}", key);
        }
        assert_eq!(map.len(), 5);

        let guard = epoch::pin();
        let table = unsafe { map.table.load(Ordering::Acquire, &guard).deref() };
        for seg in table.segments.iter() {
            seg.check_invariants(4);
        }
    }

    #[test]
    fn invariants_hold_after_churn() {
        let map = small_map();
        for key in 1..=12u64 {
            map.insert(key, "v").unwrap();
        }
        for key in (1..=12u64).step_by(3) {
            map.remove(&key);
        }
        for key in 20..=24u64 {
            map.insert(key, "w").unwrap();
        }

        let guard = epoch::pin();
        let table = unsafe { map.table.load(Ordering::Acquire, &guard).deref() };
        for seg in table.segments.iter() {
            seg.check_invariants(4);
        }
        assert_eq!(map.len(), 13);
    }

    #[test]
    fn zero_hash_folds_onto_one() {
        let map = small_map();
        // Key 0 hashes to the reserved value and is remapped; key 1 hashes
        // to the same value legitimately. Both must coexist.
        map.insert(0, "zero").unwrap();
        map.insert(1, "one").unwrap();
        assert_eq!(map.get(&0), Some("zero"));
        assert_eq!(map.get(&1), Some("one"));
        assert_eq!(map.remove(&0), Some("zero"));
        assert_eq!(map.get(&1), Some("one"));
    }
}
