//! Segments: bucket rings, the neighborhood probe, and the displacement
//! engine.
//!
//! A segment is a power-of-two ring of buckets guarded by one TTAS lock. Each
//! bucket carries a `hop_info` bitmap whose bit `i` means "the bucket at
//! offset `i` (wrapping within the ring) holds an entry whose home is this
//! bucket". Writers mutate the ring only while holding the segment lock;
//! readers walk the bitmaps with no lock at all and rely on the segment
//! `timestamp`, bumped once per displacement, to detect an entry moving under
//! their feet.

use std::borrow::Borrow;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

use crate::lock::TtasLock;

/// A live key-value pair. Reached through an epoch-protected pointer; a null
/// slot pointer is the "empty bucket" marker.
pub(crate) struct Entry<K, V> {
    /// Hashed key; the hash adapter never produces zero.
    pub(crate) hkey: NonZeroU64,
    pub(crate) key: K,
    pub(crate) value: V,
}

impl<K: Clone, V: Clone> Clone for Entry<K, V> {
    fn clone(&self) -> Self {
        Self {
            hkey: self.hkey,
            key: self.key.clone(),
            value: self.value.clone(),
        }
    }
}

/// One cell of the ring.
pub(crate) struct Bucket<K, V> {
    /// Bitmap of neighborhood slots occupied by entries homed here.
    pub(crate) hop_info: AtomicU32,
    /// The entry stored at this position, independent of where its home is.
    pub(crate) slot: Atomic<Entry<K, V>>,
}

impl<K, V> Bucket<K, V> {
    fn new() -> Self {
        Self {
            hop_info: AtomicU32::new(0),
            slot: Atomic::null(),
        }
    }
}

impl<K, V> Drop for Bucket<K, V> {
    fn drop(&mut self) {
        // Buckets are only dropped with exclusive access to their table.
        let entry = self
            .slot
            .load(Ordering::Relaxed, unsafe { crossbeam_epoch::unprotected() });
        if !entry.is_null() {
            drop(unsafe { entry.into_owned() });
        }
    }
}

/// A lock-striped slice of the table: a bucket ring, the writers' lock, the
/// displacement timestamp read by the lock-free probe, and an entry count.
pub(crate) struct Segment<K, V> {
    buckets: Box<[Bucket<K, V>]>,
    pub(crate) lock: TtasLock,
    pub(crate) timestamp: AtomicU32,
    pub(crate) len: AtomicUsize,
}

impl<K, V> Segment<K, V> {
    pub(crate) fn new(n_buckets: usize) -> Self {
        let mut buckets = Vec::with_capacity(n_buckets);
        for _ in 0..n_buckets {
            buckets.push(Bucket::new());
        }
        Self {
            buckets: buckets.into_boxed_slice(),
            lock: TtasLock::new(),
            timestamp: AtomicU32::new(0),
            len: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn mask(&self) -> usize {
        self.buckets.len() - 1
    }

    #[inline]
    pub(crate) fn bucket(&self, idx: usize) -> &Bucket<K, V> {
        &self.buckets[idx]
    }

    /// Walks the home bucket's neighborhood looking for `key`.
    ///
    /// Snapshots `hop_info` once and visits only the set bits, LSB first,
    /// wrapping the ring on every offset step. Runs with or without the
    /// segment lock: a stale set bit whose bucket has since been emptied or
    /// repurposed is simply skipped, and a stale clear bit (the entry moved
    /// after the snapshot) is the case the caller's timestamp recheck covers.
    ///
    /// Returns the matching entry and its offset from the home bucket.
    pub(crate) fn probe<'g, Q>(
        &self,
        home: usize,
        hkey: NonZeroU64,
        key: &Q,
        guard: &'g Guard,
    ) -> Option<(usize, Shared<'g, Entry<K, V>>)>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mask = self.mask();
        let mut info = self.bucket(home).hop_info.load(Ordering::Acquire);
        let mut idx = home;
        let mut offset = 0;
        while info != 0 {
            if info & 1 != 0 {
                let entry = self.bucket(idx).slot.load(Ordering::Acquire, guard);
                if let Some(e) = unsafe { entry.as_ref() } {
                    if e.hkey == hkey && e.key.borrow() == key {
                        return Some((offset, entry));
                    }
                }
            }
            info >>= 1;
            idx = (idx + 1) & mask;
            offset += 1;
        }
        None
    }

    /// Linear scan from the home bucket for an empty slot, wrapping within
    /// the ring, giving up after `add_range` positions.
    ///
    /// Returns the empty bucket's index and its distance from home.
    pub(crate) fn free_slot(
        &self,
        home: usize,
        add_range: usize,
        guard: &Guard,
    ) -> Option<(usize, usize)> {
        let mask = self.mask();
        let mut idx = home;
        for dist in 0..add_range {
            if self.bucket(idx).slot.load(Ordering::Acquire, guard).is_null() {
                return Some((idx, dist));
            }
            idx = (idx + 1) & mask;
        }
        None
    }

    /// One displacement step: moves an entry forward into the empty bucket at
    /// `free_idx` (distance `dist` from the inserter's home bucket), freeing
    /// a slot strictly closer to that home. Requires the segment lock.
    ///
    /// Scans the `hop_range - 1` buckets preceding the free slot; for each,
    /// the smallest in-range set bit `j >= 1` identifies the entry whose move
    /// makes the most progress while staying inside its own neighborhood.
    ///
    /// The swap is copy-on-move, ordered for racing readers: destination bit,
    /// then the copied entry, then the source bit, then the timestamp, and
    /// only then the emptied source slot. Until the source slot is nulled a
    /// reader holds at least one valid path to the key; a reader that finds
    /// the nulled slot is guaranteed to observe the timestamp change and
    /// retry against a fresh bitmap.
    ///
    /// Returns the new free bucket and its distance from home, or `None` when
    /// no entry can move ("stuck" — the caller resizes).
    pub(crate) fn find_closer_free_bucket(
        &self,
        free_idx: usize,
        dist: usize,
        hop_range: usize,
        guard: &Guard,
    ) -> Option<(usize, usize)>
    where
        K: Clone,
        V: Clone,
    {
        let mask = self.mask();
        let n = self.buckets.len();
        let mut check_idx = (free_idx + n - (hop_range - 1)) & mask;
        for window in (1..hop_range).rev() {
            // check_idx is window buckets behind free_idx, dist - window from home.
            let check = self.bucket(check_idx);
            let info = check.hop_info.load(Ordering::Acquire);
            // Candidate offsets are 1..window; the entry at offset 0 stays put.
            let candidates = info & ((1u32 << window) - 1) & !1;
            if candidates != 0 {
                let j = candidates.trailing_zeros() as usize;
                let moved_idx = (check_idx + j) & mask;
                let entry = self.bucket(moved_idx).slot.load(Ordering::Acquire, guard);
                debug_assert!(!entry.is_null());

                check.hop_info.fetch_or(1 << window, Ordering::Release);
                let copy = Owned::new(unsafe { entry.deref() }.clone()).into_shared(guard);
                self.bucket(free_idx).slot.store(copy, Ordering::Release);
                check.hop_info.fetch_and(!(1u32 << j), Ordering::Release);
                self.timestamp.fetch_add(1, Ordering::Release);
                self.bucket(moved_idx).slot.store(Shared::null(), Ordering::Release);
                unsafe { guard.defer_destroy(entry) };

                return Some((moved_idx, dist - window + j));
            }
            check_idx = (check_idx + 1) & mask;
        }
        None
    }

    /// Asserts the segment-local invariants on a quiescent segment: every set
    /// bit maps to an occupied bucket homed at that bit's owner, every
    /// occupied bucket sits within `hop_range` of its home with the matching
    /// bit set, and no hashed key appears twice.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self, hop_range: usize) {
        let mask = self.mask();
        let guard = crossbeam_epoch::pin();

        for home in 0..self.buckets.len() {
            let info = self.bucket(home).hop_info.load(Ordering::Acquire);
            for offset in 0..u32::BITS as usize {
                if info & (1 << offset) != 0 {
                    assert!(
                        offset < hop_range,
                        "bit {} of bucket {} exceeds the hop range",
                        offset,
                        home
                    );
                    let idx = (home + offset) & mask;
                    let entry = self.bucket(idx).slot.load(Ordering::Acquire, &guard);
                    let e = unsafe { entry.as_ref() }
                        .unwrap_or_else(|| panic!("bit {} of bucket {} points at an empty bucket", offset, home));
                    assert_eq!(
                        (e.hkey.get() as usize) & mask,
                        home,
                        "entry at bucket {} is not homed at bucket {}",
                        idx,
                        home
                    );
                }
            }
        }

        let mut hkeys = Vec::new();
        for idx in 0..self.buckets.len() {
            let entry = self.bucket(idx).slot.load(Ordering::Acquire, &guard);
            if let Some(e) = unsafe { entry.as_ref() } {
                let home = (e.hkey.get() as usize) & mask;
                let offset = (idx + self.buckets.len() - home) & mask;
                assert!(
                    offset < hop_range,
                    "entry at bucket {} lies {} past its home bucket {}",
                    idx,
                    offset,
                    home
                );
                assert!(
                    self.bucket(home).hop_info.load(Ordering::Acquire) & (1 << offset) != 0,
                    "bucket {} is missing the bit for its entry at offset {}",
                    home,
                    offset
                );
                hkeys.push(e.hkey);
            }
        }
        hkeys.sort_unstable();
        assert!(
            hkeys.windows(2).all(|pair| pair[0] != pair[1]),
            "duplicate hashed key within one segment"
        );
    }
}
