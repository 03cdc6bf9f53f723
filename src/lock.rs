//! TTAS (Test-Test-And-Set) segment lock

use std::hint::spin_loop;
use std::sync::atomic::{AtomicBool, Ordering};

/// A raw TTAS spinlock.
///
/// Unlike a data-carrying mutex this guards no memory directly: the bucket
/// ring it protects must stay readable by the lock-free probe, so the lock is
/// only the writers' mutual-exclusion token.
pub(crate) struct TtasLock {
    acquired: AtomicBool,
}

impl TtasLock {
    pub(crate) const fn new() -> Self {
        Self {
            acquired: AtomicBool::new(false),
        }
    }

    /// Acquire the lock
    #[inline]
    pub(crate) fn lock(&self) -> TtasGuard<'_> {
        loop {
            // Test phase: spin on relaxed load (stays in cache)
            while self.acquired.load(Ordering::Relaxed) {
                spin_loop();
            }
            // Test-and-set phase: attempt to acquire
            if !self.acquired.swap(true, Ordering::Acquire) {
                return TtasGuard { lock: self };
            }
        }
    }
}

/// RAII guard for the TTAS. Releases the lock on drop.
pub(crate) struct TtasGuard<'a> {
    lock: &'a TtasLock,
}

impl Drop for TtasGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.acquired.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn mutual_exclusion() {
        let lock = Arc::new(TtasLock::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..4 {
            let lock = lock.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    let _guard = lock.lock();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::Relaxed), 40_000);
    }
}
