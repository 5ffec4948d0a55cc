//! A raw test-and-test-and-set spinlock that can live inside
//! `#[repr(C)]` metadata embedded in area memory.  Allocators hold it
//! only for the duration of a bit scan or a bump, never across
//! blocking operations.
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

#[repr(C)]
pub(crate) struct SpinLock {
    state: AtomicU32,
}

pub(crate) struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    /// Spins until the lock is acquired.
    #[inline]
    pub fn lock(&self) -> SpinGuard {
        loop {
            if self
                .state
                .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinGuard { lock: self };
            }

            // Spin on a plain load until the lock looks free.
            while self.state.load(Ordering::Relaxed) == LOCKED {
                std::hint::spin_loop();
            }
        }
    }
}

impl Drop for SpinGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.state.store(UNLOCKED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::SpinLock;
    use std::sync::Arc;

    #[test]
    fn smoke_test() {
        let lock = SpinLock::new();

        let _guard = lock.lock();
    }

    // Hammer a shared counter from a few threads; the final count must
    // equal the number of increments.
    #[test]
    fn counter_test() {
        const THREADS: usize = 4;
        const ITERATIONS: usize = 10_000;

        struct Shared {
            lock: SpinLock,
            counter: std::cell::UnsafeCell<usize>,
        }

        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            lock: SpinLock::new(),
            counter: std::cell::UnsafeCell::new(0),
        });

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    for _ in 0..ITERATIONS {
                        let _guard = shared.lock.lock();
                        unsafe { *shared.counter.get() += 1 };
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("thread should not panic");
        }

        let _guard = shared.lock.lock();
        assert_eq!(unsafe { *shared.counter.get() }, THREADS * ITERATIONS);
    }
}
