//! Entropy accumulator feeding nonces, ephemeral scalars and rescue-code seeds.
//!
//! A single running SHA-256 state is continuously mixed with OS randomness and
//! high-resolution timing jitter by a background collector thread; callers
//! squeeze bytes out of the state without ever observing it directly.

use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

struct PoolState {
    state: [u8; 32],
    squeeze_counter: u64,
}

/// Process-wide entropy pool. Cheap to clone (it's a handle around a shared,
/// mutex-guarded state); the background collector thread is spawned once per
/// pool and stops when the last handle is dropped.
#[derive(Clone)]
pub struct EntropyPool {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<PoolState>,
    bits_estimate: AtomicU64,
}

impl Default for EntropyPool {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropyPool {
    pub fn new() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let pool = EntropyPool {
            inner: Arc::new(Inner {
                state: Mutex::new(PoolState {
                    state: seed,
                    squeeze_counter: 0,
                }),
                bits_estimate: AtomicU64::new(256),
            }),
        };
        pool.spawn_collector();
        pool
    }

    /// Spawned thread holds only a `Weak` handle: once the last `EntropyPool`
    /// clone is dropped, `upgrade()` fails on the next tick and the thread
    /// exits instead of keeping `Inner` alive forever.
    fn spawn_collector(&self) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        thread::spawn(move || {
            let mut last = Instant::now();
            loop {
                thread::sleep(Duration::from_millis(50));
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let jitter = last.elapsed().as_nanos() as u64;
                last = Instant::now();
                let mut os_bytes = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut os_bytes);

                let mut guard = inner.state.lock();
                let mut hasher = Sha256::new();
                hasher.update(guard.state);
                hasher.update(os_bytes);
                hasher.update(jitter.to_le_bytes());
                guard.state = hasher.finalize().into();
                drop(guard);

                inner.bits_estimate.fetch_add(32, Ordering::Relaxed);
            }
        });
    }

    /// Returns `n` fresh bytes. Each call advances the internal state so past
    /// outputs cannot be recovered from a later one.
    pub fn bytes(&self, n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n);
        let mut guard = self.inner.state.lock();
        while out.len() < n {
            guard.squeeze_counter += 1;
            let mut hasher = Sha256::new();
            hasher.update(guard.state);
            hasher.update(guard.squeeze_counter.to_le_bytes());
            let squeezed: [u8; 32] = hasher.finalize().into();

            let mut ratchet = Sha256::new();
            ratchet.update(guard.state);
            guard.state = ratchet.finalize().into();

            let take = (n - out.len()).min(32);
            out.extend_from_slice(&squeezed[..take]);
        }
        let consumed = (out.len() as u64).saturating_mul(8);
        self.inner
            .bits_estimate
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |b| {
                Some(b.saturating_sub(consumed))
            })
            .ok();
        out
    }

    pub fn bytes32(&self) -> [u8; 32] {
        let v = self.bytes(32);
        let mut out = [0u8; 32];
        out.copy_from_slice(&v);
        out
    }

    /// Conservative lower bound on bits accumulated since the last drain.
    pub fn estimate(&self) -> u64 {
        self.inner.bits_estimate.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_not_repeated_across_calls() {
        let pool = EntropyPool::new();
        let a = pool.bytes(32);
        let b = pool.bytes(32);
        assert_ne!(a, b);
    }

    #[test]
    fn bytes32_returns_fixed_size() {
        let pool = EntropyPool::new();
        let a = pool.bytes32();
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn estimate_is_nonzero_after_seeding() {
        let pool = EntropyPool::new();
        assert!(pool.estimate() > 0);
    }

    #[test]
    fn collector_weak_handle_cannot_be_upgraded_once_the_pool_is_dropped() {
        let pool = EntropyPool::new();
        let weak = Arc::downgrade(&pool.inner);
        assert!(weak.upgrade().is_some());
        drop(pool);
        assert!(weak.upgrade().is_none());
    }
}
