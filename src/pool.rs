// Author: Lukas Bower
// Purpose: Two-tier receive buffer recycler with per-worker free lists.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::debug;

use crate::err::OutOfMemory;

/// Allocator seam used when the recycler misses. External collaborator: the
/// core only asks for correctly sized, zeroed buffers.
pub trait BufferAllocator: Send + Sync {
    /// Allocate a buffer of exactly `len` bytes.
    fn allocate_aligned(&self, len: usize) -> Result<Box<[u8]>, OutOfMemory>;
}

/// Default allocator backed by the process heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn allocate_aligned(&self, len: usize) -> Result<Box<[u8]>, OutOfMemory> {
        Ok(vec![0u8; len].into_boxed_slice())
    }
}

/// Snapshot of recycler activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounters {
    /// Buffers handed out from a worker's local list.
    pub local_hits: u64,
    /// Full-list / empty-list swaps with the global tier.
    pub swaps: u64,
    /// Acquire misses that fell through to the caller's allocator.
    pub misses: u64,
    /// Buffers dropped because a list was full or the size no longer
    /// conformed.
    pub discards: u64,
}

/// Two-tier free-buffer recycler.
///
/// Each worker (interrupt/poll context) owns a bounded local list it can use
/// without touching anyone else. The single shared lock only guards whole-list
/// swaps with the global tier: an empty local list swaps with a full global
/// one on acquire, a full local list swaps with an empty global one on
/// release. The hot path therefore takes the shared lock at most once per
/// list-length worth of operations.
#[derive(Debug)]
pub struct BufferPool {
    buf_len: usize,
    local_cap: usize,
    locals: Box<[Mutex<Vec<Box<[u8]>>>]>,
    global: Mutex<Vec<Box<[u8]>>>,
    local_hits: AtomicU64,
    swaps: AtomicU64,
    misses: AtomicU64,
    discards: AtomicU64,
}

impl BufferPool {
    /// Build a pool for `workers` contexts recycling buffers of exactly
    /// `buf_len` bytes, with at most `local_cap` buffers parked per list.
    #[must_use]
    pub fn new(workers: usize, buf_len: usize, local_cap: usize) -> Self {
        let locals = (0..workers.max(1))
            .map(|_| Mutex::new(Vec::with_capacity(local_cap)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buf_len,
            local_cap: local_cap.max(1),
            locals,
            global: Mutex::new(Vec::new()),
            local_hits: AtomicU64::new(0),
            swaps: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            discards: AtomicU64::new(0),
        }
    }

    /// Size of the buffers this pool recycles.
    #[must_use]
    pub fn buf_len(&self) -> usize {
        self.buf_len
    }

    /// Take a buffer for `worker`, trying the local list, then a single swap
    /// with a non-empty global list. `None` means the caller should fall
    /// back to a fresh allocation.
    pub fn acquire(&self, worker: usize) -> Option<Box<[u8]>> {
        let mut local = self.local(worker);
        if let Some(buf) = local.pop() {
            self.local_hits.fetch_add(1, Ordering::Relaxed);
            return Some(buf);
        }

        // Local list is dry: one swap with the global tier, never a scan.
        {
            let mut global = self.lock_global();
            if !global.is_empty() {
                std::mem::swap(&mut *local, &mut *global);
                self.swaps.fetch_add(1, Ordering::Relaxed);
            }
        }
        if let Some(buf) = local.pop() {
            self.local_hits.fetch_add(1, Ordering::Relaxed);
            return Some(buf);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Return a buffer to `worker`'s list. Non-conforming sizes are dropped:
    /// a buffer that shrank or grew in someone else's hands must not re-enter
    /// the receive ring.
    pub fn release(&self, worker: usize, buf: Box<[u8]>) {
        if buf.len() != self.buf_len {
            debug!(
                "pool: dropping non-conforming buffer ({} != {})",
                buf.len(),
                self.buf_len
            );
            self.discards.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut local = self.local(worker);
        if local.len() < self.local_cap {
            local.push(buf);
            return;
        }

        // Local list is full: swap it with an empty global list, otherwise
        // let the buffer go.
        let mut global = self.lock_global();
        if global.is_empty() {
            std::mem::swap(&mut *local, &mut *global);
            self.swaps.fetch_add(1, Ordering::Relaxed);
            drop(global);
            local.push(buf);
        } else {
            drop(global);
            self.discards.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Total buffers currently parked across every list.
    #[must_use]
    pub fn parked(&self) -> usize {
        let local: usize = self.locals.iter().map(|l| self.guard(l).len()).sum();
        local + self.lock_global().len()
    }

    /// Activity counters.
    #[must_use]
    pub fn counters(&self) -> PoolCounters {
        PoolCounters {
            local_hits: self.local_hits.load(Ordering::Relaxed),
            swaps: self.swaps.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
        }
    }

    fn local(&self, worker: usize) -> std::sync::MutexGuard<'_, Vec<Box<[u8]>>> {
        let idx = worker % self.locals.len();
        self.guard(&self.locals[idx])
    }

    fn lock_global(&self) -> std::sync::MutexGuard<'_, Vec<Box<[u8]>>> {
        self.guard(&self.global)
    }

    fn guard<'a>(
        &self,
        m: &'a Mutex<Vec<Box<[u8]>>>,
    ) -> std::sync::MutexGuard<'a, Vec<Box<[u8]>>> {
        m.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(len: usize) -> Box<[u8]> {
        vec![0u8; len].into_boxed_slice()
    }

    #[test]
    fn acquire_prefers_local_then_global() {
        let pool = BufferPool::new(2, 64, 4);
        assert!(pool.acquire(0).is_none(), "empty pool must miss");

        pool.release(0, buf(64));
        assert!(pool.acquire(0).is_some());
        assert_eq!(pool.counters().local_hits, 1);

        // Fill worker 1's list past capacity so the surplus swaps into the
        // global tier, then drain it from worker 0.
        for _ in 0..5 {
            pool.release(1, buf(64));
        }
        assert!(pool.counters().swaps >= 1);
        assert!(pool.acquire(0).is_some(), "global tier should backfill");
    }

    #[test]
    fn non_conforming_buffers_are_dropped() {
        let pool = BufferPool::new(1, 64, 4);
        pool.release(0, buf(32));
        pool.release(0, buf(128));
        assert_eq!(pool.counters().discards, 2);
        assert_eq!(pool.parked(), 0);
    }

    #[test]
    fn conservation_under_mixed_traffic() {
        let pool = BufferPool::new(2, 64, 3);
        let mut in_flight = Vec::new();
        let mut created = 0usize;
        let mut dropped_by_pool;

        for round in 0..200 {
            let worker = round % 2;
            if round % 3 == 0 {
                let b = pool.acquire(worker).unwrap_or_else(|| {
                    created += 1;
                    buf(64)
                });
                in_flight.push(b);
            } else if let Some(b) = in_flight.pop() {
                pool.release(worker, b);
            }
            dropped_by_pool = pool.counters().discards as usize;
            // Buffers are never duplicated: everything created is either
            // in flight, parked, or was explicitly discarded.
            assert_eq!(created, in_flight.len() + pool.parked() + dropped_by_pool);
        }
    }

    #[test]
    fn release_overflow_swaps_once_then_discards() {
        let pool = BufferPool::new(1, 64, 2);
        // 2 fill the local list, the 3rd swaps lists and lands in the fresh
        // local list, the 4th fills it, the 5th finds both tiers full and is
        // discarded.
        for _ in 0..5 {
            pool.release(0, buf(64));
        }
        assert_eq!(pool.counters().swaps, 1);
        assert_eq!(pool.counters().discards, 1);
        assert_eq!(pool.parked(), 4);
    }
}
