// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! This module implements a donation-based page pool for memory owned by the
//! hypervisor.
//!
//! Pages enter the pool when the host donates them through a [`HypMemcache`]
//! ([`HypPool::refill`]) and leave it when the pool gives them back
//! ([`HypPool::reclaim`]). In between, hypervisor subsystems allocate
//! power-of-two blocks with [`HypPool::alloc_pages`] and return them with
//! [`HypPool::put_pages`].

#![forbid(unsafe_code)]

pub mod alloc_mgt;
pub mod memcache;
pub mod req;

pub use memcache::HostPageAllocator;
pub use memcache::HypMemcache;
pub use memcache::MemcacheBlock;

use bitfield_struct::bitfield;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

/// Log2 of the base page size.
pub const PAGE_SHIFT: u32 = 12;
/// The base page size.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
/// The largest block order the pool will track or hand out.
pub const HYP_MAX_ORDER: u8 = 10;

/// Returns the smallest order whose block covers `size` bytes.
pub fn get_order(size: u64) -> u8 {
    let pages = size.div_ceil(PAGE_SIZE).max(1);
    pages.next_power_of_two().trailing_zeros() as u8
}

/// Errors returned by pool operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No free block of the requested order is available.
    #[error("no free block of order {order} in the pool")]
    OutOfMemory {
        /// The order of the failed allocation.
        order: u8,
    },
    /// The requested order is larger than [`HYP_MAX_ORDER`].
    #[error("order {0} exceeds the maximum pool order")]
    InvalidOrder(u8),
    /// Changing the cacheability of an allocation failed.
    #[error("failed to remap {nr_pages} pages at pfn {pfn:#x}")]
    Remap {
        /// The first page of the range.
        pfn: u64,
        /// The number of pages in the range.
        nr_pages: u64,
        /// The error reported by the remap primitive.
        #[source]
        source: RemapError,
    },
    /// The block being released was not allocated from this pool.
    #[error("block at pfn {pfn:#x} order {order} was not allocated from this pool")]
    NotAllocated {
        /// The first page of the block.
        pfn: u64,
        /// The order of the block.
        order: u8,
    },
    /// A donated block is misaligned or extends past the physical address
    /// space.
    #[error("donated block at pfn {pfn:#x} order {order} is malformed")]
    InvalidDonation {
        /// The first page of the block.
        pfn: u64,
        /// The order of the block.
        order: u8,
    },
    /// A donated block overlaps pages the pool already owns, or another block
    /// in the same donation.
    #[error("donated block at pfn {pfn:#x} order {order} overlaps pool pages")]
    OverlappingDonation {
        /// The first page of the block.
        pfn: u64,
        /// The order of the block.
        order: u8,
    },
    /// The host could not provide pages for a memcache top-up.
    #[error("host allocator has no free block of order {order}")]
    HostOutOfMemory {
        /// The order of the failed host allocation.
        order: u8,
    },
    /// No allocator is configured behind this pool.
    #[error("no allocator is configured for this pool")]
    NotConfigured,
}

impl Error {
    /// The negative errno reported across the hypercall boundary.
    pub fn errno(&self) -> i32 {
        -match self {
            Error::OutOfMemory { .. } | Error::HostOutOfMemory { .. } => libc::ENOMEM,
            Error::Remap { source, .. } => return source.0,
            Error::InvalidOrder(_)
            | Error::NotAllocated { .. }
            | Error::InvalidDonation { .. }
            | Error::NotConfigured => libc::EINVAL,
            Error::OverlappingDonation { .. } => libc::EPERM,
        }
    }
}

/// Error returned by a [`RemapRange`] implementation, carrying its negative
/// errno.
#[derive(Debug, Error)]
#[error("remap failed with error {0}")]
pub struct RemapError(pub i32);

/// Changes the cacheability of the hypervisor's mapping of a page range.
///
/// Implementations are called with the pool lock held and must not call back
/// into the pool.
pub trait RemapRange: Send + Sync {
    /// Remaps `nr_pages` pages starting at `pfn`, non-cacheable if
    /// `non_cacheable` is set and cacheable otherwise.
    fn remap_range(&self, pfn: u64, nr_pages: u64, non_cacheable: bool) -> Result<(), RemapError>;
}

/// Attributes requested for a pool allocation.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageFlags {
    /// Map the block non-cacheable before handing it out.
    pub nocache: bool,
    #[bits(31)]
    _reserved: u32,
}

/// A block of `2^order` pages allocated from a [`HypPool`].
///
/// The holder owns the pages until the block is passed back to
/// [`HypPool::put_pages`].
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct PageBlock {
    pfn: u64,
    order: u8,
}

impl PageBlock {
    /// The first page of the block.
    pub fn pfn(&self) -> u64 {
        self.pfn
    }

    /// The order of the block.
    pub fn order(&self) -> u8 {
        self.order
    }

    /// The number of base pages in the block.
    pub fn nr_pages(&self) -> u64 {
        1 << self.order
    }

    /// The physical address of the first page.
    pub fn phys_addr(&self) -> u64 {
        self.pfn << PAGE_SHIFT
    }
}

#[derive(Debug, Default)]
struct PoolState {
    /// Free blocks by order, keyed by their first pfn.
    free_area: [BTreeSet<u64>; HYP_MAX_ORDER as usize + 1],
    /// Every base page owned by the pool, free or allocated.
    owned: BTreeSet<u64>,
    /// Outstanding allocations, first pfn to order.
    allocated: BTreeMap<u64, u8>,
    free_pages: u64,
}

impl PoolState {
    /// Takes a free block of `order`, splitting the smallest larger block if
    /// needed.
    fn take_block(&mut self, order: u8) -> Option<u64> {
        let from = (order..=HYP_MAX_ORDER).find(|&o| !self.free_area[o as usize].is_empty())?;
        let pfn = self.free_area[from as usize].pop_first()?;
        let mut split = from;
        while split > order {
            split -= 1;
            self.free_area[split as usize].insert(pfn + (1 << split));
        }
        self.free_pages -= 1 << order;
        Some(pfn)
    }

    /// Returns a block to the free lists, merging it with free buddies.
    fn free_block(&mut self, mut pfn: u64, mut order: u8) {
        self.free_pages += 1 << order;
        while order < HYP_MAX_ORDER {
            let buddy = pfn ^ (1 << order);
            if !self.free_area[order as usize].remove(&buddy) {
                break;
            }
            pfn = pfn.min(buddy);
            order += 1;
        }
        self.free_area[order as usize].insert(pfn);
    }

    fn allocated_pages(&self) -> u64 {
        self.allocated.values().map(|&order| 1u64 << order).sum()
    }
}

/// A pool of pages donated by the host.
///
/// Every operation serializes on a single pool lock, so refill and reclaim
/// are atomic with respect to allocation and release.
pub struct HypPool {
    state: Mutex<PoolState>,
    remap: Arc<dyn RemapRange>,
}

impl Debug for HypPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("HypPool")
            .field("free_pages", &state.free_pages)
            .field("owned_pages", &state.owned.len())
            .field("allocations", &state.allocated.len())
            .finish()
    }
}

impl HypPool {
    /// Returns a new, empty pool that uses `remap` to change the cacheability
    /// of its pages.
    pub fn new(remap: Arc<dyn RemapRange>) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            remap,
        }
    }

    /// Allocates a block of `2^order` pages.
    ///
    /// If `flags` requests a non-cacheable mapping, the block is remapped
    /// before it is returned. A remap failure returns the block to the pool
    /// and fails the allocation.
    pub fn alloc_pages(&self, order: u8, flags: PageFlags) -> Result<PageBlock, Error> {
        if order > HYP_MAX_ORDER {
            return Err(Error::InvalidOrder(order));
        }

        let mut state = self.state.lock();
        let pfn = state
            .take_block(order)
            .ok_or(Error::OutOfMemory { order })?;

        let block = PageBlock { pfn, order };
        if flags.nocache() {
            if let Err(source) = self.remap.remap_range(pfn, block.nr_pages(), true) {
                state.free_block(pfn, order);
                return Err(Error::Remap {
                    pfn,
                    nr_pages: block.nr_pages(),
                    source,
                });
            }
        }

        state.allocated.insert(pfn, order);
        tracing::trace!(pfn, order, nocache = flags.nocache(), "pool allocation");
        Ok(block)
    }

    /// Returns `block` to the pool.
    ///
    /// The block is always remapped cacheable first. A remap failure is
    /// logged and the pages are freed regardless.
    pub fn put_pages(&self, block: PageBlock) -> Result<(), Error> {
        let PageBlock { pfn, order } = block;
        let mut state = self.state.lock();
        if state.allocated.get(&pfn) != Some(&order) {
            return Err(Error::NotAllocated { pfn, order });
        }

        if let Err(err) = self.remap.remap_range(pfn, 1 << order, false) {
            tracing::warn!(
                pfn,
                order,
                error = &err as &dyn std::error::Error,
                "failed to restore cacheable mapping on release"
            );
        }

        state.allocated.remove(&pfn);
        state.free_block(pfn, order);
        tracing::trace!(pfn, order, "pool release");
        Ok(())
    }

    /// Moves every block in `mc` into the pool, returning the number of pages
    /// admitted.
    ///
    /// The whole donation is validated first. If any block is malformed or
    /// overlaps pages the pool already owns, nothing is admitted and `mc` is
    /// left untouched.
    pub fn refill(&self, mc: &mut HypMemcache) -> Result<u64, Error> {
        let mut state = self.state.lock();

        let mut incoming = BTreeSet::new();
        for block in mc.blocks() {
            let &MemcacheBlock { pfn, order } = block;
            if order > HYP_MAX_ORDER {
                return Err(Error::InvalidOrder(order));
            }
            let end = pfn
                .checked_add(1 << order)
                .filter(|_| pfn & ((1 << order) - 1) == 0)
                .ok_or(Error::InvalidDonation { pfn, order })?;
            if state.owned.range(pfn..end).next().is_some()
                || incoming.range(pfn..end).next().is_some()
            {
                return Err(Error::OverlappingDonation { pfn, order });
            }
            incoming.extend(pfn..end);
        }

        let mut admitted = 0;
        while let Some(MemcacheBlock { pfn, order }) = mc.pop() {
            state.owned.extend(pfn..pfn + (1 << order));
            state.free_block(pfn, order);
            admitted += 1 << order;
        }

        tracing::debug!(admitted, free_pages = state.free_pages, "pool refilled");
        Ok(admitted)
    }

    /// Hands free pages back to the host through `mc` until only `target`
    /// free pages remain, returning the number of pages reclaimed.
    ///
    /// Pages are handed back one at a time, each remapped cacheable. Remap
    /// failures are logged and do not stop the reclaim.
    pub fn reclaim(&self, mc: &mut HypMemcache, target: u64) -> u64 {
        let mut state = self.state.lock();
        let mut reclaimed = 0;
        while state.free_pages > target {
            let Some(pfn) = state.take_block(0) else {
                break;
            };
            state.owned.remove(&pfn);
            if let Err(err) = self.remap.remap_range(pfn, 1, false) {
                tracing::warn!(
                    pfn,
                    error = &err as &dyn std::error::Error,
                    "failed to restore cacheable mapping on reclaim"
                );
            }
            mc.push(pfn, 0);
            reclaimed += 1;
        }

        tracing::debug!(reclaimed, target, "pool reclaimed");
        reclaimed
    }

    /// The number of free pages, all of which could be reclaimed.
    pub fn free_pages(&self) -> u64 {
        self.state.lock().free_pages
    }

    /// The number of pages held by outstanding allocations.
    pub fn allocated_pages(&self) -> u64 {
        self.state.lock().allocated_pages()
    }

    /// The number of pages currently owned by the pool.
    pub fn total_pages(&self) -> u64 {
        self.state.lock().owned.len() as u64
    }
}


#[cfg(test)]
mod tests {
    use super::test_helpers::RecordingRemap;
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use test_with_tracing::test;

    fn pool_with(remap: &Arc<RecordingRemap>, blocks: &[(u64, u8)]) -> HypPool {
        let pool = HypPool::new(remap.clone());
        let mut mc = HypMemcache::new();
        for &(pfn, order) in blocks {
            mc.push(pfn, order);
        }
        pool.refill(&mut mc).unwrap();
        assert!(mc.is_empty());
        pool
    }

    fn assert_conserved(pool: &HypPool) {
        let state = pool.state.lock();
        assert_eq!(
            state.free_pages + state.allocated_pages(),
            state.owned.len() as u64
        );
    }

    #[test]
    fn test_get_order() {
        assert_eq!(get_order(1), 0);
        assert_eq!(get_order(PAGE_SIZE), 0);
        assert_eq!(get_order(PAGE_SIZE + 1), 1);
        assert_eq!(get_order(4 * PAGE_SIZE), 2);
        assert_eq!(get_order(5 * PAGE_SIZE), 3);
    }

    #[test]
    fn test_exhaust_order_zero() {
        let remap = Arc::new(RecordingRemap::default());
        let blocks: Vec<_> = (0..10).map(|i| (0x1000 + i * 2, 0)).collect();
        let pool = pool_with(&remap, &blocks);
        assert_eq!(pool.free_pages(), 10);

        let mut held = Vec::new();
        for _ in 0..10 {
            held.push(pool.alloc_pages(0, PageFlags::new()).unwrap());
        }
        assert!(matches!(
            pool.alloc_pages(0, PageFlags::new()),
            Err(Error::OutOfMemory { order: 0 })
        ));
        assert_eq!(pool.free_pages(), 0);
        assert_conserved(&pool);

        for block in held {
            pool.put_pages(block).unwrap();
        }
        assert_eq!(pool.free_pages(), 10);
    }

    #[test]
    fn test_split_and_coalesce() {
        let remap = Arc::new(RecordingRemap::default());
        let pool = pool_with(&remap, &[(0x100, 2)]);

        let blocks: Vec<_> = (0..4)
            .map(|_| pool.alloc_pages(0, PageFlags::new()).unwrap())
            .collect();
        let mut pfns: Vec<_> = blocks.iter().map(|b| b.pfn()).collect();
        pfns.sort();
        assert_eq!(pfns, [0x100, 0x101, 0x102, 0x103]);
        assert!(pool.alloc_pages(0, PageFlags::new()).is_err());

        for block in blocks {
            pool.put_pages(block).unwrap();
        }

        let whole = pool.alloc_pages(2, PageFlags::new()).unwrap();
        assert_eq!(whole.pfn(), 0x100);
        assert_eq!(whole.nr_pages(), 4);
        assert_eq!(whole.phys_addr(), 0x100 << PAGE_SHIFT);
    }

    #[test]
    fn test_adjacent_donations_merge() {
        let remap = Arc::new(RecordingRemap::default());
        let pool = pool_with(&remap, &[(0x200, 0), (0x201, 0), (0x202, 1)]);

        let block = pool.alloc_pages(2, PageFlags::new()).unwrap();
        assert_eq!(block.pfn(), 0x200);
        assert_eq!(pool.free_pages(), 0);
    }

    #[test]
    fn test_invalid_order() {
        let pool = HypPool::new(Arc::new(RecordingRemap::default()));
        assert!(matches!(
            pool.alloc_pages(HYP_MAX_ORDER + 1, PageFlags::new()),
            Err(Error::InvalidOrder(_))
        ));
    }

    #[test]
    fn test_nocache_remap() {
        let remap = Arc::new(RecordingRemap::default());
        let pool = pool_with(&remap, &[(0x400, 1)]);

        let block = pool
            .alloc_pages(1, PageFlags::new().with_nocache(true))
            .unwrap();
        assert_eq!(*remap.calls.lock(), [(0x400, 2, true)]);

        pool.put_pages(block).unwrap();
        assert_eq!(*remap.calls.lock(), [(0x400, 2, true), (0x400, 2, false)]);
    }

    #[test]
    fn test_nocache_remap_failure_undoes_allocation() {
        let remap = Arc::new(RecordingRemap::default());
        let pool = pool_with(&remap, &[(0x400, 1)]);
        remap.fail.store(true, Ordering::Relaxed);

        let err = pool
            .alloc_pages(1, PageFlags::new().with_nocache(true))
            .unwrap_err();
        assert!(matches!(err, Error::Remap { pfn: 0x400, .. }));
        assert_eq!(err.errno(), -libc::EFAULT);
        assert_eq!(pool.free_pages(), 2);
        assert_eq!(pool.allocated_pages(), 0);
    }

    #[test]
    fn test_release_ignores_remap_failure() {
        let remap = Arc::new(RecordingRemap::default());
        let pool = pool_with(&remap, &[(0x400, 0)]);
        let block = pool.alloc_pages(0, PageFlags::new()).unwrap();

        remap.fail.store(true, Ordering::Relaxed);
        pool.put_pages(block).unwrap();
        assert_eq!(pool.free_pages(), 1);
    }

    #[test]
    fn test_release_foreign_block() {
        let remap = Arc::new(RecordingRemap::default());
        let pool = pool_with(&remap, &[(0x400, 0)]);
        let other = pool_with(&remap, &[(0x800, 0)]);

        let block = other.alloc_pages(0, PageFlags::new()).unwrap();
        assert!(matches!(
            pool.put_pages(block),
            Err(Error::NotAllocated { pfn: 0x800, order: 0 })
        ));
        assert_eq!(pool.free_pages(), 1);
        assert_conserved(&pool);
    }

    #[test]
    fn test_refill_rejects_bad_donation() {
        let remap = Arc::new(RecordingRemap::default());
        let pool = pool_with(&remap, &[(0x100, 0)]);

        // Misaligned for its order.
        let mut mc = HypMemcache::new();
        mc.push(0x200, 0);
        mc.push(0x301, 1);
        assert!(matches!(
            pool.refill(&mut mc),
            Err(Error::InvalidDonation { pfn: 0x301, order: 1 })
        ));
        assert_eq!(mc.len(), 2);
        assert_eq!(pool.total_pages(), 1);

        // Already owned by the pool.
        let mut mc = HypMemcache::new();
        mc.push(0x200, 0);
        mc.push(0x100, 0);
        assert!(matches!(
            pool.refill(&mut mc),
            Err(Error::OverlappingDonation { pfn: 0x100, .. })
        ));
        assert_eq!(mc.len(), 2);

        // Overlapping within the same donation.
        let mut mc = HypMemcache::new();
        mc.push(0x200, 2);
        mc.push(0x202, 0);
        assert!(pool.refill(&mut mc).is_err());

        // Past the end of the physical address space.
        let mut mc = HypMemcache::new();
        mc.push(u64::MAX, 0);
        assert!(pool.refill(&mut mc).is_err());

        assert_eq!(pool.total_pages(), 1);
        assert_eq!(pool.free_pages(), 1);
    }

    #[test]
    fn test_refill_rejects_allocated_pages() {
        let remap = Arc::new(RecordingRemap::default());
        let pool = pool_with(&remap, &[(0x100, 0)]);
        let _block = pool.alloc_pages(0, PageFlags::new()).unwrap();

        let mut mc = HypMemcache::new();
        mc.push(0x100, 0);
        assert!(pool.refill(&mut mc).is_err());
        assert_eq!(pool.total_pages(), 1);
    }

    #[test]
    fn test_reclaim_to_target() {
        let remap = Arc::new(RecordingRemap::default());
        let blocks: Vec<_> = (0..20).map(|i| (0x1000 + i * 4, 0)).collect();
        let pool = pool_with(&remap, &blocks);

        let mut mc = HypMemcache::new();
        assert_eq!(pool.reclaim(&mut mc, 5), 15);
        assert_eq!(pool.free_pages(), 5);
        assert_eq!(pool.total_pages(), 5);
        assert_eq!(mc.len(), 15);
        assert_eq!(mc.nr_pages(), 15);

        let calls = remap.calls.lock();
        assert_eq!(calls.len(), 15);
        assert!(calls.iter().all(|&(_, n, nc)| n == 1 && !nc));
        for block in mc.blocks() {
            assert!(calls.iter().any(|&(pfn, ..)| pfn == block.pfn));
        }
    }

    #[test]
    fn test_reclaim_splits_blocks() {
        let remap = Arc::new(RecordingRemap::default());
        let pool = pool_with(&remap, &[(0x800, 3)]);

        let mut mc = HypMemcache::new();
        assert_eq!(pool.reclaim(&mut mc, 3), 5);
        assert_eq!(pool.free_pages(), 3);
        assert!(mc.blocks().iter().all(|b| b.order == 0));

        // Reclaimed pages may be donated again.
        pool.refill(&mut mc).unwrap();
        assert_eq!(pool.free_pages(), 8);
        assert!(pool.alloc_pages(3, PageFlags::new()).is_ok());
    }

    #[test]
    fn test_reclaim_below_free_is_noop() {
        let remap = Arc::new(RecordingRemap::default());
        let pool = pool_with(&remap, &[(0x10, 1)]);
        let mut mc = HypMemcache::new();
        assert_eq!(pool.reclaim(&mut mc, 5), 0);
        assert!(mc.is_empty());
        assert_eq!(pool.free_pages(), 2);
    }

    #[test]
    fn test_conservation() {
        let remap = Arc::new(RecordingRemap::default());
        let pool = pool_with(&remap, &[(0x0, 4), (0x40, 2), (0x81, 0)]);
        let mut held = Vec::new();

        for step in 0..64u64 {
            match step % 5 {
                0 | 1 | 3 => {
                    if let Ok(block) = pool.alloc_pages((step % 3) as u8, PageFlags::new()) {
                        held.push(block);
                    }
                }
                2 => {
                    if !held.is_empty() {
                        let block = held.swap_remove((step as usize) % held.len());
                        pool.put_pages(block).unwrap();
                    }
                }
                _ => {
                    let mut mc = HypMemcache::new();
                    let target = pool.free_pages() / 2;
                    pool.reclaim(&mut mc, target);
                    pool.refill(&mut mc).unwrap();
                }
            }
            assert_conserved(&pool);
        }

        for block in held {
            pool.put_pages(block).unwrap();
        }
        assert_eq!(pool.free_pages(), pool.total_pages());
        assert_eq!(pool.total_pages(), 16 + 4 + 1);
    }

    struct Finished<'a>(&'a AtomicUsize);

    impl Drop for Finished<'_> {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Release);
        }
    }

    #[test]
    fn test_concurrent_alloc_refill_reclaim() {
        const WORKERS: usize = 4;
        let remap = Arc::new(RecordingRemap::default());
        let pool = pool_with(&remap, &[(0x0, 6), (0x40, 6)]);
        // Every base page currently handed to a holder.
        let held_pages = Mutex::new(BTreeSet::new());
        let finished = AtomicUsize::new(0);
        let barrier = Barrier::new(WORKERS + 1);

        std::thread::scope(|s| {
            for worker in 0..WORKERS {
                let (pool, held_pages, barrier, finished) =
                    (&pool, &held_pages, &barrier, &finished);
                s.spawn(move || {
                    // Counts the worker as finished even if it panics.
                    let _finished = Finished(finished);
                    barrier.wait();
                    let mut held = Vec::new();
                    for step in 0..500usize {
                        let order = ((step + worker) % 3) as u8;
                        let flags = PageFlags::new().with_nocache(step % 2 == 0);
                        if let Ok(block) = pool.alloc_pages(order, flags) {
                            let mut pages = held_pages.lock();
                            for pfn in block.pfn()..block.pfn() + block.nr_pages() {
                                assert!(pages.insert(pfn), "pfn {pfn:#x} handed out twice");
                            }
                            drop(pages);
                            held.push(block);
                        }
                        if held.len() > 4 || step % 7 == 0 {
                            if let Some(block) = held.pop() {
                                let mut pages = held_pages.lock();
                                for pfn in block.pfn()..block.pfn() + block.nr_pages() {
                                    assert!(pages.remove(&pfn));
                                }
                                drop(pages);
                                pool.put_pages(block).unwrap();
                            }
                        }
                    }
                    for block in held {
                        let mut pages = held_pages.lock();
                        for pfn in block.pfn()..block.pfn() + block.nr_pages() {
                            assert!(pages.remove(&pfn));
                        }
                        drop(pages);
                        pool.put_pages(block).unwrap();
                    }
                });
            }

            let (pool, held_pages, barrier, finished) = (&pool, &held_pages, &barrier, &finished);
            s.spawn(move || {
                barrier.wait();
                while finished.load(Ordering::Acquire) < WORKERS {
                    let mut mc = HypMemcache::new();
                    let reclaimed = pool.reclaim(&mut mc, 8);
                    assert_eq!(mc.nr_pages(), reclaimed);
                    for block in mc.blocks() {
                        assert!(!held_pages.lock().contains(&block.pfn));
                    }
                    assert_eq!(pool.refill(&mut mc).unwrap(), reclaimed);
                    assert!(mc.is_empty());
                    assert_conserved(pool);
                    std::thread::yield_now();
                }
            });
        });

        assert!(held_pages.lock().is_empty());
        assert_eq!(pool.allocated_pages(), 0);
        assert_eq!(pool.free_pages(), pool.total_pages());
        assert_eq!(pool.total_pages(), 128);
        assert_conserved(&pool);
    }
}
