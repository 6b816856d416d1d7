// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The memory cache used to pass pages between the host and the hypervisor.

use crate::Error;

/// A block of `2^order` pages held by a [`HypMemcache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemcacheBlock {
    /// The first page of the block.
    pub pfn: u64,
    /// The order of the block.
    pub order: u8,
}

/// Host-side page allocator used to fill and drain a [`HypMemcache`].
pub trait HostPageAllocator: Send + Sync {
    /// Allocates a naturally aligned block of `2^order` pages, returning its
    /// first pfn.
    fn alloc_pages(&self, order: u8) -> Option<u64>;
    /// Frees a block previously returned by [`Self::alloc_pages`] or handed
    /// back by the hypervisor.
    fn free_pages(&self, pfn: u64, order: u8);
}

/// A list of page blocks in transit between the host and a pool.
#[derive(Debug, Default)]
pub struct HypMemcache {
    blocks: Vec<MemcacheBlock>,
}

impl HypMemcache {
    /// Returns an empty memcache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a block to the cache.
    pub fn push(&mut self, pfn: u64, order: u8) {
        self.blocks.push(MemcacheBlock { pfn, order });
    }

    /// Removes the most recently pushed block.
    pub fn pop(&mut self) -> Option<MemcacheBlock> {
        self.blocks.pop()
    }

    /// The blocks currently in the cache.
    pub fn blocks(&self) -> &[MemcacheBlock] {
        &self.blocks
    }

    /// The number of blocks in the cache.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns true if the cache holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// The number of base pages across all blocks.
    pub fn nr_pages(&self) -> u64 {
        self.blocks.iter().map(|b| 1u64 << b.order).sum()
    }

    /// Fills the cache from `alloc` with blocks of `order` until it holds at
    /// least `min_pages` base pages.
    ///
    /// Blocks allocated before a failure stay in the cache; the caller decides
    /// whether to [`free`](Self::free) them.
    pub fn topup(
        &mut self,
        min_pages: u64,
        order: u8,
        alloc: &dyn HostPageAllocator,
    ) -> Result<(), Error> {
        while self.nr_pages() < min_pages {
            let pfn = alloc
                .alloc_pages(order)
                .ok_or(Error::HostOutOfMemory { order })?;
            self.push(pfn, order);
        }
        Ok(())
    }

    /// Returns every block in the cache to `alloc`.
    pub fn free(&mut self, alloc: &dyn HostPageAllocator) {
        while let Some(MemcacheBlock { pfn, order }) = self.pop() {
            alloc.free_pages(pfn, order);
        }
    }
}
