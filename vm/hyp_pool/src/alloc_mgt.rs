// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Generic front-end for the hypervisor's donation-backed allocators.
//!
//! The host drives every allocator through the same three operations without
//! knowing which subsystem sits behind an id.

use crate::HypMemcache;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

/// Operations an allocator exposes to the management front-end.
pub trait HypMgtAllocatorOps: Send + Sync {
    /// Admits the pages in `mc` into the allocator.
    fn refill(&self, mc: &mut HypMemcache) -> Result<(), crate::Error>;
    /// Hands free pages back through `mc` until `target` free pages remain.
    fn reclaim(&self, mc: &mut HypMemcache, target: u64);
    /// The number of pages that [`Self::reclaim`] could hand back.
    fn reclaimable(&self) -> u64;
}

/// Identifies an allocator behind the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypAllocMgtId {
    /// The hypervisor heap.
    Heap = 0,
    /// The IOMMU page pool.
    Iommu = 1,
}

const HYP_ALLOC_MGT_IDS: usize = 2;

/// Errors returned by the front-end.
#[derive(Debug, Error)]
pub enum Error {
    /// Nothing is registered under the id.
    #[error("no allocator registered for {0:?}")]
    NotRegistered(HypAllocMgtId),
    /// Something is already registered under the id.
    #[error("an allocator is already registered for {0:?}")]
    AlreadyRegistered(HypAllocMgtId),
    /// The allocator rejected the refill.
    #[error("refill of {id:?} failed")]
    Refill {
        /// The allocator that failed.
        id: HypAllocMgtId,
        /// The allocator's error.
        #[source]
        source: crate::Error,
    },
}

/// Dispatches refill and reclaim to registered allocators.
#[derive(Default)]
pub struct HypAllocMgt {
    allocators: [Option<Arc<dyn HypMgtAllocatorOps>>; HYP_ALLOC_MGT_IDS],
}

impl Debug for HypAllocMgt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HypAllocMgt")
            .field(
                "registered",
                &self
                    .allocators
                    .iter()
                    .map(Option::is_some)
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl HypAllocMgt {
    /// Returns a front-end with no registered allocators.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `ops` under `id`.
    pub fn register(
        &mut self,
        id: HypAllocMgtId,
        ops: Arc<dyn HypMgtAllocatorOps>,
    ) -> Result<(), Error> {
        let slot = &mut self.allocators[id as usize];
        if slot.is_some() {
            return Err(Error::AlreadyRegistered(id));
        }
        *slot = Some(ops);
        Ok(())
    }

    fn get(&self, id: HypAllocMgtId) -> Result<&dyn HypMgtAllocatorOps, Error> {
        self.allocators[id as usize]
            .as_deref()
            .ok_or(Error::NotRegistered(id))
    }

    /// Refills the allocator registered under `id` from `mc`.
    pub fn refill(&self, id: HypAllocMgtId, mc: &mut HypMemcache) -> Result<(), Error> {
        self.get(id)?
            .refill(mc)
            .map_err(|source| Error::Refill { id, source })
    }

    /// Reclaims from the allocator registered under `id` down to `target`
    /// free pages.
    pub fn reclaim(
        &self,
        id: HypAllocMgtId,
        mc: &mut HypMemcache,
        target: u64,
    ) -> Result<(), Error> {
        self.get(id)?.reclaim(mc, target);
        Ok(())
    }

    /// The total number of reclaimable pages across all allocators.
    pub fn reclaimable(&self) -> u64 {
        self.allocators
            .iter()
            .flatten()
            .map(|ops| ops.reclaimable())
            .sum()
    }
}
