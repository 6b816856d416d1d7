// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-CPU requests raised by the hypervisor for the host to satisfy.
//!
//! When an allocation inside the hypervisor fails, the failing CPU records
//! what it needs in its slot and returns an out-of-memory error. The host
//! consumes the slot when the call returns, supplies the memory, and retries.
//! Each CPU has exactly one slot, so a newer request on the same CPU replaces
//! an unconsumed older one.

use crate::PAGE_SIZE;
use parking_lot::Mutex;

/// The subsystem that needs memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemDest {
    /// The hypervisor's general heap.
    HypAlloc,
    /// The IOMMU page pool.
    HypIommu,
}

/// A request for memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRequest {
    /// Where the memory must be donated.
    pub dest: MemDest,
    /// The size in bytes of each block the host should allocate.
    pub sz_alloc: u64,
    /// The total number of base pages needed.
    pub nr_pages: u64,
}

/// A request raised by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypReq {
    /// More memory is needed.
    Mem(MemRequest),
}

/// One pending-request slot per CPU.
#[derive(Debug)]
pub struct HypReqs {
    slots: Box<[Mutex<Option<HypReq>>]>,
}

impl HypReqs {
    /// Returns a request table for `nr_cpus` CPUs.
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            slots: (0..nr_cpus).map(|_| Mutex::new(None)).collect(),
        }
    }

    /// The number of CPUs the table was sized for.
    pub fn nr_cpus(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, cpu: usize) -> &Mutex<Option<HypReq>> {
        assert!(
            cpu < self.slots.len(),
            "cpu {cpu} out of range for {} request slots",
            self.slots.len()
        );
        &self.slots[cpu]
    }

    /// Records `req` as the pending request for `cpu`.
    pub fn raise(&self, cpu: usize, req: HypReq) {
        tracing::debug!(cpu, ?req, "hypervisor request raised");
        *self.slot(cpu).lock() = Some(req);
    }

    /// Records a request for one block of `2^order` pages for `dest`.
    pub fn request_mem(&self, cpu: usize, dest: MemDest, order: u8) {
        self.raise(
            cpu,
            HypReq::Mem(MemRequest {
                dest,
                sz_alloc: PAGE_SIZE << order,
                nr_pages: 1 << order,
            }),
        );
    }

    /// Returns the pending request for `cpu` without consuming it.
    pub fn peek(&self, cpu: usize) -> Option<HypReq> {
        *self.slot(cpu).lock()
    }

    /// Consumes the pending request for `cpu`.
    pub fn take(&self, cpu: usize) -> Option<HypReq> {
        self.slot(cpu).lock().take()
    }
}
