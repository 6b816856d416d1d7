// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest memory slots.

use crate::PAGE_SHIFT;

/// The largest guest frame number whose physical address fits in 64 bits.
pub const MAX_GFN: u64 = u64::MAX >> PAGE_SHIFT;

/// Returns the guest physical address of `gfn`, or `None` if it does not fit
/// in 64 bits.
pub fn gfn_to_gpa(gfn: u64) -> Option<u64> {
    (gfn <= MAX_GFN).then(|| gfn << PAGE_SHIFT)
}

/// A contiguous range of guest frames backed by host virtual memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GzvmMemslot {
    /// The slot's identifier.
    pub slot_id: u32,
    /// The first guest frame number in the slot.
    pub base_gfn: u64,
    /// The number of guest frames in the slot.
    pub npages: u64,
    /// The host virtual address backing `base_gfn`.
    pub userspace_addr: u64,
}

impl GzvmMemslot {
    /// Returns the frame one past the end of the slot, or `None` if the slot
    /// wraps the guest address space.
    pub fn end_gfn(&self) -> Option<u64> {
        self.base_gfn.checked_add(self.npages)
    }

    /// Returns whether every frame in the slot has a 64-bit guest physical
    /// address.
    pub fn is_addressable(&self) -> bool {
        self.end_gfn().is_some_and(|end| end <= MAX_GFN + 1)
    }

    /// Returns whether `gfn` falls within the slot.
    pub fn contains(&self, gfn: u64) -> bool {
        gfn >= self.base_gfn && self.end_gfn().is_some_and(|end| gfn < end)
    }

    /// Translates `gfn` to the host virtual address backing it.
    pub fn gfn_to_hva(&self, gfn: u64) -> Option<u64> {
        if !self.contains(gfn) {
            return None;
        }
        (gfn - self.base_gfn)
            .checked_mul(1 << PAGE_SHIFT)?
            .checked_add(self.userspace_addr)
    }

    pub(crate) fn overlaps(&self, other: &GzvmMemslot) -> bool {
        match (self.end_gfn(), other.end_gfn()) {
            (Some(end), Some(other_end)) => self.base_gfn < other_end && other.base_gfn < end,
            _ => true,
        }
    }
}
