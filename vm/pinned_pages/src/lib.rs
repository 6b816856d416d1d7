// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pinning of host pages that back demand-paged guest memory.
//!
//! Each guest physical address is backed by at most one pinned host page.
//! Concurrent faults on the same address may each pin a page; the first to
//! record its pin wins and the others release theirs.

#![forbid(unsafe_code)]

mod memslot;
mod pin;
mod registry;

pub use memslot::GzvmMemslot;
pub use memslot::MAX_GFN;
pub use memslot::gfn_to_gpa;
pub use pin::HostPage;
pub use pin::PagePinner;
pub use pin::PinError;
pub use pin::PinFlags;
pub use registry::Duplicate;
pub use registry::PinnedPage;
pub use registry::PinnedPageRegistry;

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// The guest page shift.
pub const PAGE_SHIFT: u32 = 12;

/// Errors returned by guest page operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The frame is not covered by the given slot or has no 64-bit guest
    /// physical address.
    #[error("gfn {gfn:#x} is not addressable through memslot {slot_id:?}")]
    InvalidGfn {
        /// The slot used for translation, if any.
        slot_id: Option<u32>,
        /// The guest frame number.
        gfn: u64,
    },
    /// No slot covers the frame.
    #[error("no memslot covers gfn {0:#x}")]
    NoMemslot(u64),
    /// The slot extends past the guest physical address space or overlaps
    /// another slot.
    #[error("memslot {0} is invalid or overlaps another memslot")]
    InvalidMemslot(u32),
    /// The backing host page could not be pinned.
    #[error("failed to pin the page backing gpa {gpa:#x}")]
    Pin {
        /// The guest physical address.
        gpa: u64,
        /// The pinner's error.
        #[source]
        source: PinError,
    },
}

impl Error {
    /// The negative errno reported to the faulting vCPU.
    pub fn errno(&self) -> i32 {
        -match self {
            Error::InvalidGfn { .. } | Error::InvalidMemslot(_) => libc::EINVAL,
            Error::NoMemslot(_) => libc::EFAULT,
            Error::Pin { source, .. } => match source {
                PinError::HwPoison { .. } => libc::EHWPOISON,
                PinError::Fault { .. } => libc::EFAULT,
            },
        }
    }
}

/// The pin-related state of one guest.
///
/// Pages still pinned when the VM is dropped are released.
pub struct GzvmVm {
    memslots: RwLock<BTreeMap<u32, GzvmMemslot>>,
    pinned: PinnedPageRegistry,
    pinner: Arc<dyn PagePinner>,
}

impl std::fmt::Debug for GzvmVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GzvmVm")
            .field("memslots", &*self.memslots.read())
            .field("pinned_pages", &self.pinned.len())
            .finish()
    }
}

impl GzvmVm {
    /// Returns a VM with no memslots that pins pages with `pinner`.
    pub fn new(pinner: Arc<dyn PagePinner>) -> Self {
        Self {
            memslots: RwLock::new(BTreeMap::new()),
            pinned: PinnedPageRegistry::new(),
            pinner,
        }
    }

    /// Installs or replaces a memslot.
    pub fn set_memslot(&self, slot: GzvmMemslot) -> Result<(), Error> {
        let mut memslots = self.memslots.write();
        if !slot.is_addressable()
            || memslots
                .values()
                .any(|other| other.slot_id != slot.slot_id && other.overlaps(&slot))
        {
            return Err(Error::InvalidMemslot(slot.slot_id));
        }
        memslots.insert(slot.slot_id, slot);
        tracing::debug!(
            slot_id = slot.slot_id,
            base_gfn = slot.base_gfn,
            npages = slot.npages,
            "memslot set"
        );
        Ok(())
    }

    /// Returns the slot covering `gfn`.
    pub fn find_memslot(&self, gfn: u64) -> Option<GzvmMemslot> {
        self.memslots
            .read()
            .values()
            .find(|slot| slot.contains(gfn))
            .copied()
    }

    /// The registry of pinned pages.
    pub fn pinned_pages(&self) -> &PinnedPageRegistry {
        &self.pinned
    }

    /// Pins the host page backing `gfn` in `slot` and records it, returning
    /// its frame number.
    ///
    /// If a concurrent caller recorded a page for the same address first,
    /// this caller's pin is released and the recorded page is returned.
    pub fn allocate_guest_page(&self, slot: &GzvmMemslot, gfn: u64) -> Result<u64, Error> {
        let invalid = || Error::InvalidGfn {
            slot_id: Some(slot.slot_id),
            gfn,
        };
        let hva = slot.gfn_to_hva(gfn).ok_or_else(invalid)?;
        let gpa = gfn_to_gpa(gfn).ok_or_else(invalid)?;

        let page = self
            .pinner
            .pin_page(
                hva,
                PinFlags::new()
                    .with_hwpoison(true)
                    .with_longterm(true)
                    .with_write(true),
            )
            .map_err(|source| Error::Pin { gpa, source })?;
        let pfn = page.pfn();

        match self.pinned.insert(PinnedPage::new(gpa, page)) {
            Ok(()) => {
                tracing::trace!(gpa, pfn, "guest page pinned");
                Ok(pfn)
            }
            Err(Duplicate {
                existing_pfn,
                rejected,
            }) => {
                tracing::debug!(gpa, pfn = existing_pfn, "guest page already pinned");
                self.pinner.unpin_page(rejected.into_page());
                Ok(existing_pfn)
            }
        }
    }

    /// Resolves a demand-paging fault on `gfn`, returning the frame number
    /// of the pinned backing page.
    pub fn handle_page_fault(&self, gfn: u64) -> Result<u64, Error> {
        let gpa = gfn_to_gpa(gfn).ok_or(Error::InvalidGfn { slot_id: None, gfn })?;
        if let Some(pfn) = self.pinned.get(gpa) {
            return Ok(pfn);
        }
        let slot = self.find_memslot(gfn).ok_or(Error::NoMemslot(gfn))?;
        self.allocate_guest_page(&slot, gfn)
    }

    /// Unpins the page backing `gfn`, returning its frame number if one was
    /// pinned.
    pub fn relinquish_page(&self, gfn: u64) -> Option<u64> {
        let gpa = gfn_to_gpa(gfn)?;
        let page = self.pinned.remove(gpa)?;
        let pfn = page.pfn();
        self.pinner.unpin_page(page.into_page());
        tracing::trace!(gpa, pfn, "guest page relinquished");
        Some(pfn)
    }

    /// Unpins every recorded page, returning how many were released.
    pub fn release_pinned_pages(&self) -> usize {
        let pages = self.pinned.drain();
        let count = pages.len();
        for page in pages {
            self.pinner.unpin_page(page.into_page());
        }
        if count > 0 {
            tracing::debug!(count, "released pinned guest pages");
        }
        count
    }
}

impl Drop for GzvmVm {
    fn drop(&mut self) {
        self.release_pinned_pages();
    }
}
