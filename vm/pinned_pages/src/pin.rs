// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The host page-pinning primitive.

use bitfield_struct::bitfield;
use thiserror::Error;

/// Options for pinning a host page.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PinFlags {
    /// Report hardware-poisoned pages as [`PinError::HwPoison`].
    pub hwpoison: bool,
    /// Keep the page resident and unmigrated for the lifetime of the pin.
    pub longterm: bool,
    /// Require write access.
    pub write: bool,
    #[bits(29)]
    _reserved: u32,
}

/// A pinned host page. Must be handed back to [`PagePinner::unpin_page`].
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct HostPage {
    pfn: u64,
}

impl HostPage {
    /// Wraps a page that the pinner has pinned.
    pub fn new(pfn: u64) -> Self {
        Self { pfn }
    }

    /// The host page frame number.
    pub fn pfn(&self) -> u64 {
        self.pfn
    }
}

/// Errors from [`PagePinner::pin_page`].
#[derive(Debug, Error)]
pub enum PinError {
    /// The page is hardware poisoned.
    #[error("host page at {hva:#x} is hardware poisoned")]
    HwPoison {
        /// The host virtual address.
        hva: u64,
    },
    /// The page could not be faulted in or pinned.
    #[error("failed to pin host page at {hva:#x}")]
    Fault {
        /// The host virtual address.
        hva: u64,
    },
}

/// Pins pages of the host address space.
///
/// Implementations take and release their own address-space locks within
/// each call.
pub trait PagePinner: Send + Sync {
    /// Pins the single page at `hva`.
    fn pin_page(&self, hva: u64, flags: PinFlags) -> Result<HostPage, PinError>;
    /// Releases a pin taken by [`Self::pin_page`].
    fn unpin_page(&self, page: HostPage);
}
