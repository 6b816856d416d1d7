// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The set of pinned host pages, keyed by guest physical address.

use crate::HostPage;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// A host page pinned on behalf of one guest physical address.
#[derive(Debug, PartialEq, Eq)]
pub struct PinnedPage {
    gpa: u64,
    page: HostPage,
}

impl PinnedPage {
    /// Returns a record binding `page` to `gpa`.
    pub fn new(gpa: u64, page: HostPage) -> Self {
        Self { gpa, page }
    }

    /// The guest physical address.
    pub fn gpa(&self) -> u64 {
        self.gpa
    }

    /// The pinned page's frame number.
    pub fn pfn(&self) -> u64 {
        self.page.pfn()
    }

    /// Releases the record, returning its page for unpinning.
    pub fn into_page(self) -> HostPage {
        self.page
    }
}

/// An insertion rejected because the address already has a record.
#[derive(Debug)]
pub struct Duplicate {
    /// The frame number of the page already recorded.
    pub existing_pfn: u64,
    /// The record that was not inserted.
    pub rejected: PinnedPage,
}

/// Holds at most one [`PinnedPage`] per guest physical address.
#[derive(Debug, Default)]
pub struct PinnedPageRegistry {
    pages: Mutex<BTreeMap<u64, PinnedPage>>,
}

impl PinnedPageRegistry {
    /// Returns an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `page` unless its address is already recorded.
    pub fn insert(&self, page: PinnedPage) -> Result<(), Duplicate> {
        match self.pages.lock().entry(page.gpa) {
            Entry::Vacant(entry) => {
                entry.insert(page);
                Ok(())
            }
            Entry::Occupied(entry) => Err(Duplicate {
                existing_pfn: entry.get().pfn(),
                rejected: page,
            }),
        }
    }

    /// Returns the frame number pinned for `gpa`.
    pub fn get(&self, gpa: u64) -> Option<u64> {
        self.pages.lock().get(&gpa).map(PinnedPage::pfn)
    }

    /// Removes the record for `gpa`.
    pub fn remove(&self, gpa: u64) -> Option<PinnedPage> {
        self.pages.lock().remove(&gpa)
    }

    /// Removes every record, in address order.
    pub fn drain(&self) -> Vec<PinnedPage> {
        std::mem::take(&mut *self.pages.lock())
            .into_values()
            .collect()
    }

    /// The number of records.
    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    /// Returns whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.pages.lock().is_empty()
    }
}
