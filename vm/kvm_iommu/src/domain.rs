// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The two-level table of IOMMU domain records.
//!
//! A 16-bit handle selects a root entry (`id / KVM_IOMMU_DOMAINS_PER_PAGE`)
//! and a record within that entry's leaf page. Leaf pages are donated from
//! the pool the first time a handle in their range is allocated, and are only
//! returned when the whole table is freed.

use crate::Error;
use crate::IommuPages;
use hyp_pool::PAGE_SIZE;
use hyp_pool::PageBlock;
use hyp_pool::PageFlags;
use std::sync::OnceLock;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

/// The number of addressable domains.
pub const KVM_IOMMU_MAX_DOMAINS: usize = 1 << 16;
/// The number of domain records in one leaf page.
pub const KVM_IOMMU_DOMAINS_PER_PAGE: usize =
    PAGE_SIZE as usize / size_of::<KvmHypIommuDomain>();
/// The number of root entries.
pub const KVM_IOMMU_DOMAINS_ROOT_ENTRIES: usize =
    KVM_IOMMU_MAX_DOMAINS / KVM_IOMMU_DOMAINS_PER_PAGE;

/// Marks a record whose allocation or free is in progress.
const DOMAIN_BUSY: u32 = u32::MAX;

/// One IOMMU translation context.
///
/// `refs` gates the logical state: 0 is free, 1 is allocated with nothing
/// attached, and each attached endpoint adds one. The table owns the record's
/// memory, so dropping to zero never frees anything.
#[repr(C)]
#[derive(Debug, Default)]
pub struct KvmHypIommuDomain {
    refs: AtomicU32,
    domain_id: AtomicU16,
    private: AtomicU64,
}

static_assertions::const_assert_eq!(size_of::<KvmHypIommuDomain>(), 16);
static_assertions::const_assert_eq!(
    KVM_IOMMU_DOMAINS_PER_PAGE * KVM_IOMMU_DOMAINS_ROOT_ENTRIES,
    KVM_IOMMU_MAX_DOMAINS
);

impl KvmHypIommuDomain {
    /// The domain's handle.
    pub fn domain_id(&self) -> u16 {
        self.domain_id.load(Ordering::Relaxed)
    }

    /// The driver's opaque cookie for this domain.
    pub fn private(&self) -> u64 {
        self.private.load(Ordering::Acquire)
    }

    /// Replaces the driver's opaque cookie.
    pub fn set_private(&self, value: u64) {
        self.private.store(value, Ordering::Release)
    }

    /// The current reference count.
    pub fn refs(&self) -> u32 {
        match self.refs.load(Ordering::Acquire) {
            DOMAIN_BUSY => 0,
            refs => refs,
        }
    }

    /// Moves a free record into the busy state for allocation.
    pub(crate) fn claim(&self, domain_id: u16) -> Result<(), Error> {
        self.refs
            .compare_exchange(0, DOMAIN_BUSY, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| Error::DomainExists(domain_id))?;
        self.domain_id.store(domain_id, Ordering::Relaxed);
        self.private.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Completes or abandons a claim.
    pub(crate) fn finish_claim(&self, allocated: bool) {
        self.refs
            .store(if allocated { 1 } else { 0 }, Ordering::Release);
    }

    /// Moves an allocated record with nothing attached into the busy state
    /// for freeing.
    pub(crate) fn begin_free(&self, domain_id: u16) -> Result<(), Error> {
        match self
            .refs
            .compare_exchange(1, DOMAIN_BUSY, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => Ok(()),
            Err(0 | DOMAIN_BUSY) => Err(Error::InvalidDomain(domain_id)),
            Err(_) => Err(Error::DomainBusy(domain_id)),
        }
    }

    /// Clears a record whose free has completed.
    pub(crate) fn finish_free(&self) {
        self.private.store(0, Ordering::Relaxed);
        self.domain_id.store(0, Ordering::Relaxed);
        self.refs.store(0, Ordering::Release);
    }

    /// Takes a reference on an allocated record.
    pub(crate) fn get(&self, domain_id: u16) -> Result<(), Error> {
        let mut old = self.refs.load(Ordering::Relaxed);
        loop {
            match old {
                0 | DOMAIN_BUSY => return Err(Error::InvalidDomain(domain_id)),
                refs if refs == DOMAIN_BUSY - 1 => return Err(Error::RefOverflow(domain_id)),
                _ => {}
            }
            match self.refs.compare_exchange_weak(
                old,
                old + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(current) => old = current,
            }
        }
    }

    /// Drops a reference taken by [`Self::get`].
    pub(crate) fn put(&self) {
        let old = self.refs.fetch_sub(1, Ordering::Release);
        assert!(
            old > 1 && old != DOMAIN_BUSY,
            "domain reference underflow ({old})"
        );
    }
}

struct DomainLeaf {
    page: PageBlock,
    domains: Box<[KvmHypIommuDomain]>,
}

impl DomainLeaf {
    fn new(page: PageBlock) -> Self {
        Self {
            page,
            domains: (0..KVM_IOMMU_DOMAINS_PER_PAGE)
                .map(|_| KvmHypIommuDomain::default())
                .collect(),
        }
    }
}

/// The root of the domain table.
pub(crate) struct DomainTable {
    root: Box<[OnceLock<DomainLeaf>]>,
    leaves: AtomicUsize,
}

impl DomainTable {
    pub fn new() -> Self {
        Self {
            root: (0..KVM_IOMMU_DOMAINS_ROOT_ENTRIES)
                .map(|_| OnceLock::new())
                .collect(),
            leaves: AtomicUsize::new(0),
        }
    }

    fn index(domain_id: u16) -> (usize, usize) {
        let id = domain_id as usize;
        (
            id / KVM_IOMMU_DOMAINS_PER_PAGE,
            id % KVM_IOMMU_DOMAINS_PER_PAGE,
        )
    }

    /// Returns the record for `domain_id` if its leaf has been populated.
    pub fn lookup(&self, domain_id: u16) -> Option<&KvmHypIommuDomain> {
        let (root, leaf) = Self::index(domain_id);
        self.root[root].get().map(|l| &l.domains[leaf])
    }

    /// Returns the record for `domain_id`, donating its leaf page first if
    /// needed.
    pub fn lookup_or_populate(
        &self,
        domain_id: u16,
        pages: &IommuPages<'_>,
    ) -> Result<&KvmHypIommuDomain, Error> {
        let (root, leaf) = Self::index(domain_id);
        let slot = &self.root[root];
        if slot.get().is_none() {
            let page = pages.donate_pages(0, PageFlags::new())?;
            match slot.set(DomainLeaf::new(page)) {
                Ok(()) => {
                    self.leaves.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(root, domain_id, "domain leaf populated");
                }
                Err(lost) => pages.reclaim_pages(lost.page),
            }
        }
        slot.get()
            .map(|l| &l.domains[leaf])
            .ok_or(Error::InvalidDomain(domain_id))
    }

    /// The number of leaf pages populated over the table's lifetime.
    pub fn populated_leaves(&self) -> usize {
        self.leaves.load(Ordering::Relaxed)
    }

    /// Consumes the table, yielding the leaf pages to return to the pool.
    pub fn into_pages(self) -> impl Iterator<Item = PageBlock> {
        self.root
            .into_vec()
            .into_iter()
            .filter_map(|slot| slot.into_inner().map(|leaf| leaf.page))
    }
}
