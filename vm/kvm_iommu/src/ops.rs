// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interfaces implemented by a concrete IOMMU driver.

use crate::Error;
use crate::KvmHypIommuDomain;
use crate::KvmIommu;
use bitfield_struct::bitfield;
use hyp_pool::PageBlock;
use hyp_pool::PageFlags;

/// Host-side lifecycle hooks of an IOMMU driver.
pub trait KvmIommuDriver: Send + Sync {
    /// Brings up the driver once the domain table exists.
    fn init_driver(&self) -> anyhow::Result<()>;
    /// Tears down the driver before the domain table is freed.
    fn remove_driver(&self);
}

/// Access permissions and attributes of an IOMMU mapping.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct IommuProt {
    /// Device reads are allowed.
    pub read: bool,
    /// Device writes are allowed.
    pub write: bool,
    /// The mapping is cacheable.
    pub cache: bool,
    /// Instruction fetches are disallowed.
    pub noexec: bool,
    /// The target is device memory.
    pub mmio: bool,
    /// Only privileged transactions may use the mapping.
    pub privileged: bool,
    #[bits(26)]
    _reserved: u32,
}

/// A request to map `pgcount` pages of `pgsize` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IommuMapping {
    /// The first I/O virtual address.
    pub iova: u64,
    /// The first physical address.
    pub paddr: u64,
    /// The size of each page, a power of two.
    pub pgsize: u64,
    /// The number of pages.
    pub pgcount: u64,
    /// The mapping permissions.
    pub prot: IommuProt,
}

impl IommuMapping {
    /// The total size in bytes, or `None` if it overflows.
    pub fn size(&self) -> Option<u64> {
        self.pgsize.checked_mul(self.pgcount)
    }
}

/// Hypervisor-side operations of an IOMMU driver.
///
/// Domain records passed in are owned by the domain table. Drivers keep their
/// page-table state behind [`KvmHypIommuDomain::private`] and allocate its
/// pages through the supplied [`IommuPages`], so that exhaustion raises a
/// memory request on the calling CPU.
pub trait KvmIommuOps: Send + Sync {
    /// Sets up translation state for a newly allocated domain.
    fn alloc_domain(
        &self,
        domain: &KvmHypIommuDomain,
        domain_type: u32,
        pages: &IommuPages<'_>,
    ) -> Result<(), Error>;

    /// Releases the translation state of a domain with no attached endpoints.
    fn free_domain(&self, domain: &KvmHypIommuDomain, pages: &IommuPages<'_>);

    /// Attaches an endpoint to `domain`.
    fn attach_dev(
        &self,
        iommu_id: u64,
        domain: &KvmHypIommuDomain,
        endpoint_id: u32,
        pasid: u32,
        pasid_bits: u32,
    ) -> Result<(), Error>;

    /// Detaches an endpoint from `domain`.
    fn detach_dev(
        &self,
        iommu_id: u64,
        domain: &KvmHypIommuDomain,
        endpoint_id: u32,
        pasid: u32,
    ) -> Result<(), Error>;

    /// Maps pages into `domain`, returning the number of bytes mapped.
    fn map_pages(
        &self,
        domain: &KvmHypIommuDomain,
        mapping: &IommuMapping,
        pages: &IommuPages<'_>,
    ) -> u64;

    /// Unmaps pages from `domain`, returning the number of bytes unmapped.
    fn unmap_pages(
        &self,
        domain: &KvmHypIommuDomain,
        iova: u64,
        pgsize: u64,
        pgcount: u64,
        pages: &IommuPages<'_>,
    ) -> u64;

    /// Translates `iova`, returning 0 if it is not mapped.
    fn iova_to_phys(&self, domain: &KvmHypIommuDomain, iova: u64) -> u64;
}

/// Donates pool pages to a driver on behalf of one CPU.
pub struct IommuPages<'a> {
    pub(crate) iommu: &'a KvmIommu,
    pub(crate) cpu: usize,
}

impl IommuPages<'_> {
    /// The CPU requests are raised on.
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// See [`KvmIommu::donate_pages`].
    pub fn donate_pages(&self, order: u8, flags: PageFlags) -> Result<PageBlock, Error> {
        self.iommu.donate_pages(self.cpu, order, flags)
    }

    /// See [`KvmIommu::reclaim_pages`].
    pub fn reclaim_pages(&self, block: PageBlock) {
        self.iommu.reclaim_pages(block)
    }
}
