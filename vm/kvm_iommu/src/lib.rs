// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! IOMMU memory and domain management for a protected hypervisor.
//!
//! The hypervisor-resident IOMMU driver allocates its page tables and domain
//! records from a pool of pages donated by the untrusted host. When the pool
//! runs dry, the failing CPU raises a memory request and the call fails with
//! an out-of-memory error; the host services the request with
//! [`KvmIommu::handle_hyp_req`] and retries.
//!
//! Until a driver registers itself with [`KvmIommu::register_driver`], every
//! entry point is an inert no-op.

#![forbid(unsafe_code)]

mod domain;
mod ops;

pub use domain::KVM_IOMMU_DOMAINS_PER_PAGE;
pub use domain::KVM_IOMMU_DOMAINS_ROOT_ENTRIES;
pub use domain::KVM_IOMMU_MAX_DOMAINS;
pub use domain::KvmHypIommuDomain;
pub use ops::IommuMapping;
pub use ops::IommuPages;
pub use ops::IommuProt;
pub use ops::KvmIommuDriver;
pub use ops::KvmIommuOps;

use anyhow::Context;
use domain::DomainTable;
use hyp_pool::HostPageAllocator;
use hyp_pool::HypMemcache;
use hyp_pool::HypPool;
use hyp_pool::PageBlock;
use hyp_pool::PageFlags;
use hyp_pool::RemapRange;
use hyp_pool::alloc_mgt::HypMgtAllocatorOps;
use hyp_pool::get_order;
use hyp_pool::req::HypReq;
use hyp_pool::req::HypReqs;
use hyp_pool::req::MemDest;
use parking_lot::MappedRwLockReadGuard;
use parking_lot::RwLock;
use parking_lot::RwLockReadGuard;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::OnceLock;
use thiserror::Error;

/// Errors returned by IOMMU operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No IOMMU driver has registered.
    #[error("no IOMMU driver is registered")]
    NoDriver,
    /// A driver is already registered.
    #[error("an IOMMU driver is already registered")]
    AlreadyRegistered,
    /// The domain table has not been set up by [`KvmIommu::init_driver`].
    #[error("the IOMMU domain table is not initialized")]
    NotInitialized,
    /// The IOMMU pool could not satisfy the operation.
    #[error("IOMMU pool operation failed")]
    Pool(#[from] hyp_pool::Error),
    /// The domain is not allocated.
    #[error("domain {0} is not allocated")]
    InvalidDomain(u16),
    /// The domain is already allocated.
    #[error("domain {0} is already allocated")]
    DomainExists(u16),
    /// The domain still has endpoints attached.
    #[error("domain {0} has attached endpoints")]
    DomainBusy(u16),
    /// The domain's reference count would overflow.
    #[error("domain {0} reference count overflow")]
    RefOverflow(u16),
    /// A request was raised for a destination this subsystem does not serve.
    #[error("request {0:?} is not for the IOMMU pool")]
    UnsupportedRequest(HypReq),
    /// A caller or driver argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl Error {
    /// The negative errno reported across the hypercall boundary.
    pub fn errno(&self) -> i32 {
        -match self {
            Error::NoDriver | Error::NotInitialized => libc::ENODEV,
            Error::AlreadyRegistered | Error::DomainBusy(_) => libc::EBUSY,
            Error::Pool(err) => return err.errno(),
            Error::DomainExists(_) => libc::EEXIST,
            Error::RefOverflow(_) => libc::EOVERFLOW,
            Error::InvalidDomain(_) | Error::UnsupportedRequest(_) | Error::InvalidArgument(_) => {
                libc::EINVAL
            }
        }
    }
}

/// Construction parameters for [`KvmIommu`].
#[derive(Debug, Clone)]
pub struct KvmIommuConfig {
    /// The number of CPUs that may raise memory requests.
    pub nr_cpus: usize,
}

struct IommuDriver {
    kern: Arc<dyn KvmIommuDriver>,
    el2: Arc<dyn KvmIommuOps>,
}

/// The IOMMU subsystem: its page pool, request slots, registered driver and
/// domain table.
pub struct KvmIommu {
    driver: OnceLock<IommuDriver>,
    pool: HypPool,
    reqs: HypReqs,
    domains: RwLock<Option<DomainTable>>,
}

impl Debug for KvmIommu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvmIommu")
            .field("driver_registered", &self.driver.get().is_some())
            .field("pool", &self.pool)
            .field("nr_cpus", &self.reqs.nr_cpus())
            .field(
                "domain_leaves",
                &self.domains.read().as_ref().map(|t| t.populated_leaves()),
            )
            .finish()
    }
}

impl KvmIommu {
    /// Returns a subsystem with an empty pool and no driver.
    pub fn new(config: KvmIommuConfig, remap: Arc<dyn RemapRange>) -> Self {
        Self {
            driver: OnceLock::new(),
            pool: HypPool::new(remap),
            reqs: HypReqs::new(config.nr_cpus),
            domains: RwLock::new(None),
        }
    }

    /// The pool backing IOMMU allocations.
    pub fn pool(&self) -> &HypPool {
        &self.pool
    }

    fn ops(&self) -> Option<&dyn KvmIommuOps> {
        self.driver.get().map(|d| &*d.el2)
    }

    fn check_cpu(&self, cpu: usize) -> Result<(), Error> {
        if cpu >= self.reqs.nr_cpus() {
            return Err(Error::InvalidArgument("cpu index out of range"));
        }
        Ok(())
    }

    fn pages(&self, cpu: usize) -> Result<IommuPages<'_>, Error> {
        self.check_cpu(cpu)?;
        Ok(IommuPages { iommu: self, cpu })
    }

    /// Installs a driver's host-side and hypervisor-side operations.
    ///
    /// Only the first registration succeeds; later calls fail with
    /// [`Error::AlreadyRegistered`] and leave the first driver installed.
    pub fn register_driver(
        &self,
        kern: Arc<dyn KvmIommuDriver>,
        el2: Arc<dyn KvmIommuOps>,
    ) -> Result<(), Error> {
        self.driver.set(IommuDriver { kern, el2 }).map_err(|_| {
            tracing::warn!("rejecting second IOMMU driver registration");
            Error::AlreadyRegistered
        })?;
        tracing::info!("IOMMU driver registered");
        Ok(())
    }

    /// Allocates the domain table and initializes the registered driver.
    ///
    /// Without a registered driver this succeeds and does nothing, leaving
    /// devices without DMA protection.
    pub fn init_driver(&self) -> anyhow::Result<()> {
        let Some(driver) = self.driver.get() else {
            tracing::warn!(
                "pKVM enabled without an IOMMU driver, device assignment without DMA protection"
            );
            return Ok(());
        };

        {
            let mut domains = self.domains.write();
            if domains.is_some() {
                anyhow::bail!("IOMMU driver already initialized");
            }
            *domains = Some(DomainTable::new());
        }

        if let Err(err) = driver.kern.init_driver() {
            self.free_domain_table();
            return Err(err).context("failed to initialize IOMMU driver");
        }

        tracing::info!(
            max_domains = KVM_IOMMU_MAX_DOMAINS,
            "IOMMU driver initialized"
        );
        Ok(())
    }

    /// Tears down the registered driver and frees the domain table.
    pub fn remove_driver(&self) {
        if let Some(driver) = self.driver.get() {
            driver.kern.remove_driver();
        }
        self.free_domain_table();
    }

    fn free_domain_table(&self) {
        let table = self.domains.write().take();
        if let Some(table) = table {
            for page in table.into_pages() {
                self.reclaim_pages(page);
            }
            tracing::debug!("IOMMU domain table freed");
        }
    }

    /// Admits the host's pages in `mc` into the pool.
    ///
    /// Fails with [`hyp_pool::Error::NotConfigured`] and leaves `mc` untouched
    /// if no driver is registered.
    pub fn refill(&self, mc: &mut HypMemcache) -> Result<u64, hyp_pool::Error> {
        if self.driver.get().is_none() {
            return Err(hyp_pool::Error::NotConfigured);
        }
        self.pool.refill(mc).inspect_err(|err| {
            tracing::warn!(
                error = err as &dyn std::error::Error,
                "rejected IOMMU pool refill"
            )
        })
    }

    /// Hands free pool pages back to the host through `mc` until `target`
    /// free pages remain.
    pub fn reclaim(&self, mc: &mut HypMemcache, target: u64) -> Result<u64, hyp_pool::Error> {
        if self.driver.get().is_none() {
            return Err(hyp_pool::Error::NotConfigured);
        }
        Ok(self.pool.reclaim(mc, target))
    }

    /// The number of pages [`Self::reclaim`] could hand back.
    pub fn reclaimable(&self) -> u64 {
        if self.driver.get().is_none() {
            return 0;
        }
        self.pool.free_pages()
    }

    /// Allocates `2^order` pages from the pool for the IOMMU driver.
    ///
    /// If the pool is exhausted, a request for the missing pages is raised on
    /// `cpu` before the error is returned.
    pub fn donate_pages(&self, cpu: usize, order: u8, flags: PageFlags) -> Result<PageBlock, Error> {
        self.check_cpu(cpu)?;
        match self.pool.alloc_pages(order, flags) {
            Ok(block) => Ok(block),
            Err(err @ hyp_pool::Error::OutOfMemory { .. }) => {
                tracing::debug!(cpu, order, "IOMMU pool exhausted, requesting host memory");
                self.reqs.request_mem(cpu, MemDest::HypIommu, order);
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Returns pages obtained from [`Self::donate_pages`] to the pool,
    /// remapping them cacheable first.
    pub fn reclaim_pages(&self, block: PageBlock) {
        if let Err(err) = self.pool.put_pages(block) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "failed to return pages to the IOMMU pool"
            );
        }
    }

    /// Returns the request pending on `cpu` without consuming it. A CPU
    /// index out of range never has a pending request.
    pub fn pending_req(&self, cpu: usize) -> Option<HypReq> {
        self.check_cpu(cpu).ok()?;
        self.reqs.peek(cpu)
    }

    /// Services the request pending on `cpu` from the host allocator,
    /// returning the number of pages donated to the pool.
    ///
    /// The pending request is consumed. If the host cannot supply the memory
    /// or the pool rejects it, every page allocated for it is freed back to
    /// `host`.
    pub fn handle_hyp_req(&self, cpu: usize, host: &dyn HostPageAllocator) -> Result<u64, Error> {
        self.check_cpu(cpu)?;
        let Some(req) = self.reqs.take(cpu) else {
            return Ok(0);
        };
        let HypReq::Mem(mem) = req;
        if mem.dest != MemDest::HypIommu {
            self.reqs.raise(cpu, req);
            return Err(Error::UnsupportedRequest(req));
        }

        let mut mc = HypMemcache::new();
        let result = mc
            .topup(mem.nr_pages, get_order(mem.sz_alloc), host)
            .and_then(|()| self.refill(&mut mc));
        if result.is_err() {
            mc.free(host);
        }
        let donated = result?;
        tracing::debug!(cpu, donated, "serviced IOMMU memory request");
        Ok(donated)
    }

    fn domains(
        &self,
    ) -> Result<(&dyn KvmIommuOps, MappedRwLockReadGuard<'_, DomainTable>), Error> {
        let ops = self.ops().ok_or(Error::NoDriver)?;
        let table = RwLockReadGuard::try_map(self.domains.read(), Option::as_ref)
            .map_err(|_| Error::NotInitialized)?;
        Ok((ops, table))
    }

    /// Allocates domain `domain_id`, donating its leaf page first if needed.
    pub fn alloc_domain(&self, cpu: usize, domain_id: u16, domain_type: u32) -> Result<(), Error> {
        let pages = self.pages(cpu)?;
        let (ops, table) = self.domains()?;
        let domain = table.lookup_or_populate(domain_id, &pages)?;
        domain.claim(domain_id)?;
        let result = ops.alloc_domain(domain, domain_type, &pages);
        domain.finish_claim(result.is_ok());
        result?;
        tracing::debug!(domain_id, domain_type, "IOMMU domain allocated");
        Ok(())
    }

    /// Frees domain `domain_id`, which must have no attached endpoints.
    pub fn free_domain(&self, cpu: usize, domain_id: u16) -> Result<(), Error> {
        let pages = self.pages(cpu)?;
        let (ops, table) = self.domains()?;
        let domain = table
            .lookup(domain_id)
            .ok_or(Error::InvalidDomain(domain_id))?;
        domain.begin_free(domain_id)?;
        ops.free_domain(domain, &pages);
        domain.finish_free();
        tracing::debug!(domain_id, "IOMMU domain freed");
        Ok(())
    }

    /// Attaches an endpoint to domain `domain_id`.
    pub fn attach_dev(
        &self,
        iommu_id: u64,
        domain_id: u16,
        endpoint_id: u32,
        pasid: u32,
        pasid_bits: u32,
    ) -> Result<(), Error> {
        let (ops, table) = self.domains()?;
        let domain = table
            .lookup(domain_id)
            .ok_or(Error::InvalidDomain(domain_id))?;
        domain.get(domain_id)?;
        if let Err(err) = ops.attach_dev(iommu_id, domain, endpoint_id, pasid, pasid_bits) {
            domain.put();
            return Err(err);
        }
        Ok(())
    }

    /// Detaches an endpoint from domain `domain_id`.
    pub fn detach_dev(
        &self,
        iommu_id: u64,
        domain_id: u16,
        endpoint_id: u32,
        pasid: u32,
    ) -> Result<(), Error> {
        let (ops, table) = self.domains()?;
        let domain = table
            .lookup(domain_id)
            .filter(|d| d.refs() > 1)
            .ok_or(Error::InvalidDomain(domain_id))?;
        ops.detach_dev(iommu_id, domain, endpoint_id, pasid)?;
        domain.put();
        Ok(())
    }

    /// Maps pages into domain `domain_id`, returning the number of bytes
    /// mapped. Returns 0 without a driver or for a malformed request.
    ///
    /// A short count with a pending request on `cpu` means the driver ran out
    /// of page-table memory part way through.
    pub fn map_pages(&self, cpu: usize, domain_id: u16, mapping: IommuMapping) -> u64 {
        let (Ok(pages), Ok((ops, table))) = (self.pages(cpu), self.domains()) else {
            return 0;
        };
        let aligned = mapping.pgsize.is_power_of_two()
            && mapping.iova % mapping.pgsize == 0
            && mapping.paddr % mapping.pgsize == 0;
        let in_range = mapping.size().is_some_and(|size| {
            mapping.iova.checked_add(size).is_some() && mapping.paddr.checked_add(size).is_some()
        });
        if !aligned || !in_range {
            tracing::warn!(domain_id, ?mapping, "rejecting malformed IOMMU map");
            return 0;
        }

        let Some(domain) = table.lookup(domain_id) else {
            return 0;
        };
        if domain.get(domain_id).is_err() {
            return 0;
        }
        let mapped = ops.map_pages(domain, &mapping, &pages);
        domain.put();
        mapped
    }

    /// Unmaps pages from domain `domain_id`, returning the number of bytes
    /// unmapped.
    pub fn unmap_pages(
        &self,
        cpu: usize,
        domain_id: u16,
        iova: u64,
        pgsize: u64,
        pgcount: u64,
    ) -> u64 {
        let (Ok(pages), Ok((ops, table))) = (self.pages(cpu), self.domains()) else {
            return 0;
        };
        let valid = pgsize.is_power_of_two()
            && iova % pgsize == 0
            && pgsize
                .checked_mul(pgcount)
                .and_then(|size| iova.checked_add(size))
                .is_some();
        if !valid {
            tracing::warn!(domain_id, iova, pgsize, pgcount, "rejecting malformed IOMMU unmap");
            return 0;
        }

        let Some(domain) = table.lookup(domain_id) else {
            return 0;
        };
        if domain.get(domain_id).is_err() {
            return 0;
        }
        let unmapped = ops.unmap_pages(domain, iova, pgsize, pgcount, &pages);
        domain.put();
        unmapped
    }

    /// Translates `iova` in domain `domain_id`, returning 0 if unmapped.
    pub fn iova_to_phys(&self, domain_id: u16, iova: u64) -> u64 {
        let Ok((ops, table)) = self.domains() else {
            return 0;
        };
        let Some(domain) = table.lookup(domain_id) else {
            return 0;
        };
        if domain.get(domain_id).is_err() {
            return 0;
        }
        let phys = ops.iova_to_phys(domain, iova);
        domain.put();
        phys
    }

    /// The number of domain leaf pages populated so far, or `None` before
    /// initialization.
    pub fn domain_leaves(&self) -> Option<usize> {
        self.domains.read().as_ref().map(|t| t.populated_leaves())
    }
}

impl HypMgtAllocatorOps for KvmIommu {
    fn refill(&self, mc: &mut HypMemcache) -> Result<(), hyp_pool::Error> {
        KvmIommu::refill(self, mc).map(drop)
    }

    fn reclaim(&self, mc: &mut HypMemcache, target: u64) {
        // Without a driver there is nothing to reclaim.
        let _ = KvmIommu::reclaim(self, mc, target);
    }

    fn reclaimable(&self) -> u64 {
        KvmIommu::reclaimable(self)
    }
}

static KVM_IOMMU: OnceLock<KvmIommu> = OnceLock::new();

/// Creates the process-wide IOMMU subsystem on first call and returns it.
///
/// Later calls return the existing instance and ignore their arguments.
pub fn setup(config: KvmIommuConfig, remap: Arc<dyn RemapRange>) -> &'static KvmIommu {
    KVM_IOMMU.get_or_init(|| KvmIommu::new(config, remap))
}

/// Returns the process-wide IOMMU subsystem, if [`setup`] has run.
pub fn get() -> Option<&'static KvmIommu> {
    KVM_IOMMU.get()
}

/// Registers a driver with the process-wide IOMMU subsystem.
pub fn register_driver(
    kern: Arc<dyn KvmIommuDriver>,
    el2: Arc<dyn KvmIommuOps>,
) -> Result<(), Error> {
    get()
        .ok_or(Error::NotInitialized)?
        .register_driver(kern, el2)
}
