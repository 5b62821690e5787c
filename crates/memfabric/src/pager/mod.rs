//! Demand paging of received regions.
//!
//! After a transfer the destination owns a region whose bytes still live on
//! the source. The pager brings them over page by page with one-sided reads:
//!
//! ```text
//! Remote --CAS--> InFlight --read completes--> Local
//! ```
//!
//! The compare-and-swap guarantees that exactly one thread issues the read
//! for a page however many fault on it concurrently; the losers either
//! refault (trap path) or wait for the page to turn `Local` (access-checked
//! path). Pages are reached through the fault trap when the region's page
//! size allows host-page protection, and through [`DemandPager::ensure_local`]
//! otherwise.

#[cfg(all(unix, feature = "fault-trap"))]
pub mod trap;

use crate::address::{align_up, host_page_size, NodeId, RegionAddress};
use crate::arena::{Arena, Protection};
use crate::coordination::Coordinator;
use crate::error::{FabricError, Result};
use crate::page_table::{PageSpan, PageState, PageTable};
use crate::region::Region;
use crate::registry::RegionRegistry;
use crate::transport::Transport;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// How a fault was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// This call pulled the page
    Pulled,
    /// Another thread is pulling it
    Raced,
    /// The page was already local
    AlreadyLocal,
}

/// Statistics for demand paging.
#[derive(Debug, Clone, Default)]
pub struct PagerStats {
    /// Faults (trap or access-checked) that reached the pager
    pub faults: u64,
    /// Pages pulled
    pub pages_pulled: u64,
    /// Bytes pulled
    pub bytes_pulled: u64,
    /// Faults that lost the CAS to another thread
    pub races: u64,
    /// Pulls that failed
    pub failed_pulls: u64,
    /// Regions whose Remote pages were protected
    pub regions_armed: u64,
}

#[derive(Default)]
struct PagerCounters {
    faults: AtomicU64,
    pages_pulled: AtomicU64,
    bytes_pulled: AtomicU64,
    races: AtomicU64,
    failed_pulls: AtomicU64,
    regions_armed: AtomicU64,
}

/// Pulls pages of received regions on demand.
pub struct DemandPager {
    registry: Arc<RegionRegistry>,
    arena: Arc<Arena>,
    transport: Arc<dyn Transport>,
    coordinator: Arc<dyn Coordinator>,
    trap_enabled: bool,
    counters: Arc<PagerCounters>,
}

impl DemandPager {
    pub fn new(
        registry: Arc<RegionRegistry>,
        arena: Arc<Arena>,
        transport: Arc<dyn Transport>,
        coordinator: Arc<dyn Coordinator>,
        trap_enabled: bool,
    ) -> Self {
        Self {
            registry,
            arena,
            transport,
            coordinator,
            trap_enabled,
            counters: Arc::new(PagerCounters::default()),
        }
    }

    /// Whether regions may be armed for the fault trap.
    pub fn trap_enabled(&self) -> bool {
        self.trap_enabled
    }

    /// Protect the Remote pages of `region` so that touching them faults.
    ///
    /// Returns `false`, leaving the region on the access-checked path, when
    /// the trap is disabled or the page geometry does not line up with host
    /// pages.
    pub fn arm(&self, region: &Region) -> Result<bool> {
        if !self.trap_enabled {
            return Ok(false);
        }
        let Some(pages) = region.pages() else {
            return Ok(false);
        };
        let host = host_page_size();
        if pages.page_size() % host != 0
            || !region.base().is_aligned(host)
            || self.registry.alignment() % host != 0
        {
            tracing::debug!(
                addr = %region.base(),
                page_size = pages.page_size(),
                host_page = host,
                "page geometry not trappable, using access-checked path"
            );
            return Ok(false);
        }

        for index in 0..pages.num_pages() {
            if pages.state_of(index) != PageState::Remote {
                continue;
            }
            if let Some(span) = pages.page_span(index) {
                self.arena
                    .protect(span.address, align_up(span.len, host), Protection::None)?;
            }
        }
        region.set_trap_armed(true);
        self.counters.regions_armed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(addr = %region.base(), pages = pages.num_pages(), "region armed");
        Ok(true)
    }

    /// Service a fault at `addr`.
    ///
    /// Resolves the region and page, wins or loses the page CAS, and on a
    /// win pulls exactly that page from the region's pair and marks it
    /// Local.
    pub fn service_fault(&self, addr: RegionAddress) -> Result<FaultResolution> {
        self.counters.faults.fetch_add(1, Ordering::Relaxed);
        let region = self
            .registry
            .lookup_recursive(addr)
            .ok_or(FabricError::RegionNotFound(addr))?;
        let Some(pages) = region.pages() else {
            return if region.is_resident() {
                Ok(FaultResolution::AlreadyLocal)
            } else {
                Err(FabricError::violation(region.base(), "region is not paged"))
            };
        };
        let span = pages
            .span_for(addr)
            .ok_or(FabricError::RegionNotFound(addr))?;

        if !pages.compare_and_swap_of(span.index, PageState::Remote, PageState::InFlight) {
            return match pages.state_of(span.index) {
                PageState::Local => Ok(FaultResolution::AlreadyLocal),
                _ => {
                    self.counters.races.fetch_add(1, Ordering::Relaxed);
                    Ok(FaultResolution::Raced)
                }
            };
        }

        let source = region
            .pair()
            .ok_or_else(|| FabricError::violation(region.base(), "paged region has no source"))?;
        self.pull_claimed(&region, pages, span, source)?;
        Ok(FaultResolution::Pulled)
    }

    /// Make the byte at `addr` local, waiting out a racing pull.
    pub fn ensure_local(&self, addr: RegionAddress) -> Result<()> {
        let region = self
            .registry
            .lookup(addr)
            .ok_or(FabricError::RegionNotFound(addr))?;
        if region.is_local_at(addr) {
            return Ok(());
        }
        loop {
            match self.service_fault(addr)? {
                FaultResolution::Pulled | FaultResolution::AlreadyLocal => return Ok(()),
                FaultResolution::Raced => {
                    let Some(pages) = region.pages() else {
                        return Ok(());
                    };
                    let state = wait_while_in_flight(pages, addr);
                    if state == PageState::Local {
                        return Ok(());
                    }
                    // The racing pull failed and released the page; claim it.
                }
            }
        }
    }

    /// Make every byte of `[addr, addr + len)` local.
    pub fn ensure_range_local(&self, addr: RegionAddress, len: usize) -> Result<()> {
        let region = self
            .registry
            .lookup(addr)
            .ok_or(FabricError::RegionNotFound(addr))?;
        if !region.contains_range(addr, len) {
            return Err(FabricError::violation(
                region.base(),
                format!("range {addr} (+{len}) crosses the region end"),
            ));
        }
        if region.is_resident() {
            return Ok(());
        }
        let Some(pages) = region.pages() else {
            return Err(FabricError::violation(region.base(), "region is not paged"));
        };
        for index in pages.pages_in(addr, len) {
            if let Some(span) = pages.page_span(index) {
                self.ensure_local(span.address)?;
            }
        }
        Ok(())
    }

    /// Pull the Remote pages of `[addr, addr + size)` from `source`, one at a
    /// time in index order. Returns the number of pages this call pulled.
    pub fn pull_pages_sync(&self, addr: RegionAddress, size: usize, source: NodeId) -> Result<usize> {
        let region = self
            .registry
            .lookup(addr)
            .ok_or(FabricError::RegionNotFound(addr))?;
        let Some(pages) = region.pages() else {
            return self.pull_unpaged(&region, source).map(|_| 0);
        };

        let mut pulled = 0;
        let range = pages.pages_in(addr, size);
        for index in range.clone() {
            if !pages.compare_and_swap_of(index, PageState::Remote, PageState::InFlight) {
                continue;
            }
            if let Some(span) = pages.page_span(index) {
                self.pull_claimed(&region, pages, span, source)?;
                pulled += 1;
            }
        }
        for index in range {
            if let Some(span) = pages.page_span(index) {
                if wait_while_in_flight(pages, span.address) != PageState::Local {
                    self.ensure_local(span.address)?;
                }
            }
        }
        Ok(pulled)
    }

    /// Pull the Remote pages of `[addr, addr + size)` from `source` with at
    /// most `rate_limit` reads in flight. Completion callbacks mark pages
    /// Local; the call returns once every issued read has completed.
    pub fn pull_pages_async(
        &self,
        addr: RegionAddress,
        size: usize,
        source: NodeId,
        rate_limit: usize,
    ) -> Result<usize> {
        let region = self
            .registry
            .lookup(addr)
            .ok_or(FabricError::RegionNotFound(addr))?;
        let Some(pages) = region.pages() else {
            return self.pull_unpaged(&region, source).map(|_| 0);
        };
        let conn = self.coordinator.resolve(source)?;
        let limit = rate_limit.max(1);
        let (tx, rx) = crossbeam::channel::unbounded::<(PageSpan, Result<()>)>();

        let mut in_flight = 0usize;
        let mut pulled = 0usize;
        let mut first_error: Option<FabricError> = None;

        for index in pages.pages_in(addr, size) {
            if first_error.is_some() {
                break;
            }
            while in_flight >= limit {
                match rx.recv() {
                    Ok((_, result)) => settle(result, &mut pulled, &mut first_error),
                    Err(_) => break,
                }
                in_flight -= 1;
            }
            if !pages.compare_and_swap_of(index, PageState::Remote, PageState::InFlight) {
                continue;
            }
            let Some(span) = pages.page_span(index) else {
                continue;
            };

            if let Err(err) = self.unprotect(&region, span) {
                pages.abandon_pull(index);
                first_error.get_or_insert(err);
                break;
            }
            region.acquire_pull();
            let done = {
                let region = Arc::clone(&region);
                let arena = Arc::clone(&self.arena);
                let counters = Arc::clone(&self.counters);
                let tx = tx.clone();
                Box::new(move |result: Result<()>| {
                    let result = complete_pull(&region, &arena, &counters, span, result);
                    region.release_pull();
                    let _ = tx.send((span, result));
                })
            };
            match self.transport.read_async(conn, span.address, span.len, done) {
                Ok(()) => in_flight += 1,
                Err(err) => {
                    region.release_pull();
                    pages.abandon_pull(index);
                    self.reprotect(&region, span);
                    first_error.get_or_insert(FabricError::pull_failed(span.address, span.len, err));
                    break;
                }
            }
        }

        while in_flight > 0 {
            match rx.recv() {
                Ok((_, result)) => settle(result, &mut pulled, &mut first_error),
                Err(_) => break,
            }
            in_flight -= 1;
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                tracing::debug!(%addr, size, pulled, limit, "async pull finished");
                Ok(pulled)
            }
        }
    }

    /// Pull every page of `region` that is not yet local.
    pub fn pull_all_pages(&self, region: &Arc<Region>) -> Result<usize> {
        if region.is_resident() {
            return Ok(0);
        }
        let source = region
            .pair()
            .ok_or_else(|| FabricError::violation(region.base(), "region has no source to pull from"))?;
        if region.pages().is_none() {
            self.pull_unpaged(region, source)?;
            return Ok(0);
        }
        let pulled = self.pull_pages_sync(region.base(), region.size(), source)?;
        if !region.is_resident() {
            return Err(FabricError::violation(
                region.base(),
                "pages still remote after pull_all_pages",
            ));
        }
        Ok(pulled)
    }

    /// Pull a whole unpaged region in one read.
    pub fn pull_unpaged(&self, region: &Region, source: NodeId) -> Result<()> {
        if region.is_resident() {
            return Ok(());
        }
        let conn = self.coordinator.resolve(source)?;
        let _guard = region.begin_pull();
        self.transport
            .read(conn, region.base(), region.size())
            .map_err(|err| {
                self.counters.failed_pulls.fetch_add(1, Ordering::Relaxed);
                FabricError::pull_failed(region.base(), region.size(), err)
            })?;
        region.set_resident(true);
        self.counters.pages_pulled.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_pulled
            .fetch_add(region.size() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Read one page whose CAS this thread won.
    fn pull_claimed(
        &self,
        region: &Region,
        pages: &PageTable,
        span: PageSpan,
        source: NodeId,
    ) -> Result<()> {
        let _guard = region.begin_pull();
        let result = self
            .coordinator
            .resolve(source)
            .and_then(|conn| {
                self.unprotect(region, span)?;
                self.transport.read(conn, span.address, span.len)
            });
        match result {
            Ok(()) => {
                pages.set_state_of(span.index, PageState::Local);
                self.counters.pages_pulled.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_pulled
                    .fetch_add(span.len as u64, Ordering::Relaxed);
                tracing::trace!(addr = %span.address, len = span.len, %source, "page pulled");
                Ok(())
            }
            Err(err) => {
                pages.abandon_pull(span.index);
                self.reprotect(region, span);
                self.counters.failed_pulls.fetch_add(1, Ordering::Relaxed);
                Err(FabricError::pull_failed(span.address, span.len, err))
            }
        }
    }

    fn unprotect(&self, region: &Region, span: PageSpan) -> Result<()> {
        if region.is_trap_armed() {
            self.arena.protect(
                span.address,
                align_up(span.len, host_page_size()),
                Protection::ReadWrite,
            )?;
        }
        Ok(())
    }

    fn reprotect(&self, region: &Region, span: PageSpan) {
        reprotect(&self.arena, region, span);
    }

    pub fn stats(&self) -> PagerStats {
        let c = &self.counters;
        PagerStats {
            faults: c.faults.load(Ordering::Relaxed),
            pages_pulled: c.pages_pulled.load(Ordering::Relaxed),
            bytes_pulled: c.bytes_pulled.load(Ordering::Relaxed),
            races: c.races.load(Ordering::Relaxed),
            failed_pulls: c.failed_pulls.load(Ordering::Relaxed),
            regions_armed: c.regions_armed.load(Ordering::Relaxed),
        }
    }
}

fn reprotect(arena: &Arena, region: &Region, span: PageSpan) {
    if region.is_trap_armed() {
        let _ = arena.protect(
            span.address,
            align_up(span.len, host_page_size()),
            Protection::None,
        );
    }
}

fn complete_pull(
    region: &Region,
    arena: &Arena,
    counters: &PagerCounters,
    span: PageSpan,
    result: Result<()>,
) -> Result<()> {
    let Some(pages) = region.pages() else {
        return result;
    };
    match result {
        Ok(()) => {
            pages.set_state_of(span.index, PageState::Local);
            counters.pages_pulled.fetch_add(1, Ordering::Relaxed);
            counters
                .bytes_pulled
                .fetch_add(span.len as u64, Ordering::Relaxed);
            Ok(())
        }
        Err(err) => {
            pages.abandon_pull(span.index);
            reprotect(arena, region, span);
            counters.failed_pulls.fetch_add(1, Ordering::Relaxed);
            Err(FabricError::pull_failed(span.address, span.len, err))
        }
    }
}

fn settle(result: Result<()>, pulled: &mut usize, first_error: &mut Option<FabricError>) {
    match result {
        Ok(()) => *pulled += 1,
        Err(err) => {
            first_error.get_or_insert(err);
        }
    }
}

/// Spin until the page holding `addr` leaves `InFlight`.
fn wait_while_in_flight(pages: &PageTable, addr: RegionAddress) -> PageState {
    loop {
        match pages.get_state(addr) {
            Some(PageState::InFlight) => std::thread::yield_now(),
            Some(state) => return state,
            None => return PageState::Local,
        }
    }
}

#[cfg(all(unix, feature = "fault-trap"))]
impl trap::FaultResolver for DemandPager {
    fn resolve(&self, host_addr: usize) -> trap::TrapVerdict {
        let Some(addr) = self.arena.address_of(host_addr) else {
            return trap::TrapVerdict::NotMine;
        };
        let Some(region) = self.registry.lookup_recursive(addr) else {
            return trap::TrapVerdict::Fatal(format!("no region contains {addr}"));
        };
        if !region.is_trap_armed() {
            return trap::TrapVerdict::NotMine;
        }
        match self.service_fault(addr) {
            Ok(_) => trap::TrapVerdict::Resolved,
            Err(err) => trap::TrapVerdict::Fatal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{AddressSpace, DEFAULT_ALIGNMENT};
    use crate::transport::LoopbackFabric;

    const START: u64 = 1 << 44;

    struct Fixture {
        fabric: Arc<LoopbackFabric>,
        source_arena: Arc<Arena>,
        registry: Arc<RegionRegistry>,
        pager: DemandPager,
    }

    fn fixture() -> Fixture {
        let space = AddressSpace::new(RegionAddress(START), 1 << 20);
        let fabric = LoopbackFabric::with_nodes(&[NodeId(0), NodeId(1)]);
        let source = fabric.endpoint(NodeId(0));
        let dest = fabric.endpoint(NodeId(1));

        let source_arena = Arc::new(Arena::reserve(space).unwrap());
        let dest_arena = Arc::new(Arena::reserve(space).unwrap());
        source.attach(Arc::clone(&source_arena)).unwrap();
        dest.attach(Arc::clone(&dest_arena)).unwrap();
        source
            .register_memory(1, RegionAddress(START), 1 << 20, true)
            .unwrap();

        let registry = Arc::new(RegionRegistry::new(space, DEFAULT_ALIGNMENT, NodeId(1)));
        let pager = DemandPager::new(
            Arc::clone(&registry),
            dest_arena,
            dest,
            fabric.coordinator(NodeId(1)),
            false,
        );
        Fixture {
            fabric,
            source_arena,
            registry,
            pager,
        }
    }

    fn received(fixture: &Fixture, size: usize, page_size: usize) -> Arc<Region> {
        let base = RegionAddress(START);
        let bytes: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        unsafe { fixture.source_arena.copy_in(base, &bytes).unwrap() };
        let region = fixture
            .registry
            .reserve_incoming(base, size, NodeId(0), None)
            .unwrap();
        region.set_page_size(page_size).unwrap();
        region.init_pages(PageState::Remote).unwrap();
        region
    }

    #[test]
    fn test_fault_pulls_only_that_page() {
        let fixture = fixture();
        let region = received(&fixture, 4096, 512);
        let base = region.base();

        fixture.pager.ensure_local(base.offset(2000)).unwrap();
        let states = region.pages().unwrap().states();
        assert_eq!(states[3], PageState::Local);
        assert_eq!(region.pages().unwrap().local_count(), 1);

        fixture.pager.ensure_local(base.offset(10)).unwrap();
        assert_eq!(region.pages().unwrap().local_count(), 2);
        assert_eq!(region.pages().unwrap().state_of(0), PageState::Local);
        assert_eq!(fixture.fabric.stats().reads_issued, 2);
    }

    #[test]
    fn test_service_fault_outcomes() {
        let fixture = fixture();
        let region = received(&fixture, 2048, 1024);
        let addr = region.base().offset(100);

        assert_eq!(fixture.pager.service_fault(addr).unwrap(), FaultResolution::Pulled);
        assert_eq!(
            fixture.pager.service_fault(addr).unwrap(),
            FaultResolution::AlreadyLocal
        );
        assert!(matches!(
            fixture.pager.service_fault(RegionAddress(START + 0x8_0000)),
            Err(FabricError::RegionNotFound(_))
        ));
    }

    #[test]
    fn test_failed_pull_releases_page() {
        let fixture = fixture();
        let region = received(&fixture, 2048, 1024);
        fixture.fabric.set_fail_reads(true);

        let err = fixture.pager.ensure_local(region.base()).unwrap_err();
        assert!(matches!(err, FabricError::PullFailed { .. }));
        assert_eq!(region.pages().unwrap().state_of(0), PageState::Remote);
        assert_eq!(region.outstanding_pulls(), 0);

        fixture.fabric.set_fail_reads(false);
        fixture.pager.ensure_local(region.base()).unwrap();
        assert_eq!(region.pages().unwrap().state_of(0), PageState::Local);
    }

    #[test]
    fn test_pull_all_copies_bytes() {
        let fixture = fixture();
        let region = received(&fixture, 3000, 1024);
        assert_eq!(fixture.pager.pull_all_pages(&region).unwrap(), 3);
        assert!(region.is_resident());

        let mut buf = vec![0u8; 3000];
        let dest = fixture.pager.arena.as_ref();
        unsafe { dest.copy_out(region.base(), &mut buf).unwrap() };
        assert!(buf.iter().enumerate().all(|(i, b)| *b == (i % 251) as u8));
    }

    #[test]
    fn test_async_pull_respects_limit() {
        let fixture = fixture();
        let region = received(&fixture, 8 * 1024, 1024);
        fixture
            .fabric
            .set_read_delay(std::time::Duration::from_millis(2));

        let pulled = fixture
            .pager
            .pull_pages_async(region.base(), region.size(), NodeId(0), 3)
            .unwrap();
        assert_eq!(pulled, 8);
        assert!(region.pages().unwrap().is_fully_local());
        assert!(fixture.fabric.stats().peak_async_reads <= 3);
        assert_eq!(region.outstanding_pulls(), 0);
    }
}
