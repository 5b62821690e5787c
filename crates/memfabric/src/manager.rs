//! The per-node façade.
//!
//! A [`MemoryManager`] owns the local arena, the region registry, the
//! transfer protocol and the demand pager, and runs one listener thread that
//! drains the transport into the protocol's queues. Everything an
//! application does to shared memory goes through it.

use crate::address::{align_up, host_page_size, NodeId, RegionAddress};
use crate::arena::{Arena, Protection};
use crate::config::FabricConfig;
use crate::coordination::{Coordinator, MetadataService, RegionRecord};
use crate::error::{FabricError, Result};
use crate::message::ContainerMeta;
use crate::pager::{DemandPager, PagerStats};
use crate::protocol::{
    AcceptAll, AcceptOutcome, AdmissionPolicy, CloseOutcome, ProtocolStats, TransferProtocol,
};
use crate::recovery::{RecoveryAction, RecoveryDecision, RecoveryPlanner};
use crate::region::{Region, RegionSnapshot, RegionState, TransferPhase};
use crate::registry::{RegionRegistry, RegistryStats};
use crate::transport::Transport;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// Snapshot of every counter of one node.
#[derive(Debug, Clone)]
pub struct ManagerStats {
    pub node: NodeId,
    pub registry: RegistryStats,
    pub protocol: ProtocolStats,
    pub pager: PagerStats,
    /// Pump errors seen by the listener thread
    pub listener_errors: u64,
}

/// Builder for [`MemoryManager`].
pub struct MemoryManagerBuilder {
    transport: Arc<dyn Transport>,
    coordinator: Arc<dyn Coordinator>,
    config: FabricConfig,
    admission: Arc<dyn AdmissionPolicy>,
    metadata: Option<Arc<dyn MetadataService>>,
}

impl MemoryManagerBuilder {
    pub fn config(mut self, config: FabricConfig) -> Self {
        self.config = config;
        self
    }

    /// Policy consulted for every incoming Prepare.
    pub fn admission(mut self, admission: Arc<dyn AdmissionPolicy>) -> Self {
        self.admission = admission;
        self
    }

    /// Keep region records and live lists in `metadata`.
    pub fn metadata(mut self, metadata: Arc<dyn MetadataService>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Map the address space, attach the transport and start the listener.
    pub fn build(self) -> Result<MemoryManager> {
        self.config.validate()?;
        let local = self.coordinator.local_node();

        let arena = Arc::new(Arena::reserve(self.config.address_space)?);
        self.transport.attach(Arc::clone(&arena))?;

        let registry = Arc::new(RegionRegistry::new(
            self.config.address_space,
            self.config.alignment,
            local,
        ));
        let protocol = Arc::new(TransferProtocol::new(
            Arc::clone(&registry),
            Arc::clone(&self.transport),
            Arc::clone(&self.coordinator),
            self.admission,
        ));

        let trap_enabled = self.config.fault_trap && cfg!(all(unix, feature = "fault-trap"));
        if self.config.fault_trap && !trap_enabled {
            tracing::warn!(node = %local, "fault trap not compiled in, using access-checked paging");
        }
        let pager = Arc::new(DemandPager::new(
            Arc::clone(&registry),
            Arc::clone(&arena),
            Arc::clone(&self.transport),
            Arc::clone(&self.coordinator),
            trap_enabled,
        ));

        #[cfg(all(unix, feature = "fault-trap"))]
        let trap = if trap_enabled {
            let (start, end) = arena.host_range();
            let resolver: Arc<dyn crate::pager::trap::FaultResolver> = pager.clone();
            Some(crate::pager::trap::register(start, end, resolver)?)
        } else {
            None
        };

        let listener_errors = Arc::new(AtomicU64::new(0));
        let listener = Listener::spawn(
            local,
            Arc::clone(&protocol),
            self.config.listener_idle_duration(),
            Arc::clone(&listener_errors),
        )?;

        tracing::info!(
            node = %local,
            space_start = %self.config.address_space.start,
            space_len = self.config.address_space.len,
            page_size = ?self.config.default_page_size,
            trap = trap_enabled,
            "memory manager started"
        );

        Ok(MemoryManager {
            config: self.config,
            local,
            arena,
            registry,
            protocol,
            pager,
            transport: self.transport,
            coordinator: self.coordinator,
            metadata: self.metadata,
            pending_accepts: Mutex::new(VecDeque::new()),
            pending_closes: Mutex::new(VecDeque::new()),
            listener: Mutex::new(Some(listener)),
            listener_errors,
            #[cfg(all(unix, feature = "fault-trap"))]
            trap: Mutex::new(trap),
        })
    }
}

struct Listener {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Listener {
    fn spawn(
        node: NodeId,
        protocol: Arc<TransferProtocol>,
        idle: std::time::Duration,
        errors: Arc<AtomicU64>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name(format!("memfabric-listener-{}", node.as_u16()))
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        match protocol.pump() {
                            Ok(0) => std::thread::sleep(idle),
                            Ok(_) => {}
                            Err(err) => {
                                errors.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!(%node, %err, "listener pump failed");
                                std::thread::sleep(idle);
                            }
                        }
                    }
                    tracing::debug!(%node, "listener stopped");
                })?
        };
        Ok(Self { stop, handle })
    }

    fn stop(self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.handle.join();
    }
}

/// One node of the memory fabric.
pub struct MemoryManager {
    config: FabricConfig,
    local: NodeId,
    arena: Arc<Arena>,
    registry: Arc<RegionRegistry>,
    protocol: Arc<TransferProtocol>,
    pager: Arc<DemandPager>,
    transport: Arc<dyn Transport>,
    coordinator: Arc<dyn Coordinator>,
    metadata: Option<Arc<dyn MetadataService>>,
    pending_accepts: Mutex<VecDeque<AcceptOutcome>>,
    pending_closes: Mutex<VecDeque<CloseOutcome>>,
    listener: Mutex<Option<Listener>>,
    listener_errors: Arc<AtomicU64>,
    #[cfg(all(unix, feature = "fault-trap"))]
    trap: Mutex<Option<crate::pager::trap::TrapRegistration>>,
}

impl MemoryManager {
    /// Start building a manager on top of `transport` and `coordinator`.
    pub fn builder(
        transport: Arc<dyn Transport>,
        coordinator: Arc<dyn Coordinator>,
    ) -> MemoryManagerBuilder {
        MemoryManagerBuilder {
            transport,
            coordinator,
            config: FabricConfig::default(),
            admission: Arc::new(AcceptAll),
            metadata: None,
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.local
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RegionRegistry> {
        &self.registry
    }

    // ---- allocation -------------------------------------------------------

    /// Allocate `size` bytes anywhere in the shared space.
    pub fn allocate(&self, size: usize) -> Result<Arc<Region>> {
        let region = self.registry.allocate(size)?;
        self.apply_default_page_size(&region)?;
        Ok(region)
    }

    /// Allocate `size` bytes at exactly `addr`.
    pub fn allocate_at(&self, addr: RegionAddress, size: usize) -> Result<Arc<Region>> {
        let region = self.registry.allocate_at(addr, size)?;
        self.apply_default_page_size(&region)?;
        Ok(region)
    }

    /// Allocate a region carrying a durable application id. With a metadata
    /// service attached the region is recorded and marked live here.
    pub fn allocate_tagged(&self, size: usize, app_id: i64) -> Result<Arc<Region>> {
        let region = self.registry.allocate_tagged(size, app_id)?;
        self.apply_default_page_size(&region)?;
        if let Some(metadata) = &self.metadata {
            let recorded = metadata
                .record_region(RegionRecord {
                    app_id,
                    addr: region.base(),
                    size,
                    source: self.local,
                    destination: None,
                })
                .and_then(|_| metadata.mark_live(self.local, app_id));
            if let Err(err) = recorded {
                let _ = self.registry.deallocate(&region);
                return Err(err);
            }
        }
        Ok(region)
    }

    fn apply_default_page_size(&self, region: &Region) -> Result<()> {
        match self.config.default_page_size {
            Some(page_size) => region.set_page_size(page_size),
            None => Ok(()),
        }
    }

    /// Free `region`. Refused while pulls are in flight or while the region
    /// is engaged in a transfer; a received region must finish its close
    /// handshake first.
    pub fn deallocate(&self, region: &Region) -> Result<()> {
        if region.phase() != TransferPhase::Idle {
            return Err(FabricError::violation(
                region.base(),
                format!("deallocate in phase {:?}", region.phase()),
            ));
        }
        self.release(region)?;
        if let (Some(metadata), Some(app_id)) = (&self.metadata, region.app_id()) {
            metadata.clear_live(self.local, app_id)?;
            metadata.delete_region(app_id)?;
        }
        Ok(())
    }

    /// Free the region tagged `app_id`.
    pub fn deallocate_app(&self, app_id: i64) -> Result<()> {
        let region = self.registry.by_app_id(app_id).ok_or_else(|| {
            FabricError::Metadata(format!("no local region carries app id {app_id}"))
        })?;
        self.deallocate(&region)
    }

    fn release(&self, region: &Region) -> Result<()> {
        self.registry.deallocate(region)?;
        if region.is_trap_armed() {
            // A reused extent must not inherit protected pages.
            let len = align_up(region.size(), host_page_size());
            self.arena
                .protect(region.base(), len, Protection::ReadWrite)?;
            region.set_trap_armed(false);
        }
        Ok(())
    }

    /// Region containing `addr`.
    pub fn region(&self, addr: RegionAddress) -> Option<Arc<Region>> {
        self.registry.lookup(addr)
    }

    /// Enable paging for `region` before it is offered to a peer.
    pub fn set_page_size(&self, region: &Region, page_size: usize) -> Result<()> {
        region.set_page_size(page_size)
    }

    // ---- transfer, source side --------------------------------------------

    /// Offer `region` to `destination`. Non-blocking.
    pub fn prepare(&self, region: &Arc<Region>, destination: NodeId) -> Result<()> {
        self.protocol.prepare(region, destination, None)
    }

    /// Offer `region` together with the typed container it holds.
    pub fn prepare_container(
        &self,
        region: &Arc<Region>,
        destination: NodeId,
        container: ContainerMeta,
    ) -> Result<()> {
        self.protocol.prepare(region, destination, Some(container))
    }

    /// Next answer to one of our Prepares, if any.
    pub fn poll_for_accept(&self) -> Result<Option<AcceptOutcome>> {
        if let Some(outcome) = self.pending_accepts.lock().pop_front() {
            return Ok(Some(outcome));
        }
        self.protocol.poll_for_accept()
    }

    /// Spin until `region`'s Prepare is answered. Answers for other regions
    /// stay queued for [`MemoryManager::poll_for_accept`].
    pub fn wait_for_accept(&self, region: &Region) -> Result<AcceptOutcome> {
        loop {
            if let Some(outcome) = self.take_pending_accept(region.base()) {
                return Ok(outcome);
            }
            match self.protocol.poll_for_accept()? {
                Some(outcome) if outcome.region().base() == region.base() => return Ok(outcome),
                Some(other) => self.pending_accepts.lock().push_back(other),
                None => std::thread::yield_now(),
            }
        }
    }

    fn take_pending_accept(&self, base: RegionAddress) -> Option<AcceptOutcome> {
        let mut pending = self.pending_accepts.lock();
        let index = pending.iter().position(|o| o.region().base() == base)?;
        pending.remove(index)
    }

    /// Hand `region` over to `destination` after its Accept.
    pub fn transfer(&self, region: &Arc<Region>, destination: NodeId) -> Result<()> {
        self.protocol.transfer(region, destination)?;
        if let (Some(metadata), Some(app_id)) = (&self.metadata, region.app_id()) {
            metadata.update_destination(app_id, destination)?;
        }
        Ok(())
    }

    /// Prepare, wait for the answer and transfer.
    ///
    /// A Decline leaves the region Owned here and is reported as
    /// [`FabricError::TransferDeclined`].
    pub fn migrate(&self, region: &Arc<Region>, destination: NodeId) -> Result<()> {
        let started = Instant::now();
        self.prepare(region, destination)?;
        match self.wait_for_accept(region)? {
            AcceptOutcome::Accepted(_) => {
                self.transfer(region, destination)?;
                tracing::debug!(
                    addr = %region.base(),
                    %destination,
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "region migrated"
                );
                Ok(())
            }
            AcceptOutcome::Declined { reason, .. } => Err(FabricError::TransferDeclined {
                addr: region.base(),
                destination,
                reason,
            }),
        }
    }

    /// Push the bytes of `region` into `destination`'s copy, which must be
    /// registered for remote access there.
    pub fn push(&self, region: &Region, destination: NodeId) -> Result<()> {
        if !region.is_resident() {
            return Err(FabricError::violation(
                region.base(),
                "cannot push a region that is not local",
            ));
        }
        let conn = self.coordinator.resolve(destination)?;
        self.transport.write(conn, region.base(), region.size())
    }

    // ---- transfer, destination side ---------------------------------------

    /// Next region handed to this node, if any.
    ///
    /// Paged regions are armed for the fault trap when it is in use;
    /// unpaged regions are pulled in full when eager pulls are on.
    pub fn poll_for_transfer(&self) -> Result<Option<Arc<Region>>> {
        let Some(region) = self.protocol.poll_for_transfer()? else {
            return Ok(None);
        };
        if region.pages().is_some() {
            self.pager.arm(&region)?;
        } else if self.config.eager_pull {
            let source = self.source_of(&region)?;
            self.pager.pull_unpaged(&region, source)?;
        }
        Ok(Some(region))
    }

    /// Spin until a region is handed to this node.
    pub fn wait_for_transfer(&self) -> Result<Arc<Region>> {
        loop {
            if let Some(region) = self.poll_for_transfer()? {
                return Ok(region);
            }
            std::thread::yield_now();
        }
    }

    /// Finish receiving `region`.
    pub fn close(&self, region: &Arc<Region>) -> Result<()> {
        self.protocol.close(region)
    }

    /// Next completed close handshake, if any.
    pub fn poll_for_close(&self) -> Result<Option<CloseOutcome>> {
        if let Some(outcome) = self.pending_closes.lock().pop_front() {
            return Ok(Some(outcome));
        }
        let outcome = self.protocol.poll_for_close()?;
        if let Some(outcome) = &outcome {
            self.record_close(outcome)?;
        }
        Ok(outcome)
    }

    /// Spin until `region`'s close handshake completes on this node.
    pub fn wait_for_close(&self, region: &Region) -> Result<CloseOutcome> {
        loop {
            if let Some(outcome) = self.take_pending_close(region.base()) {
                return Ok(outcome);
            }
            match self.protocol.poll_for_close()? {
                Some(outcome) => {
                    self.record_close(&outcome)?;
                    if outcome.region().base() == region.base() {
                        return Ok(outcome);
                    }
                    self.pending_closes.lock().push_back(outcome);
                }
                None => std::thread::yield_now(),
            }
        }
    }

    fn take_pending_close(&self, base: RegionAddress) -> Option<CloseOutcome> {
        let mut pending = self.pending_closes.lock();
        let index = pending.iter().position(|o| o.region().base() == base)?;
        pending.remove(index)
    }

    fn record_close(&self, outcome: &CloseOutcome) -> Result<()> {
        let (Some(metadata), Some(app_id)) = (&self.metadata, outcome.region().app_id()) else {
            return Ok(());
        };
        match outcome {
            CloseOutcome::Released(_) => metadata.clear_live(self.local, app_id),
            CloseOutcome::Completed(region) => {
                metadata.record_region(RegionRecord {
                    app_id,
                    addr: region.base(),
                    size: region.size(),
                    source: self.local,
                    destination: None,
                })?;
                metadata.mark_live(self.local, app_id)
            }
        }
    }

    // ---- paging ------------------------------------------------------------

    /// Fetch every missing byte of `region` from its source, paged regions
    /// with bounded async concurrency. Returns the pages pulled.
    pub fn pull(&self, region: &Region) -> Result<usize> {
        let source = self.source_of(region)?;
        if region.pages().is_none() {
            self.pager.pull_unpaged(region, source)?;
            return Ok(0);
        }
        self.pager.pull_pages_async(
            region.base(),
            region.size(),
            source,
            self.config.async_pull_limit,
        )
    }

    pub fn pull_pages_sync(&self, addr: RegionAddress, size: usize, source: NodeId) -> Result<usize> {
        self.pager.pull_pages_sync(addr, size, source)
    }

    pub fn pull_pages_async(
        &self,
        addr: RegionAddress,
        size: usize,
        source: NodeId,
        rate_limit: usize,
    ) -> Result<usize> {
        self.pager.pull_pages_async(addr, size, source, rate_limit)
    }

    /// Pull until every page of `region` is Local.
    pub fn pull_all_pages(&self, region: &Arc<Region>) -> Result<usize> {
        let started = Instant::now();
        let pulled = self.pager.pull_all_pages(region)?;
        crate::tracing_support::record_migration(
            region.base(),
            region.size(),
            pulled,
            started.elapsed().as_micros() as u64,
        );
        Ok(pulled)
    }

    /// Make the byte at `addr` local.
    pub fn ensure_local(&self, addr: RegionAddress) -> Result<()> {
        self.pager.ensure_local(addr)
    }

    fn source_of(&self, region: &Region) -> Result<NodeId> {
        region
            .pair()
            .ok_or_else(|| FabricError::violation(region.base(), "region has no source to pull from"))
    }

    fn make_local(&self, region: &Region, addr: RegionAddress, len: usize) -> Result<()> {
        if region.is_resident() {
            return Ok(());
        }
        if region.pages().is_none() {
            let source = self.source_of(region)?;
            return self.pager.pull_unpaged(region, source);
        }
        self.pager.ensure_range_local(addr, len)
    }

    // ---- access ------------------------------------------------------------

    fn accessible(&self, addr: RegionAddress, len: usize) -> Result<Arc<Region>> {
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
        if region.state() == RegionState::Invalid {
            return Err(FabricError::violation(region.base(), "region has not arrived yet"));
        }
        Ok(region)
    }

    /// Copy `buf.len()` bytes at `addr` into `buf`, pulling missing pages.
    pub fn read(&self, addr: RegionAddress, buf: &mut [u8]) -> Result<()> {
        let region = self.accessible(addr, buf.len())?;
        self.make_local(&region, addr, buf.len())?;
        // SAFETY: the range is local and unprotected; concurrent writers are
        // the caller's concern, as with any shared memory.
        unsafe { self.arena.copy_out(addr, buf) }
    }

    /// Copy `data` to `addr`. Only the owner may write, and a source stops
    /// being the owner once it has transferred the region.
    pub fn write(&self, addr: RegionAddress, data: &[u8]) -> Result<()> {
        let region = self.accessible(addr, data.len())?;
        if region.state() != RegionState::Owned || region.owner() != self.local {
            return Err(FabricError::violation(
                region.base(),
                format!("write to a region in state {:?}", region.state()),
            ));
        }
        // Pulling after the write would clobber it.
        self.make_local(&region, addr, data.len())?;
        // SAFETY: as in `read`.
        unsafe { self.arena.copy_in(addr, data) }
    }

    /// Host pointer to `[addr, addr + len)`. With the fault trap armed the
    /// bytes may be dereferenced directly; otherwise call
    /// [`MemoryManager::ensure_local`] first.
    pub fn host_ptr(&self, addr: RegionAddress, len: usize) -> Result<*mut u8> {
        self.accessible(addr, len)?;
        self.arena.host_ptr(addr, len)
    }

    // ---- recovery ------------------------------------------------------------

    /// Settle every region the failed node took part in, using the attached
    /// metadata service. Returns the decisions that were applied.
    pub fn recover_from_failure(&self, failed: NodeId) -> Result<Vec<RecoveryDecision>> {
        let metadata = self
            .metadata
            .as_ref()
            .ok_or_else(|| FabricError::Metadata("no metadata service attached".into()))?;
        let decisions = RecoveryPlanner::new(metadata.as_ref()).plan(failed);

        for decision in &decisions {
            let record = &decision.record;
            let local = self.registry.by_app_id(record.app_id);
            match decision.action {
                RecoveryAction::Deallocate => {
                    if let Some(region) = local {
                        self.release(&region)?;
                    }
                    metadata.clear_live(self.local, record.app_id)?;
                    metadata.clear_live(failed, record.app_id)?;
                    metadata.delete_region(record.app_id)?;
                }
                RecoveryAction::Keep { holder } if holder == self.local => {
                    if let Some(region) = local {
                        self.reclaim(&region);
                    }
                    metadata.clear_live(failed, record.app_id)?;
                    metadata.record_region(RegionRecord {
                        source: self.local,
                        destination: None,
                        ..record.clone()
                    })?;
                }
                RecoveryAction::Keep { .. } => {}
            }
        }

        tracing::info!(
            node = %self.local,
            %failed,
            decisions = decisions.len(),
            "recovered from node failure"
        );
        Ok(decisions)
    }

    /// Take sole ownership of a region whose peer died mid-transfer.
    fn reclaim(&self, region: &Region) {
        let snapshot = region.snapshot();
        if snapshot.phase == TransferPhase::Idle && snapshot.state == RegionState::Owned {
            return;
        }
        if let Some(peer) = snapshot.pair {
            if let Ok(conn) = self.coordinator.resolve(peer) {
                let _ = self.transport.deregister_memory(conn, region.base());
            }
        }
        let local = self.local;
        let _ = region.transition(snapshot.phase, |s| RegionSnapshot {
            owner: local,
            pair: None,
            state: RegionState::Owned,
            phase: TransferPhase::Idle,
            ..s
        });
    }

    // ---- lifecycle -----------------------------------------------------------

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            node: self.local,
            registry: self.registry.stats(),
            protocol: self.protocol.stats(),
            pager: self.pager.stats(),
            listener_errors: self.listener_errors.load(Ordering::Relaxed),
        }
    }

    /// Stop the listener and release the fault trap. Idempotent.
    pub fn shutdown(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.stop();
            tracing::info!(node = %self.local, "memory manager stopped");
        }
        #[cfg(all(unix, feature = "fault-trap"))]
        drop(self.trap.lock().take());
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("node", &self.local)
            .field("regions", &self.registry.len())
            .field("arena", &self.arena)
            .finish()
    }
}
