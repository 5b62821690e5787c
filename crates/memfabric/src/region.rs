//! Regions and their atomically swapped ownership snapshot.
//!
//! Owner, pair, coherence state and transfer phase of a [`Region`] are packed
//! into a single `AtomicU64` together with a generation counter. Readers
//! always see a consistent `(owner, state)` pair, and every protocol step is
//! a compare-and-swap conditioned on the expected [`TransferPhase`].

use crate::address::{NodeId, RegionAddress};
use crate::error::{FabricError, Result};
use crate::message::ContainerMeta;
use crate::page_table::{PageState, PageTable};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

/// Coherence state of a region as seen by one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RegionState {
    Dirty = 0,
    Invalid = 1,
    Shared = 2,
    Clean = 3,
    Owned = 4,
}

impl RegionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RegionState::Dirty,
            1 => RegionState::Invalid,
            2 => RegionState::Shared,
            3 => RegionState::Clean,
            _ => RegionState::Owned,
        }
    }
}

/// Where a region sits in the ownership transfer handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransferPhase {
    /// No transfer in progress
    Idle = 0,
    /// Source: registering memory and sending Prepare
    Preparing = 1,
    /// Source: Prepare sent, waiting for Accept or Decline
    AwaitingAccept = 2,
    /// Source: Accept received, Transfer may be sent
    Transferring = 3,
    /// Source: Transfer sent, waiting for the destination's Done
    AwaitingClose = 4,
    /// Destination: Prepare accepted, waiting for Transfer
    AwaitingTransfer = 5,
    /// Destination: Transfer received, pages arriving
    Received = 6,
    /// Destination: Done sent, waiting for the source's Done
    Closing = 7,
}

impl TransferPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TransferPhase::Preparing,
            2 => TransferPhase::AwaitingAccept,
            3 => TransferPhase::Transferring,
            4 => TransferPhase::AwaitingClose,
            5 => TransferPhase::AwaitingTransfer,
            6 => TransferPhase::Received,
            7 => TransferPhase::Closing,
            _ => TransferPhase::Idle,
        }
    }
}

const NO_PAIR: u16 = u16::MAX;

/// Consistent view of a region's ownership metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSnapshot {
    pub owner: NodeId,
    pub pair: Option<NodeId>,
    pub state: RegionState,
    pub phase: TransferPhase,
    /// Bumped on every successful transition
    pub generation: u16,
}

impl RegionSnapshot {
    fn pack(self) -> u64 {
        let pair = self.pair.map(NodeId::as_u16).unwrap_or(NO_PAIR);
        (self.state as u64)
            | ((self.phase as u64) << 8)
            | ((self.owner.as_u16() as u64) << 16)
            | ((pair as u64) << 32)
            | ((self.generation as u64) << 48)
    }

    fn unpack(raw: u64) -> Self {
        let pair = ((raw >> 32) & 0xFFFF) as u16;
        Self {
            state: RegionState::from_u8((raw & 0xFF) as u8),
            phase: TransferPhase::from_u8(((raw >> 8) & 0xFF) as u8),
            owner: NodeId(((raw >> 16) & 0xFFFF) as u16),
            pair: (pair != NO_PAIR).then_some(NodeId(pair)),
            generation: (raw >> 48) as u16,
        }
    }
}

/// A contiguous extent of the shared address space.
pub struct Region {
    base: RegionAddress,
    size: usize,
    app_id: Option<i64>,
    meta: AtomicU64,
    page_size: AtomicUsize,
    pages: OnceLock<PageTable>,
    container: Mutex<Option<ContainerMeta>>,
    outstanding_pulls: AtomicUsize,
    trap_armed: AtomicBool,
    resident: AtomicBool,
}

impl Region {
    /// A locally allocated region, owned by `owner` with its bytes present.
    pub fn new_owned(base: RegionAddress, size: usize, owner: NodeId, app_id: Option<i64>) -> Self {
        Self::build(
            base,
            size,
            app_id,
            RegionSnapshot {
                owner,
                pair: None,
                state: RegionState::Owned,
                phase: TransferPhase::Idle,
                generation: 0,
            },
            true,
        )
    }

    /// Placeholder reserved by an accepted Prepare, not yet owned locally.
    pub fn incoming(base: RegionAddress, size: usize, source: NodeId, app_id: Option<i64>) -> Self {
        Self::build(
            base,
            size,
            app_id,
            RegionSnapshot {
                owner: source,
                pair: Some(source),
                state: RegionState::Invalid,
                phase: TransferPhase::AwaitingTransfer,
                generation: 0,
            },
            false,
        )
    }

    fn build(
        base: RegionAddress,
        size: usize,
        app_id: Option<i64>,
        snapshot: RegionSnapshot,
        resident: bool,
    ) -> Self {
        Self {
            base,
            size,
            app_id,
            meta: AtomicU64::new(snapshot.pack()),
            page_size: AtomicUsize::new(0),
            pages: OnceLock::new(),
            container: Mutex::new(None),
            outstanding_pulls: AtomicUsize::new(0),
            trap_armed: AtomicBool::new(false),
            resident: AtomicBool::new(resident),
        }
    }

    /// First address.
    pub fn base(&self) -> RegionAddress {
        self.base
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last address.
    pub fn end(&self) -> RegionAddress {
        self.base.offset(self.size)
    }

    /// Whether `addr` lies inside `[base, base + size)`.
    pub fn contains(&self, addr: RegionAddress) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Whether `[addr, addr + len)` lies inside the region.
    pub fn contains_range(&self, addr: RegionAddress, len: usize) -> bool {
        addr >= self.base && addr.0.saturating_add(len as u64) <= self.end().0
    }

    /// Durable application id, if the region was tagged.
    pub fn app_id(&self) -> Option<i64> {
        self.app_id
    }

    /// Current ownership snapshot.
    pub fn snapshot(&self) -> RegionSnapshot {
        RegionSnapshot::unpack(self.meta.load(Ordering::Acquire))
    }

    pub fn owner(&self) -> NodeId {
        self.snapshot().owner
    }

    pub fn state(&self) -> RegionState {
        self.snapshot().state
    }

    pub fn phase(&self) -> TransferPhase {
        self.snapshot().phase
    }

    pub fn pair(&self) -> Option<NodeId> {
        self.snapshot().pair
    }

    /// Atomically apply `f` if the region is in `expected` phase.
    ///
    /// Returns the new snapshot, or `ProtocolViolation` naming the phase
    /// actually observed.
    pub fn transition<F>(&self, expected: TransferPhase, f: F) -> Result<RegionSnapshot>
    where
        F: Fn(RegionSnapshot) -> RegionSnapshot,
    {
        let mut current = self.meta.load(Ordering::Acquire);
        loop {
            let snapshot = RegionSnapshot::unpack(current);
            if snapshot.phase != expected {
                return Err(FabricError::violation(
                    self.base,
                    format!("expected phase {:?}, found {:?}", expected, snapshot.phase),
                ));
            }
            let mut next = f(snapshot);
            next.generation = snapshot.generation.wrapping_add(1);
            match self.meta.compare_exchange_weak(
                current,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(next),
                Err(observed) => current = observed,
            }
        }
    }

    /// Configured page size; `None` means paging is disabled.
    pub fn page_size(&self) -> Option<usize> {
        match self.page_size.load(Ordering::Acquire) {
            0 => None,
            size => Some(size),
        }
    }

    /// Enable paging for this region.
    ///
    /// Fails once the page table exists, since its geometry is fixed.
    pub fn set_page_size(&self, page_size: usize) -> Result<()> {
        if page_size == 0 {
            return Err(FabricError::InvalidPageSize(page_size));
        }
        if self.pages.get().is_some() {
            return Err(FabricError::violation(
                self.base,
                "page size cannot change after the page table exists",
            ));
        }
        self.page_size.store(page_size, Ordering::Release);
        Ok(())
    }

    /// Page table, if one has been initialised.
    pub fn pages(&self) -> Option<&PageTable> {
        self.pages.get()
    }

    /// Initialise the page table with every page in `state`.
    ///
    /// Idempotent: a second call returns the existing table.
    pub fn init_pages(&self, state: PageState) -> Result<&PageTable> {
        let page_size = self
            .page_size()
            .ok_or_else(|| FabricError::violation(self.base, "paging is not enabled"))?;
        if let Some(table) = self.pages.get() {
            return Ok(table);
        }
        let table = PageTable::with_state(self.base, self.size, page_size, state)?;
        Ok(self.pages.get_or_init(|| table))
    }

    /// Container metadata attached by a Prepare or Transfer.
    pub fn container(&self) -> Option<ContainerMeta> {
        *self.container.lock()
    }

    pub fn set_container(&self, meta: Option<ContainerMeta>) {
        *self.container.lock() = meta;
    }

    /// Whether the region's bytes are present locally in full.
    pub fn is_resident(&self) -> bool {
        self.resident.load(Ordering::Acquire)
            || self.pages().is_some_and(PageTable::is_fully_local)
    }

    pub(crate) fn set_resident(&self, resident: bool) {
        self.resident.store(resident, Ordering::Release);
    }

    /// Whether the byte at `addr` may be accessed locally.
    pub fn is_local_at(&self, addr: RegionAddress) -> bool {
        if self.resident.load(Ordering::Acquire) {
            return true;
        }
        self.pages()
            .and_then(|table| table.get_state(addr))
            .is_some_and(|state| state == PageState::Local)
    }

    /// Number of pulls currently reading into this region.
    pub fn outstanding_pulls(&self) -> usize {
        self.outstanding_pulls.load(Ordering::Acquire)
    }

    /// Count a pull until the guard is dropped.
    pub fn begin_pull(&self) -> PullGuard<'_> {
        self.outstanding_pulls.fetch_add(1, Ordering::AcqRel);
        PullGuard { region: self }
    }

    pub(crate) fn acquire_pull(&self) {
        self.outstanding_pulls.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_pull(&self) {
        self.outstanding_pulls.fetch_sub(1, Ordering::AcqRel);
    }

    /// Whether Remote pages are protected for the fault trap.
    pub fn is_trap_armed(&self) -> bool {
        self.trap_armed.load(Ordering::Acquire)
    }

    pub(crate) fn set_trap_armed(&self, armed: bool) {
        self.trap_armed.store(armed, Ordering::Release);
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("Region")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("owner", &snapshot.owner)
            .field("pair", &snapshot.pair)
            .field("state", &snapshot.state)
            .field("phase", &snapshot.phase)
            .field("page_size", &self.page_size())
            .field("app_id", &self.app_id)
            .finish()
    }
}

/// Holds one outstanding-pull count on a region.
pub struct PullGuard<'a> {
    region: &'a Region,
}

impl Drop for PullGuard<'_> {
    fn drop(&mut self) {
        self.region.release_pull();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> Region {
        Region::new_owned(RegionAddress(0x4000), 4096, NodeId(1), None)
    }

    #[test]
    fn test_snapshot_packing() {
        let snapshot = RegionSnapshot {
            owner: NodeId(42),
            pair: Some(NodeId(7)),
            state: RegionState::Shared,
            phase: TransferPhase::AwaitingClose,
            generation: 900,
        };
        assert_eq!(RegionSnapshot::unpack(snapshot.pack()), snapshot);

        let unpaired = RegionSnapshot { pair: None, ..snapshot };
        assert_eq!(RegionSnapshot::unpack(unpaired.pack()).pair, None);
    }

    #[test]
    fn test_transition_checks_phase() {
        let region = region();
        let next = region
            .transition(TransferPhase::Idle, |s| RegionSnapshot {
                phase: TransferPhase::AwaitingAccept,
                pair: Some(NodeId(2)),
                ..s
            })
            .unwrap();
        assert_eq!(next.generation, 1);
        assert_eq!(region.pair(), Some(NodeId(2)));

        let err = region
            .transition(TransferPhase::Idle, |s| s)
            .unwrap_err();
        assert!(matches!(err, FabricError::ProtocolViolation { .. }));
    }

    #[test]
    fn test_paging_setup() {
        let region = region();
        assert!(region.page_size().is_none());
        assert!(region.init_pages(PageState::Remote).is_err());
        assert!(region.set_page_size(0).is_err());

        region.set_page_size(1024).unwrap();
        let table = region.init_pages(PageState::Remote).unwrap();
        assert_eq!(table.num_pages(), 4);
        assert!(region.set_page_size(512).is_err());
    }

    #[test]
    fn test_pull_guard_counts() {
        let region = region();
        {
            let _a = region.begin_pull();
            let _b = region.begin_pull();
            assert_eq!(region.outstanding_pulls(), 2);
        }
        assert_eq!(region.outstanding_pulls(), 0);
    }

    #[test]
    fn test_incoming_placeholder() {
        let region = Region::incoming(RegionAddress(0x8000), 100, NodeId(1), Some(5));
        assert_eq!(region.state(), RegionState::Invalid);
        assert_eq!(region.phase(), TransferPhase::AwaitingTransfer);
        assert!(!region.is_resident());
        assert!(!region.is_local_at(RegionAddress(0x8000)));
        assert_eq!(region.app_id(), Some(5));
    }
}
