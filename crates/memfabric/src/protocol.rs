//! Ownership transfer handshake.
//!
//! ```text
//! source                                   destination
//! Idle -> AwaitingAccept  --Prepare-->     (listener) placeholder, AwaitingTransfer
//!         Transferring    <--Accept--
//!         AwaitingClose   --Transfer-->    Received (owner = self, pages Remote)
//!                         <--Done----      Closing
//! released, Idle          --Done---->      Idle
//! ```
//!
//! The listener thread calls [`TransferProtocol::pump`], which answers
//! Prepare directly and files every other message into one of three
//! lock-free queues. The polling calls each consume one queued message.
//! Every local state change is a compare-and-swap on the region snapshot
//! conditioned on the expected phase, so a step issued out of order fails
//! with `ProtocolViolation` instead of corrupting ownership.

use crate::address::{NodeId, RegionAddress};
use crate::coordination::Coordinator;
use crate::error::{FabricError, Result};
use crate::message::{ContainerMeta, ControlMessage, DeclineReason, PrepareRequest};
use crate::page_table::PageState;
use crate::region::{Region, RegionSnapshot, RegionState, TransferPhase};
use crate::registry::RegionRegistry;
use crate::transport::{ConnId, Transport, TransportExt};
use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Verdict of an [`AdmissionPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    Decline(DeclineReason),
}

/// Decides whether this node takes incoming regions.
pub trait AdmissionPolicy: Send + Sync {
    fn admit(&self, from: NodeId, request: &PrepareRequest) -> Admission;
}

/// Accept every region whose address is free.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl AdmissionPolicy for AcceptAll {
    fn admit(&self, _from: NodeId, _request: &PrepareRequest) -> Admission {
        Admission::Accept
    }
}

/// Refuse every region.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclineAll;

impl AdmissionPolicy for DeclineAll {
    fn admit(&self, _from: NodeId, _request: &PrepareRequest) -> Admission {
        Admission::Decline(DeclineReason::Refused)
    }
}

/// Answer to a Prepare, as seen by the source.
#[derive(Debug, Clone)]
pub enum AcceptOutcome {
    /// The destination reserved the address; [`TransferProtocol::transfer`] may follow
    Accepted(Arc<Region>),
    /// The region stays owned here
    Declined {
        region: Arc<Region>,
        reason: DeclineReason,
    },
}

impl AcceptOutcome {
    pub fn region(&self) -> &Arc<Region> {
        match self {
            AcceptOutcome::Accepted(region) | AcceptOutcome::Declined { region, .. } => region,
        }
    }
}

/// A completed close handshake.
#[derive(Debug, Clone)]
pub enum CloseOutcome {
    /// Source side: the local copy was released
    Released(Arc<Region>),
    /// Destination side: the region is now exclusively ours
    Completed(Arc<Region>),
}

impl CloseOutcome {
    pub fn region(&self) -> &Arc<Region> {
        match self {
            CloseOutcome::Released(region) | CloseOutcome::Completed(region) => region,
        }
    }
}

/// Statistics of the transfer protocol.
#[derive(Debug, Clone, Default)]
pub struct ProtocolStats {
    pub prepares_sent: u64,
    pub prepares_accepted: u64,
    pub prepares_declined: u64,
    pub transfers_sent: u64,
    pub transfers_received: u64,
    pub closes_sent: u64,
    pub regions_released: u64,
    /// Messages dropped because no region was waiting for them
    pub unexpected_messages: u64,
}

#[derive(Default)]
struct ProtocolCounters {
    prepares_sent: AtomicU64,
    prepares_accepted: AtomicU64,
    prepares_declined: AtomicU64,
    transfers_sent: AtomicU64,
    transfers_received: AtomicU64,
    closes_sent: AtomicU64,
    regions_released: AtomicU64,
    unexpected_messages: AtomicU64,
}

struct Incoming {
    from: NodeId,
    message: ControlMessage,
}

/// One node's side of the transfer handshake.
pub struct TransferProtocol {
    registry: Arc<RegionRegistry>,
    transport: Arc<dyn Transport>,
    coordinator: Arc<dyn Coordinator>,
    admission: Arc<dyn AdmissionPolicy>,
    incoming_transfers: SegQueue<Incoming>,
    incoming_accepts: SegQueue<Incoming>,
    incoming_dones: SegQueue<Incoming>,
    counters: ProtocolCounters,
}

impl TransferProtocol {
    pub fn new(
        registry: Arc<RegionRegistry>,
        transport: Arc<dyn Transport>,
        coordinator: Arc<dyn Coordinator>,
        admission: Arc<dyn AdmissionPolicy>,
    ) -> Self {
        Self {
            registry,
            transport,
            coordinator,
            admission,
            incoming_transfers: SegQueue::new(),
            incoming_accepts: SegQueue::new(),
            incoming_dones: SegQueue::new(),
            counters: ProtocolCounters::default(),
        }
    }

    fn local(&self) -> NodeId {
        self.coordinator.local_node()
    }

    /// Offer `region` to `destination`. Non-blocking.
    #[tracing::instrument(level = "debug", skip(self, region, container), fields(addr = %region.base()))]
    pub fn prepare(
        &self,
        region: &Arc<Region>,
        destination: NodeId,
        container: Option<ContainerMeta>,
    ) -> Result<()> {
        if destination == self.local() {
            return Err(FabricError::violation(region.base(), "cannot transfer to self"));
        }
        if region.state() != RegionState::Owned {
            return Err(FabricError::violation(
                region.base(),
                format!("region is {:?}, not Owned", region.state()),
            ));
        }
        if !region.is_resident() {
            return Err(FabricError::violation(
                region.base(),
                "region bytes are not fully local",
            ));
        }
        let conn = self.coordinator.resolve(destination)?;

        region.transition(TransferPhase::Idle, |s| RegionSnapshot {
            phase: TransferPhase::Preparing,
            pair: Some(destination),
            ..s
        })?;

        let revert = |err: FabricError| {
            let _ = region.transition(region.phase(), |s| RegionSnapshot {
                phase: TransferPhase::Idle,
                pair: None,
                ..s
            });
            err
        };

        self.transport
            .register_memory(conn, region.base(), region.size(), true)
            .map_err(revert)?;
        if container.is_some() {
            region.set_container(container);
        }
        region
            .transition(TransferPhase::Preparing, |s| RegionSnapshot {
                phase: TransferPhase::AwaitingAccept,
                ..s
            })
            .map_err(revert)?;

        let request = PrepareRequest {
            addr: region.base(),
            size: region.size(),
            page_size: region.page_size(),
            app_id: region.app_id(),
            container: region.container(),
        };
        if let Err(err) = self.transport.send_prepare(conn, request) {
            let _ = self.transport.deregister_memory(conn, region.base());
            return Err(revert(err));
        }

        self.counters.prepares_sent.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%destination, size = region.size(), "prepare sent");
        Ok(())
    }

    /// Consume one Accept or Decline, if any has arrived.
    pub fn poll_for_accept(&self) -> Result<Option<AcceptOutcome>> {
        while let Some(Incoming { from, message }) = self.incoming_accepts.pop() {
            let addr = message.addr();
            let Some(region) = self.awaiting(addr, from, TransferPhase::AwaitingAccept) else {
                self.drop_unexpected(from, &message);
                continue;
            };

            match message {
                ControlMessage::Accept { .. } => {
                    region.transition(TransferPhase::AwaitingAccept, |s| RegionSnapshot {
                        phase: TransferPhase::Transferring,
                        ..s
                    })?;
                    self.counters.prepares_accepted.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(%addr, %from, "prepare accepted");
                    return Ok(Some(AcceptOutcome::Accepted(region)));
                }
                ControlMessage::Decline { reason, .. } => {
                    region.transition(TransferPhase::AwaitingAccept, |s| RegionSnapshot {
                        phase: TransferPhase::Idle,
                        pair: None,
                        ..s
                    })?;
                    let conn = self.coordinator.resolve(from)?;
                    self.transport.deregister_memory(conn, addr)?;
                    self.counters.prepares_declined.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(%addr, %from, ?reason, "prepare declined");
                    return Ok(Some(AcceptOutcome::Declined { region, reason }));
                }
                other => self.drop_unexpected(from, &other),
            }
        }
        Ok(None)
    }

    /// Hand `region` over to `destination`, which must have accepted it.
    #[tracing::instrument(level = "debug", skip(self, region), fields(addr = %region.base()))]
    pub fn transfer(&self, region: &Arc<Region>, destination: NodeId) -> Result<()> {
        let snapshot = region.snapshot();
        if snapshot.phase != TransferPhase::Transferring || snapshot.pair != Some(destination) {
            return Err(FabricError::violation(
                region.base(),
                format!(
                    "transfer to {destination} without its Accept (phase {:?}, pair {:?})",
                    snapshot.phase, snapshot.pair
                ),
            ));
        }
        let conn = self.coordinator.resolve(destination)?;

        region.transition(TransferPhase::Transferring, |s| RegionSnapshot {
            phase: TransferPhase::AwaitingClose,
            state: RegionState::Shared,
            owner: destination,
            ..s
        })?;

        if let Err(err) =
            self.transport
                .send_transfer(conn, region.base(), region.size(), region.container())
        {
            let local = self.local();
            let _ = region.transition(TransferPhase::AwaitingClose, |s| RegionSnapshot {
                phase: TransferPhase::Transferring,
                state: RegionState::Owned,
                owner: local,
                ..s
            });
            return Err(err);
        }

        self.counters.transfers_sent.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%destination, "ownership transferred");
        Ok(())
    }

    /// Consume one Transfer, making this node the region's owner.
    ///
    /// When the region carries a page size, its page table starts with
    /// every page Remote.
    pub fn poll_for_transfer(&self) -> Result<Option<Arc<Region>>> {
        while let Some(Incoming { from, message }) = self.incoming_transfers.pop() {
            let ControlMessage::Transfer { addr, container, .. } = message else {
                self.drop_unexpected(from, &message);
                continue;
            };
            let Some(region) = self.awaiting(addr, from, TransferPhase::AwaitingTransfer) else {
                self.drop_unexpected(from, &message);
                continue;
            };

            let local = self.local();
            region.transition(TransferPhase::AwaitingTransfer, |s| RegionSnapshot {
                phase: TransferPhase::Received,
                state: RegionState::Owned,
                owner: local,
                pair: Some(from),
                ..s
            })?;
            if container.is_some() {
                region.set_container(container);
            }
            if region.page_size().is_some() {
                region.init_pages(PageState::Remote)?;
            }

            self.counters.transfers_received.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%addr, %from, paged = region.page_size().is_some(), "region received");
            return Ok(Some(region));
        }
        Ok(None)
    }

    /// Finish receiving `region`: every byte must be local and no pull may
    /// still be running.
    #[tracing::instrument(level = "debug", skip(self, region), fields(addr = %region.base()))]
    pub fn close(&self, region: &Arc<Region>) -> Result<()> {
        let snapshot = region.snapshot();
        if snapshot.phase != TransferPhase::Received {
            return Err(FabricError::violation(
                region.base(),
                format!("close in phase {:?}", snapshot.phase),
            ));
        }
        let count = region.outstanding_pulls();
        if count > 0 {
            return Err(FabricError::PullsOutstanding {
                addr: region.base(),
                count,
            });
        }
        if !region.is_resident() {
            let local = region.pages().map(|t| t.local_count()).unwrap_or(0);
            return Err(FabricError::violation(
                region.base(),
                format!("close with only {local} pages local"),
            ));
        }
        let source = snapshot
            .pair
            .ok_or_else(|| FabricError::violation(region.base(), "received region has no source"))?;
        let conn = self.coordinator.resolve(source)?;

        region.set_resident(true);
        region.transition(TransferPhase::Received, |s| RegionSnapshot {
            phase: TransferPhase::Closing,
            ..s
        })?;
        if let Err(err) = self.transport.send_close(conn, region.base(), region.size()) {
            let _ = region.transition(TransferPhase::Closing, |s| RegionSnapshot {
                phase: TransferPhase::Received,
                ..s
            });
            return Err(err);
        }

        self.counters.closes_sent.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%source, "close sent");
        Ok(())
    }

    /// Consume one Done.
    ///
    /// On the source this releases the local copy and answers Done; on the
    /// destination it completes the close handshake.
    pub fn poll_for_close(&self) -> Result<Option<CloseOutcome>> {
        while let Some(Incoming { from, message }) = self.incoming_dones.pop() {
            let addr = message.addr();
            let Some(region) = self.registry.get(addr) else {
                self.drop_unexpected(from, &message);
                continue;
            };
            let snapshot = region.snapshot();
            if snapshot.pair != Some(from) {
                self.drop_unexpected(from, &message);
                continue;
            }
            let conn = self.coordinator.resolve(from)?;

            match snapshot.phase {
                TransferPhase::AwaitingClose => {
                    // Unmap first: with pulls still reading the copy, the
                    // Done stays queued and the region stays intact.
                    if let Err(err) = self.registry.remove(addr) {
                        self.incoming_dones.push(Incoming { from, message });
                        return Err(err);
                    }
                    self.transport.deregister_memory(conn, addr)?;
                    region.transition(TransferPhase::AwaitingClose, |s| RegionSnapshot {
                        phase: TransferPhase::Idle,
                        state: RegionState::Invalid,
                        pair: None,
                        ..s
                    })?;
                    self.transport.send_close(conn, addr, region.size())?;
                    self.counters.regions_released.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(%addr, %from, "local copy released");
                    return Ok(Some(CloseOutcome::Released(region)));
                }
                TransferPhase::Closing => {
                    region.transition(TransferPhase::Closing, |s| RegionSnapshot {
                        phase: TransferPhase::Idle,
                        pair: None,
                        ..s
                    })?;
                    self.transport.deregister_memory(conn, addr)?;
                    tracing::debug!(%addr, %from, "transfer complete");
                    return Ok(Some(CloseOutcome::Completed(region)));
                }
                _ => self.drop_unexpected(from, &message),
            }
        }
        Ok(None)
    }

    /// Drain every peer connection once. Returns the number of messages
    /// handled.
    pub fn pump(&self) -> Result<usize> {
        let mut handled = 0;
        for peer in self.coordinator.peers() {
            let conn = self.coordinator.resolve(peer)?;
            while self.transport.check_for_message(conn) {
                match self.transport.receive_message(conn) {
                    Ok(Some(message)) => {
                        self.dispatch(peer, message)?;
                        handled += 1;
                    }
                    Ok(None) => break,
                    Err(FabricError::Decode(err)) => {
                        tracing::warn!(%peer, %err, "dropping undecodable message");
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(handled)
    }

    fn dispatch(&self, from: NodeId, message: ControlMessage) -> Result<()> {
        tracing::trace!(%from, kind = ?message.kind(), addr = %message.addr(), "message received");
        match message {
            ControlMessage::Prepare(request) => self.answer_prepare(from, request),
            ControlMessage::Accept { .. } | ControlMessage::Decline { .. } => {
                self.incoming_accepts.push(Incoming { from, message });
                Ok(())
            }
            ControlMessage::Transfer { .. } => {
                self.incoming_transfers.push(Incoming { from, message });
                Ok(())
            }
            ControlMessage::Done { .. } => {
                self.incoming_dones.push(Incoming { from, message });
                Ok(())
            }
        }
    }

    fn answer_prepare(&self, from: NodeId, request: PrepareRequest) -> Result<()> {
        let conn = self.coordinator.resolve(from)?;
        let verdict = match self.check_request(&request) {
            Some(reason) => Err(reason),
            None => match self.admission.admit(from, &request) {
                Admission::Decline(reason) => Err(reason),
                Admission::Accept => self
                    .registry
                    .reserve_incoming(request.addr, request.size, from, request.app_id)
                    .map_err(|err| match err {
                        FabricError::AddressConflict { .. } => DeclineReason::AddressInUse,
                        FabricError::OutOfAddressSpace { .. } => DeclineReason::OutOfAddressSpace,
                        _ => DeclineReason::Refused,
                    }),
            },
        };
        let PrepareRequest {
            addr,
            size,
            page_size,
            container,
            ..
        } = request;

        let reason = match verdict {
            Ok(placeholder) => {
                match self.open_placeholder(conn, &placeholder, page_size, container) {
                    Ok(()) => {
                        tracing::debug!(%addr, size, %from, "accepted incoming region");
                        return Ok(());
                    }
                    Err(err) => {
                        // No placeholder may outlive a Decline.
                        let _ = self.transport.deregister_memory(conn, addr);
                        let _ = self.registry.remove(addr);
                        tracing::warn!(%addr, size, %from, %err, "could not accept incoming region");
                        DeclineReason::Refused
                    }
                }
            }
            Err(reason) => reason,
        };
        self.transport.send_decline(conn, addr, size, reason)?;
        tracing::debug!(%addr, size, %from, ?reason, "declined incoming region");
        Ok(())
    }

    /// Reject a Prepare whose geometry no placeholder could hold.
    fn check_request(&self, request: &PrepareRequest) -> Option<DeclineReason> {
        let space = self.registry.space();
        if request.size == 0
            || request.size > space.len
            || !space.contains(request.addr, request.size)
        {
            return Some(DeclineReason::OutOfAddressSpace);
        }
        if request.page_size == Some(0) {
            return Some(DeclineReason::InvalidPageSize);
        }
        None
    }

    fn open_placeholder(
        &self,
        conn: ConnId,
        placeholder: &Region,
        page_size: Option<usize>,
        container: Option<ContainerMeta>,
    ) -> Result<()> {
        if let Some(page_size) = page_size {
            placeholder.set_page_size(page_size)?;
        }
        placeholder.set_container(container);
        // Writable by the source so it can push ahead of the transfer.
        self.transport
            .register_memory(conn, placeholder.base(), placeholder.size(), true)?;
        self.transport
            .send_accept(conn, placeholder.base(), placeholder.size())
    }

    fn awaiting(&self, addr: RegionAddress, from: NodeId, phase: TransferPhase) -> Option<Arc<Region>> {
        self.registry
            .get(addr)
            .filter(|region| {
                let snapshot = region.snapshot();
                snapshot.phase == phase && snapshot.pair == Some(from)
            })
    }

    fn drop_unexpected(&self, from: NodeId, message: &ControlMessage) {
        self.counters.unexpected_messages.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(%from, kind = ?message.kind(), addr = %message.addr(), "dropping unexpected message");
    }

    pub fn stats(&self) -> ProtocolStats {
        let c = &self.counters;
        ProtocolStats {
            prepares_sent: c.prepares_sent.load(Ordering::Relaxed),
            prepares_accepted: c.prepares_accepted.load(Ordering::Relaxed),
            prepares_declined: c.prepares_declined.load(Ordering::Relaxed),
            transfers_sent: c.transfers_sent.load(Ordering::Relaxed),
            transfers_received: c.transfers_received.load(Ordering::Relaxed),
            closes_sent: c.closes_sent.load(Ordering::Relaxed),
            regions_released: c.regions_released.load(Ordering::Relaxed),
            unexpected_messages: c.unexpected_messages.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{AddressSpace, DEFAULT_ALIGNMENT};
    use crate::transport::{LoopbackEndpoint, LoopbackFabric};

    const START: u64 = 1 << 44;

    struct Node {
        registry: Arc<RegionRegistry>,
        protocol: TransferProtocol,
    }

    fn node(fabric: &Arc<LoopbackFabric>, id: NodeId, admission: Arc<dyn AdmissionPolicy>) -> Node {
        let registry = Arc::new(RegionRegistry::new(
            AddressSpace::new(RegionAddress(START), 1 << 20),
            DEFAULT_ALIGNMENT,
            id,
        ));
        let protocol = TransferProtocol::new(
            Arc::clone(&registry),
            fabric.endpoint(id),
            fabric.coordinator(id),
            admission,
        );
        Node { registry, protocol }
    }

    fn cluster(admission: Arc<dyn AdmissionPolicy>) -> (Node, Node) {
        let fabric = LoopbackFabric::with_nodes(&[NodeId(0), NodeId(1)]);
        let a = node(&fabric, NodeId(0), Arc::new(AcceptAll));
        let b = node(&fabric, NodeId(1), admission);
        (a, b)
    }

    #[test]
    fn test_full_handshake() {
        let (a, b) = cluster(Arc::new(AcceptAll));
        let region = a.registry.allocate(4096).unwrap();
        region.set_page_size(1024).unwrap();

        a.protocol.prepare(&region, NodeId(1), None).unwrap();
        assert_eq!(region.phase(), TransferPhase::AwaitingAccept);
        assert_eq!(b.protocol.pump().unwrap(), 1);
        let placeholder = b.registry.get(region.base()).unwrap();
        assert_eq!(placeholder.phase(), TransferPhase::AwaitingTransfer);

        a.protocol.pump().unwrap();
        let outcome = a.protocol.poll_for_accept().unwrap().unwrap();
        assert!(matches!(outcome, AcceptOutcome::Accepted(_)));

        a.protocol.transfer(&region, NodeId(1)).unwrap();
        assert_eq!(region.state(), RegionState::Shared);
        assert_eq!(region.owner(), NodeId(1));

        b.protocol.pump().unwrap();
        let received = b.protocol.poll_for_transfer().unwrap().unwrap();
        assert_eq!(received.owner(), NodeId(1));
        assert_eq!(received.pair(), Some(NodeId(0)));
        assert_eq!(received.pages().unwrap().local_count(), 0);

        // Pages still remote.
        assert!(b.protocol.close(&received).is_err());
        for index in 0..4 {
            received.pages().unwrap().set_state_of(index, PageState::Local);
        }
        b.protocol.close(&received).unwrap();

        a.protocol.pump().unwrap();
        assert!(matches!(
            a.protocol.poll_for_close().unwrap(),
            Some(CloseOutcome::Released(_))
        ));
        assert!(a.registry.get(region.base()).is_none());

        b.protocol.pump().unwrap();
        assert!(matches!(
            b.protocol.poll_for_close().unwrap(),
            Some(CloseOutcome::Completed(_))
        ));
        assert_eq!(received.phase(), TransferPhase::Idle);
        assert_eq!(received.pair(), None);
    }

    #[test]
    fn test_decline_restores_source() {
        let (a, b) = cluster(Arc::new(DeclineAll));
        let region = a.registry.allocate(100).unwrap();
        a.protocol.prepare(&region, NodeId(1), None).unwrap();
        b.protocol.pump().unwrap();
        assert!(b.registry.is_empty());

        a.protocol.pump().unwrap();
        match a.protocol.poll_for_accept().unwrap() {
            Some(AcceptOutcome::Declined { reason, .. }) => assert_eq!(reason, DeclineReason::Refused),
            other => panic!("expected decline, got {other:?}"),
        }
        assert_eq!(region.state(), RegionState::Owned);
        assert_eq!(region.phase(), TransferPhase::Idle);
        assert_eq!(a.protocol.stats().prepares_declined, 1);
    }

    #[test]
    fn test_conflicting_address_is_declined() {
        let (a, b) = cluster(Arc::new(AcceptAll));
        let region = a.registry.allocate(4096).unwrap();
        b.registry.allocate_at(region.base(), 10).unwrap();

        a.protocol.prepare(&region, NodeId(1), None).unwrap();
        b.protocol.pump().unwrap();
        a.protocol.pump().unwrap();
        match a.protocol.poll_for_accept().unwrap() {
            Some(AcceptOutcome::Declined { reason, .. }) => {
                assert_eq!(reason, DeclineReason::AddressInUse)
            }
            other => panic!("expected decline, got {other:?}"),
        }
    }

    #[test]
    fn test_out_of_order_steps() {
        let (a, _b) = cluster(Arc::new(AcceptAll));
        let region = a.registry.allocate(64).unwrap();

        assert!(matches!(
            a.protocol.transfer(&region, NodeId(1)),
            Err(FabricError::ProtocolViolation { .. })
        ));
        assert!(matches!(
            a.protocol.close(&region),
            Err(FabricError::ProtocolViolation { .. })
        ));
        a.protocol.prepare(&region, NodeId(1), None).unwrap();
        assert!(a.protocol.prepare(&region, NodeId(1), None).is_err());
        assert!(a.protocol.prepare(&region, NodeId(0), None).is_err());
    }

    #[test]
    fn test_polls_are_empty_without_messages() {
        let (a, _b) = cluster(Arc::new(AcceptAll));
        assert!(a.protocol.poll_for_accept().unwrap().is_none());
        assert!(a.protocol.poll_for_transfer().unwrap().is_none());
        assert!(a.protocol.poll_for_close().unwrap().is_none());
    }

    fn request(size: usize, page_size: Option<usize>) -> PrepareRequest {
        PrepareRequest {
            addr: RegionAddress(START),
            size,
            page_size,
            app_id: None,
            container: None,
        }
    }

    /// Send a raw Prepare from `a` to `b` and return `b`'s reply.
    fn answer(a: &Node, b: &Node, request: PrepareRequest) -> ControlMessage {
        let to_b = a.protocol.coordinator.resolve(NodeId(1)).unwrap();
        a.protocol.transport.send_prepare(to_b, request).unwrap();
        assert_eq!(b.protocol.pump().unwrap(), 1);
        a.protocol.transport.receive_message(to_b).unwrap().unwrap()
    }

    fn declined_with(reply: ControlMessage) -> DeclineReason {
        match reply {
            ControlMessage::Decline { reason, .. } => reason,
            other => panic!("expected decline, got {other:?}"),
        }
    }

    #[test]
    fn test_prepare_outside_space_is_declined() {
        let (a, b) = cluster(Arc::new(AcceptAll));
        for size in [usize::MAX, (1 << 20) + 1, 0] {
            let reason = declined_with(answer(&a, &b, request(size, None)));
            assert_eq!(reason, DeclineReason::OutOfAddressSpace);
        }
        assert!(b.registry.is_empty());

        // The node keeps answering after the bad requests.
        let reply = answer(&a, &b, request(4096, None));
        assert!(matches!(reply, ControlMessage::Accept { size: 4096, .. }));
        assert!(b.registry.get(RegionAddress(START)).is_some());
    }

    #[test]
    fn test_zero_page_size_is_declined() {
        let (a, b) = cluster(Arc::new(AcceptAll));
        let reason = declined_with(answer(&a, &b, request(4096, Some(0))));
        assert_eq!(reason, DeclineReason::InvalidPageSize);
        assert!(b.registry.is_empty());

        let reply = answer(&a, &b, request(4096, Some(1024)));
        assert!(matches!(reply, ControlMessage::Accept { .. }));
        let placeholder = b.registry.get(RegionAddress(START)).unwrap();
        assert_eq!(placeholder.page_size(), Some(1024));
    }

    /// Loopback endpoint whose memory registration always fails.
    struct NoRegistration(Arc<LoopbackEndpoint>);

    impl Transport for NoRegistration {
        fn attach(&self, arena: Arc<crate::arena::Arena>) -> Result<()> {
            self.0.attach(arena)
        }
        fn send(&self, conn: ConnId, bytes: &[u8]) -> Result<()> {
            self.0.send(conn, bytes)
        }
        fn receive(&self, conn: ConnId) -> Result<Option<Vec<u8>>> {
            self.0.receive(conn)
        }
        fn check_for_message(&self, conn: ConnId) -> bool {
            self.0.check_for_message(conn)
        }
        fn register_memory(&self, _: ConnId, _: RegionAddress, _: usize, _: bool) -> Result<()> {
            Err(FabricError::Transport("registration refused".into()))
        }
        fn deregister_memory(&self, conn: ConnId, addr: RegionAddress) -> Result<()> {
            self.0.deregister_memory(conn, addr)
        }
        fn read(&self, conn: ConnId, addr: RegionAddress, len: usize) -> Result<()> {
            self.0.read(conn, addr, len)
        }
        fn read_async(
            &self,
            conn: ConnId,
            addr: RegionAddress,
            len: usize,
            done: crate::transport::ReadCompletion,
        ) -> Result<()> {
            self.0.read_async(conn, addr, len, done)
        }
        fn write(&self, conn: ConnId, addr: RegionAddress, len: usize) -> Result<()> {
            self.0.write(conn, addr, len)
        }
    }

    #[test]
    fn test_failed_accept_frees_placeholder() {
        let fabric = LoopbackFabric::with_nodes(&[NodeId(0), NodeId(1)]);
        let a = node(&fabric, NodeId(0), Arc::new(AcceptAll));
        let registry = Arc::new(RegionRegistry::new(
            AddressSpace::new(RegionAddress(START), 1 << 20),
            DEFAULT_ALIGNMENT,
            NodeId(1),
        ));
        let b = Node {
            protocol: TransferProtocol::new(
                Arc::clone(&registry),
                Arc::new(NoRegistration(fabric.endpoint(NodeId(1)))),
                fabric.coordinator(NodeId(1)),
                Arc::new(AcceptAll),
            ),
            registry,
        };

        let region = a.registry.allocate(4096).unwrap();
        a.protocol.prepare(&region, NodeId(1), None).unwrap();
        b.protocol.pump().unwrap();
        assert!(b.registry.is_empty());

        a.protocol.pump().unwrap();
        match a.protocol.poll_for_accept().unwrap() {
            Some(AcceptOutcome::Declined { reason, .. }) => assert_eq!(reason, DeclineReason::Refused),
            other => panic!("expected decline, got {other:?}"),
        }
        assert_eq!(region.phase(), TransferPhase::Idle);
        // The extent is free again on the destination.
        b.registry.allocate_at(region.base(), 4096).unwrap();
    }

    #[test]
    fn test_release_waits_for_outstanding_pulls() {
        let (a, b) = cluster(Arc::new(AcceptAll));
        let region = a.registry.allocate(2048).unwrap();
        region.set_page_size(1024).unwrap();

        a.protocol.prepare(&region, NodeId(1), None).unwrap();
        b.protocol.pump().unwrap();
        a.protocol.pump().unwrap();
        a.protocol.poll_for_accept().unwrap().unwrap();
        a.protocol.transfer(&region, NodeId(1)).unwrap();
        b.protocol.pump().unwrap();
        let received = b.protocol.poll_for_transfer().unwrap().unwrap();
        for index in 0..2 {
            received.pages().unwrap().set_state_of(index, PageState::Local);
        }
        b.protocol.close(&received).unwrap();
        a.protocol.pump().unwrap();

        let guard = region.begin_pull();
        assert!(matches!(
            a.protocol.poll_for_close(),
            Err(FabricError::PullsOutstanding { count: 1, .. })
        ));
        assert_eq!(region.phase(), TransferPhase::AwaitingClose);
        assert!(a.registry.get(region.base()).is_some());

        drop(guard);
        assert!(matches!(
            a.protocol.poll_for_close().unwrap(),
            Some(CloseOutcome::Released(_))
        ));
        assert!(a.registry.get(region.base()).is_none());
    }
}
