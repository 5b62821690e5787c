//! In-process transport connecting several nodes of one process.
//!
//! Each node owns an inbox of lock-free queues (one per sender) and a table
//! of memory registrations. One-sided reads copy directly between the two
//! nodes' arenas after checking the remote registration, which is what an
//! RDMA NIC would enforce. The fabric counts operations and can inject
//! failures and latency, which the tests rely on.

use super::{ConnId, ReadCompletion, Transport};
use crate::address::{NodeId, RegionAddress};
use crate::arena::Arena;
use crate::coordination::StaticCoordinator;
use crate::error::{FabricError, Result};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Counters of a [`LoopbackFabric`].
#[derive(Debug, Clone, Default)]
pub struct LoopbackStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub reads_issued: u64,
    pub writes_issued: u64,
    pub bytes_read: u64,
    /// Highest number of asynchronous reads seen in flight at once
    pub peak_async_reads: usize,
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    len: usize,
    remote_access: bool,
}

#[derive(Default)]
struct NodeState {
    arena: OnceLock<Arc<Arena>>,
    inbox: DashMap<NodeId, SegQueue<Vec<u8>>>,
    registrations: RwLock<BTreeMap<RegionAddress, Registration>>,
}

impl NodeState {
    fn arena(&self, node: NodeId) -> Result<&Arc<Arena>> {
        self.arena
            .get()
            .ok_or_else(|| FabricError::Transport(format!("{node} has no arena attached")))
    }

    fn remotely_accessible(&self, addr: RegionAddress, len: usize) -> bool {
        let registrations = self.registrations.read();
        registrations
            .range(..=addr)
            .next_back()
            .is_some_and(|(base, reg)| {
                reg.remote_access && addr.0.saturating_add(len as u64) <= base.offset(reg.len).0
            })
    }
}

/// Shared medium of an in-process cluster.
pub struct LoopbackFabric {
    nodes: DashMap<NodeId, Arc<NodeState>>,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    reads_issued: AtomicU64,
    writes_issued: AtomicU64,
    bytes_read: AtomicU64,
    reads_by_addr: DashMap<RegionAddress, u64>,
    async_in_flight: AtomicUsize,
    peak_async: AtomicUsize,
    fail_reads: AtomicBool,
    read_delay_us: AtomicU64,
}

impl LoopbackFabric {
    /// Create a fabric connecting `nodes`.
    pub fn with_nodes(nodes: &[NodeId]) -> Arc<Self> {
        let fabric = Self {
            nodes: DashMap::new(),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            reads_issued: AtomicU64::new(0),
            writes_issued: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            reads_by_addr: DashMap::new(),
            async_in_flight: AtomicUsize::new(0),
            peak_async: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
            read_delay_us: AtomicU64::new(0),
        };
        for node in nodes {
            fabric.nodes.insert(*node, Arc::new(NodeState::default()));
        }
        Arc::new(fabric)
    }

    /// Transport endpoint for `node`.
    pub fn endpoint(self: &Arc<Self>, node: NodeId) -> Arc<LoopbackEndpoint> {
        Arc::new(LoopbackEndpoint {
            fabric: Arc::clone(self),
            node,
        })
    }

    /// Coordinator for `node`: every other node is a peer, reached over a
    /// connection whose id is the peer's node id.
    pub fn coordinator(&self, node: NodeId) -> Arc<StaticCoordinator> {
        let mut peers: Vec<(NodeId, ConnId)> = self
            .nodes
            .iter()
            .map(|entry| *entry.key())
            .filter(|peer| *peer != node)
            .map(|peer| (peer, Self::conn_for(peer)))
            .collect();
        peers.sort();
        Arc::new(StaticCoordinator::new(node, peers))
    }

    /// Connection id used to reach `node`.
    pub fn conn_for(node: NodeId) -> ConnId {
        node.as_u16() as ConnId
    }

    fn node_for(conn: ConnId) -> NodeId {
        NodeId(conn as u16)
    }

    fn state(&self, node: NodeId) -> Result<Arc<NodeState>> {
        self.nodes
            .get(&node)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(FabricError::UnknownNode(node))
    }

    /// Make subsequent reads fail (or succeed again).
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Release);
    }

    /// Delay every read by `delay`.
    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_us
            .store(delay.as_micros() as u64, Ordering::Release);
    }

    /// Number of reads issued against the extent starting at `addr`.
    pub fn reads_at(&self, addr: RegionAddress) -> u64 {
        self.reads_by_addr.get(&addr).map(|c| *c).unwrap_or(0)
    }

    pub fn reset_counters(&self) {
        self.reads_issued.store(0, Ordering::Relaxed);
        self.writes_issued.store(0, Ordering::Relaxed);
        self.bytes_read.store(0, Ordering::Relaxed);
        self.reads_by_addr.clear();
        self.peak_async.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> LoopbackStats {
        LoopbackStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            reads_issued: self.reads_issued.load(Ordering::Relaxed),
            writes_issued: self.writes_issued.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            peak_async_reads: self.peak_async.load(Ordering::Relaxed),
        }
    }

    fn copy(&self, from: NodeId, to: NodeId, addr: RegionAddress, len: usize) -> Result<()> {
        let source = self.state(from)?;
        let target = self.state(to)?;
        if !source.remotely_accessible(addr, len) {
            return Err(FabricError::Transport(format!(
                "{addr} (+{len}) is not registered for remote access on {from}"
            )));
        }
        let src_arena = source.arena(from)?;
        let dst_arena = target.arena(to)?;
        // SAFETY: both extents lie inside live arenas; the caller owns the
        // destination extent for the duration of the copy.
        unsafe { dst_arena.copy_from(addr, src_arena, addr, len) }
    }

    fn pull(&self, local: NodeId, conn: ConnId, addr: RegionAddress, len: usize) -> Result<()> {
        self.reads_issued.fetch_add(1, Ordering::Relaxed);
        *self.reads_by_addr.entry(addr).or_insert(0) += 1;

        let delay = self.read_delay_us.load(Ordering::Acquire);
        if delay > 0 {
            std::thread::sleep(Duration::from_micros(delay));
        }
        if self.fail_reads.load(Ordering::Acquire) {
            return Err(FabricError::Transport("injected read failure".into()));
        }

        self.copy(Self::node_for(conn), local, addr, len)?;
        self.bytes_read.fetch_add(len as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// One node's handle onto a [`LoopbackFabric`].
pub struct LoopbackEndpoint {
    fabric: Arc<LoopbackFabric>,
    node: NodeId,
}

impl LoopbackEndpoint {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn fabric(&self) -> &Arc<LoopbackFabric> {
        &self.fabric
    }
}

impl Transport for LoopbackEndpoint {
    fn attach(&self, arena: Arc<Arena>) -> Result<()> {
        let state = self.fabric.state(self.node)?;
        state
            .arena
            .set(arena)
            .map_err(|_| FabricError::Transport(format!("{} already has an arena", self.node)))
    }

    fn send(&self, conn: ConnId, bytes: &[u8]) -> Result<()> {
        let peer = LoopbackFabric::node_for(conn);
        let state = self.fabric.state(peer)?;
        state
            .inbox
            .entry(self.node)
            .or_default()
            .push(bytes.to_vec());
        self.fabric.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn receive(&self, conn: ConnId) -> Result<Option<Vec<u8>>> {
        let peer = LoopbackFabric::node_for(conn);
        let state = self.fabric.state(self.node)?;
        let message = state.inbox.get(&peer).and_then(|queue| queue.pop());
        if message.is_some() {
            self.fabric.messages_received.fetch_add(1, Ordering::Relaxed);
        }
        Ok(message)
    }

    fn check_for_message(&self, conn: ConnId) -> bool {
        let peer = LoopbackFabric::node_for(conn);
        self.fabric
            .state(self.node)
            .map(|state| state.inbox.get(&peer).is_some_and(|queue| !queue.is_empty()))
            .unwrap_or(false)
    }

    fn register_memory(
        &self,
        _conn: ConnId,
        addr: RegionAddress,
        len: usize,
        remote_access: bool,
    ) -> Result<()> {
        let state = self.fabric.state(self.node)?;
        state
            .registrations
            .write()
            .insert(addr, Registration { len, remote_access });
        Ok(())
    }

    fn deregister_memory(&self, _conn: ConnId, addr: RegionAddress) -> Result<()> {
        let state = self.fabric.state(self.node)?;
        state.registrations.write().remove(&addr);
        Ok(())
    }

    fn read(&self, conn: ConnId, addr: RegionAddress, len: usize) -> Result<()> {
        self.fabric.pull(self.node, conn, addr, len)
    }

    fn read_async(
        &self,
        conn: ConnId,
        addr: RegionAddress,
        len: usize,
        done: ReadCompletion,
    ) -> Result<()> {
        let fabric = Arc::clone(&self.fabric);
        let node = self.node;
        let in_flight = fabric.async_in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        fabric.peak_async.fetch_max(in_flight, Ordering::AcqRel);

        std::thread::Builder::new()
            .name("loopback-read".into())
            .spawn(move || {
                let result = fabric.pull(node, conn, addr, len);
                fabric.async_in_flight.fetch_sub(1, Ordering::AcqRel);
                done(result);
            })
            .map(|_| ())
            .map_err(|err| {
                self.fabric.async_in_flight.fetch_sub(1, Ordering::AcqRel);
                FabricError::Io(err)
            })
    }

    fn write(&self, conn: ConnId, addr: RegionAddress, len: usize) -> Result<()> {
        self.fabric.writes_issued.fetch_add(1, Ordering::Relaxed);
        let peer = LoopbackFabric::node_for(conn);
        let target = self.fabric.state(peer)?;
        if !target.remotely_accessible(addr, len) {
            return Err(FabricError::Transport(format!(
                "{addr} (+{len}) is not registered for remote access on {peer}"
            )));
        }
        let source = self.fabric.state(self.node)?;
        let src_arena = source.arena(self.node)?;
        let dst_arena = target.arena(peer)?;
        // SAFETY: as in `LoopbackFabric::copy`, with the roles reversed.
        unsafe { dst_arena.copy_from(addr, src_arena, addr, len) }
    }
}
