//! Transport abstraction: ordered reliable messages plus one-sided reads
//! and writes against registered memory.
//!
//! Because every node maps the same shared address space, a one-sided
//! operation names a single [`RegionAddress`] that is valid on both ends:
//! `read` copies the peer's bytes at that address into the local arena at
//! the same address, `write` does the reverse.

mod loopback;

pub use loopback::{LoopbackEndpoint, LoopbackFabric, LoopbackStats};

use crate::address::RegionAddress;
use crate::arena::Arena;
use crate::error::Result;
use crate::message::{ContainerMeta, ControlMessage, DeclineReason, PrepareRequest};
use std::sync::Arc;

/// Connection identifier resolved by the coordinator.
pub type ConnId = u64;

/// Completion callback of an asynchronous read.
pub type ReadCompletion = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Message and RDMA-style memory transport.
pub trait Transport: Send + Sync {
    /// Bind the local arena that one-sided operations read into and from.
    fn attach(&self, arena: Arc<Arena>) -> Result<()>;

    /// Send one message on `conn`.
    fn send(&self, conn: ConnId, bytes: &[u8]) -> Result<()>;

    /// Receive the next message on `conn`, if one is waiting.
    fn receive(&self, conn: ConnId) -> Result<Option<Vec<u8>>>;

    /// Whether a message is waiting on `conn`.
    fn check_for_message(&self, conn: ConnId) -> bool;

    /// Register `[addr, addr + len)` with the transport. Only extents
    /// registered with `remote_access` may be read or written by peers.
    fn register_memory(
        &self,
        conn: ConnId,
        addr: RegionAddress,
        len: usize,
        remote_access: bool,
    ) -> Result<()>;

    /// Drop the registration based at `addr`.
    fn deregister_memory(&self, conn: ConnId, addr: RegionAddress) -> Result<()>;

    /// Synchronously pull `[addr, addr + len)` from the peer on `conn`.
    fn read(&self, conn: ConnId, addr: RegionAddress, len: usize) -> Result<()>;

    /// Start a pull; `done` runs once the bytes have landed (or failed).
    fn read_async(
        &self,
        conn: ConnId,
        addr: RegionAddress,
        len: usize,
        done: ReadCompletion,
    ) -> Result<()>;

    /// Synchronously push `[addr, addr + len)` to the peer on `conn`.
    fn write(&self, conn: ConnId, addr: RegionAddress, len: usize) -> Result<()>;
}

/// Typed wrappers over [`Transport::send`] and [`Transport::receive`].
pub trait TransportExt: Transport {
    fn send_message(&self, conn: ConnId, message: &ControlMessage) -> Result<()> {
        let bytes = message.encode()?;
        self.send(conn, &bytes)
    }

    fn receive_message(&self, conn: ConnId) -> Result<Option<ControlMessage>> {
        match self.receive(conn)? {
            Some(bytes) => ControlMessage::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn send_prepare(&self, conn: ConnId, request: PrepareRequest) -> Result<()> {
        self.send_message(conn, &ControlMessage::Prepare(request))
    }

    fn send_accept(&self, conn: ConnId, addr: RegionAddress, size: usize) -> Result<()> {
        self.send_message(conn, &ControlMessage::Accept { addr, size })
    }

    fn send_decline(
        &self,
        conn: ConnId,
        addr: RegionAddress,
        size: usize,
        reason: DeclineReason,
    ) -> Result<()> {
        self.send_message(conn, &ControlMessage::Decline { addr, size, reason })
    }

    fn send_transfer(
        &self,
        conn: ConnId,
        addr: RegionAddress,
        size: usize,
        container: Option<ContainerMeta>,
    ) -> Result<()> {
        self.send_message(
            conn,
            &ControlMessage::Transfer {
                addr,
                size,
                container,
            },
        )
    }

    fn send_close(&self, conn: ConnId, addr: RegionAddress, size: usize) -> Result<()> {
        self.send_message(conn, &ControlMessage::Done { addr, size })
    }
}

impl<T: Transport + ?Sized> TransportExt for T {}
