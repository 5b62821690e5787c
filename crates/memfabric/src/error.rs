//! Error types for the memory fabric.
//!
//! Allocation and lookup failures are returned to the caller as values. The
//! two fatal classes (a fault on an address no region owns, a failed pull
//! inside the fault trap) never reach this type: the trap logs and aborts.

use crate::address::{NodeId, RegionAddress};
use crate::message::DeclineReason;
use thiserror::Error;

/// Result type alias using [`FabricError`].
pub type Result<T> = std::result::Result<T, FabricError>;

/// Error type for every fallible fabric operation.
#[derive(Error, Debug)]
pub enum FabricError {
    /// A live region already covers part of the requested extent.
    #[error("address conflict: {addr} (+{size} bytes) overlaps a live region")]
    AddressConflict { addr: RegionAddress, size: usize },

    /// The reserved shared address space cannot satisfy the request.
    #[error("out of address space: cannot place {size} bytes")]
    OutOfAddressSpace { size: usize },

    /// Dictated addresses must sit on the allocation alignment.
    #[error("address {addr} is not aligned to {alignment} bytes")]
    MisalignedAddress {
        addr: RegionAddress,
        alignment: usize,
    },

    /// No region contains the address.
    #[error("no region contains address {0}")]
    RegionNotFound(RegionAddress),

    /// The destination refused the region.
    #[error("transfer of {addr} to {destination} declined: {reason:?}")]
    TransferDeclined {
        addr: RegionAddress,
        destination: NodeId,
        reason: DeclineReason,
    },

    /// A one-sided read could not complete.
    #[error("pull of {addr} (+{len} bytes) failed: {reason}")]
    PullFailed {
        addr: RegionAddress,
        len: usize,
        reason: String,
    },

    /// The region still has page pulls in flight.
    #[error("region {addr} has {count} pulls in flight")]
    PullsOutstanding { addr: RegionAddress, count: usize },

    /// A protocol step was issued out of order.
    #[error("protocol violation on {addr}: {detail}")]
    ProtocolViolation { addr: RegionAddress, detail: String },

    /// Page size of zero.
    #[error("invalid page size {0}")]
    InvalidPageSize(usize),

    /// The coordinator cannot resolve a connection for the node.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// Underlying transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The metadata service rejected an update.
    #[error("metadata error: {0}")]
    Metadata(String),

    /// Wire encoding failure.
    #[error("message encoding failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// Wire decoding failure.
    #[error("message decoding failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// Configuration rejected by [`crate::config::FabricConfig::validate`].
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The process-wide fault trap cannot take another arena.
    #[error("fault trap unavailable: {0}")]
    TrapUnavailable(String),

    /// I/O error (mapping, protection changes).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error from signal installation.
    #[cfg(feature = "fault-trap")]
    #[error("system error: {0}")]
    System(#[from] nix::errno::Errno),
}

impl FabricError {
    pub(crate) fn violation(addr: RegionAddress, detail: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            addr,
            detail: detail.into(),
        }
    }

    pub(crate) fn pull_failed(addr: RegionAddress, len: usize, reason: impl ToString) -> Self {
        Self::PullFailed {
            addr,
            len,
            reason: reason.to_string(),
        }
    }

    /// Whether this error belongs to the class the fault trap treats as fatal.
    pub fn is_fatal_for_paging(&self) -> bool {
        matches!(self, Self::RegionNotFound(_) | Self::PullFailed { .. })
    }
}
