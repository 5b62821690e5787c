//! Control messages of the ownership transfer handshake.
//!
//! Uses bincode for compact binary serialization.

use crate::address::RegionAddress;
use crate::error::{FabricError, Result};
use serde::{Deserialize, Serialize};

/// Largest encoded message accepted from the wire.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Metadata of a typed container riding the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMeta {
    /// Address of the container's root object
    pub root: RegionAddress,
    /// Bytes of the region in use by the container
    pub used: u64,
}

/// Why a destination refused a Prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeclineReason {
    /// A live local region overlaps the proposed extent
    AddressInUse,
    /// The extent falls outside the local address space
    OutOfAddressSpace,
    /// The admission policy refused
    Refused,
    /// The request's page size cannot be honoured
    InvalidPageSize,
}

/// Body of a Prepare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub addr: RegionAddress,
    pub size: usize,
    /// Page size the destination should page the region in with
    pub page_size: Option<usize>,
    /// Durable application id
    pub app_id: Option<i64>,
    pub container: Option<ContainerMeta>,
}

/// One step of the transfer handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    Prepare(PrepareRequest),
    Accept {
        addr: RegionAddress,
        size: usize,
    },
    Decline {
        addr: RegionAddress,
        size: usize,
        reason: DeclineReason,
    },
    Transfer {
        addr: RegionAddress,
        size: usize,
        container: Option<ContainerMeta>,
    },
    Done {
        addr: RegionAddress,
        size: usize,
    },
}

/// Discriminant of a [`ControlMessage`], for logging and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Prepare,
    Accept,
    Decline,
    Transfer,
    Done,
}

impl ControlMessage {
    /// Region address the message refers to.
    pub fn addr(&self) -> RegionAddress {
        match self {
            ControlMessage::Prepare(req) => req.addr,
            ControlMessage::Accept { addr, .. }
            | ControlMessage::Decline { addr, .. }
            | ControlMessage::Transfer { addr, .. }
            | ControlMessage::Done { addr, .. } => *addr,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            ControlMessage::Prepare(_) => MessageKind::Prepare,
            ControlMessage::Accept { .. } => MessageKind::Accept,
            ControlMessage::Decline { .. } => MessageKind::Decline,
            ControlMessage::Transfer { .. } => MessageKind::Transfer,
            ControlMessage::Done { .. } => MessageKind::Done,
        }
    }

    /// Encode for the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    /// Decode a wire message.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(FabricError::Transport(format!(
                "message of {} bytes exceeds {MAX_MESSAGE_SIZE}",
                bytes.len()
            )));
        }
        let (message, _): (ControlMessage, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(message)
    }
}
