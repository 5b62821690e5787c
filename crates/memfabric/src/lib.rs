//! # memfabric
//!
//! Shared-memory fabric for a cluster of peer nodes.
//!
//! Every node maps the same cluster-wide address range and owns disjoint
//! regions of it. This crate provides:
//! - A region registry with size-class free lists
//! - An ownership transfer handshake (Prepare / Accept / Transfer / Done)
//! - Demand paging of received regions through one-sided reads, driven by a
//!   page-fault trap or an access-checked path
//! - The [`MemoryManager`] façade and its background listener
//! - Recovery of regions touched by a failed node
//!
//! ```no_run
//! use memfabric::{FabricConfig, LoopbackFabric, MemoryManager, NodeId};
//!
//! # fn main() -> memfabric::Result<()> {
//! let fabric = LoopbackFabric::with_nodes(&[NodeId(0), NodeId(1)]);
//! let a = MemoryManager::builder(fabric.endpoint(NodeId(0)), fabric.coordinator(NodeId(0)))
//!     .config(FabricConfig::default().default_page_size(Some(4096)))
//!     .build()?;
//! let region = a.allocate(1 << 16)?;
//! a.write(region.base(), b"hello")?;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod arena;
pub mod config;
pub mod coordination;
pub mod error;
pub mod manager;
pub mod message;
pub mod page_table;
pub mod pager;
pub mod protocol;
pub mod recovery;
pub mod region;
pub mod registry;
pub mod tracing_support;
pub mod transport;

// Re-exports
pub use address::{AddressSpace, NodeId, RegionAddress, DEFAULT_ALIGNMENT};
pub use arena::{Arena, Protection};
pub use config::FabricConfig;
pub use coordination::{
    Coordinator, InMemoryMetadata, MetadataService, RegionRecord, StaticCoordinator,
};
pub use error::{FabricError, Result};
pub use manager::{ManagerStats, MemoryManager, MemoryManagerBuilder};
pub use message::{ContainerMeta, ControlMessage, DeclineReason, PrepareRequest};
pub use page_table::{PageSpan, PageState, PageTable};
pub use pager::{DemandPager, FaultResolution, PagerStats};
pub use protocol::{
    AcceptAll, AcceptOutcome, Admission, AdmissionPolicy, CloseOutcome, DeclineAll, ProtocolStats,
    TransferProtocol,
};
pub use recovery::{RecoveryAction, RecoveryDecision, RecoveryPlanner};
pub use region::{Region, RegionSnapshot, RegionState, TransferPhase};
pub use registry::{RegionRegistry, RegistryStats};
pub use tracing_support::{init_tracing, TracingConfig, TracingFormat};
pub use transport::{ConnId, LoopbackEndpoint, LoopbackFabric, LoopbackStats, Transport, TransportExt};
