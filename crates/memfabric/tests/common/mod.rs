//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use memfabric::{
    AdmissionPolicy, FabricConfig, LoopbackFabric, MemoryManager, MetadataService, NodeId,
    RegionAddress,
};

/// Address space small enough that every test can map one per node.
pub fn config() -> FabricConfig {
    FabricConfig::default().address_space(RegionAddress(1 << 44), 16 << 20)
}

/// `n` managers on one loopback fabric, node ids `0..n`.
pub fn cluster(n: u16, config: FabricConfig) -> (Arc<LoopbackFabric>, Vec<MemoryManager>) {
    let ids: Vec<NodeId> = (0..n).map(NodeId).collect();
    let fabric = LoopbackFabric::with_nodes(&ids);
    let managers = ids
        .iter()
        .map(|id| {
            MemoryManager::builder(fabric.endpoint(*id), fabric.coordinator(*id))
                .config(config.clone())
                .build()
                .unwrap()
        })
        .collect();
    (fabric, managers)
}

/// Like [`cluster`], with a per-node admission policy and a shared metadata
/// service.
pub fn cluster_with(
    config: FabricConfig,
    admission: Vec<Arc<dyn AdmissionPolicy>>,
    metadata: Arc<dyn MetadataService>,
) -> (Arc<LoopbackFabric>, Vec<MemoryManager>) {
    let ids: Vec<NodeId> = (0..admission.len() as u16).map(NodeId).collect();
    let fabric = LoopbackFabric::with_nodes(&ids);
    let managers = ids
        .iter()
        .zip(admission)
        .map(|(id, policy)| {
            MemoryManager::builder(fabric.endpoint(*id), fabric.coordinator(*id))
                .config(config.clone())
                .admission(policy)
                .metadata(Arc::clone(&metadata))
                .build()
                .unwrap()
        })
        .collect();
    (fabric, managers)
}

/// Deterministic, non-repeating-per-page fill.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i * 31 + seed as usize) % 251) as u8)
        .collect()
}
