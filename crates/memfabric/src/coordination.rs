//! Coordination and metadata services.
//!
//! The [`Coordinator`] hands out node identity and resolves peers to
//! transport connections. The [`MetadataService`] keeps durable region
//! records and per-node live lists for crash-tolerant deployments; only the
//! interface matters here, and in-memory implementations are provided.

use crate::address::{NodeId, RegionAddress};
use crate::error::{FabricError, Result};
use crate::transport::ConnId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Cluster membership and connection resolution.
pub trait Coordinator: Send + Sync {
    /// Identity of this node.
    fn local_node(&self) -> NodeId;

    /// Connection to `node`.
    fn resolve(&self, node: NodeId) -> Result<ConnId>;

    /// Every other node of the cluster.
    fn peers(&self) -> Vec<NodeId>;
}

/// Fixed membership known up front.
#[derive(Debug, Clone)]
pub struct StaticCoordinator {
    local: NodeId,
    peers: Vec<(NodeId, ConnId)>,
}

impl StaticCoordinator {
    pub fn new(local: NodeId, peers: Vec<(NodeId, ConnId)>) -> Self {
        Self { local, peers }
    }
}

impl Coordinator for StaticCoordinator {
    fn local_node(&self) -> NodeId {
        self.local
    }

    fn resolve(&self, node: NodeId) -> Result<ConnId> {
        self.peers
            .iter()
            .find(|(peer, _)| *peer == node)
            .map(|(_, conn)| *conn)
            .ok_or(FabricError::UnknownNode(node))
    }

    fn peers(&self) -> Vec<NodeId> {
        self.peers.iter().map(|(peer, _)| *peer).collect()
    }
}

/// Durable record of a tagged region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionRecord {
    pub app_id: i64,
    pub addr: RegionAddress,
    pub size: usize,
    /// Node that allocated (or last sent) the region
    pub source: NodeId,
    /// Node the region is being or was migrated to
    pub destination: Option<NodeId>,
}

/// Durable region metadata shared by the cluster.
pub trait MetadataService: Send + Sync {
    fn record_region(&self, record: RegionRecord) -> Result<()>;

    fn lookup_region(&self, app_id: i64) -> Option<RegionRecord>;

    fn update_destination(&self, app_id: i64, destination: NodeId) -> Result<()>;

    fn delete_region(&self, app_id: i64) -> Result<()>;

    /// Records naming `node` as source or destination.
    fn regions_for_node(&self, node: NodeId) -> Vec<RegionRecord>;

    /// Add `app_id` to `node`'s live list.
    fn mark_live(&self, node: NodeId, app_id: i64) -> Result<()>;

    fn clear_live(&self, node: NodeId, app_id: i64) -> Result<()>;

    fn live_regions(&self, node: NodeId) -> Vec<i64>;
}

/// [`MetadataService`] held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryMetadata {
    records: RwLock<HashMap<i64, RegionRecord>>,
    live: RwLock<HashMap<NodeId, BTreeSet<i64>>>,
}

impl InMemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataService for InMemoryMetadata {
    fn record_region(&self, record: RegionRecord) -> Result<()> {
        self.records.write().insert(record.app_id, record);
        Ok(())
    }

    fn lookup_region(&self, app_id: i64) -> Option<RegionRecord> {
        self.records.read().get(&app_id).cloned()
    }

    fn update_destination(&self, app_id: i64, destination: NodeId) -> Result<()> {
        let mut records = self.records.write();
        let record = records.get_mut(&app_id).ok_or_else(|| {
            FabricError::Metadata(format!("no metadata record for application id {app_id}"))
        })?;
        record.destination = Some(destination);
        Ok(())
    }

    fn delete_region(&self, app_id: i64) -> Result<()> {
        self.records.write().remove(&app_id);
        Ok(())
    }

    fn regions_for_node(&self, node: NodeId) -> Vec<RegionRecord> {
        let mut records: Vec<RegionRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.source == node || r.destination == Some(node))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.app_id);
        records
    }

    fn mark_live(&self, node: NodeId, app_id: i64) -> Result<()> {
        self.live.write().entry(node).or_default().insert(app_id);
        Ok(())
    }

    fn clear_live(&self, node: NodeId, app_id: i64) -> Result<()> {
        if let Some(set) = self.live.write().get_mut(&node) {
            set.remove(&app_id);
        }
        Ok(())
    }

    fn live_regions(&self, node: NodeId) -> Vec<i64> {
        self.live
            .read()
            .get(&node)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_coordinator() {
        let coordinator = StaticCoordinator::new(NodeId(0), vec![(NodeId(1), 10), (NodeId(2), 20)]);
        assert_eq!(coordinator.resolve(NodeId(2)).unwrap(), 20);
        assert!(matches!(
            coordinator.resolve(NodeId(9)),
            Err(FabricError::UnknownNode(NodeId(9)))
        ));
    }

    #[test]
    fn test_metadata_records_and_live_lists() {
        let metadata = InMemoryMetadata::new();
        metadata
            .record_region(RegionRecord {
                app_id: 1,
                addr: RegionAddress(0x1000),
                size: 64,
                source: NodeId(0),
                destination: None,
            })
            .unwrap();
        metadata.update_destination(1, NodeId(1)).unwrap();
        assert!(metadata.update_destination(2, NodeId(1)).is_err());

        assert_eq!(metadata.regions_for_node(NodeId(1)).len(), 1);
        assert_eq!(metadata.regions_for_node(NodeId(2)).len(), 0);

        metadata.mark_live(NodeId(1), 1).unwrap();
        assert_eq!(metadata.live_regions(NodeId(1)), vec![1]);
        metadata.clear_live(NodeId(1), 1).unwrap();
        assert!(metadata.live_regions(NodeId(1)).is_empty());

        metadata.delete_region(1).unwrap();
        assert!(metadata.lookup_region(1).is_none());
    }
}
