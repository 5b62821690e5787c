//! Recovery after a node failure.
//!
//! Tagged regions leave a [`RegionRecord`] in the metadata service and sit
//! on the live list of every node holding a usable copy. When a node dies
//! mid-migration, the survivor of each affected pair decides from those two
//! sources whether its copy is authoritative.

use crate::address::NodeId;
use crate::coordination::{MetadataService, RegionRecord};

/// What to do with one region touched by a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// A surviving node holds a live copy; it becomes the sole owner
    Keep { holder: NodeId },
    /// No live copy survived; free the extent everywhere
    Deallocate,
}

/// Decision for one region record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryDecision {
    pub record: RegionRecord,
    pub action: RecoveryAction,
}

/// Replays the metadata of a failed node.
pub struct RecoveryPlanner<'a> {
    metadata: &'a dyn MetadataService,
}

impl<'a> RecoveryPlanner<'a> {
    pub fn new(metadata: &'a dyn MetadataService) -> Self {
        Self { metadata }
    }

    /// Decide the fate of every region whose record names `failed`.
    pub fn plan(&self, failed: NodeId) -> Vec<RecoveryDecision> {
        self.metadata
            .regions_for_node(failed)
            .into_iter()
            .map(|record| {
                let survivor = if record.source == failed {
                    record.destination
                } else {
                    Some(record.source)
                };
                let action = match survivor {
                    Some(node)
                        if node != failed
                            && self.metadata.live_regions(node).contains(&record.app_id) =>
                    {
                        RecoveryAction::Keep { holder: node }
                    }
                    _ => RecoveryAction::Deallocate,
                };
                RecoveryDecision { record, action }
            })
            .collect()
    }
}
