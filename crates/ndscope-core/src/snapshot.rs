//! Diagnostic views of manager trees
//!
//! Snapshots are taken node by node, each under its own lock, so a tree that
//! is being mutated concurrently may show a mix of before and after states.

use serde::Serialize;

use crate::manager::{ManagerId, ManagerState, NDManager};
use crate::types::Device;

/// One node and everything beneath it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerSnapshot {
    pub id: ManagerId,
    pub device: Device,
    pub state: ManagerState,
    /// Keys of directly attached resources, sorted
    pub resources: Vec<String>,
    pub children: Vec<ManagerSnapshot>,
}

impl ManagerSnapshot {
    /// Resources attached anywhere in this subtree
    pub fn total_resources(&self) -> usize {
        self.resources.len()
            + self
                .children
                .iter()
                .map(ManagerSnapshot::total_resources)
                .sum::<usize>()
    }
}

/// Every open tree of a registry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrySnapshot {
    pub roots: Vec<ManagerSnapshot>,
}

impl RegistrySnapshot {
    pub fn total_resources(&self) -> usize {
        self.roots.iter().map(ManagerSnapshot::total_resources).sum()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl NDManager {
    pub fn snapshot(&self) -> ManagerSnapshot {
        ManagerSnapshot {
            id: self.id(),
            device: self.device(),
            state: self.state(),
            resources: self.resource_keys(),
            children: self.children().iter().map(NDManager::snapshot).collect(),
        }
    }
}
