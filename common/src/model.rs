/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! Persisted and transient data types shared by the launcher and image
//! manager.

use crate::ids::{Digest, InstanceIdent, ItemId, NodeId, RuntimeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Runtime state of a persisted instance record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Active,
    Cached,
    Disabled,
}

/// `UpdateItemInfo.type`/`ItemInfo.type`: a component has no layered
/// filesystem, a service does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemType {
    Service,
    Component,
}

/// The persisted record for one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub ident: InstanceIdent,
    pub image_id: ItemId,
    pub update_item_type: ItemType,
    pub node_id: Option<NodeId>,
    /// Set from the previous `node_id` whenever placement moves; used to
    /// avoid bouncing an instance back to the node it just left.
    pub prev_node_id: Option<NodeId>,
    pub runtime_id: Option<RuntimeId>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub manifest_digest: Option<Digest>,
    pub timestamp: DateTime<Utc>,
    pub state: InstanceState,
}

impl InstanceInfo {
    pub fn new(ident: InstanceIdent, image_id: ItemId, update_item_type: ItemType, now: DateTime<Utc>) -> Self {
        Self {
            ident,
            image_id,
            update_item_type,
            node_id: None,
            prev_node_id: None,
            runtime_id: None,
            uid: None,
            gid: None,
            manifest_digest: None,
            timestamp: now,
            state: InstanceState::Cached,
        }
    }

    /// Moves placement to `node_id`, remembering the previous node.
    pub fn move_to_node(&mut self, node_id: NodeId) {
        self.prev_node_id = self.node_id.take();
        self.node_id = Some(node_id);
    }

    pub fn clear_node(&mut self) {
        if self.node_id.is_some() {
            self.prev_node_id = self.node_id.take();
        }
    }
}

/// Reported, non-persisted activation status of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceRunState {
    Activating,
    Active,
    Failed,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub ident: InstanceIdent,
    pub runtime_id: Option<RuntimeId>,
    pub node_id: Option<NodeId>,
    pub service_version: Option<String>,
    pub state: InstanceRunState,
    pub error: Option<String>,
    pub state_checksum: Option<String>,
}

impl InstanceStatus {
    pub fn activating(ident: InstanceIdent, node_id: NodeId, runtime_id: RuntimeId) -> Self {
        Self {
            ident,
            runtime_id: Some(runtime_id),
            node_id: Some(node_id),
            service_version: None,
            state: InstanceRunState::Activating,
            error: None,
            state_checksum: None,
        }
    }

    pub fn failed(ident: InstanceIdent, error: impl Into<String>) -> Self {
        Self {
            ident,
            runtime_id: None,
            node_id: None,
            service_version: None,
            state: InstanceRunState::Failed,
            error: Some(error.into()),
            state_checksum: None,
        }
    }
}

/// A request to install a versioned item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateItemInfo {
    pub id: ItemId,
    pub item_type: ItemType,
    pub version: semver::Version,
    pub manifest_digest: Digest,
}

/// Lifecycle state of a persisted catalog row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemState {
    Installed,
    Cached,
    Outdated,
}

/// The persisted catalog row for one `(id, version)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemInfo {
    pub id: ItemId,
    pub item_type: ItemType,
    pub version: semver::Version,
    pub manifest_digest: Digest,
    pub state: ItemState,
    pub timestamp: DateTime<Utc>,
}

/// Reported item lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateItemState {
    Installed,
    Cached,
    Removed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateItemStatus {
    pub id: ItemId,
    pub item_type: ItemType,
    pub version: semver::Version,
    pub state: UpdateItemState,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{InstanceType, SubjectId};

    fn ident() -> InstanceIdent {
        InstanceIdent {
            item_id: ItemId::new("svc1").unwrap(),
            subject_id: SubjectId::new("subjA").unwrap(),
            instance_index: 0,
            instance_type: InstanceType::Service,
        }
    }

    #[test]
    fn move_to_node_tracks_prev_node() {
        let mut info = InstanceInfo::new(ident(), ItemId::new("svc1").unwrap(), ItemType::Service, Utc::now());
        assert!(info.prev_node_id.is_none());
        info.move_to_node(NodeId::new("nodeA").unwrap());
        assert_eq!(info.node_id.as_ref().unwrap().as_str(), "nodeA");
        assert!(info.prev_node_id.is_none());
        info.move_to_node(NodeId::new("nodeB").unwrap());
        assert_eq!(info.prev_node_id.as_ref().unwrap().as_str(), "nodeA");
        assert_eq!(info.node_id.as_ref().unwrap().as_str(), "nodeB");
    }

    #[test]
    fn clear_node_sets_prev() {
        let mut info = InstanceInfo::new(ident(), ItemId::new("svc1").unwrap(), ItemType::Service, Utc::now());
        info.move_to_node(NodeId::new("nodeA").unwrap());
        info.clear_node();
        assert!(info.node_id.is_none());
        assert_eq!(info.prev_node_id.as_ref().unwrap().as_str(), "nodeA");
    }
}
