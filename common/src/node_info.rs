/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! The external, wire-shaped description of a node as opposed to `launcher::node::Node`, which
//! is the mutable in-memory view the balancer reserves against.

use crate::ids::{LabelName, NodeId, ResourceName, RuntimeId};
use serde::{Deserialize, Serialize};

/// A runtime a node offers, with optional per-runtime resource caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeDeclaration {
    pub runtime_id: RuntimeId,
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
    pub os_version: Option<String>,
    pub os_features: Vec<String>,
    /// `None` means the runtime draws from the node's global CPU pool.
    pub allowed_dmips: Option<u64>,
    /// `None` means the runtime draws from the node's global RAM pool.
    pub allowed_ram: Option<u64>,
    /// `0` means unlimited.
    pub max_instances: u32,
}

/// A shared, countable resource a node offers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedResourceDeclaration {
    pub name: ResourceName,
    pub shared_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeConnectivity {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeProvisioning {
    Provisioned,
    Unprovisioned,
}

/// The node-info-provider's view of a node: additions,
/// removals, and connectivity/provisioning transitions are delivered as
/// this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitNodeInfo {
    pub node_id: NodeId,
    pub node_type: String,
    pub resources: Vec<ResourceName>,
    pub shared_resources: Vec<SharedResourceDeclaration>,
    pub runtimes: Vec<RuntimeDeclaration>,
    pub max_dmips: u64,
    pub total_ram: u64,
    pub labels: Vec<LabelName>,
    pub priority: i32,
    pub connectivity: NodeConnectivity,
    pub provisioning: NodeProvisioning,
}

impl UnitNodeInfo {
    /// Only `Online + Provisioned` nodes are eligible for placement
    ///.
    pub fn is_eligible(&self) -> bool {
        self.connectivity == NodeConnectivity::Online && self.provisioning == NodeProvisioning::Provisioned
    }
}

/// Per-node CPU/RAM split ratio and alert thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub max_threshold_pct: u32,
    pub min_threshold_pct: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertRules {
    pub cpu: Option<ThresholdRule>,
    pub ram: Option<ThresholdRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRatios {
    /// Percentage of a quota a service requests by default when it does
    /// not state `requestedResources.cpu` explicitly.
    pub cpu_pct: u32,
    /// Same, for `requestedResources.ram`.
    pub ram_pct: u32,
}

impl Default for ResourceRatios {
    fn default() -> Self {
        Self { cpu_pct: 50, ram_pct: 50 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub resource_ratios: ResourceRatios,
    #[serde(default)]
    pub alert_rules: AlertRules,
}
