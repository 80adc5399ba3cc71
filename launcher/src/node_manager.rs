/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! `NodeManager`: the set of `Node` views keyed by node id, kept in sync
//! with `NodeInfoProviderItf` and exposing the balancer's primary iteration
//! order.

use crate::node::Node;
use common::error::Result;
use common::ids::NodeId;
use common::interfaces::{NodeConfigProviderItf, NodeInfoListener, NodeInfoProviderItf};
use common::monitoring::NodeMonitoringData;
use common::node_info::UnitNodeInfo;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, Notify};
use tracing::info;

struct NodeManagerState {
    nodes: HashMap<NodeId, Arc<Node>>,
    updated: Vec<NodeId>,
}

/// Holds all `Node` views and reacts to node-info subscription callbacks.
/// Constructed behind an `Arc` because it registers itself as a listener.
pub struct NodeManager {
    info_provider: Arc<dyn NodeInfoProviderItf>,
    config_provider: Arc<dyn NodeConfigProviderItf>,
    state: Mutex<NodeManagerState>,
    /// Signaled whenever a node-info change lands, for the launcher's
    /// update loop to wait on.
    pub notify: Notify,
}

struct Listener(Weak<NodeManager>);

impl NodeInfoListener for Listener {
    fn on_node_info_changed(&self, info: UnitNodeInfo) {
        let Some(manager) = self.0.upgrade() else { return };
        tokio::spawn(async move {
            manager.apply_node_info(info).await;
            manager.notify.notify_one();
        });
    }
}

impl NodeManager {
    pub fn new_shared(info_provider: Arc<dyn NodeInfoProviderItf>, config_provider: Arc<dyn NodeConfigProviderItf>) -> Arc<Self> {
        let manager = Arc::new(Self {
            info_provider,
            config_provider,
            state: Mutex::new(NodeManagerState { nodes: HashMap::new(), updated: Vec::new() }),
            notify: Notify::new(),
        });
        manager
    }

    /// Registers this manager as a node-info listener and loads every
    /// currently-known node. Call once, right after `new_shared`.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.info_provider.subscribe_listener(Arc::new(Listener(Arc::downgrade(self))) as Arc<dyn NodeInfoListener>)?;
        for node_id in self.info_provider.get_all_node_ids().await? {
            if let Some(info) = self.info_provider.get_node_info(&node_id).await? {
                self.apply_node_info(info).await;
            }
        }
        Ok(())
    }

    async fn apply_node_info(&self, info: UnitNodeInfo) {
        let mut state = self.state.lock().await;
        let node_id = info.node_id.clone();
        let config = match self.config_provider.get_node_config(&node_id, &info.node_type).await {
            Ok(Some(cfg)) => cfg,
            _ => common::node_info::NodeConfig::default(),
        };
        state.nodes.insert(node_id.clone(), Arc::new(Node::new(info, config)));
        if !state.updated.contains(&node_id) {
            state.updated.push(node_id);
        }
        info!(nodes = state.nodes.len(), "node info applied");
    }

    pub async fn get_node(&self, node_id: &NodeId) -> Option<Arc<Node>> {
        self.state.lock().await.nodes.get(node_id).cloned()
    }

    /// Eligible nodes (`Online + Provisioned`) sorted by
    /// `(priority desc, nodeID asc)`.
    pub async fn get_connected_nodes(&self) -> Vec<Arc<Node>> {
        let state = self.state.lock().await;
        let mut with_info = Vec::new();
        for node in state.nodes.values() {
            let info = node.info().await;
            if info.is_eligible() {
                with_info.push((info.priority, info.node_id.clone(), node.clone()));
            }
        }
        with_info.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        with_info.into_iter().map(|(_, _, n)| n).collect()
    }

    pub async fn all_node_ids(&self) -> Vec<NodeId> {
        self.state.lock().await.nodes.keys().cloned().collect()
    }

    /// Reloads every node's resource view from the last monitoring
    /// snapshot before a placement cycle.
    pub async fn refresh_for_balancing(
        &self,
        monitoring: &(dyn Fn(&NodeId) -> Option<NodeMonitoringData> + Sync),
        rebalancing: bool,
    ) -> Result<()> {
        let state = self.state.lock().await;
        for (node_id, node) in state.nodes.iter() {
            let snapshot = monitoring(node_id);
            node.prepare_for_balancing(self.config_provider.as_ref(), snapshot.as_ref(), rebalancing).await?;
        }
        Ok(())
    }

    /// Drains and returns the set of nodes that reported an update since
    /// the last drain.
    pub async fn drain_updated(&self) -> Vec<NodeId> {
        std::mem::take(&mut self.state.lock().await.updated)
    }
}
