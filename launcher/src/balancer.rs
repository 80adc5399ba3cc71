/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! `Balancer`: the two-phase placement algorithm. Phase 1 pins
//! `balancingPolicy = Disabled` services to their current node during a
//! rebalance; Phase 2 greedily places everything else by priority.

use crate::image_info::ImageInfoProvider;
use crate::instance::Instance;
use crate::instance_manager::InstanceManager;
use crate::node::Node;
use crate::node_manager::NodeManager;
use common::error::Result;
use common::ids::{InstanceIdent, InstanceType, ItemId, LabelName, NodeId, RuntimeId, SubjectId};
use common::interfaces::{InstanceRunnerItf, NetworkManagerItf, NetworkServiceData};
use common::model::ItemType;
use common::monitoring::NodeMonitoringData;
use common::oci::{BalancingPolicy, ImageIndex, ImageManifest, ManifestDescriptor, ServiceConfig};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One line of a desired state: place `num_instances` of `item_id` for
/// `subject_id`, at `priority`, gated by `labels`.
#[derive(Debug, Clone)]
pub struct PlacementRequest {
    pub item_id: ItemId,
    pub item_type: ItemType,
    pub subject_id: SubjectId,
    pub priority: i32,
    pub num_instances: u32,
    pub labels: Vec<LabelName>,
}

fn instance_ident(request: &PlacementRequest, index: u64) -> InstanceIdent {
    InstanceIdent {
        item_id: request.item_id.clone(),
        subject_id: request.subject_id.clone(),
        instance_index: index,
        instance_type: match request.item_type {
            ItemType::Service => InstanceType::Service,
            ItemType::Component => InstanceType::Component,
        },
    }
}

pub struct Balancer {
    instances: Arc<InstanceManager>,
    nodes: Arc<NodeManager>,
    image_info: Arc<ImageInfoProvider>,
    network: Arc<dyn NetworkManagerItf>,
    runner: Arc<dyn InstanceRunnerItf>,
    nodes_connection_timeout: Duration,
    disabled_subjects: tokio::sync::Mutex<HashSet<SubjectId>>,
}

struct Candidate {
    node: Arc<Node>,
    node_id: NodeId,
    priority: i32,
    available_cpu: u64,
    available_ram: u64,
    runtime_id: RuntimeId,
}

impl Balancer {
    pub fn new(
        instances: Arc<InstanceManager>,
        nodes: Arc<NodeManager>,
        image_info: Arc<ImageInfoProvider>,
        network: Arc<dyn NetworkManagerItf>,
        runner: Arc<dyn InstanceRunnerItf>,
        nodes_connection_timeout: Duration,
    ) -> Self {
        Self {
            instances,
            nodes,
            image_info,
            network,
            runner,
            nodes_connection_timeout,
            disabled_subjects: tokio::sync::Mutex::new(HashSet::new()),
        }
    }

    /// Updates the disabled-subject set; returns whether anything changed
    /// in a way that warrants a rebalance (an active subject newly
    /// disabled, or a cached subject newly enabled is approximated here as
    /// "the set changed at all" — conservative but safe).
    pub async fn set_subjects(&self, enabled: Vec<SubjectId>) -> bool {
        let enabled: HashSet<SubjectId> = enabled.into_iter().collect();
        let all_subjects: HashSet<SubjectId> = {
            let active = self.instances.active_snapshot().await;
            active.into_iter().map(|i| i.ident.subject_id).collect()
        };
        let newly_disabled: HashSet<SubjectId> = all_subjects.difference(&enabled).cloned().collect();
        let mut disabled = self.disabled_subjects.lock().await;
        let changed = *disabled != newly_disabled;
        *disabled = newly_disabled;
        changed
    }

    async fn is_disabled(&self, subject_id: &SubjectId) -> bool {
        self.disabled_subjects.lock().await.contains(subject_id)
    }

    /// The reactive "cheap path": resends the already-scheduled instances
    /// on each given node (e.g. after it reconnects) without re-running
    /// placement.
    pub async fn resend_instances(&self, node_ids: &[NodeId]) -> Result<()> {
        if node_ids.is_empty() {
            return Ok(());
        }
        let active = self.instances.active_snapshot().await;
        let mut by_node: HashMap<NodeId, Vec<common::model::InstanceInfo>> = HashMap::new();
        for info in active {
            if let Some(node_id) = &info.node_id {
                by_node.entry(node_id.clone()).or_default().push(info);
            }
        }
        for node_id in node_ids {
            let Some(start) = by_node.remove(node_id) else { continue };
            debug!(%node_id, count = start.len(), "resending instances to reconnected node");
            self.runner.update_instances(node_id, Vec::new(), start).await?;
        }
        Ok(())
    }

    /// The placement-cycle entry point: policy balancing, node balancing,
    /// network update, then dispatch.
    pub async fn run_instances(
        &self,
        requests: &[PlacementRequest],
        rebalancing: bool,
        monitoring: &HashMap<NodeId, NodeMonitoringData>,
    ) -> Result<()> {
        let previous_active = self.instances.active_snapshot().await;
        let previous_idents: Vec<InstanceIdent> = previous_active.iter().map(|i| i.ident.clone()).collect();
        let mut scheduled: HashSet<InstanceIdent> = HashSet::new();

        if rebalancing {
            self.run_policy_balancing(requests, &mut scheduled).await?;
        }
        self.run_node_balancing(requests, &scheduled.clone(), &mut scheduled, monitoring).await?;

        self.update_networks(&previous_idents).await?;

        self.instances.submit_stash().await?;
        self.dispatch(&previous_active).await?;
        Ok(())
    }

    async fn run_policy_balancing(&self, requests: &[PlacementRequest], scheduled: &mut HashSet<InstanceIdent>) -> Result<()> {
        for request in requests {
            for index in 0..request.num_instances as u64 {
                let ident = instance_ident(request, index);
                let Some(instance) = self.instances.get_active(&ident).await else { continue };
                let info = instance.info().await;
                let Some(node_id) = info.node_id.clone() else { continue };
                let Some(manifest_digest) = info.manifest_digest.clone() else { continue };

                let outcome = self.pin_if_disabled(&instance, &ident, &node_id, &manifest_digest).await;
                match outcome {
                    Ok(true) => {
                        scheduled.insert(ident);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(%ident, error = %e, "policy balancing failed, deferring to node balancing");
                        let _ = instance.set_error(e.to_string()).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Returns `Ok(true)` if the instance was pinned, `Ok(false)` if its
    /// policy is not `Disabled` (nothing to do here).
    async fn pin_if_disabled(
        &self,
        instance: &Arc<Instance>,
        ident: &InstanceIdent,
        node_id: &NodeId,
        manifest_digest: &common::ids::Digest,
    ) -> Result<bool> {
        let index = self.image_info.get_image_index(&ident.item_id).await?;
        let Some(descriptor) = index.manifests.iter().find(|m| &m.digest == manifest_digest) else {
            return Ok(false);
        };
        let manifest = self.image_info.get_image_manifest(&descriptor.digest).await?;
        let Some(sc_descriptor) = &manifest.service_config else {
            return Ok(false);
        };
        let service_config = self.image_info.get_service_config(&sc_descriptor.digest).await?;
        if service_config.balancing_policy != BalancingPolicy::Disabled {
            return Ok(false);
        }

        let Some(node) = self.nodes.get_node(node_id).await else {
            return Err(common::error::CmError::NotFound(format!("node {node_id} no longer known")));
        };
        let info = instance.info().await;
        let Some(runtime_id) = info.runtime_id.clone() else {
            return Err(common::error::CmError::WrongState("pinned instance has no runtime".into()));
        };
        let node_config = node.config().await;
        let req_cpu = instance.get_requested_cpu(&node_config, &service_config);
        let req_ram = instance.get_requested_ram(&node_config, &service_config);
        node.reserve_resources(ident, &runtime_id, req_cpu, req_ram, &service_config.resources).await?;
        self.instances.add_instance_to_stash(ident, ident.item_id.clone(), info.update_item_type).await?;
        instance.schedule(node_id.clone(), runtime_id).await?;
        Ok(true)
    }

    async fn run_node_balancing(
        &self,
        requests: &[PlacementRequest],
        already_scheduled: &HashSet<InstanceIdent>,
        scheduled: &mut HashSet<InstanceIdent>,
        monitoring: &HashMap<NodeId, NodeMonitoringData>,
    ) -> Result<()> {
        let mut sorted: Vec<&PlacementRequest> = requests.iter().collect();
        sorted.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.item_id.as_str().cmp(b.item_id.as_str())));

        for request in sorted {
            for index in 0..request.num_instances as u64 {
                let ident = instance_ident(request, index);
                if already_scheduled.contains(&ident) || scheduled.contains(&ident) {
                    continue;
                }
                let instance = self
                    .instances
                    .add_instance_to_stash(&ident, request.item_id.clone(), request.item_type)
                    .await?;

                if self.is_disabled(&request.subject_id).await {
                    instance.cache(true).await?;
                    continue;
                }

                match self.place_one(&instance, &ident, request, monitoring).await {
                    Ok(()) => {
                        scheduled.insert(ident);
                    }
                    Err(e) => {
                        warn!(%ident, error = %e, "failed to place instance");
                        let _ = instance.set_error(e.to_string()).await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn place_one(
        &self,
        instance: &Arc<Instance>,
        ident: &InstanceIdent,
        request: &PlacementRequest,
        monitoring: &HashMap<NodeId, NodeMonitoringData>,
    ) -> Result<()> {
        let index = self.image_info.get_image_index(&request.item_id).await?;
        let mut last_error = common::error::CmError::NotFound(format!("no manifest placed {ident}"));

        for descriptor in &index.manifests {
            match self.try_manifest(instance, ident, request, &index, descriptor, monitoring).await {
                Ok(()) => return Ok(()),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }

    async fn try_manifest(
        &self,
        instance: &Arc<Instance>,
        ident: &InstanceIdent,
        request: &PlacementRequest,
        _index: &ImageIndex,
        descriptor: &ManifestDescriptor,
        monitoring: &HashMap<NodeId, NodeMonitoringData>,
    ) -> Result<()> {
        let manifest: ImageManifest = self.image_info.get_image_manifest(&descriptor.digest).await?;
        let Some(sc_descriptor) = &manifest.service_config else {
            return Err(common::error::CmError::NotSupported("manifest has no service config".into()));
        };
        let service_config = self.image_info.get_service_config(&sc_descriptor.digest).await?;
        // Loaded for its side effect: an image config that fails to resolve
        // disqualifies this manifest just like a missing service config.
        let _image_config = self.image_info.get_image_config(&manifest.config.digest).await?;

        let connected = self.nodes.get_connected_nodes().await;

        let mut candidates = Vec::new();
        for node in connected {
            let node_info = node.info().await;
            if !node_info.labels.iter().collect::<HashSet<_>>().is_superset(&request.labels.iter().collect()) {
                continue;
            }
            if !service_config
                .resources
                .iter()
                .all(|required| node_info.shared_resources.iter().any(|r| &r.name == required && r.shared_count > 0))
            {
                continue;
            }

            let Some(best) = self.select_runtime(&node, &node_info.runtimes, descriptor, &service_config).await else {
                continue;
            };
            candidates.push(best);
        }

        if candidates.is_empty() {
            return Err(common::error::CmError::NoMemory(format!("no eligible node for {ident}")));
        }

        let top_priority = candidates.iter().map(|c| c.priority).max().unwrap();
        candidates.retain(|c| c.priority == top_priority);
        candidates.sort_by(|a, b| {
            b.available_cpu
                .cmp(&a.available_cpu)
                .then_with(|| b.available_ram.cmp(&a.available_ram))
                .then_with(|| a.runtime_id.as_str().cmp(b.runtime_id.as_str()))
        });
        let chosen = &candidates[0];

        let node_config = chosen.node.config().await;
        let mut req_cpu = instance.get_requested_cpu(&node_config, &service_config);
        let mut req_ram = instance.get_requested_ram(&node_config, &service_config);
        if let Some(snapshot) = monitoring.get(&chosen.node_id) {
            if chosen.node.needs_balancing().await {
                if let Some(sample) = snapshot.per_instance.iter().find(|p| &p.ident == ident) {
                    req_cpu = req_cpu.max(sample.cpu_dmips);
                    req_ram = req_ram.max(sample.ram_bytes);
                }
            }
        }

        chosen
            .node
            .reserve_resources(ident, &chosen.runtime_id, req_cpu, req_ram, &service_config.resources)
            .await?;
        instance.schedule(chosen.node_id.clone(), chosen.runtime_id.clone()).await
    }

    async fn select_runtime(
        &self,
        node: &Arc<Node>,
        runtimes: &[common::node_info::RuntimeDeclaration],
        descriptor: &ManifestDescriptor,
        service_config: &ServiceConfig,
    ) -> Option<Candidate> {
        let node_info = node.info().await;
        let mut matches = Vec::new();
        for runtime in runtimes {
            if !service_config.runtimes.contains(&runtime.runtime_id) {
                continue;
            }
            if runtime.os != descriptor.platform.os || runtime.architecture != descriptor.platform.architecture {
                continue;
            }
            if let (Some(variant), Some(node_variant)) = (&descriptor.platform.variant, &runtime.variant) {
                if variant != node_variant {
                    continue;
                }
            }
            if let (Some(os_version), Some(node_os_version)) = (&descriptor.platform.os_version, &runtime.os_version) {
                if os_version != node_os_version {
                    continue;
                }
            }
            if !descriptor.platform.os_features.iter().all(|f| runtime.os_features.contains(f)) {
                continue;
            }
            if !node.runtime_slot_free(runtime.runtime_id.as_str()).await {
                continue;
            }
            matches.push(runtime.runtime_id.clone());
        }
        if matches.is_empty() {
            return None;
        }
        matches.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        let runtime_id = matches[0].clone();
        let available_cpu = node.available_cpu(Some(runtime_id.as_str())).await;
        let available_ram = node.available_ram(Some(runtime_id.as_str())).await;
        Some(Candidate {
            node: node.clone(),
            node_id: node_info.node_id,
            priority: node_info.priority,
            available_cpu,
            available_ram,
            runtime_id,
        })
    }

    async fn update_networks(&self, previous_active: &[InstanceIdent]) -> Result<()> {
        let stash_idents: HashSet<InstanceIdent> = {
            let stash = self.instances.active_snapshot().await;
            stash.into_iter().map(|i| i.ident).collect()
        };
        for ident in previous_active {
            if !stash_idents.contains(ident) {
                if let Some(instance) = self.instances.get_active(ident).await {
                    let info = instance.info().await;
                    if let Some(node_id) = info.node_id {
                        self.network.remove_instance_network_parameters(ident, &node_id).await?;
                    }
                }
            }
        }

        let mut by_node: HashMap<NodeId, Vec<String>> = HashMap::new();
        for ident in &stash_idents {
            if let Some(instance) = self.instances.get_active(ident).await {
                let info = instance.info().await;
                if let Some(node_id) = info.node_id {
                    by_node.entry(node_id).or_default().push(info.image_id.to_string());
                }
            }
        }
        for (node_id, providers) in by_node {
            self.network.update_provider_network(providers, &node_id).await?;
        }

        // Exposed-ports instances first, then the rest, so port-forwarding
        // targets have their network parameters reserved before anything
        // that might depend on them.
        for only_exposed_ports in [true, false] {
            for ident in &stash_idents {
                let Some(instance) = self.instances.get_active(ident).await else { continue };
                let info = instance.info().await;
                let Some(node_id) = info.node_id.clone() else { continue };
                let Some(manifest_digest) = info.manifest_digest.clone() else { continue };

                let data = match self.build_network_service_data(&manifest_digest).await {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(%ident, error = %e, "failed to resolve network service data");
                        continue;
                    }
                };

                if only_exposed_ports && data.exposed_ports.is_empty() {
                    continue;
                }

                self.network
                    .prepare_instance_network_parameters(ident, info.image_id.as_str(), &node_id, data)
                    .await?;
            }
        }

        self.network.restart_dns_server().await
    }

    /// `exposedPorts` come from the image config, `allowedConnections` and
    /// `hostname` from the service config (absent for components, which
    /// have no service config to declare them in).
    async fn build_network_service_data(&self, manifest_digest: &common::ids::Digest) -> Result<NetworkServiceData> {
        let manifest = self.image_info.get_image_manifest(manifest_digest).await?;
        let image_config = self.image_info.get_image_config(&manifest.config.digest).await?;

        let (allowed_connections, hosts) = match &manifest.service_config {
            Some(sc_descriptor) => {
                let service_config = self.image_info.get_service_config(&sc_descriptor.digest).await?;
                (service_config.allowed_connections, service_config.hostname.into_iter().collect())
            }
            None => (Vec::new(), Vec::new()),
        };

        Ok(NetworkServiceData {
            exposed_ports: image_config.exposed_ports,
            allowed_connections,
            hosts,
        })
    }

    async fn dispatch(&self, previous_active: &[common::model::InstanceInfo]) -> Result<()> {
        let active = self.instances.active_snapshot().await;
        let mut running_by_node: HashMap<NodeId, Vec<InstanceIdent>> = HashMap::new();
        for info in previous_active {
            if let Some(node_id) = &info.node_id {
                running_by_node.entry(node_id.clone()).or_default().push(info.ident.clone());
            }
        }

        let mut pending = false;
        for node_id in self.nodes.all_node_ids().await {
            let Some(node) = self.nodes.get_node(&node_id).await else { continue };
            let running = running_by_node.get(&node_id).cloned().unwrap_or_default();
            let (stop, start) = node.compute_dispatch_delta(&node_id, &active, &running).await;
            if stop.is_empty() && start.is_empty() {
                continue;
            }
            debug!(%node_id, stop = stop.len(), start = start.len(), "dispatching instance delta");
            self.runner.update_instances(&node_id, stop, start).await?;
            pending = true;
        }

        if pending {
            // The runner reports back asynchronously through
            // `InstanceManager::update_status`; any instance still
            // `Activating` once the window elapses is presumed lost.
            tokio::time::sleep(self.nodes_connection_timeout).await;
            self.instances.fail_stale_activating().await?;
        }
        Ok(())
    }
}
