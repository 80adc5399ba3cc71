/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! `Node`: the mutable, in-memory view of one unit member that the balancer
//! reserves resources against.

use common::error::{CmError, Result};
use common::ids::{InstanceIdent, ResourceName, RuntimeId};
use common::interfaces::NodeConfigProviderItf;
use common::model::InstanceInfo;
use common::monitoring::NodeMonitoringData;
use common::node_info::{NodeConfig, RuntimeDeclaration, UnitNodeInfo};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

/// Runtimes with no declared cap share this ceiling rather than being
/// truly unbounded.
const MAX_NUM_INSTANCES: u32 = 1024;

struct ReservationRollback {
    runtime_id: Option<RuntimeId>,
    cpu: u64,
    ram: u64,
    reserved_instance_slot: bool,
    reserved_resources: Vec<ResourceName>,
}

struct NodeState {
    info: UnitNodeInfo,
    config: NodeConfig,
    available_cpu: u64,
    available_ram: u64,
    runtime_available_cpu: HashMap<String, u64>,
    runtime_available_ram: HashMap<String, u64>,
    runtime_max_instances: HashMap<String, u32>,
    available_resources: HashMap<String, u32>,
    scheduled: Vec<InstanceIdent>,
    needs_balancing: bool,
}

/// Per-node mutable view: available CPU/RAM (global and per-runtime),
/// shared resource counts, and the scheduled-instance set the balancer
/// fills in during one placement cycle.
pub struct Node {
    state: Mutex<NodeState>,
}

impl Node {
    pub fn new(info: UnitNodeInfo, config: NodeConfig) -> Self {
        let available_cpu = info.max_dmips;
        let available_ram = info.total_ram;
        let available_resources = info
            .shared_resources
            .iter()
            .map(|r| (r.name.as_str().to_string(), r.shared_count))
            .collect();
        Self {
            state: Mutex::new(NodeState {
                info,
                config,
                available_cpu,
                available_ram,
                runtime_available_cpu: HashMap::new(),
                runtime_available_ram: HashMap::new(),
                runtime_max_instances: HashMap::new(),
                available_resources,
                scheduled: Vec::new(),
                needs_balancing: false,
            }),
        }
    }

    pub async fn info(&self) -> UnitNodeInfo {
        self.state.lock().await.info.clone()
    }

    pub async fn config(&self) -> NodeConfig {
        self.state.lock().await.config.clone()
    }

    pub async fn needs_balancing(&self) -> bool {
        self.state.lock().await.needs_balancing
    }

    pub async fn available_cpu(&self, runtime_id: Option<&str>) -> u64 {
        let state = self.state.lock().await;
        match runtime_id.and_then(|r| state.runtime_available_cpu.get(r)) {
            Some(v) => *v,
            None => state.available_cpu,
        }
    }

    pub async fn available_ram(&self, runtime_id: Option<&str>) -> u64 {
        let state = self.state.lock().await;
        match runtime_id.and_then(|r| state.runtime_available_ram.get(r)) {
            Some(v) => *v,
            None => state.available_ram,
        }
    }

    pub async fn runtime_slot_free(&self, runtime_id: &str) -> bool {
        let state = self.state.lock().await;
        let declared = state
            .info
            .runtimes
            .iter()
            .find(|r| r.runtime_id.as_str() == runtime_id)
            .map(|r| if r.max_instances == 0 { MAX_NUM_INSTANCES } else { r.max_instances });
        let cap = declared.unwrap_or(MAX_NUM_INSTANCES);
        let used = *state.runtime_max_instances.get(runtime_id).unwrap_or(&0);
        used < cap
    }

    /// Reloads `NodeConfig`, recomputes system usage from the last
    /// monitoring snapshot, and (when `rebalancing`) shrinks the CPU/RAM
    /// pools to the alert-rule low-water mark if usage is over threshold.
    pub async fn prepare_for_balancing(
        &self,
        config_provider: &dyn NodeConfigProviderItf,
        monitoring: Option<&NodeMonitoringData>,
        rebalancing: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(cfg) = config_provider
            .get_node_config(&state.info.node_id, &state.info.node_type)
            .await?
        {
            state.config = cfg;
        }
        state.runtime_available_cpu.clear();
        state.runtime_available_ram.clear();
        state.runtime_max_instances.clear();
        state.needs_balancing = false;

        let total_cpu = state.info.max_dmips;
        let total_ram = state.info.total_ram;
        let (instance_cpu, instance_ram) = monitoring
            .map(|m| {
                m.per_instance
                    .iter()
                    .fold((0u64, 0u64), |(c, r), p| (c + p.cpu_dmips, r + p.ram_bytes))
            })
            .unwrap_or((0, 0));
        let system_cpu_usage = total_cpu.saturating_sub(instance_cpu);
        let system_ram_usage = total_ram.saturating_sub(instance_ram);

        let mut cpu_pool = total_cpu;
        let mut ram_pool = total_ram;

        if rebalancing {
            if let Some(rule) = state.config.alert_rules.cpu.clone() {
                if system_cpu_usage * 100 >= total_cpu * rule.max_threshold_pct as u64 {
                    state.needs_balancing = true;
                    cpu_pool = total_cpu * rule.min_threshold_pct as u64 / 100;
                }
            }
            if let Some(rule) = state.config.alert_rules.ram.clone() {
                // The corrected behavior shrinks against `total_ram`, not
                // `total_cpu` as an earlier revision mistakenly did.
                if system_ram_usage * 100 >= total_ram * rule.max_threshold_pct as u64 {
                    state.needs_balancing = true;
                    ram_pool = total_ram * rule.min_threshold_pct as u64 / 100;
                }
            }
        }

        state.available_cpu = cpu_pool.saturating_sub(system_cpu_usage);
        state.available_ram = ram_pool.saturating_sub(system_ram_usage);
        Ok(())
    }

    /// Reserves CPU, RAM, a runtime slot, and shared resources, in that
    /// order so a single failure rolls back cleanly.
    pub async fn reserve_resources(
        &self,
        ident: &InstanceIdent,
        runtime_id: &RuntimeId,
        req_cpu: u64,
        req_ram: u64,
        req_resources: &[ResourceName],
    ) -> Result<()> {
        let mut state = self.state.lock().await;

        let runtime_declared = state
            .info
            .runtimes
            .iter()
            .find(|r| &r.runtime_id == runtime_id)
            .cloned();
        let Some(runtime) = runtime_declared else {
            return Err(CmError::NotFound(format!("runtime {runtime_id} not offered by node")));
        };

        let mut rollback = ReservationRollback {
            runtime_id: Some(runtime_id.clone()),
            cpu: 0,
            ram: 0,
            reserved_instance_slot: false,
            reserved_resources: Vec::new(),
        };

        let result = try_reserve(&mut state, &runtime, runtime_id, req_cpu, req_ram, req_resources, ident, &mut rollback);

        if let Err(e) = result {
            self.rollback_reservation(&mut state, &rollback);
            return Err(e);
        }

        state.scheduled.push(ident.clone());
        debug!(%ident, %runtime_id, req_cpu, req_ram, "resources reserved");
        Ok(())
    }

    fn rollback_reservation(&self, state: &mut NodeState, rollback: &ReservationRollback) {
        if let Some(runtime_id) = &rollback.runtime_id {
            if rollback.cpu > 0 {
                if let Some(v) = state.runtime_available_cpu.get_mut(runtime_id.as_str()) {
                    *v += rollback.cpu;
                } else {
                    state.available_cpu += rollback.cpu;
                }
            }
            if rollback.ram > 0 {
                if let Some(v) = state.runtime_available_ram.get_mut(runtime_id.as_str()) {
                    *v += rollback.ram;
                } else {
                    state.available_ram += rollback.ram;
                }
            }
            if rollback.reserved_instance_slot {
                if let Some(used) = state.runtime_max_instances.get_mut(runtime_id.as_str()) {
                    *used = used.saturating_sub(1);
                }
            }
        }
        for res in &rollback.reserved_resources {
            if let Some(count) = state.available_resources.get_mut(res.as_str()) {
                *count += 1;
            }
        }
    }

    /// Returns the `(stop, start)` delta for this node: instances currently
    /// `running` that are not in `scheduled` are stopped; instances in
    /// `scheduled` that belong to this node are started.
    pub async fn compute_dispatch_delta(
        &self,
        node_id: &common::ids::NodeId,
        scheduled: &[InstanceInfo],
        running: &[InstanceIdent],
    ) -> (Vec<InstanceIdent>, Vec<InstanceInfo>) {
        let start: Vec<InstanceInfo> = scheduled
            .iter()
            .filter(|i| i.node_id.as_ref() == Some(node_id))
            .cloned()
            .collect();
        let start_idents: std::collections::HashSet<&InstanceIdent> = start.iter().map(|i| &i.ident).collect();
        let stop: Vec<InstanceIdent> = running.iter().filter(|id| !start_idents.contains(id)).cloned().collect();
        (stop, start)
    }

    /// The reactive-path counterpart: dispatches a correction only if the
    /// last-active set and what the node currently reports running
    /// actually differ.
    pub async fn resend_delta(
        &self,
        node_id: &common::ids::NodeId,
        active: &[InstanceInfo],
        running: &[InstanceIdent],
    ) -> Option<(Vec<InstanceIdent>, Vec<InstanceInfo>)> {
        let (stop, start) = self.compute_dispatch_delta(node_id, active, running).await;
        if stop.is_empty() && start.is_empty() {
            None
        } else {
            Some((stop, start))
        }
    }

    pub async fn clear_scheduled(&self) {
        self.state.lock().await.scheduled.clear();
    }
}

/// Checks and decrements CPU, RAM, the runtime instance slot, then every
/// requested shared resource, in that order, recording what succeeded into
/// `rollback` so the caller can undo a partial reservation on failure.
#[allow(clippy::too_many_arguments)]
fn try_reserve(
    state: &mut NodeState,
    runtime: &RuntimeDeclaration,
    runtime_id: &RuntimeId,
    req_cpu: u64,
    req_ram: u64,
    req_resources: &[ResourceName],
    ident: &InstanceIdent,
    rollback: &mut ReservationRollback,
) -> Result<()> {
    let cpu_pool = if runtime.allowed_dmips.is_some() {
        state
            .runtime_available_cpu
            .entry(runtime_id.as_str().to_string())
            .or_insert_with(|| runtime.allowed_dmips.unwrap())
    } else {
        &mut state.available_cpu
    };
    if *cpu_pool < req_cpu {
        return Err(CmError::NoMemory(format!("insufficient CPU on node for {ident}")));
    }
    *cpu_pool -= req_cpu;
    rollback.cpu = req_cpu;

    let ram_pool = if runtime.allowed_ram.is_some() {
        state
            .runtime_available_ram
            .entry(runtime_id.as_str().to_string())
            .or_insert_with(|| runtime.allowed_ram.unwrap())
    } else {
        &mut state.available_ram
    };
    if *ram_pool < req_ram {
        return Err(CmError::NoMemory(format!("insufficient RAM on node for {ident}")));
    }
    *ram_pool -= req_ram;
    rollback.ram = req_ram;

    let cap = if runtime.max_instances == 0 { MAX_NUM_INSTANCES } else { runtime.max_instances };
    let used = state.runtime_max_instances.entry(runtime_id.as_str().to_string()).or_insert(0);
    if *used >= cap {
        return Err(CmError::NoMemory(format!("runtime {runtime_id} at max instances")));
    }
    *used += 1;
    rollback.reserved_instance_slot = true;

    for res in req_resources {
        let count = state
            .available_resources
            .get_mut(res.as_str())
            .ok_or_else(|| CmError::NotFound(format!("shared resource {res} not offered by node")))?;
        if *count == 0 {
            return Err(CmError::NoMemory(format!("shared resource {res} exhausted")));
        }
        *count -= 1;
        rollback.reserved_resources.push(res.clone());
    }
    Ok(())
}
