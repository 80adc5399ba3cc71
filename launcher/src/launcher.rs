/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! `Launcher`: the top-level orchestrator. Owns the desired-state pipeline,
//! the reactive update loop, and aggregate status fan-out to the cloud.
//!
//! Two locks guard distinct concerns, taken in this order when both are
//! needed: `update_state` (cheap, short-held: flags and queues) then
//! `balancing` (held for the whole placement pipeline, so two triggers —
//! an alert and a fresh desired state — cannot interleave inside the
//! balancer).

use crate::balancer::{Balancer, PlacementRequest};
use crate::image_info::ImageInfoProvider;
use crate::instance_manager::InstanceManager;
use crate::node_manager::NodeManager;
use common::error::Result;
use common::ids::{NodeId, SubjectId};
use common::interfaces::{
    AlertState, AlertsListener, AlertsProviderItf, IdentProviderItf, InstanceStatusListener, InstanceStatusProviderItf,
    InstanceStatusReceiverItf, MonitoringProviderItf, SubjectsListener, SystemQuotaAlert,
};
use common::model::InstanceStatus;
use common::monitoring::NodeMonitoringData;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

struct UpdateState {
    updated_nodes: Vec<NodeId>,
    new_subjects: Option<Vec<SubjectId>>,
    alert_received: bool,
    running: bool,
}

pub struct Launcher {
    instances: Arc<InstanceManager>,
    nodes: Arc<NodeManager>,
    balancer: Arc<Balancer>,
    image_info: Arc<ImageInfoProvider>,
    monitoring: Arc<dyn MonitoringProviderItf>,
    ident_provider: Arc<dyn IdentProviderItf>,
    alerts_provider: Arc<dyn AlertsProviderItf>,
    nodes_connection_timeout: Duration,
    cache_eviction_period: Duration,
    update_state: Mutex<UpdateState>,
    update_notify: Notify,
    balancing: Mutex<()>,
    last_desired_state: Mutex<Vec<PlacementRequest>>,
    status_listeners: StdMutex<Vec<Arc<dyn InstanceStatusListener>>>,
}

struct SubjectsListenerImpl(Weak<Launcher>);
impl SubjectsListener for SubjectsListenerImpl {
    fn on_subjects_changed(&self, subjects: Vec<SubjectId>) {
        let Some(launcher) = self.0.upgrade() else { return };
        tokio::spawn(async move {
            let mut state = launcher.update_state.lock().await;
            state.new_subjects = Some(subjects);
            drop(state);
            launcher.update_notify.notify_one();
        });
    }
}

struct AlertsListenerImpl(Weak<Launcher>);
impl AlertsListener for AlertsListenerImpl {
    fn on_alert(&self, alert: SystemQuotaAlert) {
        if alert.state != AlertState::Fall {
            return;
        }
        let Some(launcher) = self.0.upgrade() else { return };
        tokio::spawn(async move {
            let mut state = launcher.update_state.lock().await;
            state.alert_received = true;
            drop(state);
            launcher.update_notify.notify_one();
        });
    }
}

/// Relays `InstanceStatusReceiverItf` callbacks into the instance manager
/// and republishes the aggregate. Held as a trait object by whatever wires
/// in the per-node status transport, so it needs its own weak handle back
/// to the launcher rather than borrowing `&self` directly.
struct StatusReceiver(Weak<Launcher>);
impl InstanceStatusReceiverItf for StatusReceiver {
    fn on_instance_status(&self, status: InstanceStatus) {
        let Some(launcher) = self.0.upgrade() else { return };
        tokio::spawn(async move {
            if let Err(e) = launcher.instances.update_status(status).await {
                warn!(error = %e, "failed to apply instance status");
                return;
            }
            launcher.publish_statuses().await;
        });
    }
}

impl Launcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new_shared(
        instances: Arc<InstanceManager>,
        nodes: Arc<NodeManager>,
        balancer: Arc<Balancer>,
        image_info: Arc<ImageInfoProvider>,
        monitoring: Arc<dyn MonitoringProviderItf>,
        ident_provider: Arc<dyn IdentProviderItf>,
        alerts_provider: Arc<dyn AlertsProviderItf>,
        nodes_connection_timeout: Duration,
        cache_eviction_period: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            instances,
            nodes,
            balancer,
            image_info,
            monitoring,
            ident_provider,
            alerts_provider,
            nodes_connection_timeout,
            cache_eviction_period,
            update_state: Mutex::new(UpdateState {
                updated_nodes: Vec::new(),
                new_subjects: None,
                alert_received: false,
                running: true,
            }),
            update_notify: Notify::new(),
            balancing: Mutex::new(()),
            last_desired_state: Mutex::new(Vec::new()),
            status_listeners: StdMutex::new(Vec::new()),
        })
    }

    /// A handle external transports can use to report per-instance status
    /// back into this launcher.
    pub fn status_receiver(self: &Arc<Self>) -> Arc<dyn InstanceStatusReceiverItf> {
        Arc::new(StatusReceiver(Arc::downgrade(self)))
    }

    /// Loads persisted instances, subscribes to subjects/alerts/node
    /// updates, and starts the background update loop and sweep tasks.
    /// Call once after construction.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.instances.load(&self.image_info).await?;
        self.instances.spawn_cache_eviction_task(self.cache_eviction_period);
        self.instances.spawn_startup_timeout_task(self.nodes_connection_timeout);

        self.ident_provider
            .subscribe_listener(Arc::new(SubjectsListenerImpl(Arc::downgrade(self))))?;
        self.alerts_provider
            .subscribe_listener(vec!["quota".into()], Arc::new(AlertsListenerImpl(Arc::downgrade(self))))?;

        let node_relay = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let Some(launcher) = node_relay.upgrade() else { return };
                launcher.nodes.notify.notified().await;
                let updated = launcher.nodes.drain_updated().await;
                if updated.is_empty() {
                    continue;
                }
                let mut state = launcher.update_state.lock().await;
                state.updated_nodes.extend(updated);
                drop(state);
                launcher.update_notify.notify_one();
            }
        });

        let update_loop = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let Some(launcher) = update_loop.upgrade() else { return };
                launcher.update_notify.notified().await;
                if !launcher.handle_wake().await {
                    return;
                }
            }
        });

        Ok(())
    }

    /// The cloud-facing entry point: records the desired state and runs one
    /// full placement cycle.
    pub async fn run_instances(&self, requests: Vec<PlacementRequest>) -> Result<()> {
        *self.last_desired_state.lock().await = requests.clone();
        self.rebalance_with(requests, false).await
    }

    async fn rebalance_with(&self, requests: Vec<PlacementRequest>, rebalancing: bool) -> Result<()> {
        let _guard = self.balancing.lock().await;
        self.instances.evict_expired_cache().await?;
        let monitoring = self.collect_monitoring().await;
        let monitoring_lookup = monitoring.clone();
        self.nodes
            .refresh_for_balancing(&|id: &NodeId| monitoring_lookup.get(id).cloned(), rebalancing)
            .await?;
        self.balancer.run_instances(&requests, rebalancing, &monitoring).await?;
        self.publish_statuses().await;
        Ok(())
    }

    async fn collect_monitoring(&self) -> HashMap<NodeId, NodeMonitoringData> {
        let mut out = HashMap::new();
        for node_id in self.nodes.all_node_ids().await {
            match self.monitoring.get_average_monitoring(&node_id).await {
                Ok(Some(snapshot)) => {
                    out.insert(node_id, snapshot);
                }
                Ok(None) => {}
                Err(e) => warn!(%node_id, error = %e, "monitoring lookup failed"),
            }
        }
        out
    }

    /// Drains the flags set by subscription callbacks and reacts. Returns
    /// `false` when the launcher has been stopped (the caller should exit
    /// its loop).
    async fn handle_wake(&self) -> bool {
        let (subjects, alert, running) = {
            let mut state = self.update_state.lock().await;
            (state.new_subjects.take(), std::mem::take(&mut state.alert_received), state.running)
        };
        if !running {
            return false;
        }

        let mut needs_rebalance = false;
        if let Some(subjects) = subjects {
            needs_rebalance = self.balancer.set_subjects(subjects).await;
        }

        if !needs_rebalance {
            let updated = std::mem::take(&mut self.update_state.lock().await.updated_nodes);
            if !updated.is_empty() {
                let _guard = self.balancing.lock().await;
                if let Err(e) = self.balancer.resend_instances(&updated).await {
                    warn!(error = %e, "resend to updated nodes failed");
                }
            }
        }

        if alert || needs_rebalance {
            let requests = self.last_desired_state.lock().await.clone();
            if let Err(e) = self.rebalance_with(requests, true).await {
                warn!(error = %e, "rebalance failed");
            }
        }
        true
    }

    /// Idempotent: flips `running` and wakes the update loop so it exits.
    pub async fn stop(&self) {
        let mut state = self.update_state.lock().await;
        if !state.running {
            return;
        }
        state.running = false;
        drop(state);
        self.update_notify.notify_one();
        debug!("launcher stop requested");
    }

    async fn publish_statuses(&self) {
        let infos = self.instances.active_snapshot().await;
        let mut statuses = Vec::with_capacity(infos.len());
        for info in infos {
            let status = match self.instances.get_active(&info.ident).await {
                Some(instance) => instance.status().await,
                None => None,
            };
            statuses.push(status.unwrap_or(InstanceStatus {
                ident: info.ident,
                runtime_id: info.runtime_id,
                node_id: info.node_id,
                service_version: None,
                state: common::model::InstanceRunState::Activating,
                error: None,
                state_checksum: None,
            }));
        }

        let listeners = self.status_listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.on_instances_statuses_changed(statuses.clone());
        }
    }
}

impl InstanceStatusProviderItf for Launcher {
    fn subscribe_listener(&self, listener: Arc<dyn InstanceStatusListener>) -> Result<()> {
        self.status_listeners.lock().unwrap().push(listener);
        Ok(())
    }

    fn unsubscribe_listener(&self, listener: &Arc<dyn InstanceStatusListener>) -> Result<()> {
        self.status_listeners.lock().unwrap().retain(|l| !Arc::ptr_eq(l, listener));
        Ok(())
    }
}
