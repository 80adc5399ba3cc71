/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! The external-collaborator interfaces consumed by the core.
//! These are the seams where the wire protocol, crypto, cloud transport,
//! network/CNI mechanics, and low-level filesystem primitives plug in —
//! all deliberately out of scope for this crate.

use crate::error::Result;
use crate::ids::{Digest, InstanceIdent, ItemId, NodeId, SubjectId};
use crate::model::{InstanceInfo, InstanceStatus, ItemInfo, UpdateItemInfo};
use crate::monitoring::NodeMonitoringData;
use crate::node_info::{NodeConfig, UnitNodeInfo};
use async_trait::async_trait;
use std::path::Path;

/// Durable KV keyed by `InstanceIdent`.
/// `remove_instance` is idempotent: removing an absent row is not an error.
#[async_trait]
pub trait InstanceStorageItf: Send + Sync {
    async fn add_instance(&self, info: &InstanceInfo) -> Result<()>;
    async fn update_instance(&self, info: &InstanceInfo) -> Result<()>;
    async fn remove_instance(&self, ident: &InstanceIdent) -> Result<()>;
    async fn get_instance(&self, ident: &InstanceIdent) -> Result<Option<InstanceInfo>>;
    async fn get_active_instances(&self) -> Result<Vec<InstanceInfo>>;
}

/// Durable KV keyed by `(id, version)`.
#[async_trait]
pub trait ItemStorageItf: Send + Sync {
    async fn add_update_item(&self, info: &ItemInfo) -> Result<()>;
    async fn update_update_item(&self, info: &ItemInfo) -> Result<()>;
    async fn remove_update_item(&self, id: &ItemId, version: &semver::Version) -> Result<()>;
    async fn get_update_item(&self, id: &ItemId, version: &semver::Version) -> Result<Option<ItemInfo>>;
    async fn get_all_update_items(&self, id: &ItemId) -> Result<Vec<ItemInfo>>;
    async fn get_update_items_count(&self) -> Result<usize>;
    async fn get_all_item_ids(&self) -> Result<Vec<ItemId>>;
}

/// Receives node-info change notifications.
pub trait NodeInfoListener: Send + Sync {
    fn on_node_info_changed(&self, info: UnitNodeInfo);
}

#[async_trait]
pub trait NodeInfoProviderItf: Send + Sync {
    async fn get_all_node_ids(&self) -> Result<Vec<NodeId>>;
    async fn get_node_info(&self, node_id: &NodeId) -> Result<Option<UnitNodeInfo>>;
    fn subscribe_listener(&self, listener: std::sync::Arc<dyn NodeInfoListener>) -> Result<()>;
    fn unsubscribe_listener(&self, listener: &std::sync::Arc<dyn NodeInfoListener>) -> Result<()>;
}

/// Pure lookup; `Ok(None)` (not an error) means "use the default config".
#[async_trait]
pub trait NodeConfigProviderItf: Send + Sync {
    async fn get_node_config(&self, node_id: &NodeId, node_type: &str) -> Result<Option<NodeConfig>>;
}

/// Delivers the stop/start delta to a node's service manager. Asynchronous
/// success: the actual result arrives later through
/// `InstanceStatusReceiverItf`.
#[async_trait]
pub trait InstanceRunnerItf: Send + Sync {
    async fn update_instances(&self, node_id: &NodeId, stop: Vec<InstanceIdent>, start: Vec<InstanceInfo>) -> Result<()>;
}

/// Callback sink for per-node status reports driving `Activating ->
/// Active|Failed` transitions.
pub trait InstanceStatusReceiverItf: Send + Sync {
    fn on_instance_status(&self, status: InstanceStatus);
}

#[derive(Debug, Clone, Default)]
pub struct NetworkServiceData {
    pub exposed_ports: Vec<u16>,
    pub allowed_connections: Vec<String>,
    pub hosts: Vec<String>,
}

/// Opaque CNI/bridge/iptables/DNS collaborator.
#[async_trait]
pub trait NetworkManagerItf: Send + Sync {
    async fn prepare_instance_network_parameters(
        &self,
        ident: &InstanceIdent,
        provider_id: &str,
        node_id: &NodeId,
        data: NetworkServiceData,
    ) -> Result<()>;
    async fn remove_instance_network_parameters(&self, ident: &InstanceIdent, node_id: &NodeId) -> Result<()>;
    async fn update_provider_network(&self, provider_ids: Vec<String>, node_id: &NodeId) -> Result<()>;
    async fn restart_dns_server(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct StorageStateParams {
    pub ident: InstanceIdent,
    pub storage_quota: Option<u64>,
    pub state_quota: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct StorageStatePaths {
    pub storage_path: std::path::PathBuf,
    pub state_path: std::path::PathBuf,
}

/// Per-instance storage/state directory lifecycle with partition-level
/// quota accounting.
#[async_trait]
pub trait StorageStateItf: Send + Sync {
    async fn setup(&self, params: StorageStateParams) -> Result<StorageStatePaths>;
    async fn cleanup(&self, ident: &InstanceIdent) -> Result<()>;
    async fn remove(&self, ident: &InstanceIdent) -> Result<()>;
    fn is_same_partition(&self, a: &Path, b: &Path) -> bool;
    async fn get_total_state_size(&self, ident: &InstanceIdent) -> Result<u64>;
    async fn get_total_storage_size(&self, ident: &InstanceIdent) -> Result<u64>;
}

/// Average over a fixed window; caller must tolerate `Ok(None)` as "no data
/// yet".
#[async_trait]
pub trait MonitoringProviderItf: Send + Sync {
    async fn get_average_monitoring(&self, node_id: &NodeId) -> Result<Option<NodeMonitoringData>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertState {
    Rise,
    Fall,
}

#[derive(Debug, Clone)]
pub struct SystemQuotaAlert {
    pub node_id: NodeId,
    pub tag: String,
    pub state: AlertState,
}

pub trait AlertsListener: Send + Sync {
    fn on_alert(&self, alert: SystemQuotaAlert);
}

/// Launcher subscribes to `SystemQuotaAlert` and reacts only on
/// `state=Fall`.
pub trait AlertsProviderItf: Send + Sync {
    fn subscribe_listener(&self, tags: Vec<String>, listener: std::sync::Arc<dyn AlertsListener>) -> Result<()>;
    fn unsubscribe_listener(&self, listener: &std::sync::Arc<dyn AlertsListener>) -> Result<()>;
}

pub trait SubjectsListener: Send + Sync {
    fn on_subjects_changed(&self, subjects: Vec<SubjectId>);
}

/// Subject list governs instance enable/disable.
#[async_trait]
pub trait IdentProviderItf: Send + Sync {
    async fn get_subjects(&self) -> Result<Vec<SubjectId>>;
    fn subscribe_listener(&self, listener: std::sync::Arc<dyn SubjectsListener>) -> Result<()>;
}

/// Writes the exact bytes; caller validates size/hash.
#[async_trait]
pub trait DownloaderItf: Send + Sync {
    async fn download(&self, digest: &Digest, url: &str, dst_path: &Path) -> Result<()>;
}

/// Per-digest URL lookup in the cloud manifest.
#[async_trait]
pub trait BlobInfoProviderItf: Send + Sync {
    async fn get_blobs_info(&self, digests: &[Digest]) -> Result<Vec<String>>;
}

/// Format-specific, deterministic layer unpacking collaborator.
#[async_trait]
pub trait ImageHandlerItf: Send + Sync {
    async fn unpack_layer(&self, packed_path: &Path, dst_dir: &Path, media_type: &str) -> Result<()>;
    async fn get_unpacked_layer_size(&self, packed_path: &Path, media_type: &str) -> Result<Option<u64>>;
    async fn get_unpacked_layer_digest(&self, unpacked_dir: &Path) -> Result<Digest>;
}

/// Entry point for `UpdateItemInfo` installs, kept here so `imagemgr` does
/// not need a dependency back on the launcher.
#[async_trait]
pub trait ImageManagerItf: Send + Sync {
    async fn install(&self, item: UpdateItemInfo) -> Result<()>;
    async fn uninstall(&self, id: &ItemId) -> Result<()>;
    async fn revert(&self, id: &ItemId) -> Result<()>;
}

/// Listener for the aggregated instance status stream.
pub trait InstanceStatusListener: Send + Sync {
    fn on_instances_statuses_changed(&self, statuses: Vec<InstanceStatus>);
}

pub trait InstanceStatusProviderItf: Send + Sync {
    fn subscribe_listener(&self, listener: std::sync::Arc<dyn InstanceStatusListener>) -> Result<()>;
    fn unsubscribe_listener(&self, listener: &std::sync::Arc<dyn InstanceStatusListener>) -> Result<()>;
}
