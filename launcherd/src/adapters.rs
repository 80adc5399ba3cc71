/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! Local, single-node stand-ins for the external-collaborator interfaces
//! `common::interfaces` declares out of scope for the core crates: cloud
//! transport, wire protocols, cluster discovery, and CNI/service-manager
//! dispatch. `launcherd` is a reference daemon, not a full control plane,
//! so each adapter here does the simplest thing that keeps the pipeline
//! running end to end on one machine — a production deployment swaps
//! these for real gRPC/etcd/registry clients without touching `launcher`
//! or `imagemgr`.

use async_trait::async_trait;
use common::blobstore::BlobStorePaths;
use common::error::{CmError, Result};
use common::ids::{Digest, InstanceIdent, ItemId, NodeId, SubjectId};
use common::interfaces::{
    AlertsListener, AlertsProviderItf, BlobInfoProviderItf, DownloaderItf, IdentProviderItf, ImageHandlerItf,
    ImageManagerItf, InstanceRunnerItf, InstanceStorageItf, ItemStorageItf, MonitoringProviderItf, NodeConfigProviderItf,
    NodeInfoListener, NodeInfoProviderItf, SubjectsListener,
};
use common::model::{InstanceInfo, ItemInfo, UpdateItemInfo};
use common::monitoring::NodeMonitoringData;
use common::node_info::{NodeConnectivity, NodeProvisioning, UnitNodeInfo};
use common::oci::{ImageConfig, ImageIndex, ImageManifest, OciSpecItf, ServiceConfig};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

/// Durable KV for instances, as a single JSON file rewritten on every
/// mutation. Adequate for a single-node reference deployment; a cluster
/// control plane would back this with etcd the way
/// `settingsservice::settings_storage` does.
pub struct JsonFileInstanceStorage {
    path: PathBuf,
    rows: Mutex<Vec<InstanceInfo>>,
}

impl JsonFileInstanceStorage {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let rows = read_json_or_default(&path).await?;
        Ok(Self { path, rows: Mutex::new(rows) })
    }

    async fn persist(&self, rows: &[InstanceInfo]) -> Result<()> {
        write_json(&self.path, rows).await
    }
}

#[async_trait]
impl InstanceStorageItf for JsonFileInstanceStorage {
    async fn add_instance(&self, info: &InstanceInfo) -> Result<()> {
        let mut rows = self.rows.lock().await;
        if rows.iter().any(|r| r.ident == info.ident) {
            return Err(CmError::AlreadyExist(format!("instance {} already stored", info.ident)));
        }
        rows.push(info.clone());
        self.persist(&rows).await
    }

    async fn update_instance(&self, info: &InstanceInfo) -> Result<()> {
        let mut rows = self.rows.lock().await;
        match rows.iter_mut().find(|r| r.ident == info.ident) {
            Some(slot) => *slot = info.clone(),
            None => return Err(CmError::NotFound(format!("instance {} not stored", info.ident))),
        }
        self.persist(&rows).await
    }

    async fn remove_instance(&self, ident: &InstanceIdent) -> Result<()> {
        let mut rows = self.rows.lock().await;
        rows.retain(|r| &r.ident != ident);
        self.persist(&rows).await
    }

    async fn get_instance(&self, ident: &InstanceIdent) -> Result<Option<InstanceInfo>> {
        Ok(self.rows.lock().await.iter().find(|r| &r.ident == ident).cloned())
    }

    async fn get_active_instances(&self) -> Result<Vec<InstanceInfo>> {
        Ok(self.rows.lock().await.clone())
    }
}

/// Durable KV for the item catalog, same file-per-store design as
/// `JsonFileInstanceStorage`.
pub struct JsonFileItemStorage {
    path: PathBuf,
    rows: Mutex<Vec<ItemInfo>>,
}

impl JsonFileItemStorage {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let rows = read_json_or_default(&path).await?;
        Ok(Self { path, rows: Mutex::new(rows) })
    }

    async fn persist(&self, rows: &[ItemInfo]) -> Result<()> {
        write_json(&self.path, rows).await
    }
}

#[async_trait]
impl ItemStorageItf for JsonFileItemStorage {
    async fn add_update_item(&self, info: &ItemInfo) -> Result<()> {
        let mut rows = self.rows.lock().await;
        if rows.iter().any(|r| r.id == info.id && r.version == info.version) {
            return Err(CmError::AlreadyExist(format!("item {}@{} already stored", info.id, info.version)));
        }
        rows.push(info.clone());
        self.persist(&rows).await
    }

    async fn update_update_item(&self, info: &ItemInfo) -> Result<()> {
        let mut rows = self.rows.lock().await;
        match rows.iter_mut().find(|r| r.id == info.id && r.version == info.version) {
            Some(slot) => *slot = info.clone(),
            None => return Err(CmError::NotFound(format!("item {}@{} not stored", info.id, info.version))),
        }
        self.persist(&rows).await
    }

    async fn remove_update_item(&self, id: &ItemId, version: &semver::Version) -> Result<()> {
        let mut rows = self.rows.lock().await;
        rows.retain(|r| !(&r.id == id && &r.version == version));
        self.persist(&rows).await
    }

    async fn get_update_item(&self, id: &ItemId, version: &semver::Version) -> Result<Option<ItemInfo>> {
        Ok(self.rows.lock().await.iter().find(|r| &r.id == id && &r.version == version).cloned())
    }

    async fn get_all_update_items(&self, id: &ItemId) -> Result<Vec<ItemInfo>> {
        Ok(self.rows.lock().await.iter().filter(|r| &r.id == id).cloned().collect())
    }

    async fn get_update_items_count(&self) -> Result<usize> {
        Ok(self.rows.lock().await.len())
    }

    async fn get_all_item_ids(&self) -> Result<Vec<ItemId>> {
        let rows = self.rows.lock().await;
        let mut ids: Vec<ItemId> = rows.iter().map(|r| r.id.clone()).collect();
        ids.dedup();
        Ok(ids)
    }
}

async fn read_json_or_default<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| CmError::Failed(format!("malformed {}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

async fn write_json<T: serde::Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(rows).map_err(|e| CmError::Failed(format!("failed to serialize {}: {e}", path.display())))?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

/// Nodes declared once in the daemon's config file. No cluster membership
/// protocol is wired in, so listeners are accepted but never fire.
pub struct StaticNodeInfoProvider {
    nodes: Vec<UnitNodeInfo>,
    listeners: StdMutex<Vec<Arc<dyn NodeInfoListener>>>,
}

impl StaticNodeInfoProvider {
    pub fn new(nodes: Vec<UnitNodeInfo>) -> Self {
        Self { nodes, listeners: StdMutex::new(Vec::new()) }
    }
}

#[async_trait]
impl NodeInfoProviderItf for StaticNodeInfoProvider {
    async fn get_all_node_ids(&self) -> Result<Vec<NodeId>> {
        Ok(self.nodes.iter().map(|n| n.node_id.clone()).collect())
    }

    async fn get_node_info(&self, node_id: &NodeId) -> Result<Option<UnitNodeInfo>> {
        Ok(self.nodes.iter().find(|n| &n.node_id == node_id).cloned())
    }

    fn subscribe_listener(&self, listener: Arc<dyn NodeInfoListener>) -> Result<()> {
        self.listeners.lock().unwrap().push(listener);
        Ok(())
    }

    fn unsubscribe_listener(&self, listener: &Arc<dyn NodeInfoListener>) -> Result<()> {
        self.listeners.lock().unwrap().retain(|l| !Arc::ptr_eq(l, listener));
        Ok(())
    }
}

/// No per-node-type overrides configured; every node uses the balancer's
/// built-in defaults.
#[derive(Debug, Default)]
pub struct StaticNodeConfigProvider;

#[async_trait]
impl NodeConfigProviderItf for StaticNodeConfigProvider {
    async fn get_node_config(&self, _node_id: &NodeId, _node_type: &str) -> Result<Option<common::node_info::NodeConfig>> {
        Ok(None)
    }
}

/// Logs the start/stop delta instead of dispatching it to a real per-node
/// service-manager agent. `InstanceStatusReceiverItf` has no local source
/// to call back into, so instances placed through this runner sit in
/// `Activating` until a real transport is wired in.
#[derive(Debug, Default)]
pub struct LoggingInstanceRunner;

#[async_trait]
impl InstanceRunnerItf for LoggingInstanceRunner {
    async fn update_instances(&self, node_id: &NodeId, stop: Vec<InstanceIdent>, start: Vec<InstanceInfo>) -> Result<()> {
        debug!(
            %node_id,
            stop = ?stop.iter().map(ToString::to_string).collect::<Vec<_>>(),
            start = ?start.iter().map(|i| i.ident.to_string()).collect::<Vec<_>>(),
            "instance delta dispatched (local logging runner)"
        );
        Ok(())
    }
}

/// Subjects fixed at startup from config. No feature-flag/subject feed is
/// wired in, so listeners are accepted but never notified.
pub struct StaticIdentProvider {
    subjects: Vec<SubjectId>,
    listeners: StdMutex<Vec<Arc<dyn SubjectsListener>>>,
}

impl StaticIdentProvider {
    pub fn new(subjects: Vec<SubjectId>) -> Self {
        Self { subjects, listeners: StdMutex::new(Vec::new()) }
    }
}

#[async_trait]
impl IdentProviderItf for StaticIdentProvider {
    async fn get_subjects(&self) -> Result<Vec<SubjectId>> {
        Ok(self.subjects.clone())
    }

    fn subscribe_listener(&self, listener: Arc<dyn SubjectsListener>) -> Result<()> {
        self.listeners.lock().unwrap().push(listener);
        Ok(())
    }
}

/// No system-quota-pressure source configured; the launcher never sees an
/// alert-triggered rebalance.
#[derive(Default)]
pub struct NoAlertsProvider {
    listeners: StdMutex<Vec<Arc<dyn AlertsListener>>>,
}

impl std::fmt::Debug for NoAlertsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoAlertsProvider").finish_non_exhaustive()
    }
}

impl AlertsProviderItf for NoAlertsProvider {
    fn subscribe_listener(&self, _tags: Vec<String>, listener: Arc<dyn AlertsListener>) -> Result<()> {
        self.listeners.lock().unwrap().push(listener);
        Ok(())
    }

    fn unsubscribe_listener(&self, listener: &Arc<dyn AlertsListener>) -> Result<()> {
        self.listeners.lock().unwrap().retain(|l| !Arc::ptr_eq(l, listener));
        Ok(())
    }
}

/// No per-node telemetry collector configured; the balancer falls back to
/// each node's static DMIPS/RAM budget with no live utilization feed.
#[derive(Debug, Default)]
pub struct NoMonitoringProvider;

#[async_trait]
impl MonitoringProviderItf for NoMonitoringProvider {
    async fn get_average_monitoring(&self, _node_id: &NodeId) -> Result<Option<NodeMonitoringData>> {
        Ok(None)
    }
}

/// Resolves blob digests against a local "inbox" directory that an
/// out-of-band fetcher (outside this crate's scope) is expected to
/// populate, rather than a cloud registry manifest.
pub struct LocalBlobInfoProvider {
    inbox: PathBuf,
}

impl LocalBlobInfoProvider {
    pub fn new(inbox: impl Into<PathBuf>) -> Self {
        Self { inbox: inbox.into() }
    }

    fn staged_path(&self, digest: &Digest) -> PathBuf {
        self.inbox.join(digest.algorithm()).join(digest.hex())
    }
}

#[async_trait]
impl BlobInfoProviderItf for LocalBlobInfoProvider {
    async fn get_blobs_info(&self, digests: &[Digest]) -> Result<Vec<String>> {
        Ok(digests.iter().map(|d| self.staged_path(d).display().to_string()).collect())
    }
}

/// Copies a staged local file into the blob store; `url` is a local path
/// produced by `LocalBlobInfoProvider`, not a network address.
#[derive(Debug, Default)]
pub struct LocalDownloader;

#[async_trait]
impl DownloaderItf for LocalDownloader {
    async fn download(&self, digest: &Digest, url: &str, dst_path: &Path) -> Result<()> {
        let src = Path::new(url);
        if !src.exists() {
            return Err(CmError::NotFound(format!("blob {digest} not staged at {}", src.display())));
        }
        if let Some(parent) = dst_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(src, dst_path).await?;
        Ok(())
    }
}

/// Reads already-downloaded index/manifest/config/service-config blobs as
/// plain JSON. Parsing itself is purely local, so this is the one
/// collaborator seam that doesn't need a "cloud" disclaimer.
pub struct JsonOciSpec {
    paths: BlobStorePaths,
}

impl JsonOciSpec {
    pub fn new(paths: BlobStorePaths) -> Self {
        Self { paths }
    }

    fn read<T: serde::de::DeserializeOwned>(&self, digest: &Digest) -> Result<T> {
        let path = self.paths.blob_path(digest);
        let bytes = std::fs::read(&path).map_err(|e| CmError::NotFound(format!("blob {digest} unreadable: {e}")))?;
        serde_json::from_slice(&bytes).map_err(|e| CmError::Failed(format!("malformed blob {digest}: {e}")))
    }
}

#[async_trait]
impl OciSpecItf for JsonOciSpec {
    async fn load_image_index(&self, digest: &Digest) -> Result<ImageIndex> {
        self.read(digest)
    }

    async fn load_image_manifest(&self, digest: &Digest) -> Result<ImageManifest> {
        self.read(digest)
    }

    async fn load_image_config(&self, digest: &Digest) -> Result<ImageConfig> {
        self.read(digest)
    }

    async fn load_service_config(&self, digest: &Digest) -> Result<ServiceConfig> {
        self.read(digest)
    }
}

/// Treats every layer as one opaque blob instead of parsing a real
/// archive format (`tar`/OCI layer parsing is out of scope): "unpacking"
/// copies the packed bytes into `<dst_dir>/content` and the layer's
/// digest is `content`'s own sha256.
#[derive(Debug, Default)]
pub struct RawImageHandler;

#[async_trait]
impl ImageHandlerItf for RawImageHandler {
    async fn unpack_layer(&self, packed_path: &Path, dst_dir: &Path, _media_type: &str) -> Result<()> {
        tokio::fs::create_dir_all(dst_dir).await?;
        tokio::fs::copy(packed_path, dst_dir.join("content")).await?;
        Ok(())
    }

    async fn get_unpacked_layer_size(&self, packed_path: &Path, _media_type: &str) -> Result<Option<u64>> {
        Ok(Some(tokio::fs::metadata(packed_path).await?.len()))
    }

    async fn get_unpacked_layer_digest(&self, unpacked_dir: &Path) -> Result<Digest> {
        let content = tokio::fs::read(unpacked_dir.join("content")).await?;
        use sha2::{Digest as _, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(&content);
        Digest::sha256(hex::encode(hasher.finalize()))
    }
}

/// Bounds how many installs run concurrently, independent of however many
/// requests an external API (out of scope here) hands it at once.
pub struct ThrottledImageManager {
    inner: Arc<dyn ImageManagerItf>,
    installs: Semaphore,
}

impl ThrottledImageManager {
    pub fn new(inner: Arc<dyn ImageManagerItf>, num_install_threads: usize) -> Self {
        Self { inner, installs: Semaphore::new(num_install_threads.max(1)) }
    }
}

#[async_trait]
impl ImageManagerItf for ThrottledImageManager {
    async fn install(&self, item: UpdateItemInfo) -> Result<()> {
        let _permit = self
            .installs
            .acquire()
            .await
            .map_err(|e| CmError::Failed(format!("install semaphore closed: {e}")))?;
        self.inner.install(item).await
    }

    async fn uninstall(&self, id: &ItemId) -> Result<()> {
        self.inner.uninstall(id).await
    }

    async fn revert(&self, id: &ItemId) -> Result<()> {
        self.inner.revert(id).await
    }
}

pub fn node_info_from_config(cfg: &crate::config::StaticNodeConfig) -> Result<UnitNodeInfo> {
    Ok(UnitNodeInfo {
        node_id: NodeId::new(cfg.node_id.clone())?,
        node_type: cfg.node_type.clone(),
        resources: cfg
            .resources
            .iter()
            .map(|r| common::ids::ResourceName::new(r.clone()))
            .collect::<Result<Vec<_>>>()?,
        shared_resources: Vec::new(),
        runtimes: Vec::new(),
        max_dmips: cfg.max_dmips,
        total_ram: cfg.total_ram,
        labels: cfg
            .labels
            .iter()
            .map(|l| common::ids::LabelName::new(l.clone()))
            .collect::<Result<Vec<_>>>()?,
        priority: cfg.priority,
        connectivity: NodeConnectivity::Online,
        provisioning: NodeProvisioning::Provisioned,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ids::{InstanceType, SubjectId as Sid};
    use common::model::{InstanceState, ItemType};

    fn ident(item: &str, subject: &str) -> InstanceIdent {
        InstanceIdent {
            item_id: ItemId::new(item).unwrap(),
            subject_id: Sid::new(subject).unwrap(),
            instance_index: 0,
            instance_type: InstanceType::Service,
        }
    }

    fn instance(item: &str, subject: &str) -> InstanceInfo {
        let mut info = InstanceInfo::new(ident(item, subject), ItemId::new(item).unwrap(), ItemType::Service, chrono::Utc::now());
        info.state = InstanceState::Active;
        info
    }

    #[tokio::test]
    async fn instance_storage_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instances.json");
        let storage = JsonFileInstanceStorage::open(&path).await.unwrap();
        let info = instance("svc", "subjA");
        storage.add_instance(&info).await.unwrap();
        assert!(storage.add_instance(&info).await.is_err());

        let reopened = JsonFileInstanceStorage::open(&path).await.unwrap();
        assert_eq!(reopened.get_active_instances().await.unwrap().len(), 1);

        reopened.remove_instance(&info.ident).await.unwrap();
        assert!(reopened.get_instance(&info.ident).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn item_storage_filters_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.json");
        let storage = JsonFileItemStorage::open(&path).await.unwrap();
        let item = ItemInfo {
            id: ItemId::new("svc").unwrap(),
            item_type: ItemType::Service,
            version: semver::Version::new(1, 0, 0),
            manifest_digest: Digest::sha256("a".repeat(64)).unwrap(),
            state: common::model::ItemState::Installed,
            timestamp: chrono::Utc::now(),
        };
        storage.add_update_item(&item).await.unwrap();
        assert_eq!(storage.get_all_item_ids().await.unwrap(), vec![item.id.clone()]);
        assert_eq!(storage.get_all_update_items(&item.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn local_downloader_copies_staged_blob() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = dir.path().join("inbox");
        let digest = Digest::sha256("b".repeat(64)).unwrap();
        let info_provider = LocalBlobInfoProvider::new(&inbox);
        let staged = info_provider.staged_path(&digest);
        tokio::fs::create_dir_all(staged.parent().unwrap()).await.unwrap();
        tokio::fs::write(&staged, b"payload").await.unwrap();

        let urls = info_provider.get_blobs_info(&[digest.clone()]).await.unwrap();
        let dst = dir.path().join("blob_out");
        LocalDownloader.download(&digest, &urls[0], &dst).await.unwrap();
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn raw_image_handler_round_trips_digest() {
        let dir = tempfile::tempdir().unwrap();
        let packed = dir.path().join("packed.bin");
        tokio::fs::write(&packed, b"layer contents").await.unwrap();
        let dst_dir = dir.path().join("unpacked");

        let handler = RawImageHandler;
        handler.unpack_layer(&packed, &dst_dir, "application/vnd.cm.raw").await.unwrap();
        let digest = handler.get_unpacked_layer_digest(&dst_dir).await.unwrap();

        use sha2::{Digest as _, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(b"layer contents");
        let expected = Digest::sha256(hex::encode(hasher.finalize())).unwrap();
        assert_eq!(digest, expected);
    }

    #[test]
    fn node_info_from_config_builds_eligible_node() {
        let cfg = crate::config::StaticNodeConfig {
            node_id: "node-a".into(),
            node_type: "generic".into(),
            resources: vec![],
            labels: vec![],
            max_dmips: 1000,
            total_ram: 1 << 20,
            priority: 0,
        };
        let node = node_info_from_config(&cfg).unwrap();
        assert!(node.is_eligible());
    }

    struct CountingImageManager {
        installs: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ImageManagerItf for CountingImageManager {
        async fn install(&self, _item: UpdateItemInfo) -> Result<()> {
            self.installs.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
        async fn uninstall(&self, _id: &ItemId) -> Result<()> {
            Ok(())
        }
        async fn revert(&self, _id: &ItemId) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn throttled_image_manager_delegates_calls() {
        let inner = Arc::new(CountingImageManager { installs: std::sync::atomic::AtomicUsize::new(0) });
        let throttled = ThrottledImageManager::new(inner.clone(), 1);
        let item = UpdateItemInfo {
            id: ItemId::new("svc").unwrap(),
            item_type: common::model::ItemType::Service,
            version: semver::Version::new(1, 0, 0),
            manifest_digest: Digest::sha256("f".repeat(64)).unwrap(),
        };
        throttled.install(item).await.unwrap();
        throttled.uninstall(&ItemId::new("svc").unwrap()).await.unwrap();
        assert_eq!(inner.installs.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
