/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! The placement atom. `Instance` is polymorphic over `Component`/`Service`:
//! components have no UID/GID or storage-state lifecycle, services do.

use crate::image_info::ImageInfoProvider;
use crate::uidgid::{GidPool, UidPool};
use chrono::Utc;
use common::error::Result;
use common::ids::{InstanceIdent, NodeId, RuntimeId};
use common::interfaces::{InstanceStorageItf, StorageStateItf, StorageStateParams};
use common::model::{InstanceInfo, InstanceRunState, InstanceState, InstanceStatus, ItemType};
use common::node_info::NodeConfig;
use common::oci::ServiceConfig;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

struct Shared {
    storage: Arc<dyn InstanceStorageItf>,
    info: Mutex<InstanceInfo>,
    status: Mutex<Option<InstanceStatus>>,
}

impl Shared {
    async fn persist(&self, info: &InstanceInfo) -> Result<()> {
        self.storage.update_instance(info).await
    }

    async fn snapshot(&self) -> InstanceInfo {
        self.info.lock().await.clone()
    }
}

pub struct ComponentInstance {
    shared: Shared,
}

pub struct ServiceInstance {
    shared: Shared,
    uid_pool: Arc<UidPool>,
    gid_pool: Arc<GidPool>,
    storage_state: Arc<dyn StorageStateItf>,
}

/// The placement atom: one persisted `InstanceInfo` row plus the
/// per-variant resource policy and lifecycle hooks.
pub enum Instance {
    Component(ComponentInstance),
    Service(ServiceInstance),
}

impl Instance {
    pub fn new_component(info: InstanceInfo, storage: Arc<dyn InstanceStorageItf>) -> Self {
        Instance::Component(ComponentInstance {
            shared: Shared {
                storage,
                info: Mutex::new(info),
                status: Mutex::new(None),
            },
        })
    }

    pub fn new_service(
        info: InstanceInfo,
        storage: Arc<dyn InstanceStorageItf>,
        uid_pool: Arc<UidPool>,
        gid_pool: Arc<GidPool>,
        storage_state: Arc<dyn StorageStateItf>,
    ) -> Self {
        Instance::Service(ServiceInstance {
            shared: Shared {
                storage,
                info: Mutex::new(info),
                status: Mutex::new(None),
            },
            uid_pool,
            gid_pool,
            storage_state,
        })
    }

    fn shared(&self) -> &Shared {
        match self {
            Instance::Component(c) => &c.shared,
            Instance::Service(s) => &s.shared,
        }
    }

    pub fn is_service(&self) -> bool {
        matches!(self, Instance::Service(_))
    }

    pub async fn ident(&self) -> InstanceIdent {
        self.shared().snapshot().await.ident
    }

    pub async fn info(&self) -> InstanceInfo {
        self.shared().snapshot().await
    }

    pub async fn status(&self) -> Option<InstanceStatus> {
        self.shared().status.lock().await.clone()
    }

    /// Service instances acquire their UID (honoring a persisted value) and
    /// their item's GID. Components have nothing to do.
    pub async fn init(&self) -> Result<()> {
        if let Instance::Service(svc) = self {
            let mut info = svc.shared.info.lock().await;
            let uid = match info.uid {
                Some(uid) => {
                    svc.uid_pool.try_acquire(uid).await.ok();
                    uid
                }
                None => svc.uid_pool.acquire().await?,
            };
            let gid = svc.gid_pool.get_gid(info.image_id.as_str(), info.gid.unwrap_or(0)).await?;
            info.uid = Some(uid);
            info.gid = Some(gid);
            let snapshot = info.clone();
            drop(info);
            svc.shared.persist(&snapshot).await?;
        }
        Ok(())
    }

    /// Updates placement, moves to `Activating`, persists.
    pub async fn schedule(&self, node_id: NodeId, runtime_id: RuntimeId) -> Result<()> {
        let shared = self.shared();
        let mut info = shared.info.lock().await;
        info.move_to_node(node_id.clone());
        info.runtime_id = Some(runtime_id.clone());
        info.state = InstanceState::Active;
        info.timestamp = Utc::now();
        let snapshot = info.clone();
        drop(info);
        shared.persist(&snapshot).await?;
        let mut status = shared.status.lock().await;
        *status = Some(InstanceStatus::activating(snapshot.ident, node_id, runtime_id));
        Ok(())
    }

    /// Moves to `Failed`, clears `node_id` (sets `prev_node_id`), persists.
    pub async fn set_error(&self, err: impl Into<String>) -> Result<()> {
        let err = err.into();
        let shared = self.shared();
        let mut info = shared.info.lock().await;
        info.clear_node();
        let snapshot = info.clone();
        drop(info);
        shared.persist(&snapshot).await?;
        let mut status = shared.status.lock().await;
        *status = Some(InstanceStatus::failed(snapshot.ident, err));
        Ok(())
    }

    /// Overwrites transient status and persists the `node_id` change.
    pub async fn update_status(&self, status: InstanceStatus) -> Result<()> {
        let shared = self.shared();
        if let Some(ref node_id) = status.node_id {
            let mut info = shared.info.lock().await;
            if info.node_id.as_ref() != Some(node_id) {
                info.move_to_node(node_id.clone());
                let snapshot = info.clone();
                drop(info);
                shared.persist(&snapshot).await?;
            }
        }
        *shared.status.lock().await = Some(status);
        Ok(())
    }

    /// Sets `state ∈ {Cached, Disabled}`, clears `node_id`, persists.
    /// Service variant also cleans the instance's state file.
    pub async fn cache(&self, disable: bool) -> Result<()> {
        let shared = self.shared();
        let mut info = shared.info.lock().await;
        info.clear_node();
        info.state = if disable { InstanceState::Disabled } else { InstanceState::Cached };
        info.timestamp = Utc::now();
        let snapshot = info.clone();
        drop(info);
        shared.persist(&snapshot).await?;
        *shared.status.lock().await = None;

        if let Instance::Service(svc) = self {
            svc.storage_state.cleanup(&snapshot.ident).await?;
        }
        Ok(())
    }

    /// Hard removes the persisted row. Service variant also releases its
    /// UID/GID and removes its storage/state directories.
    pub async fn remove(&self) -> Result<()> {
        let ident = self.ident().await;
        match self {
            Instance::Component(c) => {
                c.shared.storage.remove_instance(&ident).await?;
            }
            Instance::Service(svc) => {
                let info = svc.shared.snapshot().await;
                svc.shared.storage.remove_instance(&ident).await?;
                svc.storage_state.remove(&ident).await?;
                if let Some(uid) = info.uid {
                    svc.uid_pool.release(uid).await;
                }
                svc.gid_pool.release(info.image_id.as_str()).await;
            }
        }
        debug!(%ident, "instance removed");
        Ok(())
    }

    /// Component variant always returns 0: components do not participate
    /// in dynamic CPU/RAM filtering.
    pub fn get_requested_cpu(&self, node_config: &NodeConfig, service_config: &ServiceConfig) -> u64 {
        match self {
            Instance::Component(_) => 0,
            Instance::Service(_) => requested_quantity(
                service_config.requested_resources.cpu,
                service_config.quotas.cpu_dmips_limit,
                node_config.resource_ratios.cpu_pct,
            ),
        }
    }

    pub fn get_requested_ram(&self, node_config: &NodeConfig, service_config: &ServiceConfig) -> u64 {
        match self {
            Instance::Component(_) => 0,
            Instance::Service(_) => requested_quantity(
                service_config.requested_resources.ram,
                service_config.quotas.ram_limit,
                node_config.resource_ratios.ram_pct,
            ),
        }
    }

    /// Loads the image config (and, for services, the service config) via
    /// `ImageInfoProvider`; the instance must be dropped on startup if this
    /// fails.
    pub async fn is_image_valid(&self, image_info: &ImageInfoProvider) -> bool {
        let info = self.info().await;
        let index = match image_info.get_image_index(&info.image_id).await {
            Ok(index) => index,
            Err(_) => return false,
        };
        let Some(manifest_descriptor) = index.manifests.first() else {
            return false;
        };
        let manifest = match image_info.get_image_manifest(&manifest_descriptor.digest).await {
            Ok(manifest) => manifest,
            Err(_) => return false,
        };
        if image_info.get_image_config(&manifest.config.digest).await.is_err() {
            return false;
        }
        match self {
            Instance::Component(_) => true,
            Instance::Service(_) => match &manifest.service_config {
                Some(sc) => image_info.get_service_config(&sc.digest).await.is_ok(),
                None => false,
            },
        }
    }

    /// Whether a node last reported this instance stopped or timed out.
    pub async fn is_failed(&self) -> bool {
        matches!(
            self.status().await,
            Some(InstanceStatus { state: InstanceRunState::Failed, .. })
        )
    }
}

/// `clamp(requested, quota)` if `requested` is present; otherwise
/// `quota * ratio_pct / 100`, capped at the quota. With no quota, the
/// ratio has nothing to scale and the request (if any) passes through.
fn requested_quantity(requested: Option<u64>, quota: Option<u64>, ratio_pct: u32) -> u64 {
    match (requested, quota) {
        (Some(req), Some(quota)) => req.min(quota),
        (Some(req), None) => req,
        (None, Some(quota)) => quota * ratio_pct as u64 / 100,
        (None, None) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::ids::{InstanceType, ItemId, SubjectId};
    use common::interfaces::StorageStatePaths;
    use common::oci::{Quotas, RequestedResources};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::path::{Path, PathBuf};

    struct MemInstanceStorage {
        rows: StdMutex<HashMap<String, InstanceInfo>>,
    }

    fn key(ident: &InstanceIdent) -> String {
        ident.to_string()
    }

    #[async_trait]
    impl InstanceStorageItf for MemInstanceStorage {
        async fn add_instance(&self, info: &InstanceInfo) -> Result<()> {
            self.rows.lock().unwrap().insert(key(&info.ident), info.clone());
            Ok(())
        }
        async fn update_instance(&self, info: &InstanceInfo) -> Result<()> {
            self.rows.lock().unwrap().insert(key(&info.ident), info.clone());
            Ok(())
        }
        async fn remove_instance(&self, ident: &InstanceIdent) -> Result<()> {
            self.rows.lock().unwrap().remove(&key(ident));
            Ok(())
        }
        async fn get_instance(&self, ident: &InstanceIdent) -> Result<Option<InstanceInfo>> {
            Ok(self.rows.lock().unwrap().get(&key(ident)).cloned())
        }
        async fn get_active_instances(&self) -> Result<Vec<InstanceInfo>> {
            Ok(self.rows.lock().unwrap().values().cloned().collect())
        }
    }

    struct NoopStorageState;
    #[async_trait]
    impl StorageStateItf for NoopStorageState {
        async fn setup(&self, params: StorageStateParams) -> Result<StorageStatePaths> {
            Ok(StorageStatePaths {
                storage_path: PathBuf::from(format!("/tmp/{}/storage", params.ident)),
                state_path: PathBuf::from(format!("/tmp/{}/state", params.ident)),
            })
        }
        async fn cleanup(&self, _ident: &InstanceIdent) -> Result<()> {
            Ok(())
        }
        async fn remove(&self, _ident: &InstanceIdent) -> Result<()> {
            Ok(())
        }
        fn is_same_partition(&self, _a: &Path, _b: &Path) -> bool {
            true
        }
        async fn get_total_state_size(&self, _ident: &InstanceIdent) -> Result<u64> {
            Ok(0)
        }
        async fn get_total_storage_size(&self, _ident: &InstanceIdent) -> Result<u64> {
            Ok(0)
        }
    }

    fn ident(idx: u64) -> InstanceIdent {
        InstanceIdent {
            item_id: ItemId::new("svc1").unwrap(),
            subject_id: SubjectId::new("subjA").unwrap(),
            instance_index: idx,
            instance_type: InstanceType::Service,
        }
    }

    #[tokio::test]
    async fn service_init_acquires_shared_gid() {
        let storage: Arc<dyn InstanceStorageItf> = Arc::new(MemInstanceStorage { rows: StdMutex::new(HashMap::new()) });
        let uid_pool = Arc::new(UidPool::new(5000, 5010).unwrap());
        let gid_pool = Arc::new(GidPool::new(6000, 6010).unwrap());
        let storage_state: Arc<dyn StorageStateItf> = Arc::new(NoopStorageState);

        let info1 = InstanceInfo::new(ident(0), ItemId::new("svc1").unwrap(), ItemType::Service, Utc::now());
        let info2 = InstanceInfo::new(ident(1), ItemId::new("svc1").unwrap(), ItemType::Service, Utc::now());

        let i1 = Instance::new_service(info1, storage.clone(), uid_pool.clone(), gid_pool.clone(), storage_state.clone());
        let i2 = Instance::new_service(info2, storage, uid_pool, gid_pool, storage_state);
        i1.init().await.unwrap();
        i2.init().await.unwrap();

        let gid1 = i1.info().await.gid.unwrap();
        let gid2 = i2.info().await.gid.unwrap();
        assert_eq!(gid1, gid2);
        let uid1 = i1.info().await.uid.unwrap();
        let uid2 = i2.info().await.uid.unwrap();
        assert_ne!(uid1, uid2);
    }

    #[tokio::test]
    async fn schedule_then_cache_clears_node() {
        let storage: Arc<dyn InstanceStorageItf> = Arc::new(MemInstanceStorage { rows: StdMutex::new(HashMap::new()) });
        let instance = Instance::new_component(
            InstanceInfo::new(ident(0), ItemId::new("comp1").unwrap(), ItemType::Component, Utc::now()),
            storage,
        );
        instance
            .schedule(NodeId::new("node-a").unwrap(), RuntimeId::new("rt1").unwrap())
            .await
            .unwrap();
        assert_eq!(instance.info().await.node_id.unwrap().as_str(), "node-a");
        instance.cache(false).await.unwrap();
        assert!(instance.info().await.node_id.is_none());
        assert_eq!(instance.info().await.state, InstanceState::Cached);
    }

    #[test]
    fn requested_quantity_prefers_explicit_request_clamped_to_quota() {
        assert_eq!(requested_quantity(Some(900), Some(500), 50), 500);
        assert_eq!(requested_quantity(None, Some(1000), 50), 500);
        assert_eq!(requested_quantity(Some(200), None, 50), 200);
        assert_eq!(requested_quantity(None, None, 50), 0);
    }

    #[test]
    fn component_requests_zero_cpu_and_ram_regardless_of_config() {
        let storage: Arc<dyn InstanceStorageItf> = Arc::new(MemInstanceStorage { rows: StdMutex::new(HashMap::new()) });
        let instance = Instance::new_component(
            InstanceInfo::new(ident(0), ItemId::new("comp1").unwrap(), ItemType::Component, Utc::now()),
            storage,
        );
        let node_config = NodeConfig::default();
        let mut service_config = ServiceConfig::default();
        service_config.quotas = Quotas { cpu_dmips_limit: Some(100), ram_limit: Some(100) };
        service_config.requested_resources = RequestedResources { cpu: Some(50), ram: Some(50) };
        assert_eq!(instance.get_requested_cpu(&node_config, &service_config), 0);
        assert_eq!(instance.get_requested_ram(&node_config, &service_config), 0);
    }
}
