/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! `InstanceManager`: active/stash/cached instance lifecycle. The balancer
//! fills the stash during one placement cycle; `SubmitStash` promotes it to
//! active and retires whatever fell out.

use crate::image_info::ImageInfoProvider;
use crate::instance::Instance;
use crate::uidgid::{GidPool, UidPool};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::error::Result;
use common::ids::InstanceIdent;
use common::interfaces::{InstanceStorageItf, StorageStateItf};
use common::model::{InstanceInfo, InstanceRunState, InstanceState, InstanceStatus, ItemType};
use common::monitoring::PerInstanceMonitoringData;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

struct ManagerState {
    active: HashMap<InstanceIdent, Arc<Instance>>,
    stash: HashMap<InstanceIdent, Arc<Instance>>,
    /// Cached instances paired with the timestamp they entered the cache,
    /// so the TTL sweep can find expired ones without re-reading storage.
    cached: HashMap<InstanceIdent, (Arc<Instance>, DateTime<Utc>)>,
}

/// Holds active/stash/cache and the pools shared by every `Instance` it
/// creates.
pub struct InstanceManager {
    storage: Arc<dyn InstanceStorageItf>,
    storage_state: Arc<dyn StorageStateItf>,
    uid_pool: Arc<UidPool>,
    gid_pool: Arc<GidPool>,
    service_ttl: ChronoDuration,
    state: Mutex<ManagerState>,
}

impl InstanceManager {
    pub fn new(
        storage: Arc<dyn InstanceStorageItf>,
        storage_state: Arc<dyn StorageStateItf>,
        uid_pool: Arc<UidPool>,
        gid_pool: Arc<GidPool>,
        service_ttl: ChronoDuration,
    ) -> Self {
        Self {
            storage,
            storage_state,
            uid_pool,
            gid_pool,
            service_ttl,
            state: Mutex::new(ManagerState {
                active: HashMap::new(),
                stash: HashMap::new(),
                cached: HashMap::new(),
            }),
        }
    }

    fn wrap(&self, info: InstanceInfo) -> Instance {
        match info.update_item_type {
            ItemType::Component => Instance::new_component(info, self.storage.clone()),
            ItemType::Service => Instance::new_service(
                info,
                self.storage.clone(),
                self.uid_pool.clone(),
                self.gid_pool.clone(),
                self.storage_state.clone(),
            ),
        }
    }

    /// Loads every persisted row, sorts it into active/cached/disabled, and
    /// drops rows whose image no longer resolves.
    pub async fn load(&self, image_info: &ImageInfoProvider) -> Result<()> {
        let rows = self.storage.get_active_instances().await?;
        let mut state = self.state.lock().await;
        for row in rows {
            let ident = row.ident.clone();
            let instance_state = row.state;
            let instance = Arc::new(self.wrap(row));
            if !instance.is_image_valid(image_info).await {
                warn!(%ident, "dropping instance with no valid image at startup");
                instance.remove().await?;
                continue;
            }
            match instance_state {
                InstanceState::Active => {
                    state.active.insert(ident, instance);
                }
                InstanceState::Cached | InstanceState::Disabled => {
                    let info = instance.info().await;
                    state.cached.insert(ident, (instance, info.timestamp));
                }
            }
        }
        info!(active = state.active.len(), cached = state.cached.len(), "instances loaded");
        Ok(())
    }

    /// Locates or materializes the instance for one placement slot, moving
    /// it into the stash.
    pub async fn add_instance_to_stash(&self, ident: &InstanceIdent, image_id: common::ids::ItemId, item_type: ItemType) -> Result<Arc<Instance>> {
        let mut state = self.state.lock().await;
        if let Some(instance) = state.stash.get(ident) {
            return Ok(instance.clone());
        }
        if let Some(instance) = state.active.remove(ident) {
            state.stash.insert(ident.clone(), instance.clone());
            return Ok(instance);
        }
        if let Some((instance, _)) = state.cached.remove(ident) {
            state.stash.insert(ident.clone(), instance.clone());
            return Ok(instance);
        }
        let info = InstanceInfo::new(ident.clone(), image_id, item_type, Utc::now());
        self.storage.add_instance(&info).await?;
        let instance = Arc::new(self.wrap(info));
        instance.init().await?;
        state.stash.insert(ident.clone(), instance.clone());
        Ok(instance)
    }

    /// Caches anything active that didn't make it back into the stash, then
    /// promotes the stash to active.
    pub async fn submit_stash(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let leftover: Vec<InstanceIdent> = state.active.keys().filter(|k| !state.stash.contains_key(*k)).cloned().collect();
        for ident in leftover {
            if let Some(instance) = state.active.remove(&ident) {
                instance.cache(false).await?;
                let info = instance.info().await;
                state.cached.insert(ident, (instance, info.timestamp));
            }
        }
        state.active = std::mem::take(&mut state.stash);
        Ok(())
    }

    pub async fn update_status(&self, status: InstanceStatus) -> Result<()> {
        let state = self.state.lock().await;
        if let Some(instance) = state.active.get(&status.ident) {
            instance.update_status(status).await?;
        }
        Ok(())
    }

    /// Fans per-instance monitoring samples out by ident; unmatched samples
    /// (the instance already moved on) are silently dropped. Live CPU/RAM
    /// is read back through the node's monitoring snapshot during
    /// balancing rather than cached on the `Instance` itself.
    pub async fn update_monitoring_data(&self, samples: &[PerInstanceMonitoringData]) -> Vec<PerInstanceMonitoringData> {
        let state = self.state.lock().await;
        samples.iter().filter(|s| state.active.contains_key(&s.ident)).cloned().collect()
    }

    pub async fn get_active(&self, ident: &InstanceIdent) -> Option<Arc<Instance>> {
        self.state.lock().await.active.get(ident).cloned()
    }

    pub async fn active_snapshot(&self) -> Vec<InstanceInfo> {
        let state = self.state.lock().await;
        let mut out = Vec::with_capacity(state.active.len());
        for instance in state.active.values() {
            out.push(instance.info().await);
        }
        out
    }

    /// Removes every cached instance whose time in cache has reached
    /// `service_ttl`.
    pub async fn evict_expired_cache(&self) -> Result<()> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let expired: Vec<InstanceIdent> = state
            .cached
            .iter()
            .filter(|(_, (_, ts))| now - *ts >= self.service_ttl)
            .map(|(ident, _)| ident.clone())
            .collect();
        for ident in expired {
            if let Some((instance, _)) = state.cached.remove(&ident) {
                instance.remove().await?;
            }
        }
        Ok(())
    }

    /// Flips any active instance still `Activating` to `Failed` with
    /// `Timeout`; called once, `nodes_connection_timeout` after startup.
    pub async fn fail_stale_activating(&self) -> Result<()> {
        let state = self.state.lock().await;
        for instance in state.active.values() {
            if matches!(instance.status().await, Some(s) if s.state == InstanceRunState::Activating) {
                instance.set_error("timeout").await?;
            }
        }
        Ok(())
    }

    /// Spawns the once-daily cache-TTL sweep.
    pub fn spawn_cache_eviction_task(self: &Arc<Self>, period: std::time::Duration) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = manager.evict_expired_cache().await {
                    warn!(error = %e, "cache eviction sweep failed");
                }
            }
        });
    }

    /// Spawns the one-shot `Activating` timeout sweep, `delay` after start.
    pub fn spawn_startup_timeout_task(self: &Arc<Self>, delay: std::time::Duration) {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = manager.fail_stale_activating().await {
                warn!(error = %e, "startup activating-timeout sweep failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::ids::{InstanceType, ItemId, SubjectId};
    use common::interfaces::{StorageStateParams, StorageStatePaths};
    use std::collections::HashMap as StdHashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex as StdMutex;

    struct MemInstanceStorage {
        rows: StdMutex<StdHashMap<String, InstanceInfo>>,
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

    fn manager() -> InstanceManager {
        InstanceManager::new(
            Arc::new(MemInstanceStorage { rows: StdMutex::new(StdHashMap::new()) }),
            Arc::new(NoopStorageState),
            Arc::new(UidPool::new(5000, 5100).unwrap()),
            Arc::new(GidPool::new(6000, 6100).unwrap()),
            ChronoDuration::days(1),
        )
    }

    fn ident() -> InstanceIdent {
        InstanceIdent {
            item_id: ItemId::new("svc1").unwrap(),
            subject_id: SubjectId::new("subjA").unwrap(),
            instance_index: 0,
            instance_type: InstanceType::Component,
        }
    }

    #[tokio::test]
    async fn stash_then_submit_promotes_to_active() {
        let mgr = manager();
        mgr.add_instance_to_stash(&ident(), ItemId::new("comp1").unwrap(), ItemType::Component).await.unwrap();
        mgr.submit_stash().await.unwrap();
        assert!(mgr.get_active(&ident()).await.is_some());
    }

    #[tokio::test]
    async fn active_not_restashed_is_cached_on_submit() {
        let mgr = manager();
        mgr.add_instance_to_stash(&ident(), ItemId::new("comp1").unwrap(), ItemType::Component).await.unwrap();
        mgr.submit_stash().await.unwrap();
        assert!(mgr.get_active(&ident()).await.is_some());

        // Second cycle's stash never references this instance.
        mgr.submit_stash().await.unwrap();
        assert!(mgr.get_active(&ident()).await.is_none());
    }

    #[tokio::test]
    async fn restashing_an_active_instance_is_idempotent() {
        let mgr = manager();
        mgr.add_instance_to_stash(&ident(), ItemId::new("comp1").unwrap(), ItemType::Component).await.unwrap();
        mgr.submit_stash().await.unwrap();
        let active = mgr.get_active(&ident()).await.unwrap();
        let restashed = mgr.add_instance_to_stash(&ident(), ItemId::new("comp1").unwrap(), ItemType::Component).await.unwrap();
        assert!(Arc::ptr_eq(&active, &restashed));
    }
}
