/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! `PartitionStorageState`: per-instance storage/state directory lifecycle
//! backed by a `spaceman::SpaceAllocator`, one per root.

use async_trait::async_trait;
use common::error::Result;
use common::ids::InstanceIdent;
use common::interfaces::{StorageStateItf, StorageStateParams, StorageStatePaths};
use spaceman::{Space, SpaceAllocator};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

fn instance_dir(root: &Path, ident: &InstanceIdent) -> PathBuf {
    root.join(ident.item_id.as_str()).join(ident.subject_id.as_str()).join(ident.instance_index.to_string())
}

/// Reservations currently held per instance, kept as live, un-accepted
/// `Space` handles so `cleanup`/`remove` can release exactly what `setup`
/// took. Never `accept()`ed: the reservation lives as long as the
/// directory does, and `release()` hands it back to the allocator.
#[derive(Default)]
struct Reservations {
    storage: HashMap<InstanceIdent, Space>,
    state: HashMap<InstanceIdent, Space>,
}

pub struct PartitionStorageState {
    storage_root: PathBuf,
    state_root: PathBuf,
    storage_allocator: Arc<SpaceAllocator>,
    state_allocator: Arc<SpaceAllocator>,
    reservations: Mutex<Reservations>,
}

impl PartitionStorageState {
    pub fn new(
        storage_root: PathBuf,
        state_root: PathBuf,
        storage_allocator: Arc<SpaceAllocator>,
        state_allocator: Arc<SpaceAllocator>,
    ) -> Self {
        Self {
            storage_root,
            state_root,
            storage_allocator,
            state_allocator,
            reservations: Mutex::new(Reservations::default()),
        }
    }
}

#[async_trait]
impl StorageStateItf for PartitionStorageState {
    /// Creates the instance's storage/state directories, reserving their
    /// quotas against the backing partitions first.
    async fn setup(&self, params: StorageStateParams) -> Result<StorageStatePaths> {
        let storage_path = instance_dir(&self.storage_root, &params.ident);
        let state_path = instance_dir(&self.state_root, &params.ident);

        let mut reservations = self.reservations.lock().await;
        if let Some(quota) = params.storage_quota {
            let space = self.storage_allocator.allocate_space(quota).await?;
            reservations.storage.insert(params.ident.clone(), space);
        }
        if let Some(quota) = params.state_quota {
            let space = self.state_allocator.allocate_space(quota).await?;
            reservations.state.insert(params.ident.clone(), space);
        }
        drop(reservations);

        tokio::fs::create_dir_all(&storage_path).await?;
        tokio::fs::create_dir_all(&state_path).await?;
        debug!(%params.ident, storage = %storage_path.display(), state = %state_path.display(), "storage/state provisioned");
        Ok(StorageStatePaths { storage_path, state_path })
    }

    /// Clears the state directory's contents and releases its quota
    /// reservation (the instance may come back from cache and re-`setup`
    /// its state), but leaves storage intact.
    async fn cleanup(&self, ident: &InstanceIdent) -> Result<()> {
        let state_path = instance_dir(&self.state_root, ident);
        if state_path.exists() {
            tokio::fs::remove_dir_all(&state_path).await?;
        }
        if let Some(space) = self.reservations.lock().await.state.remove(ident) {
            space.release().await;
        }
        Ok(())
    }

    /// Removes both directories and releases both quota reservations.
    async fn remove(&self, ident: &InstanceIdent) -> Result<()> {
        let storage_path = instance_dir(&self.storage_root, ident);
        let state_path = instance_dir(&self.state_root, ident);
        if storage_path.exists() {
            tokio::fs::remove_dir_all(&storage_path).await?;
        }
        if state_path.exists() {
            tokio::fs::remove_dir_all(&state_path).await?;
        }

        let mut reservations = self.reservations.lock().await;
        let storage_space = reservations.storage.remove(ident);
        let state_space = reservations.state.remove(ident);
        drop(reservations);
        if let Some(space) = storage_space {
            space.release().await;
        }
        if let Some(space) = state_space {
            space.release().await;
        }
        Ok(())
    }

    fn is_same_partition(&self, a: &Path, b: &Path) -> bool {
        a.starts_with(&self.storage_root) == b.starts_with(&self.storage_root)
            && a.starts_with(&self.state_root) == b.starts_with(&self.state_root)
    }

    async fn get_total_state_size(&self, ident: &InstanceIdent) -> Result<u64> {
        Ok(self.reservations.lock().await.state.get(ident).map(Space::size).unwrap_or(0))
    }

    async fn get_total_storage_size(&self, ident: &InstanceIdent) -> Result<u64> {
        Ok(self.reservations.lock().await.storage.get(ident).map(Space::size).unwrap_or(0))
    }
}
