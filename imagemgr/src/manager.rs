/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! `ImageManager`: owns the on-disk content store and the versioned item
//! catalog, presenting a state machine over `(id, version)`.

use crate::blob::BlobInstaller;
use crate::layer::LayerUnpacker;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::error::{CmError, Result};
use common::ids::ItemId;
use common::interfaces::{ImageManagerItf, ItemStorageItf};
use common::model::{ItemInfo, ItemState, ItemType, UpdateItemInfo};
use common::oci::OciSpecItf;
use spaceman::{ItemRemoverItf, SpaceAllocator};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

fn outdated_key(id: &ItemId, version: &semver::Version) -> String {
    format!("{}@{}", id.as_str(), version)
}

fn parse_outdated_key(key: &str) -> Result<(ItemId, semver::Version)> {
    let (id, version) = key
        .rsplit_once('@')
        .ok_or_else(|| CmError::InvalidArgument(format!("malformed outdated item key: {key}")))?;
    Ok((ItemId::new(id)?, semver::Version::parse(version).map_err(|e| {
        CmError::InvalidArgument(format!("malformed version in outdated item key {key}: {e}"))
    })?))
}

pub struct ImageManager {
    storage: Arc<dyn ItemStorageItf>,
    oci: Arc<dyn OciSpecItf>,
    blob_installer: Arc<BlobInstaller>,
    unpacker: LayerUnpacker,
    allocator: Arc<SpaceAllocator>,
    update_item_ttl: ChronoDuration,
    guard: Mutex<()>,
    self_ref: OnceLock<Weak<ImageManager>>,
}

impl ImageManager {
    /// `ImageManager` hands a handle to itself to the space allocator's
    /// eviction queue, so it must be constructed behind an `Arc`.
    pub fn new_shared(
        storage: Arc<dyn ItemStorageItf>,
        oci: Arc<dyn OciSpecItf>,
        blob_installer: Arc<BlobInstaller>,
        unpacker: LayerUnpacker,
        allocator: Arc<SpaceAllocator>,
        update_item_ttl: ChronoDuration,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            storage,
            oci,
            blob_installer,
            unpacker,
            allocator,
            update_item_ttl,
            guard: Mutex::new(()),
            self_ref: OnceLock::new(),
        });
        let _ = manager.self_ref.set(Arc::downgrade(&manager));
        manager
    }

    fn remover_handle(&self) -> Arc<dyn ItemRemoverItf> {
        Arc::new(WeakRemover(self.self_ref.get().cloned().unwrap_or_else(Weak::new)))
    }

    /// Starts the recurring outdated-item sweep. Also runs once immediately
    /// so a restart after downtime catches up right away.
    pub fn spawn_eviction_task(self: &Arc<Self>, period: std::time::Duration) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = manager.sweep_outdated().await {
                    warn!(error = %e, "outdated item sweep failed");
                }
            }
        });
    }

    /// Runs one outdated-item sweep immediately, without waiting for the
    /// next tick of the background interval.
    pub async fn run_eviction_sweep(&self) -> Result<()> {
        self.sweep_outdated().await
    }

    async fn sweep_outdated(&self) -> Result<()> {
        let _lock = self.guard.lock().await;
        let now = Utc::now();
        for id in self.storage.get_all_item_ids().await? {
            for row in self.storage.get_all_update_items(&id).await? {
                if row.state == ItemState::Cached && now - row.timestamp >= self.update_item_ttl {
                    info!(id = %row.id, version = %row.version, "evicting outdated item");
                    self.remove_item_row(&row).await?;
                }
            }
        }
        Ok(())
    }

    /// Physically deletes the content referenced by `row` and its catalog
    /// entry, then drops its place in the eviction queue.
    async fn remove_item_row(&self, row: &ItemInfo) -> Result<()> {
        self.delete_row_content(row).await?;
        self.storage.remove_update_item(&row.id, &row.version).await?;
        self.allocator.restore_outdated_item(&outdated_key(&row.id, &row.version)).await;
        Ok(())
    }

    async fn delete_row_content(&self, row: &ItemInfo) -> Result<()> {
        let manifest = match self.oci.load_image_manifest(&row.manifest_digest).await {
            Ok(manifest) => manifest,
            Err(_) => {
                self.blob_installer.remove_blob(&row.manifest_digest, 0).await?;
                return Ok(());
            }
        };

        if row.item_type == ItemType::Service {
            if let Ok(config) = self.oci.load_image_config(&manifest.config.digest).await {
                for (layer, _diff_id) in manifest.layers.iter().zip(config.rootfs_diff_ids.iter()) {
                    let rootfs = self.blob_installer.paths().layer_rootfs_path(&layer.digest);
                    let _ = std::fs::remove_dir_all(rootfs.parent().unwrap_or(&rootfs));
                    // Already dropped by `install_content` once the layer was
                    // unpacked; a no-op here unless install never got that far.
                    self.blob_installer.remove_blob(&layer.digest, layer.size).await?;
                }
            }
            self.blob_installer.remove_blob(&manifest.config.digest, manifest.config.size).await?;
        } else {
            for layer in &manifest.layers {
                self.blob_installer.remove_blob(&layer.digest, layer.size).await?;
            }
        }
        self.blob_installer.remove_blob(&row.manifest_digest, 0).await?;
        Ok(())
    }

    /// The footprint still held in the allocator for an installed or cached
    /// row: for a service item the packed layers are already freed by
    /// `install_content` once unpacked, so only the config blob remains;
    /// for a component item every layer blob is still on disk. Mirrors
    /// exactly what `delete_row_content` goes on to free.
    async fn installed_size(&self, row: &ItemInfo) -> Result<u64> {
        let manifest = match self.oci.load_image_manifest(&row.manifest_digest).await {
            Ok(manifest) => manifest,
            Err(_) => return Ok(0),
        };

        if row.item_type == ItemType::Service {
            match self.oci.load_image_config(&manifest.config.digest).await {
                Ok(_config) => Ok(manifest.config.size),
                Err(_) => Ok(0),
            }
        } else {
            Ok(manifest.layers.iter().map(|l| l.size).sum())
        }
    }

    async fn install_manifest_content(&self, item: &UpdateItemInfo) -> Result<common::oci::ImageManifest> {
        self.blob_installer.install_blob(&item.manifest_digest, 0).await?;
        self.oci.load_image_manifest(&item.manifest_digest).await
    }

    async fn install_content(&self, item: &UpdateItemInfo) -> Result<()> {
        let manifest = self.install_manifest_content(item).await?;

        if item.item_type == ItemType::Service {
            self.blob_installer
                .install_blob(&manifest.config.digest, manifest.config.size)
                .await?;
            let config = self.oci.load_image_config(&manifest.config.digest).await?;
            if config.rootfs_diff_ids.len() != manifest.layers.len() {
                return Err(CmError::Failed(format!(
                    "image config for {} declares {} diff ids but manifest has {} layers",
                    item.id,
                    config.rootfs_diff_ids.len(),
                    manifest.layers.len()
                )));
            }
            for (layer, diff_id) in manifest.layers.iter().zip(config.rootfs_diff_ids.iter()) {
                self.blob_installer.install_blob(&layer.digest, layer.size).await?;
                self.unpacker
                    .unpack_and_validate(&self.blob_installer, &layer.digest, &layer.media_type, diff_id)
                    .await?;
                // The unpacked rootfs is now the layer's only copy; drop the
                // redundant packed blob and credit its space back.
                self.blob_installer.remove_blob(&layer.digest, layer.size).await?;
            }
        } else {
            for layer in &manifest.layers {
                self.blob_installer.install_blob(&layer.digest, layer.size).await?;
            }
        }
        Ok(())
    }

    /// Marks `row` cached and registers it with the space allocator's
    /// eviction queue.
    async fn demote_to_cached(&self, row: &mut ItemInfo, now: DateTime<Utc>) -> Result<()> {
        row.state = ItemState::Cached;
        row.timestamp = now;
        self.storage.update_update_item(row).await?;
        let size = self.installed_size(row).await?;
        self.allocator
            .add_outdated_item(outdated_key(&row.id, &row.version), size, now, self.remover_handle())
            .await;
        Ok(())
    }
}

/// Forwards the allocator's eviction callback to the owning `ImageManager`
/// without the manager holding a strong reference to itself.
struct WeakRemover(Weak<ImageManager>);

#[async_trait]
impl ItemRemoverItf for WeakRemover {
    async fn remove_item(&self, id: &str) -> Result<()> {
        match self.0.upgrade() {
            Some(manager) => <ImageManager as ItemRemoverItf>::remove_item(&manager, id).await,
            None => Err(CmError::Cancelled("image manager has been dropped".into())),
        }
    }
}

#[async_trait]
impl ItemRemoverItf for ImageManager {
    async fn remove_item(&self, id: &str) -> Result<()> {
        let (item_id, version) = parse_outdated_key(id)?;
        let _lock = self.guard.lock().await;
        let row = self
            .storage
            .get_update_item(&item_id, &version)
            .await?
            .ok_or_else(|| CmError::NotFound(format!("no catalog row for {id}")))?;
        self.remove_item_row(&row).await
    }
}

#[async_trait]
impl ImageManagerItf for ImageManager {
    async fn install(&self, item: UpdateItemInfo) -> Result<()> {
        let _lock = self.guard.lock().await;
        let now = Utc::now();
        let rows = self.storage.get_all_update_items(&item.id).await?;

        let installed = rows.iter().find(|r| r.state == ItemState::Installed).cloned();
        if let Some(inst) = &installed {
            if inst.version == item.version {
                return Err(CmError::AlreadyExist(format!(
                    "{} version {} already installed",
                    item.id, item.version
                )));
            }
            if inst.version > item.version {
                return Err(CmError::WrongState(format!(
                    "refusing to install {} {} over newer installed version {}",
                    item.id, item.version, inst.version
                )));
            }
        }

        if let Some(mut cached) = rows
            .iter()
            .find(|r| r.state == ItemState::Cached && r.version == item.version)
            .cloned()
        {
            cached.state = ItemState::Installed;
            cached.timestamp = now;
            self.storage.update_update_item(&cached).await?;
            self.allocator
                .restore_outdated_item(&outdated_key(&cached.id, &cached.version))
                .await;
            if let Some(mut inst) = installed {
                self.demote_to_cached(&mut inst, now).await?;
            }
            return Ok(());
        }

        if let Some(lesser_cached) = rows
            .iter()
            .find(|r| r.state == ItemState::Cached && r.version < item.version)
            .cloned()
        {
            self.remove_item_row(&lesser_cached).await?;
        }

        self.install_content(&item).await?;

        if let Some(mut inst) = installed {
            self.demote_to_cached(&mut inst, now).await?;
        }

        let row = ItemInfo {
            id: item.id,
            item_type: item.item_type,
            version: item.version,
            manifest_digest: item.manifest_digest,
            state: ItemState::Installed,
            timestamp: now,
        };
        self.storage.add_update_item(&row).await?;
        Ok(())
    }

    async fn uninstall(&self, id: &ItemId) -> Result<()> {
        let _lock = self.guard.lock().await;
        let now = Utc::now();
        for mut row in self.storage.get_all_update_items(id).await? {
            match row.state {
                ItemState::Installed => {
                    self.demote_to_cached(&mut row, now).await?;
                }
                ItemState::Cached | ItemState::Outdated => {
                    self.remove_item_row(&row).await?;
                }
            }
        }
        Ok(())
    }

    async fn revert(&self, id: &ItemId) -> Result<()> {
        let _lock = self.guard.lock().await;
        let rows = self.storage.get_all_update_items(id).await?;
        let installed = rows.iter().find(|r| r.state == ItemState::Installed).cloned();
        let Some(inst) = installed else {
            return Err(CmError::NotFound(format!("{id} has no installed version to revert")));
        };
        self.delete_row_content(&inst).await?;
        self.storage.remove_update_item(&inst.id, &inst.version).await?;

        if let Some(mut cached) = rows
            .iter()
            .filter(|r| r.state == ItemState::Cached)
            .max_by(|a, b| a.version.cmp(&b.version))
            .cloned()
        {
            cached.state = ItemState::Installed;
            self.storage.update_update_item(&cached).await?;
            self.allocator
                .restore_outdated_item(&outdated_key(&cached.id, &cached.version))
                .await;
        }
        Ok(())
    }
}
