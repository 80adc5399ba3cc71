/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! The process-wide partition registry and per-mount-point accounting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::error::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;

use crate::fsinfo::FsInfoProviderItf;

/// Callback the allocator uses to physically remove an outdated item when
/// it needs to reclaim space.
#[async_trait]
pub trait ItemRemoverItf: Send + Sync {
    async fn remove_item(&self, id: &str) -> Result<()>;
}

#[derive(Clone)]
struct OutdatedItem {
    id: String,
    size: u64,
    timestamp: DateTime<Utc>,
    remover: Arc<dyn ItemRemoverItf>,
    owner: String,
}

pub(crate) struct PartitionInner {
    pub mount_point: PathBuf,
    pub total_size: u64,
    pub available_size: u64,
    pub allocator_count: u32,
    outdated_items: Vec<OutdatedItem>,
}

impl PartitionInner {
    /// Sorts by timestamp ascending and evicts until `need` bytes are
    /// reclaimed or the queue is exhausted.
    async fn remove_outdated_items(&mut self, mut need: u64) -> Result<u64> {
        self.outdated_items.sort_by_key(|item| item.timestamp);

        let mut reclaimed = 0u64;
        while need > 0 {
            let Some(item) = self.outdated_items.first().cloned() else {
                break;
            };
            item.remover.remove_item(&item.id).await?;
            self.outdated_items.remove(0);
            self.available_size += item.size;
            reclaimed += item.size;
            need = need.saturating_sub(item.size);
        }
        Ok(reclaimed)
    }
}

/// Process-wide map `mountPoint -> Partition`, shared across every
/// allocator instance on the same filesystem.
pub struct PartitionRegistry {
    partitions: Mutex<HashMap<PathBuf, Arc<Mutex<PartitionInner>>>>,
}

static REGISTRY: OnceLock<PartitionRegistry> = OnceLock::new();

impl PartitionRegistry {
    pub fn global() -> &'static PartitionRegistry {
        REGISTRY.get_or_init(|| PartitionRegistry {
            partitions: Mutex::new(HashMap::new()),
        })
    }

    /// Pins a partition for `mount_point`, lazily initializing
    /// `availableSize` from the host filesystem on first use.
    pub(crate) async fn acquire(
        &self,
        mount_point: &Path,
        fs_info: &dyn FsInfoProviderItf,
    ) -> Result<Arc<Mutex<PartitionInner>>> {
        let mut partitions = self.partitions.lock().await;
        if let Some(existing) = partitions.get(mount_point) {
            let mut inner = existing.lock().await;
            inner.allocator_count += 1;
            drop(inner);
            return Ok(existing.clone());
        }

        let info = fs_info.query(mount_point)?;
        let partition = Arc::new(Mutex::new(PartitionInner {
            mount_point: mount_point.to_path_buf(),
            total_size: info.total_size,
            available_size: info.available_size,
            allocator_count: 1,
            outdated_items: Vec::new(),
        }));
        partitions.insert(mount_point.to_path_buf(), partition.clone());
        Ok(partition)
    }

    /// Releases one allocator's share; removes the partition entry once the
    /// refcount hits zero.
    pub(crate) async fn release(&self, mount_point: &Path) {
        let mut partitions = self.partitions.lock().await;
        let remove = if let Some(partition) = partitions.get(mount_point) {
            let mut inner = partition.lock().await;
            inner.allocator_count = inner.allocator_count.saturating_sub(1);
            inner.allocator_count == 0
        } else {
            false
        };
        if remove {
            partitions.remove(mount_point);
        }
    }
}

pub(crate) async fn add_outdated_item(
    partition: &Arc<Mutex<PartitionInner>>,
    id: impl Into<String>,
    size: u64,
    timestamp: DateTime<Utc>,
    remover: Arc<dyn ItemRemoverItf>,
    owner: impl Into<String>,
) {
    let id = id.into();
    let mut inner = partition.lock().await;
    inner.outdated_items.retain(|item| item.id != id);
    inner.outdated_items.push(OutdatedItem {
        id,
        size,
        timestamp,
        remover,
        owner: owner.into(),
    });
}

pub(crate) async fn restore_outdated_item(partition: &Arc<Mutex<PartitionInner>>, id: &str) {
    let mut inner = partition.lock().await;
    inner.outdated_items.retain(|item| item.id != id);
}

pub(crate) async fn try_reclaim(partition: &Arc<Mutex<PartitionInner>>, need: u64) -> Result<u64> {
    let mut inner = partition.lock().await;
    inner.remove_outdated_items(need).await
}
