/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! `SpaceAllocator`/`Space`. A `Space` is a scoped reservation:
//! `accept()` commits, `release()`/`Drop` rolls back, `resize()` adjusts
//! before either terminal operation.

use crate::fsinfo::FsInfoProviderItf;
use crate::partition::{self, ItemRemoverItf, PartitionInner, PartitionRegistry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::error::{CmError, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

struct AllocatorState {
    local_used: u64,
}

/// Pins one partition and stacks a per-allocator local budget
/// (`limitPct * partitionTotalSize / 100`) on top of the partition's shared
/// accounting.
pub struct SpaceAllocator {
    mount_point: PathBuf,
    limit_pct: u32,
    partition: Arc<Mutex<PartitionInner>>,
    state: Mutex<AllocatorState>,
    fs_info: Arc<dyn FsInfoProviderItf>,
}

impl SpaceAllocator {
    pub async fn new(
        mount_point: impl Into<PathBuf>,
        limit_pct: u32,
        fs_info: Arc<dyn FsInfoProviderItf>,
    ) -> Result<Self> {
        let mount_point = mount_point.into();
        let partition = PartitionRegistry::global()
            .acquire(&mount_point, fs_info.as_ref())
            .await?;
        Ok(Self {
            mount_point,
            limit_pct,
            partition,
            state: Mutex::new(AllocatorState { local_used: 0 }),
            fs_info,
        })
    }

    async fn local_budget(&self) -> u64 {
        let inner = self.partition.lock().await;
        inner.total_size * self.limit_pct as u64 / 100
    }

    /// Attempts to reserve `size` bytes, evicting outdated items on
    /// shortfall.
    pub async fn allocate_space(self: &Arc<Self>, size: u64) -> Result<Space> {
        let budget = self.local_budget().await;
        {
            let state = self.state.lock().await;
            if state.local_used + size > budget {
                return Err(CmError::NoMemory(format!(
                    "allocator budget exceeded: used={} requested={} budget={}",
                    state.local_used, size, budget
                )));
            }
        }

        {
            let mut inner = self.partition.lock().await;
            if inner.available_size < size {
                let need = size - inner.available_size;
                drop(inner);
                let reclaimed = partition::try_reclaim(&self.partition, need).await?;
                if reclaimed < need {
                    return Err(CmError::NoMemory(format!(
                        "insufficient space on {}: need {}, reclaimed {}",
                        self.mount_point.display(),
                        need,
                        reclaimed
                    )));
                }
                inner = self.partition.lock().await;
            }
            inner.available_size -= size;
        }

        {
            let mut state = self.state.lock().await;
            state.local_used += size;
        }

        debug!(mount_point = %self.mount_point.display(), size, "space reserved");
        Ok(Space::new(size, self.clone()))
    }

    /// Rolls back `size` bytes from both the local and partition
    /// accounting; called by `Space::release`/`Drop`.
    async fn free(&self, size: u64) {
        let mut inner = self.partition.lock().await;
        inner.available_size += size;
        drop(inner);
        let mut state = self.state.lock().await;
        state.local_used = state.local_used.saturating_sub(size);
    }

    /// Credits `size` bytes back to both the local and partition accounting
    /// for a caller that reclaimed disk space outside a `Space`'s own
    /// accept/release/resize/Drop lifecycle, e.g. `BlobInstaller::remove_blob`
    /// deleting content that was reserved by an earlier, already-accepted
    /// `Space`.
    pub async fn credit_reclaimed(&self, size: u64) {
        self.free(size).await;
    }

    /// Idempotent on `id`: replaces any existing entry.
    pub async fn add_outdated_item(
        &self,
        id: impl Into<String>,
        size: u64,
        timestamp: DateTime<Utc>,
        remover: Arc<dyn ItemRemoverItf>,
    ) {
        partition::add_outdated_item(&self.partition, id, size, timestamp, remover, self.mount_point.display().to_string()).await;
    }

    /// Removes `id` from the eviction queue, e.g. because it became
    /// installed again.
    pub async fn restore_outdated_item(&self, id: &str) {
        partition::restore_outdated_item(&self.partition, id).await;
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub async fn available_size(&self) -> u64 {
        self.partition.lock().await.available_size
    }
}

impl Drop for SpaceAllocator {
    fn drop(&mut self) {
        let partition = self.mount_point.clone();
        tokio::spawn(async move {
            PartitionRegistry::global().release(&partition).await;
        });
    }
}

/// A scoped reservation. Rolls back on `Drop` unless `accept()` was called.
pub struct Space {
    size: u64,
    allocator: Arc<SpaceAllocator>,
    resolved: AtomicBool,
}

impl Space {
    fn new(size: u64, allocator: Arc<SpaceAllocator>) -> Self {
        Self {
            size,
            allocator,
            resolved: AtomicBool::new(false),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Commits the reservation permanently.
    pub fn accept(&self) {
        self.resolved.store(true, Ordering::SeqCst);
    }

    /// Rolls back the reservation immediately rather than waiting for
    /// `Drop`.
    pub async fn release(mut self) {
        self.release_inner().await;
    }

    async fn release_inner(&mut self) {
        if !self.resolved.swap(true, Ordering::SeqCst) {
            self.allocator.free(self.size).await;
        }
    }

    /// Adjusts the reserved size prior to a terminal operation.
    pub async fn resize(&mut self, new_size: u64) -> Result<()> {
        if self.resolved.load(Ordering::SeqCst) {
            return Err(CmError::WrongState("space already accepted or released".into()));
        }
        if new_size > self.size {
            let delta = new_size - self.size;
            let extra = self.allocator.allocate_space(delta).await?;
            extra.accept();
        } else if new_size < self.size {
            self.allocator.free(self.size - new_size).await;
        }
        self.size = new_size;
        Ok(())
    }
}

impl Drop for Space {
    fn drop(&mut self) {
        if !self.resolved.swap(true, Ordering::SeqCst) {
            let allocator = self.allocator.clone();
            let size = self.size;
            tokio::spawn(async move {
                allocator.free(size).await;
            });
        }
    }
}
