/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! Idempotent, deduplicated blob installation. Concurrent installers that
//! want the same digest share one download: the second caller waits on a
//! `Notify` instead of re-downloading, then re-checks the file on disk.

use common::blobstore::BlobStorePaths;
use common::error::{CmError, Result};
use common::ids::Digest;
use common::interfaces::{BlobInfoProviderItf, DownloaderItf};
use spaceman::SpaceAllocator;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

pub struct BlobInstaller {
    paths: BlobStorePaths,
    allocator: Arc<SpaceAllocator>,
    downloader: Arc<dyn DownloaderItf>,
    blob_info: Arc<dyn BlobInfoProviderItf>,
    in_progress: Mutex<HashSet<Digest>>,
    notify: Notify,
}

impl BlobInstaller {
    pub fn new(
        paths: BlobStorePaths,
        allocator: Arc<SpaceAllocator>,
        downloader: Arc<dyn DownloaderItf>,
        blob_info: Arc<dyn BlobInfoProviderItf>,
    ) -> Self {
        Self {
            paths,
            allocator,
            downloader,
            blob_info,
            in_progress: Mutex::new(HashSet::new()),
            notify: Notify::new(),
        }
    }

    pub fn paths(&self) -> &BlobStorePaths {
        &self.paths
    }

    /// Ensures `digest` (of `size` bytes) is present and valid on disk.
    pub async fn install_blob(&self, digest: &Digest, size: u64) -> Result<()> {
        loop {
            if self.paths.validate_blob(digest)? {
                return Ok(());
            }
            let path = self.paths.blob_path(digest);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }

            {
                let mut in_progress = self.in_progress.lock().await;
                if in_progress.contains(digest) {
                    drop(in_progress);
                    self.notify.notified().await;
                    continue;
                }
                in_progress.insert(digest.clone());
            }

            let result = self.download_and_validate(digest, size).await;

            {
                let mut in_progress = self.in_progress.lock().await;
                in_progress.remove(digest);
            }
            self.notify.notify_waiters();

            return result;
        }
    }

    async fn download_and_validate(&self, digest: &Digest, size: u64) -> Result<()> {
        let path = self.paths.blob_path(digest);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let space = self.allocator.allocate_space(size).await?;

        let urls = self.blob_info.get_blobs_info(std::slice::from_ref(digest)).await?;
        let url = urls.into_iter().next().ok_or_else(|| {
            CmError::NotFound(format!("no download URL for blob {digest}"))
        })?;

        if let Err(e) = self.downloader.download(digest, &url, &path).await {
            let _ = std::fs::remove_file(&path);
            space.release().await;
            return Err(e);
        }

        if !self.paths.validate_blob(digest)? {
            let _ = std::fs::remove_file(&path);
            space.release().await;
            return Err(CmError::InvalidChecksum(format!(
                "downloaded blob {digest} failed checksum validation"
            )));
        }

        space.accept();
        debug!(%digest, size, "blob installed");
        Ok(())
    }

    /// Deletes a blob from disk and credits its `size` back to the
    /// allocator. A missing file is not an error (it may have already been
    /// unpacked away) but also does not re-credit space that an earlier
    /// call already freed.
    pub async fn remove_blob(&self, digest: &Digest, size: u64) -> Result<()> {
        let path = self.paths.blob_path(digest);
        let removed = match std::fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if removed {
            self.allocator.credit_reclaimed(size).await;
            warn!(%digest, size, "blob removed");
        }
        Ok(())
    }
}
