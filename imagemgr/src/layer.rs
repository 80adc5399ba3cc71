/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! Layer unpacking for service items: expand the packed blob, stamp the
//! unpacked diff digest and size, then drop the now-redundant packed blob.

use crate::blob::BlobInstaller;
use common::error::{CmError, Result};
use common::ids::Digest;
use common::interfaces::ImageHandlerItf;
use std::sync::Arc;
use tracing::debug;

pub struct LayerUnpacker {
    handler: Arc<dyn ImageHandlerItf>,
}

impl LayerUnpacker {
    pub fn new(handler: Arc<dyn ImageHandlerItf>) -> Self {
        Self { handler }
    }

    /// Unpacks `packed_digest` (already installed as a blob) and validates
    /// the result against `expected_diff_id` from the image config.
    pub async fn unpack_and_validate(
        &self,
        installer: &BlobInstaller,
        packed_digest: &Digest,
        media_type: &str,
        expected_diff_id: &Digest,
    ) -> Result<()> {
        let packed_path = installer.paths().blob_path(packed_digest);
        let rootfs_path = installer.paths().layer_rootfs_path(packed_digest);

        if let Some(target_size) = self
            .handler
            .get_unpacked_layer_size(&packed_path, media_type)
            .await?
        {
            debug!(%packed_digest, target_size, "unpacked layer size hint");
        }

        std::fs::create_dir_all(&rootfs_path)?;
        self.handler.unpack_layer(&packed_path, &rootfs_path, media_type).await?;

        let computed = self.handler.get_unpacked_layer_digest(&rootfs_path).await?;
        if &computed != expected_diff_id {
            return Err(CmError::InvalidChecksum(format!(
                "unpacked layer digest mismatch: expected {expected_diff_id}, got {computed}"
            )));
        }

        installer.paths().write_layer_diff_digest(packed_digest, &computed)?;
        let unpacked_size = dir_size(&rootfs_path)?;
        installer.paths().write_layer_size(packed_digest, unpacked_size)?;

        Ok(())
    }

    /// Re-validates an already-unpacked layer by recomputing its digest,
    /// used by readers asking for a layer path after the fact.
    pub async fn validate_unpacked(&self, installer: &BlobInstaller, packed_digest: &Digest) -> Result<()> {
        let rootfs_path = installer.paths().layer_rootfs_path(packed_digest);
        let stored = installer.paths().read_layer_diff_digest(packed_digest)?;
        let recomputed = self.handler.get_unpacked_layer_digest(&rootfs_path).await?;
        if stored != recomputed {
            return Err(CmError::InvalidChecksum(format!(
                "unpacked layer {packed_digest} failed re-validation"
            )));
        }
        Ok(())
    }
}

fn dir_size(path: &std::path::Path) -> Result<u64> {
    let mut total = 0u64;
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                total += dir_size(&entry.path())?;
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}
