/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! Read-side counterpart to `imagemgr`: resolves an item's installed image
//! index down to manifests, image configs and service configs, against the
//! same catalog the image manager writes.

use common::error::{CmError, Result};
use common::ids::{Digest, ItemId};
use common::interfaces::ItemStorageItf;
use common::model::ItemState;
use common::oci::{ImageConfig, ImageIndex, ImageManifest, OciSpecItf, ServiceConfig};
use std::sync::Arc;

pub struct ImageInfoProvider {
    storage: Arc<dyn ItemStorageItf>,
    oci: Arc<dyn OciSpecItf>,
}

impl ImageInfoProvider {
    pub fn new(storage: Arc<dyn ItemStorageItf>, oci: Arc<dyn OciSpecItf>) -> Self {
        Self { storage, oci }
    }

    /// Loads the image index for `id`'s currently `Installed` catalog row.
    pub async fn get_image_index(&self, id: &ItemId) -> Result<ImageIndex> {
        let rows = self.storage.get_all_update_items(id).await?;
        let installed = rows
            .into_iter()
            .find(|r| r.state == ItemState::Installed)
            .ok_or_else(|| CmError::NotFound(format!("{id} has no installed version")))?;
        self.oci.load_image_index(&installed.manifest_digest).await
    }

    pub async fn get_image_manifest(&self, digest: &Digest) -> Result<ImageManifest> {
        self.oci.load_image_manifest(digest).await
    }

    pub async fn get_image_config(&self, digest: &Digest) -> Result<ImageConfig> {
        self.oci.load_image_config(digest).await
    }

    pub async fn get_service_config(&self, digest: &Digest) -> Result<ServiceConfig> {
        self.oci.load_service_config(digest).await
    }
}
