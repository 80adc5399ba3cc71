/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use common::blobstore::BlobStorePaths;
use common::error::Result;
use common::ids::{Digest, ItemId};
use common::interfaces::{BlobInfoProviderItf, DownloaderItf, ImageHandlerItf, ImageManagerItf, ItemStorageItf};
use common::model::{ItemInfo, ItemState, ItemType, UpdateItemInfo};
use common::oci::{ContentDescriptor, ImageConfig, ImageManifest, OciSpecItf};
use imagemgr::{BlobInstaller, ImageManager, LayerUnpacker};
use spaceman::{FixedFsInfoProvider, FsInfo, SpaceAllocator};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// In-memory item catalog standing in for a durable KV store.
#[derive(Default)]
struct MemStorage {
    rows: Mutex<HashMap<(String, String), ItemInfo>>,
}

#[async_trait]
impl ItemStorageItf for MemStorage {
    async fn add_update_item(&self, info: &ItemInfo) -> Result<()> {
        self.rows
            .lock()
            .unwrap()
            .insert((info.id.as_str().to_string(), info.version.to_string()), info.clone());
        Ok(())
    }

    async fn update_update_item(&self, info: &ItemInfo) -> Result<()> {
        self.add_update_item(info).await
    }

    async fn remove_update_item(&self, id: &ItemId, version: &semver::Version) -> Result<()> {
        self.rows.lock().unwrap().remove(&(id.as_str().to_string(), version.to_string()));
        Ok(())
    }

    async fn get_update_item(&self, id: &ItemId, version: &semver::Version) -> Result<Option<ItemInfo>> {
        Ok(self.rows.lock().unwrap().get(&(id.as_str().to_string(), version.to_string())).cloned())
    }

    async fn get_all_update_items(&self, id: &ItemId) -> Result<Vec<ItemInfo>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|row| row.id.as_str() == id.as_str())
            .cloned()
            .collect())
    }

    async fn get_update_items_count(&self) -> Result<usize> {
        Ok(self.rows.lock().unwrap().len())
    }

    async fn get_all_item_ids(&self) -> Result<Vec<ItemId>> {
        let mut ids: Vec<String> = self.rows.lock().unwrap().keys().map(|(id, _)| id.clone()).collect();
        ids.sort();
        ids.dedup();
        ids.into_iter().map(|s| ItemId::new(s)).collect()
    }
}

/// Serves manifests/configs straight out of memory, as if already downloaded.
#[derive(Default)]
struct MemOci {
    manifests: Mutex<HashMap<String, ImageManifest>>,
    configs: Mutex<HashMap<String, ImageConfig>>,
}

#[async_trait]
impl OciSpecItf for MemOci {
    async fn load_image_index(&self, _digest: &Digest) -> Result<common::oci::ImageIndex> {
        unimplemented!("not exercised by these tests")
    }

    async fn load_image_manifest(&self, digest: &Digest) -> Result<ImageManifest> {
        self.manifests
            .lock()
            .unwrap()
            .get(&digest.to_string())
            .cloned()
            .ok_or_else(|| common::error::CmError::NotFound(digest.to_string()))
    }

    async fn load_image_config(&self, digest: &Digest) -> Result<ImageConfig> {
        self.configs
            .lock()
            .unwrap()
            .get(&digest.to_string())
            .cloned()
            .ok_or_else(|| common::error::CmError::NotFound(digest.to_string()))
    }

    async fn load_service_config(&self, _digest: &Digest) -> Result<common::oci::ServiceConfig> {
        unimplemented!("not exercised by these tests")
    }
}

struct MemDownloader {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl DownloaderItf for MemDownloader {
    async fn download(&self, digest: &Digest, _url: &str, dst_path: &Path) -> Result<()> {
        let content = self
            .blobs
            .lock()
            .unwrap()
            .get(&digest.to_string())
            .cloned()
            .ok_or_else(|| common::error::CmError::NotFound(digest.to_string()))?;
        std::fs::write(dst_path, content)?;
        Ok(())
    }
}

struct MemBlobInfo;

#[async_trait]
impl BlobInfoProviderItf for MemBlobInfo {
    async fn get_blobs_info(&self, digests: &[Digest]) -> Result<Vec<String>> {
        Ok(digests.iter().map(|d| format!("https://example.invalid/{d}")).collect())
    }
}

/// Treats component blobs as already "unpacked": digest of content == diff id.
struct IdentityHandler;

#[async_trait]
impl ImageHandlerItf for IdentityHandler {
    async fn unpack_layer(&self, packed_path: &Path, dst_dir: &Path, _media_type: &str) -> Result<()> {
        std::fs::copy(packed_path, dst_dir.join("layer.bin"))?;
        Ok(())
    }

    async fn get_unpacked_layer_size(&self, packed_path: &Path, _media_type: &str) -> Result<Option<u64>> {
        Ok(Some(std::fs::metadata(packed_path)?.len()))
    }

    async fn get_unpacked_layer_digest(&self, unpacked_dir: &Path) -> Result<Digest> {
        let content = std::fs::read(unpacked_dir.join("layer.bin"))?;
        Ok(digest_of(&content))
    }
}

fn digest_of(content: &[u8]) -> Digest {
    use sha2::{Digest as _, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(content);
    Digest::sha256(hex::encode(hasher.finalize())).unwrap()
}

struct Harness {
    manager: Arc<ImageManager>,
    storage: Arc<MemStorage>,
    oci: Arc<MemOci>,
    downloader: Arc<MemDownloader>,
    allocator: Arc<SpaceAllocator>,
    _root: tempfile::TempDir,
}

async fn harness() -> Harness {
    let root = tempfile::tempdir().unwrap();
    let allocator = Arc::new(
        SpaceAllocator::new(
            root.path().to_path_buf(),
            100,
            Arc::new(FixedFsInfoProvider {
                info: FsInfo {
                    total_size: 100_000_000,
                    available_size: 100_000_000,
                },
            }),
        )
        .await
        .unwrap(),
    );
    let storage = Arc::new(MemStorage::default());
    let oci = Arc::new(MemOci::default());
    let downloader = Arc::new(MemDownloader { blobs: Mutex::new(HashMap::new()) });
    let installer = Arc::new(BlobInstaller::new(
        BlobStorePaths::new(root.path()),
        allocator.clone(),
        downloader.clone(),
        Arc::new(MemBlobInfo),
    ));
    let unpacker = LayerUnpacker::new(Arc::new(IdentityHandler));
    let manager = ImageManager::new_shared(
        storage.clone(),
        oci.clone(),
        installer,
        unpacker,
        allocator.clone(),
        ChronoDuration::hours(1),
    );
    Harness {
        manager,
        storage,
        oci,
        downloader,
        allocator,
        _root: root,
    }
}

fn register_component_item(h: &Harness, id: &str, version: &str, layer_content: &[u8]) -> UpdateItemInfo {
    let layer_digest = digest_of(layer_content);
    h.downloader
        .blobs
        .lock()
        .unwrap()
        .insert(layer_digest.to_string(), layer_content.to_vec());

    let manifest = ImageManifest {
        config: ContentDescriptor {
            digest: digest_of(b"unused-config"),
            size: 0,
            media_type: "application/vnd.oci.image.config.v1+json".to_string(),
        },
        layers: vec![ContentDescriptor {
            digest: layer_digest.clone(),
            size: layer_content.len() as u64,
            media_type: "application/vnd.oci.image.layer.v1.tar".to_string(),
        }],
        service_config: None,
    };
    let manifest_digest = digest_of(format!("manifest-{id}-{version}").as_bytes());
    h.downloader
        .blobs
        .lock()
        .unwrap()
        .insert(manifest_digest.to_string(), b"unused-manifest-bytes".to_vec());
    h.oci.manifests.lock().unwrap().insert(manifest_digest.to_string(), manifest);

    UpdateItemInfo {
        id: ItemId::new(id).unwrap(),
        item_type: ItemType::Component,
        version: semver::Version::parse(version).unwrap(),
        manifest_digest,
    }
}

#[tokio::test]
async fn install_then_reinstall_same_version_is_already_exist() {
    let h = harness().await;
    let item = register_component_item(&h, "comp-a", "1.0.0", b"payload-v1");
    h.manager.install(item.clone()).await.unwrap();

    let row = h
        .storage
        .get_update_item(&item.id, &item.version)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.state, ItemState::Installed);

    let err = h.manager.install(item).await.unwrap_err();
    assert!(matches!(err, common::error::CmError::AlreadyExist(_)));
}

#[tokio::test]
async fn install_newer_version_caches_the_old_one() {
    let h = harness().await;
    let v1 = register_component_item(&h, "comp-b", "1.0.0", b"payload-v1");
    let v2 = register_component_item(&h, "comp-b", "2.0.0", b"payload-v2");

    h.manager.install(v1.clone()).await.unwrap();
    h.manager.install(v2.clone()).await.unwrap();

    let old = h.storage.get_update_item(&v1.id, &v1.version).await.unwrap().unwrap();
    assert_eq!(old.state, ItemState::Cached);
    let new = h.storage.get_update_item(&v2.id, &v2.version).await.unwrap().unwrap();
    assert_eq!(new.state, ItemState::Installed);
}

#[tokio::test]
async fn install_older_version_over_installed_is_wrong_state() {
    let h = harness().await;
    let v2 = register_component_item(&h, "comp-c", "2.0.0", b"payload-v2");
    let v1 = register_component_item(&h, "comp-c", "1.0.0", b"payload-v1");

    h.manager.install(v2).await.unwrap();
    let err = h.manager.install(v1).await.unwrap_err();
    assert!(matches!(err, common::error::CmError::WrongState(_)));
}

#[tokio::test]
async fn reinstalling_a_cached_version_promotes_without_redownload() {
    let h = harness().await;
    let v1 = register_component_item(&h, "comp-d", "1.0.0", b"payload-v1");
    let v2 = register_component_item(&h, "comp-d", "2.0.0", b"payload-v2");

    h.manager.install(v1.clone()).await.unwrap();
    h.manager.install(v2.clone()).await.unwrap();
    // v1 is now cached; remove its blob from the downloader to prove a
    // re-install of v1 does not attempt to redownload.
    h.downloader.blobs.lock().unwrap().remove(&v1.manifest_digest.to_string());

    h.manager.install(v1.clone()).await.unwrap();
    let row = h.storage.get_update_item(&v1.id, &v1.version).await.unwrap().unwrap();
    assert_eq!(row.state, ItemState::Installed);
    let other = h.storage.get_update_item(&v2.id, &v2.version).await.unwrap().unwrap();
    assert_eq!(other.state, ItemState::Cached);
}

#[tokio::test]
async fn uninstall_moves_installed_to_cached_and_deletes_cached_rows() {
    let h = harness().await;
    let v1 = register_component_item(&h, "comp-e", "1.0.0", b"payload-v1");
    h.manager.install(v1.clone()).await.unwrap();

    h.manager.uninstall(&v1.id).await.unwrap();
    let row = h.storage.get_update_item(&v1.id, &v1.version).await.unwrap().unwrap();
    assert_eq!(row.state, ItemState::Cached);

    h.manager.uninstall(&v1.id).await.unwrap();
    assert!(h.storage.get_update_item(&v1.id, &v1.version).await.unwrap().is_none());
}

#[tokio::test]
async fn revert_restores_previously_cached_version() {
    let h = harness().await;
    let v1 = register_component_item(&h, "comp-f", "1.0.0", b"payload-v1");
    let v2 = register_component_item(&h, "comp-f", "2.0.0", b"payload-v2");
    h.manager.install(v1.clone()).await.unwrap();
    h.manager.install(v2.clone()).await.unwrap();

    h.manager.revert(&v1.id).await.unwrap();

    assert!(h.storage.get_update_item(&v2.id, &v2.version).await.unwrap().is_none());
    let restored = h.storage.get_update_item(&v1.id, &v1.version).await.unwrap().unwrap();
    assert_eq!(restored.state, ItemState::Installed);
}

#[tokio::test]
async fn cached_item_past_ttl_is_evicted_on_sweep() {
    let root = tempfile::tempdir().unwrap();
    let allocator = Arc::new(
        SpaceAllocator::new(
            root.path().to_path_buf(),
            100,
            Arc::new(FixedFsInfoProvider {
                info: FsInfo {
                    total_size: 100_000_000,
                    available_size: 100_000_000,
                },
            }),
        )
        .await
        .unwrap(),
    );
    let storage = Arc::new(MemStorage::default());
    let oci = Arc::new(MemOci::default());
    let downloader = Arc::new(MemDownloader { blobs: Mutex::new(HashMap::new()) });
    let installer = Arc::new(BlobInstaller::new(
        BlobStorePaths::new(root.path()),
        allocator.clone(),
        downloader.clone(),
        Arc::new(MemBlobInfo),
    ));
    let unpacker = LayerUnpacker::new(Arc::new(IdentityHandler));
    // TTL of zero: anything cached is immediately eligible for eviction.
    let manager = ImageManager::new_shared(
        storage.clone(),
        oci.clone(),
        installer,
        unpacker,
        allocator.clone(),
        ChronoDuration::zero(),
    );
    let h = Harness {
        manager,
        storage,
        oci,
        downloader,
        allocator,
        _root: root,
    };

    let v1 = register_component_item(&h, "comp-g", "1.0.0", b"payload-v1");
    let v2 = register_component_item(&h, "comp-g", "2.0.0", b"payload-v2");
    h.manager.install(v1.clone()).await.unwrap();
    h.manager.install(v2).await.unwrap();
    assert!(h.storage.get_update_item(&v1.id, &v1.version).await.unwrap().is_some());

    h.manager.run_eviction_sweep().await.unwrap();
    assert!(h.storage.get_update_item(&v1.id, &v1.version).await.unwrap().is_none());
}

#[tokio::test]
async fn install_service_item_unpacks_layers_and_validates_diff_id() {
    let h = harness().await;
    let layer_content = b"service-layer-bytes".to_vec();
    let layer_digest = digest_of(&layer_content);
    h.downloader
        .blobs
        .lock()
        .unwrap()
        .insert(layer_digest.to_string(), layer_content.clone());

    let config_digest = digest_of(b"config-bytes");
    h.downloader.blobs.lock().unwrap().insert(config_digest.to_string(), b"config-bytes".to_vec());
    h.oci.configs.lock().unwrap().insert(
        config_digest.to_string(),
        ImageConfig {
            rootfs_diff_ids: vec![digest_of(&layer_content)],
            exposed_ports: vec![],
        },
    );

    let manifest = ImageManifest {
        config: ContentDescriptor {
            digest: config_digest,
            size: "config-bytes".len() as u64,
            media_type: "application/vnd.oci.image.config.v1+json".to_string(),
        },
        layers: vec![ContentDescriptor {
            digest: layer_digest.clone(),
            size: layer_content.len() as u64,
            media_type: "application/vnd.oci.image.layer.v1.tar".to_string(),
        }],
        service_config: Some(ContentDescriptor {
            digest: digest_of(b"service-config-bytes"),
            size: "service-config-bytes".len() as u64,
            media_type: "application/vnd.aos.service.config.v1+json".to_string(),
        }),
    };
    let manifest_digest = digest_of(b"service-manifest");
    h.downloader
        .blobs
        .lock()
        .unwrap()
        .insert(manifest_digest.to_string(), b"service-manifest-bytes".to_vec());
    h.oci.manifests.lock().unwrap().insert(manifest_digest.to_string(), manifest);

    let item = UpdateItemInfo {
        id: ItemId::new("svc-a").unwrap(),
        item_type: ItemType::Service,
        version: semver::Version::parse("1.0.0").unwrap(),
        manifest_digest,
    };
    h.manager.install(item.clone()).await.unwrap();
    let row = h.storage.get_update_item(&item.id, &item.version).await.unwrap().unwrap();
    assert_eq!(row.state, ItemState::Installed);
}

#[tokio::test]
async fn removing_an_installed_component_frees_its_reserved_space() {
    let h = harness().await;
    let before = h.allocator.available_size().await;

    let item = register_component_item(&h, "comp-h", "1.0.0", b"payload-for-space-test");
    h.manager.install(item.clone()).await.unwrap();
    let after_install = h.allocator.available_size().await;
    assert!(after_install < before, "installing should reserve space");

    // First uninstall demotes installed -> cached (space stays reserved);
    // second uninstall drops the now-redundant cached row and its blobs.
    h.manager.uninstall(&item.id).await.unwrap();
    h.manager.uninstall(&item.id).await.unwrap();

    let after_removal = h.allocator.available_size().await;
    assert_eq!(after_removal, before, "removing the item should return all reserved space");
}

#[tokio::test]
async fn installing_a_service_item_frees_packed_layer_blob_after_unpack() {
    let h = harness().await;
    let before = h.allocator.available_size().await;

    let layer_content = b"service-layer-bytes-for-space-test".to_vec();
    let layer_digest = digest_of(&layer_content);
    h.downloader
        .blobs
        .lock()
        .unwrap()
        .insert(layer_digest.to_string(), layer_content.clone());

    let config_bytes = b"config-bytes-for-space-test".to_vec();
    let config_digest = digest_of(&config_bytes);
    h.downloader.blobs.lock().unwrap().insert(config_digest.to_string(), config_bytes.clone());
    h.oci.configs.lock().unwrap().insert(
        config_digest.to_string(),
        ImageConfig {
            rootfs_diff_ids: vec![digest_of(&layer_content)],
            exposed_ports: vec![],
        },
    );

    let manifest = ImageManifest {
        config: ContentDescriptor {
            digest: config_digest,
            size: config_bytes.len() as u64,
            media_type: "application/vnd.oci.image.config.v1+json".to_string(),
        },
        layers: vec![ContentDescriptor {
            digest: layer_digest.clone(),
            size: layer_content.len() as u64,
            media_type: "application/vnd.oci.image.layer.v1.tar".to_string(),
        }],
        service_config: Some(ContentDescriptor {
            digest: digest_of(b"service-config-bytes-for-space-test"),
            size: "service-config-bytes-for-space-test".len() as u64,
            media_type: "application/vnd.aos.service.config.v1+json".to_string(),
        }),
    };
    let manifest_digest = digest_of(b"service-manifest-for-space-test");
    h.downloader
        .blobs
        .lock()
        .unwrap()
        .insert(manifest_digest.to_string(), b"service-manifest-bytes".to_vec());
    h.oci.manifests.lock().unwrap().insert(manifest_digest.to_string(), manifest);

    let item = UpdateItemInfo {
        id: ItemId::new("svc-space").unwrap(),
        item_type: ItemType::Service,
        version: semver::Version::parse("1.0.0").unwrap(),
        manifest_digest,
    };
    h.manager.install(item.clone()).await.unwrap();

    // Only the config blob's size should remain reserved: the packed layer
    // blob is dropped once its rootfs is unpacked and validated.
    let after_install = h.allocator.available_size().await;
    assert_eq!(
        before - after_install,
        config_bytes.len() as u64,
        "only the config blob should still be reserved after unpack"
    );

    h.manager.uninstall(&item.id).await.unwrap();
    h.manager.uninstall(&item.id).await.unwrap();
    let after_removal = h.allocator.available_size().await;
    assert_eq!(after_removal, before, "removing the item should return all reserved space");
}
