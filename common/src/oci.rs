/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! Minimal OCI index/manifest/config/service-config types and the pure
//! codec collaborator trait. Parsing itself is out
//! of scope; only the shapes the balancer and image manager read
//! from are modeled.

use crate::error::Result;
use crate::ids::{Digest, ResourceName, RuntimeId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentDescriptor {
    pub digest: Digest,
    pub size: u64,
    pub media_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
    pub os_version: Option<String>,
    pub os_features: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestDescriptor {
    pub digest: Digest,
    pub platform: Platform,
}

/// The top-level `index.json` equivalent: one entry per runtime/platform
/// variant the balancer may pick among.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageIndex {
    pub manifests: Vec<ManifestDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    pub config: ContentDescriptor,
    pub layers: Vec<ContentDescriptor>,
    /// Present for service items; absent for components, which have no
    /// runtime/resource policy to declare.
    pub service_config: Option<ContentDescriptor>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    /// `rootfs.diff_ids[i]` paired positionally with `manifest.layers[i]`.
    pub rootfs_diff_ids: Vec<Digest>,
    pub exposed_ports: Vec<u16>,
}

/// Per-service balancing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalancingPolicy {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestedResources {
    pub cpu: Option<u64>,
    pub ram: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Quotas {
    pub cpu_dmips_limit: Option<u64>,
    pub ram_limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub resources: Vec<ResourceName>,
    pub runtimes: Vec<RuntimeId>,
    pub requested_resources: RequestedResources,
    pub quotas: Quotas,
    pub balancing_policy: BalancingPolicy,
    pub hostname: Option<String>,
    pub exposed_ports: Vec<u16>,
    pub allowed_connections: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            resources: Vec::new(),
            runtimes: Vec::new(),
            requested_resources: RequestedResources::default(),
            quotas: Quotas::default(),
            balancing_policy: BalancingPolicy::Enabled,
            hostname: None,
            exposed_ports: Vec::new(),
            allowed_connections: Vec::new(),
        }
    }
}

/// Pure codec collaborator: loads already-downloaded
/// blobs into the structures above. Deterministic, no I/O error recovery
/// logic beyond propagating `NotFound`/`InvalidChecksum`.
#[async_trait::async_trait]
pub trait OciSpecItf: Send + Sync {
    async fn load_image_index(&self, digest: &Digest) -> Result<ImageIndex>;
    async fn load_image_manifest(&self, digest: &Digest) -> Result<ImageManifest>;
    async fn load_image_config(&self, digest: &Digest) -> Result<ImageConfig>;
    async fn load_service_config(&self, digest: &Digest) -> Result<ServiceConfig>;
}
