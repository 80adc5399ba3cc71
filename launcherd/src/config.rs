/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! Daemon configuration: the tunables every core component needs, loaded
//! from one YAML file via the `config` crate, mirroring
//! `nodeagent::config::Config::load`'s file-to-struct pipeline.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Load { path: PathBuf, #[source] source: config::ConfigError },

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_uid_range() -> [u32; 2] {
    [50000, 60000]
}

fn default_gid_range() -> [u32; 2] {
    [50000, 60000]
}

fn default_service_ttl_secs() -> i64 {
    3600
}

fn default_remove_outdated_period_secs() -> u64 {
    300
}

fn default_update_item_ttl_secs() -> i64 {
    86400
}

fn default_nodes_connection_timeout_secs() -> u64 {
    30
}

fn default_cache_eviction_period_secs() -> u64 {
    60
}

fn default_num_install_threads() -> usize {
    2
}

fn default_limit_pct() -> u32 {
    90
}

fn default_image_store_root() -> PathBuf {
    PathBuf::from("/var/lib/cm/images")
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("/var/lib/cm/storage")
}

fn default_state_root() -> PathBuf {
    PathBuf::from("/var/lib/cm/state")
}

fn default_daemon_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/cm/daemon")
}

/// `[uid_range[0], uid_range[1])`, same shape for `gid_range`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_uid_range")]
    pub uid_range: [u32; 2],
    #[serde(default = "default_gid_range")]
    pub gid_range: [u32; 2],

    #[serde(default = "default_service_ttl_secs")]
    pub service_ttl_secs: i64,
    #[serde(default = "default_update_item_ttl_secs")]
    pub update_item_ttl_secs: i64,
    #[serde(default = "default_remove_outdated_period_secs")]
    pub remove_outdated_period_secs: u64,
    #[serde(default = "default_nodes_connection_timeout_secs")]
    pub nodes_connection_timeout_secs: u64,
    #[serde(default = "default_cache_eviction_period_secs")]
    pub cache_eviction_period_secs: u64,
    #[serde(default = "default_num_install_threads")]
    pub num_install_threads: usize,

    /// Percentage of each partition's total size each allocator may use.
    #[serde(default = "default_limit_pct")]
    pub limit_pct: u32,

    #[serde(default = "default_image_store_root")]
    pub image_store_root: PathBuf,
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    #[serde(default = "default_state_root")]
    pub state_root: PathBuf,
    /// Where this daemon's own local-adapter bookkeeping (instance/item
    /// catalog JSON, static node/subject declarations) lives.
    #[serde(default = "default_daemon_state_dir")]
    pub daemon_state_dir: PathBuf,

    /// Subjects enabled from the moment the daemon starts, absent any
    /// dynamic feed. Operators append to this list to enable more.
    #[serde(default)]
    pub enabled_subjects: Vec<String>,
    /// Statically declared nodes, since no cluster discovery protocol is
    /// wired into this daemon.
    #[serde(default)]
    pub nodes: Vec<StaticNodeConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StaticNodeConfig {
    pub node_id: String,
    #[serde(default = "default_node_type")]
    pub node_type: String,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub max_dmips: u64,
    pub total_ram: u64,
    #[serde(default)]
    pub priority: i32,
}

fn default_node_type() -> String {
    "generic".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            uid_range: default_uid_range(),
            gid_range: default_gid_range(),
            service_ttl_secs: default_service_ttl_secs(),
            update_item_ttl_secs: default_update_item_ttl_secs(),
            remove_outdated_period_secs: default_remove_outdated_period_secs(),
            nodes_connection_timeout_secs: default_nodes_connection_timeout_secs(),
            cache_eviction_period_secs: default_cache_eviction_period_secs(),
            num_install_threads: default_num_install_threads(),
            limit_pct: default_limit_pct(),
            image_store_root: default_image_store_root(),
            storage_root: default_storage_root(),
            state_root: default_state_root(),
            daemon_state_dir: default_daemon_state_dir(),
            enabled_subjects: Vec::new(),
            nodes: Vec::new(),
        }
    }
}

impl Config {
    /// Loads and merges `path` over the built-in defaults. A missing file
    /// is not an error for any individual field: `config::File::required(false)`
    /// lets every `#[serde(default = ...)]` take over.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .build()
            .map_err(|source| ConfigError::Load { path: path.to_path_buf(), source })?;
        Ok(settings.try_deserialize()?)
    }
}
