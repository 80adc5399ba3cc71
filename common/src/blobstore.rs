/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! On-disk blob/layer layout shared by the image manager (write side) and
//! the launcher's image-info provider (read side).

use crate::error::{CmError, Result};
use crate::ids::Digest;
use std::path::{Path, PathBuf};

/// Root of the content-addressed store rooted at `<imagePath>`.
#[derive(Debug, Clone)]
pub struct BlobStorePaths {
    root: PathBuf,
}

impl BlobStorePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<imagePath>/blobs/<alg>/<hex>`
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("blobs").join(digest.algorithm()).join(digest.hex())
    }

    /// `<imagePath>/layers/<alg>/<hex>/`
    fn layer_dir(&self, digest: &Digest) -> PathBuf {
        self.root.join("layers").join(digest.algorithm()).join(digest.hex())
    }

    /// `<imagePath>/layers/<alg>/<hex>/layer/`
    pub fn layer_rootfs_path(&self, digest: &Digest) -> PathBuf {
        self.layer_dir(digest).join("layer")
    }

    /// `<imagePath>/layers/<alg>/<hex>/digest`
    pub fn layer_digest_file(&self, digest: &Digest) -> PathBuf {
        self.layer_dir(digest).join("digest")
    }

    /// `<imagePath>/layers/<alg>/<hex>/size`
    pub fn layer_size_file(&self, digest: &Digest) -> PathBuf {
        self.layer_dir(digest).join("size")
    }

    /// Validates a blob on disk: `sha256(content) == hex`.
    pub fn validate_blob(&self, digest: &Digest) -> Result<bool> {
        let path = self.blob_path(digest);
        if !path.exists() {
            return Ok(false);
        }
        let content = std::fs::read(&path)?;
        Ok(digest.validate(&content))
    }

    /// Reads the stored diff digest for an unpacked layer.
    pub fn read_layer_diff_digest(&self, digest: &Digest) -> Result<Digest> {
        let raw = std::fs::read_to_string(self.layer_digest_file(digest))?;
        Digest::parse(raw.trim())
    }

    pub fn write_layer_diff_digest(&self, digest: &Digest, diff: &Digest) -> Result<()> {
        std::fs::write(self.layer_digest_file(digest), diff.to_string())?;
        Ok(())
    }

    pub fn read_layer_size(&self, digest: &Digest) -> Result<u64> {
        let raw = std::fs::read_to_string(self.layer_size_file(digest))?;
        raw.trim()
            .parse::<u64>()
            .map_err(|e| CmError::Failed(format!("malformed layer size file: {e}")))
    }

    pub fn write_layer_size(&self, digest: &Digest, size: u64) -> Result<()> {
        std::fs::write(self.layer_size_file(digest), size.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_content_addressed() {
        let paths = BlobStorePaths::new("/var/lib/cm/images");
        let d = Digest::sha256("a".repeat(64)).unwrap();
        assert_eq!(
            paths.blob_path(&d),
            PathBuf::from(format!("/var/lib/cm/images/blobs/sha256/{}", "a".repeat(64)))
        );
        assert_eq!(
            paths.layer_rootfs_path(&d),
            PathBuf::from(format!("/var/lib/cm/images/layers/sha256/{}/layer", "a".repeat(64)))
        );
    }

    #[test]
    fn layer_size_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let paths = BlobStorePaths::new(dir.path());
        let d = Digest::sha256("b".repeat(64)).unwrap();
        std::fs::create_dir_all(paths.layer_rootfs_path(&d)).unwrap();
        paths.write_layer_size(&d, 12345).unwrap();
        assert_eq!(paths.read_layer_size(&d).unwrap(), 12345);
        // No trailing newline, decimal ASCII
        let raw = std::fs::read_to_string(paths.layer_size_file(&d)).unwrap();
        assert_eq!(raw, "12345");
    }

    #[test]
    fn validate_blob_false_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let paths = BlobStorePaths::new(dir.path());
        let d = Digest::sha256("c".repeat(64)).unwrap();
        assert!(!paths.validate_blob(&d).unwrap());
    }
}
