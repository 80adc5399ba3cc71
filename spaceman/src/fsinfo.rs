/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! Host filesystem capacity lookup. The actual syscall is a low-level
//! filesystem primitive;
//! this trait is the seam, with a real `statvfs`-backed default for Unix.

use common::error::{CmError, Result};
use std::path::Path;

#[derive(Debug, Clone, Copy)]
pub struct FsInfo {
    pub total_size: u64,
    pub available_size: u64,
}

pub trait FsInfoProviderItf: Send + Sync {
    fn query(&self, mount_point: &Path) -> Result<FsInfo>;
}

/// Queries the real mount point via `statvfs(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostFsInfoProvider;

#[cfg(unix)]
impl FsInfoProviderItf for HostFsInfoProvider {
    fn query(&self, mount_point: &Path) -> Result<FsInfo> {
        use std::ffi::CString;
        use std::mem::MaybeUninit;

        let c_path = CString::new(mount_point.as_os_str().as_encoded_bytes())
            .map_err(|e| CmError::InvalidArgument(format!("mount point has NUL byte: {e}")))?;

        let mut stat = MaybeUninit::<libc::statvfs>::uninit();
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if rc != 0 {
            return Err(CmError::Failed(format!(
                "statvfs({}) failed: {}",
                mount_point.display(),
                std::io::Error::last_os_error()
            )));
        }
        let stat = unsafe { stat.assume_init() };
        let block_size = stat.f_frsize as u64;
        Ok(FsInfo {
            total_size: stat.f_blocks as u64 * block_size,
            available_size: stat.f_bavail as u64 * block_size,
        })
    }
}

#[cfg(not(unix))]
impl FsInfoProviderItf for HostFsInfoProvider {
    fn query(&self, _mount_point: &Path) -> Result<FsInfo> {
        Err(CmError::NotSupported("host filesystem query unsupported on this platform".into()))
    }
}

/// A fixed-capacity stand-in for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedFsInfoProvider {
    pub info: FsInfo,
}

impl FsInfoProviderItf for FixedFsInfoProvider {
    fn query(&self, _mount_point: &Path) -> Result<FsInfo> {
        Ok(self.info)
    }
}
