/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! Language-neutral error kinds shared by every core component.

use thiserror::Error;

/// The result type used across the workspace.
pub type Result<T> = std::result::Result<T, CmError>;

#[derive(Debug, Error)]
pub enum CmError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExist(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid checksum: {0}")]
    InvalidChecksum(String),

    #[error("no memory: {0}")]
    NoMemory(String),

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("wrong state: {0}")]
    WrongState(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

impl CmError {
    pub fn failed(msg: impl Into<String>) -> Self {
        CmError::Failed(msg.into())
    }

    /// True if this error represents user/operator-visible cancellation
    /// rather than an unexpected failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CmError::Cancelled(_))
    }
}
