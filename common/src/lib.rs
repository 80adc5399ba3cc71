/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! Shared identifiers, data model, external-collaborator interfaces, and
//! ambient plumbing for the communication manager's service-launcher core.

pub mod blobstore;
pub mod error;
pub mod ids;
pub mod interfaces;
pub mod logging;
pub mod model;
pub mod monitoring;
pub mod node_info;
pub mod oci;

pub use error::{CmError, Result};
