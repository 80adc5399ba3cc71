/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! The on-disk content store and versioned item catalog: blob installation
//! with download deduplication, layer unpacking for service items, and
//! outdated-item eviction wired into the shared space allocator.

pub mod blob;
pub mod layer;
pub mod manager;

pub use blob::BlobInstaller;
pub use layer::LayerUnpacker;
pub use manager::ImageManager;
