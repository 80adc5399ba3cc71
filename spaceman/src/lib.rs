/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! Scoped on-disk space accounting: a process-wide registry of partitions
//! keyed by mount point, and per-allocator quotas stacked on top of it.

pub mod allocator;
pub mod fsinfo;
pub mod partition;

pub use allocator::{Space, SpaceAllocator};
pub use fsinfo::{FixedFsInfoProvider, FsInfo, FsInfoProviderItf, HostFsInfoProvider};
pub use partition::ItemRemoverItf;
