/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! Monitoring snapshots pushed from the monitoring provider into the node
//! manager and fanned out to instances.

use crate::ids::InstanceIdent;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PerInstanceMonitoringData {
    pub ident: InstanceIdent,
    pub cpu_dmips: u64,
    pub ram_bytes: u64,
}

/// Average over a fixed window; `average_window` makes that window explicit
/// rather than implying a fixed sampling interval.
#[derive(Debug, Clone)]
pub struct NodeMonitoringData {
    pub total_cpu_dmips: u64,
    pub total_ram_bytes: u64,
    pub per_instance: Vec<PerInstanceMonitoringData>,
    pub average_window: Duration,
}
