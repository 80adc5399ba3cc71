/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! `NoopNetwork`: a `NetworkManagerItf` for deployments where CNI/bridge/
//! iptables/DNS plumbing is handled entirely out of band (e.g. a host
//! network namespace, or an external SDN controller watching the same
//! instance status feed). The balancer still calls through this interface
//! on every placement and teardown, so the no-op implementation logs what
//! it would have done instead of silently dropping it.

use async_trait::async_trait;
use common::error::Result;
use common::ids::{InstanceIdent, NodeId};
use common::interfaces::{NetworkManagerItf, NetworkServiceData};
use tracing::debug;

#[derive(Debug, Default)]
pub struct NoopNetwork;

#[async_trait]
impl NetworkManagerItf for NoopNetwork {
    async fn prepare_instance_network_parameters(
        &self,
        ident: &InstanceIdent,
        provider_id: &str,
        node_id: &NodeId,
        data: NetworkServiceData,
    ) -> Result<()> {
        debug!(
            %ident,
            provider_id,
            %node_id,
            exposed_ports = ?data.exposed_ports,
            "network parameters prepared (noop)"
        );
        Ok(())
    }

    async fn remove_instance_network_parameters(&self, ident: &InstanceIdent, node_id: &NodeId) -> Result<()> {
        debug!(%ident, %node_id, "network parameters removed (noop)");
        Ok(())
    }

    async fn update_provider_network(&self, provider_ids: Vec<String>, node_id: &NodeId) -> Result<()> {
        debug!(?provider_ids, %node_id, "provider network updated (noop)");
        Ok(())
    }

    async fn restart_dns_server(&self) -> Result<()> {
        debug!("dns server restart requested (noop)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ids::{InstanceType, ItemId, SubjectId};

    #[tokio::test]
    async fn every_call_succeeds() {
        let network = NoopNetwork;
        let ident = InstanceIdent {
            item_id: ItemId::new("svc").unwrap(),
            subject_id: SubjectId::new("subj").unwrap(),
            instance_index: 0,
            instance_type: InstanceType::Service,
        };
        let node_id = NodeId::new("node").unwrap();
        network
            .prepare_instance_network_parameters(&ident, "provider", &node_id, NetworkServiceData::default())
            .await
            .unwrap();
        network.remove_instance_network_parameters(&ident, &node_id).await.unwrap();
        network.update_provider_network(vec!["provider".into()], &node_id).await.unwrap();
        network.restart_dns_server().await.unwrap();
    }
}
