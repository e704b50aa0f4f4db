// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloud controller backed by the director's callback endpoint.
//!
//! The director owns the cloud credentials; the manager asks it for VMs and
//! volumes with JSON-RPC POSTs to `<director url>/callback`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{IaasController, IaasError, Result};
use crate::agent::AgentClient;
use crate::jsonrpc::{JsonRpcClient, RpcClientError};
use crate::node::ServiceNode;

#[derive(Debug, Deserialize)]
struct DirectorNode {
    id: String,
    #[serde(default)]
    ip: String,
    #[serde(default)]
    private_ip: String,
    vmid: String,
    cloud_name: String,
}

impl From<DirectorNode> for ServiceNode {
    fn from(node: DirectorNode) -> Self {
        ServiceNode {
            id: node.id,
            ip: node.ip,
            private_ip: node.private_ip,
            vmid: node.vmid,
            cloud_name: node.cloud_name,
            role: String::new(),
            volumes: Vec::new(),
        }
    }
}

/// Cloud controller forwarding to the director.
#[derive(Debug, Clone)]
pub struct DirectorIaas {
    rpc: JsonRpcClient,
    url: String,
    clouds: Vec<String>,
    check_attempts: u32,
    check_interval: Duration,
}

impl DirectorIaas {
    /// Create a controller for the director at `director_url`.
    pub fn new(
        director_url: &str,
        clouds: Vec<String>,
        timeout: Duration,
    ) -> std::result::Result<Self, RpcClientError> {
        Ok(Self {
            rpc: JsonRpcClient::new(timeout)?,
            url: format!("{}/callback", director_url.trim_end_matches('/')),
            clouds,
            check_attempts: 60,
            check_interval: Duration::from_secs(10),
        })
    }

    /// Override how long to wait for new nodes to answer.
    pub fn with_liveness_check(mut self, attempts: u32, interval: Duration) -> Self {
        self.check_attempts = attempts.max(1);
        self.check_interval = interval;
        self
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.rpc
            .post(&self.url, method, &params)
            .await
            .map_err(|e| match e {
                RpcClientError::Remote(m) => IaasError::Rejected(m),
                RpcClientError::InvalidResponse(m) => IaasError::InvalidResponse(m),
                other => IaasError::Unavailable(other.to_string()),
            })
    }

    async fn wait_until_alive(&self, node: &ServiceNode, agent: &dyn AgentClient) -> Result<()> {
        let mut last_error = String::new();
        for attempt in 1..=self.check_attempts {
            match agent.check_agent_process(node).await {
                Ok(()) => {
                    debug!(node_id = %node.id, attempt, "Agent is alive");
                    return Ok(());
                }
                Err(e) => {
                    debug!(node_id = %node.id, attempt, error = %e, "Agent not answering yet");
                    last_error = e.to_string();
                }
            }
            if attempt < self.check_attempts {
                tokio::time::sleep(self.check_interval).await;
            }
        }
        Err(IaasError::NodeNotReady {
            node: node.id.clone(),
            reason: last_error,
        })
    }
}

#[async_trait]
impl IaasController for DirectorIaas {
    fn controller_type(&self) -> &'static str {
        "director"
    }

    fn clouds(&self) -> Vec<String> {
        self.clouds.clone()
    }

    async fn create_nodes(
        &self,
        count: usize,
        cloud: &str,
        agent: &dyn AgentClient,
    ) -> Result<Vec<ServiceNode>> {
        info!(count, cloud, "Requesting nodes from director");
        let result = self
            .call("create_nodes", json!({ "count": count, "cloud": cloud }))
            .await?;
        let raw = result.get("nodes").cloned().unwrap_or(result);
        let nodes: Vec<DirectorNode> =
            serde_json::from_value(raw).map_err(|e| IaasError::InvalidResponse(e.to_string()))?;
        let nodes: Vec<ServiceNode> = nodes.into_iter().map(ServiceNode::from).collect();

        if nodes.len() != count {
            warn!(asked = count, got = nodes.len(), "Director returned wrong number of nodes");
            if let Err(e) = self.delete_nodes(&nodes).await {
                warn!(error = %e, "Failed to release nodes");
            }
            return Err(IaasError::InvalidResponse(format!(
                "asked for {} nodes, got {}",
                count,
                nodes.len()
            )));
        }

        for node in &nodes {
            if let Err(e) = self.wait_until_alive(node, agent).await {
                warn!(node_id = %node.id, error = %e, "Node failed to come up, releasing batch");
                if let Err(del) = self.delete_nodes(&nodes).await {
                    warn!(error = %del, "Failed to release nodes");
                }
                return Err(e);
            }
        }
        Ok(nodes)
    }

    async fn delete_nodes(&self, nodes: &[ServiceNode]) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        let nodes: Vec<Value> = nodes
            .iter()
            .map(|n| json!({ "id": n.id, "vmid": n.vmid, "cloud": n.cloud_name }))
            .collect();
        self.call("delete_nodes", json!({ "nodes": nodes })).await?;
        Ok(())
    }

    async fn create_volume(&self, size: u64, name: &str, vmid: &str, cloud: &str) -> Result<String> {
        let result = self
            .call(
                "create_volume",
                json!({ "size": size, "name": name, "vm_id": vmid, "cloud": cloud }),
            )
            .await?;
        result
            .get("volume_id")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| IaasError::InvalidResponse("missing volume_id".into()))
    }

    async fn attach_volume(
        &self,
        vmid: &str,
        volume_id: &str,
        dev_name: &str,
        cloud: &str,
    ) -> Result<()> {
        self.call(
            "attach_volume",
            json!({
                "vm_id": vmid,
                "volume_id": volume_id,
                "device_name": dev_name,
                "cloud": cloud,
            }),
        )
        .await?;
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &str, cloud: &str) -> Result<()> {
        self.call(
            "detach_volume",
            json!({ "volume_id": volume_id, "cloud": cloud }),
        )
        .await?;
        Ok(())
    }

    async fn destroy_volume(&self, volume_id: &str, cloud: &str) -> Result<()> {
        self.call(
            "destroy_volume",
            json!({ "volume_id": volume_id, "cloud": cloud }),
        )
        .await?;
        Ok(())
    }
}
