// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HelloWorld: one role, every node runs the same agent.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{ServiceKind, ids_with_role};
use crate::agent::helloworld as agent;
use crate::args::{Params, Schema};
use crate::error::{ManagerError, Result};
use crate::instance::ServiceInstance;
use crate::jsonrpc::FilePart;
use crate::node::{NodeRequest, RoleCounts, ServiceNode, Volume, take_last_of_role};
use crate::service::{ManagerContext, MethodDecl, ServiceManager};
use crate::state::ManagerState;

const ROLE: &str = "helloworld";

/// HelloWorld service manager.
#[derive(Debug, Default)]
pub struct HelloWorldManager;

impl HelloWorldManager {
    /// Create the manager.
    pub fn new() -> Self {
        Self
    }

    async fn start_agents(&self, ctx: &ManagerContext, nodes: &[ServiceNode]) -> Result<()> {
        for node in nodes {
            agent::startup(ctx.agent.as_ref(), node).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceManager for HelloWorldManager {
    fn kind(&self) -> ServiceKind {
        ServiceKind::HelloWorld
    }

    fn roles(&self) -> &'static [&'static str] {
        &[ROLE]
    }

    fn starting_nodes(&self, _ctx: &ManagerContext) -> Vec<NodeRequest> {
        vec![NodeRequest::new(ROLE)]
    }

    fn add_nodes_plan(
        &self,
        _ctx: &ManagerContext,
        counts: &RoleCounts,
        _existing: &[ServiceNode],
    ) -> Result<Vec<NodeRequest>> {
        Ok(counts.expand().into_iter().map(NodeRequest::new).collect())
    }

    fn select_removals(&self, counts: &RoleCounts, nodes: &[ServiceNode]) -> Result<Vec<ServiceNode>> {
        let count = counts.get(ROLE);
        take_last_of_role(nodes, ROLE, count, false)
            .map(|picked| picked.into_iter().cloned().collect())
            .ok_or_else(|| ManagerError::WrongNrNodes {
                count,
                max: nodes.len() as u32,
                role: ROLE.to_string(),
            })
    }

    async fn on_start(&self, ctx: &ManagerContext, nodes: &[ServiceNode]) -> Result<()> {
        self.start_agents(ctx, nodes).await
    }

    async fn on_stop(&self, _ctx: &ManagerContext, _nodes: &[ServiceNode]) -> Result<()> {
        Ok(())
    }

    async fn on_add_nodes(
        &self,
        ctx: &ManagerContext,
        new: &[ServiceNode],
        _existing: &[ServiceNode],
    ) -> Result<()> {
        self.start_agents(ctx, new).await
    }

    async fn on_remove_nodes(
        &self,
        _ctx: &ManagerContext,
        _removed: &[ServiceNode],
        _remaining: &[ServiceNode],
    ) -> Result<()> {
        Ok(())
    }

    async fn on_create_volume(
        &self,
        _ctx: &ManagerContext,
        _node: &ServiceNode,
        _volume: &Volume,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_delete_volume(
        &self,
        _ctx: &ManagerContext,
        _node: &ServiceNode,
        _volume: &Volume,
    ) -> Result<()> {
        Ok(())
    }

    fn service_info(&self, _ctx: &ManagerContext) -> Map<String, Value> {
        Map::new()
    }

    fn list_nodes(&self, nodes: &[ServiceNode]) -> Value {
        json!({ ROLE: ids_with_role(nodes, ROLE) })
    }

    fn node_info(&self, node: &ServiceNode) -> Value {
        json!({ "id": node.id, "ip": node.ip })
    }

    fn methods(&self) -> Vec<MethodDecl> {
        vec![MethodDecl::get("get_helloworld")]
    }

    async fn call(
        &self,
        instance: &Arc<ServiceInstance>,
        method: &str,
        params: Params,
        _files: Vec<FilePart>,
    ) -> Result<Value> {
        match method {
            "get_helloworld" => {
                Schema::new().parse(&params)?;
                instance
                    .state()
                    .ensure("get_helloworld", &[ManagerState::Running])?;
                let ctx = instance.context();
                let mut lines = Vec::new();
                for node in instance.nodes() {
                    let greeting = agent::get_helloworld(ctx.agent.as_ref(), &node).await?;
                    lines.push(format!("Received {} from {}", greeting, node.id));
                }
                Ok(json!({ "helloworld": lines.join("\n") }))
            }
            other => Err(ManagerError::invalid(format!("unknown method '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgent;
    use crate::iaas::MockIaas;
    use crate::service::testing::context;

    fn instance(agent: &MockAgent) -> Arc<ServiceInstance> {
        let ctx = context(&MockIaas::new(), agent);
        ServiceInstance::new(3, "hello", Box::new(HelloWorldManager::new()), ctx)
    }

    #[tokio::test]
    async fn test_get_helloworld_greets_from_every_node() {
        let agent = MockAgent::new();
        let inst = instance(&agent);
        inst.startup("default").await.unwrap();
        inst.wait_idle().await;
        inst.add_nodes(RoleCounts::new([(ROLE, 1)]), "default")
            .await
            .unwrap();
        inst.wait_idle().await;

        let result = inst
            .call("get_helloworld", Params::new(), vec![])
            .await
            .unwrap();
        let text = result["helloworld"].as_str().unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.starts_with("Received Hello World from "));
        assert_eq!(agent.calls_to("startup").await.len(), 2);
    }

    #[tokio::test]
    async fn test_get_helloworld_requires_running() {
        let inst = instance(&MockAgent::new());
        let err = inst
            .call("get_helloworld", Params::new(), vec![])
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "E_STATE_ERROR");
    }

    #[test]
    fn test_any_number_can_be_removed() {
        let manager = HelloWorldManager::new();
        let nodes: Vec<ServiceNode> = (0..2)
            .map(|i| ServiceNode {
                id: format!("n{i}"),
                ip: format!("10.0.0.{i}"),
                private_ip: String::new(),
                vmid: format!("vm{i}"),
                cloud_name: "default".into(),
                role: ROLE.into(),
                volumes: vec![],
            })
            .collect();
        let picked = manager
            .select_removals(&RoleCounts::new([(ROLE, 2)]), &nodes)
            .unwrap();
        assert_eq!(picked.len(), 2);
        assert!(
            manager
                .select_removals(&RoleCounts::new([(ROLE, 3)]), &nodes)
                .is_err()
        );
    }
}
