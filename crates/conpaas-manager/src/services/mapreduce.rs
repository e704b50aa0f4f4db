// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! MapReduce: one master and any number of workers.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{ServiceKind, founder_guard, ids_with_role};
use crate::agent::mapreduce as agent;
use crate::args::Params;
use crate::error::{ManagerError, Result};
use crate::instance::ServiceInstance;
use crate::jsonrpc::FilePart;
use crate::node::{NodeRequest, RoleCounts, ServiceNode, Volume, take_last_of_role};
use crate::service::{ManagerContext, MethodDecl, ServiceManager};

const MASTER: &str = "master";
const WORKER: &str = "worker";

/// MapReduce service manager.
#[derive(Debug, Default)]
pub struct MapReduceManager;

impl MapReduceManager {
    /// Create the manager.
    pub fn new() -> Self {
        Self
    }

    async fn start_agents(
        &self,
        ctx: &ManagerContext,
        master: &ServiceNode,
        nodes: &[ServiceNode],
    ) -> Result<()> {
        for node in nodes {
            agent::startup(ctx.agent.as_ref(), node, &master.ip, &master.private_ip).await?;
        }
        Ok(())
    }
}

fn master_of(nodes: &[ServiceNode]) -> Result<&ServiceNode> {
    nodes
        .iter()
        .find(|n| n.role == MASTER)
        .ok_or_else(|| ManagerError::Unknown("service has no master node".to_string()))
}

#[async_trait]
impl ServiceManager for MapReduceManager {
    fn kind(&self) -> ServiceKind {
        ServiceKind::MapReduce
    }

    fn roles(&self) -> &'static [&'static str] {
        &[MASTER, WORKER]
    }

    fn starting_nodes(&self, _ctx: &ManagerContext) -> Vec<NodeRequest> {
        vec![NodeRequest::new(MASTER)]
    }

    fn add_nodes_plan(
        &self,
        _ctx: &ManagerContext,
        counts: &RoleCounts,
        _existing: &[ServiceNode],
    ) -> Result<Vec<NodeRequest>> {
        if counts.get(MASTER) > 0 {
            return Err(ManagerError::invalid("nodes: a MapReduce service has exactly one master"));
        }
        Ok(counts.expand().into_iter().map(NodeRequest::new).collect())
    }

    fn select_removals(&self, counts: &RoleCounts, nodes: &[ServiceNode]) -> Result<Vec<ServiceNode>> {
        founder_guard(MASTER, counts.get(MASTER))?;
        let count = counts.get(WORKER);
        take_last_of_role(nodes, WORKER, count, false)
            .map(|picked| picked.into_iter().cloned().collect())
            .ok_or_else(|| ManagerError::WrongNrNodes {
                count,
                max: nodes.iter().filter(|n| n.role == WORKER).count() as u32,
                role: WORKER.to_string(),
            })
    }

    async fn on_start(&self, ctx: &ManagerContext, nodes: &[ServiceNode]) -> Result<()> {
        let master = master_of(nodes)?;
        self.start_agents(ctx, master, nodes).await
    }

    async fn on_stop(&self, _ctx: &ManagerContext, _nodes: &[ServiceNode]) -> Result<()> {
        Ok(())
    }

    async fn on_add_nodes(
        &self,
        ctx: &ManagerContext,
        new: &[ServiceNode],
        existing: &[ServiceNode],
    ) -> Result<()> {
        let master = master_of(existing)?;
        self.start_agents(ctx, master, new).await
    }

    async fn on_remove_nodes(
        &self,
        ctx: &ManagerContext,
        removed: &[ServiceNode],
        _remaining: &[ServiceNode],
    ) -> Result<()> {
        for node in removed {
            ctx.agent.stop(node).await?;
        }
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
        json!({
            "masters": ids_with_role(nodes, MASTER),
            "workers": ids_with_role(nodes, WORKER),
        })
    }

    fn node_info(&self, node: &ServiceNode) -> Value {
        json!({
            "id": node.id,
            "ip": node.ip,
            "vmid": node.vmid,
            "cloud": node.cloud_name,
            "role": node.role,
        })
    }

    fn methods(&self) -> Vec<MethodDecl> {
        Vec::new()
    }

    async fn call(
        &self,
        _instance: &Arc<ServiceInstance>,
        method: &str,
        _params: Params,
        _files: Vec<FilePart>,
    ) -> Result<Value> {
        Err(ManagerError::invalid(format!("unknown method '{}'", method)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgent;
    use crate::iaas::MockIaas;
    use crate::service::testing::context;

    fn node(id: &str, role: &str) -> ServiceNode {
        ServiceNode {
            id: id.into(),
            ip: format!("10.1.0.{}", id.len()),
            private_ip: format!("192.168.1.{}", id.len()),
            vmid: format!("vm-{id}"),
            cloud_name: "default".into(),
            role: role.into(),
            volumes: vec![],
        }
    }

    #[test]
    fn test_master_is_never_removed() {
        let manager = MapReduceManager::new();
        let nodes = vec![node("m", MASTER), node("w1", WORKER), node("w2", WORKER)];

        let err = manager
            .select_removals(&RoleCounts::new([(MASTER, 1)]), &nodes)
            .unwrap_err();
        assert!(matches!(err, ManagerError::WrongNrNodes { max: 0, .. }));

        let picked = manager
            .select_removals(&RoleCounts::new([(WORKER, 2)]), &nodes)
            .unwrap();
        let ids: Vec<_> = picked.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["w2", "w1"]);
    }

    #[test]
    fn test_list_nodes_splits_master_and_workers() {
        let manager = MapReduceManager::new();
        let listed = manager.list_nodes(&[node("m", MASTER), node("w1", WORKER)]);
        assert_eq!(listed, json!({"masters": ["m"], "workers": ["w1"]}));
    }

    #[test]
    fn test_second_master_is_rejected() {
        let ctx = context(&MockIaas::new(), &MockAgent::new());
        let err = MapReduceManager::new()
            .add_nodes_plan(&ctx, &RoleCounts::new([(MASTER, 1)]), &[])
            .unwrap_err();
        assert_eq!(err.error_code(), "E_ARGS_INVALID");
    }
}
