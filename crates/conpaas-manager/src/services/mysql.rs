// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! MySQL Galera cluster with GLB load balancers.
//!
//! Every `mysql` node gets a `mysql-<node id>` data volume and joins the
//! Galera cluster through the addresses of the nodes started before it.
//! `glb` nodes balance over every `mysql` node and are told about each
//! membership change. At least one `mysql` node always stays.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::info;

use super::{ServiceKind, ids_with_role};
use crate::agent::mysql::{self as agent, MYSQL_PORT};
use crate::args::{Check, Params, Schema};
use crate::error::{ManagerError, Result};
use crate::instance::{NodeMove, ServiceInstance};
use crate::jsonrpc::FilePart;
use crate::node::{NodeRequest, RoleCounts, ServiceNode, Volume, VolumeRequest, take_last_of_role};
use crate::service::{ManagerContext, MethodDecl, ServiceManager};
use crate::state::{ManagerState, lock};

const MYSQL: &str = "mysql";
const GLB: &str = "glb";
const ROOT: &str = "root";

/// MySQL service manager.
#[derive(Debug)]
pub struct MySqlManager {
    volume_size: u64,
    root_password: Mutex<String>,
}

impl MySqlManager {
    /// Create the manager with a fresh random root password.
    pub fn new(ctx: &ManagerContext) -> Self {
        Self {
            volume_size: ctx.config.mysql_volume_size,
            root_password: Mutex::new(random_password()),
        }
    }

    fn mysql_request(&self) -> NodeRequest {
        NodeRequest::new(MYSQL).with_volume(VolumeRequest::new(MYSQL, self.volume_size))
    }

    /// Start `nodes` one after the other, each joining the ones before it.
    async fn start_mysql(
        &self,
        ctx: &ManagerContext,
        nodes: &[&ServiceNode],
        mut started: Vec<String>,
    ) -> Result<Vec<String>> {
        let password = lock(&self.root_password).clone();
        for node in nodes {
            let device = node.volumes.first().map(|v| v.dev_name.as_str()).ok_or_else(|| {
                ManagerError::Unknown(format!("mysql node {} has no data volume", node.id))
            })?;
            info!(node_id = %node.id, peers = ?started, "Starting mysqld");
            agent::start_mysqld(ctx.agent.as_ref(), node, &started, device, &password).await?;
            started.push(node.addr(MYSQL_PORT));
        }
        Ok(started)
    }
}

fn random_password() -> String {
    uuid::Uuid::new_v4().simple().to_string().chars().take(10).collect()
}

fn with_role<'a>(nodes: &'a [ServiceNode], role: &str) -> Vec<&'a ServiceNode> {
    nodes.iter().filter(|n| n.role == role).collect()
}

fn backends(nodes: &[&ServiceNode]) -> Vec<String> {
    nodes.iter().map(|n| n.addr(MYSQL_PORT)).collect()
}

fn first_mysql(instance: &ServiceInstance) -> Result<ServiceNode> {
    instance
        .nodes()
        .into_iter()
        .find(|n| n.role == MYSQL)
        .ok_or_else(|| ManagerError::Unknown("service has no mysql node".to_string()))
}

fn parse_move(item: &Value) -> Result<NodeMove> {
    let text = |key: &str| match item.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    let vmid = text("vmid");
    if vmid.is_empty() {
        return Err(ManagerError::invalid(format!(
            "Missing VM id in parameter \"nodes\": {}",
            item
        )));
    }
    Ok(NodeMove {
        from_cloud: text("from_cloud"),
        vmid,
        to_cloud: text("to_cloud"),
    })
}

#[async_trait]
impl ServiceManager for MySqlManager {
    fn kind(&self) -> ServiceKind {
        ServiceKind::MySql
    }

    fn roles(&self) -> &'static [&'static str] {
        &[MYSQL, GLB]
    }

    fn starting_nodes(&self, _ctx: &ManagerContext) -> Vec<NodeRequest> {
        vec![self.mysql_request()]
    }

    fn add_nodes_plan(
        &self,
        _ctx: &ManagerContext,
        counts: &RoleCounts,
        _existing: &[ServiceNode],
    ) -> Result<Vec<NodeRequest>> {
        Ok(counts
            .expand()
            .into_iter()
            .map(|role| match role.as_str() {
                MYSQL => self.mysql_request(),
                _ => NodeRequest::new(role),
            })
            .collect())
    }

    fn select_removals(&self, counts: &RoleCounts, nodes: &[ServiceNode]) -> Result<Vec<ServiceNode>> {
        let mysql_total = with_role(nodes, MYSQL).len() as u32;
        let glb_total = with_role(nodes, GLB).len() as u32;

        let mysql = counts.get(MYSQL);
        if mysql > 0 && mysql >= mysql_total {
            return Err(ManagerError::WrongNrNodes {
                count: mysql,
                max: mysql_total.saturating_sub(1),
                role: MYSQL.to_string(),
            });
        }
        let glb = counts.get(GLB);
        if glb > glb_total {
            return Err(ManagerError::WrongNrNodes {
                count: glb,
                max: glb_total,
                role: GLB.to_string(),
            });
        }

        let mut victims = Vec::new();
        for (role, count) in counts.iter() {
            let picked = take_last_of_role(nodes, role, count, false).ok_or_else(|| {
                ManagerError::invalid(format!("nodes: cannot remove {} {} node(s)", count, role))
            })?;
            victims.extend(picked.into_iter().cloned());
        }
        Ok(victims)
    }

    async fn on_start(&self, ctx: &ManagerContext, nodes: &[ServiceNode]) -> Result<()> {
        let started = self
            .start_mysql(ctx, &with_role(nodes, MYSQL), Vec::new())
            .await?;
        for glb in with_role(nodes, GLB) {
            agent::start_glbd(ctx.agent.as_ref(), glb, &started).await?;
        }
        Ok(())
    }

    async fn on_stop(&self, ctx: &ManagerContext, nodes: &[ServiceNode]) -> Result<()> {
        for node in nodes {
            ctx.agent.stop(node).await?;
        }
        Ok(())
    }

    async fn on_add_nodes(
        &self,
        ctx: &ManagerContext,
        new: &[ServiceNode],
        existing: &[ServiceNode],
    ) -> Result<()> {
        let existing_mysql = backends(&with_role(existing, MYSQL));
        let new_mysql = with_role(new, MYSQL);
        let all_mysql = self.start_mysql(ctx, &new_mysql, existing_mysql).await?;

        let added = backends(&new_mysql);
        if !added.is_empty() {
            for glb in with_role(existing, GLB) {
                agent::add_glbd_nodes(ctx.agent.as_ref(), glb, &added).await?;
            }
        }
        for glb in with_role(new, GLB) {
            agent::start_glbd(ctx.agent.as_ref(), glb, &all_mysql).await?;
        }
        Ok(())
    }

    async fn on_remove_nodes(
        &self,
        ctx: &ManagerContext,
        removed: &[ServiceNode],
        remaining: &[ServiceNode],
    ) -> Result<()> {
        let gone = backends(&with_role(removed, MYSQL));
        if !gone.is_empty() {
            for glb in with_role(remaining, GLB) {
                agent::remove_glbd_nodes(ctx.agent.as_ref(), glb, &gone).await?;
            }
        }
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
            "mysql": ids_with_role(nodes, MYSQL),
            "glb": ids_with_role(nodes, GLB),
        })
    }

    fn node_info(&self, node: &ServiceNode) -> Value {
        json!({
            "id": node.id,
            "ip": node.ip,
            "vmid": node.vmid,
            "cloud": node.cloud_name,
            "role": node.role,
            "isNode": node.role == MYSQL,
            "isGlb_node": node.role == GLB,
        })
    }

    fn methods(&self) -> Vec<MethodDecl> {
        vec![
            MethodDecl::post("set_password"),
            MethodDecl::upload("load_dump"),
            MethodDecl::get("sqldump"),
            MethodDecl::post("remove_specific_nodes"),
            MethodDecl::post("migrate_nodes"),
        ]
    }

    async fn call(
        &self,
        instance: &Arc<ServiceInstance>,
        method: &str,
        params: Params,
        files: Vec<FilePart>,
    ) -> Result<Value> {
        let ctx = instance.context();
        match method {
            "set_password" => {
                let args = Schema::new()
                    .required("user", Check::String)
                    .required("password", Check::String)
                    .parse(&params)?;
                instance.state().ensure(method, &[ManagerState::Running])?;
                let (user, password) = (args.str("user")?, args.str("password")?);
                let node = first_mysql(instance)?;
                agent::set_password(ctx.agent.as_ref(), &node, user, password).await?;
                if user == ROOT {
                    *lock(&self.root_password) = password.to_string();
                }
                Ok(json!({}))
            }
            "load_dump" => {
                Schema::new().parse(&params)?;
                let dump = files
                    .into_iter()
                    .find(|f| f.field == "mysqldump_file")
                    .ok_or_else(|| ManagerError::ArgsMissing("mysqldump_file".to_string()))?;
                instance.state().ensure(method, &[ManagerState::Running])?;
                let node = first_mysql(instance)?;
                agent::load_dump(ctx.agent.as_ref(), &node, dump).await?;
                Ok(json!({}))
            }
            "sqldump" => {
                Schema::new().parse(&params)?;
                instance.state().ensure(method, &[ManagerState::Running])?;
                let node = first_mysql(instance)?;
                Ok(Value::String(agent::sqldump(ctx.agent.as_ref(), &node).await?))
            }
            "remove_specific_nodes" => {
                let args = Schema::new().required("ip", Check::String).parse(&params)?;
                let ip = args.str("ip")?;
                let nodes = instance.nodes();
                let node = nodes
                    .iter()
                    .find(|n| n.ip == ip)
                    .ok_or_else(|| ManagerError::invalid(format!("ip: no node with address {}", ip)))?;
                if node.role == MYSQL && with_role(&nodes, MYSQL).len() < 2 {
                    return Err(ManagerError::WrongNrNodes {
                        count: 1,
                        max: 0,
                        role: MYSQL.to_string(),
                    });
                }
                let state = instance.remove_specific_nodes(vec![node.id.clone()])?;
                Ok(json!({ "state": state }))
            }
            "migrate_nodes" => {
                let args = Schema::new()
                    .required("nodes", Check::ListOfDicts)
                    .optional("delay", Check::NonNegInt, 0)
                    .parse(&params)?;
                let moves = args
                    .list("nodes")?
                    .iter()
                    .map(parse_move)
                    .collect::<Result<Vec<_>>>()?;
                let delay = Duration::from_secs(args.u64("delay")?);
                instance.migrate_nodes(moves, delay)?;
                Ok(json!({}))
            }
            other => Err(ManagerError::invalid(format!("unknown method '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgent;
    use crate::config::Config;
    use crate::iaas::MockIaas;
    use crate::service::testing::context;
    use crate::state::ManagerState::{Error as Failed, Running};

    async fn running(iaas: &MockIaas, agent: &MockAgent) -> Arc<ServiceInstance> {
        let ctx = context(iaas, agent);
        let inst = ServiceInstance::new(1, "db", ServiceKind::MySql.create(&ctx), ctx);
        inst.startup("default").await.unwrap();
        inst.wait_idle().await;
        assert_eq!(inst.state().current(), Running);
        inst
    }

    #[test]
    fn test_random_password() {
        let password = random_password();
        assert_eq!(password.len(), 10);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn test_startup_creates_data_volume() {
        let iaas = MockIaas::new();
        let agent = MockAgent::new();
        let inst = running(&iaas, &agent).await;

        let node = &inst.nodes()[0];
        assert_eq!(node.role, MYSQL);
        assert_eq!(node.volumes.len(), 1);
        assert_eq!(node.volumes[0].volume_name, format!("mysql-{}", node.id));

        let calls = agent.calls_to("start_mysqld").await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].params["nodes"], json!([]));
        assert_eq!(calls[0].params["device_name"], "/dev/sdb");
    }

    #[tokio::test]
    async fn test_last_mysql_node_cannot_be_removed() {
        let inst = running(&MockIaas::new(), &MockAgent::new()).await;
        let err = inst
            .remove_nodes(RoleCounts::new([(MYSQL, 1)]))
            .unwrap_err();
        assert!(matches!(err, ManagerError::WrongNrNodes { max: 0, .. }));
        assert_eq!(inst.state().current(), Running);
        assert_eq!(inst.nodes().len(), 1);
    }

    #[tokio::test]
    async fn test_glb_tracks_mysql_membership() {
        let iaas = MockIaas::new();
        let agent = MockAgent::new();
        let inst = running(&iaas, &agent).await;
        let first = inst.nodes()[0].clone();

        inst.add_nodes(RoleCounts::new([(GLB, 1)]), "default")
            .await
            .unwrap();
        inst.wait_idle().await;
        let glbd = agent.calls_to("start_glbd").await;
        assert_eq!(glbd[0].params["nodes"], json!([first.addr(MYSQL_PORT)]));

        inst.add_nodes(RoleCounts::new([(MYSQL, 1)]), "default")
            .await
            .unwrap();
        inst.wait_idle().await;
        let second = inst.nodes().last().cloned().unwrap();
        let joined = agent.calls_to("start_mysqld").await;
        assert_eq!(joined[1].params["nodes"], json!([first.addr(MYSQL_PORT)]));
        let added = agent.calls_to("add_glbd_nodes").await;
        assert_eq!(added[0].params["nodesIp"], json!([second.addr(MYSQL_PORT)]));

        inst.remove_nodes(RoleCounts::new([(MYSQL, 1)])).unwrap();
        inst.wait_idle().await;
        let removed = agent.calls_to("remove_glbd_nodes").await;
        assert_eq!(removed[0].params["nodesIp"], json!([second.addr(MYSQL_PORT)]));
        assert!(!inst.has_node(&second.id));
        assert!(iaas.volumes().await.iter().all(|v| v.name != format!("mysql-{}", second.id)));
    }

    #[tokio::test]
    async fn test_migrate_rolls_back_when_join_fails() {
        let iaas = MockIaas::with_clouds(["default", "ec2"]);
        let agent = MockAgent::new();
        let inst = running(&iaas, &agent).await;
        let original = inst.nodes()[0].clone();
        agent.fail_method("start_mysqld").await;

        let params = json!({
            "nodes": [{"from_cloud": "default", "vmid": original.vmid, "to_cloud": "ec2"}],
        });
        inst.call("migrate_nodes", params.as_object().cloned().unwrap(), vec![])
            .await
            .unwrap();
        inst.wait_idle().await;

        assert_eq!(inst.state().current(), Running);
        assert_eq!(inst.nodes(), vec![original]);
        assert_eq!(iaas.live_nodes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_migrate_replaces_node() {
        let iaas = MockIaas::with_clouds(["default", "ec2"]);
        let agent = MockAgent::new();
        let inst = running(&iaas, &agent).await;
        let original = inst.nodes()[0].clone();

        let params = json!({
            "nodes": [{"from_cloud": "default", "vmid": original.vmid, "to_cloud": "ec2"}],
            "delay": 0,
        });
        inst.call("migrate_nodes", params.as_object().cloned().unwrap(), vec![])
            .await
            .unwrap();
        inst.wait_idle().await;

        assert_ne!(inst.state().current(), Failed);
        let nodes = inst.nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].cloud_name, "ec2");
        assert_ne!(nodes[0].id, original.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_migration_waits_for_busy_service() {
        let iaas = MockIaas::with_clouds(["default", "ec2"]);
        let agent = MockAgent::new();
        let mut ctx = context(&iaas, &agent);
        ctx.config = Arc::new(Config::default().with_volume_retry(3, Duration::from_secs(10)));
        let inst = ServiceInstance::new(1, "db", ServiceKind::MySql.create(&ctx), ctx);
        inst.startup("default").await.unwrap();
        inst.wait_idle().await;
        let original = inst.nodes()[0].clone();

        let params = json!({
            "nodes": [{"from_cloud": "default", "vmid": original.vmid, "to_cloud": "ec2"}],
            "delay": 5,
        });
        inst.call("migrate_nodes", params.as_object().cloned().unwrap(), vec![])
            .await
            .unwrap();
        inst.wait_idle().await;
        assert_eq!(inst.state().current(), Running);
        assert_eq!(inst.nodes().len(), 2);
        let replacement = inst.nodes()[1].clone();

        // Attach retries keep the worker busy past the migration delay.
        iaas.fail_attach(u32::MAX).await;
        inst.create_volume("scratch", 1, &replacement.id).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        inst.wait_idle().await;

        assert_eq!(inst.state().current(), Running);
        assert_eq!(inst.nodes(), vec![replacement]);
        assert_eq!(iaas.live_nodes().await.len(), 1);
        let log: Vec<ManagerState> = inst.state().history().into_iter().map(|e| e.state).collect();
        assert!(log.ends_with(&[ManagerState::Adapting, Failed, ManagerState::Adapting, Running]));
    }

    #[tokio::test]
    async fn test_set_password_updates_root() {
        let agent = MockAgent::new();
        let inst = running(&MockIaas::new(), &agent).await;
        let params = json!({"user": "root", "password": "s3cret"});
        inst.call("set_password", params.as_object().cloned().unwrap(), vec![])
            .await
            .unwrap();
        assert_eq!(agent.calls_to("set_password").await.len(), 1);
    }
}
