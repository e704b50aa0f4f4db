// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! XtreemFS: directory (DIR), metadata (MRC) and storage (OSD) servers.
//!
//! The founding node runs all three and carries the first OSD volume. It
//! heads every membership list and is never removed by `remove_nodes`.
//! Nodes added later take exactly one of the `dir`, `mrc`, `osd` roles.
//!
//! Each server gets a UUID when it is created; the UUIDs are kept so that
//! a server is registered under the same identity for its whole life.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{debug, info};
use uuid::Uuid;

use super::ServiceKind;
use crate::agent::xtreemfs as agent;
use crate::args::{Args, Check, Params, Schema};
use crate::error::{ManagerError, Result};
use crate::instance::ServiceInstance;
use crate::jsonrpc::FilePart;
use crate::node::{NodeRequest, RoleCounts, ServiceNode, Volume, VolumeRequest, take_last_of_role};
use crate::service::{ManagerContext, MethodDecl, ServiceManager};
use crate::state::{ManagerState, lock};

const FOUNDER: &str = "xtreemfs";
const DIR: &str = "dir";
const MRC: &str = "mrc";
const OSD: &str = "osd";

const STRIPING_POLICIES: &str = "RAID0";
const REPLICATION_POLICIES: &str = "ronly, WaR1, WqRq";
const OSD_SEL_POLICIES: &str = "DEFAULT, FQDN, UUID, DCMAP, VIVALDI";
const REPLICA_SEL_POLICIES: &str = "DEFAULT, FQDN, DCMAP, VIVALDI";

/// XtreemFS service manager.
#[derive(Debug)]
pub struct XtreemFsManager {
    osd_volume_size: AtomicU64,
    persistent: AtomicBool,
    uuids: Mutex<HashMap<(String, &'static str), String>>,
}

impl XtreemFsManager {
    /// Create the manager with the configured OSD volume size.
    pub fn new(ctx: &ManagerContext) -> Self {
        Self {
            osd_volume_size: AtomicU64::new(ctx.config.osd_volume_size),
            persistent: AtomicBool::new(false),
            uuids: Mutex::new(HashMap::new()),
        }
    }

    fn osd_request(&self, role: &str) -> NodeRequest {
        let size = self.osd_volume_size.load(Ordering::SeqCst);
        NodeRequest::new(role).with_volume(VolumeRequest::new(OSD, size))
    }

    fn uuid_for(&self, node: &ServiceNode, server: &'static str) -> String {
        lock(&self.uuids)
            .entry((node.id.clone(), server))
            .or_insert_with(|| Uuid::new_v4().to_string())
            .clone()
    }

    fn forget(&self, node: &ServiceNode) {
        lock(&self.uuids).retain(|(id, _), _| *id != node.id);
    }

    async fn create_osd(&self, ctx: &ManagerContext, node: &ServiceNode, dir_ip: &str) -> Result<()> {
        let device = node.volumes.first().map(|v| v.dev_name.as_str()).ok_or_else(|| {
            ManagerError::Unknown(format!("osd node {} has no storage volume", node.id))
        })?;
        let uuid = self.uuid_for(node, OSD);
        agent::create_osd(ctx.agent.as_ref(), node, dir_ip, &uuid, true, device).await?;
        Ok(())
    }
}

/// Nodes running `server`, founder first.
fn members<'a>(nodes: &'a [ServiceNode], server: &str) -> Vec<&'a ServiceNode> {
    nodes
        .iter()
        .filter(|n| n.role == FOUNDER || n.role == server)
        .collect()
}

fn ids(nodes: &[&ServiceNode]) -> Value {
    Value::from(nodes.iter().map(|n| n.id.clone()).collect::<Vec<_>>())
}

fn head<'a>(nodes: &'a [ServiceNode], server: &str) -> Result<&'a ServiceNode> {
    members(nodes, server)
        .into_iter()
        .next()
        .ok_or_else(|| ManagerError::Unknown(format!("service has no {} server", server)))
}

fn policy_args(args: &Args, flag: &str, extra: &[(&str, &str)]) -> Result<Vec<String>> {
    let mut out = vec![flag.to_string()];
    for (option, name) in extra {
        let value = match args.value(name) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => return Err(ManagerError::ArgsMissing(name.to_string())),
        };
        if !option.is_empty() {
            out.push(option.to_string());
        }
        out.push(value);
    }
    Ok(out)
}

#[async_trait]
impl ServiceManager for XtreemFsManager {
    fn kind(&self) -> ServiceKind {
        ServiceKind::XtreemFs
    }

    fn roles(&self) -> &'static [&'static str] {
        &[DIR, MRC, OSD]
    }

    fn starting_nodes(&self, _ctx: &ManagerContext) -> Vec<NodeRequest> {
        vec![self.osd_request(FOUNDER)]
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
                OSD | FOUNDER => self.osd_request(&role),
                _ => NodeRequest::new(role),
            })
            .collect())
    }

    fn select_removals(&self, counts: &RoleCounts, nodes: &[ServiceNode]) -> Result<Vec<ServiceNode>> {
        let mut victims = Vec::new();
        for (role, count) in counts.iter() {
            let picked = take_last_of_role(nodes, role, count, false).ok_or_else(|| {
                ManagerError::WrongNrNodes {
                    count,
                    max: members(nodes, role).len().saturating_sub(1) as u32,
                    role: role.to_string(),
                }
            })?;
            victims.extend(picked.into_iter().cloned());
        }
        Ok(victims)
    }

    async fn on_start(&self, ctx: &ManagerContext, nodes: &[ServiceNode]) -> Result<()> {
        let founder = nodes
            .first()
            .ok_or_else(|| ManagerError::Unknown("no founding node".to_string()))?;
        info!(node_id = %founder.id, "Starting DIR, MRC and OSD on founding node");
        agent::create_dir(ctx.agent.as_ref(), founder, &self.uuid_for(founder, DIR)).await?;
        agent::create_mrc(
            ctx.agent.as_ref(),
            founder,
            &founder.ip,
            &self.uuid_for(founder, MRC),
        )
        .await?;
        self.create_osd(ctx, founder, &founder.ip).await?;
        // Any extra starting nodes are plain members.
        self.on_add_nodes(ctx, &nodes[1..], &nodes[..1]).await
    }

    async fn on_stop(&self, ctx: &ManagerContext, nodes: &[ServiceNode]) -> Result<()> {
        for node in members(nodes, OSD) {
            agent::stop_osd(ctx.agent.as_ref(), node, false).await?;
        }
        for node in members(nodes, MRC) {
            agent::stop_mrc(ctx.agent.as_ref(), node).await?;
        }
        for node in members(nodes, DIR) {
            agent::stop_dir(ctx.agent.as_ref(), node).await?;
        }
        lock(&self.uuids).clear();
        Ok(())
    }

    async fn on_add_nodes(
        &self,
        ctx: &ManagerContext,
        new: &[ServiceNode],
        existing: &[ServiceNode],
    ) -> Result<()> {
        if new.is_empty() {
            return Ok(());
        }
        let dir_ip = head(existing, DIR)?.ip.clone();
        for node in new {
            debug!(node_id = %node.id, role = %node.role, "Configuring XtreemFS node");
            match node.role.as_str() {
                DIR => {
                    agent::create_dir(ctx.agent.as_ref(), node, &self.uuid_for(node, DIR)).await?
                }
                MRC => {
                    agent::create_mrc(ctx.agent.as_ref(), node, &dir_ip, &self.uuid_for(node, MRC))
                        .await?
                }
                _ => self.create_osd(ctx, node, &dir_ip).await?,
            }
        }
        Ok(())
    }

    async fn on_remove_nodes(
        &self,
        ctx: &ManagerContext,
        removed: &[ServiceNode],
        _remaining: &[ServiceNode],
    ) -> Result<()> {
        for node in removed {
            match node.role.as_str() {
                DIR => agent::stop_dir(ctx.agent.as_ref(), node).await?,
                MRC => agent::stop_mrc(ctx.agent.as_ref(), node).await?,
                _ => agent::stop_osd(ctx.agent.as_ref(), node, true).await?,
            }
            self.forget(node);
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
        let mut info = Map::new();
        info.insert(
            "osd_volume_size".into(),
            json!(self.osd_volume_size.load(Ordering::SeqCst)),
        );
        info.insert("persistent".into(), json!(self.persistent.load(Ordering::SeqCst)));
        info
    }

    fn list_nodes(&self, nodes: &[ServiceNode]) -> Value {
        json!({
            "dir": ids(&members(nodes, DIR)),
            "mrc": ids(&members(nodes, MRC)),
            "osd": ids(&members(nodes, OSD)),
        })
    }

    fn node_info(&self, node: &ServiceNode) -> Value {
        let runs = |server: &str| node.role == FOUNDER || node.role == server;
        json!({
            "id": node.id,
            "ip": node.ip,
            "dir": runs(DIR),
            "mrc": runs(MRC),
            "osd": runs(OSD),
        })
    }

    fn methods(&self) -> Vec<MethodDecl> {
        vec![
            MethodDecl::post("createVolume"),
            MethodDecl::post("deleteVolume"),
            MethodDecl::get("listVolumes"),
            MethodDecl::get("list_striping_policies"),
            MethodDecl::get("list_replication_policies"),
            MethodDecl::get("list_osd_sel_policies"),
            MethodDecl::get("list_replica_sel_policies"),
            MethodDecl::post("set_osd_sel_policy"),
            MethodDecl::post("set_replica_sel_policy"),
            MethodDecl::post("set_replication_policy"),
            MethodDecl::post("set_striping_policy"),
            MethodDecl::post("set_osd_size"),
            MethodDecl::post("toggle_persistent"),
        ]
    }

    async fn call(
        &self,
        instance: &Arc<ServiceInstance>,
        method: &str,
        params: Params,
        _files: Vec<FilePart>,
    ) -> Result<Value> {
        let ctx = instance.context();
        let policies = |list: &str| -> Result<Value> {
            Schema::new().parse(&params)?;
            Ok(json!({ "policies": list }))
        };

        match method {
            "list_striping_policies" => return policies(STRIPING_POLICIES),
            "list_replication_policies" => return policies(REPLICATION_POLICIES),
            "list_osd_sel_policies" => return policies(OSD_SEL_POLICIES),
            "list_replica_sel_policies" => return policies(REPLICA_SEL_POLICIES),
            "set_osd_size" => {
                let args = Schema::new().required("size", Check::PosInt).parse(&params)?;
                let size = args.u64("size")?;
                self.osd_volume_size.store(size, Ordering::SeqCst);
                info!(service_id = instance.id(), size, "OSD volume size changed");
                return Ok(instance.service_info());
            }
            "toggle_persistent" => {
                Schema::new().parse(&params)?;
                let persistent = !self.persistent.fetch_xor(true, Ordering::SeqCst);
                debug!(service_id = instance.id(), persistent, "Persistence toggled");
                return Ok(instance.service_info());
            }
            _ => {}
        }

        let schema = match method {
            "createVolume" => Schema::new()
                .required("volumeName", Check::String)
                .optional("owner", Check::String, "xtreemfs"),
            "deleteVolume" => Schema::new().required("volumeName", Check::String),
            "listVolumes" => Schema::new(),
            "set_osd_sel_policy" | "set_replica_sel_policy" => Schema::new()
                .required("volumeName", Check::String)
                .required("policy", Check::String),
            "set_replication_policy" => Schema::new()
                .required("volumeName", Check::String)
                .required("policy", Check::String)
                .required("factor", Check::PosInt),
            "set_striping_policy" => Schema::new()
                .required("volumeName", Check::String)
                .required("policy", Check::String)
                .required("width", Check::PosInt)
                .required("stripe-size", Check::PosInt),
            other => return Err(ManagerError::invalid(format!("unknown method '{}'", other))),
        };
        let args = schema.parse(&params)?;
        instance.state().ensure(method, &[ManagerState::Running])?;
        let nodes = instance.nodes();

        match method {
            "createVolume" => {
                let mrc = head(&nodes, MRC)?;
                agent::create_volume(ctx.agent.as_ref(), mrc, args.str("volumeName")?, args.str("owner")?)
                    .await?;
                Ok(json!({}))
            }
            "deleteVolume" => {
                let mrc = head(&nodes, MRC)?;
                agent::delete_volume(ctx.agent.as_ref(), mrc, args.str("volumeName")?).await?;
                Ok(json!({}))
            }
            "listVolumes" => {
                let mrc = head(&nodes, MRC)?;
                let listing = agent::list_volumes(ctx.agent.as_ref(), mrc).await?;
                Ok(json!({ "volumes": listing }))
            }
            _ => {
                let xtfsutil = match method {
                    "set_osd_sel_policy" => policy_args(&args, "--set-osp", &[("", "policy")])?,
                    "set_replica_sel_policy" => policy_args(&args, "--set-rsp", &[("", "policy")])?,
                    "set_replication_policy" => policy_args(
                        &args,
                        "--set-drp",
                        &[
                            ("--replication-policy", "policy"),
                            ("--replication-factor", "factor"),
                        ],
                    )?,
                    _ => policy_args(
                        &args,
                        "--set-dsp",
                        &[
                            ("--striping-policy", "policy"),
                            ("--striping-policy-width", "width"),
                            ("--striping-policy-stripe-size", "stripe-size"),
                        ],
                    )?,
                };
                let dir = head(&nodes, DIR)?;
                let stdout =
                    agent::set_policy(ctx.agent.as_ref(), dir, args.str("volumeName")?, &xtfsutil)
                        .await?;
                Ok(json!({ "stdout": stdout }))
            }
        }
    }
}
