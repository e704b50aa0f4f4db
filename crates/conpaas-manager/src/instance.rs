// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One running service and its lifecycle.
//!
//! Every mutating operation follows the same pattern:
//!
//! 1. validate arguments, check the state, check credit (synchronous errors,
//!    no side effects)
//! 2. [`ServiceInstance::begin_with`]: under the state lock, re-check the
//!    state, compute anything that depends on the node list, queue the job
//!    and enter the transient state
//! 3. the worker runs the job; its [`Outcome`] (or error, which becomes
//!    `ERROR`) is the next state
//!
//! | Operation        | Allowed from       | Transient  | Result                 |
//! |------------------|--------------------|------------|------------------------|
//! | `startup`        | INIT, STOPPED      | PROLOGUE   | RUNNING                |
//! | `add_nodes`      | RUNNING            | ADAPTING   | RUNNING                |
//! | `remove_nodes`   | RUNNING            | ADAPTING   | RUNNING or STOPPED     |
//! | `create_volume`  | RUNNING            | ADAPTING   | RUNNING                |
//! | `delete_volume`  | RUNNING            | ADAPTING   | RUNNING                |
//! | `migrate_nodes`  | RUNNING            | ADAPTING   | RUNNING                |
//! | `shutdown`       | RUNNING, ERROR     | EPILOGUE   | STOPPED                |

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::args::{Check, Params, Schema};
use crate::config::Config;
use crate::credit::ensure_credit;
use crate::error::{ManagerError, Result};
use crate::jsonrpc::FilePart;
use crate::node::{NodeRequest, RoleCounts, ServiceNode, Volume};
use crate::service::{ManagerContext, MethodDecl, ServiceManager};
use crate::services::ServiceKind;
use crate::state::{ManagerState, StateMachine, lock};
use crate::volumes::{self, NewVolume};
use crate::worker::Worker;

use crate::state::ManagerState::{Adapting, Epilogue, Error as Failed, Init, Prologue, Running, Stopped};

/// Most nodes a single `add_nodes` request may ask for.
pub const MAX_NODES_PER_REQUEST: u32 = 100;

/// RPC methods every service answers.
pub const BASE_METHODS: &[MethodDecl] = &[
    MethodDecl::get("get_service_info"),
    MethodDecl::get("get_service_history"),
    MethodDecl::get("list_nodes"),
    MethodDecl::get("get_node_info"),
    MethodDecl::get("get_agent_log"),
    MethodDecl::get("get_manager_log"),
    MethodDecl::post("startup"),
    MethodDecl::post("shutdown"),
    MethodDecl::post("add_nodes"),
    MethodDecl::post("remove_nodes"),
];

/// `get_manager_log` payload: the contents of the configured log file.
pub async fn manager_log(config: &Config) -> Result<Value> {
    let Some(path) = &config.log_file else {
        return Err(ManagerError::Unknown("Failed to read log".to_string()));
    };
    match tokio::fs::read_to_string(path).await {
        Ok(log) => Ok(json!({ "log": log })),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read manager log");
            Err(ManagerError::Unknown("Failed to read log".to_string()))
        }
    }
}

/// Terminal state a job settles in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// State to enter.
    pub state: ManagerState,
    /// Reason recorded in the state log.
    pub reason: String,
}

impl Outcome {
    /// Settle in `RUNNING`.
    pub fn running(reason: impl Into<String>) -> Self {
        Self {
            state: Running,
            reason: reason.into(),
        }
    }

    /// Settle in `STOPPED`.
    pub fn stopped(reason: impl Into<String>) -> Self {
        Self {
            state: Stopped,
            reason: reason.into(),
        }
    }
}

/// One node to move to another cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMove {
    /// Cloud the node lives in.
    pub from_cloud: String,
    /// VM id of the node.
    pub vmid: String,
    /// Cloud the replacement goes to.
    pub to_cloud: String,
}

/// A service instance: state machine, nodes, hooks and worker.
pub struct ServiceInstance {
    id: u32,
    name: String,
    state: StateMachine,
    nodes: Mutex<Vec<ServiceNode>>,
    manager: Box<dyn ServiceManager>,
    ctx: ManagerContext,
    worker: Worker,
}

impl std::fmt::Debug for ServiceInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceInstance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.manager.kind())
            .field("state", &self.state.current())
            .finish()
    }
}

impl ServiceInstance {
    /// Create an instance in `INIT` and spawn its worker.
    pub fn new(
        id: u32,
        name: impl Into<String>,
        manager: Box<dyn ServiceManager>,
        ctx: ManagerContext,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            state: StateMachine::new(),
            nodes: Mutex::new(Vec::new()),
            manager,
            ctx,
            worker: Worker::spawn(format!("service-{}", id)),
        })
    }

    /// Service id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Service type.
    pub fn kind(&self) -> ServiceKind {
        self.manager.kind()
    }

    /// State machine.
    pub fn state(&self) -> &StateMachine {
        &self.state
    }

    /// Shared collaborators.
    pub fn context(&self) -> &ManagerContext {
        &self.ctx
    }

    /// Snapshot of the node list.
    pub fn nodes(&self) -> Vec<ServiceNode> {
        lock(&self.nodes).clone()
    }

    /// Look up one node.
    pub fn node(&self, id: &str) -> Option<ServiceNode> {
        lock(&self.nodes).iter().find(|n| n.id == id).cloned()
    }

    /// Whether the node belongs to this service.
    pub fn has_node(&self, id: &str) -> bool {
        lock(&self.nodes).iter().any(|n| n.id == id)
    }

    /// All RPC methods of this instance.
    pub fn methods(&self) -> Vec<MethodDecl> {
        let mut methods = BASE_METHODS.to_vec();
        methods.extend(self.manager.methods());
        methods
    }

    /// Wait until the worker has drained its queue.
    pub async fn wait_idle(&self) {
        self.worker.wait_idle().await;
    }

    /// Stop the worker.
    pub async fn stop_worker(&self) {
        self.worker.stop().await;
    }

    fn extend_nodes(&self, nodes: &[ServiceNode]) {
        lock(&self.nodes).extend(nodes.iter().cloned());
    }

    fn update_node(&self, id: &str, f: impl FnOnce(&mut ServiceNode)) {
        if let Some(node) = lock(&self.nodes).iter_mut().find(|n| n.id == id) {
            f(node);
        }
    }

    fn drop_nodes(&self, ids: &[&str]) {
        lock(&self.nodes).retain(|n| !ids.contains(&n.id.as_str()));
    }

    fn check_cloud(&self, cloud: &str) -> Result<()> {
        if self.ctx.iaas.clouds().iter().any(|c| c == cloud) {
            Ok(())
        } else {
            Err(ManagerError::invalid(format!("Unknown cloud '{}'", cloud)))
        }
    }

    // ---- job plumbing ----

    /// Enter a transient state and queue `job`.
    pub fn begin<F, Fut>(
        self: &Arc<Self>,
        operation: &'static str,
        allowed: &[ManagerState],
        next: ManagerState,
        reason: impl Into<String>,
        job: F,
    ) -> Result<ManagerState>
    where
        F: FnOnce(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Outcome>> + Send + 'static,
    {
        self.begin_with(operation, allowed, next, reason, |_| Ok(()), |inst, ()| job(inst))
    }

    /// Like [`begin`](Self::begin), with a `prepare` step run under the
    /// state lock. Its value is handed to the job; its error aborts the
    /// operation without a transition.
    ///
    /// `prepare` must not touch the state machine.
    pub fn begin_with<T, P, F, Fut>(
        self: &Arc<Self>,
        operation: &'static str,
        allowed: &[ManagerState],
        next: ManagerState,
        reason: impl Into<String>,
        prepare: P,
        job: F,
    ) -> Result<ManagerState>
    where
        T: Send + 'static,
        P: FnOnce(&Self) -> Result<T>,
        F: FnOnce(Arc<Self>, T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Outcome>> + Send + 'static,
    {
        let inst = Arc::clone(self);
        self.state
            .transition(operation, allowed, next, reason, move || {
                let prepared = prepare(&*inst)?;
                let runner = Arc::clone(&inst);
                let fut = async move {
                    let result = job(Arc::clone(&runner), prepared).await;
                    runner.settle(operation, result);
                }
                .boxed();
                inst.worker.submit(fut)
            })?;
        info!(service_id = self.id, operation, state = %next, "Operation accepted");
        Ok(next)
    }

    /// Queue `job` without a state change. A failure moves to `ERROR`.
    pub fn run_job<F, Fut>(self: &Arc<Self>, operation: &'static str, job: F) -> Result<()>
    where
        F: FnOnce(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let inst = Arc::clone(self);
        self.worker.submit(
            async move {
                if let Err(e) = job(Arc::clone(&inst)).await {
                    error!(service_id = inst.id, operation, error = %e, "Job failed");
                    inst.state.set(Failed, e.to_string());
                }
            }
            .boxed(),
        )
    }

    fn settle(&self, operation: &str, result: Result<Outcome>) {
        match result {
            Ok(outcome) => {
                info!(
                    service_id = self.id,
                    operation,
                    state = %outcome.state,
                    reason = %outcome.reason,
                    "Operation finished"
                );
                self.state.set(outcome.state, outcome.reason);
            }
            Err(e) => {
                error!(service_id = self.id, operation, error = %e, "Operation failed");
                self.state.set(Failed, e.to_string());
            }
        }
    }

    // ---- provisioning helpers ----

    async fn provision(&self, requests: &[NodeRequest], cloud: &str) -> Result<Vec<ServiceNode>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        info!(service_id = self.id, count = requests.len(), cloud, "Creating nodes");
        let mut nodes = self
            .ctx
            .iaas
            .create_nodes(requests.len(), cloud, self.ctx.agent.as_ref())
            .await?;
        for (node, request) in nodes.iter_mut().zip(requests) {
            node.role = request.role.clone();
        }
        self.extend_nodes(&nodes);

        for (node, request) in nodes.iter_mut().zip(requests) {
            for wanted in &request.volumes {
                let name = wanted.name_for(node);
                self.ctx.volumes.reserve(&name)?;
                let volume = self.attach_reserved(node, &name, &name, wanted.size).await?;
                node.volumes.push(volume.clone());
                self.update_node(&node.id, |n| n.volumes.push(volume));
            }
        }
        Ok(nodes)
    }

    async fn attach_reserved(
        &self,
        node: &ServiceNode,
        name: &str,
        cloud_name: &str,
        size: u64,
    ) -> Result<Volume> {
        let created = volumes::create_and_attach(
            self.ctx.iaas.as_ref(),
            self.ctx.config.volume_retry,
            &self.ctx.config.dev_target,
            node,
            NewVolume {
                name,
                cloud_name,
                size,
            },
        )
        .await;
        match created {
            Ok(volume) => {
                self.ctx.volumes.insert(volume.clone());
                Ok(volume)
            }
            Err(e) => {
                self.ctx.volumes.release(name);
                Err(e.into())
            }
        }
    }

    async fn release_volume(&self, node: &ServiceNode, volume: &Volume) -> Result<()> {
        if let Err(e) = self.manager.on_delete_volume(&self.ctx, node, volume).await {
            warn!(node_id = %node.id, volume = %volume.volume_name, error = %e, "Failed to release volume on node");
        }
        volumes::detach_and_destroy(self.ctx.iaas.as_ref(), self.ctx.config.volume_retry, volume)
            .await?;
        self.ctx.volumes.remove(&volume.volume_name);
        self.update_node(&node.id, |n| {
            n.volumes.retain(|v| v.volume_name != volume.volume_name)
        });
        Ok(())
    }

    async fn remove_node_set(&self, victims: &[ServiceNode]) -> Result<Outcome> {
        let ids: Vec<&str> = victims.iter().map(|n| n.id.as_str()).collect();
        info!(service_id = self.id, nodes = ?ids, "Removing nodes");

        let remaining: Vec<ServiceNode> = self
            .nodes()
            .into_iter()
            .filter(|n| !ids.contains(&n.id.as_str()))
            .collect();
        // Volumes stay attached until the service has let go of the nodes.
        self.manager
            .on_remove_nodes(&self.ctx, victims, &remaining)
            .await?;

        for node in victims {
            for volume in self.ctx.volumes.for_node(&node.id) {
                self.release_volume(node, &volume).await?;
            }
        }
        self.ctx.iaas.delete_nodes(victims).await?;
        self.drop_nodes(&ids);

        if remaining.is_empty() {
            Ok(Outcome::stopped("All nodes removed"))
        } else {
            Ok(Outcome::running(format!("Removed {} node(s)", victims.len())))
        }
    }

    async fn roll_back(&self, fresh: &[ServiceNode]) {
        for node in fresh {
            if let Err(e) = self.ctx.agent.stop(node).await {
                warn!(node_id = %node.id, error = %e, "Failed to stop node during rollback");
            }
            for volume in self.ctx.volumes.for_node(&node.id) {
                if let Err(e) = self.release_volume(node, &volume).await {
                    warn!(volume = %volume.volume_name, error = %e, "Failed to release volume during rollback");
                }
            }
        }
        if let Err(e) = self.ctx.iaas.delete_nodes(fresh).await {
            warn!(error = %e, "Failed to delete nodes during rollback");
        }
        let ids: Vec<&str> = fresh.iter().map(|n| n.id.as_str()).collect();
        self.drop_nodes(&ids);
    }

    // ---- lifecycle operations ----

    /// Provision the starting nodes and start the service.
    pub async fn startup(self: &Arc<Self>, cloud: &str) -> Result<ManagerState> {
        const ALLOWED: &[ManagerState] = &[Init, Stopped];
        self.check_cloud(cloud)?;
        self.state.ensure("startup", ALLOWED)?;
        ensure_credit(self.ctx.credits.as_ref()).await?;

        let requests = self.manager.starting_nodes(&self.ctx);
        let cloud = cloud.to_string();
        self.begin("startup", ALLOWED, Prologue, "Manager starting up", move |inst| async move {
            let nodes = inst.provision(&requests, &cloud).await?;
            inst.manager.on_start(&inst.ctx, &nodes).await?;
            Ok(Outcome::running("Manager started"))
        })
    }

    /// Release every volume and node.
    pub fn shutdown(self: &Arc<Self>) -> Result<ManagerState> {
        self.begin("shutdown", &[Running, Failed], Epilogue, "Manager shutting down", |inst| async move {
            let nodes = inst.nodes();
            if let Err(e) = inst.manager.on_stop(&inst.ctx, &nodes).await {
                warn!(service_id = inst.id, error = %e, "Failed to stop service processes");
            }
            let mut release_error = None;
            for node in &nodes {
                for volume in inst.ctx.volumes.for_node(&node.id) {
                    if let Err(e) = inst.release_volume(node, &volume).await {
                        warn!(volume = %volume.volume_name, error = %e, "Failed to release volume");
                        release_error = Some(e);
                    }
                }
            }
            inst.ctx.iaas.delete_nodes(&nodes).await?;
            lock(&inst.nodes).clear();
            match release_error {
                Some(e) => Err(e),
                None => Ok(Outcome::stopped("Manager stopped")),
            }
        })
    }

    /// Grow the service by `counts` nodes in `cloud`.
    pub async fn add_nodes(self: &Arc<Self>, counts: RoleCounts, cloud: &str) -> Result<ManagerState> {
        self.check_cloud(cloud)?;
        let total = counts.total()?;
        if total == 0 {
            return Err(ManagerError::invalid("nodes: at least one node must be added"));
        }
        if total > MAX_NODES_PER_REQUEST {
            return Err(ManagerError::invalid(format!(
                "nodes: cannot add more than {} nodes at once",
                MAX_NODES_PER_REQUEST
            )));
        }
        if let Some((role, _)) = counts.iter().find(|(r, _)| !self.manager.roles().contains(r)) {
            return Err(ManagerError::invalid(format!("nodes: unknown role '{}'", role)));
        }
        self.state.ensure("add_nodes", &[Running])?;
        ensure_credit(self.ctx.credits.as_ref()).await?;

        let cloud = cloud.to_string();
        self.begin_with(
            "add_nodes",
            &[Running],
            Adapting,
            format!("Adding {} node(s)", total),
            |inst| inst.manager.add_nodes_plan(&inst.ctx, &counts, &inst.nodes()),
            move |inst, requests| async move {
                let existing = inst.nodes();
                let new = inst.provision(&requests, &cloud).await?;
                inst.manager.on_add_nodes(&inst.ctx, &new, &existing).await?;
                Ok(Outcome::running(format!("Added {} node(s)", new.len())))
            },
        )
    }

    /// Shrink the service by `counts` nodes.
    pub fn remove_nodes(self: &Arc<Self>, counts: RoleCounts) -> Result<ManagerState> {
        let total = counts.total()?;
        if total == 0 {
            return Err(ManagerError::invalid("nodes: at least one node must be removed"));
        }
        if let Some((role, _)) = counts.iter().find(|(r, _)| !self.manager.roles().contains(r)) {
            return Err(ManagerError::invalid(format!("nodes: unknown role '{}'", role)));
        }
        self.begin_with(
            "remove_nodes",
            &[Running],
            Adapting,
            format!("Removing {} node(s)", total),
            move |inst| {
                let nodes = inst.nodes();
                if total as usize > nodes.len() {
                    return Err(ManagerError::invalid(format!(
                        "Cannot remove {} node(s): the service only has {}",
                        total,
                        nodes.len()
                    )));
                }
                inst.manager.select_removals(&counts, &nodes)
            },
            |inst, victims| async move { inst.remove_node_set(&victims).await },
        )
    }

    /// Remove exactly the given nodes.
    pub fn remove_specific_nodes(self: &Arc<Self>, node_ids: Vec<String>) -> Result<ManagerState> {
        self.begin_with(
            "remove_nodes",
            &[Running],
            Adapting,
            format!("Removing node(s) {}", node_ids.join(", ")),
            move |inst| {
                node_ids
                    .iter()
                    .map(|id| {
                        inst.node(id)
                            .ok_or_else(|| ManagerError::invalid(format!("Unknown node '{}'", id)))
                    })
                    .collect::<Result<Vec<_>>>()
            },
            |inst, victims| async move { inst.remove_node_set(&victims).await },
        )
    }

    /// Create a volume and attach it to one of this service's nodes.
    pub fn create_volume(
        self: &Arc<Self>,
        name: &str,
        size: u64,
        node_id: &str,
    ) -> Result<ManagerState> {
        let name = name.to_string();
        let node_id = node_id.to_string();
        let reserved = name.clone();
        let target = node_id.clone();
        self.begin_with(
            "create_volume",
            &[Running],
            Adapting,
            format!("Creating volume {}", name),
            move |inst| {
                if !inst.has_node(&target) {
                    return Err(ManagerError::invalid(format!("agentId: unknown node '{}'", target)));
                }
                inst.ctx.volumes.reserve(&reserved)
            },
            move |inst, ()| async move {
                let Some(node) = inst.node(&node_id) else {
                    inst.ctx.volumes.release(&name);
                    return Err(ManagerError::invalid(format!("agentId: unknown node '{}'", node_id)));
                };
                let cloud_name = format!("vol-{}", name);
                let volume = inst.attach_reserved(&node, &name, &cloud_name, size).await?;
                if let Err(e) = inst.manager.on_create_volume(&inst.ctx, &node, &volume).await {
                    inst.ctx.volumes.remove(&name);
                    if let Err(release) = volumes::detach_and_destroy(
                        inst.ctx.iaas.as_ref(),
                        inst.ctx.config.volume_retry,
                        &volume,
                    )
                    .await
                    {
                        warn!(volume = %name, error = %release, "Failed to release unconfigured volume");
                    }
                    return Err(e);
                }
                inst.update_node(&node.id, |n| n.volumes.push(volume));
                Ok(Outcome::running(format!("Volume {} created and attached", name)))
            },
        )
    }

    /// Unmount, detach and destroy a volume of this service.
    pub fn delete_volume(self: &Arc<Self>, name: &str) -> Result<ManagerState> {
        let name = name.to_string();
        self.begin_with(
            "delete_volume",
            &[Running],
            Adapting,
            format!("Deleting volume {}", name),
            move |inst| {
                let volume = inst
                    .ctx
                    .volumes
                    .get(&name)
                    .ok_or_else(|| ManagerError::invalid(format!("volumeName: unknown volume '{}'", name)))?;
                let node = inst.node(&volume.agent_id).ok_or_else(|| {
                    ManagerError::invalid(format!("volume '{}' is not attached to this service", name))
                })?;
                Ok((node, volume))
            },
            |inst, (node, volume)| async move {
                inst.release_volume(&node, &volume).await?;
                Ok(Outcome::running(format!("Volume {} removed", volume.volume_name)))
            },
        )
    }

    /// Replace nodes with fresh ones in other clouds.
    ///
    /// Replacements join the service first. If that fails they are stopped
    /// and deleted and the service returns to `RUNNING`. The originals are
    /// removed right away, or `delay` later.
    pub fn migrate_nodes(self: &Arc<Self>, moves: Vec<NodeMove>, delay: Duration) -> Result<ManagerState> {
        if moves.is_empty() {
            return Err(ManagerError::invalid("nodes: no nodes to migrate"));
        }
        for m in &moves {
            if m.from_cloud.is_empty() || m.to_cloud.is_empty() {
                return Err(ManagerError::invalid(format!(
                    "Missing cloud name in parameter \"nodes\": from_cloud=\"{}\" to_cloud=\"{}\"",
                    m.from_cloud, m.to_cloud
                )));
            }
            self.check_cloud(&m.to_cloud)?;
        }

        self.begin_with(
            "migrate_nodes",
            &[Running],
            Adapting,
            format!("Migrating {} node(s)", moves.len()),
            move |inst| {
                let nodes = inst.nodes();
                moves
                    .into_iter()
                    .map(|m| {
                        nodes
                            .iter()
                            .find(|n| n.cloud_name == m.from_cloud && n.vmid == m.vmid)
                            .map(|n| (n.clone(), m.to_cloud.clone()))
                            .ok_or_else(|| {
                                let available: Vec<String> = nodes
                                    .iter()
                                    .map(|n| format!("{}:{}", n.cloud_name, n.vmid))
                                    .collect();
                                ManagerError::invalid(format!(
                                    "Node {} in cloud {} is not a valid node of this service. It should be one of {}",
                                    m.vmid,
                                    m.from_cloud,
                                    available.join(", ")
                                ))
                            })
                    })
                    .collect::<Result<Vec<_>>>()
            },
            move |inst, plan| async move {
                let before: Vec<String> = inst.nodes().iter().map(|n| n.id.clone()).collect();
                let joined = inst.join_replacements(&plan).await;
                if let Err(e) = joined {
                    let fresh: Vec<ServiceNode> = inst
                        .nodes()
                        .into_iter()
                        .filter(|n| !before.contains(&n.id))
                        .collect();
                    warn!(service_id = inst.id, error = %e, "Migration failed, rolling back");
                    inst.roll_back(&fresh).await;
                    return Ok(Outcome::running(format!("Migration rolled back: {}", e)));
                }

                let old: Vec<ServiceNode> = plan.into_iter().map(|(n, _)| n).collect();
                if delay.is_zero() {
                    inst.remove_node_set(&old).await?;
                    return Ok(Outcome::running("Migration finished"));
                }

                let later = Arc::clone(&inst);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = later.finalize_migration(old) {
                        warn!(service_id = later.id, error = %e, "Could not queue removal of migrated nodes");
                    }
                });
                Ok(Outcome::running(format!(
                    "Migration: replaced nodes will be removed in {}s",
                    delay.as_secs()
                )))
            },
        )
    }

    /// Queue removal of migrated-away nodes behind whatever job is running.
    ///
    /// Runs regardless of the state at that point. Nodes already gone, for
    /// instance after a shutdown, are skipped.
    fn finalize_migration(self: &Arc<Self>, old: Vec<ServiceNode>) -> Result<()> {
        let inst = Arc::clone(self);
        self.worker.submit(
            async move {
                let victims: Vec<ServiceNode> =
                    old.into_iter().filter(|n| inst.has_node(&n.id)).collect();
                if victims.is_empty() {
                    info!(service_id = inst.id, "Migrated nodes already removed");
                    return;
                }
                inst.state
                    .set(Adapting, format!("Removing {} migrated node(s)", victims.len()));
                let result = inst.remove_node_set(&victims).await;
                inst.settle("migrate_nodes", result);
            }
            .boxed(),
        )
    }

    async fn join_replacements(&self, plan: &[(ServiceNode, String)]) -> Result<()> {
        let mut by_cloud: BTreeMap<&str, Vec<&ServiceNode>> = BTreeMap::new();
        for (node, cloud) in plan {
            by_cloud.entry(cloud.as_str()).or_default().push(node);
        }
        let mut existing = self.nodes();
        for (cloud, olds) in by_cloud {
            let counts = RoleCounts::new(olds.iter().map(|n| (n.role.clone(), 1)));
            let requests = self.manager.add_nodes_plan(&self.ctx, &counts, &existing)?;
            let created = self.provision(&requests, cloud).await?;
            self.manager
                .on_add_nodes(&self.ctx, &created, &existing)
                .await?;
            existing.extend(created);
        }
        Ok(())
    }

    // ---- RPC surface ----

    /// `get_service_info` payload.
    pub fn service_info(&self) -> Value {
        let mut info = self.manager.service_info(&self.ctx);
        info.insert("state".into(), json!(self.state.current()));
        info.insert("type".into(), json!(self.kind().as_str()));
        Value::Object(info)
    }

    /// Dispatch one RPC method.
    pub async fn call(self: &Arc<Self>, method: &str, params: Params, files: Vec<FilePart>) -> Result<Value> {
        match method {
            "get_service_info" => {
                Schema::new().parse(&params)?;
                Ok(self.service_info())
            }
            "get_service_history" => {
                Schema::new().parse(&params)?;
                Ok(json!({ "state_log": self.state.history() }))
            }
            "list_nodes" => {
                Schema::new().parse(&params)?;
                Ok(self.manager.list_nodes(&self.nodes()))
            }
            "get_node_info" => {
                let args = Schema::new()
                    .required("serviceNodeId", Check::String)
                    .parse(&params)?;
                let id = args.str("serviceNodeId")?;
                let node = self
                    .node(id)
                    .ok_or_else(|| ManagerError::invalid(format!("serviceNodeId: unknown node '{}'", id)))?;
                Ok(json!({ "serviceNode": self.manager.node_info(&node) }))
            }
            "get_manager_log" => {
                Schema::new().parse(&params)?;
                manager_log(&self.ctx.config).await
            }
            "get_agent_log" => {
                let args = Schema::new()
                    .required("agentId", Check::String)
                    .optional("filename", Check::String, Value::Null)
                    .parse(&params)?;
                let id = args.str("agentId")?;
                let node = self
                    .node(id)
                    .ok_or_else(|| ManagerError::invalid(format!("agentId: unknown node '{}'", id)))?;
                let log = self.ctx.agent.get_log(&node, args.opt_str("filename")).await?;
                Ok(json!({ "log": log }))
            }
            "startup" => {
                let args = Schema::new()
                    .optional("cloud", Check::String, "default")
                    .parse(&params)?;
                let state = self.startup(args.str("cloud")?).await?;
                Ok(json!({ "state": state }))
            }
            "shutdown" => {
                Schema::new().parse(&params)?;
                let state = self.shutdown()?;
                Ok(json!({ "state": state }))
            }
            "add_nodes" => {
                let args = Schema::new()
                    .required("nodes", Check::RoleCounts)
                    .optional("cloud", Check::String, "default")
                    .parse(&params)?;
                let state = self
                    .add_nodes(args.role_counts("nodes")?, args.str("cloud")?)
                    .await?;
                Ok(json!({ "state": state }))
            }
            "remove_nodes" => {
                let args = Schema::new()
                    .required("nodes", Check::RoleCounts)
                    .parse(&params)?;
                let state = self.remove_nodes(args.role_counts("nodes")?)?;
                Ok(json!({ "state": state }))
            }
            _ => self.manager.call(self, method, params, files).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgent;
    use crate::credit::FixedCredit;
    use crate::iaas::MockIaas;
    use crate::services::ServiceKind;
    use crate::volumes::VolumeStore;

    fn instance(iaas: &MockIaas, agent: &MockAgent) -> Arc<ServiceInstance> {
        with_config(iaas, agent, Config::default().with_volume_retry(2, Duration::ZERO))
    }

    fn with_config(iaas: &MockIaas, agent: &MockAgent, config: Config) -> Arc<ServiceInstance> {
        let ctx = ManagerContext {
            config: Arc::new(config),
            iaas: Arc::new(iaas.clone()),
            agent: Arc::new(agent.clone()),
            credits: Arc::new(FixedCredit::unlimited()),
            volumes: VolumeStore::new(),
        };
        ServiceInstance::new(1, "hello", ServiceKind::HelloWorld.create(&ctx), ctx)
    }

    #[tokio::test]
    async fn test_startup_runs_through_prologue() {
        let iaas = MockIaas::new();
        let inst = instance(&iaas, &MockAgent::new());

        let state = inst.startup("default").await.unwrap();
        assert_eq!(state, Prologue);
        inst.wait_idle().await;

        let history = inst.state().history();
        let states: Vec<ManagerState> = history.iter().map(|e| e.state).collect();
        assert_eq!(states, vec![Init, Prologue, Running]);
        assert_eq!(inst.nodes().len(), 1);
    }

    #[tokio::test]
    async fn test_second_operation_is_rejected_while_adapting() {
        let iaas = MockIaas::new();
        let inst = instance(&iaas, &MockAgent::new());
        inst.startup("default").await.unwrap();
        inst.wait_idle().await;

        inst.remove_nodes(RoleCounts::new([("helloworld", 1)])).unwrap();
        // ADAPTING while the job runs, STOPPED once it is done.
        let err = inst.shutdown().unwrap_err();
        assert_eq!(err.error_code(), "E_STATE_ERROR");
        inst.wait_idle().await;
        assert_eq!(inst.state().current(), Stopped);
        assert!(inst.nodes().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_cloud_is_rejected_synchronously() {
        let inst = instance(&MockIaas::new(), &MockAgent::new());
        let err = inst.startup("mars").await.unwrap_err();
        assert_eq!(err.error_code(), "E_ARGS_INVALID");
        assert_eq!(inst.state().history().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_hook_sets_error_and_shutdown_recovers() {
        let iaas = MockIaas::new();
        let agent = MockAgent::new();
        agent.fail_method("startup").await;
        let inst = instance(&iaas, &agent);

        inst.startup("default").await.unwrap();
        inst.wait_idle().await;
        assert_eq!(inst.state().current(), Failed);
        assert_eq!(iaas.live_nodes().await.len(), 1);

        inst.shutdown().unwrap();
        inst.wait_idle().await;
        assert_eq!(inst.state().current(), Stopped);
        assert!(iaas.live_nodes().await.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_add_nodes_is_rejected() {
        let iaas = MockIaas::new();
        let inst = instance(&iaas, &MockAgent::new());
        inst.startup("default").await.unwrap();
        inst.wait_idle().await;
        let log_len = inst.state().history().len();

        let err = inst
            .add_nodes(RoleCounts::new([("helloworld", 4_000_000_000)]), "default")
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "E_ARGS_INVALID");
        let err = inst
            .add_nodes(RoleCounts::new([("helloworld", MAX_NODES_PER_REQUEST + 1)]), "default")
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "E_ARGS_INVALID");

        assert_eq!(inst.state().history().len(), log_len);
        assert_eq!(iaas.live_nodes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_manager_log_reads_configured_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manager.log");
        std::fs::write(&path, "INFO started\n").unwrap();

        let inst = with_config(
            &MockIaas::new(),
            &MockAgent::new(),
            Config::default().with_log_file(&path),
        );
        let result = inst
            .call("get_manager_log", Params::new(), vec![])
            .await
            .unwrap();
        assert_eq!(result, json!({ "log": "INFO started\n" }));

        let inst = instance(&MockIaas::new(), &MockAgent::new());
        let err = inst
            .call("get_manager_log", Params::new(), vec![])
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "E_UNKNOWN");
        assert!(err.to_string().contains("Failed to read log"));
    }
}
