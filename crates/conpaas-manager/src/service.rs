// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The contract between the generic lifecycle engine and a service type.
//!
//! A [`ServiceInstance`](crate::instance::ServiceInstance) owns the state
//! machine, node list and worker. Everything that differs per service type
//! (roles, storage needs, how agents are configured, extra RPC methods) lives
//! behind [`ServiceManager`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::agent::AgentClient;
use crate::args::Params;
use crate::config::Config;
use crate::credit::CreditSource;
use crate::error::Result;
use crate::iaas::IaasController;
use crate::instance::ServiceInstance;
use crate::jsonrpc::FilePart;
use crate::node::{NodeRequest, RoleCounts, ServiceNode, Volume};
use crate::services::ServiceKind;
use crate::volumes::VolumeStore;

/// How an RPC method is invoked over HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    /// Query string request, read-only.
    Get,
    /// JSON body request.
    Post,
    /// Multipart request carrying files.
    Upload,
}

/// One exposed RPC method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDecl {
    /// Method name.
    pub name: &'static str,
    /// Verb it is registered under.
    pub verb: Verb,
}

impl MethodDecl {
    /// A GET method.
    pub const fn get(name: &'static str) -> Self {
        Self {
            name,
            verb: Verb::Get,
        }
    }

    /// A POST method.
    pub const fn post(name: &'static str) -> Self {
        Self {
            name,
            verb: Verb::Post,
        }
    }

    /// An UPLOAD method.
    pub const fn upload(name: &'static str) -> Self {
        Self {
            name,
            verb: Verb::Upload,
        }
    }
}

/// Collaborators shared by every instance of one application.
#[derive(Clone)]
pub struct ManagerContext {
    /// Manager configuration.
    pub config: Arc<Config>,
    /// Cloud controller.
    pub iaas: Arc<dyn IaasController>,
    /// Agent transport.
    pub agent: Arc<dyn AgentClient>,
    /// Credit check.
    pub credits: Arc<dyn CreditSource>,
    /// Application-wide volume map.
    pub volumes: VolumeStore,
}

impl std::fmt::Debug for ManagerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerContext")
            .field("iaas", &self.iaas.controller_type())
            .field("agent", &self.agent.client_type())
            .field("volumes", &self.volumes.names())
            .finish()
    }
}

/// Service-specific behavior plugged into the lifecycle engine.
///
/// Hooks run on the instance worker. A hook error moves the instance to
/// `ERROR` with the error text as reason.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Service type.
    fn kind(&self) -> ServiceKind;

    /// Roles `add_nodes` accepts.
    fn roles(&self) -> &'static [&'static str];

    /// Nodes created by `startup`, with their roles and storage.
    fn starting_nodes(&self, ctx: &ManagerContext) -> Vec<NodeRequest>;

    /// Node specs for an `add_nodes` request, in request order.
    fn add_nodes_plan(
        &self,
        ctx: &ManagerContext,
        counts: &RoleCounts,
        existing: &[ServiceNode],
    ) -> Result<Vec<NodeRequest>>;

    /// Nodes to drop for a `remove_nodes` request.
    ///
    /// Fails with `WrongNrNodes` when the request would remove a node the
    /// service cannot do without.
    fn select_removals(&self, counts: &RoleCounts, nodes: &[ServiceNode])
    -> Result<Vec<ServiceNode>>;

    /// Configure the nodes created by `startup`.
    async fn on_start(&self, ctx: &ManagerContext, nodes: &[ServiceNode]) -> Result<()>;

    /// Stop service processes before the nodes are released.
    async fn on_stop(&self, ctx: &ManagerContext, nodes: &[ServiceNode]) -> Result<()>;

    /// Configure freshly added nodes. `existing` are the nodes that were
    /// already part of the service.
    async fn on_add_nodes(
        &self,
        ctx: &ManagerContext,
        new: &[ServiceNode],
        existing: &[ServiceNode],
    ) -> Result<()>;

    /// Unregister nodes about to be released.
    async fn on_remove_nodes(
        &self,
        ctx: &ManagerContext,
        removed: &[ServiceNode],
        remaining: &[ServiceNode],
    ) -> Result<()>;

    /// Make a newly attached volume usable on its node.
    async fn on_create_volume(
        &self,
        ctx: &ManagerContext,
        node: &ServiceNode,
        volume: &Volume,
    ) -> Result<()>;

    /// Release a volume on its node before it is detached.
    async fn on_delete_volume(
        &self,
        ctx: &ManagerContext,
        node: &ServiceNode,
        volume: &Volume,
    ) -> Result<()>;

    /// Extra fields for `get_service_info`.
    fn service_info(&self, ctx: &ManagerContext) -> Map<String, Value>;

    /// `list_nodes` result.
    fn list_nodes(&self, nodes: &[ServiceNode]) -> Value;

    /// `get_node_info` result for one node.
    fn node_info(&self, node: &ServiceNode) -> Value;

    /// Service-specific RPC methods.
    fn methods(&self) -> Vec<MethodDecl>;

    /// Run a service-specific RPC method.
    async fn call(
        &self,
        instance: &Arc<ServiceInstance>,
        method: &str,
        params: Params,
        files: Vec<FilePart>,
    ) -> Result<Value>;
}
