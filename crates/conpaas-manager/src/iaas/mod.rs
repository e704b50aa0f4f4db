// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloud controllers.
//!
//! The manager never talks to a cloud provider directly. VMs and volumes are
//! requested through an [`IaasController`]:
//!
//! - [`DirectorIaas`]: forwards requests to the director's callback endpoint
//! - [`MockIaas`]: in-memory cloud for tests

mod director;
mod mock;

pub use director::DirectorIaas;
pub use mock::{CloudVolume, MockIaas};

use async_trait::async_trait;
use thiserror::Error;

use crate::agent::AgentClient;
use crate::node::ServiceNode;

/// Errors from cloud requests.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IaasError {
    /// The controller could not be reached or failed internally.
    #[error("cloud controller unavailable: {0}")]
    Unavailable(String),

    /// The request was refused (quota, bad cloud name, ...).
    #[error("request rejected: {0}")]
    Rejected(String),

    /// A VM or volume does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Nodes were created but never answered the liveness check.
    #[error("node {node} did not come up: {reason}")]
    NodeNotReady {
        /// Node id.
        node: String,
        /// Last liveness check error.
        reason: String,
    },

    /// The controller answered with something unexpected.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Result type for cloud requests.
pub type Result<T> = std::result::Result<T, IaasError>;

/// Trait for cloud controllers.
///
/// Implementations are pure resource brokers: they know nothing about
/// services, roles or manager state.
#[async_trait]
pub trait IaasController: Send + Sync {
    /// Controller type identifier (e.g. "director", "mock").
    fn controller_type(&self) -> &'static str;

    /// Names of the clouds nodes may be placed in.
    fn clouds(&self) -> Vec<String>;

    /// Create `count` VMs in `cloud`.
    ///
    /// Returns once every node answers `agent`'s liveness check. Returned
    /// nodes carry no role.
    async fn create_nodes(
        &self,
        count: usize,
        cloud: &str,
        agent: &dyn AgentClient,
    ) -> Result<Vec<ServiceNode>>;

    /// Terminate VMs.
    async fn delete_nodes(&self, nodes: &[ServiceNode]) -> Result<()>;

    /// Create a volume next to VM `vmid`, returning the cloud volume id.
    async fn create_volume(&self, size: u64, name: &str, vmid: &str, cloud: &str) -> Result<String>;

    /// Attach a volume to a VM as `dev_name`.
    async fn attach_volume(&self, vmid: &str, volume_id: &str, dev_name: &str, cloud: &str)
    -> Result<()>;

    /// Detach a volume from whatever VM it is attached to.
    async fn detach_volume(&self, volume_id: &str, cloud: &str) -> Result<()>;

    /// Destroy a detached volume.
    async fn destroy_volume(&self, volume_id: &str, cloud: &str) -> Result<()>;
}
