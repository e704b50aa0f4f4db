// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Clients for the agents running on service nodes.
//!
//! [`AgentClient`] is the transport: a fallible GET/POST/UPLOAD call against
//! one node. The per-service submodules wrap it in typed calls.
//!
//! - [`HttpAgentClient`]: JSON-RPC over HTTP to `http://<ip>:<agent port>/`
//! - [`MockAgent`]: in-memory agent for tests

mod http;
mod mock;

pub mod generic;
pub mod helloworld;
pub mod mapreduce;
pub mod mysql;
pub mod xtreemfs;

pub use http::HttpAgentClient;
pub use mock::{AgentCall, MockAgent};

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;

use crate::jsonrpc::FilePart;
use crate::node::ServiceNode;

/// Errors from agent calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AgentError {
    /// The agent ran the method and reported a failure.
    #[error("{method} failed on node {node}: {message}")]
    Remote {
        /// Node id.
        node: String,
        /// Method called.
        method: String,
        /// Message reported by the agent.
        message: String,
    },

    /// The agent could not be reached.
    #[error("cannot reach agent on node {node}: {message}")]
    Unreachable {
        /// Node id.
        node: String,
        /// Transport error.
        message: String,
    },

    /// The node has no address yet.
    #[error("node {0} has not booted yet")]
    NotBooted(String),

    /// The agent answered with something unexpected.
    #[error("invalid response from node {node}: {message}")]
    InvalidResponse {
        /// Node id.
        node: String,
        /// What was wrong.
        message: String,
    },
}

/// Result type for agent calls.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Trait for agent transports.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Client type identifier (e.g. "http", "mock").
    fn client_type(&self) -> &'static str;

    /// Call a query method on the node's agent.
    async fn get(&self, node: &ServiceNode, method: &str, params: Value) -> Result<Value>;

    /// Call a mutating method on the node's agent.
    async fn post(&self, node: &ServiceNode, method: &str, params: Value) -> Result<Value>;

    /// Send a file to the node's agent.
    async fn upload(
        &self,
        node: &ServiceNode,
        method: &str,
        params: Value,
        file: FilePart,
    ) -> Result<Value>;

    /// Liveness check used while nodes boot.
    async fn check_agent_process(&self, node: &ServiceNode) -> Result<()> {
        self.get(node, "check_agent_process", json!({})).await?;
        Ok(())
    }

    /// Fetch a log file from the agent.
    async fn get_log(&self, node: &ServiceNode, filename: Option<&str>) -> Result<String> {
        let params = match filename {
            Some(f) => json!({ "filename": f }),
            None => json!({}),
        };
        let result = self.get(node, "get_log", params).await?;
        Ok(match result.get("log") {
            Some(Value::String(log)) => log.clone(),
            _ => match result {
                Value::String(log) => log,
                other => other.to_string(),
            },
        })
    }

    /// Status of every user script on the node, keyed by script name.
    async fn get_script_status(&self, node: &ServiceNode) -> Result<HashMap<String, String>> {
        let result = self.get(node, "get_script_status", json!({})).await?;
        let scripts = result
            .get("scripts")
            .and_then(Value::as_object)
            .ok_or_else(|| AgentError::InvalidResponse {
                node: node.id.clone(),
                message: "missing 'scripts' in script status".to_string(),
            })?;
        Ok(scripts
            .iter()
            .map(|(name, status)| {
                let status = status.as_str().map(String::from).unwrap_or_else(|| status.to_string());
                (name.clone(), status)
            })
            .collect())
    }

    /// Stop the agent's service processes.
    async fn stop(&self, node: &ServiceNode) -> Result<()> {
        self.post(node, "stop", json!({})).await?;
        Ok(())
    }
}
