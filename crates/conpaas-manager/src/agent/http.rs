// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! JSON-RPC agent client.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{AgentClient, AgentError, Result};
use crate::jsonrpc::{FilePart, JsonRpcClient, RpcClientError};
use crate::node::ServiceNode;

/// Agent client talking JSON-RPC to `http://<node ip>:<port>/`.
#[derive(Debug, Clone)]
pub struct HttpAgentClient {
    rpc: JsonRpcClient,
    port: u16,
    scheme: &'static str,
}

impl HttpAgentClient {
    /// Create a client for agents listening on `port`.
    pub fn new(port: u16, timeout: Duration) -> std::result::Result<Self, RpcClientError> {
        Ok(Self {
            rpc: JsonRpcClient::new(timeout)?,
            port,
            scheme: "http",
        })
    }

    /// Use HTTPS for agent connections.
    pub fn with_tls(mut self) -> Self {
        self.scheme = "https";
        self
    }

    fn url(&self, node: &ServiceNode) -> Result<String> {
        if !node.is_booted() {
            return Err(AgentError::NotBooted(node.id.clone()));
        }
        Ok(format!("{}://{}/", self.scheme, node.addr(self.port)))
    }

    fn map_err(node: &ServiceNode, method: &str, err: RpcClientError) -> AgentError {
        match err {
            RpcClientError::Remote(message) => AgentError::Remote {
                node: node.id.clone(),
                method: method.to_string(),
                message,
            },
            RpcClientError::InvalidResponse(message) => AgentError::InvalidResponse {
                node: node.id.clone(),
                message,
            },
            other => AgentError::Unreachable {
                node: node.id.clone(),
                message: other.to_string(),
            },
        }
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    fn client_type(&self) -> &'static str {
        "http"
    }

    async fn get(&self, node: &ServiceNode, method: &str, params: Value) -> Result<Value> {
        let url = self.url(node)?;
        self.rpc
            .get(&url, method, &params)
            .await
            .map_err(|e| Self::map_err(node, method, e))
    }

    async fn post(&self, node: &ServiceNode, method: &str, params: Value) -> Result<Value> {
        let url = self.url(node)?;
        self.rpc
            .post(&url, method, &params)
            .await
            .map_err(|e| Self::map_err(node, method, e))
    }

    async fn upload(
        &self,
        node: &ServiceNode,
        method: &str,
        params: Value,
        file: FilePart,
    ) -> Result<Value> {
        let url = self.url(node)?;
        self.rpc
            .upload(&url, method, &params, file)
            .await
            .map_err(|e| Self::map_err(node, method, e))
    }
}
