// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock agent for testing.
//!
//! Records every call and answers from canned responses, so tests can assert
//! which nodes were configured and in what order.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Mutex;

use super::{AgentClient, AgentError, Result};
use crate::jsonrpc::FilePart;
use crate::node::ServiceNode;

/// One recorded agent call.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCall {
    /// Node the call went to.
    pub node_id: String,
    /// Method name.
    pub method: String,
    /// Parameters sent.
    pub params: Value,
    /// Name of the uploaded file, for UPLOAD calls.
    pub filename: Option<String>,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<AgentCall>,
    responses: HashMap<String, Value>,
    failures: HashMap<String, Option<String>>,
}

/// Mock agent client for testing.
#[derive(Debug, Clone, Default)]
pub struct MockAgent {
    state: Arc<Mutex<MockState>>,
}

impl MockAgent {
    /// Create a mock agent where every call succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `method` fail on every node.
    pub async fn fail_method(&self, method: &str) {
        self.state
            .lock()
            .await
            .failures
            .insert(method.to_string(), None);
    }

    /// Make `method` fail on one node only.
    pub async fn fail_method_on(&self, method: &str, node_id: &str) {
        self.state
            .lock()
            .await
            .failures
            .insert(method.to_string(), Some(node_id.to_string()));
    }

    /// Remove an injected failure.
    pub async fn clear_failure(&self, method: &str) {
        self.state.lock().await.failures.remove(method);
    }

    /// Answer `method` with `result`.
    pub async fn respond(&self, method: &str, result: Value) {
        self.state
            .lock()
            .await
            .responses
            .insert(method.to_string(), result);
    }

    /// All recorded calls, oldest first.
    pub async fn calls(&self) -> Vec<AgentCall> {
        self.state.lock().await.calls.clone()
    }

    /// Recorded calls of one method.
    pub async fn calls_to(&self, method: &str) -> Vec<AgentCall> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    async fn handle(
        &self,
        node: &ServiceNode,
        method: &str,
        params: Value,
        filename: Option<String>,
    ) -> Result<Value> {
        let mut state = self.state.lock().await;
        state.calls.push(AgentCall {
            node_id: node.id.clone(),
            method: method.to_string(),
            params,
            filename,
        });

        if let Some(target) = state.failures.get(method) {
            let applies = target.as_deref().is_none_or(|id| id == node.id);
            if applies {
                return Err(AgentError::Remote {
                    node: node.id.clone(),
                    method: method.to_string(),
                    message: "mock failure".to_string(),
                });
            }
        }

        if let Some(result) = state.responses.get(method) {
            return Ok(result.clone());
        }

        Ok(match method {
            "get_log" => json!({ "log": format!("log of {}", node.id) }),
            "get_script_status" => json!({ "scripts": {} }),
            "get_helloworld" => json!({ "result": "Hello World" }),
            _ => json!({}),
        })
    }
}

#[async_trait]
impl AgentClient for MockAgent {
    fn client_type(&self) -> &'static str {
        "mock"
    }

    async fn get(&self, node: &ServiceNode, method: &str, params: Value) -> Result<Value> {
        self.handle(node, method, params, None).await
    }

    async fn post(&self, node: &ServiceNode, method: &str, params: Value) -> Result<Value> {
        self.handle(node, method, params, None).await
    }

    async fn upload(
        &self,
        node: &ServiceNode,
        method: &str,
        params: Value,
        file: FilePart,
    ) -> Result<Value> {
        self.handle(node, method, params, Some(file.filename)).await
    }
}
