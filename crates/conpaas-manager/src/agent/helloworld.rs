// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HelloWorld agent calls.

use serde_json::{Value, json};

use super::{AgentClient, Result};
use crate::node::ServiceNode;

/// Start the agent's hello world process.
pub async fn startup(agent: &dyn AgentClient, node: &ServiceNode) -> Result<()> {
    agent.post(node, "startup", json!({})).await?;
    Ok(())
}

/// Fetch the agent's greeting.
pub async fn get_helloworld(agent: &dyn AgentClient, node: &ServiceNode) -> Result<String> {
    let result = agent.get(node, "get_helloworld", json!({})).await?;
    Ok(result
        .get("result")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| result.to_string()))
}
