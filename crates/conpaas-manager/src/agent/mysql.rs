// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! MySQL/Galera agent calls.

use serde_json::{Value, json};

use super::{AgentClient, Result};
use crate::jsonrpc::FilePart;
use crate::node::ServiceNode;

/// Port mysqld listens on.
pub const MYSQL_PORT: u16 = 3306;

/// Start mysqld, joining the Galera cluster formed by `peers`.
///
/// An empty peer list bootstraps a new cluster.
pub async fn start_mysqld(
    agent: &dyn AgentClient,
    node: &ServiceNode,
    peers: &[String],
    device_name: &str,
    password: &str,
) -> Result<()> {
    let params = json!({
        "nodes": peers,
        "device_name": device_name,
        "password": password,
    });
    agent.post(node, "start_mysqld", params).await?;
    Ok(())
}

/// Start the load balancer with the given `ip:port` backends.
pub async fn start_glbd(agent: &dyn AgentClient, node: &ServiceNode, backends: &[String]) -> Result<()> {
    agent
        .post(node, "start_glbd", json!({ "nodes": backends }))
        .await?;
    Ok(())
}

/// Add backends to a running load balancer.
pub async fn add_glbd_nodes(
    agent: &dyn AgentClient,
    node: &ServiceNode,
    backends: &[String],
) -> Result<()> {
    agent
        .post(node, "add_glbd_nodes", json!({ "nodesIp": backends }))
        .await?;
    Ok(())
}

/// Remove backends from a running load balancer.
pub async fn remove_glbd_nodes(
    agent: &dyn AgentClient,
    node: &ServiceNode,
    backends: &[String],
) -> Result<()> {
    agent
        .post(node, "remove_glbd_nodes", json!({ "nodesIp": backends }))
        .await?;
    Ok(())
}

/// Change a database user's password.
pub async fn set_password(
    agent: &dyn AgentClient,
    node: &ServiceNode,
    user: &str,
    password: &str,
) -> Result<()> {
    agent
        .post(
            node,
            "set_password",
            json!({ "username": user, "password": password }),
        )
        .await?;
    Ok(())
}

/// Load an SQL dump into the cluster.
pub async fn load_dump(agent: &dyn AgentClient, node: &ServiceNode, dump: FilePart) -> Result<()> {
    agent.upload(node, "load_dump", json!({}), dump).await?;
    Ok(())
}

/// Dump all databases.
pub async fn sqldump(agent: &dyn AgentClient, node: &ServiceNode) -> Result<String> {
    let result = agent.get(node, "sqldump", json!({})).await?;
    Ok(match result {
        Value::String(dump) => dump,
        other => other
            .get("dump")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}
