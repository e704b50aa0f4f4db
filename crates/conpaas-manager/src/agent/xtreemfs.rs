// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! XtreemFS agent calls.

use serde_json::{Value, json};

use super::{AgentClient, Result};
use crate::node::ServiceNode;

/// Start a directory service.
pub async fn create_dir(agent: &dyn AgentClient, node: &ServiceNode, uuid: &str) -> Result<()> {
    agent.post(node, "createDIR", json!({ "uuid": uuid })).await?;
    Ok(())
}

/// Start a metadata server registered with the directory at `dir_ip`.
pub async fn create_mrc(
    agent: &dyn AgentClient,
    node: &ServiceNode,
    dir_ip: &str,
    uuid: &str,
) -> Result<()> {
    agent
        .post(node, "createMRC", json!({ "dir_serviceHost": dir_ip, "uuid": uuid }))
        .await?;
    Ok(())
}

/// Start an object storage device on `device_name`.
pub async fn create_osd(
    agent: &dyn AgentClient,
    node: &ServiceNode,
    dir_ip: &str,
    uuid: &str,
    mkfs: bool,
    device_name: &str,
) -> Result<()> {
    agent
        .post(
            node,
            "createOSD",
            json!({
                "dir_serviceHost": dir_ip,
                "uuid": uuid,
                "mkfs": mkfs,
                "device_name": device_name,
            }),
        )
        .await?;
    Ok(())
}

/// Stop the directory service.
pub async fn stop_dir(agent: &dyn AgentClient, node: &ServiceNode) -> Result<()> {
    agent.post(node, "stopDIR", json!({})).await?;
    Ok(())
}

/// Stop the metadata server.
pub async fn stop_mrc(agent: &dyn AgentClient, node: &ServiceNode) -> Result<()> {
    agent.post(node, "stopMRC", json!({})).await?;
    Ok(())
}

/// Stop the object storage device, optionally draining its data first.
pub async fn stop_osd(agent: &dyn AgentClient, node: &ServiceNode, drain: bool) -> Result<()> {
    agent.post(node, "stopOSD", json!({ "drain": drain })).await?;
    Ok(())
}

/// Create a file system volume.
pub async fn create_volume(
    agent: &dyn AgentClient,
    node: &ServiceNode,
    volume_name: &str,
    owner: &str,
) -> Result<()> {
    agent
        .post(
            node,
            "createVolume",
            json!({ "volumeName": volume_name, "owner": owner }),
        )
        .await?;
    Ok(())
}

/// Delete a file system volume.
pub async fn delete_volume(agent: &dyn AgentClient, node: &ServiceNode, volume_name: &str) -> Result<()> {
    agent
        .post(node, "deleteVolume", json!({ "volumeName": volume_name }))
        .await?;
    Ok(())
}

/// Listing of the file system volumes, as printed by the agent.
pub async fn list_volumes(agent: &dyn AgentClient, node: &ServiceNode) -> Result<String> {
    let result = agent.get(node, "listVolumes", json!({})).await?;
    Ok(match result.get("volumes") {
        Some(Value::String(listing)) => listing.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    })
}

/// Run `xtfsutil` with `args` on a mounted volume and return its output.
pub async fn set_policy(
    agent: &dyn AgentClient,
    node: &ServiceNode,
    volume_name: &str,
    args: &[String],
) -> Result<String> {
    let result = agent
        .post(
            node,
            "set_policy",
            json!({ "volumeName": volume_name, "args": args }),
        )
        .await?;
    Ok(result
        .get("stdout")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string())
}
