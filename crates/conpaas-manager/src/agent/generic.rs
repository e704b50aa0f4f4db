// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Generic service agent calls.

use serde_json::{Value, json};

use super::{AgentClient, Result};
use crate::jsonrpc::FilePart;
use crate::node::ServiceNode;

/// Hand the agent the full list of agents in the service.
pub async fn init_agent(
    agent: &dyn AgentClient,
    node: &ServiceNode,
    agents_info: &Value,
) -> Result<()> {
    agent
        .post(
            node,
            "init_agent",
            json!({ "agents_info": agents_info, "ip": node.ip }),
        )
        .await?;
    Ok(())
}

/// Deploy a code version. Without a file the agent restores its default code.
pub async fn update_code(
    agent: &dyn AgentClient,
    node: &ServiceNode,
    code_version_id: &str,
    filetype: &str,
    file: Option<FilePart>,
) -> Result<()> {
    let params = json!({ "codeVersionId": code_version_id, "filetype": filetype });
    match file {
        Some(file) => agent.upload(node, "update_code", params, file).await?,
        None => agent.post(node, "update_code", params).await?,
    };
    Ok(())
}

/// Run one of the user scripts (`init`, `notify`, `run`, `interrupt`, `cleanup`).
pub async fn execute_script(
    agent: &dyn AgentClient,
    node: &ServiceNode,
    command: &str,
    parameters: &str,
    agents_info: &Value,
) -> Result<()> {
    agent
        .post(
            node,
            "execute_script",
            json!({
                "command": command,
                "parameters": parameters,
                "agents_info": agents_info,
            }),
        )
        .await?;
    Ok(())
}

/// Format if needed and mount a freshly attached volume.
pub async fn mount_volume(
    agent: &dyn AgentClient,
    node: &ServiceNode,
    dev_name: &str,
    vol_name: &str,
) -> Result<()> {
    agent
        .post(
            node,
            "mount_volume",
            json!({ "dev_name": dev_name, "vol_name": vol_name }),
        )
        .await?;
    Ok(())
}

/// Unmount a volume before it is detached.
pub async fn unmount_volume(agent: &dyn AgentClient, node: &ServiceNode, vol_name: &str) -> Result<()> {
    agent
        .post(node, "unmount_volume", json!({ "vol_name": vol_name }))
        .await?;
    Ok(())
}
