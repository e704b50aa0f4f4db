// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! MapReduce agent calls.

use serde_json::json;

use super::{AgentClient, Result};
use crate::node::ServiceNode;

/// Start the node's daemons pointing at the master.
pub async fn startup(
    agent: &dyn AgentClient,
    node: &ServiceNode,
    master_ip: &str,
    master_private_ip: &str,
) -> Result<()> {
    agent
        .post(
            node,
            "startup",
            json!({
                "master_ip": master_ip,
                "master_private_ip": master_private_ip,
                "is_master": node.ip == master_ip,
            }),
        )
        .await?;
    Ok(())
}
