// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service types the manager can host.
//!
//! | Tag          | Roles                      | Founding node          |
//! |--------------|----------------------------|------------------------|
//! | `mysql`      | `mysql`, `glb`             | last `mysql` is kept   |
//! | `xtreemfs`   | `dir`, `mrc`, `osd`        | DIR+MRC+OSD, exempt    |
//! | `generic`    | `master`, `node`           | `master`, exempt       |
//! | `mapreduce`  | `master`, `worker`         | `master`, exempt       |
//! | `helloworld` | `helloworld`               | none                   |
//!
//! [`ServiceKind::create`] is the only place a tag turns into a
//! [`ServiceManager`].

pub mod generic;
pub mod helloworld;
pub mod mapreduce;
pub mod mysql;
pub mod xtreemfs;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ManagerError, Result};
use crate::node::ServiceNode;
use crate::service::{ManagerContext, ServiceManager};

/// Service type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Galera MySQL cluster behind GLB load balancers.
    MySql,
    /// XtreemFS distributed file system.
    XtreemFs,
    /// User-supplied code with lifecycle scripts.
    Generic,
    /// Hadoop-style master/worker cluster.
    MapReduce,
    /// Minimal demonstration service.
    HelloWorld,
}

impl ServiceKind {
    /// Every known type.
    pub const ALL: [ServiceKind; 5] = [
        Self::MySql,
        Self::XtreemFs,
        Self::Generic,
        Self::MapReduce,
        Self::HelloWorld,
    ];

    /// Wire tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::XtreemFs => "xtreemfs",
            Self::Generic => "generic",
            Self::MapReduce => "mapreduce",
            Self::HelloWorld => "helloworld",
        }
    }

    /// Build the service manager for this type.
    pub fn create(self, ctx: &ManagerContext) -> Box<dyn ServiceManager> {
        match self {
            Self::MySql => Box::new(mysql::MySqlManager::new(ctx)),
            Self::XtreemFs => Box::new(xtreemfs::XtreemFsManager::new(ctx)),
            Self::Generic => Box::new(generic::GenericManager::new(ctx)),
            Self::MapReduce => Box::new(mapreduce::MapReduceManager::new()),
            Self::HelloWorld => Box::new(helloworld::HelloWorldManager::new()),
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ManagerError::invalid(format!("service_type: unknown service type '{}'", s)))
    }
}

/// Node ids grouped by role, in node order.
pub(crate) fn ids_with_role(nodes: &[ServiceNode], role: &str) -> Value {
    Value::from(
        nodes
            .iter()
            .filter(|n| n.role == role)
            .map(|n| n.id.clone())
            .collect::<Vec<_>>(),
    )
}

/// Refuse to touch a role's founding node.
pub(crate) fn founder_guard(role: &str, count: u32) -> Result<()> {
    if count > 0 {
        return Err(ManagerError::WrongNrNodes {
            count,
            max: 0,
            role: role.to_string(),
        });
    }
    Ok(())
}
