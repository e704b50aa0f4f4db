// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node and volume records.

use serde::{Deserialize, Serialize};

use crate::error::{ManagerError, Result};

/// A provisioned VM taking part in a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNode {
    /// Opaque node identifier, unique within the application.
    pub id: String,
    /// Public address. Empty until the VM has booted.
    pub ip: String,
    /// Private address inside the cloud network.
    #[serde(default)]
    pub private_ip: String,
    /// Identifier of the VM at the cloud provider.
    pub vmid: String,
    /// Cloud the VM lives in.
    pub cloud_name: String,
    /// Service-defined role, fixed once assigned.
    pub role: String,
    /// Attached volumes in attachment order.
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

impl ServiceNode {
    /// Whether the VM has an address and can receive agent calls.
    pub fn is_booted(&self) -> bool {
        !self.ip.is_empty()
    }

    /// `ip:port` address string.
    pub fn addr(&self, port: u16) -> String {
        format!("{}:{}", self.ip, port)
    }
}

/// A block volume attached to one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Unique name within the application.
    pub volume_name: String,
    /// Cloud-assigned identifier.
    pub volume_id: String,
    /// Size in MB.
    pub volume_size: u64,
    /// Id of the node it is attached to.
    pub agent_id: String,
    /// Device path on the node.
    pub dev_name: String,
    /// Cloud holding the volume.
    pub cloud: String,
}

/// Storage a new node must get right after it is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRequest {
    /// Name prefix; the node id is appended (`osd` becomes `osd-<id>`).
    pub prefix: String,
    /// Size in MB.
    pub size: u64,
}

impl VolumeRequest {
    /// Create a request for a `<prefix>-<node id>` volume.
    pub fn new(prefix: impl Into<String>, size: u64) -> Self {
        Self {
            prefix: prefix.into(),
            size,
        }
    }

    /// Volume name for the given node.
    pub fn name_for(&self, node: &ServiceNode) -> String {
        format!("{}-{}", self.prefix, node.id)
    }
}

/// What a service wants for one node it is about to get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRequest {
    /// Role the node will have.
    pub role: String,
    /// Volumes to create and attach.
    pub volumes: Vec<VolumeRequest>,
}

impl NodeRequest {
    /// A node without storage.
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            volumes: Vec::new(),
        }
    }

    /// Attach a volume to the request.
    pub fn with_volume(mut self, volume: VolumeRequest) -> Self {
        self.volumes.push(volume);
        self
    }
}

/// Role to count mapping in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoleCounts(Vec<(String, u32)>);

impl RoleCounts {
    /// Build from pairs, merging duplicates into the first occurrence.
    pub fn new<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let mut counts = Self::default();
        for (role, count) in pairs {
            let role = role.into();
            match counts.0.iter_mut().find(|(r, _)| *r == role) {
                Some((_, c)) => *c = c.saturating_add(count),
                None => counts.0.push((role, count)),
            }
        }
        counts
    }

    /// Requested count for `role`, 0 when absent.
    pub fn get(&self, role: &str) -> u32 {
        self.0
            .iter()
            .find(|(r, _)| r == role)
            .map(|(_, c)| *c)
            .unwrap_or(0)
    }

    /// Sum of all counts. Fails when the sum does not fit in a `u32`.
    pub fn total(&self) -> Result<u32> {
        self.0
            .iter()
            .try_fold(0u32, |sum, (_, c)| sum.checked_add(*c))
            .ok_or_else(|| ManagerError::invalid("nodes: too many nodes requested"))
    }

    /// Iterate in request order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.0.iter().map(|(r, c)| (r.as_str(), *c))
    }

    /// One role name per requested node, in request order.
    pub fn expand(&self) -> Vec<String> {
        self.0
            .iter()
            .flat_map(|(r, c)| std::iter::repeat_n(r.clone(), *c as usize))
            .collect()
    }
}

/// Pick `count` nodes of `role` from the tail of `nodes`.
///
/// When `keep_first` is set the first node with that role is never picked,
/// so at most `len - 1` are available.
pub fn take_last_of_role<'a>(
    nodes: &'a [ServiceNode],
    role: &str,
    count: u32,
    keep_first: bool,
) -> Option<Vec<&'a ServiceNode>> {
    let with_role: Vec<&ServiceNode> = nodes.iter().filter(|n| n.role == role).collect();
    let skip = usize::from(keep_first && !with_role.is_empty());
    let available = with_role.len() - skip;
    if count as usize > available {
        return None;
    }
    Some(with_role.into_iter().rev().take(count as usize).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, role: &str) -> ServiceNode {
        ServiceNode {
            id: id.into(),
            ip: format!("10.0.0.{}", id.len()),
            private_ip: String::new(),
            vmid: format!("vm-{id}"),
            cloud_name: "default".into(),
            role: role.into(),
            volumes: vec![],
        }
    }

    #[test]
    fn test_role_counts_keep_request_order() {
        let counts = RoleCounts::new([("glb", 1), ("mysql", 2), ("glb", 1)]);
        assert_eq!(counts.total().unwrap(), 4);
        assert_eq!(counts.get("glb"), 2);
        assert_eq!(counts.get("osd"), 0);
        assert_eq!(counts.expand(), vec!["glb", "glb", "mysql", "mysql"]);
    }

    #[test]
    fn test_total_overflow_is_invalid() {
        let counts = RoleCounts::new([("mysql", u32::MAX), ("glb", 1)]);
        let err = counts.total().unwrap_err();
        assert_eq!(err.error_code(), "E_ARGS_INVALID");
    }

    #[test]
    fn test_take_last_of_role_is_lifo() {
        let nodes = vec![
            node("a", "node"),
            node("b", "node"),
            node("m", "master"),
            node("c", "node"),
        ];
        let picked = take_last_of_role(&nodes, "node", 2, false).unwrap();
        let ids: Vec<_> = picked.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[test]
    fn test_take_last_of_role_keeps_first() {
        let nodes = vec![node("a", "osd"), node("b", "osd")];
        assert!(take_last_of_role(&nodes, "osd", 2, true).is_none());
        let picked = take_last_of_role(&nodes, "osd", 1, true).unwrap();
        assert_eq!(picked[0].id, "b");
        assert_eq!(take_last_of_role(&nodes, "glb", 0, true).unwrap().len(), 0);
    }

    #[test]
    fn test_volume_serializes_camel_case() {
        let vol = Volume {
            volume_name: "data".into(),
            volume_id: "vol-1".into(),
            volume_size: 10,
            agent_id: "n1".into(),
            dev_name: "/dev/sdb".into(),
            cloud: "default".into(),
        };
        let json = serde_json::to_value(&vol).unwrap();
        assert_eq!(json["volumeName"], "data");
        assert_eq!(json["agentId"], "n1");
        assert_eq!(json["devName"], "/dev/sdb");
    }

    #[test]
    fn test_volume_request_name() {
        let req = VolumeRequest::new("osd", 1024);
        assert_eq!(req.name_for(&node("n7", "osd")), "osd-n7");
    }
}
