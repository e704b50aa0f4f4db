// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock cloud controller for testing.
//!
//! Keeps VMs and volumes in memory and enforces the rules a real cloud would:
//! a device name is used once per VM, attached volumes cannot be destroyed,
//! and terminating a VM detaches its volumes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{IaasController, IaasError, Result};
use crate::agent::AgentClient;
use crate::node::ServiceNode;

/// A volume as the mock cloud sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudVolume {
    /// Cloud volume id.
    pub volume_id: String,
    /// Name given at creation.
    pub name: String,
    /// Size in MB.
    pub size: u64,
    /// VM the volume is attached to.
    pub attached_to: Option<String>,
    /// Device name of the attachment.
    pub dev_name: Option<String>,
}

#[derive(Debug, Default)]
struct CloudState {
    nodes: Vec<ServiceNode>,
    volumes: BTreeMap<String, CloudVolume>,
    destroyed: Vec<String>,
    attach_attempts: u32,
    attach_failures_left: u32,
    fail_create_nodes: bool,
}

/// Mock cloud controller for testing.
#[derive(Debug, Clone)]
pub struct MockIaas {
    state: Arc<Mutex<CloudState>>,
    clouds: Vec<String>,
    next_id: Arc<AtomicU64>,
}

impl Default for MockIaas {
    fn default() -> Self {
        Self::new()
    }
}

impl MockIaas {
    /// Create a mock cloud with a single `default` cloud.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CloudState::default())),
            clouds: vec!["default".to_string()],
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Create a mock cloud knowing the given cloud names.
    pub fn with_clouds<I, S>(clouds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            clouds: clouds.into_iter().map(Into::into).collect(),
            ..Self::new()
        }
    }

    /// Make the next `times` attach requests fail. `u32::MAX` fails forever.
    pub async fn fail_attach(&self, times: u32) {
        self.state.lock().await.attach_failures_left = times;
    }

    /// Make node creation fail.
    pub async fn fail_create_nodes(&self, fail: bool) {
        self.state.lock().await.fail_create_nodes = fail;
    }

    /// VMs currently alive.
    pub async fn live_nodes(&self) -> Vec<ServiceNode> {
        self.state.lock().await.nodes.clone()
    }

    /// Volumes currently existing.
    pub async fn volumes(&self) -> Vec<CloudVolume> {
        self.state.lock().await.volumes.values().cloned().collect()
    }

    /// Ids of destroyed volumes.
    pub async fn destroyed_volumes(&self) -> Vec<String> {
        self.state.lock().await.destroyed.clone()
    }

    /// Number of attach requests received.
    pub async fn attach_attempts(&self) -> u32 {
        self.state.lock().await.attach_attempts
    }

    fn check_cloud(&self, cloud: &str) -> Result<()> {
        if self.clouds.iter().any(|c| c == cloud) {
            Ok(())
        } else {
            Err(IaasError::Rejected(format!("unknown cloud '{}'", cloud)))
        }
    }
}

#[async_trait]
impl IaasController for MockIaas {
    fn controller_type(&self) -> &'static str {
        "mock"
    }

    fn clouds(&self) -> Vec<String> {
        self.clouds.clone()
    }

    async fn create_nodes(
        &self,
        count: usize,
        cloud: &str,
        agent: &dyn AgentClient,
    ) -> Result<Vec<ServiceNode>> {
        self.check_cloud(cloud)?;

        let created: Vec<ServiceNode> = {
            let mut state = self.state.lock().await;
            if state.fail_create_nodes {
                return Err(IaasError::Unavailable("mock node creation failure".into()));
            }
            let created: Vec<ServiceNode> = (0..count)
                .map(|_| {
                    let n = self.next_id.fetch_add(1, Ordering::SeqCst);
                    ServiceNode {
                        id: format!("node-{n}"),
                        ip: format!("10.0.{}.{}", n / 250, n % 250 + 2),
                        private_ip: format!("192.168.{}.{}", n / 250, n % 250 + 2),
                        vmid: format!("vm-{n}"),
                        cloud_name: cloud.to_string(),
                        role: String::new(),
                        volumes: Vec::new(),
                    }
                })
                .collect();
            state.nodes.extend(created.iter().cloned());
            created
        };

        for node in &created {
            if let Err(e) = agent.check_agent_process(node).await {
                let ids: Vec<&str> = created.iter().map(|n| n.id.as_str()).collect();
                self.state
                    .lock()
                    .await
                    .nodes
                    .retain(|n| !ids.contains(&n.id.as_str()));
                return Err(IaasError::NodeNotReady {
                    node: node.id.clone(),
                    reason: e.to_string(),
                });
            }
        }

        Ok(created)
    }

    async fn delete_nodes(&self, nodes: &[ServiceNode]) -> Result<()> {
        let mut state = self.state.lock().await;
        for node in nodes {
            state.nodes.retain(|n| n.id != node.id);
            for volume in state.volumes.values_mut() {
                if volume.attached_to.as_deref() == Some(node.vmid.as_str()) {
                    volume.attached_to = None;
                    volume.dev_name = None;
                }
            }
        }
        Ok(())
    }

    async fn create_volume(&self, size: u64, name: &str, vmid: &str, cloud: &str) -> Result<String> {
        self.check_cloud(cloud)?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let volume_id = format!("vol-{n}");
        let mut state = self.state.lock().await;
        if !state.nodes.iter().any(|node| node.vmid == vmid) {
            return Err(IaasError::NotFound(format!("vm {}", vmid)));
        }
        state.volumes.insert(
            volume_id.clone(),
            CloudVolume {
                volume_id: volume_id.clone(),
                name: name.to_string(),
                size,
                attached_to: None,
                dev_name: None,
            },
        );
        Ok(volume_id)
    }

    async fn attach_volume(
        &self,
        vmid: &str,
        volume_id: &str,
        dev_name: &str,
        _cloud: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.attach_attempts += 1;
        if state.attach_failures_left > 0 {
            if state.attach_failures_left != u32::MAX {
                state.attach_failures_left -= 1;
            }
            return Err(IaasError::Unavailable(format!(
                "volume {} not ready",
                volume_id
            )));
        }
        let in_use = state.volumes.values().any(|v| {
            v.attached_to.as_deref() == Some(vmid) && v.dev_name.as_deref() == Some(dev_name)
        });
        if in_use {
            return Err(IaasError::Rejected(format!(
                "device {} already in use on {}",
                dev_name, vmid
            )));
        }
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| IaasError::NotFound(format!("volume {}", volume_id)))?;
        if volume.attached_to.is_some() {
            return Err(IaasError::Rejected(format!(
                "volume {} already attached",
                volume_id
            )));
        }
        volume.attached_to = Some(vmid.to_string());
        volume.dev_name = Some(dev_name.to_string());
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &str, _cloud: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| IaasError::NotFound(format!("volume {}", volume_id)))?;
        volume.attached_to = None;
        volume.dev_name = None;
        Ok(())
    }

    async fn destroy_volume(&self, volume_id: &str, _cloud: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.volumes.get(volume_id) {
            None => Err(IaasError::NotFound(format!("volume {}", volume_id))),
            Some(v) if v.attached_to.is_some() => Err(IaasError::Rejected(format!(
                "volume {} is still attached",
                volume_id
            ))),
            Some(_) => {
                state.volumes.remove(volume_id);
                state.destroyed.push(volume_id.to_string());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgent;

    #[tokio::test]
    async fn test_create_nodes_gives_unique_booted_nodes() {
        let iaas = MockIaas::new();
        let nodes = iaas.create_nodes(3, "default", &MockAgent::new()).await.unwrap();
        assert_eq!(nodes.len(), 3);
        assert!(nodes.iter().all(ServiceNode::is_booted));
        assert_ne!(nodes[0].id, nodes[1].id);
        assert_eq!(iaas.live_nodes().await.len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_cloud_is_rejected() {
        let iaas = MockIaas::new();
        let err = iaas
            .create_nodes(1, "mars", &MockAgent::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IaasError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_failed_liveness_check_releases_nodes() {
        let iaas = MockIaas::new();
        let agent = MockAgent::new();
        agent.fail_method("check_agent_process").await;
        let err = iaas.create_nodes(2, "default", &agent).await.unwrap_err();
        assert!(matches!(err, IaasError::NodeNotReady { .. }));
        assert!(iaas.live_nodes().await.is_empty());
    }

    #[tokio::test]
    async fn test_attached_volume_cannot_be_destroyed() {
        let iaas = MockIaas::new();
        let node = iaas
            .create_nodes(1, "default", &MockAgent::new())
            .await
            .unwrap()
            .remove(0);
        let vol = iaas
            .create_volume(10, "vol-data", &node.vmid, "default")
            .await
            .unwrap();
        iaas.attach_volume(&node.vmid, &vol, "/dev/sdb", "default")
            .await
            .unwrap();

        assert!(iaas.destroy_volume(&vol, "default").await.is_err());
        iaas.detach_volume(&vol, "default").await.unwrap();
        iaas.destroy_volume(&vol, "default").await.unwrap();
        assert_eq!(iaas.destroyed_volumes().await, vec![vol]);
    }

    #[tokio::test]
    async fn test_injected_attach_failures() {
        let iaas = MockIaas::new();
        let node = iaas
            .create_nodes(1, "default", &MockAgent::new())
            .await
            .unwrap()
            .remove(0);
        let vol = iaas
            .create_volume(10, "v", &node.vmid, "default")
            .await
            .unwrap();
        iaas.fail_attach(2).await;

        assert!(iaas.attach_volume(&node.vmid, &vol, "/dev/sdb", "default").await.is_err());
        assert!(iaas.attach_volume(&node.vmid, &vol, "/dev/sdb", "default").await.is_err());
        assert!(iaas.attach_volume(&node.vmid, &vol, "/dev/sdb", "default").await.is_ok());
        assert_eq!(iaas.attach_attempts().await, 3);
    }
}
