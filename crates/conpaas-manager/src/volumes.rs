// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Application-wide volume bookkeeping and the cloud volume lifecycle.
//!
//! Volume names are unique across the whole application, not per service.
//! A name is reserved while its volume is being created so that two
//! concurrent `create_volume` calls cannot both pass the uniqueness check.
//!
//! Attach, detach and destroy are retried under a [`RetryPolicy`]; volume
//! creation is attempted once.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, LazyLock, Mutex};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::error::{ManagerError, Result};
use crate::iaas::{IaasController, IaasError};
use crate::node::{ServiceNode, Volume};
use crate::state::lock;

#[derive(Debug, Default)]
struct VolumeIndex {
    volumes: BTreeMap<String, Volume>,
    reserved: BTreeSet<String>,
}

/// Shared map of volume name to volume.
#[derive(Debug, Clone, Default)]
pub struct VolumeStore {
    inner: Arc<Mutex<VolumeIndex>>,
}

impl VolumeStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `name` for a volume about to be created.
    pub fn reserve(&self, name: &str) -> Result<()> {
        let mut index = lock(&self.inner);
        if index.volumes.contains_key(name) || index.reserved.contains(name) {
            return Err(ManagerError::invalid(format!(
                "volumeName: '{}' already exists",
                name
            )));
        }
        index.reserved.insert(name.to_string());
        Ok(())
    }

    /// Drop a reservation whose volume was never created.
    pub fn release(&self, name: &str) {
        lock(&self.inner).reserved.remove(name);
    }

    /// Record a created volume, clearing its reservation.
    pub fn insert(&self, volume: Volume) {
        let mut index = lock(&self.inner);
        index.reserved.remove(&volume.volume_name);
        index.volumes.insert(volume.volume_name.clone(), volume);
    }

    /// Forget a volume.
    pub fn remove(&self, name: &str) -> Option<Volume> {
        lock(&self.inner).volumes.remove(name)
    }

    /// Look a volume up by name.
    pub fn get(&self, name: &str) -> Option<Volume> {
        lock(&self.inner).volumes.get(name).cloned()
    }

    /// All volumes ordered by name.
    pub fn list(&self) -> Vec<Volume> {
        lock(&self.inner).volumes.values().cloned().collect()
    }

    /// Names of all volumes.
    pub fn names(&self) -> Vec<String> {
        lock(&self.inner).volumes.keys().cloned().collect()
    }

    /// Volumes attached to the given node.
    pub fn for_node(&self, node_id: &str) -> Vec<Volume> {
        lock(&self.inner)
            .volumes
            .values()
            .filter(|v| v.agent_id == node_id)
            .cloned()
            .collect()
    }
}

static VOLUME_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").ok());

/// Reject volume names outside `[A-Za-z0-9_-]`.
pub fn check_volume_name(name: &str) -> Result<()> {
    let valid = VOLUME_NAME.as_ref().is_some_and(|re| re.is_match(name));
    if valid {
        Ok(())
    } else {
        Err(ManagerError::invalid(
            "Volume name contains invalid characters",
        ))
    }
}

/// First device name not in `in_use`, starting at `target` and bumping its
/// last character (`/dev/sdb`, `/dev/sdc`, ...).
pub fn next_device(target: &str, in_use: &[String]) -> String {
    let mut dev = target.to_string();
    while in_use.iter().any(|d| *d == dev) {
        let Some(last) = dev.pop() else { break };
        let next = char::from_u32(last as u32 + 1).unwrap_or(last);
        dev.push(next);
    }
    dev
}

/// Run `op` until it succeeds or the policy's attempts are used up.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    mut op: F,
) -> std::result::Result<T, IaasError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, IaasError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                info!(attempt, max_attempts = attempts, error = %e, "{} failed, retrying", what);
                tokio::time::sleep(policy.backoff).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(attempts, error = %e, "{} failed, giving up", what);
                return Err(e);
            }
        }
    }
}

/// A volume to create next to a node.
#[derive(Debug, Clone)]
pub struct NewVolume<'a> {
    /// Name recorded in the volume map.
    pub name: &'a str,
    /// Name given to the cloud volume.
    pub cloud_name: &'a str,
    /// Size in MB.
    pub size: u64,
}

/// Create a cloud volume and attach it to `node` on a free device.
///
/// The cloud volume is destroyed again when attaching fails.
pub async fn create_and_attach(
    iaas: &dyn IaasController,
    retry: RetryPolicy,
    dev_target: &str,
    node: &ServiceNode,
    request: NewVolume<'_>,
) -> std::result::Result<Volume, IaasError> {
    info!(node_id = %node.id, volume = request.name, size = request.size, "Creating volume");
    let volume_id = iaas
        .create_volume(request.size, request.cloud_name, &node.vmid, &node.cloud_name)
        .await?;

    let in_use: Vec<String> = node.volumes.iter().map(|v| v.dev_name.clone()).collect();
    let dev_name = next_device(dev_target, &in_use);
    debug!(volume_id = %volume_id, vmid = %node.vmid, dev_name = %dev_name, "Attaching volume");

    let attached = with_retry(retry, "attach_volume", || {
        iaas.attach_volume(&node.vmid, &volume_id, &dev_name, &node.cloud_name)
    })
    .await;

    if let Err(e) = attached {
        warn!(volume_id = %volume_id, node_id = %node.id, error = %e, "Attach failed, destroying volume");
        if let Err(destroy_err) = with_retry(retry, "destroy_volume", || {
            iaas.destroy_volume(&volume_id, &node.cloud_name)
        })
        .await
        {
            warn!(volume_id = %volume_id, error = %destroy_err, "Failed to destroy unattached volume");
        }
        return Err(e);
    }

    Ok(Volume {
        volume_name: request.name.to_string(),
        volume_id,
        volume_size: request.size,
        agent_id: node.id.clone(),
        dev_name,
        cloud: node.cloud_name.clone(),
    })
}

/// Detach and destroy a volume.
pub async fn detach_and_destroy(
    iaas: &dyn IaasController,
    retry: RetryPolicy,
    volume: &Volume,
) -> std::result::Result<(), IaasError> {
    info!(volume = %volume.volume_name, volume_id = %volume.volume_id, "Releasing volume");
    with_retry(retry, "detach_volume", || {
        iaas.detach_volume(&volume.volume_id, &volume.cloud)
    })
    .await?;
    with_retry(retry, "destroy_volume", || {
        iaas.destroy_volume(&volume.volume_id, &volume.cloud)
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::agent::MockAgent;
    use crate::iaas::MockIaas;

    fn quick() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            backoff: Duration::ZERO,
        }
    }

    #[test]
    fn test_next_device_skips_used_names() {
        assert_eq!(next_device("/dev/sdb", &[]), "/dev/sdb");
        let used = vec!["/dev/sdb".to_string(), "/dev/sdc".to_string()];
        assert_eq!(next_device("/dev/sdb", &used), "/dev/sdd");
    }

    #[test]
    fn test_volume_names() {
        assert!(check_volume_name("data_01-x").is_ok());
        assert!(check_volume_name("bad name").is_err());
        assert!(check_volume_name("../etc").is_err());
        assert!(check_volume_name("").is_err());
    }

    #[test]
    fn test_reservation_blocks_duplicates() {
        let store = VolumeStore::new();
        store.reserve("data").unwrap();
        assert!(store.reserve("data").is_err());
        store.release("data");
        store.reserve("data").unwrap();
    }

    #[tokio::test]
    async fn test_retry_stops_at_first_success() {
        let calls = AtomicU32::new(0);
        let value = with_retry(quick(), "op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(IaasError::Unavailable("busy".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attach_failure_destroys_cloud_volume() {
        let iaas = MockIaas::new();
        let node = iaas
            .create_nodes(1, "default", &MockAgent::new())
            .await
            .unwrap()
            .remove(0);
        iaas.fail_attach(u32::MAX).await;

        let err = create_and_attach(
            &iaas,
            quick(),
            "/dev/sdb",
            &node,
            NewVolume {
                name: "data",
                cloud_name: "vol-data",
                size: 10,
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, IaasError::Unavailable(_)));
        assert_eq!(iaas.attach_attempts().await, 3);
        assert!(iaas.volumes().await.is_empty());
        assert_eq!(iaas.destroyed_volumes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_create_then_release() {
        let iaas = MockIaas::new();
        let node = iaas
            .create_nodes(1, "default", &MockAgent::new())
            .await
            .unwrap()
            .remove(0);

        let volume = create_and_attach(
            &iaas,
            quick(),
            "/dev/sdb",
            &node,
            NewVolume {
                name: "data",
                cloud_name: "vol-data",
                size: 10,
            },
        )
        .await
        .unwrap();
        assert_eq!(volume.dev_name, "/dev/sdb");
        assert_eq!(volume.agent_id, node.id);

        detach_and_destroy(&iaas, quick(), &volume).await.unwrap();
        assert!(iaas.volumes().await.is_empty());
    }
}
