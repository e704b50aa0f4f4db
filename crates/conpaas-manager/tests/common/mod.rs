// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for manager integration tests.
//!
//! Provides TestContext wiring an application manager to the in-memory
//! cloud, agent and credit doubles.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;

use conpaas_manager::ApplicationManager;
use conpaas_manager::agent::MockAgent;
use conpaas_manager::args::Params;
use conpaas_manager::config::Config;
use conpaas_manager::credit::FixedCredit;
use conpaas_manager::iaas::MockIaas;
use conpaas_manager::instance::ServiceInstance;
use conpaas_manager::jsonrpc::FilePart;
use conpaas_manager::rpc::{RpcRequest, RpcResponse, dispatch};
use conpaas_manager::service::{ManagerContext, Verb};
use conpaas_manager::state::ManagerState;
use conpaas_manager::volumes::VolumeStore;

/// Application manager plus handles on its test doubles.
pub struct TestContext {
    pub app: Arc<ApplicationManager>,
    pub iaas: MockIaas,
    pub agent: MockAgent,
    pub credits: FixedCredit,
    pub code_dir: TempDir,
}

impl TestContext {
    /// Create a context whose cloud knows `default` and `c1`.
    pub fn new() -> Self {
        let iaas = MockIaas::with_clouds(["default", "c1"]);
        Self::with_iaas(iaas)
    }

    /// Create a context on top of a prepared cloud.
    pub fn with_iaas(iaas: MockIaas) -> Self {
        let agent = MockAgent::new();
        let credits = FixedCredit::unlimited();
        let code_dir = tempfile::tempdir().expect("tempdir");
        let config = Config::default()
            .with_volume_retry(3, Duration::ZERO)
            .with_code_repo(code_dir.path())
            .with_clouds(["default", "c1"]);
        let ctx = ManagerContext {
            config: Arc::new(config),
            iaas: Arc::new(iaas.clone()),
            agent: Arc::new(agent.clone()),
            credits: Arc::new(credits.clone()),
            volumes: VolumeStore::new(),
        };
        Self {
            app: ApplicationManager::new(ctx),
            iaas,
            agent,
            credits,
            code_dir,
        }
    }

    /// Dispatch one request.
    pub async fn call(&self, verb: Verb, service_id: u32, method: &str, params: Value) -> RpcResponse {
        let params: Params = params.as_object().cloned().unwrap_or_default();
        dispatch(&self.app, verb, RpcRequest::new(service_id, method, params), Vec::new()).await
    }

    /// Dispatch an UPLOAD request.
    pub async fn upload(
        &self,
        service_id: u32,
        method: &str,
        params: Value,
        files: Vec<FilePart>,
    ) -> RpcResponse {
        let params: Params = params.as_object().cloned().unwrap_or_default();
        dispatch(&self.app, Verb::Upload, RpcRequest::new(service_id, method, params), files).await
    }

    /// Dispatch and unwrap the result.
    pub async fn ok(&self, verb: Verb, service_id: u32, method: &str, params: Value) -> Value {
        match self.call(verb, service_id, method, params).await {
            RpcResponse::Success { result, .. } => result,
            RpcResponse::Failure { error, code, .. } => {
                panic!("{} failed: {} ({})", method, error, code)
            }
        }
    }

    /// Dispatch and unwrap the error code.
    pub async fn err(&self, verb: Verb, service_id: u32, method: &str, params: Value) -> String {
        match self.call(verb, service_id, method, params).await {
            RpcResponse::Failure { code, .. } => code,
            RpcResponse::Success { result, .. } => {
                panic!("{} unexpectedly succeeded: {}", method, result)
            }
        }
    }

    /// Add a service and return its id.
    pub async fn add_service(&self, service_type: &str) -> u32 {
        let result = self
            .ok(Verb::Post, 0, "add_service", json!({ "service_type": service_type }))
            .await;
        result["service_id"].as_u64().expect("service_id") as u32
    }

    /// Add a service and start it in the `default` cloud.
    pub async fn running_service(&self, service_type: &str) -> Arc<ServiceInstance> {
        let id = self.add_service(service_type).await;
        self.ok(Verb::Post, id, "startup", json!({ "cloud": "default" }))
            .await;
        let instance = self.app.service(id).expect("service registered");
        instance.wait_idle().await;
        assert_eq!(instance.state().current(), ManagerState::Running);
        instance
    }
}

/// Wait until `instance` has no queued jobs.
pub async fn settle(instance: &ServiceInstance) -> ManagerState {
    instance.wait_idle().await;
    instance.state().current()
}

/// Poll until `check` holds, for at most two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
