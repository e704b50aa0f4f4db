// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable manager runtime.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use conpaas_manager::runtime::ManagerRuntime;
//! use conpaas_manager::iaas::MockIaas;
//! use conpaas_manager::agent::MockAgent;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = ManagerRuntime::builder()
//!         .iaas(Arc::new(MockIaas::new()))
//!         .agent(Arc::new(MockAgent::new()))
//!         .bind_addr("127.0.0.1:0".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     println!("listening on {}", runtime.local_addr());
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::agent::AgentClient;
use crate::application::ApplicationManager;
use crate::config::Config;
use crate::credit::{CreditSource, FixedCredit};
use crate::iaas::IaasController;
use crate::server;
use crate::service::ManagerContext;
use crate::volumes::VolumeStore;

/// Builder for creating a [`ManagerRuntime`].
#[derive(Default)]
pub struct ManagerRuntimeBuilder {
    iaas: Option<Arc<dyn IaasController>>,
    agent: Option<Arc<dyn AgentClient>>,
    credits: Option<Arc<dyn CreditSource>>,
    config: Option<Config>,
    bind_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for ManagerRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerRuntimeBuilder")
            .field("iaas", &self.iaas.as_ref().map(|i| i.controller_type()))
            .field("agent", &self.agent.as_ref().map(|a| a.client_type()))
            .field("credits", &self.credits.as_ref().map(|_| "..."))
            .field("bind_addr", &self.bind_addr)
            .finish()
    }
}

impl ManagerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cloud controller (required).
    pub fn iaas(mut self, iaas: Arc<dyn IaasController>) -> Self {
        self.iaas = Some(iaas);
        self
    }

    /// Set the agent transport (required).
    pub fn agent(mut self, agent: Arc<dyn AgentClient>) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Set the credit source.
    ///
    /// Default: unlimited credit.
    pub fn credits(mut self, credits: Arc<dyn CreditSource>) -> Self {
        self.credits = Some(credits);
        self
    }

    /// Set the configuration.
    ///
    /// Default: [`Config::default`].
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Override the RPC listen address from the configuration.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ManagerRuntimeConfig> {
        let iaas = self
            .iaas
            .ok_or_else(|| anyhow::anyhow!("iaas controller is required"))?;
        let agent = self
            .agent
            .ok_or_else(|| anyhow::anyhow!("agent client is required"))?;
        let credits = self
            .credits
            .unwrap_or_else(|| Arc::new(FixedCredit::unlimited()));
        let mut config = self.config.unwrap_or_default();
        if let Some(addr) = self.bind_addr {
            config.bind_addr = addr;
        }

        Ok(ManagerRuntimeConfig {
            ctx: ManagerContext {
                config: Arc::new(config),
                iaas,
                agent,
                credits,
                volumes: VolumeStore::new(),
            },
        })
    }
}

/// Configuration for a [`ManagerRuntime`].
#[derive(Debug)]
pub struct ManagerRuntimeConfig {
    ctx: ManagerContext,
}

impl ManagerRuntimeConfig {
    /// Create the application manager, bind the listener and spawn the
    /// RPC server task.
    pub async fn start(self) -> Result<ManagerRuntime> {
        let bind_addr = self.ctx.config.bind_addr;
        let app = ApplicationManager::boot(self.ctx)?;
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let shutdown = async move {
            while !*shutdown_rx.borrow() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
        };
        let server_handle = tokio::spawn(server::serve(listener, Arc::clone(&app), shutdown));

        info!(addr = %local_addr, "ManagerRuntime started");

        Ok(ManagerRuntime {
            server_handle,
            shutdown_tx,
            app,
            local_addr,
        })
    }
}

/// A running manager: RPC server plus application state.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination. Cloud
/// resources are left as they are; use `stopall` to release them first.
pub struct ManagerRuntime {
    server_handle: JoinHandle<Result<()>>,
    shutdown_tx: watch::Sender<bool>,
    app: Arc<ApplicationManager>,
    local_addr: SocketAddr,
}

impl ManagerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ManagerRuntimeBuilder {
        ManagerRuntimeBuilder::new()
    }

    /// Address the RPC server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The application manager.
    pub fn app(&self) -> &Arc<ApplicationManager> {
        &self.app
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops accepting requests, waits for the server task, then stops
    /// every instance worker after its queued jobs.
    pub async fn shutdown(self) -> Result<()> {
        info!("ManagerRuntime shutting down...");

        let _ = self.shutdown_tx.send(true);

        let served = match self.server_handle.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("ManagerRuntime server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("ManagerRuntime server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        };

        self.app.stop_workers().await;
        info!("ManagerRuntime shutdown complete");
        served
    }

    /// Check if the server is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgent;
    use crate::iaas::MockIaas;

    #[test]
    fn test_build_requires_collaborators() {
        let err = ManagerRuntime::builder().build().unwrap_err();
        assert!(err.to_string().contains("iaas"));

        let err = ManagerRuntime::builder()
            .iaas(Arc::new(MockIaas::new()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("agent"));
    }

    #[tokio::test]
    async fn test_start_creates_initial_services_and_shuts_down() {
        let mut config = Config::default();
        config.initial_services = vec!["helloworld".into(), "mysql".into()];
        let runtime = ManagerRuntime::builder()
            .iaas(Arc::new(MockIaas::new()))
            .agent(Arc::new(MockAgent::new()))
            .config(config)
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert_ne!(runtime.local_addr().port(), 0);
        assert!(runtime.is_running());
        let kinds: Vec<&str> = runtime
            .app()
            .services()
            .iter()
            .map(|s| s.kind().as_str())
            .collect();
        assert_eq!(kinds, vec!["helloworld", "mysql"]);

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_initial_service_fails_start() {
        let mut config = Config::default();
        config.initial_services = vec!["php".into()];
        let result = ManagerRuntime::builder()
            .iaas(Arc::new(MockIaas::new()))
            .agent(Arc::new(MockAgent::new()))
            .config(config)
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .build()
            .unwrap()
            .start()
            .await;
        assert!(result.is_err());
    }
}
