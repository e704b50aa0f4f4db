// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! ConPaaS Manager
//!
//! Serves the application's RPC interface and drives its services. VMs,
//! volumes and credit come from the director; services are configured
//! through their agents.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use conpaas_manager::agent::HttpAgentClient;
use conpaas_manager::config::Config;
use conpaas_manager::credit::DirectorCredit;
use conpaas_manager::iaas::DirectorIaas;
use conpaas_manager::runtime::ManagerRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    let config = Config::from_env();

    // Initialize tracing
    init_tracing(config.as_ref().ok().and_then(|c| c.log_file.as_deref()))?;

    info!("Starting ConPaaS Manager");

    let config = config.map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        bind_addr = %config.bind_addr,
        director = %config.director_url,
        clouds = ?config.clouds,
        initial_services = ?config.initial_services,
        "Configuration loaded"
    );

    let iaas = DirectorIaas::new(&config.director_url, config.clouds.clone(), config.rpc_timeout)?;
    let agent = HttpAgentClient::new(config.agent_port, config.rpc_timeout)?;
    let credits = DirectorCredit::new(&config.director_url, config.rpc_timeout)?;

    let runtime = ManagerRuntime::builder()
        .iaas(Arc::new(iaas))
        .agent(Arc::new(agent))
        .credits(Arc::new(credits))
        .config(config)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.local_addr(), "ConPaaS Manager initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}

/// Log to stdout, and to `log_file` as well when one is configured.
fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("conpaas_manager=info".parse()?))
        .with(fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}
