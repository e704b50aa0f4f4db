// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! ConPaaS Manager - Application and Service Lifecycle Engine
//!
//! The manager runs on the first VM of a ConPaaS application. It hosts one
//! or more services (MySQL, XtreemFS, Generic, MapReduce, HelloWorld),
//! provisions their VMs and volumes through the director, and configures
//! the agents running on those VMs.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │   Clients (frontend, CLI)    │
//! └──────────────────────────────┘
//!                │ JSON-RPC over HTTP
//!                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    conpaas-manager (this crate)              │
//! │                                                              │
//! │  ApplicationManager (service 0)                              │
//! │    ├── ServiceInstance 1 ── worker ── ServiceManager hooks   │
//! │    ├── ServiceInstance 2 ── worker ── ServiceManager hooks   │
//! │    └── VolumeStore (application-wide)                        │
//! └──────────────────────────────────────────────────────────────┘
//!        │ IaasController                     │ AgentClient
//!        ▼                                    ▼
//! ┌──────────────────┐              ┌─────────────────────────┐
//! │ Director / cloud │              │ Agents on service VMs   │
//! └──────────────────┘              └─────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! ```text
//!   INIT ──startup──► PROLOGUE ──► RUNNING ◄──► ADAPTING
//!    ▲                                │
//!    │                             shutdown
//!    │                                ▼
//! STOPPED ◄───────────────────── EPILOGUE
//!
//!   any job failure ──► ERROR ──shutdown──► EPILOGUE
//! ```
//!
//! A request is validated synchronously; accepted requests move the
//! instance to a transient state and queue a job on its worker. The job's
//! outcome (or `ERROR`) is recorded in the instance's state log.
//!
//! # RPC
//!
//! | Verb | Transport |
//! |------|-----------|
//! | GET | query `service_id`, `method`, `params` (JSON text), `id` |
//! | POST | JSON body `{service_id, method, params, id}` |
//! | UPLOAD | multipart POST, form fields are params, files are uploads |
//!
//! Responses are always `200 OK` with `{result, error: null, id}` or
//! `{error, code, id}`.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `CONPAAS_DIRECTOR_URL` | Yes | - | Director callback endpoint |
//! | `CONPAAS_MANAGER_PORT` | No | `8443` | RPC listen port |
//! | `CONPAAS_AGENT_PORT` | No | `5555` | Agent RPC port |
//! | `CONPAAS_CLOUDS` | No | `default` | Comma-separated cloud names |
//! | `CONPAAS_INITIAL_SERVICES` | No | - | Service types created at boot |
//! | `CONPAAS_LOG_FILE` | No | - | File the log is also written to |
//! | `CONPAAS_HOME` | No | `.data/home` | Startup script directory |
//!
//! See [`config::Config`] for the full list.
//!
//! # Modules
//!
//! - [`application`]: service registry and application-level methods
//! - [`instance`]: per-service state machine, nodes and jobs
//! - [`services`]: the service types
//! - [`rpc`] and [`server`]: request dispatch and the HTTP front end
//! - [`iaas`], [`agent`], [`credit`]: outbound collaborators
//! - [`runtime`]: embeddable runtime

#![deny(missing_docs)]

/// Per-service agent RPC stubs and the agent transport.
pub mod agent;

/// Application manager: service registry and application methods.
pub mod application;

/// Argument schemas for RPC methods.
pub mod args;

/// Manager configuration loaded from environment variables.
pub mod config;

/// Credit checks against the director.
pub mod credit;

/// Error types with RPC error code mapping.
pub mod error;

/// Cloud controllers.
pub mod iaas;

/// Service instances and their lifecycle operations.
pub mod instance;

/// Outbound JSON-RPC client.
pub mod jsonrpc;

/// Nodes, volumes and role bookkeeping.
pub mod node;

/// RPC envelope, method table and dispatch.
pub mod rpc;

/// Embeddable runtime.
pub mod runtime;

/// HTTP front end.
pub mod server;

/// Service manager trait and shared context.
pub mod service;

/// Service type implementations.
pub mod services;

/// Lifecycle states and the state log.
pub mod state;

/// Volume bookkeeping and cloud volume lifecycle.
pub mod volumes;

/// Serial job queue per service instance.
pub mod worker;

pub use application::ApplicationManager;
pub use error::{ManagerError, Result};
pub use runtime::ManagerRuntime;
pub use state::ManagerState;
