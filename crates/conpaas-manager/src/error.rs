// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the manager.
//!
//! [`ManagerError`] is what every RPC handler returns. Each variant maps to a
//! stable error code that is sent to the caller next to the message.

use serde::Serialize;
use thiserror::Error;

use crate::agent::AgentError;
use crate::credit::CreditError;
use crate::iaas::IaasError;
use crate::state::ManagerState;

/// Result type using [`ManagerError`].
pub type Result<T> = std::result::Result<T, ManagerError>;

/// Errors raised by manager operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManagerError {
    /// The request carried parameters the method does not accept.
    #[error("Unexpected arguments {}", .0.join(", "))]
    ArgsUnexpected(Vec<String>),

    /// A required parameter was not supplied.
    #[error("Missing argument \"{0}\"")]
    ArgsMissing(String),

    /// A parameter has the wrong type or an unacceptable value.
    #[error("Invalid arguments ({0})")]
    ArgsInvalid(String),

    /// A removal request would remove more nodes of a role than allowed.
    #[error("Cannot remove {count} {role} node(s): at most {max} can be removed")]
    WrongNrNodes {
        /// Number of nodes the caller asked to remove.
        count: u32,
        /// Maximum number of nodes that may be removed.
        max: u32,
        /// The role the request refers to.
        role: String,
    },

    /// The operation is not allowed in the current lifecycle state.
    #[error("Cannot perform {operation} in state {current}")]
    State {
        /// Operation that was attempted.
        operation: String,
        /// State the manager was in.
        current: ManagerState,
    },

    /// User scripts are still running on at least one agent.
    #[error(
        "Scripts are still running inside at least one agent. Please wait for them to finish execution or call 'interrupt' first."
    )]
    ScriptsRunning,

    /// `interrupt` was requested while no script runs.
    #[error("No scripts are currently running inside agents. Nothing to interrupt.")]
    NoScriptsRunning,

    /// The owner of the application has no credit left.
    #[error("Not enough credit")]
    NotEnoughCredit,

    /// A remote agent reported an error or could not be reached.
    #[error("Agent failure: {0}")]
    Agent(#[from] AgentError),

    /// The cloud controller rejected or failed a request.
    #[error("IaaS request failed: {0}")]
    Iaas(#[from] IaasError),

    /// The credit source could not be queried.
    #[error("Credit check failed: {0}")]
    Credit(#[from] CreditError),

    /// I/O failure on local storage (code repository).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Error body sent back to RPC callers.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RpcError {
    /// Stable error code.
    pub code: String,
    /// Human readable message.
    pub message: String,
}

impl ManagerError {
    /// Shorthand for [`ManagerError::ArgsInvalid`].
    pub fn invalid(detail: impl Into<String>) -> Self {
        Self::ArgsInvalid(detail.into())
    }

    /// Shorthand for a [`ManagerError::State`] error.
    pub fn state(operation: impl Into<String>, current: ManagerState) -> Self {
        Self::State {
            operation: operation.into(),
            current,
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ArgsUnexpected(_) => "E_ARGS_UNEXPECTED",
            Self::ArgsMissing(_) => "E_ARGS_MISSING",
            Self::ArgsInvalid(_) | Self::WrongNrNodes { .. } => "E_ARGS_INVALID",
            Self::State { .. } | Self::ScriptsRunning | Self::NoScriptsRunning => "E_STATE_ERROR",
            Self::NotEnoughCredit => "E_NOT_ENOUGH_CREDIT",
            Self::Agent(_) => "E_AGENT_FAILURE",
            Self::Iaas(_) => "E_IAAS_REQUEST_FAILED",
            Self::Credit(_) | Self::Io(_) | Self::Unknown(_) => "E_UNKNOWN",
        }
    }

    /// Convert this error to the body returned over RPC.
    pub fn to_rpc_error(&self) -> RpcError {
        RpcError {
            code: self.error_code().to_string(),
            message: self.to_string(),
        }
    }
}

impl From<serde_json::Error> for ManagerError {
    fn from(err: serde_json::Error) -> Self {
        ManagerError::Unknown(format!("JSON error: {}", err))
    }
}
