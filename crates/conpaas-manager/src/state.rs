// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Manager lifecycle states and the append-only transition log.
//!
//! ```text
//!   INIT ──startup──► PROLOGUE ──► RUNNING ◄──► ADAPTING
//!     ▲                  │            │            │
//!     │                  ▼            ▼            ▼
//!  STOPPED ◄─────── EPILOGUE ◄─── shutdown       ERROR
//! ```
//!
//! The check of the current state and the move into a transient state happen
//! under one lock, see [`StateMachine::transition`].

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ManagerError, Result};

/// Lifecycle state of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManagerState {
    /// Created, no nodes yet.
    Init,
    /// Starting up.
    Prologue,
    /// Steady state.
    Running,
    /// Adding or removing nodes or volumes.
    Adapting,
    /// Shutting down.
    Epilogue,
    /// All nodes released.
    Stopped,
    /// A background operation failed.
    Error,
}

impl ManagerState {
    /// Wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Prologue => "PROLOGUE",
            Self::Running => "RUNNING",
            Self::Adapting => "ADAPTING",
            Self::Epilogue => "EPILOGUE",
            Self::Stopped => "STOPPED",
            Self::Error => "ERROR",
        }
    }

    /// True for states that only exist while a worker job is active.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Prologue | Self::Adapting | Self::Epilogue)
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateLogEntry {
    /// When the transition happened.
    pub time: DateTime<Utc>,
    /// State entered.
    pub state: ManagerState,
    /// Why the transition happened.
    pub reason: String,
}

#[derive(Debug)]
struct StateLog {
    current: ManagerState,
    entries: Vec<StateLogEntry>,
}

impl StateLog {
    fn push(&mut self, state: ManagerState, reason: String) {
        self.current = state;
        self.entries.push(StateLogEntry {
            time: Utc::now(),
            state,
            reason,
        });
    }
}

/// Mutex-guarded state with its history.
#[derive(Debug)]
pub struct StateMachine {
    inner: Mutex<StateLog>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Create a state machine in `INIT`.
    pub fn new() -> Self {
        let mut log = StateLog {
            current: ManagerState::Init,
            entries: Vec::new(),
        };
        log.push(ManagerState::Init, "Manager created".to_string());
        Self {
            inner: Mutex::new(log),
        }
    }

    /// Current state.
    pub fn current(&self) -> ManagerState {
        lock(&self.inner).current
    }

    /// Full transition history, oldest first.
    pub fn history(&self) -> Vec<StateLogEntry> {
        lock(&self.inner).entries.clone()
    }

    /// Unconditionally enter `state`.
    pub fn set(&self, state: ManagerState, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(state = %state, reason = %reason, "State change");
        lock(&self.inner).push(state, reason);
    }

    /// Fail with a state error unless the current state is in `allowed`.
    pub fn ensure(&self, operation: &str, allowed: &[ManagerState]) -> Result<ManagerState> {
        let current = self.current();
        if allowed.contains(&current) {
            Ok(current)
        } else {
            Err(ManagerError::state(operation, current))
        }
    }

    /// Check the current state and move to `next` atomically.
    ///
    /// `f` runs while the lock is held, after the check and before the move.
    /// If it fails, the state and log are left untouched. Callers use it to
    /// validate against a consistent snapshot and to enqueue the worker job,
    /// so that no other transition can interleave.
    pub fn transition<T>(
        &self,
        operation: &str,
        allowed: &[ManagerState],
        next: ManagerState,
        reason: impl Into<String>,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let mut log = lock(&self.inner);
        if !allowed.contains(&log.current) {
            return Err(ManagerError::state(operation, log.current));
        }
        let out = f()?;
        let reason = reason.into();
        debug!(operation, state = %next, reason = %reason, "State change");
        log.push(next, reason);
        Ok(out)
    }
}

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
