// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Credit checks before provisioning.
//!
//! Metering lives in the director; the manager only asks whether the
//! application's owner has credit left before creating nodes.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;

use crate::error::ManagerError;
use crate::jsonrpc::{JsonRpcClient, RpcClientError};

/// Errors from credit queries.
#[derive(Debug, Error)]
pub enum CreditError {
    /// The credit source could not be queried.
    #[error("credit source unavailable: {0}")]
    Unavailable(String),
    /// The answer could not be understood.
    #[error("invalid credit response: {0}")]
    InvalidResponse(String),
}

/// Where remaining credit comes from.
#[async_trait]
pub trait CreditSource: Send + Sync {
    /// Remaining credit of the application's owner.
    async fn remaining_credit(&self) -> Result<i64, CreditError>;
}

/// Fail with [`ManagerError::NotEnoughCredit`] unless credit is positive.
pub async fn ensure_credit(source: &dyn CreditSource) -> crate::error::Result<()> {
    let credit = source.remaining_credit().await?;
    if credit <= 0 {
        return Err(ManagerError::NotEnoughCredit);
    }
    Ok(())
}

/// Credit held in memory, adjustable at runtime.
#[derive(Debug, Clone)]
pub struct FixedCredit {
    credit: Arc<AtomicI64>,
}

impl FixedCredit {
    /// Source reporting `credit`.
    pub fn new(credit: i64) -> Self {
        Self {
            credit: Arc::new(AtomicI64::new(credit)),
        }
    }

    /// Source that never runs out.
    pub fn unlimited() -> Self {
        Self::new(i64::MAX)
    }

    /// Change the reported credit.
    pub fn set(&self, credit: i64) {
        self.credit.store(credit, Ordering::SeqCst);
    }
}

#[async_trait]
impl CreditSource for FixedCredit {
    async fn remaining_credit(&self) -> Result<i64, CreditError> {
        Ok(self.credit.load(Ordering::SeqCst))
    }
}

/// Credit reported by the director's `get_credit` callback.
#[derive(Debug, Clone)]
pub struct DirectorCredit {
    rpc: JsonRpcClient,
    url: String,
}

impl DirectorCredit {
    /// Create a source for the director at `director_url`.
    pub fn new(director_url: &str, timeout: Duration) -> Result<Self, RpcClientError> {
        Ok(Self {
            rpc: JsonRpcClient::new(timeout)?,
            url: format!("{}/callback", director_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl CreditSource for DirectorCredit {
    async fn remaining_credit(&self) -> Result<i64, CreditError> {
        let result = self
            .rpc
            .post(&self.url, "get_credit", &json!({}))
            .await
            .map_err(|e| CreditError::Unavailable(e.to_string()))?;
        result
            .get("credit")
            .and_then(Value::as_i64)
            .ok_or_else(|| CreditError::InvalidResponse(result.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_ensure_credit() {
        let credit = FixedCredit::new(5);
        assert!(ensure_credit(&credit).await.is_ok());

        credit.set(0);
        let err = ensure_credit(&credit).await.unwrap_err();
        assert_eq!(err.error_code(), "E_NOT_ENOUGH_CREDIT");
    }

    #[tokio::test]
    async fn test_director_credit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "get_credit"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"result": {"credit": 42}, "error": null, "id": "1"})),
            )
            .mount(&server)
            .await;

        let source = DirectorCredit::new(&server.uri(), Duration::from_secs(5)).unwrap();
        assert_eq!(source.remaining_credit().await.unwrap(), 42);
    }
}
