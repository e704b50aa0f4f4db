// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RPC envelope, method table and dispatch.
//!
//! A request names a `service_id`, a `method` and its `params`. The method
//! table maps `(service_id, method)` to the verb it was exposed under; a
//! call arriving under another verb is treated as an unknown method.
//!
//! Every outcome is an [`RpcResponse`]: `{result, error: null, id}` on
//! success, `{error, code, id}` on failure. Transport errors never leak as
//! HTTP status codes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::application::{APP_SERVICE_ID, ApplicationManager};
use crate::args::Params;
use crate::error::{ManagerError, RpcError};
use crate::jsonrpc::FilePart;
use crate::service::{MethodDecl, Verb};
use crate::state::lock;

/// Failures resolving a request to a handler.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum DispatchError {
    /// No `service_id` in the request.
    #[error("Did not specify service")]
    ServiceMissing,

    /// `service_id` is not registered.
    #[error("Service not found")]
    ServiceNotFound,

    /// No `method` in the request.
    #[error("Did not specify method")]
    MethodMissing,

    /// The service has no such method under this verb.
    #[error("Method not found")]
    MethodNotFound,
}

impl DispatchError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ServiceMissing | Self::MethodMissing => "E_ARGS_MISSING",
            Self::ServiceNotFound | Self::MethodNotFound => "E_NOT_FOUND",
        }
    }

    fn to_rpc_error(&self) -> RpcError {
        RpcError {
            code: self.error_code().to_string(),
            message: self.to_string(),
        }
    }
}

/// Per-service table of exposed methods.
#[derive(Debug, Default)]
pub struct MethodRegistry {
    methods: Mutex<BTreeMap<u32, HashMap<&'static str, Verb>>>,
}

impl MethodRegistry {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose `methods` under `service_id`, replacing what was there.
    pub fn register(&self, service_id: u32, methods: &[MethodDecl]) {
        let table = methods.iter().map(|m| (m.name, m.verb)).collect();
        lock(&self.methods).insert(service_id, table);
        debug!(service_id, count = methods.len(), "Registered methods");
    }

    /// Drop every method of `service_id`.
    pub fn unregister(&self, service_id: u32) {
        lock(&self.methods).remove(&service_id);
        debug!(service_id, "Deregistered methods");
    }

    /// Registered service ids.
    pub fn service_ids(&self) -> Vec<u32> {
        lock(&self.methods).keys().copied().collect()
    }

    /// Check that `method` is exposed by `service_id` under `verb`.
    pub fn resolve(&self, service_id: u32, method: &str, verb: Verb) -> Result<(), DispatchError> {
        let methods = lock(&self.methods);
        let table = methods
            .get(&service_id)
            .ok_or(DispatchError::ServiceNotFound)?;
        match table.get(method) {
            Some(exposed) if *exposed == verb => Ok(()),
            _ => Err(DispatchError::MethodNotFound),
        }
    }
}

/// A decoded request.
#[derive(Debug, Clone, Default)]
pub struct RpcRequest {
    /// Target service, as sent.
    pub service_id: Option<Value>,
    /// Method name.
    pub method: Option<String>,
    /// Method arguments.
    pub params: Params,
    /// Request id echoed in the response.
    pub id: Value,
}

impl RpcRequest {
    /// Build a request for `method` on `service_id`.
    pub fn new(service_id: u32, method: impl Into<String>, params: Params) -> Self {
        Self {
            service_id: Some(Value::from(service_id)),
            method: Some(method.into()),
            params,
            id: Value::from(1),
        }
    }

    fn target(&self) -> Result<(u32, &str), DispatchError> {
        let service_id = self
            .service_id
            .as_ref()
            .filter(|v| !v.is_null())
            .ok_or(DispatchError::ServiceMissing)?;
        let service_id = match service_id {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .and_then(|n| u32::try_from(n).ok())
        .ok_or(DispatchError::ServiceNotFound)?;
        let method = self
            .method
            .as_deref()
            .filter(|m| !m.is_empty())
            .ok_or(DispatchError::MethodMissing)?;
        Ok((service_id, method))
    }
}

/// Response body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RpcResponse {
    /// The method returned a value.
    Success {
        /// Method result.
        result: Value,
        /// Always `null`.
        error: Option<String>,
        /// Request id.
        id: Value,
    },
    /// Dispatch or the method failed.
    Failure {
        /// Human readable message.
        error: String,
        /// Stable error code.
        code: String,
        /// Request id.
        id: Value,
    },
}

impl RpcResponse {
    /// Successful response.
    pub fn success(result: Value, id: Value) -> Self {
        Self::Success {
            result,
            error: None,
            id,
        }
    }

    /// Error response.
    pub fn failure(error: RpcError, id: Value) -> Self {
        Self::Failure {
            error: error.message,
            code: error.code,
            id,
        }
    }

    /// Whether this is an error response.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }
}

/// Resolve and run one request.
pub async fn dispatch(
    app: &Arc<ApplicationManager>,
    verb: Verb,
    request: RpcRequest,
    files: Vec<FilePart>,
) -> RpcResponse {
    let id = request.id.clone();
    let (service_id, method) = match request.target() {
        Ok(target) => target,
        Err(e) => return RpcResponse::failure(e.to_rpc_error(), id),
    };
    if let Err(e) = app.registry().resolve(service_id, method, verb) {
        debug!(service_id, method, ?verb, error = %e, "Request not routed");
        return RpcResponse::failure(e.to_rpc_error(), id);
    }

    let method = method.to_string();
    let result = if service_id == APP_SERVICE_ID {
        app.call(&method, request.params, files).await
    } else {
        match app.service(service_id) {
            Some(instance) => instance.call(&method, request.params, files).await,
            None => return RpcResponse::failure(DispatchError::ServiceNotFound.to_rpc_error(), id),
        }
    };

    match result {
        Ok(value) => RpcResponse::success(value, id),
        Err(e) => {
            log_failure(service_id, &method, &e);
            RpcResponse::failure(e.to_rpc_error(), id)
        }
    }
}

fn log_failure(service_id: u32, method: &str, error: &ManagerError) {
    match error {
        ManagerError::Agent(_) | ManagerError::Iaas(_) | ManagerError::Io(_) | ManagerError::Unknown(_) => {
            warn!(service_id, method, code = error.error_code(), error = %error, "RPC failed")
        }
        _ => debug!(service_id, method, code = error.error_code(), error = %error, "RPC rejected"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgent;
    use crate::iaas::MockIaas;
    use crate::service::testing::context;
    use serde_json::json;

    fn app() -> Arc<ApplicationManager> {
        ApplicationManager::new(context(&MockIaas::new(), &MockAgent::new()))
    }

    #[test]
    fn test_registry_enforces_verb() {
        let registry = MethodRegistry::new();
        registry.register(4, &[MethodDecl::get("list_nodes"), MethodDecl::post("startup")]);
        assert!(registry.resolve(4, "list_nodes", Verb::Get).is_ok());
        assert_eq!(
            registry.resolve(4, "list_nodes", Verb::Post),
            Err(DispatchError::MethodNotFound)
        );
        assert_eq!(
            registry.resolve(5, "list_nodes", Verb::Get),
            Err(DispatchError::ServiceNotFound)
        );
        registry.unregister(4);
        assert!(registry.service_ids().is_empty());
    }

    #[test]
    fn test_response_shapes() {
        let ok = serde_json::to_value(RpcResponse::success(json!({"a": 1}), json!(7))).unwrap();
        assert_eq!(ok, json!({"result": {"a": 1}, "error": null, "id": 7}));

        let err = ManagerError::NotEnoughCredit.to_rpc_error();
        let body = serde_json::to_value(RpcResponse::failure(err, json!(7))).unwrap();
        assert_eq!(
            body,
            json!({"error": "Not enough credit", "code": "E_NOT_ENOUGH_CREDIT", "id": 7})
        );
    }

    #[tokio::test]
    async fn test_missing_service_and_method() {
        let app = app();
        let response = dispatch(&app, Verb::Get, RpcRequest::default(), vec![]).await;
        assert!(matches!(response, RpcResponse::Failure { ref error, .. } if error == "Did not specify service"));

        let request = RpcRequest {
            service_id: Some(json!("0")),
            ..RpcRequest::default()
        };
        let response = dispatch(&app, Verb::Get, request, vec![]).await;
        assert!(matches!(response, RpcResponse::Failure { ref error, .. } if error == "Did not specify method"));

        let response = dispatch(&app, Verb::Get, RpcRequest::new(9, "list_nodes", Params::new()), vec![]).await;
        assert!(matches!(response, RpcResponse::Failure { ref code, .. } if code == "E_NOT_FOUND"));
    }

    #[tokio::test]
    async fn test_routes_to_application_and_services() {
        let app = app();
        let response = dispatch(&app, Verb::Get, RpcRequest::new(0, "check_process", Params::new()), vec![]).await;
        assert_eq!(response, RpcResponse::success(json!({}), json!(1)));

        let mut params = Params::new();
        params.insert("service_type".into(), json!("helloworld"));
        let response = dispatch(&app, Verb::Post, RpcRequest::new(0, "add_service", params), vec![]).await;
        assert_eq!(response, RpcResponse::success(json!({"service_id": 1}), json!(1)));

        let response = dispatch(&app, Verb::Get, RpcRequest::new(1, "get_service_info", Params::new()), vec![]).await;
        assert_eq!(
            response,
            RpcResponse::success(json!({"state": "INIT", "type": "helloworld"}), json!(1))
        );

        let response = dispatch(&app, Verb::Post, RpcRequest::new(1, "get_service_info", Params::new()), vec![]).await;
        assert!(response.is_error());
    }

    #[tokio::test]
    async fn test_method_errors_become_error_bodies() {
        let app = app();
        let mut params = Params::new();
        params.insert("bogus".into(), json!(1));
        let response = dispatch(&app, Verb::Get, RpcRequest::new(0, "check_process", params), vec![]).await;
        match response {
            RpcResponse::Failure { code, id, .. } => {
                assert_eq!(code, "E_ARGS_UNEXPECTED");
                assert_eq!(id, json!(1));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
