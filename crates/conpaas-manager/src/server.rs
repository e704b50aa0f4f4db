// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP front end.
//!
//! One route, `/`:
//! - `GET` reads `service_id`, `method`, `params` (JSON text) and `id` from
//!   the query string
//! - `POST` with a JSON body `{service_id, method, params, id}`
//! - `POST` with `multipart/form-data` is an UPLOAD: text fields other than
//!   `service_id`, `method` and `id` become params, file fields are handed
//!   to the method as [`FilePart`]s
//!
//! Every answer is `200 OK` with an [`RpcResponse`] body.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Query, Request, State};
use axum::http::header;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::application::ApplicationManager;
use crate::args::Params;
use crate::error::ManagerError;
use crate::jsonrpc::FilePart;
use crate::rpc::{RpcRequest, RpcResponse, dispatch};
use crate::service::Verb;

/// Largest request body accepted, uploads included.
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Build the router serving `app`.
pub fn router(app: Arc<ApplicationManager>) -> Router {
    Router::new()
        .route("/", get(handle_get).post(handle_post))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

/// Serve `app` on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    app: Arc<ApplicationManager>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "Manager RPC server listening");
    axum::serve(listener, router(app))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Manager RPC server stopped");
    Ok(())
}

async fn handle_get(
    State(app): State<Arc<ApplicationManager>>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<RpcResponse> {
    let id = query.get("id").map_or(Value::from(1), |raw| parse_id(raw));
    let params = match query.get("params") {
        None => Params::new(),
        Some(raw) => match parse_params(serde_json::from_str(raw).ok()) {
            Some(params) => params,
            None => return Json(bad_params(id)),
        },
    };
    let request = RpcRequest {
        service_id: query.get("service_id").map(|s| Value::from(s.as_str())),
        method: query.get("method").cloned(),
        params,
        id,
    };
    Json(dispatch(&app, Verb::Get, request, Vec::new()).await)
}

async fn handle_post(State(app): State<Arc<ApplicationManager>>, request: Request) -> Json<RpcResponse> {
    let multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    if multipart {
        return Json(handle_upload(&app, request).await);
    }

    let body = match Bytes::from_request(request, &()).await {
        Ok(body) => body,
        Err(e) => return Json(failure(ManagerError::invalid(e.body_text()), Value::from(1))),
    };
    let Ok(body) = serde_json::from_slice::<PostBody>(&body) else {
        return Json(failure(
            ManagerError::invalid("request body is not a JSON-RPC object"),
            Value::from(1),
        ));
    };
    let Some(params) = parse_params(Some(body.params)) else {
        return Json(bad_params(body.id));
    };
    let request = RpcRequest {
        service_id: body.service_id,
        method: body.method,
        params,
        id: body.id,
    };
    Json(dispatch(&app, Verb::Post, request, Vec::new()).await)
}

async fn handle_upload(app: &Arc<ApplicationManager>, request: Request) -> RpcResponse {
    let id = Value::from(1);
    let mut form = match Multipart::from_request(request, &()).await {
        Ok(form) => form,
        Err(e) => return failure(ManagerError::invalid(e.body_text()), id),
    };

    let mut rpc = RpcRequest {
        id,
        ..RpcRequest::default()
    };
    let mut files = Vec::new();
    loop {
        let field = match form.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return failure(ManagerError::invalid(e.body_text()), rpc.id),
        };
        let name = field.name().unwrap_or_default().to_string();
        let filename = field.file_name().map(str::to_string);
        let content = match field.bytes().await {
            Ok(content) => content,
            Err(e) => return failure(ManagerError::invalid(e.body_text()), rpc.id),
        };

        if let Some(filename) = filename {
            files.push(FilePart::new(name, filename, content.to_vec()));
            continue;
        }
        let text = String::from_utf8_lossy(&content).into_owned();
        match name.as_str() {
            "service_id" => rpc.service_id = Some(Value::from(text)),
            "method" => rpc.method = Some(text),
            "id" => rpc.id = parse_id(&text),
            _ => {
                rpc.params.insert(name, Value::from(text));
            }
        }
    }
    dispatch(app, Verb::Upload, rpc, files).await
}

#[derive(Debug, Deserialize)]
struct PostBody {
    #[serde(default)]
    service_id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default = "default_id")]
    id: Value,
}

fn default_id() -> Value {
    Value::from(1)
}

fn parse_id(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::from(raw))
}

/// `null` and a missing value mean no params; anything but an object is
/// rejected.
fn parse_params(value: Option<Value>) -> Option<Params> {
    match value {
        Some(Value::Object(map)) => Some(map),
        Some(Value::Null) => Some(Params::new()),
        _ => None,
    }
}

fn bad_params(id: Value) -> RpcResponse {
    failure(ManagerError::invalid("params: expected a JSON object"), id)
}

fn failure(error: ManagerError, id: Value) -> RpcResponse {
    RpcResponse::failure(error.to_rpc_error(), id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_params() {
        assert_eq!(parse_params(Some(json!({"a": 1}))).unwrap()["a"], 1);
        assert!(parse_params(Some(Value::Null)).unwrap().is_empty());
        assert!(parse_params(Some(json!([1, 2]))).is_none());
        assert!(parse_params(None).is_none());
    }

    #[test]
    fn test_parse_id_keeps_numbers() {
        assert_eq!(parse_id("7"), json!(7));
        assert_eq!(parse_id("abc"), json!("abc"));
    }
}
