// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound JSON-RPC client.
//!
//! Agents and the director speak the same dialect as the manager itself:
//!
//! | Kind | Transport |
//! |------|-----------|
//! | GET | query string `service_id`, `method`, `params` (JSON text), `id` |
//! | POST | JSON body `{service_id, method, params, id}` |
//! | UPLOAD | multipart form with `service_id`, `method`, params as fields and one file |
//!
//! Replies are always HTTP 200 with `{result, error, id}`; a non-null `error`
//! is the remote failure message.

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

/// Errors from outbound RPC calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RpcClientError {
    /// The request could not be sent or timed out.
    #[error("transport error: {0}")]
    Transport(String),
    /// The server answered with a non-200 status.
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    /// The body was not a JSON-RPC reply.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    /// The remote method reported an error.
    #[error("{0}")]
    Remote(String),
}

/// A file carried by an UPLOAD call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    /// Form field name.
    pub field: String,
    /// Original file name.
    pub filename: String,
    /// File content.
    pub content: Vec<u8>,
}

impl FilePart {
    /// Create a file part.
    pub fn new(field: impl Into<String>, filename: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            field: field.into(),
            filename: filename.into(),
            content,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Value,
}

/// JSON-RPC client over HTTP.
#[derive(Debug, Clone)]
pub struct JsonRpcClient {
    http: reqwest::Client,
}

impl JsonRpcClient {
    /// Create a client with the given request timeout.
    pub fn new(timeout: Duration) -> Result<Self, RpcClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcClientError::Transport(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    /// Call a GET method.
    pub async fn get(&self, url: &str, method: &str, params: &Value) -> Result<Value, RpcClientError> {
        debug!(url, method, "JSON-RPC GET");
        let params = serde_json::to_string(params)
            .map_err(|e| RpcClientError::InvalidResponse(e.to_string()))?;
        let response = self
            .http
            .get(url)
            .header("Content-Type", "application/json")
            .query(&[
                ("service_id", "0"),
                ("method", method),
                ("params", params.as_str()),
                ("id", "1"),
            ])
            .send()
            .await
            .map_err(|e| RpcClientError::Transport(e.to_string()))?;
        Self::read_reply(response).await
    }

    /// Call a POST method.
    pub async fn post(&self, url: &str, method: &str, params: &Value) -> Result<Value, RpcClientError> {
        debug!(url, method, "JSON-RPC POST");
        let body = json!({
            "service_id": 0,
            "method": method,
            "params": params,
            "id": "1",
        });
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcClientError::Transport(e.to_string()))?;
        Self::read_reply(response).await
    }

    /// Call an UPLOAD method with string fields and one file.
    pub async fn upload(
        &self,
        url: &str,
        method: &str,
        params: &Value,
        file: FilePart,
    ) -> Result<Value, RpcClientError> {
        debug!(url, method, filename = %file.filename, "JSON-RPC UPLOAD");
        let mut form = Form::new()
            .text("service_id", "0")
            .text("method", method.to_string());
        if let Value::Object(map) = params {
            for (key, value) in map {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                form = form.text(key.clone(), text);
            }
        }
        form = form.part(
            file.field.clone(),
            Part::bytes(file.content).file_name(file.filename),
        );
        let response = self
            .http
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| RpcClientError::Transport(e.to_string()))?;
        Self::read_reply(response).await
    }

    async fn read_reply(response: reqwest::Response) -> Result<Value, RpcClientError> {
        let status = response.status().as_u16();
        if status != 200 {
            return Err(RpcClientError::Status(status));
        }
        let text = response
            .text()
            .await
            .map_err(|e| RpcClientError::Transport(format!("failed to read body: {}", e)))?;
        let reply: Reply = serde_json::from_str(&text)
            .map_err(|e| RpcClientError::InvalidResponse(e.to_string()))?;
        match reply.error {
            Value::Null => Ok(reply.result),
            Value::String(message) => Err(RpcClientError::Remote(message)),
            other => Err(RpcClientError::Remote(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> JsonRpcClient {
        JsonRpcClient::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_get_encodes_params_in_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("method", "get_log"))
            .and(query_param("params", r#"{"filename":"agent.out"}"#))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"result": {"log": "ok"}, "error": null, "id": "1"})),
            )
            .mount(&server)
            .await;

        let result = client()
            .get(&server.uri(), "get_log", &json!({"filename": "agent.out"}))
            .await
            .unwrap();
        assert_eq!(result["log"], "ok");
    }

    #[tokio::test]
    async fn test_post_reports_remote_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "start_mysqld"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"error": "mysqld failed", "id": "1"})),
            )
            .mount(&server)
            .await;

        let err = client()
            .post(&server.uri(), "start_mysqld", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcClientError::Remote(ref m) if m == "mysqld failed"));
    }

    #[tokio::test]
    async fn test_non_200_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = client()
            .post(&server.uri(), "anything", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcClientError::Status(500)));
    }

    #[tokio::test]
    async fn test_garbage_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = client()
            .get(&server.uri(), "check_agent_process", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcClientError::InvalidResponse(_)));
    }
}
