// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP front end tests driving the router directly.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use common::TestContext;
use conpaas_manager::server::router;

async fn send(ctx: &TestContext, request: Request<Body>) -> Value {
    let response = router(ctx.app.clone()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

fn get(query: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(format!("/?{}", query))
        .body(Body::empty())
        .unwrap()
}

fn post(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn multipart(fields: &[(&str, &str)], file: (&str, &str, &[u8])) -> Request<Body> {
    let boundary = "conpaas-test-boundary";
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    let (field, filename, content) = file;
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn test_get_check_process() {
    let ctx = TestContext::new();
    let body = send(&ctx, get("service_id=0&method=check_process&params=%7B%7D&id=5")).await;
    assert_eq!(body, json!({ "result": {}, "error": null, "id": 5 }));
}

#[tokio::test]
async fn test_post_add_service_then_get_info() {
    let ctx = TestContext::new();
    let body = send(
        &ctx,
        post(json!({
            "service_id": 0,
            "method": "add_service",
            "params": { "service_type": "mapreduce" },
            "id": "abc",
        })),
    )
    .await;
    assert_eq!(body["result"], json!({ "service_id": 1 }));
    assert_eq!(body["id"], "abc");
    assert!(body["error"].is_null());

    let body = send(&ctx, get("service_id=1&method=get_service_info&id=1")).await;
    assert_eq!(body["result"]["state"], "INIT");
    assert_eq!(body["result"]["type"], "mapreduce");
}

#[tokio::test]
async fn test_errors_are_http_ok_bodies() {
    let ctx = TestContext::new();

    let body = send(&ctx, get("method=check_process")).await;
    assert_eq!(body["error"], "Did not specify service");

    let body = send(&ctx, get("service_id=0&method=nope")).await;
    assert_eq!(body["error"], "Method not found");

    let body = send(&ctx, get("service_id=0&method=check_process&params=not-json")).await;
    assert_eq!(body["code"], "E_ARGS_INVALID");

    let body = send(
        &ctx,
        post(json!({ "service_id": 0, "method": "check_process", "params": {}, "id": 1 })),
    )
    .await;
    assert_eq!(body["error"], "Method not found");

    let body = send(
        &ctx,
        post(json!({ "service_id": 0, "method": "start_service", "params": { "service_id": 42 }, "id": 1 })),
    )
    .await;
    assert_eq!(body["code"], "E_ARGS_INVALID");
    assert!(body.get("result").is_none());
}

#[tokio::test]
async fn test_upload_code_version_through_multipart() {
    let ctx = TestContext::new();
    let id = ctx.add_service("generic").await;

    let archive = b"PK\x03\x04not really a zip";
    let body = send(
        &ctx,
        multipart(
            &[
                ("service_id", &id.to_string()),
                ("method", "upload_code_version"),
                ("description", "first release"),
            ],
            ("code", "app.zip", archive),
        ),
    )
    .await;
    assert!(body["error"].is_null(), "upload failed: {}", body);
    let version = body["result"]["codeVersionId"].as_str().unwrap().to_string();
    assert!(ctx.code_dir.path().read_dir().unwrap().next().is_some());

    let body = send(
        &ctx,
        get(&format!("service_id={}&method=list_code_versions&id=1", id)),
    )
    .await;
    let versions = body["result"]["codeVersions"].as_array().unwrap();
    assert_eq!(versions[0]["codeVersionId"], version.as_str());
    assert_eq!(versions[0]["filename"], "app.zip");
    assert_eq!(versions[0]["description"], "first release");
}

#[tokio::test]
async fn test_upload_to_post_method_is_not_found() {
    let ctx = TestContext::new();
    let body = send(
        &ctx,
        multipart(
            &[("service_id", "0"), ("method", "add_service")],
            ("file", "x.bin", b"data"),
        ),
    )
    .await;
    assert_eq!(body["error"], "Method not found");
    assert_eq!(body["id"], 1);
}
