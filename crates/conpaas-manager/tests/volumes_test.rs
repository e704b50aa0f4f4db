// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Volume management through the application manager.

mod common;

use common::{TestContext, settle};
use conpaas_manager::ManagerState;
use conpaas_manager::iaas::MockIaas;
use conpaas_manager::service::Verb;
use serde_json::json;

#[tokio::test]
async fn test_create_then_delete_restores_volume_map() {
    let ctx = TestContext::new();
    let instance = ctx.running_service("generic").await;
    let id = instance.id();
    let node = instance.nodes()[0].clone();
    let names_before = ctx.app.context().volumes.names();

    let result = ctx
        .ok(
            Verb::Post,
            0,
            "create_volume",
            json!({ "volumeName": "data", "volumeSize": 512, "agentId": node.id }),
        )
        .await;
    assert_eq!(result, json!({ "service_id": id }));
    assert_eq!(settle(&instance).await, ManagerState::Running);

    let attached = instance.node(&node.id).unwrap().volumes;
    assert_eq!(attached.len(), 1);
    assert_eq!(attached[0].volume_name, "data");
    assert_eq!(attached[0].dev_name, "/dev/sdb");
    assert_eq!(ctx.agent.calls_to("mount_volume").await.len(), 1);

    let listed = ctx
        .ok(Verb::Post, 0, "list_volumes", json!({ "service_id": id }))
        .await;
    let volumes = listed["volumes"].as_array().unwrap();
    assert_eq!(volumes.len(), 1);
    assert_eq!(volumes[0]["volumeName"], "data");
    assert_eq!(volumes[0]["service_id"], id);
    assert_eq!(volumes[0]["service_name"], "generic");

    let result = ctx
        .ok(Verb::Post, 0, "delete_volume", json!({ "volumeName": "data" }))
        .await;
    assert_eq!(result, json!({ "service_id": id }));
    assert_eq!(settle(&instance).await, ManagerState::Running);

    assert_eq!(ctx.app.context().volumes.names(), names_before);
    assert!(instance.node(&node.id).unwrap().volumes.is_empty());
    assert!(ctx.iaas.volumes().await.is_empty());
    assert_eq!(ctx.agent.calls_to("unmount_volume").await.len(), 1);
}

#[tokio::test]
async fn test_duplicate_and_invalid_names_are_rejected() {
    let ctx = TestContext::new();
    let instance = ctx.running_service("mysql").await;
    let node = instance.nodes()[0].clone();
    let existing = node.volumes[0].volume_name.clone();

    let code = ctx
        .err(
            Verb::Post,
            0,
            "create_volume",
            json!({ "volumeName": existing, "volumeSize": 1, "agentId": node.id }),
        )
        .await;
    assert_eq!(code, "E_ARGS_INVALID");

    let code = ctx
        .err(
            Verb::Post,
            0,
            "create_volume",
            json!({ "volumeName": "no/slashes", "volumeSize": 1, "agentId": node.id }),
        )
        .await;
    assert_eq!(code, "E_ARGS_INVALID");

    let code = ctx
        .err(Verb::Post, 0, "delete_volume", json!({ "volumeName": "missing" }))
        .await;
    assert_eq!(code, "E_ARGS_INVALID");
    assert_eq!(instance.state().history().last().unwrap().state, ManagerState::Running);
}

#[tokio::test]
async fn test_attach_failure_destroys_volume_and_sets_error() {
    let iaas = MockIaas::with_clouds(["default", "c1"]);
    let ctx = TestContext::with_iaas(iaas.clone());
    let instance = ctx.running_service("helloworld").await;
    let node = instance.nodes()[0].clone();
    iaas.fail_attach(u32::MAX).await;

    ctx.ok(
        Verb::Post,
        0,
        "create_volume",
        json!({ "volumeName": "scratch", "volumeSize": 10, "agentId": node.id }),
    )
    .await;
    assert_eq!(settle(&instance).await, ManagerState::Error);

    assert_eq!(iaas.attach_attempts().await, 3);
    assert!(iaas.volumes().await.is_empty());
    assert_eq!(iaas.destroyed_volumes().await.len(), 1);
    assert!(ctx.app.context().volumes.get("scratch").is_none());
    assert!(instance.node(&node.id).unwrap().volumes.is_empty());
}

#[tokio::test]
async fn test_removed_node_takes_its_volumes() {
    let ctx = TestContext::new();
    let instance = ctx.running_service("mysql").await;
    let id = instance.id();
    ctx.ok(Verb::Post, id, "add_nodes", json!({ "nodes": { "mysql": 1 } }))
        .await;
    settle(&instance).await;
    assert_eq!(ctx.app.context().volumes.names().len(), 2);

    ctx.ok(Verb::Post, id, "remove_nodes", json!({ "nodes": { "mysql": 1 } }))
        .await;
    assert_eq!(settle(&instance).await, ManagerState::Running);
    assert_eq!(ctx.app.context().volumes.names().len(), 1);
    assert_eq!(ctx.iaas.volumes().await.len(), 1);
}

#[tokio::test]
async fn test_list_volumes_across_services() {
    let ctx = TestContext::new();
    let mysql = ctx.running_service("mysql").await;
    let xtreemfs = ctx.running_service("xtreemfs").await;

    let all = ctx.ok(Verb::Post, 0, "list_volumes", json!({})).await;
    let all = all["volumes"].as_array().unwrap();
    assert_eq!(all.len(), 2);

    let only = ctx
        .ok(Verb::Post, 0, "list_volumes", json!({ "service_id": xtreemfs.id() }))
        .await;
    let only = only["volumes"].as_array().unwrap();
    assert_eq!(only.len(), 1);
    assert_eq!(only[0]["service_name"], "xtreemfs");
    assert_ne!(only[0]["agentId"], mysql.nodes()[0].id.as_str());
}
