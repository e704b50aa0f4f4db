// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Generic: user code plus lifecycle scripts on a master and plain nodes.
//!
//! Every agent knows the full membership (`agents_info`) and runs the
//! active code version. Membership changes are announced to the nodes that
//! were already there through the `notify` script.

mod code;

pub use code::{ArchiveType, CodeRepo, CodeVersion, DEFAULT_VERSION};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use super::{ServiceKind, founder_guard, ids_with_role};
use crate::agent::generic as agent;
use crate::args::{Check, Params, Schema};
use crate::error::{ManagerError, Result};
use crate::instance::{Outcome, ServiceInstance};
use crate::jsonrpc::FilePart;
use crate::node::{NodeRequest, RoleCounts, ServiceNode, Volume, take_last_of_role};
use crate::service::{ManagerContext, MethodDecl, ServiceManager};
use crate::state::ManagerState::{Adapting, Init, Running, Stopped};

const MASTER: &str = "master";
const NODE: &str = "node";
const NOTIFY: &str = "notify";
const SCRIPT_RUNNING: &str = "RUNNING";

/// Generic service manager.
#[derive(Debug)]
pub struct GenericManager {
    code: Arc<CodeRepo>,
}

impl GenericManager {
    /// Create the manager with its own directory under the code repository.
    pub fn new(ctx: &ManagerContext) -> Self {
        let dir = format!("generic-{}", uuid::Uuid::new_v4().simple());
        Self {
            code: Arc::new(CodeRepo::new(ctx.config.code_repo.join(dir))),
        }
    }
}

/// `[{id, ip, role}]` for the agents.
fn agents_info(nodes: &[ServiceNode]) -> Value {
    Value::from(
        nodes
            .iter()
            .map(|n| json!({ "id": n.id, "ip": n.ip, "role": n.role }))
            .collect::<Vec<_>>(),
    )
}

async fn push_code(
    ctx: &ManagerContext,
    code: &CodeRepo,
    version: &CodeVersion,
    nodes: &[ServiceNode],
) -> Result<()> {
    let file = code.file_part(version).await?;
    info!(code_version = %version.code_version_id, nodes = nodes.len(), "Updating code on agents");
    for node in nodes {
        agent::update_code(
            ctx.agent.as_ref(),
            node,
            &version.code_version_id,
            version.filetype.as_str(),
            file.clone(),
        )
        .await?;
    }
    Ok(())
}

async fn run_script(
    ctx: &ManagerContext,
    command: &str,
    parameters: &str,
    nodes: &[ServiceNode],
    info: &Value,
) -> Result<()> {
    for node in nodes.iter().filter(|n| n.is_booted()) {
        agent::execute_script(ctx.agent.as_ref(), node, command, parameters, info).await?;
    }
    Ok(())
}

/// Whether any agent reports a running script. Unreachable agents count as idle.
async fn scripts_running(ctx: &ManagerContext, nodes: &[ServiceNode]) -> bool {
    for node in nodes {
        match ctx.agent.get_script_status(node).await {
            Ok(scripts) if scripts.values().any(|s| s == SCRIPT_RUNNING) => return true,
            Ok(_) => {}
            Err(e) => warn!(node_id = %node.id, error = %e, "Failed to obtain script status"),
        }
    }
    false
}

#[async_trait]
impl ServiceManager for GenericManager {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Generic
    }

    fn roles(&self) -> &'static [&'static str] {
        &[MASTER, NODE]
    }

    fn starting_nodes(&self, _ctx: &ManagerContext) -> Vec<NodeRequest> {
        vec![NodeRequest::new(MASTER)]
    }

    fn add_nodes_plan(
        &self,
        _ctx: &ManagerContext,
        counts: &RoleCounts,
        _existing: &[ServiceNode],
    ) -> Result<Vec<NodeRequest>> {
        if counts.get(MASTER) > 0 {
            return Err(ManagerError::invalid("nodes: a Generic service has exactly one master"));
        }
        Ok(counts.expand().into_iter().map(NodeRequest::new).collect())
    }

    fn select_removals(&self, counts: &RoleCounts, nodes: &[ServiceNode]) -> Result<Vec<ServiceNode>> {
        founder_guard(MASTER, counts.get(MASTER))?;
        let count = counts.get(NODE);
        take_last_of_role(nodes, NODE, count, false)
            .map(|picked| picked.into_iter().cloned().collect())
            .ok_or_else(|| ManagerError::WrongNrNodes {
                count,
                max: nodes.iter().filter(|n| n.role == NODE).count() as u32,
                role: NODE.to_string(),
            })
    }

    async fn on_start(&self, ctx: &ManagerContext, nodes: &[ServiceNode]) -> Result<()> {
        let info = agents_info(nodes);
        for node in nodes {
            agent::init_agent(ctx.agent.as_ref(), node, &info).await?;
        }
        push_code(ctx, &self.code, &self.code.current()?, nodes).await
    }

    async fn on_stop(&self, _ctx: &ManagerContext, _nodes: &[ServiceNode]) -> Result<()> {
        Ok(())
    }

    async fn on_add_nodes(
        &self,
        ctx: &ManagerContext,
        new: &[ServiceNode],
        existing: &[ServiceNode],
    ) -> Result<()> {
        let all: Vec<ServiceNode> = existing.iter().chain(new).cloned().collect();
        let info = agents_info(&all);
        for node in new {
            agent::init_agent(ctx.agent.as_ref(), node, &info).await?;
        }
        push_code(ctx, &self.code, &self.code.current()?, new).await?;
        run_script(ctx, NOTIFY, "", existing, &info).await
    }

    async fn on_remove_nodes(
        &self,
        ctx: &ManagerContext,
        _removed: &[ServiceNode],
        remaining: &[ServiceNode],
    ) -> Result<()> {
        run_script(ctx, NOTIFY, "", remaining, &agents_info(remaining)).await
    }

    async fn on_create_volume(
        &self,
        ctx: &ManagerContext,
        node: &ServiceNode,
        volume: &Volume,
    ) -> Result<()> {
        agent::mount_volume(ctx.agent.as_ref(), node, &volume.dev_name, &volume.volume_name).await?;
        Ok(())
    }

    async fn on_delete_volume(
        &self,
        ctx: &ManagerContext,
        node: &ServiceNode,
        volume: &Volume,
    ) -> Result<()> {
        agent::unmount_volume(ctx.agent.as_ref(), node, &volume.volume_name).await?;
        Ok(())
    }

    fn service_info(&self, _ctx: &ManagerContext) -> Map<String, Value> {
        Map::new()
    }

    fn list_nodes(&self, nodes: &[ServiceNode]) -> Value {
        json!({
            "master": ids_with_role(nodes, MASTER),
            "node": ids_with_role(nodes, NODE),
        })
    }

    fn node_info(&self, node: &ServiceNode) -> Value {
        json!({ "id": node.id, "ip": node.ip, "is_master": node.role == MASTER })
    }

    fn methods(&self) -> Vec<MethodDecl> {
        vec![
            MethodDecl::get("list_code_versions"),
            MethodDecl::upload("upload_code_version"),
            MethodDecl::get("download_code_version"),
            MethodDecl::post("enable_code"),
            MethodDecl::post("delete_code_version"),
            MethodDecl::post("execute_script"),
            MethodDecl::get("get_script_status"),
        ]
    }

    async fn call(
        &self,
        instance: &Arc<ServiceInstance>,
        method: &str,
        params: Params,
        files: Vec<FilePart>,
    ) -> Result<Value> {
        let ctx = instance.context();
        match method {
            "list_code_versions" => {
                Schema::new().parse(&params)?;
                Ok(json!({ "codeVersions": self.code.list() }))
            }
            "upload_code_version" => {
                let args = Schema::new()
                    .optional("description", Check::String, "")
                    .parse(&params)?;
                let file = files
                    .into_iter()
                    .find(|f| f.field == "code")
                    .ok_or_else(|| ManagerError::ArgsMissing("code".to_string()))?;
                let version = self.code.store(file, args.str("description")?).await?;
                Ok(json!({ "codeVersionId": version.code_version_id }))
            }
            "download_code_version" => {
                let args = Schema::new()
                    .required("codeVersionId", Check::String)
                    .parse(&params)?;
                let version = self.code.get(args.str("codeVersionId")?)?;
                let content = self.code.read(&version.code_version_id).await?.ok_or_else(|| {
                    ManagerError::invalid(format!(
                        "codeVersionId: {} has no archive to download",
                        version.code_version_id
                    ))
                })?;
                Ok(json!({
                    "codeVersionId": version.code_version_id,
                    "filename": version.filename,
                    "content": BASE64.encode(content),
                }))
            }
            "delete_code_version" => {
                let args = Schema::new()
                    .required("codeVersionId", Check::String)
                    .parse(&params)?;
                self.code.delete(args.str("codeVersionId")?).await?;
                Ok(json!({}))
            }
            "enable_code" => {
                let args = Schema::new()
                    .required("codeVersionId", Check::String)
                    .parse(&params)?;
                let version = self.code.get(args.str("codeVersionId")?)?;
                match instance.state().current() {
                    Init | Stopped => {
                        self.code.set_current(&version.code_version_id)?;
                        Ok(json!({ "state": instance.state().current() }))
                    }
                    Running => {
                        if scripts_running(ctx, &instance.nodes()).await {
                            return Err(ManagerError::ScriptsRunning);
                        }
                        let code = Arc::clone(&self.code);
                        let reason = format!("Enabling code version {}", version.code_version_id);
                        let state = instance.begin(
                            "enable_code",
                            &[Running],
                            Adapting,
                            reason,
                            move |inst| async move {
                                let nodes = inst.nodes();
                                push_code(inst.context(), &code, &version, &nodes).await?;
                                code.set_current(&version.code_version_id)?;
                                Ok(Outcome::running(format!(
                                    "Code version {} enabled",
                                    version.code_version_id
                                )))
                            },
                        )?;
                        Ok(json!({ "state": state }))
                    }
                    current => Err(ManagerError::state(method, current)),
                }
            }
            "execute_script" => {
                let args = Schema::new()
                    .required(
                        "command",
                        Check::OneOf(vec!["run".into(), "interrupt".into(), "cleanup".into()]),
                    )
                    .optional("parameters", Check::String, "")
                    .parse(&params)?;
                instance.state().ensure(method, &[Running])?;
                let command = args.str("command")?.to_string();
                let parameters = args.str("parameters")?.to_string();

                let running = scripts_running(ctx, &instance.nodes()).await;
                if command == "interrupt" && !running {
                    return Err(ManagerError::NoScriptsRunning);
                }
                if command != "interrupt" && running {
                    return Err(ManagerError::ScriptsRunning);
                }

                info!(service_id = instance.id(), command = %command, parameters = %parameters, "Executing script");
                instance.run_job("execute_script", move |inst| async move {
                    let nodes = inst.nodes();
                    run_script(inst.context(), &command, &parameters, &nodes, &agents_info(&nodes)).await
                })?;
                Ok(json!({ "state": instance.state().current() }))
            }
            "get_script_status" => {
                Schema::new().parse(&params)?;
                instance.state().ensure(method, &[Running])?;
                let mut agents: HashMap<String, HashMap<String, String>> = HashMap::new();
                for node in instance.nodes() {
                    let scripts = ctx.agent.get_script_status(&node).await?;
                    agents.insert(node.id.clone(), scripts);
                }
                Ok(json!({ "agents": agents }))
            }
            other => Err(ManagerError::invalid(format!("unknown method '{}'", other))),
        }
    }
}
