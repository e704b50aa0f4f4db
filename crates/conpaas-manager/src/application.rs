// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The application manager: service id 0.
//!
//! It owns the registry of service instances and the RPC method table, and
//! answers application-wide calls (adding and removing services, volume
//! management, overview queries). Per-service lifecycle calls are forwarded
//! to the owning [`ServiceInstance`].
//!
//! The application has its own small state machine. It sits in `RUNNING`
//! and passes through `ADAPTING` while a service is being added or removed.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::args::{Args, Check, Params, Schema};
use crate::error::{ManagerError, Result};
use crate::instance::{ServiceInstance, manager_log};
use crate::jsonrpc::FilePart;
use crate::rpc::MethodRegistry;
use crate::service::{ManagerContext, MethodDecl};
use crate::services::ServiceKind;
use crate::state::ManagerState::{Adapting, Init, Running, Stopped};
use crate::state::{ManagerState, StateMachine, lock};
use crate::volumes::check_volume_name;

/// Service id of the application manager.
pub const APP_SERVICE_ID: u32 = 0;

const STARTUP_SCRIPT: &str = "startup.sh";

/// RPC methods answered by the application manager.
pub const APP_METHODS: &[MethodDecl] = &[
    MethodDecl::get("check_process"),
    MethodDecl::get("get_app_info"),
    MethodDecl::get("get_service_info"),
    MethodDecl::get("get_service_history"),
    MethodDecl::post("list_volumes"),
    MethodDecl::post("add_service"),
    MethodDecl::post("remove_service"),
    MethodDecl::post("start_service"),
    MethodDecl::post("stop_service"),
    MethodDecl::post("add_nodes"),
    MethodDecl::post("remove_nodes"),
    MethodDecl::post("create_volume"),
    MethodDecl::post("delete_volume"),
    MethodDecl::post("stopall"),
    MethodDecl::get("get_manager_log"),
    MethodDecl::upload("upload_startup_script"),
    MethodDecl::get("get_startup_script"),
];

/// Registry of service instances plus the application-level RPC methods.
pub struct ApplicationManager {
    ctx: ManagerContext,
    state: StateMachine,
    services: Mutex<BTreeMap<u32, Arc<ServiceInstance>>>,
    next_id: AtomicU32,
    registry: MethodRegistry,
}

impl std::fmt::Debug for ApplicationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationManager")
            .field("state", &self.state.current())
            .field("services", &lock(&self.services).keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ApplicationManager {
    /// Create the application manager in `RUNNING` with no services.
    pub fn new(ctx: ManagerContext) -> Arc<Self> {
        let registry = MethodRegistry::new();
        registry.register(APP_SERVICE_ID, APP_METHODS);
        let app = Arc::new(Self {
            ctx,
            state: StateMachine::new(),
            services: Mutex::new(BTreeMap::new()),
            next_id: AtomicU32::new(1),
            registry,
        });
        app.state.set(Running, "Application manager started");
        app
    }

    /// Create the application manager and the services listed in
    /// `initial_services` of the configuration.
    pub fn boot(ctx: ManagerContext) -> Result<Arc<Self>> {
        let initial = ctx.config.initial_services.clone();
        let app = Self::new(ctx);
        for tag in initial {
            let kind: ServiceKind = tag.parse()?;
            let id = app.add_service(kind, None)?;
            info!(service_id = id, service_type = %kind, "Initial service created");
        }
        Ok(app)
    }

    /// Application state machine.
    pub fn state(&self) -> &StateMachine {
        &self.state
    }

    /// Shared collaborators.
    pub fn context(&self) -> &ManagerContext {
        &self.ctx
    }

    /// RPC method table.
    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    /// Look a service up by id.
    pub fn service(&self, id: u32) -> Option<Arc<ServiceInstance>> {
        lock(&self.services).get(&id).cloned()
    }

    /// All services ordered by id.
    pub fn services(&self) -> Vec<Arc<ServiceInstance>> {
        lock(&self.services).values().cloned().collect()
    }

    /// The service owning node `node_id`.
    pub fn service_for_node(&self, node_id: &str) -> Option<Arc<ServiceInstance>> {
        lock(&self.services)
            .values()
            .find(|s| s.has_node(node_id))
            .cloned()
    }

    fn require_service(&self, id: u32) -> Result<Arc<ServiceInstance>> {
        self.service(id)
            .ok_or_else(|| ManagerError::invalid(format!("service_id: unknown service {}", id)))
    }

    fn startup_script_path(&self, id: u32) -> PathBuf {
        self.ctx.config.home_dir.join(id.to_string()).join(STARTUP_SCRIPT)
    }

    /// Store the startup script of service `id` and return where it went.
    pub async fn upload_startup_script(&self, id: u32, script: &[u8]) -> Result<PathBuf> {
        self.require_service(id)?;
        let path = self.startup_script_path(id);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&path, script).await?;
        info!(service_id = id, path = %path.display(), "Startup script uploaded");
        Ok(path)
    }

    /// Contents of the startup script of service `id`.
    pub async fn startup_script(&self, id: u32) -> Result<String> {
        self.require_service(id)?;
        tokio::fs::read_to_string(self.startup_script_path(id))
            .await
            .map_err(|_| ManagerError::Unknown("No startup script".to_string()))
    }

    /// Instantiate a service and register its methods under a fresh id.
    pub fn add_service(&self, kind: ServiceKind, name: Option<&str>) -> Result<u32> {
        self.state.transition(
            "add_service",
            &[Running],
            Adapting,
            format!("Adding {} service", kind),
            || Ok(()),
        )?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let name = name.map_or_else(|| kind.as_str().to_string(), str::to_string);
        let instance = ServiceInstance::new(id, name, kind.create(&self.ctx), self.ctx.clone());
        self.registry.register(id, &instance.methods());
        lock(&self.services).insert(id, instance);

        info!(service_id = id, service_type = %kind, "Service added");
        self.state.set(Running, format!("Service {} added", id));
        Ok(id)
    }

    /// Shut a service down if needed, then forget it.
    ///
    /// The instance stays reachable until its shutdown job has finished.
    pub async fn remove_service(self: &Arc<Self>, id: u32) -> Result<()> {
        let instance = self.require_service(id)?;
        let idle = matches!(instance.state().current(), Init | Stopped);
        self.state.transition(
            "remove_service",
            &[Running],
            Adapting,
            format!("Removing service {}", id),
            || if idle { Ok(()) } else { instance.shutdown().map(|_| ()) },
        )?;

        if idle {
            self.forget(&instance).await;
            return Ok(());
        }
        let app = Arc::clone(self);
        tokio::spawn(async move {
            instance.wait_idle().await;
            app.forget(&instance).await;
        });
        Ok(())
    }

    async fn forget(&self, instance: &Arc<ServiceInstance>) {
        let id = instance.id();
        self.registry.unregister(id);
        lock(&self.services).remove(&id);
        instance.stop_worker().await;
        info!(service_id = id, "Service removed");
        self.state.set(Running, format!("Service {} removed", id));
    }

    /// Stop a service. A service that never started or already stopped is
    /// left alone.
    pub fn stop_service(&self, id: u32) -> Result<ManagerState> {
        let instance = self.require_service(id)?;
        let current = instance.state().current();
        if matches!(current, Init | Stopped) {
            return Ok(current);
        }
        instance.shutdown()
    }

    /// Shut down every running service.
    pub fn stop_all(&self) {
        for instance in self.services() {
            let current = instance.state().current();
            if matches!(current, Init | Stopped) {
                continue;
            }
            if let Err(e) = instance.shutdown() {
                warn!(service_id = instance.id(), error = %e, "Could not stop service");
            }
        }
    }

    /// Create a volume and attach it to `agent_id`. Returns the id of the
    /// service owning that node.
    pub fn create_volume(&self, name: &str, size: u64, agent_id: &str) -> Result<u32> {
        check_volume_name(name)?;
        let instance = self
            .service_for_node(agent_id)
            .ok_or_else(|| ManagerError::invalid(format!("agentId: unknown node '{}'", agent_id)))?;
        instance.create_volume(name, size, agent_id)?;
        Ok(instance.id())
    }

    /// Detach and destroy a volume. Returns the id of the owning service.
    pub fn delete_volume(&self, name: &str) -> Result<u32> {
        check_volume_name(name)?;
        let volume = self
            .ctx
            .volumes
            .get(name)
            .ok_or_else(|| ManagerError::invalid(format!("volumeName: unknown volume '{}'", name)))?;
        let instance = self.service_for_node(&volume.agent_id).ok_or_else(|| {
            ManagerError::invalid(format!("volume '{}' is not attached to any service", name))
        })?;
        instance.delete_volume(name)?;
        Ok(instance.id())
    }

    /// Volumes annotated with their owning service, optionally only those
    /// of `service_id`. Empty unless the application is up.
    pub fn list_volumes(&self, service_id: Option<u32>) -> Vec<Value> {
        if !matches!(self.state.current(), Running | Adapting) {
            return Vec::new();
        }
        self.ctx
            .volumes
            .list()
            .into_iter()
            .filter_map(|volume| {
                let owner = self.service_for_node(&volume.agent_id);
                let owner_id = owner.as_ref().map(|s| s.id());
                if service_id.is_some() && owner_id != service_id {
                    return None;
                }
                let mut entry = json!(volume);
                entry["service_id"] = json!(owner_id);
                entry["service_name"] = json!(owner.as_ref().map(|s| s.kind().as_str()));
                Some(entry)
            })
            .collect()
    }

    /// `get_app_info` payload.
    pub fn app_info(&self) -> Value {
        let mut states = Map::new();
        let mut services = Map::new();
        let mut nodes = Map::new();
        states.insert(APP_SERVICE_ID.to_string(), json!(self.state.current()));
        for instance in self.services() {
            let key = instance.id().to_string();
            states.insert(key.clone(), json!(instance.state().current()));
            services.insert(key.clone(), json!(instance.kind()));
            let ids: Vec<String> = instance.nodes().into_iter().map(|n| n.id).collect();
            nodes.insert(key, json!(ids));
        }
        json!({
            "states": states,
            "services": services,
            "nodes": nodes,
            "volumes": self.ctx.volumes.names(),
        })
    }

    /// Stop every instance worker. Used on process shutdown.
    pub async fn stop_workers(&self) {
        for instance in self.services() {
            instance.stop_worker().await;
        }
    }

    /// Dispatch one application-level RPC method.
    pub async fn call(
        self: &Arc<Self>,
        method: &str,
        params: Params,
        files: Vec<FilePart>,
    ) -> Result<Value> {
        match method {
            "check_process" => {
                Schema::new().parse(&params)?;
                Ok(json!({}))
            }
            "get_app_info" => {
                Schema::new().parse(&params)?;
                Ok(self.app_info())
            }
            "get_service_info" => {
                Schema::new().parse(&params)?;
                Ok(json!({ "state": self.state.current(), "type": "application" }))
            }
            "get_service_history" => {
                Schema::new().parse(&params)?;
                Ok(json!({ "state_log": self.state.history() }))
            }
            "list_volumes" => {
                let args = Schema::new()
                    .optional("service_id", Check::NonNegInt, 0)
                    .parse(&params)?;
                let wanted = service_id(args.u64("service_id")?)?;
                let filter = (wanted != APP_SERVICE_ID).then_some(wanted);
                if let Some(id) = filter {
                    self.require_service(id)?;
                }
                Ok(json!({ "volumes": self.list_volumes(filter) }))
            }
            "add_service" => {
                let tags = ServiceKind::ALL.iter().map(|k| k.as_str().to_string()).collect();
                let args = Schema::new()
                    .required("service_type", Check::OneOf(tags))
                    .optional("name", Check::String, Value::Null)
                    .parse(&params)?;
                let kind: ServiceKind = args.str("service_type")?.parse()?;
                let id = self.add_service(kind, args.opt_str("name"))?;
                Ok(json!({ "service_id": id }))
            }
            "remove_service" => {
                let args = Schema::new()
                    .required("service_id", Check::PosInt)
                    .parse(&params)?;
                self.remove_service(self.target(&args)?.id()).await?;
                Ok(json!({}))
            }
            "start_service" => {
                let args = Schema::new()
                    .required("service_id", Check::PosInt)
                    .optional("cloud", Check::String, "default")
                    .parse(&params)?;
                let state = self.target(&args)?.startup(args.str("cloud")?).await?;
                Ok(json!({ "state": state }))
            }
            "stop_service" => {
                let args = Schema::new()
                    .required("service_id", Check::PosInt)
                    .parse(&params)?;
                let state = self.stop_service(self.target(&args)?.id())?;
                Ok(json!({ "state": state }))
            }
            "add_nodes" => {
                let args = Schema::new()
                    .required("service_id", Check::PosInt)
                    .required("nodes", Check::RoleCounts)
                    .optional("cloud", Check::String, "default")
                    .parse(&params)?;
                let state = self
                    .target(&args)?
                    .add_nodes(args.role_counts("nodes")?, args.str("cloud")?)
                    .await?;
                Ok(json!({ "state": state }))
            }
            "remove_nodes" => {
                let args = Schema::new()
                    .required("service_id", Check::PosInt)
                    .required("nodes", Check::RoleCounts)
                    .parse(&params)?;
                let state = self.target(&args)?.remove_nodes(args.role_counts("nodes")?)?;
                Ok(json!({ "state": state }))
            }
            "create_volume" => {
                let args = Schema::new()
                    .required("volumeName", Check::NotIn(self.ctx.volumes.names()))
                    .required("volumeSize", Check::PosInt)
                    .required("agentId", Check::String)
                    .parse(&params)?;
                let id = self.create_volume(
                    args.str("volumeName")?,
                    args.u64("volumeSize")?,
                    args.str("agentId")?,
                )?;
                Ok(json!({ "service_id": id }))
            }
            "delete_volume" => {
                let args = Schema::new()
                    .required("volumeName", Check::String)
                    .parse(&params)?;
                let id = self.delete_volume(args.str("volumeName")?)?;
                Ok(json!({ "service_id": id }))
            }
            "stopall" => {
                Schema::new().parse(&params)?;
                self.stop_all();
                Ok(json!({}))
            }
            "get_manager_log" => {
                Schema::new().parse(&params)?;
                manager_log(&self.ctx.config).await
            }
            "upload_startup_script" => {
                let args = Schema::new().required("sid", Check::PosInt).parse(&params)?;
                let script = files
                    .into_iter()
                    .find(|f| f.field == "script")
                    .ok_or_else(|| ManagerError::ArgsMissing("script".to_string()))?;
                let path = self
                    .upload_startup_script(service_id(args.u64("sid")?)?, &script.content)
                    .await?;
                Ok(json!({ "filename": path.display().to_string() }))
            }
            "get_startup_script" => {
                let args = Schema::new().required("sid", Check::PosInt).parse(&params)?;
                let script = self.startup_script(service_id(args.u64("sid")?)?).await?;
                Ok(Value::String(script))
            }
            other => Err(ManagerError::invalid(format!("unknown method '{}'", other))),
        }
    }

    /// The service named by the `service_id` argument.
    fn target(&self, args: &Args) -> Result<Arc<ServiceInstance>> {
        self.require_service(service_id(args.u64("service_id")?)?)
    }
}

fn service_id(raw: u64) -> Result<u32> {
    u32::try_from(raw).map_err(|_| ManagerError::invalid(format!("service_id: unknown service {}", raw)))
}
