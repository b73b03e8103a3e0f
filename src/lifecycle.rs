//! App lifecycle manager
//!
//! Orchestrates create/start/stop/restart/delete/update over the registry,
//! the container runtime and the port allocator. The runtime is the source of
//! truth; registry records are a cache repaired by [`AppManager::reconcile`].
//!
//! Every operation holds a per-app async lock for its whole duration, and
//! port allocation plus container start run under one global lock so two
//! apps can never be handed the same port.

use crate::config::{Config, ImageConfig, ProxyConfig, RuntimeConfig};
use crate::error::AppError;
use crate::manifest::{validate_app_id, AppManifest};
use crate::ports::PortAllocator;
use crate::registry::{AppRecord, AppRepository, AppSource, AppStatus};
use crate::routes::RouteCache;
use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError, RuntimeProvider};
use crate::source::{SourceProvisioner, StagedSource};
use chrono::Utc;
use dashmap::DashMap;
use hyper::body::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Label attached to every app container
pub const APP_LABEL: &str = "appgate.app";

/// Request to provision an app from a git repository
#[derive(Debug, Clone, Default)]
pub struct GitSource {
    pub url: String,
    pub branch: Option<String>,
    pub env: HashMap<String, String>,
}

pub struct AppManager {
    runtime_config: RuntimeConfig,
    proxy_config: ProxyConfig,
    images: ImageConfig,
    registry: Arc<dyn AppRepository>,
    runtimes: Arc<dyn RuntimeProvider>,
    sources: SourceProvisioner,
    ports: PortAllocator,
    routes: Arc<RouteCache>,
    app_locks: DashMap<String, Arc<Mutex<()>>>,
    allocation_lock: Mutex<()>,
}

impl AppManager {
    pub fn new(
        config: &Config,
        registry: Arc<dyn AppRepository>,
        runtimes: Arc<dyn RuntimeProvider>,
        routes: Arc<RouteCache>,
    ) -> Self {
        Self {
            runtime_config: config.runtime.clone(),
            proxy_config: config.proxy.clone(),
            images: config.images.clone(),
            registry,
            runtimes,
            sources: SourceProvisioner::new(
                config.storage.apps_dir(),
                config.runtime.git_timeout(),
            ),
            ports: PortAllocator::new(config.runtime.base_port, config.runtime.max_port),
            routes,
            app_locks: DashMap::new(),
            allocation_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<dyn AppRepository> {
        &self.registry
    }

    pub fn routes(&self) -> &Arc<RouteCache> {
        &self.routes
    }

    /// URL path prefix the app is served under
    pub fn base_path(&self, id: &str) -> String {
        self.proxy_config.base_path(id)
    }

    fn app_lock(&self, id: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.app_locks.entry(id.to_string()).or_default().value())
    }

    /// Drop the lock entry of a deleted app unless another task still waits
    /// on it. The map and the deleting caller account for two references.
    fn release_app_lock(&self, id: &str) {
        self.app_locks.remove_if(id, |_, lock| Arc::strong_count(lock) <= 2);
    }

    fn container_name(&self, id: &str) -> String {
        self.runtime_config.container_name(id)
    }

    pub fn list(&self) -> Vec<AppRecord> {
        self.registry.list_all()
    }

    pub fn get(&self, id: &str) -> Result<AppRecord, AppError> {
        self.registry.get(id).ok_or_else(|| AppError::not_found(id))
    }

    /// Clone a repository and register it as a stopped app
    pub async fn create_from_git(&self, request: GitSource) -> Result<AppRecord, AppError> {
        validate_env(&request.env)?;
        let url = request.url.trim().to_string();
        let branch = request
            .branch
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty());

        self.sources.check_reachable(&url).await?;
        let staged = self.sources.clone_repo(&url, branch.as_deref()).await?;

        self.register(staged, AppSource::Git, Some(url), branch, request.env)
            .await
    }

    /// Unpack an uploaded archive and register it as a stopped app
    pub async fn create_from_archive(&self, archive: Bytes) -> Result<AppRecord, AppError> {
        let staged = self.sources.extract_archive(archive).await?;
        self.register(staged, AppSource::Archive, None, None, HashMap::new())
            .await
    }

    async fn register(
        &self,
        staged: StagedSource,
        source: AppSource,
        source_url: Option<String>,
        source_branch: Option<String>,
        env: HashMap<String, String>,
    ) -> Result<AppRecord, AppError> {
        // Dropping `staged` on any early return removes the staging directory
        let manifest = AppManifest::detect(staged.root(), &self.images)?;
        let id = manifest.id.clone();

        let lock = self.app_lock(&id);
        let _guard = lock.lock().await;

        if self.registry.get(&id).is_some() {
            return Err(AppError::Conflict(format!("App '{}' already exists", id)));
        }

        let path = self.sources.finalize(staged, &id).await?;
        let now = Utc::now();
        let record = AppRecord {
            id: id.clone(),
            name: manifest.name,
            description: manifest.description,
            source,
            source_url,
            source_branch,
            status: AppStatus::Stopped,
            container_id: None,
            port: None,
            kind: manifest.kind,
            image: manifest.image,
            build_command: manifest.build_command,
            start_command: manifest.start_command,
            environment_vars: env.into_iter().collect(),
            path: path.clone(),
            created_at: now,
            updated_at: now,
        };

        match self.registry.upsert(record) {
            Ok(record) => {
                info!(app = %id, kind = %record.kind, source = ?record.source, "App created");
                Ok(record)
            }
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_dir_all(&path).await {
                    warn!(app = %id, error = %rm, "Failed to remove source after registry error");
                }
                Err(e.into())
            }
        }
    }

    pub async fn start(&self, id: &str) -> Result<AppRecord, AppError> {
        let lock = self.app_lock(id);
        let _guard = lock.lock().await;

        let record = self.get(id)?;
        let runtime = self.runtimes.runtime().await?;

        if self.is_live(runtime.as_ref(), id).await? {
            return Err(AppError::BadRequest(format!("App '{}' is already running", id)));
        }

        self.start_locked(record, runtime.as_ref()).await
    }

    pub async fn stop(&self, id: &str) -> Result<AppRecord, AppError> {
        let lock = self.app_lock(id);
        let _guard = lock.lock().await;

        let mut record = self.get(id)?;
        let runtime = self.runtimes.runtime().await?;
        let target = record
            .container_id
            .clone()
            .unwrap_or_else(|| self.container_name(id));

        runtime.stop(&target).await?;

        // Port and container id stay on the record until the next start or delete
        record.status = AppStatus::Stopped;
        let record = self.registry.upsert(record)?;
        self.routes.invalidate(id);

        info!(app = %id, "App stopped");
        Ok(record)
    }

    /// Stop and remove whatever container exists, then start fresh
    pub async fn restart(&self, id: &str) -> Result<AppRecord, AppError> {
        let lock = self.app_lock(id);
        let _guard = lock.lock().await;

        let record = self.get(id)?;
        let runtime = self.runtimes.runtime().await?;

        let name = self.container_name(id);
        let target = record.container_id.clone().unwrap_or_else(|| name.clone());
        if let Err(e) = runtime.stop(&target).await {
            warn!(app = %id, error = %e, "Failed to stop container before restart");
        }

        self.start_locked(record, runtime.as_ref()).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), AppError> {
        let lock = self.app_lock(id);
        let _guard = lock.lock().await;

        let record = self.get(id)?;

        let runtime = match self.runtimes.runtime().await {
            Ok(runtime) => Some(runtime),
            Err(e) => {
                warn!(app = %id, error = %e, "Runtime unavailable, deleting without container cleanup");
                None
            }
        };

        if let Some(runtime) = runtime.as_deref() {
            self.remove_container(runtime, &record).await;
        }

        self.routes.invalidate(id);
        self.registry.delete(id)?;

        self.remove_source(runtime.as_deref(), &record.path).await;
        self.release_app_lock(id);

        info!(app = %id, "App deleted");
        Ok(())
    }

    /// Pull the latest commits for a git-sourced app. Does not restart it
    pub async fn update(&self, id: &str) -> Result<AppRecord, AppError> {
        let lock = self.app_lock(id);
        let _guard = lock.lock().await;

        let record = self.get(id)?;
        if record.source != AppSource::Git {
            return Err(AppError::BadRequest(format!(
                "App '{}' was not created from git and cannot be updated",
                id
            )));
        }

        self.sources
            .pull(&record.path, record.source_branch.as_deref())
            .await?;

        let record = self.registry.upsert(record)?;
        info!(app = %id, "App source updated");
        Ok(record)
    }

    pub async fn logs(&self, id: &str, tail: usize) -> Result<String, AppError> {
        let record = self.get(id)?;
        let runtime = self.runtimes.runtime().await?;
        let target = record
            .container_id
            .unwrap_or_else(|| self.container_name(id));

        Ok(runtime.logs(&target, tail).await?)
    }

    /// Overwrite cached runtime state with what the runtime reports.
    ///
    /// Never fails: an app whose container cannot be inspected is treated
    /// as having no container. Returns the number of records changed.
    pub async fn reconcile(&self) -> usize {
        let runtime = match self.runtimes.runtime().await {
            Ok(runtime) => Some(runtime),
            Err(e) => {
                warn!(error = %e, "Runtime unavailable during reconcile, marking apps stopped");
                None
            }
        };

        let mut changed = 0;
        for record in self.registry.list_all() {
            let lock = self.app_lock(&record.id);
            let _guard = lock.lock().await;

            let mut updated = record.clone();
            let live = match runtime.as_deref() {
                Some(runtime) => runtime.inspect(&self.container_name(&record.id)).await,
                None => Err(RuntimeError::Unavailable("no runtime".to_string())),
            };

            match live {
                Ok(state) => {
                    updated.status = if state.running {
                        AppStatus::Running
                    } else {
                        AppStatus::Stopped
                    };
                    updated.container_id = Some(state.id).filter(|id| !id.is_empty());
                    updated.port = state.host_port;
                }
                Err(RuntimeError::NotFound(_)) => updated.mark_stopped(),
                Err(e) => {
                    debug!(app = %record.id, error = %e, "Inspect failed, treating container as absent");
                    updated.mark_stopped();
                }
            }

            if updated.status == record.status
                && updated.container_id == record.container_id
                && updated.port == record.port
            {
                continue;
            }

            match self.registry.upsert(updated) {
                Ok(saved) => {
                    info!(
                        app = %saved.id,
                        status = %saved.status,
                        port = ?saved.port,
                        "Reconciled app state"
                    );
                    changed += 1;
                }
                Err(e) => warn!(app = %record.id, error = %e, "Failed to save reconciled state"),
            }
            self.routes.invalidate(&record.id);
        }

        info!(changed, "Reconcile complete");
        changed
    }

    /// True if the app's container exists and is running
    async fn is_live(&self, runtime: &dyn ContainerRuntime, id: &str) -> Result<bool, AppError> {
        match runtime.inspect(&self.container_name(id)).await {
            Ok(state) => Ok(state.running),
            Err(RuntimeError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn start_locked(
        &self,
        mut record: AppRecord,
        runtime: &dyn ContainerRuntime,
    ) -> Result<AppRecord, AppError> {
        let id = record.id.clone();

        // A stale container would hold the name and possibly the port
        self.remove_container(runtime, &record).await;

        if let Err(e) = runtime.pull(&record.image).await {
            warn!(app = %id, image = %record.image, error = %e, "Image pull failed, trying local image");
        }

        let source_dir = absolute_source_dir(&record.path).await?;

        let _alloc = self.allocation_lock.lock().await;
        let port = self
            .ports
            .allocate(&id, self.registry.as_ref(), runtime)
            .await?;
        let spec = self.container_spec(&record, source_dir, port);

        let started = match runtime.create_and_start(&spec).await {
            Ok(started) => started,
            Err(e) => {
                error!(app = %id, port, error = %e, "Failed to start container");
                record.status = AppStatus::Error;
                record.container_id = None;
                record.port = None;
                if let Err(save) = self.registry.upsert(record) {
                    warn!(app = %id, error = %save, "Failed to record start failure");
                }
                self.routes.invalidate(&id);
                return Err(e.into());
            }
        };

        record.status = AppStatus::Running;
        record.container_id = Some(started.container_id.clone());
        record.port = Some(started.port);

        let saved = self.registry.upsert(record).map_err(|e| {
            error!(
                app = %id,
                container_id = %started.container_id,
                port = started.port,
                error = %e,
                "Container started but registry write failed; reconcile or remove the container manually"
            );
            AppError::from(e)
        })?;
        self.routes.invalidate(&id);

        info!(app = %id, port = started.port, container_id = %started.container_id, "App started");
        Ok(saved)
    }

    fn container_spec(&self, record: &AppRecord, source_dir: PathBuf, port: u16) -> ContainerSpec {
        let mut env: BTreeMap<String, String> = record.environment_vars.clone();
        env.insert(
            "PORT".to_string(),
            self.runtime_config.internal_port.to_string(),
        );
        env.insert(
            self.runtime_config.base_path_env.clone(),
            self.base_path(&record.id),
        );

        let mut labels = BTreeMap::new();
        labels.insert(APP_LABEL.to_string(), record.id.clone());

        ContainerSpec {
            name: self.container_name(&record.id),
            image: record.image.clone(),
            env: env.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect(),
            source_dir,
            workdir: self.runtime_config.workdir.clone(),
            internal_port: self.runtime_config.internal_port,
            host_ip: self.runtime_config.publish_host_ip.clone(),
            host_port: port,
            command: format!("{} && {}", record.build_command, record.start_command),
            labels,
        }
    }

    /// Best-effort removal by recorded id, then by deterministic name
    async fn remove_container(&self, runtime: &dyn ContainerRuntime, record: &AppRecord) {
        if let Some(container_id) = &record.container_id {
            if let Err(e) = runtime.remove(container_id).await {
                warn!(app = %record.id, container_id = %container_id, error = %e, "Failed to remove container");
            }
        }

        let name = self.container_name(&record.id);
        if let Err(e) = runtime.remove(&name).await {
            warn!(app = %record.id, container = %name, error = %e, "Failed to remove container by name");
        }
    }

    async fn remove_source(&self, runtime: Option<&dyn ContainerRuntime>, path: &Path) {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => debug!(path = %path.display(), "Removed app source"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                let Some(runtime) = runtime else {
                    warn!(path = %path.display(), "Cannot remove app source: permission denied");
                    return;
                };
                info!(path = %path.display(), "Permission denied, removing app source via helper container");
                let purged = match absolute_source_dir(path).await {
                    Ok(abs) => runtime.purge_path(&abs).await.map_err(AppError::from),
                    Err(e) => Err(e),
                };
                if let Err(e) = purged {
                    warn!(path = %path.display(), error = %e, "Failed to purge app source");
                }
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove app source"),
        }
    }
}

async fn absolute_source_dir(path: &Path) -> Result<PathBuf, AppError> {
    tokio::fs::canonicalize(path).await.map_err(|e| {
        AppError::Server(format!(
            "App source directory {} is unavailable: {}",
            path.display(),
            e
        ))
    })
}

/// Environment variable names must be portable shell identifiers
fn validate_env(env: &HashMap<String, String>) -> Result<(), AppError> {
    for key in env.keys() {
        let mut chars = key.chars();
        let valid = chars
            .next()
            .map_or(false, |c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(AppError::Validation(format!(
                "Invalid environment variable name '{}'",
                key
            )));
        }
    }
    Ok(())
}

/// Check an id supplied by a caller before using it as a lock or path key
pub fn check_id(id: &str) -> Result<(), AppError> {
    validate_app_id(id).map_err(|_| AppError::not_found(id))
}
