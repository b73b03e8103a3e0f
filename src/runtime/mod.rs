//! Container runtime adapter
//!
//! Lifecycle code talks to containers only through [`ContainerRuntime`]. Two
//! strategies implement it:
//! - [`DockerApiRuntime`]: the daemon's API over its control socket (preferred)
//! - [`CliRuntime`]: the Docker CLI behind a privilege-escalation wrapper
//!
//! [`RuntimeSelector`] picks one per operation from the persisted settings, so
//! an operator flipping `useSudo` takes effect on the next call.

mod cli;
mod docker;

pub use cli::{parse_published_ports, CliRuntime, SudoConfig};
pub use docker::DockerApiRuntime;

use crate::config::RuntimeConfig;
use crate::settings::SettingsStore;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The daemon (or CLI) could not be reached at all
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    /// No container with this id or name
    #[error("no such container: {0}")]
    NotFound(String),

    #[error("{operation} timed out after {} seconds", .timeout.as_secs())]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    /// CLI invocation failed
    #[error("runtime command failed: {0}")]
    Command(String),

    /// Daemon API returned an error
    #[error("runtime API error: {0}")]
    Api(String),
}

/// Everything needed to create and start one app container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// Deterministic name, `{prefix}{app id}`
    pub name: String,
    pub image: String,
    /// `KEY=value` entries
    pub env: Vec<String>,
    /// Host directory bind-mounted at `workdir`
    pub source_dir: PathBuf,
    pub workdir: String,
    pub internal_port: u16,
    pub host_ip: String,
    pub host_port: u16,
    /// Run through `sh -c`
    pub command: String,
    pub labels: BTreeMap<String, String>,
}

impl ContainerSpec {
    /// Argument vector for the container entrypoint
    pub fn shell_command(&self) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), self.command.clone()]
    }
}

/// Result of a successful create+start
#[derive(Debug, Clone, PartialEq)]
pub struct StartedContainer {
    pub container_id: String,
    pub port: u16,
    pub status: String,
}

/// Live state of one container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerState {
    pub id: String,
    pub running: bool,
    pub status: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub host_port: Option<u16>,
}

/// Uniform container operations, independent of execution strategy
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Short strategy label for logs
    fn strategy(&self) -> &'static str;

    /// Pull an image. Bounded by the configured pull timeout
    async fn pull(&self, image: &str) -> Result<(), RuntimeError>;

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<StartedContainer, RuntimeError>;

    /// Stop a container. A missing or already-stopped container is not an error
    async fn stop(&self, container: &str) -> Result<(), RuntimeError>;

    /// Force-remove a container. A missing container is not an error
    async fn remove(&self, container: &str) -> Result<(), RuntimeError>;

    /// Inspect by id or name; `NotFound` if it does not exist
    async fn inspect(&self, container: &str) -> Result<ContainerState, RuntimeError>;

    /// Last `tail` log lines, timestamp-prefixed, newest last
    async fn logs(&self, container: &str, tail: usize) -> Result<String, RuntimeError>;

    /// Host ports published by running containers, tracked or not
    async fn list_bound_host_ports(&self) -> Result<HashSet<u16>, RuntimeError>;

    /// Delete a host directory from inside a throwaway container, for files
    /// written by container users this process cannot remove
    async fn purge_path(&self, path: &Path) -> Result<(), RuntimeError>;
}

/// Hands out the runtime strategy to use for one operation
#[async_trait]
pub trait RuntimeProvider: Send + Sync {
    async fn runtime(&self) -> Result<Arc<dyn ContainerRuntime>, RuntimeError>;
}

/// Chooses between the daemon API and the privileged CLI on every call
pub struct RuntimeSelector {
    config: RuntimeConfig,
    settings: Arc<SettingsStore>,
    direct: Mutex<Option<Arc<DockerApiRuntime>>>,
}

impl RuntimeSelector {
    pub fn new(config: RuntimeConfig, settings: Arc<SettingsStore>) -> Self {
        Self {
            config,
            settings,
            direct: Mutex::new(None),
        }
    }

    fn privileged(&self, password: Option<String>) -> Arc<dyn ContainerRuntime> {
        let sudo = SudoConfig {
            path: self.config.sudo_path.clone(),
            password,
        };
        Arc::new(CliRuntime::new(self.config.clone(), Some(sudo)))
    }

    /// Reuse the connected client while it answers pings, reconnect otherwise
    async fn direct(&self) -> Result<Arc<DockerApiRuntime>, RuntimeError> {
        let mut slot = self.direct.lock().await;

        if let Some(existing) = slot.as_ref() {
            if existing.ping().await.is_ok() {
                return Ok(Arc::clone(existing));
            }
            debug!("Cached Docker connection stopped responding, reconnecting");
            *slot = None;
        }

        let runtime = Arc::new(DockerApiRuntime::connect(self.config.clone()).await?);
        *slot = Some(Arc::clone(&runtime));
        Ok(runtime)
    }
}

#[async_trait]
impl RuntimeProvider for RuntimeSelector {
    async fn runtime(&self) -> Result<Arc<dyn ContainerRuntime>, RuntimeError> {
        let settings = self.settings.load();

        if settings.use_sudo {
            return Ok(self.privileged(settings.sudo_password));
        }

        match self.direct().await {
            Ok(runtime) => Ok(runtime),
            Err(RuntimeError::Unavailable(reason)) => {
                warn!(%reason, "Docker daemon unreachable, falling back to privileged CLI");
                Ok(self.privileged(settings.sudo_password))
            }
            Err(e) => Err(e),
        }
    }
}

/// Provider that always returns the same runtime
pub struct FixedRuntime(pub Arc<dyn ContainerRuntime>);

#[async_trait]
impl RuntimeProvider for FixedRuntime {
    async fn runtime(&self) -> Result<Arc<dyn ContainerRuntime>, RuntimeError> {
        Ok(Arc::clone(&self.0))
    }
}
