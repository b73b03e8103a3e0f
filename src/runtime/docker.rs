//! Direct strategy: the Docker daemon API via bollard

use super::{ContainerRuntime, ContainerSpec, ContainerState, RuntimeError, StartedContainer};
use crate::config::RuntimeConfig;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerInspectResponse, HostConfig, PortBinding, PortMap, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::Docker;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Seconds bollard waits on a single daemon request
const CLIENT_TIMEOUT_SECS: u64 = 120;

pub struct DockerApiRuntime {
    client: Docker,
    config: RuntimeConfig,
}

impl DockerApiRuntime {
    /// Connect and verify the daemon answers.
    ///
    /// Connection priority:
    /// 1. `runtime.docker_host` from the config file
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn connect(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let client = if let Some(host) = config.docker_host.as_deref() {
            connect_to_host(host)?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            connect_to_host(&host)?
        } else {
            connect_with_defaults().await?
        };

        client.ping().await.map_err(|e| {
            RuntimeError::Unavailable(format!("Docker daemon is not responding: {}", e))
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client, config })
    }

    pub async fn ping(&self) -> Result<(), RuntimeError> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))
    }

    async fn bounded<T, F>(&self, operation: String, timeout: Duration, fut: F) -> Result<T, RuntimeError>
    where
        F: Future<Output = Result<T, RuntimeError>>,
    {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout { operation, timeout }),
        }
    }

    async fn pull_inner(&self, image: &str) -> Result<(), RuntimeError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| map_error(e, image))?;
            if let Some(error) = info.error {
                return Err(RuntimeError::Api(format!(
                    "Failed to pull image '{}': {}",
                    image, error
                )));
            }
            if let Some(status) = info.status {
                debug!(image, status, "Pull progress");
            }
        }
        Ok(())
    }

    async fn create_and_start_inner(
        &self,
        spec: &ContainerSpec,
    ) -> Result<StartedContainer, RuntimeError> {
        let port_key = format!("{}/tcp", spec.internal_port);
        let mut port_bindings: PortMap = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some(spec.host_ip.clone()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}",
                spec.source_dir.display(),
                spec.workdir
            )]),
            port_bindings: Some(port_bindings),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.shell_command()),
            env: Some(spec.env.clone()),
            working_dir: Some(spec.workdir.clone()),
            labels: Some(spec.labels.clone().into_iter().collect()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| map_error(e, &spec.name))?;

        let container_id = response.id;
        debug!(container_id, name = %spec.name, image = %spec.image, "Created container");

        if let Err(e) = self
            .client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            let err = map_error(e, &spec.name);
            // Leave nothing half-created behind
            let _ = self.remove_inner(&container_id).await;
            return Err(err);
        }

        info!(container_id, name = %spec.name, port = spec.host_port, "Started container");
        Ok(StartedContainer {
            container_id,
            port: spec.host_port,
            status: "running".to_string(),
        })
    }

    async fn stop_inner(&self, container: &str) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: self.config.stop_timeout_secs as i64,
        };

        match self.client.stop_container(container, Some(options)).await {
            Ok(_) => {
                info!(container, "Stopped container");
                Ok(())
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container, "Container was already stopped");
                Ok(())
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container, "Container not found");
                Ok(())
            }
            Err(e) => Err(map_error(e, container)),
        }
    }

    async fn remove_inner(&self, container: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(container, Some(options)).await {
            Ok(_) => {
                debug!(container, "Removed container");
                Ok(())
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container, "Container not found");
                Ok(())
            }
            Err(e) => Err(map_error(e, container)),
        }
    }

    async fn logs_inner(&self, container: &str, tail: usize) -> Result<String, RuntimeError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.client.logs(container, Some(options));
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_error(e, container))?;
            out.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        }
        Ok(out)
    }

    async fn purge_inner(&self, path: &Path) -> Result<(), RuntimeError> {
        let (parent, name) = purge_target(path)?;
        let image = self.config.helper_image.clone();

        if self.client.inspect_image(&image).await.is_err() {
            self.pull_inner(&image).await?;
        }

        let container_config = Config {
            image: Some(image),
            cmd: Some(vec![
                "rm".to_string(),
                "-rf".to_string(),
                "--".to_string(),
                format!("/purge/{}", name),
            ]),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:/purge", parent)]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .client
            .create_container(None::<CreateContainerOptions<String>>, container_config)
            .await
            .map_err(|e| map_error(e, "purge helper"))?;
        let helper = created.id;

        let result = async {
            self.client
                .start_container(&helper, None::<StartContainerOptions<String>>)
                .await
                .map_err(|e| map_error(e, &helper))?;

            let mut wait = self.client.wait_container(
                &helper,
                Some(WaitContainerOptions {
                    condition: "not-running",
                }),
            );
            while let Some(status) = wait.next().await {
                match status {
                    Ok(response) if response.status_code != 0 => {
                        return Err(RuntimeError::Api(format!(
                            "purge helper exited with status {}",
                            response.status_code
                        )))
                    }
                    Ok(_) => {}
                    Err(BollardError::DockerContainerWaitError { error, code }) => {
                        return Err(RuntimeError::Api(format!(
                            "purge helper exited with status {}: {}",
                            code, error
                        )))
                    }
                    Err(e) => return Err(map_error(e, &helper)),
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = self.remove_inner(&helper).await {
            warn!(container = %helper, error = %e, "Failed to remove purge helper");
        }
        result
    }
}

#[async_trait]
impl ContainerRuntime for DockerApiRuntime {
    fn strategy(&self) -> &'static str {
        "docker-api"
    }

    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        info!(image, "Pulling image");
        self.bounded(
            format!("pull {}", image),
            self.config.pull_timeout(),
            self.pull_inner(image),
        )
        .await
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<StartedContainer, RuntimeError> {
        self.bounded(
            format!("start {}", spec.name),
            self.config.start_timeout(),
            self.create_and_start_inner(spec),
        )
        .await
    }

    async fn stop(&self, container: &str) -> Result<(), RuntimeError> {
        let timeout = self.config.stop_timeout() + Duration::from_secs(10);
        self.bounded(format!("stop {}", container), timeout, self.stop_inner(container))
            .await
    }

    async fn remove(&self, container: &str) -> Result<(), RuntimeError> {
        let timeout = self.config.stop_timeout() + Duration::from_secs(10);
        self.bounded(format!("remove {}", container), timeout, self.remove_inner(container))
            .await
    }

    async fn inspect(&self, container: &str) -> Result<ContainerState, RuntimeError> {
        let fut = async {
            self.client
                .inspect_container(container, None::<InspectContainerOptions>)
                .await
                .map(state_from_inspect)
                .map_err(|e| map_error(e, container))
        };
        self.bounded(
            format!("inspect {}", container),
            self.config.inspect_timeout(),
            fut,
        )
        .await
    }

    async fn logs(&self, container: &str, tail: usize) -> Result<String, RuntimeError> {
        self.bounded(
            format!("logs {}", container),
            self.config.inspect_timeout(),
            self.logs_inner(container, tail),
        )
        .await
    }

    async fn list_bound_host_ports(&self) -> Result<HashSet<u16>, RuntimeError> {
        let fut = async {
            let containers = self
                .client
                .list_containers(Some(ListContainersOptions::<String> {
                    all: false,
                    ..Default::default()
                }))
                .await
                .map_err(|e| map_error(e, "containers"))?;

            Ok(containers
                .into_iter()
                .flat_map(|c| c.ports.unwrap_or_default())
                .filter_map(|p| p.public_port)
                .collect())
        };
        self.bounded(
            "list containers".to_string(),
            self.config.inspect_timeout(),
            fut,
        )
        .await
    }

    async fn purge_path(&self, path: &Path) -> Result<(), RuntimeError> {
        self.bounded(
            format!("purge {}", path.display()),
            self.config.start_timeout(),
            self.purge_inner(path),
        )
        .await
    }
}

fn connect_to_host(host: &str) -> Result<Docker, RuntimeError> {
    if host.starts_with("unix://") {
        let socket_path = host.trim_start_matches("unix://");
        Docker::connect_with_socket(socket_path, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            .map_err(|e| {
                RuntimeError::Unavailable(format!(
                    "Cannot connect to Unix socket '{}': {}",
                    socket_path, e
                ))
            })
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION).map_err(
            |e| RuntimeError::Unavailable(format!("Cannot connect to TCP endpoint '{}': {}", host, e)),
        )
    } else {
        Err(RuntimeError::Unavailable(format!(
            "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
            host
        )))
    }
}

async fn connect_with_defaults() -> Result<Docker, RuntimeError> {
    let home = std::env::var("HOME").unwrap_or_default();
    let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

    let socket_paths: Vec<(&str, String)> = vec![
        ("Linux default", "/var/run/docker.sock".to_string()),
        ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
        ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
        ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
    ];

    let mut tried = Vec::new();
    for (name, path) in &socket_paths {
        if path.is_empty() || path.contains("//") {
            continue; // empty env var
        }
        if !Path::new(path).exists() {
            continue;
        }

        debug!(path, name, "Found Docker socket");
        match Docker::connect_with_socket(path, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION) {
            Ok(client) => {
                if client.ping().await.is_ok() {
                    return Ok(client);
                }
                tried.push(format!("{} ({}): daemon not responding", path, name));
            }
            Err(e) => tried.push(format!("{} ({}): {}", path, name, e)),
        }
    }

    Docker::connect_with_socket_defaults().map_err(|e| {
        let tried_info = if tried.is_empty() {
            "no Docker socket found at common locations".to_string()
        } else {
            format!("tried {}", tried.join("; "))
        };
        RuntimeError::Unavailable(format!("{}: {}", tried_info, e))
    })
}

fn map_error(e: BollardError, what: &str) -> RuntimeError {
    match e {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(what.to_string()),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Api(format!("{} ({}): {}", what, status_code, message)),
        e @ (BollardError::JsonDataError { .. } | BollardError::JsonSerdeError { .. }) => {
            RuntimeError::Api(e.to_string())
        }
        other => RuntimeError::Unavailable(other.to_string()),
    }
}

fn state_from_inspect(info: ContainerInspectResponse) -> ContainerState {
    let state = info.state.unwrap_or_default();
    let host_port = info
        .network_settings
        .and_then(|n| n.ports)
        .and_then(|ports| first_host_port(&ports))
        .or_else(|| {
            info.host_config
                .and_then(|h| h.port_bindings)
                .and_then(|ports| first_host_port(&ports))
        });

    ContainerState {
        id: info.id.unwrap_or_default(),
        running: state.running.unwrap_or(false),
        status: state
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        started_at: state.started_at,
        finished_at: state.finished_at,
        host_port,
    }
}

fn first_host_port(ports: &PortMap) -> Option<u16> {
    ports
        .values()
        .flatten()
        .flatten()
        .filter_map(|b| b.host_port.as_deref())
        .find_map(|p| p.parse().ok())
}

/// Split a directory into the bind-mountable parent and the entry to delete
pub(super) fn purge_target(path: &Path) -> Result<(String, String), RuntimeError> {
    let parent = path
        .parent()
        .filter(|p| p.is_absolute())
        .ok_or_else(|| {
            RuntimeError::Command(format!("refusing to purge non-absolute path {}", path.display()))
        })?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| *n != "." && *n != "..")
        .ok_or_else(|| RuntimeError::Command(format!("refusing to purge {}", path.display())))?;
    Ok((parent.display().to_string(), name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerStateStatusEnum, NetworkSettings};

    #[test]
    fn test_purge_target() {
        let (parent, name) = purge_target(Path::new("/data/apps/demo")).unwrap();
        assert_eq!(parent, "/data/apps");
        assert_eq!(name, "demo");

        assert!(purge_target(Path::new("relative/demo")).is_err());
        assert!(purge_target(Path::new("/")).is_err());
    }

    #[test]
    fn test_state_from_inspect() {
        let mut ports: PortMap = HashMap::new();
        ports.insert(
            "3000/tcp".to_string(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some("3100".to_string()),
            }]),
        );

        let info = ContainerInspectResponse {
            id: Some("abc123".to_string()),
            state: Some(bollard::models::ContainerState {
                running: Some(true),
                status: Some(ContainerStateStatusEnum::RUNNING),
                started_at: Some("2024-01-01T00:00:00Z".to_string()),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        };

        let state = state_from_inspect(info);
        assert_eq!(state.id, "abc123");
        assert!(state.running);
        assert_eq!(state.status, "running");
        assert_eq!(state.host_port, Some(3100));
    }

    #[test]
    fn test_map_error() {
        let err = map_error(
            BollardError::DockerResponseServerError {
                status_code: 404,
                message: "No such container".to_string(),
            },
            "appgate-demo",
        );
        assert!(matches!(err, RuntimeError::NotFound(ref c) if c == "appgate-demo"));

        let err = map_error(
            BollardError::DockerResponseServerError {
                status_code: 409,
                message: "conflict".to_string(),
            },
            "appgate-demo",
        );
        assert!(matches!(err, RuntimeError::Api(_)));
    }
}
