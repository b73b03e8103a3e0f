use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for appgate
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and connection settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Reverse proxy behaviour
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Where the registry, settings and app sources live
    #[serde(default)]
    pub storage: StorageConfig,

    /// Container runtime settings
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Base images per detected app type
    #[serde(default)]
    pub images: ImageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address the reverse proxy listens on (default: 0.0.0.0:8080)
    #[serde(default = "default_proxy_bind")]
    pub proxy_bind: SocketAddr,

    /// Address the management API listens on (default: 127.0.0.1:9090)
    #[serde(default = "default_api_bind")]
    pub api_bind: SocketAddr,

    /// Bearer token for the management API.
    /// If not set, a random token is generated at startup and logged
    pub api_token: Option<String>,

    /// Maximum idle connections per app container (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for an app to respond (default: 60)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Upper bound on archive upload size in bytes (default: 100 MiB)
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            proxy_bind: default_proxy_bind(),
            api_bind: default_api_bind(),
            api_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Mount prefix; apps are served under `{path_prefix}/{id}/` (default: /apps)
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,

    /// Inject the base-path script into HTML responses (default: true)
    #[serde(default = "default_true")]
    pub inject_base_path: bool,

    /// Name of the browser global holding the base path
    #[serde(default = "default_base_path_global")]
    pub base_path_global: String,

    /// Largest HTML body buffered for injection; bigger pages pass unmodified
    #[serde(default = "default_max_rewrite_bytes")]
    pub max_rewrite_bytes: usize,
}

impl ProxyConfig {
    /// Base path an app is mounted under
    pub fn base_path(&self, app_id: &str) -> String {
        format!("{}/{}", self.path_prefix.trim_end_matches('/'), app_id)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            path_prefix: default_path_prefix(),
            inject_base_path: true,
            base_path_global: default_base_path_global(),
            max_rewrite_bytes: default_max_rewrite_bytes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Base directory for all persistent state (default: ./data)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl StorageConfig {
    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("apps.json")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("runtime-settings.json")
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.data_dir.join("apps")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Docker host URL (default: DOCKER_HOST or common socket paths)
    pub docker_host: Option<String>,

    /// Docker CLI used by the privileged strategy
    #[serde(default = "default_cli_path")]
    pub cli_path: String,

    /// Privilege escalation wrapper for the CLI strategy
    #[serde(default = "default_sudo_path")]
    pub sudo_path: String,

    /// `timeout(1)` run under the wrapper so overrunning commands die as root
    #[serde(default = "default_timeout_path")]
    pub timeout_path: String,

    /// Container names are `{container_prefix}{app id}`
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,

    /// Port every app listens on inside its container
    #[serde(default = "default_internal_port")]
    pub internal_port: u16,

    /// First host port handed out by the allocator
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Last host port handed out by the allocator
    #[serde(default = "default_max_port")]
    pub max_port: u16,

    /// Host interface container ports are published on
    #[serde(default = "default_publish_host_ip")]
    pub publish_host_ip: String,

    /// Mount point of the app source inside the container
    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// Environment variable carrying the app's base path
    #[serde(default = "default_base_path_env")]
    pub base_path_env: String,

    /// Image used for throwaway cleanup containers
    #[serde(default = "default_helper_image")]
    pub helper_image: String,

    #[serde(default = "default_pull_timeout")]
    pub pull_timeout_secs: u64,

    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    #[serde(default = "default_inspect_timeout")]
    pub inspect_timeout_secs: u64,

    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    #[serde(default = "default_git_timeout")]
    pub git_timeout_secs: u64,
}

impl RuntimeConfig {
    pub fn container_name(&self, app_id: &str) -> String {
        format!("{}{}", self.container_prefix, app_id)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn inspect_timeout(&self) -> Duration {
        Duration::from_secs(self.inspect_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            cli_path: default_cli_path(),
            sudo_path: default_sudo_path(),
            timeout_path: default_timeout_path(),
            container_prefix: default_container_prefix(),
            internal_port: default_internal_port(),
            base_port: default_base_port(),
            max_port: default_max_port(),
            publish_host_ip: default_publish_host_ip(),
            workdir: default_workdir(),
            base_path_env: default_base_path_env(),
            helper_image: default_helper_image(),
            pull_timeout_secs: default_pull_timeout(),
            start_timeout_secs: default_start_timeout(),
            inspect_timeout_secs: default_inspect_timeout(),
            stop_timeout_secs: default_stop_timeout(),
            git_timeout_secs: default_git_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImageConfig {
    /// Image for apps with a package.json
    #[serde(default = "default_node_image")]
    pub node: String,

    /// Image for apps with a pubspec.yaml
    #[serde(default = "default_dart_image")]
    pub dart: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            node: default_node_image(),
            dart: default_dart_image(),
        }
    }
}

// Default value functions
fn default_proxy_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_api_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    60
}

fn default_max_upload_bytes() -> usize {
    100 * 1024 * 1024
}

fn default_path_prefix() -> String {
    "/apps".to_string()
}

fn default_true() -> bool {
    true
}

fn default_base_path_global() -> String {
    "__APP_BASE_PATH__".to_string()
}

fn default_max_rewrite_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_cli_path() -> String {
    "docker".to_string()
}

fn default_sudo_path() -> String {
    "sudo".to_string()
}

fn default_timeout_path() -> String {
    "timeout".to_string()
}

fn default_container_prefix() -> String {
    "appgate-".to_string()
}

fn default_internal_port() -> u16 {
    3000
}

fn default_base_port() -> u16 {
    3100
}

fn default_max_port() -> u16 {
    3999
}

fn default_publish_host_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_workdir() -> String {
    "/app".to_string()
}

fn default_base_path_env() -> String {
    "BASE_PATH".to_string()
}

fn default_helper_image() -> String {
    "alpine:3".to_string()
}

fn default_pull_timeout() -> u64 {
    300 // image pulls can hang on an unreachable registry
}

fn default_start_timeout() -> u64 {
    120
}

fn default_inspect_timeout() -> u64 {
    15
}

fn default_stop_timeout() -> u64 {
    30
}

fn default_git_timeout() -> u64 {
    300
}

fn default_node_image() -> String {
    "node:20-alpine".to_string()
}

fn default_dart_image() -> String {
    "dart:stable".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let prefix = &self.proxy.path_prefix;
        if !prefix.starts_with('/') || prefix.trim_end_matches('/').is_empty() {
            errors.push(format!(
                "proxy.path_prefix must start with '/' and name a segment, got '{}'",
                prefix
            ));
        }

        if self.runtime.base_port == 0 || self.runtime.base_port > self.runtime.max_port {
            errors.push(format!(
                "runtime.base_port ({}) must be non-zero and not above runtime.max_port ({})",
                self.runtime.base_port, self.runtime.max_port
            ));
        }

        if self.runtime.internal_port == 0 {
            errors.push("runtime.internal_port must be non-zero".to_string());
        }

        if self.runtime.container_prefix.is_empty() {
            errors.push("runtime.container_prefix must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
proxy_bind = "127.0.0.1:8000"
api_token = "secret"

[proxy]
path_prefix = "/run"

[storage]
data_dir = "/var/lib/appgate"

[runtime]
base_port = 4100
max_port = 4200
container_prefix = "apps-"

[images]
node = "node:22"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.proxy_bind.port(), 8000);
        assert_eq!(config.server.api_token.as_deref(), Some("secret"));
        assert_eq!(config.proxy.path_prefix, "/run");
        assert_eq!(
            config.storage.registry_path(),
            PathBuf::from("/var/lib/appgate/apps.json")
        );
        assert_eq!(config.runtime.base_port, 4100);
        assert_eq!(config.runtime.container_name("demo"), "apps-demo");
        assert_eq!(config.images.node, "node:22");
        assert_eq!(config.images.dart, "dart:stable");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.api_bind.port(), 9090);
        assert_eq!(config.server.pool_max_idle_per_host, 10);
        assert_eq!(config.proxy.path_prefix, "/apps");
        assert!(config.proxy.inject_base_path);
        assert_eq!(config.runtime.internal_port, 3000);
        assert_eq!(config.runtime.base_port, 3100);
        assert_eq!(config.runtime.container_name("demo-app"), "appgate-demo-app");
        assert_eq!(config.runtime.pull_timeout(), Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_base_path() {
        let mut proxy = ProxyConfig::default();
        assert_eq!(proxy.base_path("demo"), "/apps/demo");

        proxy.path_prefix = "/run/".to_string();
        assert_eq!(proxy.base_path("demo"), "/run/demo");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.proxy.path_prefix = "apps".to_string();
        config.runtime.base_port = 5000;
        config.runtime.max_port = 4000;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("path_prefix"));
        assert!(err.contains("base_port"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appgate.toml");
        std::fs::write(&path, "[proxy]\npath_prefix = \"/\"\n").unwrap();
        assert!(Config::load(&path).is_err());

        std::fs::write(&path, "[runtime]\ninternal_port = 8080\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.runtime.internal_port, 8080);
    }
}
