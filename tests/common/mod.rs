//! Shared helpers for integration tests: an in-memory container runtime and
//! app archive builders.

#![allow(dead_code)]

use appgate::config::Config;
use appgate::lifecycle::AppManager;
use appgate::registry::{AppRepository, JsonFileRegistry};
use appgate::routes::RouteCache;
use appgate::runtime::{
    ContainerRuntime, ContainerSpec, ContainerState, FixedRuntime, RuntimeError,
    StartedContainer,
};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub spec: ContainerSpec,
    pub running: bool,
}

/// Container runtime that keeps containers in memory, keyed by name
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    /// Host ports held by containers this process never created
    foreign_ports: Mutex<HashSet<u16>>,
    next_id: AtomicUsize,
    fail_next_start: AtomicBool,
    fail_next_remove: AtomicBool,
    unavailable: AtomicBool,
    pub pulls: Mutex<Vec<String>>,
    pub purged: Mutex<Vec<PathBuf>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.containers.lock().get(name).cloned()
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().len()
    }

    /// Simulate `docker rm -f` run by someone else
    pub fn remove_out_of_band(&self, name: &str) {
        self.containers.lock().remove(name);
    }

    /// Simulate a container exiting on its own
    pub fn kill(&self, name: &str) {
        if let Some(c) = self.containers.lock().get_mut(name) {
            c.running = false;
        }
    }

    pub fn hold_foreign_port(&self, port: u16) {
        self.foreign_ports.lock().insert(port);
    }

    pub fn fail_next_start(&self) {
        self.fail_next_start.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_remove(&self) {
        self.fail_next_remove.store(true, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), RuntimeError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable("daemon is down".to_string()));
        }
        Ok(())
    }

    fn find_key(containers: &HashMap<String, FakeContainer>, target: &str) -> Option<String> {
        containers
            .iter()
            .find(|(name, c)| name.as_str() == target || c.id == target)
            .map(|(name, _)| name.clone())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn strategy(&self) -> &'static str {
        "fake"
    }

    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        self.check_available()?;
        self.pulls.lock().push(image.to_string());
        Ok(())
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<StartedContainer, RuntimeError> {
        self.check_available()?;
        if self.fail_next_start.swap(false, Ordering::SeqCst) {
            return Err(RuntimeError::Command("container exited immediately".to_string()));
        }

        let mut containers = self.containers.lock();
        if containers.contains_key(&spec.name) {
            return Err(RuntimeError::Command(format!(
                "Conflict. The container name \"/{}\" is already in use",
                spec.name
            )));
        }
        let port_taken = self.foreign_ports.lock().contains(&spec.host_port)
            || containers
                .values()
                .any(|c| c.running && c.spec.host_port == spec.host_port);
        if port_taken {
            return Err(RuntimeError::Command(format!(
                "Bind for {}:{} failed: port is already allocated",
                spec.host_ip, spec.host_port
            )));
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("{:012x}", 0xabc000 + n);
        containers.insert(
            spec.name.clone(),
            FakeContainer {
                id: id.clone(),
                spec: spec.clone(),
                running: true,
            },
        );

        Ok(StartedContainer {
            container_id: id,
            port: spec.host_port,
            status: "running".to_string(),
        })
    }

    async fn stop(&self, container: &str) -> Result<(), RuntimeError> {
        self.check_available()?;
        let mut containers = self.containers.lock();
        if let Some(key) = Self::find_key(&containers, container) {
            if let Some(c) = containers.get_mut(&key) {
                c.running = false;
            }
        }
        Ok(())
    }

    async fn remove(&self, container: &str) -> Result<(), RuntimeError> {
        self.check_available()?;
        if self.fail_next_remove.swap(false, Ordering::SeqCst) {
            return Err(RuntimeError::Api("removal of container is already in progress".to_string()));
        }
        let mut containers = self.containers.lock();
        if let Some(key) = Self::find_key(&containers, container) {
            containers.remove(&key);
        }
        Ok(())
    }

    async fn inspect(&self, container: &str) -> Result<ContainerState, RuntimeError> {
        self.check_available()?;
        let containers = self.containers.lock();
        let key = Self::find_key(&containers, container)
            .ok_or_else(|| RuntimeError::NotFound(container.to_string()))?;
        let c = &containers[&key];
        Ok(ContainerState {
            id: c.id.clone(),
            running: c.running,
            status: if c.running { "running" } else { "exited" }.to_string(),
            started_at: Some("2026-01-01T00:00:00Z".to_string()),
            finished_at: None,
            host_port: Some(c.spec.host_port),
        })
    }

    async fn logs(&self, container: &str, tail: usize) -> Result<String, RuntimeError> {
        let state = self.inspect(container).await?;
        let lines: Vec<String> = (1..=3)
            .map(|i| format!("2026-01-01T00:00:0{}Z line {} of {}", i, i, state.id))
            .collect();
        let skip = lines.len().saturating_sub(tail);
        Ok(lines[skip..].join("\n"))
    }

    async fn list_bound_host_ports(&self) -> Result<HashSet<u16>, RuntimeError> {
        self.check_available()?;
        let mut ports: HashSet<u16> = self
            .containers
            .lock()
            .values()
            .filter(|c| c.running)
            .map(|c| c.spec.host_port)
            .collect();
        ports.extend(self.foreign_ports.lock().iter().copied());
        Ok(ports)
    }

    async fn purge_path(&self, path: &Path) -> Result<(), RuntimeError> {
        self.purged.lock().push(path.to_path_buf());
        Ok(())
    }
}

/// A manager over a temp data dir and a [`FakeRuntime`]
pub struct TestEnv {
    pub dir: TempDir,
    pub config: Config,
    pub runtime: Arc<FakeRuntime>,
    pub registry: Arc<dyn AppRepository>,
    pub routes: Arc<RouteCache>,
    pub manager: Arc<AppManager>,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = dir.path().to_path_buf();
        Self::with_config(dir, config)
    }

    pub fn with_config(dir: TempDir, config: Config) -> Self {
        let runtime = FakeRuntime::new();
        let registry: Arc<dyn AppRepository> =
            Arc::new(JsonFileRegistry::open(config.storage.registry_path()).unwrap());
        Self::build(dir, config, runtime, registry)
    }

    /// Rebuild the manager over the same data dir and runtime, as after a
    /// process restart
    pub fn restarted(self) -> Self {
        let registry: Arc<dyn AppRepository> =
            Arc::new(JsonFileRegistry::open(self.config.storage.registry_path()).unwrap());
        Self::build(self.dir, self.config, self.runtime, registry)
    }

    fn build(
        dir: TempDir,
        config: Config,
        runtime: Arc<FakeRuntime>,
        registry: Arc<dyn AppRepository>,
    ) -> Self {
        let routes = Arc::new(RouteCache::new());
        let provider = Arc::new(FixedRuntime(runtime.clone() as Arc<dyn ContainerRuntime>));
        let manager = Arc::new(AppManager::new(
            &config,
            Arc::clone(&registry),
            provider,
            Arc::clone(&routes),
        ));
        Self {
            dir,
            config,
            runtime,
            registry,
            routes,
            manager,
        }
    }

    pub fn container_name(&self, id: &str) -> String {
        self.config.runtime.container_name(id)
    }
}

/// package.json for a minimal Node app
pub fn package_json(name: &str) -> String {
    format!(
        r#"{{"name":"{}","description":"test app","main":"server.js","scripts":{{"start":"node server.js"}}}}"#,
        name
    )
}

/// tar.gz with each `(path, contents)` entry
pub fn tar_gz(files: &[(&str, &str)]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, contents.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Archive of a Node app called `name`
pub fn node_app(name: &str) -> Vec<u8> {
    tar_gz(&[
        ("package.json", &package_json(name)),
        ("server.js", "require('http').createServer().listen(3000)"),
    ])
}
