//! App registry: durable store of app records
//!
//! The registry is a cache of what the container runtime reports, not the
//! source of truth for whether a container exists. The default implementation
//! keeps every record in a single JSON document that is read in full and
//! rewritten in full on every write.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed registry document {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// How an app's source tree was provisioned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppSource {
    Git,
    Archive,
}

/// Last known state of an app's container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Stopped,
    Running,
    Error,
}

impl std::fmt::Display for AppStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppStatus::Stopped => write!(f, "stopped"),
            AppStatus::Running => write!(f, "running"),
            AppStatus::Error => write!(f, "error"),
        }
    }
}

/// Runtime family detected from the app's manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    Node,
    Dart,
}

impl std::fmt::Display for AppKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppKind::Node => write!(f, "Node.js"),
            AppKind::Dart => write!(f, "Dart"),
        }
    }
}

/// One deployed application and its last-known runtime state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub source: AppSource,
    /// Origin URL for git-sourced apps
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub source_branch: Option<String>,
    pub status: AppStatus,
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    pub kind: AppKind,
    pub image: String,
    pub build_command: String,
    pub start_command: String,
    #[serde(default)]
    pub environment_vars: BTreeMap<String, String>,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AppRecord {
    pub fn is_running(&self) -> bool {
        self.status == AppStatus::Running && self.port.is_some()
    }

    /// Clear the runtime fields after the container is gone
    pub fn mark_stopped(&mut self) {
        self.status = AppStatus::Stopped;
        self.container_id = None;
        self.port = None;
    }
}

/// Storage contract the lifecycle manager and proxy depend on.
///
/// Implementations must make each write visible to subsequent reads; callers
/// serialize writes for the same id.
pub trait AppRepository: Send + Sync {
    /// All records; an unreadable store yields an empty list
    fn list_all(&self) -> Vec<AppRecord>;

    fn get(&self, id: &str) -> Option<AppRecord> {
        self.list_all().into_iter().find(|r| r.id == id)
    }

    /// Insert or replace by id. Sets `updated_at`, and `created_at` on first insert
    fn upsert(&self, record: AppRecord) -> Result<AppRecord, RegistryError>;

    /// Returns false if no record had this id
    fn delete(&self, id: &str) -> Result<bool, RegistryError>;
}

/// Registry backed by a single JSON file
pub struct JsonFileRegistry {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileRegistry {
    /// Open the registry, creating an empty document if none exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref().to_path_buf();
        let registry = Self {
            path,
            write_lock: Mutex::new(()),
        };
        registry.ensure_exists()?;
        Ok(registry)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_exists(&self) -> Result<(), RegistryError> {
        if self.path.exists() {
            return Ok(());
        }
        debug!(path = %self.path.display(), "Initializing empty app registry");
        self.write_records(&[])
    }

    fn read_records(&self) -> Result<Vec<AppRecord>, RegistryError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(RegistryError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&content).map_err(|source| RegistryError::Json {
            path: self.path.clone(),
            source,
        })
    }

    /// Replace the whole document. Writes go to a sibling temp file that is
    /// renamed over the original, so readers never see a partial document.
    fn write_records(&self, records: &[AppRecord]) -> Result<(), RegistryError> {
        let io_err = |source| RegistryError::Io {
            path: self.path.clone(),
            source,
        };

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(io_err)?;

        let json = serde_json::to_vec_pretty(records).map_err(|source| RegistryError::Json {
            path: self.path.clone(),
            source,
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(&json).map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

impl AppRepository for JsonFileRegistry {
    fn list_all(&self) -> Vec<AppRecord> {
        if let Err(e) = self.ensure_exists() {
            warn!(error = %e, "Failed to initialize app registry");
            return Vec::new();
        }
        match self.read_records() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "App registry unreadable, treating as empty");
                Vec::new()
            }
        }
    }

    fn upsert(&self, mut record: AppRecord) -> Result<AppRecord, RegistryError> {
        let _guard = self.write_lock.lock();
        let mut records = self.read_records()?;
        let now = Utc::now();

        record.updated_at = now;
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => {
                record.created_at = existing.created_at;
                *existing = record.clone();
            }
            None => {
                record.created_at = now;
                records.push(record.clone());
            }
        }

        self.write_records(&records)?;
        debug!(app = %record.id, status = %record.status, "Registry record saved");
        Ok(record)
    }

    fn delete(&self, id: &str) -> Result<bool, RegistryError> {
        let _guard = self.write_lock.lock();
        let mut records = self.read_records()?;
        let before = records.len();
        records.retain(|r| r.id != id);

        if records.len() == before {
            return Ok(false);
        }

        self.write_records(&records)?;
        debug!(app = %id, "Registry record deleted");
        Ok(true)
    }
}
