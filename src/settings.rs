//! Persisted runtime strategy settings
//!
//! Operators flip `useSudo` through the management API when the container
//! daemon socket is only reachable with elevated privilege. The document is
//! re-read on every runtime operation so changes apply without a restart.

use crate::registry::RegistryError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSettings {
    /// Use the privileged CLI strategy instead of the daemon API
    #[serde(default)]
    pub use_sudo: bool,

    /// Password fed to the privilege wrapper on stdin, if it needs one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sudo_password: Option<String>,
}

impl RuntimeSettings {
    /// Copy safe to hand back to API clients
    pub fn redacted(&self) -> serde_json::Value {
        serde_json::json!({
            "useSudo": self.use_sudo,
            "hasSudoPassword": self.sudo_password.is_some(),
        })
    }
}

impl std::fmt::Debug for RuntimeSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeSettings")
            .field("use_sudo", &self.use_sudo)
            .field("sudo_password", &self.sudo_password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// JSON-file store for [`RuntimeSettings`]
pub struct SettingsStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SettingsStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Current settings; a missing or unreadable document yields defaults
    pub fn load(&self) -> RuntimeSettings {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return RuntimeSettings::default()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read runtime settings");
                return RuntimeSettings::default();
            }
        };

        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "Malformed runtime settings, using defaults");
            RuntimeSettings::default()
        })
    }

    pub fn save(&self, settings: &RuntimeSettings) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock();
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

        let json = serde_json::to_vec_pretty(settings).map_err(|source| RegistryError::Json {
            path: self.path.clone(),
            source,
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(&json).map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;

        info!(use_sudo = settings.use_sudo, "Runtime settings updated");
        Ok(())
    }
}
