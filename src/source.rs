//! Source provisioning: git clone/pull and archive extraction
//!
//! New sources are materialized in a staging directory under the apps
//! directory. The staging directory is a [`TempDir`], so any failure before
//! [`SourceProvisioner::finalize`] leaves nothing behind.

use crate::error::AppError;
use crate::manifest::AppManifest;
use flate2::read::GzDecoder;
use hyper::body::Bytes;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// A source tree waiting for its final location
#[derive(Debug)]
pub struct StagedSource {
    dir: TempDir,
    root: PathBuf,
}

impl StagedSource {
    /// Directory holding the manifest
    pub fn root(&self) -> &Path {
        &self.root
    }
}

pub struct SourceProvisioner {
    apps_dir: PathBuf,
    git_timeout: Duration,
}

impl SourceProvisioner {
    pub fn new(apps_dir: impl Into<PathBuf>, git_timeout: Duration) -> Self {
        Self {
            apps_dir: apps_dir.into(),
            git_timeout,
        }
    }

    /// Final location of an app's source tree
    pub fn app_dir(&self, id: &str) -> PathBuf {
        self.apps_dir.join(id)
    }

    async fn staging_dir(&self) -> Result<TempDir, AppError> {
        tokio::fs::create_dir_all(&self.apps_dir).await.map_err(|e| {
            AppError::Server(format!(
                "Failed to create {}: {}",
                self.apps_dir.display(),
                e
            ))
        })?;
        tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.apps_dir)
            .map_err(|e| AppError::Server(format!("Failed to create staging directory: {}", e)))
    }

    /// Fail with a validation error if the remote cannot be listed
    pub async fn check_reachable(&self, url: &str) -> Result<(), AppError> {
        validate_git_url(url)?;
        let mut cmd = Command::new("git");
        cmd.args(["ls-remote", "--heads", "--", url]);

        self.git(cmd, "ls-remote")
            .await
            .map_err(|e| AppError::Validation(format!("Repository not reachable: {}", e)))?;
        Ok(())
    }

    /// Clone `url` into a fresh staging directory
    pub async fn clone_repo(&self, url: &str, branch: Option<&str>) -> Result<StagedSource, AppError> {
        validate_git_url(url)?;
        let staging = self.staging_dir().await?;

        let mut cmd = Command::new("git");
        cmd.arg("clone").arg("--depth").arg("1");
        if let Some(branch) = branch {
            cmd.args(["--branch", branch, "--single-branch"]);
        }
        cmd.arg("--").arg(url).arg(staging.path());

        info!(url, branch = ?branch, "Cloning repository");
        self.git(cmd, "clone")
            .await
            .map_err(|e| AppError::Validation(format!("Failed to clone repository: {}", e)))?;

        let root = staging.path().to_path_buf();
        Ok(StagedSource { dir: staging, root })
    }

    /// Fast-forward an existing checkout
    pub async fn pull(&self, path: &Path, branch: Option<&str>) -> Result<(), AppError> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(path).args(["pull", "--ff-only"]);
        if let Some(branch) = branch {
            cmd.args(["origin", branch]);
        }

        info!(path = %path.display(), branch = ?branch, "Pulling latest changes");
        self.git(cmd, "pull")
            .await
            .map_err(|e| AppError::Server(format!("git pull failed: {}", e)))?;
        Ok(())
    }

    /// Unpack a tar or tar.gz upload into a fresh staging directory
    pub async fn extract_archive(&self, archive: Bytes) -> Result<StagedSource, AppError> {
        if archive.is_empty() {
            return Err(AppError::Validation("Empty archive upload".to_string()));
        }

        let staging = self.staging_dir().await?;
        let dest = staging.path().to_path_buf();
        let size = archive.len();

        tokio::task::spawn_blocking(move || unpack(&archive, &dest))
            .await
            .map_err(|e| AppError::Server(format!("Archive extraction task failed: {}", e)))?
            .map_err(|e| AppError::Validation(format!("Invalid archive: {}", e)))?;

        let root = find_app_root(staging.path());
        debug!(bytes = size, root = %root.display(), "Archive extracted");
        Ok(StagedSource { dir: staging, root })
    }

    /// Move the staged tree to its final location for `id`
    pub async fn finalize(&self, staged: StagedSource, id: &str) -> Result<PathBuf, AppError> {
        let target = self.app_dir(id);

        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            // No registry record owns it, or create would have conflicted
            warn!(path = %target.display(), "Removing orphaned app directory");
            tokio::fs::remove_dir_all(&target).await.map_err(|e| {
                AppError::Server(format!(
                    "Orphaned directory {} could not be removed: {}",
                    target.display(),
                    e
                ))
            })?;
        }

        tokio::fs::rename(&staged.root, &target).await.map_err(|e| {
            AppError::Server(format!(
                "Failed to move source to {}: {}",
                target.display(),
                e
            ))
        })?;

        // Remaining staging files (if the root was nested) go with the TempDir
        drop(staged.dir);
        Ok(target)
    }

    async fn git(&self, mut cmd: Command, op: &str) -> Result<(), String> {
        cmd.env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| format!("failed to run git {}: {}", op, e))?;

        match tokio::time::timeout(self.git_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => Err(String::from_utf8_lossy(&output.stderr).trim().to_string()),
            Ok(Err(e)) => Err(format!("git {} failed: {}", op, e)),
            Err(_) => Err(format!(
                "git {} timed out after {} seconds",
                op,
                self.git_timeout.as_secs()
            )),
        }
    }
}

/// Reject option-looking or local-transport URLs before handing them to git
fn validate_git_url(url: &str) -> Result<(), AppError> {
    let url = url.trim();
    let allowed = ["https://", "http://", "ssh://", "git://", "git@"];
    if url.is_empty() || !allowed.iter().any(|p| url.starts_with(p)) {
        return Err(AppError::Validation(format!(
            "Unsupported repository URL '{}'",
            url
        )));
    }
    if url.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(AppError::Validation("Repository URL contains whitespace".to_string()));
    }
    Ok(())
}

fn unpack(archive: &[u8], dest: &Path) -> std::io::Result<()> {
    let reader: Box<dyn Read + '_> = if archive.starts_with(&[0x1f, 0x8b]) {
        Box::new(GzDecoder::new(archive))
    } else {
        Box::new(archive)
    };

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(false);
    // Entries escaping `dest` are skipped by unpack
    archive.unpack(dest)
}

/// The archive root, or its single top-level directory if the manifest lives there
fn find_app_root(staging: &Path) -> PathBuf {
    if AppManifest::present_in(staging) {
        return staging.to_path_buf();
    }

    let entries: Vec<PathBuf> = match std::fs::read_dir(staging) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                // Finder metadata
                p.file_name().map_or(true, |n| n != "__MACOSX")
            })
            .collect(),
        Err(_) => return staging.to_path_buf(),
    };

    match entries.as_slice() {
        [only] if only.is_dir() && AppManifest::present_in(only) => only.clone(),
        _ => staging.to_path_buf(),
    }
}
