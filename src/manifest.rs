//! App manifest detection
//!
//! Reads the manifest at the root of a provisioned source tree to derive the
//! app's stable id, its runtime family and default commands:
//! - Node.js (package.json)
//! - Dart (pubspec.yaml)

use crate::config::ImageConfig;
use crate::error::AppError;
use crate::registry::AppKind;
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info};

/// Longest id accepted; ids double as directory and container names
const MAX_ID_LEN: usize = 64;

/// What a source tree declares about itself
#[derive(Debug, Clone, PartialEq)]
pub struct AppManifest {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub kind: AppKind,
    pub image: String,
    pub build_command: String,
    pub start_command: String,
}

#[derive(Debug, Deserialize)]
struct PubspecFile {
    name: Option<String>,
    description: Option<String>,
}

impl AppManifest {
    /// True if `dir` holds a manifest this module understands
    pub fn present_in(dir: &Path) -> bool {
        dir.join("package.json").is_file() || dir.join("pubspec.yaml").is_file()
    }

    /// Detect the app described by the manifest in `source_path`
    pub fn detect(source_path: &Path, images: &ImageConfig) -> Result<Self, AppError> {
        let manifest = if source_path.join("package.json").is_file() {
            Self::detect_nodejs(source_path, images)?
        } else if source_path.join("pubspec.yaml").is_file() {
            Self::detect_dart(source_path, images)?
        } else {
            return Err(AppError::Validation(
                "No package.json or pubspec.yaml found in app source".to_string(),
            ));
        };

        validate_app_id(&manifest.id)?;
        validate_command(&manifest.build_command)?;
        validate_command(&manifest.start_command)?;

        info!(
            app = %manifest.id,
            kind = %manifest.kind,
            image = %manifest.image,
            "Application detected"
        );
        Ok(manifest)
    }

    fn detect_nodejs(source_path: &Path, images: &ImageConfig) -> Result<Self, AppError> {
        let content = std::fs::read_to_string(source_path.join("package.json"))
            .map_err(|e| AppError::Validation(format!("Failed to read package.json: {}", e)))?;
        let pkg: serde_json::Value = serde_json::from_str(&content)
            .map_err(|e| AppError::Validation(format!("Failed to parse package.json: {}", e)))?;

        let name = required_name(pkg.get("name").and_then(|v| v.as_str()), "package.json")?;
        let description = pkg
            .get("description")
            .and_then(|v| v.as_str())
            .filter(|d| !d.trim().is_empty())
            .map(str::to_string);

        let scripts = pkg.get("scripts").and_then(|v| v.as_object());
        let has_script = |script: &str| scripts.map_or(false, |s| s.contains_key(script));

        let build_command = if has_script("build") {
            "npm install && npm run build".to_string()
        } else {
            "npm install".to_string()
        };

        let start_command = if has_script("start") {
            "npm start".to_string()
        } else {
            let entry = pkg
                .get("main")
                .and_then(|v| v.as_str())
                .filter(|m| !m.trim().is_empty())
                .unwrap_or("index.js");
            format!("node {}", shell_words::quote(entry))
        };

        debug!(%name, %build_command, %start_command, "Parsed package.json");
        Ok(Self {
            id: name.clone(),
            name,
            description,
            kind: AppKind::Node,
            image: images.node.clone(),
            build_command,
            start_command,
        })
    }

    fn detect_dart(source_path: &Path, images: &ImageConfig) -> Result<Self, AppError> {
        let content = std::fs::read_to_string(source_path.join("pubspec.yaml"))
            .map_err(|e| AppError::Validation(format!("Failed to read pubspec.yaml: {}", e)))?;
        let pubspec: PubspecFile = serde_yaml::from_str(&content)
            .map_err(|e| AppError::Validation(format!("Failed to parse pubspec.yaml: {}", e)))?;

        let name = required_name(pubspec.name.as_deref(), "pubspec.yaml")?;
        let start_command = if source_path.join("bin/server.dart").is_file() {
            "dart run bin/server.dart".to_string()
        } else {
            "dart run".to_string()
        };

        Ok(Self {
            id: name.clone(),
            name,
            description: pubspec.description.filter(|d| !d.trim().is_empty()),
            kind: AppKind::Dart,
            image: images.dart.clone(),
            build_command: "dart pub get".to_string(),
            start_command,
        })
    }
}

fn required_name(name: Option<&str>, file: &str) -> Result<String, AppError> {
    match name.map(str::trim) {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => Err(AppError::Validation(format!(
            "{} is missing the required \"name\" field",
            file
        ))),
    }
}

/// Ids must be safe as a directory name and a container name suffix:
/// an ASCII alphanumeric first character, then alphanumerics, `.`, `_` or `-`.
pub fn validate_app_id(id: &str) -> Result<(), AppError> {
    let mut chars = id.chars();
    let valid = id.len() <= MAX_ID_LEN
        && chars.next().map_or(false, |c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if valid {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "Invalid app id '{}': use letters, digits, '.', '_' or '-' (max {} characters)",
            id, MAX_ID_LEN
        )))
    }
}

fn validate_command(command: &str) -> Result<(), AppError> {
    match shell_words::split(command) {
        Ok(words) if !words.is_empty() => Ok(()),
        Ok(_) => Err(AppError::Validation("Empty command".to_string())),
        Err(e) => Err(AppError::Validation(format!(
            "Invalid command '{}': {}",
            command, e
        ))),
    }
}
