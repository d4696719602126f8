//! Config loader
//!
//! Loads and merges system configs from standard locations.

use super::{InitConfig, merge};
use crate::{InitError, state::CloudPaths};
use serde_yaml::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Load and merge the main config and its drop-ins
///
/// Missing files are skipped. A file that fails to parse is logged and
/// skipped rather than aborting the boot.
pub async fn load_config(paths: &CloudPaths) -> Result<InitConfig, InitError> {
    let mut documents = Vec::new();

    if let Some(doc) = load_document(&paths.main_config()).await? {
        debug!("Loaded base config from {}", paths.main_config().display());
        documents.push(doc);
    }

    for path in dropin_files(&paths.config_d()).await? {
        if let Some(doc) = load_document(&path).await? {
            debug!("Loaded drop-in config from {}", path.display());
            documents.push(doc);
        }
    }

    let merged = merge::merge_all(&documents);
    if merged.is_null() {
        info!("No system config found, using defaults");
        return Ok(InitConfig::default());
    }

    serde_yaml::from_value(merged)
        .map_err(|e| InitError::Config(format!("Invalid system config: {e}")))
}

/// Read one YAML document, `None` if missing or unparseable
async fn load_document(path: &Path) -> Result<Option<Value>, InitError> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match serde_yaml::from_str::<Value>(&content) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!("Failed to parse {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

/// All `*.cfg` files in a drop-in directory, sorted alphabetically
async fn dropin_files(dir: &Path) -> Result<Vec<PathBuf>, InitError> {
    let mut read_dir = match fs::read_dir(dir).await {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "cfg") {
            entries.push(path);
        }
    }

    entries.sort();
    Ok(entries)
}
