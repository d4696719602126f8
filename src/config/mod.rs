//! System configuration
//!
//! Parses `/etc/cloud/cloud.cfg` and its drop-ins into [`InitConfig`].

pub mod loader;
pub mod merge;

pub use loader::load_config;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default directory for upstart job files
pub const DEFAULT_UPSTART_DIR: &str = "/etc/init";

/// Which datasources to probe, and in what order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawSelection", into = "RawSelection")]
pub enum DatasourceSelection {
    /// Use the built-in discovery order
    #[default]
    Auto,
    /// Probe exactly these datasources, in order
    List(Vec<String>),
}

/// Accepted spellings: `auto`, `"ec2, nocloud"`, or a YAML list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawSelection {
    One(String),
    Many(Vec<String>),
}

impl From<RawSelection> for DatasourceSelection {
    fn from(raw: RawSelection) -> Self {
        let names: Vec<String> = match raw {
            RawSelection::One(s) => s.split(',').map(normalize_name).collect(),
            RawSelection::Many(list) => list.iter().map(|s| normalize_name(s)).collect(),
        };
        let names: Vec<String> = names.into_iter().filter(|n| !n.is_empty()).collect();

        if names.len() == 1 && names[0] == "auto" {
            Self::Auto
        } else {
            Self::List(names)
        }
    }
}

impl From<DatasourceSelection> for RawSelection {
    fn from(selection: DatasourceSelection) -> Self {
        match selection {
            DatasourceSelection::Auto => RawSelection::One("auto".to_string()),
            DatasourceSelection::List(names) => RawSelection::Many(names),
        }
    }
}

/// Datasource names are case-insensitive
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// System configuration for an instance-init run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InitConfig {
    /// Datasources to probe
    pub cloud_type: DatasourceSelection,

    /// Where upstart job parts are written
    pub upstart_dir: PathBuf,

    /// Whether to execute user scripts after dispatching user-data
    pub run_user_scripts: bool,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            cloud_type: DatasourceSelection::Auto,
            upstart_dir: PathBuf::from(DEFAULT_UPSTART_DIR),
            run_user_scripts: true,
        }
    }
}

impl InitConfig {
    /// Parse config from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml)
    }
}
