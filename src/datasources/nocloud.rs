//! NoCloud datasource
//!
//! Reads metadata and user data from local files or mounted ISO.
//! Common locations:
//! - /var/lib/cloud/seed/nocloud/
//! - /var/lib/cloud/seed/nocloud-net/
//! - Mounted filesystem with label 'cidata' or 'CIDATA'

use async_trait::async_trait;
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use super::Datasource;
use crate::InitError;

/// Registry name
pub const NAME: &str = "nocloud";

/// Mount points checked for a cidata filesystem
const CIDATA_MOUNTS: [&str; 3] = ["/mnt/cidata", "/media/cidata", "/run/cloud-init/cidata"];

/// Fields read from the `meta-data` file
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct MetaData {
    instance_id: Option<String>,
    local_hostname: Option<String>,
    public_keys: Option<PublicKeys>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PublicKeys {
    One(String),
    Many(Vec<String>),
}

impl PublicKeys {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(key) => key
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            Self::Many(keys) => keys,
        }
    }
}

/// NoCloud datasource for local file-based configuration
#[derive(Debug, Clone)]
pub struct NoCloud {
    seed_dirs: Vec<PathBuf>,
    instance_id: String,
    hostname: Option<String>,
    public_keys: Vec<String>,
    user_data: Vec<u8>,
}

impl NoCloud {
    /// Seed directories under `seed_root`, then the cidata mount points
    pub fn with_seed_root(seed_root: impl AsRef<Path>) -> Self {
        let seed_root = seed_root.as_ref();
        let mut dirs = vec![seed_root.join("nocloud"), seed_root.join("nocloud-net")];
        dirs.extend(CIDATA_MOUNTS.iter().map(PathBuf::from));
        Self::with_seed_dirs(dirs)
    }

    /// Probe exactly these directories, in order
    pub fn with_seed_dirs(seed_dirs: Vec<PathBuf>) -> Self {
        Self {
            seed_dirs,
            instance_id: String::new(),
            hostname: None,
            public_keys: Vec::new(),
            user_data: Vec::new(),
        }
    }

    /// Find the seed directory containing meta-data
    async fn find_seed_dir(&self) -> Option<PathBuf> {
        for dir in &self.seed_dirs {
            if let Ok(metadata) = fs::metadata(dir.join("meta-data")).await {
                if metadata.is_file() {
                    return Some(dir.clone());
                }
            }
        }
        None
    }
}

#[async_trait]
impl Datasource for NoCloud {
    fn name(&self) -> &str {
        NAME
    }

    async fn fetch(&mut self) -> Result<bool, InitError> {
        let Some(seed_dir) = self.find_seed_dir().await else {
            return Ok(false);
        };

        debug!("Reading NoCloud seed from {}", seed_dir.display());

        let content = fs::read_to_string(seed_dir.join("meta-data")).await?;
        let meta: MetaData = if content.trim().is_empty() {
            MetaData::default()
        } else {
            serde_yaml::from_str(&content)?
        };

        self.instance_id = meta.instance_id.ok_or_else(|| {
            InitError::Datasource(format!(
                "{} has no instance-id",
                seed_dir.join("meta-data").display()
            ))
        })?;
        self.hostname = meta.local_hostname;
        self.public_keys = meta.public_keys.map(PublicKeys::into_vec).unwrap_or_default();

        self.user_data = match fs::read(seed_dir.join("user-data")).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(true)
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn raw_user_data(&self) -> &[u8] {
        &self.user_data
    }

    fn public_keys(&self) -> &[String] {
        &self.public_keys
    }

    fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seeded(meta: &str, user: Option<&str>) -> (NoCloud, TempDir) {
        let temp = TempDir::new().unwrap();
        let seed = temp.path().join("nocloud");
        std::fs::create_dir_all(&seed).unwrap();
        std::fs::write(seed.join("meta-data"), meta).unwrap();
        if let Some(user) = user {
            std::fs::write(seed.join("user-data"), user).unwrap();
        }
        (NoCloud::with_seed_dirs(vec![seed]), temp)
    }

    #[tokio::test]
    async fn test_no_seed_dir() {
        let temp = TempDir::new().unwrap();
        let mut ds = NoCloud::with_seed_dirs(vec![temp.path().join("missing")]);
        assert!(!ds.fetch().await.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_metadata_and_userdata() {
        let meta = "instance-id: iid-local01\nlocal-hostname: seeded-host\npublic-keys:\n  - ssh-rsa AAAA one\n  - ssh-rsa BBBB two\n";
        let (mut ds, _temp) = seeded(meta, Some("#!/bin/sh\necho seeded\n"));

        assert!(ds.fetch().await.unwrap());
        assert_eq!(ds.instance_id(), "iid-local01");
        assert_eq!(ds.hostname(), Some("seeded-host"));
        assert_eq!(ds.public_keys().len(), 2);
        assert_eq!(ds.raw_user_data(), b"#!/bin/sh\necho seeded\n");
    }

    #[tokio::test]
    async fn test_public_keys_as_string() {
        let meta = "instance-id: iid-1\npublic-keys: |\n  ssh-rsa AAAA one\n  ssh-rsa BBBB two\n";
        let (mut ds, _temp) = seeded(meta, None);

        assert!(ds.fetch().await.unwrap());
        assert_eq!(ds.public_keys(), ["ssh-rsa AAAA one", "ssh-rsa BBBB two"]);
        assert!(ds.raw_user_data().is_empty());
    }

    #[tokio::test]
    async fn test_missing_instance_id_is_error() {
        let (mut ds, _temp) = seeded("local-hostname: nameless\n", None);
        assert!(matches!(ds.fetch().await, Err(InitError::Datasource(_))));
    }

    #[tokio::test]
    async fn test_second_seed_dir() {
        let temp = TempDir::new().unwrap();
        let net = temp.path().join("nocloud-net");
        std::fs::create_dir_all(&net).unwrap();
        std::fs::write(net.join("meta-data"), "instance-id: iid-net\n").unwrap();

        let mut ds = NoCloud::with_seed_root(temp.path());
        assert!(ds.fetch().await.unwrap());
        assert_eq!(ds.instance_id(), "iid-net");
    }
}
