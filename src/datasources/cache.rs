//! Datasource cache
//!
//! After a successful probe the active datasource's declared fields are
//! written to a versioned JSON record. Later runs reload that record and
//! skip discovery entirely; the cache is never refreshed on its own, so a
//! changed environment requires clearing it.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use super::Datasource;
use crate::InitError;
use crate::state::{CloudPaths, write_file};

/// Version of the on-disk record layout
pub const CACHE_VERSION: u32 = 1;

/// Serialized form of an active datasource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasourceRecord {
    pub version: u32,
    pub name: String,
    pub instance_id: String,
    pub hostname: Option<String>,
    pub locale: String,
    pub local_mirror: String,
    #[serde(default)]
    pub public_keys: Vec<String>,
    /// Raw user-data, base64 encoded
    #[serde(default)]
    pub user_data: String,
}

impl DatasourceRecord {
    /// Capture the declared fields of a fetched datasource
    pub fn capture(ds: &dyn Datasource) -> Self {
        Self {
            version: CACHE_VERSION,
            name: ds.name().to_string(),
            instance_id: ds.instance_id().to_string(),
            hostname: ds.hostname().map(str::to_string),
            locale: ds.locale().to_string(),
            local_mirror: ds.local_mirror().to_string(),
            public_keys: ds.public_keys().to_vec(),
            user_data: BASE64.encode(ds.raw_user_data()),
        }
    }
}

/// A datasource restored from the cache
///
/// Its `fetch` performs no I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedDatasource {
    name: String,
    instance_id: String,
    hostname: Option<String>,
    locale: String,
    local_mirror: String,
    public_keys: Vec<String>,
    user_data: Vec<u8>,
}

impl TryFrom<DatasourceRecord> for CachedDatasource {
    type Error = InitError;

    fn try_from(record: DatasourceRecord) -> Result<Self, Self::Error> {
        if record.version != CACHE_VERSION {
            return Err(InitError::CacheCorruption(format!(
                "unsupported cache version {} (expected {})",
                record.version, CACHE_VERSION
            )));
        }
        if record.instance_id.is_empty() {
            return Err(InitError::CacheCorruption("empty instance ID".to_string()));
        }

        let user_data = BASE64
            .decode(record.user_data.as_bytes())
            .map_err(|e| InitError::CacheCorruption(format!("invalid user-data: {e}")))?;

        Ok(Self {
            name: record.name,
            instance_id: record.instance_id,
            hostname: record.hostname,
            locale: record.locale,
            local_mirror: record.local_mirror,
            public_keys: record.public_keys,
            user_data,
        })
    }
}

#[async_trait]
impl Datasource for CachedDatasource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&mut self) -> Result<bool, InitError> {
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

    fn locale(&self) -> &str {
        &self.locale
    }

    fn local_mirror(&self) -> &str {
        &self.local_mirror
    }
}

/// On-disk cache holding at most one datasource record
#[derive(Debug, Clone)]
pub struct DatasourceCache {
    path: PathBuf,
}

impl DatasourceCache {
    /// Cache stored at an explicit path
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Cache at the standard location
    pub fn from_paths(paths: &CloudPaths) -> Self {
        Self::new(paths.datasource_cache())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the cached record
    ///
    /// `Ok(None)` if nothing is cached; `CacheCorruption` if the record
    /// cannot be trusted.
    pub async fn load_record(&self) -> Result<Option<DatasourceRecord>, InitError> {
        let content = match fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|e| InitError::CacheCorruption(e.to_string()))
    }

    /// Load the cached datasource
    pub async fn load(&self) -> Result<Option<CachedDatasource>, InitError> {
        match self.load_record().await? {
            Some(record) => {
                let cached = CachedDatasource::try_from(record)?;
                debug!("Loaded cached datasource from {}", self.path.display());
                Ok(Some(cached))
            }
            None => Ok(None),
        }
    }

    /// Persist a fetched datasource, replacing any previous record
    pub async fn store(&self, ds: &dyn Datasource) -> Result<(), InitError> {
        let record = DatasourceRecord::capture(ds);
        let json = serde_json::to_vec_pretty(&record)?;

        let tmp = self.path.with_extension("json.tmp");
        write_file(&tmp, &json, 0o600).await?;
        fs::rename(&tmp, &self.path).await?;

        debug!("Cached datasource {} at {}", record.name, self.path.display());
        Ok(())
    }

    /// Remove the cached record, forcing discovery on the next run
    pub async fn clear(&self) -> Result<(), InitError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
