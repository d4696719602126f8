//! Instance state management
//!
//! Manages the /var/lib/cloud directory structure including:
//! - Instance tracking (current vs previous)
//! - Semaphore files gating boot-time actions
//! - Persisted user-data artifacts

pub mod paths;
pub mod semaphore;

pub use paths::CloudPaths;
pub use semaphore::{Frequency, SemaphoreStore};

use crate::InitError;
use std::io::ErrorKind;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

/// Instance state manager
#[derive(Debug, Clone)]
pub struct InstanceState {
    /// Cloud paths configuration
    paths: CloudPaths,
}

impl Default for InstanceState {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceState {
    /// Create a new instance state manager with default paths
    pub fn new() -> Self {
        Self {
            paths: CloudPaths::new(),
        }
    }

    /// Create with custom paths (useful for testing)
    pub fn with_paths(paths: CloudPaths) -> Self {
        Self { paths }
    }

    /// Get the paths configuration
    pub fn paths(&self) -> &CloudPaths {
        &self.paths
    }

    /// Semaphore store, scoped to `instance_id` when one is known
    pub fn semaphores(&self, instance_id: Option<&str>) -> SemaphoreStore {
        let store = SemaphoreStore::new(self.paths.sem_dir(), self.paths.boot_sem_dir());
        match instance_id {
            Some(id) => store.with_instance_id(id),
            None => store,
        }
    }

    /// Record the current instance ID, returning whether it is new
    ///
    /// When the ID differs from the recorded one, the old ID is kept in
    /// `previous-instance-id`.
    pub async fn record_instance(&self, instance_id: &str) -> Result<bool, InitError> {
        fs::create_dir_all(self.paths.data_dir()).await?;

        let is_new = match self.load_instance_id().await? {
            Some(cached) if cached == instance_id => false,
            Some(cached) => {
                fs::write(self.paths.previous_instance_id(), &cached).await?;
                true
            }
            None => true,
        };

        fs::write(self.paths.cached_instance_id(), instance_id).await?;

        if is_new {
            info!("New instance detected: {}", instance_id);
        }
        Ok(is_new)
    }

    /// Load the recorded instance ID
    pub async fn load_instance_id(&self) -> Result<Option<String>, InitError> {
        match fs::read_to_string(self.paths.cached_instance_id()).await {
            Ok(id) => {
                let id = id.trim();
                Ok((!id.is_empty()).then(|| id.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the raw and decoded user-data for inspection
    pub async fn save_userdata(&self, raw: &[u8], decoded: &[u8]) -> Result<(), InitError> {
        write_file(&self.paths.user_data_raw(), raw, 0o600).await?;
        write_file(&self.paths.user_data(), decoded, 0o600).await?;
        debug!("Saved user-data to {}", self.paths.data_dir().display());
        Ok(())
    }

    /// Clean all persistent state (for re-provisioning or testing)
    pub async fn clean(&self) -> Result<(), InitError> {
        info!("Cleaning instance state");

        for dir in [self.paths.data_dir(), self.paths.sem_dir()] {
            match fs::remove_dir_all(&dir).await {
                Ok(()) => debug!("Removed {}", dir.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!("Instance state cleaned");
        Ok(())
    }
}

/// Write a file, creating parent directories, and set its mode
pub(crate) async fn write_file(path: &Path, content: &[u8], mode: u32) -> Result<(), InitError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    fs::write(path, content).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}

/// Parse an octal permission string such as "0644"
pub(crate) fn parse_mode(perms: &str) -> Result<u32, InitError> {
    let digits = perms.trim().trim_start_matches("0o");
    u32::from_str_radix(digits, 8)
        .map_err(|e| InitError::InvalidData(format!("Invalid permissions {perms:?}: {e}")))
}
