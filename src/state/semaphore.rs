//! Semaphore file handling
//!
//! A semaphore is a marker file proving an action already ran at a given
//! frequency scope. Markers are named `<action>.<token>`:
//! - once: token `once`, kept in the persistent semaphore directory
//! - once-per-instance: token is the instance ID, persistent directory
//! - always: token `always`, kept in the per-boot run directory, so the
//!   marker vanishes at the next boot

use crate::InitError;
use std::fmt;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Directory under the semaphore root recording each action's frequency
const FREQUENCY_DIR: &str = ".frequency";

/// Semaphore frequency - how often a gated action may run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Frequency {
    /// Run on every boot
    Always,
    /// Run once per instance ID
    OncePerInstance,
    /// Run once ever (even across instance changes)
    Once,
}

impl Frequency {
    /// Canonical name, also used as the recorded frequency
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::OncePerInstance => "once-per-instance",
            Self::Once => "once",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = InitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "always" | "every-boot" | "per-boot" => Ok(Self::Always),
            "once-per-instance" | "per-instance" | "instance" => Ok(Self::OncePerInstance),
            "once" | "once-ever" | "per-once" => Ok(Self::Once),
            other => Err(InitError::InvalidData(format!(
                "Unknown frequency: {other}"
            ))),
        }
    }
}

/// File-based semaphore store
#[derive(Debug, Clone)]
pub struct SemaphoreStore {
    /// Persistent semaphore directory (`/var/lib/cloud/sem`)
    sem_dir: PathBuf,
    /// Per-boot semaphore directory (`/run/cloud-init/sem`)
    boot_sem_dir: PathBuf,
    /// Instance ID scoping once-per-instance markers
    instance_id: Option<String>,
}

impl SemaphoreStore {
    /// Create a new semaphore store without an instance scope
    pub fn new(sem_dir: impl AsRef<Path>, boot_sem_dir: impl AsRef<Path>) -> Self {
        Self {
            sem_dir: sem_dir.as_ref().to_path_buf(),
            boot_sem_dir: boot_sem_dir.as_ref().to_path_buf(),
            instance_id: None,
        }
    }

    /// Scope once-per-instance markers to the given instance ID
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// The instance ID this store is scoped to
    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    /// Get the marker path for an action at a frequency
    pub fn sem_path(&self, action: &str, freq: Frequency) -> Result<PathBuf, InitError> {
        validate_component(action, "action name")?;

        let path = match freq {
            Frequency::Always => self.boot_sem_dir.join(format!("{action}.always")),
            Frequency::Once => self.sem_dir.join(format!("{action}.once")),
            Frequency::OncePerInstance => {
                let id = self
                    .instance_id
                    .as_deref()
                    .ok_or(InitError::MissingInstanceId)?;
                validate_component(id, "instance ID")?;
                self.sem_dir.join(format!("{action}.{id}"))
            }
        };
        Ok(path)
    }

    /// Check whether the marker exists
    pub async fn has_run(&self, action: &str, freq: Frequency) -> Result<bool, InitError> {
        let path = self.sem_path(action, freq)?;
        let exists = fs::try_exists(&path).await?;
        debug!(
            "Semaphore check for {} ({}): {} -> {}",
            action,
            freq,
            path.display(),
            if exists { "skip" } else { "run" }
        );
        Ok(exists)
    }

    /// Create the marker if it does not exist yet
    ///
    /// Returns `Ok(false)` if another caller already holds the marker. Any
    /// other filesystem failure is returned as an error so a broken store is
    /// never mistaken for a held lock.
    pub async fn acquire(&self, action: &str, freq: Frequency) -> Result<bool, InitError> {
        let path = self.sem_path(action, freq)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("Semaphore already held: {}", path.display());
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let written = async {
            file.write_all(timestamp().as_bytes()).await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        // A marker that was never completed must not read as "ran"
        if let Err(e) = written {
            discard(&path).await;
            return Err(e.into());
        }

        debug!("Created semaphore: {}", path.display());
        Ok(true)
    }

    /// Remove the marker so the action runs again
    ///
    /// Returns `Ok(true)` if the marker was removed or never existed.
    pub async fn clear(&self, action: &str, freq: Frequency) -> Result<bool, InitError> {
        let path = self.sem_path(action, freq)?;

        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed semaphore: {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => {
                warn!("Failed to remove semaphore {}: {}", path.display(), e);
                Ok(false)
            }
        }
    }

    /// Reject a request whose frequency differs from the one first recorded
    pub async fn check_frequency(&self, action: &str, freq: Frequency) -> Result<(), InitError> {
        validate_component(action, "action name")?;
        let path = self.frequency_path(action);

        let recorded = match fs::read_to_string(&path).await {
            Ok(content) => content,
            // No registry directory means nothing is recorded yet
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let recorded = recorded.trim();
        if recorded != freq.as_str() {
            return Err(InitError::FrequencyMismatch {
                action: action.to_string(),
                recorded: recorded.to_string(),
                requested: freq.to_string(),
            });
        }
        Ok(())
    }

    async fn record_frequency(&self, action: &str, freq: Frequency) -> Result<(), InitError> {
        let path = self.frequency_path(action);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(mut file) => {
                file.write_all(freq.as_str().as_bytes()).await?;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn frequency_path(&self, action: &str) -> PathBuf {
        self.sem_dir.join(FREQUENCY_DIR).join(action)
    }

    /// Run `op` unless the action already ran at this frequency
    ///
    /// Returns `Ok(None)` when skipped. When `op` fails and
    /// `clear_on_failure` is set, the marker is removed so the next boot
    /// retries; the error is returned either way.
    pub async fn run_gated<F, Fut, T>(
        &self,
        action: &str,
        freq: Frequency,
        clear_on_failure: bool,
        op: F,
    ) -> Result<Option<T>, InitError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, InitError>>,
    {
        self.check_frequency(action, freq).await?;

        if self.has_run(action, freq).await? {
            debug!("Skipping {} ({}): already ran", action, freq);
            return Ok(None);
        }

        if !self.acquire(action, freq).await? {
            return Err(InitError::LockAcquisition {
                action: action.to_string(),
            });
        }
        if let Err(e) = self.record_frequency(action, freq).await {
            // The action never ran, so the marker has to go
            warn!("Could not record frequency for {}: {}", action, e);
            if !self.clear(action, freq).await? {
                warn!("Semaphore for {} left behind without a run", action);
            }
            return Err(e);
        }

        info!("Running {} ({})", action, freq);
        match op().await {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                if clear_on_failure && !self.clear(action, freq).await? {
                    warn!("Could not clear semaphore for {} after failure", action);
                }
                Err(e)
            }
        }
    }

    /// List all markers in the persistent semaphore directory
    pub async fn list(&self) -> Result<Vec<String>, InitError> {
        let mut semaphores = Vec::new();

        if fs::try_exists(&self.sem_dir).await? {
            let mut entries = fs::read_dir(&self.sem_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_file() {
                    continue;
                }
                if let Some(name) = entry.file_name().to_str() {
                    semaphores.push(name.to_string());
                }
            }
        }

        semaphores.sort();
        Ok(semaphores)
    }

    /// Clear all persistent semaphores
    pub async fn clear_all(&self) -> Result<(), InitError> {
        if fs::try_exists(&self.sem_dir).await? {
            fs::remove_dir_all(&self.sem_dir).await?;
            debug!("Cleared all semaphores in: {}", self.sem_dir.display());
        }
        Ok(())
    }
}

/// Remove a half-written marker
async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        warn!("Failed to remove incomplete semaphore {}: {}", path.display(), e);
    }
}

/// Action names and instance IDs become file names
fn validate_component(value: &str, what: &str) -> Result<(), InitError> {
    if value.is_empty() || value.starts_with('.') || value.contains('/') || value.contains('\0') {
        return Err(InitError::InvalidData(format!(
            "Invalid {what}: {value:?}"
        )));
    }
    Ok(())
}

/// Seconds since the epoch with microsecond precision
fn timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    format!("{}.{:06}\n", duration.as_secs(), duration.subsec_micros())
}
