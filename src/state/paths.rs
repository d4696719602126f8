//! Standard instance-init paths
//!
//! Defines the directory structure used for state, semaphores and caches.

use std::path::{Path, PathBuf};

/// Base directory for persistent state
pub const CLOUD_DIR: &str = "/var/lib/cloud";

/// System configuration directory
pub const CONFIG_DIR: &str = "/etc/cloud";

/// Volatile directory, expected on a tmpfs cleared at every boot
pub const RUN_DIR: &str = "/run/cloud-init";

/// Standard instance-init paths
#[derive(Debug, Clone)]
pub struct CloudPaths {
    /// Base state directory (default: /var/lib/cloud)
    pub base: PathBuf,
    /// Config directory (default: /etc/cloud)
    pub config: PathBuf,
    /// Per-boot directory (default: /run/cloud-init)
    pub run: PathBuf,
}

impl Default for CloudPaths {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudPaths {
    /// Create with default paths
    pub fn new() -> Self {
        Self {
            base: PathBuf::from(CLOUD_DIR),
            config: PathBuf::from(CONFIG_DIR),
            run: PathBuf::from(RUN_DIR),
        }
    }

    /// Create with everything rooted under one directory (useful for testing)
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            base: root.join("var/lib/cloud"),
            config: root.join("etc/cloud"),
            run: root.join("run/cloud-init"),
        }
    }

    /// Create with custom base, config and run directories
    pub fn with_dirs(
        base: impl AsRef<Path>,
        config: impl AsRef<Path>,
        run: impl AsRef<Path>,
    ) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
            config: config.as_ref().to_path_buf(),
            run: run.as_ref().to_path_buf(),
        }
    }

    // ==================== Base Directories ====================

    /// /var/lib/cloud/data - Cached data directory
    pub fn data_dir(&self) -> PathBuf {
        self.base.join("data")
    }

    /// /var/lib/cloud/sem - Persistent semaphores (once, once-per-instance)
    pub fn sem_dir(&self) -> PathBuf {
        self.base.join("sem")
    }

    /// /run/cloud-init/sem - Every-boot semaphores
    pub fn boot_sem_dir(&self) -> PathBuf {
        self.run.join("sem")
    }

    /// /var/lib/cloud/seed - Local seed directory
    pub fn seed_dir(&self) -> PathBuf {
        self.base.join("seed")
    }

    // ==================== Data Paths ====================

    /// /var/lib/cloud/data/cache - Datasource cache directory
    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir().join("cache")
    }

    /// /var/lib/cloud/data/cache/datasource.json - Serialized active datasource
    pub fn datasource_cache(&self) -> PathBuf {
        self.cache_dir().join("datasource.json")
    }

    /// /var/lib/cloud/data/user-data.txt - Raw user-data
    pub fn user_data_raw(&self) -> PathBuf {
        self.data_dir().join("user-data.txt")
    }

    /// /var/lib/cloud/data/user-data.txt.i - Decoded user-data
    pub fn user_data(&self) -> PathBuf {
        self.data_dir().join("user-data.txt.i")
    }

    /// /var/lib/cloud/data/scripts - User scripts extracted from user-data
    pub fn user_scripts_dir(&self) -> PathBuf {
        self.data_dir().join("scripts")
    }

    /// /var/lib/cloud/data/cloud-config.txt - Combined cloud-config parts
    pub fn cloud_config(&self) -> PathBuf {
        self.data_dir().join("cloud-config.txt")
    }

    /// /var/lib/cloud/data/instance-id - Current instance ID
    pub fn cached_instance_id(&self) -> PathBuf {
        self.data_dir().join("instance-id")
    }

    /// /var/lib/cloud/data/previous-instance-id - Previous instance ID
    pub fn previous_instance_id(&self) -> PathBuf {
        self.data_dir().join("previous-instance-id")
    }

    // ==================== Config Paths ====================

    /// /etc/cloud/cloud.cfg - Main config file
    pub fn main_config(&self) -> PathBuf {
        self.config.join("cloud.cfg")
    }

    /// /etc/cloud/cloud.cfg.d - Config drop-in directory
    pub fn config_d(&self) -> PathBuf {
        self.config.join("cloud.cfg.d")
    }
}
