//! Boot-time orchestration
//!
//! A run resolves one datasource, records which instance it is on, then
//! performs its actions through frequency-gated calls:
//! 1. consume-user-data - decode the payload and dispatch it to handlers
//! 2. user-scripts - run the scripts that payload left behind

pub mod init;
pub mod scripts;

use std::future::Future;

use crate::InitError;
use crate::config::InitConfig;
use crate::datasources::{self, Datasource, DatasourceCache, DatasourceRegistry};
use crate::handlers::HandlerContext;
use crate::state::{CloudPaths, Frequency, InstanceState, SemaphoreStore};

/// Everything a run needs, passed explicitly
pub struct InitContext {
    paths: CloudPaths,
    config: InitConfig,
    datasource: Box<dyn Datasource>,
}

impl InitContext {
    pub fn new(paths: CloudPaths, config: InitConfig, datasource: Box<dyn Datasource>) -> Self {
        Self {
            paths,
            config,
            datasource,
        }
    }

    /// Resolve the datasource (cache first, then discovery) and build a context
    pub async fn resolve(
        paths: CloudPaths,
        config: InitConfig,
        registry: &DatasourceRegistry,
    ) -> Result<Self, InitError> {
        let cache = DatasourceCache::from_paths(&paths);
        let datasource = datasources::resolve(&cache, registry, &config.cloud_type).await?;
        Ok(Self::new(paths, config, datasource))
    }

    pub fn paths(&self) -> &CloudPaths {
        &self.paths
    }

    pub fn config(&self) -> &InitConfig {
        &self.config
    }

    pub fn datasource(&self) -> &dyn Datasource {
        self.datasource.as_ref()
    }

    pub fn datasource_name(&self) -> &str {
        self.datasource.name()
    }

    pub fn instance_id(&self) -> &str {
        self.datasource.instance_id()
    }

    pub fn raw_user_data(&self) -> &[u8] {
        self.datasource.raw_user_data()
    }

    pub fn public_keys(&self) -> &[String] {
        self.datasource.public_keys()
    }

    pub fn hostname(&self) -> Option<&str> {
        self.datasource.hostname()
    }

    pub fn locale(&self) -> &str {
        self.datasource.locale()
    }

    pub fn local_mirror(&self) -> &str {
        self.datasource.local_mirror()
    }

    /// Instance bookkeeping for this context's paths
    pub fn state(&self) -> InstanceState {
        InstanceState::with_paths(self.paths.clone())
    }

    /// Semaphore store scoped to the active instance
    pub fn semaphores(&self) -> SemaphoreStore {
        self.state().semaphores(Some(self.instance_id()))
    }

    /// Run `op` at most once per `freq` window
    ///
    /// `Ok(None)` when it already ran in the current window.
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
        self.semaphores()
            .run_gated(action, freq, clear_on_failure, op)
            .await
    }

    /// Fresh handler context for a dispatch
    pub fn handler_context(&self) -> HandlerContext {
        HandlerContext::new(self.paths.clone(), &self.config.upstart_dir)
    }
}
