//! Datasource implementations and discovery
//!
//! Datasources provide the instance identity, metadata and raw user-data
//! for this boot. Exactly one datasource is active per run: the cached one
//! if the cache is usable, otherwise the first configured candidate whose
//! `fetch` succeeds.

pub mod cache;
pub mod ec2;
pub mod mock;
pub mod nocloud;

pub use cache::{CachedDatasource, DatasourceCache, DatasourceRecord};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{DatasourceSelection, normalize_name};
use crate::state::CloudPaths;
use crate::InitError;

/// Locale reported when the datasource has no opinion
pub const DEFAULT_LOCALE: &str = "en_US.UTF-8";

/// Package mirror reported when the datasource has no opinion
pub const DEFAULT_MIRROR: &str = "http://archive.ubuntu.com/ubuntu/";

/// Trait for cloud metadata datasources
///
/// Accessors are only meaningful after `fetch` returned `Ok(true)`.
#[async_trait]
pub trait Datasource: Send + Sync {
    /// Registry name of this datasource (e.g., "ec2", "nocloud")
    fn name(&self) -> &str;

    /// Retrieve metadata and user-data
    ///
    /// `Ok(false)` means this is not the environment we are running in.
    /// `Err` is reserved for unexpected failures.
    async fn fetch(&mut self) -> Result<bool, InitError>;

    /// Unique identity of the running instance
    fn instance_id(&self) -> &str;

    /// Raw user-data payload, possibly empty
    fn raw_user_data(&self) -> &[u8];

    /// Public SSH keys to install
    fn public_keys(&self) -> &[String] {
        &[]
    }

    /// Hostname provided by the environment
    fn hostname(&self) -> Option<&str> {
        None
    }

    /// System locale
    fn locale(&self) -> &str {
        DEFAULT_LOCALE
    }

    /// Nearest package mirror
    fn local_mirror(&self) -> &str {
        DEFAULT_MIRROR
    }
}

/// Constructs a fresh, unfetched datasource
pub type DatasourceFactory = Box<dyn Fn() -> Box<dyn Datasource> + Send + Sync>;

/// Known datasource variants and the automatic discovery order
pub struct DatasourceRegistry {
    factories: Vec<(String, DatasourceFactory)>,
    auto_order: Vec<String>,
}

impl Default for DatasourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DatasourceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
            auto_order: Vec::new(),
        }
    }

    /// Registry with the built-in datasources, probed NoCloud first
    pub fn builtin(paths: &CloudPaths) -> Self {
        let seed_dir = paths.seed_dir();
        Self::new()
            .register(nocloud::NAME, move || {
                Box::new(nocloud::NoCloud::with_seed_root(&seed_dir))
            })
            .register(ec2::NAME, || Box::new(ec2::Ec2::new()))
    }

    /// Register a datasource; it joins the end of the automatic order
    pub fn register<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Datasource> + Send + Sync + 'static,
    {
        let name = normalize_name(name);
        self.factories.retain(|(n, _)| *n != name);
        let factory: DatasourceFactory = Box::new(factory);
        self.factories.push((name.clone(), factory));
        if !self.auto_order.contains(&name) {
            self.auto_order.push(name);
        }
        self
    }

    /// Replace the automatic discovery order
    pub fn with_auto_order<I, S>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.auto_order = order.into_iter().map(|s| normalize_name(s.as_ref())).collect();
        self
    }

    /// Names to probe for a selection, in order
    pub fn candidates(&self, selection: &DatasourceSelection) -> Vec<String> {
        match selection {
            DatasourceSelection::Auto => self.auto_order.clone(),
            DatasourceSelection::List(names) => names.iter().map(|n| normalize_name(n)).collect(),
        }
    }

    /// Construct a datasource by name
    pub fn create(&self, name: &str) -> Option<Box<dyn Datasource>> {
        let name = normalize_name(name);
        self.factories
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, factory)| factory())
    }
}

/// Resolve the active datasource
///
/// A usable cache wins without any probing. Otherwise candidates are
/// probed strictly in order and the first successful fetch becomes active;
/// later candidates are never constructed. The winner is written to the
/// cache before returning.
pub async fn resolve(
    cache: &DatasourceCache,
    registry: &DatasourceRegistry,
    selection: &DatasourceSelection,
) -> Result<Box<dyn Datasource>, InitError> {
    match cache.load().await {
        Ok(Some(cached)) => {
            info!(
                "Using cached datasource {} ({})",
                cached.name(),
                cached.instance_id()
            );
            return Ok(Box::new(cached));
        }
        Ok(None) => debug!("No cached datasource"),
        Err(e) => warn!("Ignoring datasource cache: {}", e),
    }

    let datasource = probe(registry, selection).await?;

    if let Err(e) = cache.store(datasource.as_ref()).await {
        warn!("Failed to cache datasource {}: {}", datasource.name(), e);
    }
    Ok(datasource)
}

/// Probe candidates in order, ignoring the cache
pub async fn probe(
    registry: &DatasourceRegistry,
    selection: &DatasourceSelection,
) -> Result<Box<dyn Datasource>, InitError> {
    for name in registry.candidates(selection) {
        let Some(mut ds) = registry.create(&name) else {
            warn!("Unknown datasource in config: {}", name);
            continue;
        };

        debug!("Probing datasource: {}", name);
        match ds.fetch().await {
            Ok(true) if ds.instance_id().is_empty() => {
                warn!("Datasource {} returned no instance ID", name);
            }
            Ok(true) => {
                info!("Detected datasource: {} ({})", name, ds.instance_id());
                return Ok(ds);
            }
            Ok(false) => debug!("Datasource {} not available", name),
            Err(e) => warn!("Datasource {} failed: {}", name, e),
        }
    }

    Err(InitError::NoDatasourceFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mock::MockDatasource;

    #[test]
    fn test_registry_candidates() {
        let registry = DatasourceRegistry::new()
            .register("A", || Box::new(MockDatasource::new()))
            .register("b", || Box::new(MockDatasource::new()));

        assert_eq!(registry.candidates(&DatasourceSelection::Auto), vec!["a", "b"]);
        assert_eq!(
            registry.candidates(&DatasourceSelection::List(vec![" B ".into()])),
            vec!["b"]
        );

        let reordered = registry.with_auto_order(["b", "a"]);
        assert_eq!(reordered.candidates(&DatasourceSelection::Auto), vec!["b", "a"]);
    }

    #[test]
    fn test_registry_create() {
        let registry = DatasourceRegistry::new()
            .register("mock", || Box::new(MockDatasource::new().with_name("mock")));

        assert!(registry.create("MOCK").is_some());
        assert!(registry.create("missing").is_none());
    }

    #[test]
    fn test_builtin_order() {
        let registry = DatasourceRegistry::builtin(&CloudPaths::new());
        assert_eq!(
            registry.candidates(&DatasourceSelection::Auto),
            vec!["nocloud", "ec2"]
        );
    }

    #[tokio::test]
    async fn test_probe_rejects_empty_instance_id() {
        let registry = DatasourceRegistry::new()
            .register("blank", || Box::new(MockDatasource::new().with_instance_id("")));

        let result = probe(&registry, &DatasourceSelection::Auto).await;
        assert!(matches!(result, Err(InitError::NoDatasourceFound)));
    }

    #[tokio::test]
    async fn test_probe_empty_selection() {
        let registry = DatasourceRegistry::new();
        let result = probe(&registry, &DatasourceSelection::List(vec![])).await;
        assert!(matches!(result, Err(InitError::NoDatasourceFound)));
    }
}
