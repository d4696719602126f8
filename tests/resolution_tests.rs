//! Integration tests for datasource resolution and the datasource cache

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tokio_test::assert_ok;

use instance_init::InitError;
use instance_init::config::DatasourceSelection;
use instance_init::datasources::mock::MockDatasource;
use instance_init::datasources::{Datasource, DatasourceCache, DatasourceRegistry, resolve};

/// Registry of mocks named a, b, c with per-name fetch counters
struct Fixture {
    registry: DatasourceRegistry,
    counters: Vec<Arc<AtomicUsize>>,
}

impl Fixture {
    fn new(mocks: Vec<MockDatasource>) -> Self {
        let mut registry = DatasourceRegistry::new();
        let mut counters = Vec::new();

        for mock in mocks {
            let counter = Arc::new(AtomicUsize::new(0));
            let mock = mock.with_fetch_counter(Arc::clone(&counter));
            let name = mock.name().to_string();
            registry = registry.register(&name, move || Box::new(mock.clone()));
            counters.push(counter);
        }

        Self { registry, counters }
    }

    fn fetches(&self, idx: usize) -> usize {
        self.counters[idx].load(Ordering::SeqCst)
    }
}

fn cache(temp: &TempDir) -> DatasourceCache {
    DatasourceCache::new(temp.path().join("cache/datasource.json"))
}

#[tokio::test]
async fn test_first_successful_candidate_wins() {
    let temp = TempDir::new().unwrap();
    let fixture = Fixture::new(vec![
        MockDatasource::new().with_name("a").with_available(false),
        MockDatasource::new().with_name("b").with_instance_id("i-from-b"),
        MockDatasource::new().with_name("c").with_instance_id("i-from-c"),
    ]);

    let ds = resolve(&cache(&temp), &fixture.registry, &DatasourceSelection::Auto)
        .await
        .unwrap();

    assert_eq!(ds.name(), "b");
    assert_eq!(ds.instance_id(), "i-from-b");
    assert_eq!(fixture.fetches(0), 1);
    assert_eq!(fixture.fetches(1), 1);
    // Later candidates are never touched
    assert_eq!(fixture.fetches(2), 0);
}

#[tokio::test]
async fn test_failing_candidate_is_skipped() {
    let temp = TempDir::new().unwrap();
    let fixture = Fixture::new(vec![
        MockDatasource::new().with_name("a").with_fetch_error("metadata service exploded"),
        MockDatasource::new().with_name("b").with_instance_id("i-b"),
    ]);

    let ds = assert_ok!(resolve(&cache(&temp), &fixture.registry, &DatasourceSelection::Auto).await);
    assert_eq!(ds.name(), "b");
}

#[tokio::test]
async fn test_explicit_list_order() {
    let temp = TempDir::new().unwrap();
    let fixture = Fixture::new(vec![
        MockDatasource::new().with_name("a").with_instance_id("i-a"),
        MockDatasource::new().with_name("b").with_instance_id("i-b"),
    ]);
    let selection = DatasourceSelection::List(vec!["unknown".to_string(), "B".to_string(), "a".to_string()]);

    let ds = resolve(&cache(&temp), &fixture.registry, &selection).await.unwrap();

    assert_eq!(ds.name(), "b");
    assert_eq!(fixture.fetches(0), 0);
}

#[tokio::test]
async fn test_no_datasource_found() {
    let temp = TempDir::new().unwrap();
    let fixture = Fixture::new(vec![
        MockDatasource::new().with_name("a").with_available(false),
        MockDatasource::new().with_name("b").with_fetch_error("nope"),
    ]);

    let result = resolve(&cache(&temp), &fixture.registry, &DatasourceSelection::Auto).await;

    assert!(matches!(result, Err(InitError::NoDatasourceFound)));
    assert!(!cache(&temp).path().exists());
}

#[tokio::test]
async fn test_empty_instance_id_rejected() {
    let temp = TempDir::new().unwrap();
    let fixture = Fixture::new(vec![
        MockDatasource::new().with_name("a").with_instance_id(""),
        MockDatasource::new().with_name("b").with_instance_id("i-b"),
    ]);

    let ds = resolve(&cache(&temp), &fixture.registry, &DatasourceSelection::Auto)
        .await
        .unwrap();
    assert_eq!(ds.name(), "b");
}

#[tokio::test]
async fn test_cache_hit_skips_probing() {
    let temp = TempDir::new().unwrap();
    let fixture = Fixture::new(vec![
        MockDatasource::new()
            .with_name("a")
            .with_instance_id("i-cached")
            .with_hostname("cached-host")
            .with_public_keys(vec!["ssh-ed25519 AAAA k".to_string()])
            .with_user_data(b"#!/bin/sh\necho cached\n".to_vec()),
    ]);

    let first = resolve(&cache(&temp), &fixture.registry, &DatasourceSelection::Auto)
        .await
        .unwrap();
    let second = resolve(&cache(&temp), &fixture.registry, &DatasourceSelection::Auto)
        .await
        .unwrap();

    assert_eq!(fixture.fetches(0), 1);
    assert_eq!(second.name(), first.name());
    assert_eq!(second.instance_id(), "i-cached");
    assert_eq!(second.hostname(), Some("cached-host"));
    assert_eq!(second.public_keys(), first.public_keys());
    assert_eq!(second.raw_user_data(), first.raw_user_data());
    assert_eq!(second.locale(), first.locale());
    assert_eq!(second.local_mirror(), first.local_mirror());
}

#[tokio::test]
async fn test_corrupt_cache_falls_back_to_discovery() {
    let temp = TempDir::new().unwrap();
    let cache = cache(&temp);
    std::fs::create_dir_all(cache.path().parent().unwrap()).unwrap();
    std::fs::write(cache.path(), b"{\"version\": 1, \"name\": ").unwrap();

    let fixture = Fixture::new(vec![MockDatasource::new().with_name("a").with_instance_id("i-fresh")]);

    let ds = resolve(&cache, &fixture.registry, &DatasourceSelection::Auto)
        .await
        .unwrap();

    assert_eq!(ds.instance_id(), "i-fresh");
    assert_eq!(fixture.fetches(0), 1);

    // The fresh result replaced the corrupt record
    let cached = cache.load().await.unwrap().unwrap();
    assert_eq!(cached.instance_id(), "i-fresh");
}

#[tokio::test]
async fn test_cleared_cache_rediscovers() {
    let temp = TempDir::new().unwrap();
    let fixture = Fixture::new(vec![MockDatasource::new().with_name("a")]);

    resolve(&cache(&temp), &fixture.registry, &DatasourceSelection::Auto)
        .await
        .unwrap();
    cache(&temp).clear().await.unwrap();
    resolve(&cache(&temp), &fixture.registry, &DatasourceSelection::Auto)
        .await
        .unwrap();

    assert_eq!(fixture.fetches(0), 2);
}
