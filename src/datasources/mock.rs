//! Mock datasource for testing
//!
//! Provides a configurable mock datasource that can be used in unit and
//! integration tests.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::Datasource;
use crate::InitError;

/// Mock datasource for testing
///
/// # Example
/// ```
/// use instance_init::datasources::mock::MockDatasource;
///
/// let mock = MockDatasource::new()
///     .with_available(true)
///     .with_instance_id("i-test-123")
///     .with_user_data(b"#!/bin/sh\necho hi".to_vec());
/// ```
#[derive(Debug, Clone)]
pub struct MockDatasource {
    name: String,
    available: bool,
    instance_id: String,
    hostname: Option<String>,
    public_keys: Vec<String>,
    user_data: Vec<u8>,
    fetch_error: Option<String>,
    fetch_count: Arc<AtomicUsize>,
}

impl MockDatasource {
    /// Create a new mock datasource with default values
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            available: true,
            instance_id: "i-mock".to_string(),
            hostname: None,
            public_keys: Vec::new(),
            user_data: Vec::new(),
            fetch_error: None,
            fetch_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Set the datasource name
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Set whether `fetch` succeeds
    pub fn with_available(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    /// Set the instance ID
    pub fn with_instance_id(mut self, instance_id: &str) -> Self {
        self.instance_id = instance_id.to_string();
        self
    }

    /// Set the hostname
    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.hostname = Some(hostname.to_string());
        self
    }

    /// Set the public SSH keys
    pub fn with_public_keys(mut self, keys: Vec<String>) -> Self {
        self.public_keys = keys;
        self
    }

    /// Set the raw user-data
    pub fn with_user_data(mut self, data: Vec<u8>) -> Self {
        self.user_data = data;
        self
    }

    /// Configure `fetch` to return an error
    pub fn with_fetch_error(mut self, error: &str) -> Self {
        self.fetch_error = Some(error.to_string());
        self
    }

    /// Share a fetch counter, e.g. across instances built by a factory
    pub fn with_fetch_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.fetch_count = counter;
        self
    }

    /// Number of times `fetch` has been called
    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }
}

impl Default for MockDatasource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Datasource for MockDatasource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&mut self) -> Result<bool, InitError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = &self.fetch_error {
            return Err(InitError::Datasource(error.clone()));
        }
        Ok(self.available)
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
