//! Content handlers
//!
//! A handler owns one or more content types. For every dispatch it sees
//! `begin` once, `handle` once per routed part, and `end` once. Handlers
//! may register further handlers through the [`HandlerContext`]; those
//! take effect from the next part on.

pub mod cloud_config;
pub mod part_handler;
pub mod script;
pub mod upstart;

pub use cloud_config::CloudConfigHandler;
pub use part_handler::PartHandlerLoader;
pub use script::ScriptHandler;
pub use upstart::UpstartHandler;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::InitError;
use crate::state::CloudPaths;
use crate::userdata::Part;
use crate::userdata::types::essence;

/// A content-type handler
#[async_trait]
pub trait Handler: Send + Sync {
    /// Name used in logs and failure reports
    fn name(&self) -> &str;

    /// Called once before any part is dispatched
    async fn begin(&mut self, _ctx: &mut HandlerContext) -> Result<(), InitError> {
        Ok(())
    }

    /// Process a single part
    async fn handle(&mut self, ctx: &mut HandlerContext, part: &Part) -> Result<(), InitError>;

    /// Called once after every part has been dispatched
    async fn end(&mut self, _ctx: &mut HandlerContext) -> Result<(), InitError> {
        Ok(())
    }
}

/// A handler waiting to be added to the registry
pub struct Registration {
    pub content_types: Vec<String>,
    pub handler: Box<dyn Handler>,
}

/// Shared state passed to every handler call
pub struct HandlerContext {
    paths: CloudPaths,
    upstart_dir: PathBuf,
    pending: Vec<Registration>,
}

impl HandlerContext {
    pub fn new(paths: CloudPaths, upstart_dir: impl AsRef<Path>) -> Self {
        Self {
            paths,
            upstart_dir: upstart_dir.as_ref().to_path_buf(),
            pending: Vec::new(),
        }
    }

    pub fn paths(&self) -> &CloudPaths {
        &self.paths
    }

    /// Directory upstart job definitions are installed into
    pub fn upstart_dir(&self) -> &Path {
        &self.upstart_dir
    }

    /// Queue a handler for `content_types`
    ///
    /// It is added to the registry once the current part is done.
    pub fn register<S: AsRef<str>>(&mut self, content_types: &[S], handler: Box<dyn Handler>) {
        self.pending.push(Registration {
            content_types: content_types.iter().map(|s| s.as_ref().to_string()).collect(),
            handler,
        });
    }

    /// Take queued registrations in the order they were made
    pub fn take_registrations(&mut self) -> Vec<Registration> {
        std::mem::take(&mut self.pending)
    }
}

/// Handlers in registration order, routed by content type
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Box<dyn Handler>>,
    routes: HashMap<String, usize>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script, cloud-config, upstart and part-handler handlers
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(&[script::CONTENT_TYPE], Box::new(ScriptHandler::new()));
        registry.register(&[cloud_config::CONTENT_TYPE], Box::new(CloudConfigHandler::new()));
        registry.register(&[upstart::CONTENT_TYPE], Box::new(UpstartHandler::new()));
        registry.register(&[part_handler::CONTENT_TYPE], Box::new(PartHandlerLoader::new()));
        registry
    }

    /// Add a handler, returning its index
    ///
    /// A content type already owned by another handler is rerouted to this
    /// one; the earlier handler stays registered for its other types and
    /// still takes part in begin/end.
    pub fn register<S: AsRef<str>>(&mut self, content_types: &[S], handler: Box<dyn Handler>) -> usize {
        let idx = self.handlers.len();
        self.handlers.push(handler);
        for content_type in content_types {
            self.routes.insert(essence(content_type.as_ref()), idx);
        }
        idx
    }

    /// Index of the handler owning `content_type`
    pub fn lookup(&self, content_type: &str) -> Option<usize> {
        self.routes.get(&essence(content_type)).copied()
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Box<dyn Handler>> {
        self.handlers.get_mut(idx)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Handler names in registration order
    pub fn names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }
}

/// Name a part may be stored under inside a directory
///
/// Path separators are replaced so a part can never escape the directory.
pub fn sanitize_filename(name: &str) -> String {
    let name = name.replace('/', "_");
    match name.as_str() {
        "" | "." | ".." => "_".repeat(name.len().max(1)),
        _ => name,
    }
}

/// Filename of a part, with a fallback for parts that were never named
pub(crate) fn part_filename(part: &Part) -> String {
    sanitize_filename(part.filename.as_deref().unwrap_or("part"))
}
