//! Error types for instance-init

use thiserror::Error;

/// Main error type for instance-init operations
#[derive(Error, Debug)]
pub enum InitError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Datasource error: {0}")]
    Datasource(String),

    #[error("No datasource found")]
    NoDatasourceFound,

    #[error("Failed to acquire lock on '{action}'")]
    LockAcquisition { action: String },

    #[error("Action '{action}' was recorded with frequency {recorded}, refusing to run it as {requested}")]
    FrequencyMismatch {
        action: String,
        recorded: String,
        requested: String,
    },

    #[error("Instance ID is required for once-per-instance semaphores")]
    MissingInstanceId,

    #[error("Datasource cache is unusable: {0}")]
    CacheCorruption(String),

    #[error("Handler '{handler}' failed: {message}")]
    HandlerFailed { handler: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Command execution failed: {0}")]
    Command(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl InitError {
    /// Create a handler error
    pub fn handler(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HandlerFailed {
            handler: handler.into(),
            message: message.into(),
        }
    }

    /// Whether this error must end the whole run
    ///
    /// Lock and handler failures only cost the affected action for this boot.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::LockAcquisition { .. } | Self::HandlerFailed { .. } | Self::CacheCorruption(_)
        )
    }
}

impl From<reqwest::Error> for InitError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}
