//! Error types for the browser environment.

use std::path::PathBuf;

use thiserror::Error;

/// Failures reported by the browser seam (one tab or the whole browser).
#[derive(Debug, Error)]
pub enum DriverError {
    /// The browser process could not be launched or attached to.
    #[error("Browser launch failed: {0}")]
    Launch(String),

    /// A browser protocol call failed.
    #[error("Browser error: {0}")]
    Browser(String),

    /// A bounded wait ran out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// No element matched the xpath or element id.
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    /// JavaScript evaluation threw or returned an unexpected shape.
    #[error("JavaScript error: {0}")]
    Script(String),

    /// The tab is gone.
    #[error("Page closed: {0}")]
    PageClosed(String),
}

impl From<serde_json::Error> for DriverError {
    fn from(e: serde_json::Error) -> Self {
        DriverError::Script(format!("unexpected script result: {e}"))
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Fatal environment errors. Action failures never surface here; they are
/// reported through `Info::fail_error` instead.
#[derive(Debug, Error)]
pub enum EnvError {
    /// `step` (or a step-like call) was issued before `reset`, or after `close`.
    #[error("Environment not ready: call reset before step")]
    NotReady,

    /// The config file named in the reset options does not exist.
    #[error("Config file {} does not exist", .0.display())]
    ConfigNotFound(PathBuf),

    /// The config file exists but is not valid JSON for an instance config.
    #[error("Invalid config file {}: {source}", path.display())]
    InvalidConfig {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// A textual action descriptor did not match the grammar.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActionParseError {
    #[error("Empty action")]
    Empty,

    #[error("Unknown action verb: {0}")]
    UnknownVerb(String),

    #[error("Malformed arguments for '{verb}': {detail}")]
    Malformed { verb: String, detail: String },

    #[error("Invalid key combination: {0}")]
    InvalidKey(String),
}

/// Trajectory persistence errors.
#[derive(Debug, Error)]
pub enum TrajectoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode trajectory: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Failed to decode trajectory: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}
