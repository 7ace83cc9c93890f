//! Error types shared across the engine.
//!
//! Only fetch and configuration failures ever reach a caller as hard errors.
//! Cache and refresh failures are carried as values and logged.

use std::path::PathBuf;
use thiserror::Error;

/// Failure of an outbound request after the retry policy gave up.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Upstream answered with a non-success status.
    #[error("upstream returned HTTP {status}: {message}")]
    Upstream { status: u16, message: String },

    /// The request never produced a response.
    #[error("transport failure: {0}")]
    Transport(String),

    /// No valid access token was available for the request.
    #[error("no valid access token available")]
    Unauthenticated,

    /// Upstream returned a body we could not interpret.
    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

impl FetchError {
    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Disk failure inside the content cache. Never propagated past the cache.
#[derive(Debug, Error)]
pub enum CacheIoError {
    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode metadata for {key}: {source}")]
    Metadata {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A single failed re-authorization batch.
#[derive(Debug, Clone, Error)]
#[error("refresh batch of {} ids failed: {cause}", ids.len())]
pub struct RefreshError {
    pub ids: Vec<String>,
    pub cause: FetchError,
}

/// Errors returned by the playback state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaybackError {
    #[error("cannot load an empty sequence")]
    SequenceEmpty,

    #[error("player task is not running")]
    Stopped,
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid setting `{field}`: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}
