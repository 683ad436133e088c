//! Error types shared across the profiler, collectors, loggers, configurators
//! and the aggregator server.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced via the engine's `onError`/`onInfo` channel.
///
/// Per the component contracts, none of these are allowed to propagate out
/// of a public facade call (`Profiler::begin`/`end`/`enabled`/`flush`/`log`);
/// callers catch them at that boundary and report them instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    ConfigParse(String),

    #[error("config IO error: {0}")]
    ConfigIo(String),

    #[error("logger IO error: {0}")]
    LoggerIo(String),

    #[error("network transient error: {0}")]
    NetworkTransient(String),

    #[error("unknown sort column: {0}")]
    SortError(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("archive error: {0}")]
    Archive(String),
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        Error::Archive(err.to_string())
    }
}
