//! Error types for bench-history

use thiserror::Error;

/// Result type alias for bench-history operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for bench-history
#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to read file: {path}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file: {path}")]
    FileWriteError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Git error: {0}")]
    GitError(#[from] git2::Error),

    #[error("URL parse error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Regex error: {0}")]
    RegexError(#[from] regex::Error),

    /// An artifact that simply does not exist (no run, no result file)
    #[error("Not found: {0}")]
    NotFound(String),

    /// The commit graph or run index is unusable
    #[error("Failed to load data: {0}")]
    LoadError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Aggregation superseded by a newer request")]
    Superseded,

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error only means "no data here", which is the normal state
    /// for commits that were never benchmarked.
    pub fn is_absence(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
