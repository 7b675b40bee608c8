//! Error types for feed fetching and query validation.

/// Feed-level failure. Aborts one fetch cycle for one source.
#[derive(thiserror::Error, Debug)]
pub enum FeedError {
    /// Transport failure: connect, timeout, body read.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The upstream answered with a non-success status.
    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    /// The station registry document could not be parsed.
    #[error("malformed station registry: {message}")]
    Registry { message: String },
}

impl FeedError {
    pub fn registry(message: impl Into<String>) -> Self {
        Self::Registry {
            message: message.into(),
        }
    }
}

/// Rejected query parameters.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum QueryError {
    #[error("{name} = {value} is outside [{min}, {max}]")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}
