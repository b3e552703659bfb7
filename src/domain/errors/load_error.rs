//! Image load error types.

use thiserror::Error;

/// Error raised by one load attempt.
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
pub enum LoadError {
    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("http {status} fetching {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("io error reading {path}: {message}")]
    Io { path: String, message: String },

    #[error("stream error for {id}: {message}")]
    Stream { id: String, message: String },

    #[error("decode error: {message}")]
    Decode { message: String },
}

impl LoadError {
    /// Creates network error.
    #[must_use]
    pub fn network(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates HTTP status error.
    #[must_use]
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates I/O error.
    #[must_use]
    pub fn io(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Io {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates stream error.
    #[must_use]
    pub fn stream(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Stream {
            id: id.into(),
            message: message.into(),
        }
    }

    /// Creates decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Returns whether another attempt may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Every error observed during one load, in raise order.
#[derive(Debug, Clone, Error)]
#[error("image load failed with {} error(s): {}", .errors.len(), summary(.errors))]
pub struct AggregateLoadError {
    errors: Vec<LoadError>,
}

fn summary(errors: &[LoadError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl AggregateLoadError {
    /// Wraps collected errors.
    #[must_use]
    pub const fn new(errors: Vec<LoadError>) -> Self {
        Self { errors }
    }

    /// Returns the errors in raise order.
    #[must_use]
    pub fn errors(&self) -> &[LoadError] {
        &self.errors
    }

    /// Consumes the aggregate.
    #[must_use]
    pub fn into_errors(self) -> Vec<LoadError> {
        self.errors
    }

    /// Returns the number of errors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Returns true if no error was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Terminal failure of an awaited load.
#[derive(Debug, Clone, Error)]
pub enum LoadFailure {
    /// One or more errors were raised before the load finished.
    #[error(transparent)]
    Aggregate(#[from] AggregateLoadError),

    /// The work was cancelled before it finished.
    #[error("image load was cancelled before completion")]
    Cancelled,
}

impl LoadFailure {
    /// Returns the collected errors, empty for cancellation.
    #[must_use]
    pub fn errors(&self) -> &[LoadError] {
        match self {
            Self::Aggregate(aggregate) => aggregate.errors(),
            Self::Cancelled => &[],
        }
    }
}
