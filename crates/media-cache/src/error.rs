use std::sync::Arc;

/// Errors surfaced by the range cache and the asset preloader.
///
/// The type is `Clone` so a single upstream failure can be fanned out to every
/// request waiting on the same transfer.
#[derive(Debug, thiserror::Error, Clone)]
pub enum CacheError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Corrupt cache entry: {0}")]
    Corrupt(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Network error: {source}")]
    Http {
        #[from]
        source: Arc<reqwest::Error>,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: Arc<std::io::Error>,
    },

    #[error("Requested range (offset {offset}, length {length}) lies outside the resource")]
    InvalidRange { offset: u64, length: u64 },

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Cache manager has shut down")]
    Shutdown,
}

impl CacheError {
    /// Whether the error originated from the network side of a transfer.
    pub fn is_network(&self) -> bool {
        matches!(self, CacheError::Upstream(_) | CacheError::Http { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CacheError::Cancelled)
    }
}

// Manual implementations because of the Arc wrapping.
impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        CacheError::Http {
            source: Arc::new(err),
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io {
            source: Arc::new(err),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Corrupt(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_network_errors() {
        assert!(CacheError::Upstream("reset".into()).is_network());
        assert!(!CacheError::Cancelled.is_network());
        assert!(CacheError::Cancelled.is_cancelled());
    }

    #[test]
    fn io_errors_clone_through_arc() {
        let err = CacheError::from(std::io::Error::other("disk full"));
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
        assert!(cloned.to_string().contains("disk full"));
    }
}
