//! Error type returned by the reference lifecycle operations.
//!
//! Storage and capability traits return [`anyhow::Error`]; this layer
//! sorts failures into the few cases callers (CLI, HTTP) need to tell apart.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The source could not be fetched. No reference was created.
    #[error("failed to fetch {source_url}: {cause}")]
    Fetch {
        source_url: String,
        #[source]
        cause: anyhow::Error,
    },

    #[error("reference not found: {id}")]
    NotFound { id: String },

    #[error("invalid reference type: '{0}'")]
    InvalidKind(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl Error {
    /// Stable machine-readable code, used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Fetch { .. } => "fetch_failed",
            Error::NotFound { .. } => "not_found",
            Error::InvalidKind(_) => "invalid_type",
            Error::Storage(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_message_names_source() {
        let err = Error::Fetch {
            source_url: "https://x.test".into(),
            cause: anyhow::anyhow!("HTTP 404"),
        };
        assert_eq!(err.to_string(), "failed to fetch https://x.test: HTTP 404");
        assert_eq!(err.code(), "fetch_failed");
    }

    #[test]
    fn test_storage_wraps_anyhow() {
        let err: Error = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, Error::Storage(_)));
        assert_eq!(err.to_string(), "disk full");
    }
}
