use thiserror::Error;

/// Errors raised by the remote collection capability.
///
/// `is_transient()` separates failures worth another attempt (network
/// drops, rate limits, server errors, truncated transfers) from those that
/// will not change on retry.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Transient remote failure: {0}")]
    Transient(String),

    #[error("Remote operation failed: {0}")]
    Permanent(String),

    #[error("Asset no longer exists on the remote: {0}")]
    NotFound(String),

    #[error("Session is not authenticated (HTTP {status}), re-authenticate and retry")]
    Unauthenticated { status: u16 },

    #[error("HTTP error {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RemoteError {
    /// Map an unsuccessful HTTP status to its error category.
    pub fn from_status(status: u16, url: &str) -> Self {
        match status {
            404 => RemoteError::NotFound(url.to_string()),
            401 | 403 | 421 | 450 => RemoteError::Unauthenticated { status },
            _ => RemoteError::HttpStatus {
                status,
                url: url.to_string(),
            },
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Transient(_) => true,
            RemoteError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            RemoteError::Http(_) => true,
            RemoteError::Permanent(_)
            | RemoteError::NotFound(_)
            | RemoteError::Unauthenticated { .. }
            | RemoteError::Io(_)
            | RemoteError::Json(_) => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }

    /// Failures that end the whole run instead of being recorded per item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RemoteError::Unauthenticated { .. })
    }
}

/// A single item's fields could not be read. The item is skipped and the
/// enumeration continues.
#[derive(Debug, Error)]
pub enum FieldError {
    #[error("missing field {0}")]
    Missing(&'static str),

    #[error("field {field} could not be decoded: {reason}")]
    Invalid { field: &'static str, reason: String },
}
