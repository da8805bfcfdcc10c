// Error taxonomy shared by the stream layer and the adapters

use std::time::Duration;

use thiserror::Error;

/// Why a venue refused a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    Authentication,
    Permission,
    UnknownSymbol,
    Other,
}

impl std::fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionKind::Authentication => write!(f, "authentication"),
            RejectionKind::Permission => write!(f, "permission"),
            RejectionKind::UnknownSymbol => write!(f, "unknown symbol"),
            RejectionKind::Other => write!(f, "other"),
        }
    }
}

/// Errors delivered to `watch*` callers.
///
/// Cloneable because one failure fans out to every waiter on a hash.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StreamError {
    #[error("network failure on {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("gave up reconnecting to {url} after {attempts} attempts")]
    RetryExhausted { url: String, attempts: u32 },

    #[error("timed out waiting for {hash} after {after_ms}ms")]
    Timeout { hash: String, after_ms: u64 },

    #[error("subscription rejected ({kind}): {message}")]
    Rejected { kind: RejectionKind, message: String },

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("unknown symbol: {0}")]
    BadSymbol(String),

    #[error("connection closed")]
    Closed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("adapter error: {0}")]
    Adapter(String),
}

impl StreamError {
    pub fn timeout(hash: impl Into<String>, after: Duration) -> Self {
        StreamError::Timeout { hash: hash.into(), after_ms: after.as_millis() as u64 }
    }

    pub fn network(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        StreamError::Network { url: url.into(), reason: reason.to_string() }
    }

    /// Transient errors are worth retrying at the caller level.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StreamError::Network { .. } | StreamError::RetryExhausted { .. } | StreamError::Timeout { .. }
        )
    }
}

pub type StreamResult<T> = Result<T, StreamError>;

/// Failures while turning a raw venue payload into canonical records.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl From<AdapterError> for StreamError {
    fn from(e: AdapterError) -> Self {
        StreamError::Adapter(e.to_string())
    }
}
