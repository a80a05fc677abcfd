use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Error taxonomy shared by every service in the process.
///
/// Recoverable errors are handled at the smallest scope that can act on
/// them; anything crossing a component boundary is reshaped into one of
/// these kinds first.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Missing or invalid credential/endpoint. Not retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection refused, timeout, TLS handshake failure. Retried with
    /// backoff at the component's retry scope.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Rejected credentials. Distinguished from transient failures so
    /// callers stop retrying.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Malformed payload or unexpected frame from a peer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Checksum mismatch or unrecoverable duplicate-key state. The
    /// operation is aborted and partial state cleaned up.
    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("insufficient disk space: {required} bytes required, {free} free")]
    InsufficientSpace { required: u64, free: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    /// Whether a retry at the caller's scope can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::TransientNetwork(_))
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            ServiceError::TransientNetwork(err.to_string())
        } else if err.is_decode() {
            ServiceError::Protocol(err.to_string())
        } else {
            ServiceError::TransientNetwork(err.to_string())
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Config(_) => StatusCode::BAD_REQUEST,
            ServiceError::Auth(_) => StatusCode::UNAUTHORIZED,
            ServiceError::InsufficientSpace { .. } => StatusCode::INSUFFICIENT_STORAGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

pub type Result<T, E = ServiceError> = std::result::Result<T, E>;
