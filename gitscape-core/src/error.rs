//! Error taxonomy for a digestion operation.
//!
//! Every fatal outcome of the pipeline is a [`DigestError`]. Transports map the
//! [`ErrorKind`] to their own status codes; the kind is also what goes on the
//! wire, so it serialises as a stable snake_case tag.
//!
//! Per-file filesystem failures during the walk are deliberately absent here:
//! they are recovered into [`crate::walk::ExclusionReason::Unreadable`] and never
//! abort the operation. Running out of budget is not an error either, it is the
//! `truncated` flag on the digest summary.

use std::time::Duration;

use serde::Serialize;

/// Fatal outcome of a digestion operation.
#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("repository not found: {0}")]
    NotFound(String),
    #[error("authentication rejected: {0}")]
    Unauthorized(String),
    #[error("ref not found: {0}")]
    RefNotFound(String),
    #[error("acquisition timed out after {0:?}")]
    AcquisitionTimeout(Duration),
    #[error("repository too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },
    #[error("transport error: {0}")]
    TransportError(String),
    #[error("cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    InternalError(String),
}

/// Wire-stable category of a [`DigestError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    NotFound,
    Unauthorized,
    RefNotFound,
    AcquisitionTimeout,
    TooLarge,
    TransportError,
    Cancelled,
    InternalError,
}

impl DigestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DigestError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            DigestError::NotFound(_) => ErrorKind::NotFound,
            DigestError::Unauthorized(_) => ErrorKind::Unauthorized,
            DigestError::RefNotFound(_) => ErrorKind::RefNotFound,
            DigestError::AcquisitionTimeout(_) => ErrorKind::AcquisitionTimeout,
            DigestError::TooLarge { .. } => ErrorKind::TooLarge,
            DigestError::TransportError(_) => ErrorKind::TransportError,
            DigestError::Cancelled => ErrorKind::Cancelled,
            DigestError::InternalError(_) => ErrorKind::InternalError,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DigestError::Cancelled)
    }
}

impl From<tokio::task::JoinError> for DigestError {
    fn from(e: tokio::task::JoinError) -> Self {
        DigestError::InternalError(format!("pipeline task failed: {e}"))
    }
}
