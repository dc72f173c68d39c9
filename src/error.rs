//! Error taxonomy for the lifecycle manager
//!
//! Only `Unauthorized` and `NotFound` are expected to reach callers during
//! normal operation. Everything else either resolves through bounded retry or
//! is deferred to the orphan sweeper.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;

use crate::metadata::{FileId, UserId};

/// Errors raised by the ledger, the decision engine, the executor and the stores.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("user {caller_id} does not own file {file_id}")]
    Unauthorized { file_id: FileId, caller_id: UserId },

    #[error("file not found: {file_id}")]
    NotFound { file_id: FileId },

    #[error("file {file_id} changed while its deletion was being applied")]
    ConcurrentModification { file_id: FileId },

    #[error("deletion of file {file_id} did not settle after {attempts} attempts, retry the request")]
    TransientFailure { file_id: FileId, attempts: u32 },

    #[error("blob store unavailable for key {key}: {message}")]
    StorageUnavailable { key: String, message: String },

    #[error("reference ledger inconsistent for file {file_id}: expected {expected} live references, found {actual}")]
    LedgerInconsistency {
        file_id: FileId,
        expected: u64,
        actual: u64,
    },

    #[error("metadata store error: {0}")]
    Database(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Result alias used throughout the crate.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

impl LifecycleError {
    /// Machine-readable code used in HTTP error bodies and batch responses.
    pub fn code(&self) -> &'static str {
        match self {
            LifecycleError::Unauthorized { .. } => "UNAUTHORIZED",
            LifecycleError::NotFound { .. } => "NOT_FOUND",
            LifecycleError::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            LifecycleError::TransientFailure { .. } => "TRANSIENT_FAILURE",
            LifecycleError::StorageUnavailable { .. } => "STORAGE_UNAVAILABLE",
            LifecycleError::LedgerInconsistency { .. } => "LEDGER_INCONSISTENCY",
            LifecycleError::Database(_) => "DATABASE_ERROR",
            LifecycleError::InvalidInput(_) => "INVALID_INPUT",
        }
    }

    /// Whether the whole request can safely be repeated by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LifecycleError::ConcurrentModification { .. }
                | LifecycleError::TransientFailure { .. }
                | LifecycleError::StorageUnavailable { .. }
        )
    }
}

impl From<rusqlite::Error> for LifecycleError {
    fn from(err: rusqlite::Error) -> Self {
        LifecycleError::Database(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl ResponseError for LifecycleError {
    fn status_code(&self) -> StatusCode {
        match self {
            LifecycleError::Unauthorized { .. } => StatusCode::FORBIDDEN,
            LifecycleError::NotFound { .. } => StatusCode::NOT_FOUND,
            LifecycleError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            LifecycleError::ConcurrentModification { .. }
            | LifecycleError::TransientFailure { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            code: self.code(),
            message: self.to_string(),
        })
    }
}
