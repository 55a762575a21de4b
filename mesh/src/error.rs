//! Mesh error types.
//!
//! Every operation reports one of a small set of categories. The same
//! categories travel between nodes as [`ErrorCode`] so a rejection raised by a
//! sponsor surfaces on the joiner with its original meaning.

use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type MeshResult<T> = Result<T, MeshError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MeshError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Wire representation of a [`MeshError`] category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidArgument,
    FailedPrecondition,
    PermissionDenied,
    NotFound,
    AlreadyExists,
    DeadlineExceeded,
    Unavailable,
    Internal,
}

/// Coarse outcome reported alongside every operation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Created,
    Success,
    Error,
    NotFound,
    Conflict,
    PreconditionFailed,
    Unavailable,
    Timeout,
}

impl OpStatus {
    pub fn http_status(self) -> StatusCode {
        match self {
            OpStatus::Created => StatusCode::CREATED,
            OpStatus::Success => StatusCode::OK,
            OpStatus::Error => StatusCode::BAD_REQUEST,
            OpStatus::NotFound => StatusCode::NOT_FOUND,
            OpStatus::Conflict => StatusCode::CONFLICT,
            OpStatus::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            OpStatus::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            OpStatus::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, OpStatus::Created | OpStatus::Success)
    }
}

impl MeshError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MeshError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            MeshError::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            MeshError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            MeshError::NotFound(_) => ErrorCode::NotFound,
            MeshError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            MeshError::DeadlineExceeded(_) => ErrorCode::DeadlineExceeded,
            MeshError::Unavailable(_) => ErrorCode::Unavailable,
            MeshError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Rebuild an error received from a peer.
    pub fn from_code(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            ErrorCode::InvalidArgument => MeshError::InvalidArgument(message),
            ErrorCode::FailedPrecondition => MeshError::FailedPrecondition(message),
            ErrorCode::PermissionDenied => MeshError::PermissionDenied(message),
            ErrorCode::NotFound => MeshError::NotFound(message),
            ErrorCode::AlreadyExists => MeshError::AlreadyExists(message),
            ErrorCode::DeadlineExceeded => MeshError::DeadlineExceeded(message),
            ErrorCode::Unavailable => MeshError::Unavailable(message),
            ErrorCode::Internal => MeshError::Internal(message),
        }
    }

    /// The bare message without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            MeshError::InvalidArgument(m)
            | MeshError::FailedPrecondition(m)
            | MeshError::PermissionDenied(m)
            | MeshError::NotFound(m)
            | MeshError::AlreadyExists(m)
            | MeshError::DeadlineExceeded(m)
            | MeshError::Unavailable(m)
            | MeshError::Internal(m) => m,
        }
    }

    pub fn status(&self) -> OpStatus {
        match self {
            MeshError::InvalidArgument(_)
            | MeshError::PermissionDenied(_)
            | MeshError::Internal(_) => OpStatus::Error,
            MeshError::FailedPrecondition(_) => OpStatus::PreconditionFailed,
            MeshError::NotFound(_) => OpStatus::NotFound,
            MeshError::AlreadyExists(_) => OpStatus::Conflict,
            MeshError::DeadlineExceeded(_) => OpStatus::Timeout,
            MeshError::Unavailable(_) => OpStatus::Unavailable,
        }
    }

    /// Finer-grained HTTP mapping than [`OpStatus::http_status`].
    pub fn http_status(&self) -> StatusCode {
        match self {
            MeshError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            MeshError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            MeshError::NotFound(_) => StatusCode::NOT_FOUND,
            MeshError::AlreadyExists(_) => StatusCode::CONFLICT,
            MeshError::FailedPrecondition(_) => StatusCode::PRECONDITION_FAILED,
            MeshError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            MeshError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            MeshError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Internal(format!("serialization failed: {err}"))
    }
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::Internal(format!("io failure: {err}"))
    }
}

impl From<tokio::time::error::Elapsed> for MeshError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        MeshError::DeadlineExceeded("operation timed out".to_string())
    }
}
