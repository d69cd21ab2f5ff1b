use domain::{CallStatus, DomainError, RepositoryError};
use thiserror::Error;

/// 会话处理器与通话协调器边界上的统一错误。
///
/// `code()` 是写回客户端错误帧和 HTTP 错误体里的稳定编码。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error("authentication required")]
    Unauthorized,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("validation failed: {field}: {message}")]
    Validation { field: String, message: String },
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },
    #[error("invalid call status transition: {from} -> {to}")]
    InvalidTransition { from: CallStatus, to: CallStatus },
    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("notification failure: {0}")]
    Notification(String),
}

impl ApplicationError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApplicationError::Unauthorized => "UNAUTHORIZED",
            ApplicationError::Forbidden(_) => "FORBIDDEN",
            ApplicationError::Validation { .. } => "VALIDATION_ERROR",
            ApplicationError::NotFound { .. } => "NOT_FOUND",
            ApplicationError::InvalidTransition { .. } => "INVALID_TRANSITION",
            ApplicationError::UnsupportedCommand(_) => "UNSUPPORTED_COMMAND",
            ApplicationError::Storage(_) => "STORAGE_FAILURE",
            ApplicationError::Notification(_) => "NOTIFICATION_FAILURE",
        }
    }

    /// 可以安全回显给客户端的描述。存储细节不外泄。
    pub fn public_message(&self) -> String {
        match self {
            ApplicationError::Storage(_) => "storage temporarily unavailable".to_string(),
            ApplicationError::Notification(_) => "notification delivery failed".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<DomainError> for ApplicationError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation { field, message } => Self::Validation { field, message },
            DomainError::NotFound { resource, id } => Self::NotFound { resource, id },
            DomainError::InvalidTransition { from, to } => Self::InvalidTransition { from, to },
        }
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::NotFound => Self::not_found("record", "unknown"),
            RepositoryError::Conflict => Self::validation("record", "already exists"),
            RepositoryError::Storage { message } => Self::Storage(message),
            RepositoryError::Domain(err) => err.into(),
        }
    }
}
