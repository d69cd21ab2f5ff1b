//! 领域模型错误定义
//!
//! 领域层只区分三类失败：输入校验、资源缺失、通话状态的非法迁移。
//! 存储相关的失败由 [`RepositoryError`] 表达。

use thiserror::Error;

use crate::call::CallStatus;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// 验证错误
    #[error("验证失败: {field}: {message}")]
    Validation { field: String, message: String },

    /// 资源不存在错误
    #[error("资源不存在: {resource} {id}")]
    NotFound { resource: &'static str, id: String },

    /// 通话状态非法迁移
    #[error("非法状态迁移: {from} -> {to}")]
    InvalidTransition { from: CallStatus, to: CallStatus },
}

impl DomainError {
    /// 创建验证错误
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// 创建资源不存在错误
    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    pub fn invalid_transition(from: CallStatus, to: CallStatus) -> Self {
        Self::InvalidTransition { from, to }
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;

/// 仓储层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("记录不存在")]
    NotFound,
    #[error("记录冲突")]
    Conflict,
    #[error("存储失败: {message}")]
    Storage { message: String },
    /// 在事务内执行领域规则时被拒绝，事务已回滚
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}
