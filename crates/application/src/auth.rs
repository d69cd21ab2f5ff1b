use async_trait::async_trait;
use domain::UserId;

use crate::error::ApplicationError;

/// 建立连接时携带的凭据。
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub token: Option<String>,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

/// 认证预言机：把连接凭据解析为用户身份。
///
/// 任何失败都表现为 [`ApplicationError::Unauthorized`]，不向调用方透露原因。
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn current_identity(&self, credentials: &Credentials) -> Result<UserId, ApplicationError>;
}
