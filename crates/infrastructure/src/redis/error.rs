use thiserror::Error;

/// 通话通知通道的错误。
#[derive(Error, Debug)]
pub enum RedisError {
    #[error("无效的 Redis 地址: {0}")]
    InvalidUrl(String),

    #[error("Redis 连接失败: {0}")]
    Connection(#[from] redis::RedisError),

    #[error("通话频道订阅失败: {0}")]
    Subscription(String),

    #[error("未知的通话频道: {0}")]
    UnknownChannel(String),

    #[error("通话通知负载无法解析: {0}")]
    Payload(#[from] serde_json::Error),
}

pub type RedisResult<T> = Result<T, RedisError>;

impl RedisError {
    pub(crate) fn invalid_url(err: redis::RedisError) -> Self {
        RedisError::InvalidUrl(err.to_string())
    }
}
