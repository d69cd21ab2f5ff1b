//! Redis 通知发布者

use application::{Notifier, NotifyError};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tracing::{debug, info};

use crate::redis::{RedisError, RedisResult};

/// 把通话通知发布到 `user_{id}_calls` 频道。
///
/// 连接由 [`ConnectionManager`] 维护，断线后自动重连；单次发布失败交给
/// 调用方的重试策略处理。
#[derive(Clone)]
pub struct RedisNotifier {
    connection: ConnectionManager,
}

impl RedisNotifier {
    pub async fn connect(url: &str) -> RedisResult<Self> {
        let client = Client::open(url).map_err(RedisError::invalid_url)?;
        let connection = ConnectionManager::new(client).await?;
        info!("Redis 通知发布者已连接");
        Ok(Self { connection })
    }
}

#[async_trait]
impl Notifier for RedisNotifier {
    async fn enqueue(&self, topic: &str, payload: serde_json::Value) -> Result<(), NotifyError> {
        let mut connection = self.connection.clone();
        let receivers: i64 = connection
            .publish(topic, payload.to_string())
            .await
            .map_err(|err| NotifyError::Unavailable(err.to_string()))?;
        publish_outcome(topic, receivers)
    }
}

/// 每个实例都订阅全部通话频道，没有接收者说明中继全部掉线，需要重试。
fn publish_outcome(topic: &str, receivers: i64) -> Result<(), NotifyError> {
    if receivers <= 0 {
        return Err(NotifyError::Unavailable(format!(
            "no relay subscribed to {topic}"
        )));
    }
    debug!(topic, receivers, "通话通知已发布");
    Ok(())
}
