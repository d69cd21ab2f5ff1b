//! Redis 通知订阅者

use std::sync::Arc;

use application::{events::CallNotice, parse_call_topic, RetryPolicy, SessionNotifier};
use futures_util::StreamExt;
use redis::{aio::PubSub, Client, Msg};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::redis::{RedisError, RedisResult};

const CALL_TOPIC_PATTERN: &str = "user_*_calls";

/// 订阅全部用户的通话频道，把通知转交给本实例的连接。
pub struct RedisCallRelay {
    client: Client,
    local: Arc<SessionNotifier>,
}

impl RedisCallRelay {
    pub fn new(url: &str, local: Arc<SessionNotifier>) -> RedisResult<Self> {
        let client = Client::open(url).map_err(RedisError::invalid_url)?;
        Ok(Self { client, local })
    }

    /// 运行直到 `shutdown` 被取消。订阅断开后按 `policy` 退避重连，
    /// 重新订阅成功后退避次数清零。
    pub async fn run(self, shutdown: CancellationToken, policy: RetryPolicy) {
        let mut failures = 0u32;
        loop {
            let subscribed = tokio::select! {
                _ = shutdown.cancelled() => return,
                subscribed = self.subscribe() => subscribed,
            };
            let result = match subscribed {
                Ok(pubsub) => {
                    failures = 0;
                    self.relay(pubsub, &shutdown).await
                }
                Err(err) => Err(err),
            };
            let err = match result {
                Ok(()) => return,
                Err(err) => err,
            };

            failures = failures.saturating_add(1);
            let delay = policy.delay_at(failures);
            warn!(
                error = %err,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "通话通知订阅中断，稍后重连"
            );
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = sleep(delay) => {}
            }
        }
    }

    async fn subscribe(&self) -> RedisResult<PubSub> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub
            .psubscribe(CALL_TOPIC_PATTERN)
            .await
            .map_err(|err| RedisError::Subscription(err.to_string()))?;
        info!(pattern = CALL_TOPIC_PATTERN, "已订阅通话通知频道");
        Ok(pubsub)
    }

    async fn relay(&self, mut pubsub: PubSub, shutdown: &CancellationToken) -> RedisResult<()> {
        let mut messages = pubsub.on_message();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("通话通知订阅停止");
                    return Ok(());
                }
                next = messages.next() => match next {
                    Some(msg) => self.forward(msg).await,
                    None => {
                        return Err(RedisError::Subscription("订阅连接已断开".to_string()));
                    }
                },
            }
        }
    }

    async fn forward(&self, msg: Msg) {
        match decode(&msg) {
            Ok((user_id, notice)) => {
                let delivered = self.local.deliver_call_notice(user_id, notice).await;
                debug!(user_id = %user_id, delivered, "转发通话通知");
            }
            Err(err) => {
                warn!(channel = msg.get_channel_name(), error = %err, "丢弃无法解析的通话通知");
            }
        }
    }
}

fn decode(msg: &Msg) -> RedisResult<(domain::UserId, CallNotice)> {
    let channel = msg.get_channel_name();
    let user_id = parse_call_topic(channel)
        .ok_or_else(|| RedisError::UnknownChannel(channel.to_string()))?;
    let payload: String = msg.get_payload()?;
    let notice = serde_json::from_str(&payload)?;
    Ok((user_id, notice))
}
