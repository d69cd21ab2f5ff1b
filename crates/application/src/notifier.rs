use std::sync::Arc;

use async_trait::async_trait;
use domain::UserId;
use thiserror::Error;
use uuid::Uuid;

use crate::broadcaster::MessageBroadcaster;
use crate::events::{CallNotice, OutboundFrame, ServerEvent};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification broker unreachable: {0}")]
    Unavailable(String),
    #[error("invalid notification: {0}")]
    Payload(String),
}

/// 异步通知通道。失败时由调用方负责重试。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn enqueue(&self, topic: &str, payload: serde_json::Value) -> Result<(), NotifyError>;
}

/// 通话通知的主题：`user_{id}_calls`。
pub fn call_topic(user_id: UserId) -> String {
    format!("user_{user_id}_calls")
}

pub fn parse_call_topic(topic: &str) -> Option<UserId> {
    let id = topic.strip_prefix("user_")?.strip_suffix("_calls")?;
    Uuid::parse_str(id).ok().map(UserId::from)
}

/// 进程内通知：直接投递到该用户的在线连接。
pub struct SessionNotifier {
    broadcaster: Arc<dyn MessageBroadcaster>,
}

impl SessionNotifier {
    pub fn new(broadcaster: Arc<dyn MessageBroadcaster>) -> Self {
        Self { broadcaster }
    }

    /// 把一条通话通知送到用户的连接上，Redis 中继也复用这里。
    pub async fn deliver_call_notice(&self, user_id: UserId, notice: CallNotice) -> usize {
        let frame = OutboundFrame::new(ServerEvent::CallStatus(notice));
        let report = self.broadcaster.notify_user(user_id, frame).await;
        report.delivered
    }
}

#[async_trait]
impl Notifier for SessionNotifier {
    async fn enqueue(&self, topic: &str, payload: serde_json::Value) -> Result<(), NotifyError> {
        let user_id = parse_call_topic(topic)
            .ok_or_else(|| NotifyError::Payload(format!("unknown topic {topic}")))?;
        let notice: CallNotice =
            serde_json::from_value(payload).map_err(|err| NotifyError::Payload(err.to_string()))?;
        let delivered = self.deliver_call_notice(user_id, notice).await;
        tracing::debug!(user_id = %user_id, delivered, "通话通知已投递到本地连接");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_round_trips_user_id() {
        let user = UserId::generate();
        let topic = call_topic(user);
        assert!(topic.starts_with("user_") && topic.ends_with("_calls"));
        assert_eq!(parse_call_topic(&topic), Some(user));
        assert_eq!(parse_call_topic("user_nope_calls"), None);
        assert_eq!(parse_call_topic("room_1"), None);
    }
}
