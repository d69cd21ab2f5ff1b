use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use domain::UserId;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::events::OutboundFrame;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// 进程内唯一的连接标识。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 单次投递的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// 队列已满，聊天帧被丢弃
    Dropped,
    /// 连接已关闭，静默忽略
    Closed,
    /// 控制帧等待超时，连接被强制断开
    Disconnected,
}

/// 连接的出站端。
///
/// 注册表和分发器只持有它的克隆，连接本身拥有对应的接收端。
/// 投递策略：
/// - 聊天帧用 `try_send`，队列满即丢弃；
/// - 其他帧最多等待 `control_timeout`，超时则取消该连接。
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    user_id: UserId,
    sender: mpsc::Sender<OutboundFrame>,
    closed: CancellationToken,
    control_timeout: Duration,
}

impl SessionHandle {
    pub fn channel(
        user_id: UserId,
        capacity: usize,
        control_timeout: Duration,
    ) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: SessionId::next(),
            user_id,
            sender,
            closed: CancellationToken::new(),
            control_timeout,
        };
        (handle, receiver)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.sender.is_closed()
    }

    /// 连接关闭信号，传输层据此结束读写循环。
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub async fn deliver(&self, frame: OutboundFrame) -> Delivery {
        if self.is_closed() {
            return Delivery::Closed;
        }

        if frame.is_droppable() {
            return match self.sender.try_send(frame) {
                Ok(()) => Delivery::Delivered,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        session_id = %self.id,
                        user_id = %self.user_id,
                        "出站队列已满，丢弃聊天帧"
                    );
                    Delivery::Dropped
                }
                Err(TrySendError::Closed(_)) => Delivery::Closed,
            };
        }

        tokio::select! {
            _ = self.closed.cancelled() => Delivery::Closed,
            sent = tokio::time::timeout(self.control_timeout, self.sender.send(frame)) => match sent {
                Ok(Ok(())) => Delivery::Delivered,
                Ok(Err(_)) => Delivery::Closed,
                Err(_) => {
                    tracing::warn!(
                        session_id = %self.id,
                        user_id = %self.user_id,
                        timeout_ms = self.control_timeout.as_millis() as u64,
                        "连接长时间未消费控制帧，强制断开"
                    );
                    self.closed.cancel();
                    Delivery::Disconnected
                }
            },
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ServerEvent;
    use domain::{Message, MessageContent, MessageId, MessageTarget, RoomId};
    use time::OffsetDateTime;

    fn chat_frame() -> OutboundFrame {
        let message = Message::new(
            MessageId::generate(),
            MessageTarget::Room(RoomId::generate()),
            UserId::generate(),
            None,
            Some(MessageContent::new("hi").unwrap()),
            None,
            OffsetDateTime::now_utc(),
        )
        .unwrap();
        OutboundFrame::new(ServerEvent::NewMessage { message })
    }

    fn control_frame() -> OutboundFrame {
        OutboundFrame::new(ServerEvent::HistoryCleared {
            room_id: RoomId::generate(),
            deleted: 0,
            cleared_by: UserId::generate(),
        })
    }

    #[tokio::test]
    async fn chat_frames_are_dropped_when_queue_is_full() {
        let (handle, mut rx) =
            SessionHandle::channel(UserId::generate(), 1, Duration::from_millis(50));
        assert_eq!(handle.deliver(chat_frame()).await, Delivery::Delivered);
        assert_eq!(handle.deliver(chat_frame()).await, Delivery::Dropped);
        assert!(!handle.is_closed());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_control_delivery_disconnects_the_session() {
        let (handle, _rx) =
            SessionHandle::channel(UserId::generate(), 1, Duration::from_millis(50));
        let token = handle.closed_token();
        assert_eq!(handle.deliver(control_frame()).await, Delivery::Delivered);
        assert_eq!(handle.deliver(control_frame()).await, Delivery::Disconnected);
        assert!(token.is_cancelled());
        assert_eq!(handle.deliver(chat_frame()).await, Delivery::Closed);
    }

    #[tokio::test]
    async fn delivery_to_dropped_receiver_is_a_no_op() {
        let (handle, rx) = SessionHandle::channel(UserId::generate(), 4, Duration::from_secs(1));
        drop(rx);
        assert_eq!(handle.deliver(control_frame()).await, Delivery::Closed);
        assert_eq!(handle.deliver(chat_frame()).await, Delivery::Closed);
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::next(), SessionId::next());
    }
}
