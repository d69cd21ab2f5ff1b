use async_trait::async_trait;
use domain::{RoomId, UserId};

use crate::events::OutboundFrame;

/// 一次扇出的统计。
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: usize,
    /// 已关闭或因超时被断开的连接
    pub closed: usize,
}

impl DeliveryReport {
    pub fn recipients(&self) -> usize {
        self.delivered + self.dropped + self.closed
    }
}

/// 向房间或用户的在线连接扇出事件。
///
/// 对调用方是 fire-and-forget：投递给已关闭的连接静默忽略，不会返回错误。
#[async_trait]
pub trait MessageBroadcaster: Send + Sync {
    /// 同一房间内按提交顺序投递。
    async fn broadcast(&self, room_id: RoomId, frame: OutboundFrame) -> DeliveryReport;

    /// 投递给某个用户的全部在线连接。
    async fn notify_user(&self, user_id: UserId, frame: OutboundFrame) -> DeliveryReport;
}
