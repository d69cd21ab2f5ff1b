use std::sync::Arc;

use async_trait::async_trait;
use domain::{RoomId, UserId};

use crate::broadcaster::{DeliveryReport, MessageBroadcaster};
use crate::events::OutboundFrame;
use crate::outbound::{Delivery, SessionHandle};
use crate::registry::RoomRegistry;

/// 基于 [`RoomRegistry`] 的进程内广播分发器。
#[derive(Clone)]
pub struct BroadcastDispatcher {
    registry: Arc<RoomRegistry>,
}

impl BroadcastDispatcher {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self { registry }
    }

    async fn fan_out(members: Vec<SessionHandle>, frame: OutboundFrame) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for member in members {
            match member.deliver(frame.clone()).await {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Dropped => report.dropped += 1,
                Delivery::Closed | Delivery::Disconnected => report.closed += 1,
            }
        }
        report
    }
}

#[async_trait]
impl MessageBroadcaster for BroadcastDispatcher {
    async fn broadcast(&self, room_id: RoomId, frame: OutboundFrame) -> DeliveryReport {
        let Some(entry) = self.registry.entry(room_id) else {
            return DeliveryReport::default();
        };
        // 快照在锁内取得：排在前面的事件投递完之前，后提交的事件不会开始
        let _order = entry.lock_delivery().await;
        let members = entry.snapshot();
        let report = Self::fan_out(members, frame).await;
        tracing::debug!(
            room_id = %room_id,
            delivered = report.delivered,
            dropped = report.dropped,
            closed = report.closed,
            "房间广播完成"
        );
        report
    }

    async fn notify_user(&self, user_id: UserId, frame: OutboundFrame) -> DeliveryReport {
        let sessions = self.registry.sessions_of_user(user_id);
        Self::fan_out(sessions, frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ServerEvent;
    use std::time::Duration;

    fn cleared(deleted: u64) -> OutboundFrame {
        OutboundFrame::new(ServerEvent::HistoryCleared {
            room_id: RoomId::generate(),
            deleted,
            cleared_by: UserId::generate(),
        })
    }

    #[tokio::test]
    async fn broadcast_reaches_every_member_in_submission_order() {
        let registry = RoomRegistry::new();
        let dispatcher = BroadcastDispatcher::new(registry.clone());
        let room = RoomId::generate();
        let (a, mut rx_a) = SessionHandle::channel(UserId::generate(), 16, Duration::from_secs(1));
        let (b, mut rx_b) = SessionHandle::channel(UserId::generate(), 16, Duration::from_secs(1));
        registry.join(room, a);
        registry.join(room, b);

        for n in 0..5 {
            let report = dispatcher.broadcast(room, cleared(n)).await;
            assert_eq!(report.delivered, 2);
        }

        for rx in [&mut rx_a, &mut rx_b] {
            for n in 0..5 {
                let frame = rx.recv().await.unwrap();
                match frame.event {
                    ServerEvent::HistoryCleared { deleted, .. } => assert_eq!(deleted, n),
                    other => panic!("unexpected event {other:?}"),
                }
            }
        }
    }

    #[tokio::test]
    async fn departed_members_are_skipped_silently() {
        let registry = RoomRegistry::new();
        let dispatcher = BroadcastDispatcher::new(registry.clone());
        let room = RoomId::generate();
        let (stay, mut rx_stay) =
            SessionHandle::channel(UserId::generate(), 4, Duration::from_secs(1));
        let (gone, rx_gone) = SessionHandle::channel(UserId::generate(), 4, Duration::from_secs(1));

        let _stay_guard = registry.join_scoped(room, stay);
        let gone_guard = registry.join_scoped(room, gone.clone());
        drop(gone_guard);
        drop(rx_gone);

        let report = dispatcher.broadcast(room, cleared(0)).await;
        assert_eq!(report, DeliveryReport { delivered: 1, dropped: 0, closed: 0 });
        assert!(rx_stay.recv().await.is_some());

        // 仍在快照里但已关闭的连接：静默计入 closed
        registry.join(room, gone);
        let report = dispatcher.broadcast(room, cleared(1)).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.closed, 1);
    }

    #[tokio::test]
    async fn broadcast_to_unknown_room_is_empty() {
        let dispatcher = BroadcastDispatcher::new(RoomRegistry::new());
        let report = dispatcher.broadcast(RoomId::generate(), cleared(0)).await;
        assert_eq!(report.recipients(), 0);
    }

    #[tokio::test]
    async fn notify_user_reaches_all_sessions_of_that_user() {
        let registry = RoomRegistry::new();
        let dispatcher = BroadcastDispatcher::new(registry.clone());
        let user = UserId::generate();
        let (first, mut rx1) = SessionHandle::channel(user, 4, Duration::from_secs(1));
        let (second, mut rx2) = SessionHandle::channel(user, 4, Duration::from_secs(1));
        let _p1 = registry.register_user_session(first);
        let _p2 = registry.register_user_session(second);

        let report = dispatcher.notify_user(user, cleared(3)).await;
        assert_eq!(report.delivered, 2);
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }
}
