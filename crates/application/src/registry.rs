//! 房间注册表：房间 → 在线连接的进程内索引，外加用户 → 连接索引。
//!
//! 外层 map 的锁只在查找/创建房间条目时持有；每个房间有自己的成员锁和
//! 投递锁，互不相关的房间不会互相阻塞。成员锁是同步锁，保证
//! [`RoomMembership`] 与 [`UserPresence`] 可以在 `Drop` 中完成注销。

use std::collections::HashMap;
use std::sync::Arc;

use domain::{RoomId, UserId};
use parking_lot::RwLock;
use tokio::sync::{Mutex, MutexGuard};

use crate::outbound::{SessionHandle, SessionId};

pub(crate) struct RoomEntry {
    members: RwLock<HashMap<SessionId, SessionHandle>>,
    // 持有期间按提交顺序投递，保证同一房间内的 FIFO
    delivery: Mutex<()>,
}

impl RoomEntry {
    fn new() -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
            delivery: Mutex::new(()),
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<SessionHandle> {
        self.members.read().values().cloned().collect()
    }

    pub(crate) async fn lock_delivery(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().await
    }
}

#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Arc<RoomEntry>>>,
    users: RwLock<HashMap<UserId, HashMap<SessionId, SessionHandle>>>,
}

impl RoomRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn entry_or_create(&self, room_id: RoomId) -> Arc<RoomEntry> {
        if let Some(entry) = self.rooms.read().get(&room_id) {
            return entry.clone();
        }
        self.rooms
            .write()
            .entry(room_id)
            .or_insert_with(|| Arc::new(RoomEntry::new()))
            .clone()
    }

    pub(crate) fn entry(&self, room_id: RoomId) -> Option<Arc<RoomEntry>> {
        self.rooms.read().get(&room_id).cloned()
    }

    /// 加入房间；房间条目不存在时创建。重复加入同一连接是幂等的。
    pub fn join(&self, room_id: RoomId, session: SessionHandle) {
        let entry = self.entry_or_create(room_id);
        entry.members.write().insert(session.id(), session);
    }

    /// 离开房间。空条目保留，直到 [`RoomRegistry::forget_room`]。
    pub fn leave(&self, room_id: RoomId, session_id: SessionId) -> bool {
        match self.entry(room_id) {
            Some(entry) => entry.members.write().remove(&session_id).is_some(),
            None => false,
        }
    }

    /// 调用时刻的一致快照。迭代顺序不作保证。
    pub fn members_of(&self, room_id: RoomId) -> Vec<SessionHandle> {
        self.entry(room_id)
            .map(|entry| entry.snapshot())
            .unwrap_or_default()
    }

    pub fn is_member(&self, room_id: RoomId, session_id: SessionId) -> bool {
        self.entry(room_id)
            .map(|entry| entry.members.read().contains_key(&session_id))
            .unwrap_or(false)
    }

    /// 加入房间并返回守卫，守卫释放时自动离开。
    pub fn join_scoped(
        self: &Arc<Self>,
        room_id: RoomId,
        session: SessionHandle,
    ) -> RoomMembership {
        let session_id = session.id();
        self.join(room_id, session);
        RoomMembership {
            registry: Arc::clone(self),
            room_id,
            session_id,
        }
    }

    /// 房间已从存储中删除时丢弃条目。
    pub fn forget_room(&self, room_id: RoomId) -> bool {
        self.rooms.write().remove(&room_id).is_some()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    pub fn session_count(&self, room_id: RoomId) -> usize {
        self.entry(room_id)
            .map(|entry| entry.members.read().len())
            .unwrap_or(0)
    }

    pub fn register_user_session(self: &Arc<Self>, session: SessionHandle) -> UserPresence {
        let user_id = session.user_id();
        let session_id = session.id();
        self.users
            .write()
            .entry(user_id)
            .or_default()
            .insert(session_id, session);
        UserPresence {
            registry: Arc::clone(self),
            user_id,
            session_id,
        }
    }

    fn unregister_user_session(&self, user_id: UserId, session_id: SessionId) {
        let mut users = self.users.write();
        if let Some(sessions) = users.get_mut(&user_id) {
            sessions.remove(&session_id);
            if sessions.is_empty() {
                users.remove(&user_id);
            }
        }
    }

    pub fn sessions_of_user(&self, user_id: UserId) -> Vec<SessionHandle> {
        self.users
            .read()
            .get(&user_id)
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.users.read().contains_key(&user_id)
    }
}

/// 房间成员关系守卫。
pub struct RoomMembership {
    registry: Arc<RoomRegistry>,
    room_id: RoomId,
    session_id: SessionId,
}

impl RoomMembership {
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }
}

impl Drop for RoomMembership {
    fn drop(&mut self) {
        self.registry.leave(self.room_id, self.session_id);
        tracing::debug!(room_id = %self.room_id, session_id = %self.session_id, "连接离开房间");
    }
}

/// 用户在线守卫，供通话通知和私聊按用户寻址。
pub struct UserPresence {
    registry: Arc<RoomRegistry>,
    user_id: UserId,
    session_id: SessionId,
}

impl Drop for UserPresence {
    fn drop(&mut self) {
        self.registry
            .unregister_user_session(self.user_id, self.session_id);
    }
}
