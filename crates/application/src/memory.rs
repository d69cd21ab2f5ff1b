//! 内存版存储。
//!
//! 与 PostgreSQL 实现遵守相同的不变式（slug 唯一、每对用户一个会话、
//! 行级原子的状态迁移），用于测试和本地开发。

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use domain::{
    CallId, CallSession, CallStatus, Conversation, ConversationId, ConversationPeers, FileId,
    Message, MessageTarget, RepositoryError, Room, RoomId, RoomSlug, Timestamp, UploadedFile,
    User, UserId,
};
use tokio::sync::RwLock;

use crate::repository::{
    CallRepository, ConversationRepository, DraftTarget, FileRepository, MessageDraft,
    MessageRepository, RoomRepository, UserRepository,
};

#[derive(Default)]
struct StoreState {
    users: HashMap<UserId, User>,
    rooms: HashMap<RoomId, Room>,
    members: HashMap<RoomId, BTreeSet<UserId>>,
    // 按写入顺序
    messages: Vec<Message>,
    conversations: HashMap<ConversationPeers, Conversation>,
    calls: HashMap<CallId, CallSession>,
    files: HashMap<FileId, UploadedFile>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
    fail_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert_user(&self, user: User) {
        self.state.write().await.users.insert(user.id, user);
    }

    /// 让后续的消息、清空与图标写入全部失败，模拟存储故障。
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn message_count(&self) -> usize {
        self.state.read().await.messages.len()
    }

    pub async fn conversation_count(&self) -> usize {
        self.state.read().await.conversations.len()
    }

    fn check_writable(&self) -> Result<(), RepositoryError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RepositoryError::storage("simulated storage outage"));
        }
        Ok(())
    }
}

fn newest_first(
    messages: &[Message],
    limit: u32,
    before: Option<Timestamp>,
    matches: impl Fn(&Message) -> bool,
) -> Vec<Message> {
    messages
        .iter()
        .rev()
        .filter(|message| matches(message))
        .filter(|message| before.map_or(true, |ts| message.created_at < ts))
        .take(limit as usize)
        .cloned()
        .collect()
}

#[async_trait]
impl UserRepository for InMemoryStore {
    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
        Ok(self.state.read().await.users.get(&id).cloned())
    }
}

#[async_trait]
impl RoomRepository for InMemoryStore {
    async fn create(&self, room: Room) -> Result<Room, RepositoryError> {
        let mut state = self.state.write().await;
        if state.rooms.values().any(|existing| existing.slug == room.slug) {
            return Err(RepositoryError::Conflict);
        }
        state.rooms.insert(room.id, room.clone());
        Ok(room)
    }

    async fn find_by_id(&self, id: RoomId) -> Result<Option<Room>, RepositoryError> {
        Ok(self.state.read().await.rooms.get(&id).cloned())
    }

    async fn find_by_slug(&self, slug: &RoomSlug) -> Result<Option<Room>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.rooms.values().find(|room| &room.slug == slug).cloned())
    }

    async fn add_member(&self, room_id: RoomId, user_id: UserId) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        if !state.rooms.contains_key(&room_id) {
            return Err(RepositoryError::NotFound);
        }
        state.members.entry(room_id).or_default().insert(user_id);
        Ok(())
    }

    async fn list_members(&self, room_id: RoomId) -> Result<Vec<UserId>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .members
            .get(&room_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn replace_icon(
        &self,
        room_id: RoomId,
        file: UploadedFile,
    ) -> Result<Room, RepositoryError> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        let room = state.rooms.get_mut(&room_id).ok_or(RepositoryError::NotFound)?;
        room.replace_icon(file.id);
        let updated = room.clone();
        state.files.insert(file.id, file);
        Ok(updated)
    }

    async fn delete(&self, room_id: RoomId) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        if state.rooms.remove(&room_id).is_none() {
            return Err(RepositoryError::NotFound);
        }
        state.members.remove(&room_id);
        state
            .messages
            .retain(|message| message.target != MessageTarget::Room(room_id));
        Ok(())
    }
}

#[async_trait]
impl MessageRepository for InMemoryStore {
    async fn create(&self, draft: MessageDraft) -> Result<Message, RepositoryError> {
        self.check_writable()?;
        let mut state = self.state.write().await;

        // 新会话先不落盘，消息校验通过后与消息一起写入
        let mut new_conversation = None;
        let target = match draft.target {
            DraftTarget::Room(room_id) => {
                if !state.rooms.contains_key(&room_id) {
                    return Err(RepositoryError::NotFound);
                }
                MessageTarget::Room(room_id)
            }
            DraftTarget::Peers(peers) => match state.conversations.get(&peers) {
                Some(existing) => MessageTarget::Conversation(existing.id),
                None => {
                    let conversation =
                        Conversation::new(ConversationId::generate(), peers, draft.created_at);
                    let id = conversation.id;
                    new_conversation = Some(conversation);
                    MessageTarget::Conversation(id)
                }
            },
        };

        let message = Message::new(
            draft.id,
            target,
            draft.sender,
            draft.recipient,
            draft.content,
            draft.attachment.as_ref().map(|file| file.id),
            draft.created_at,
        )?;

        if let Some(conversation) = new_conversation {
            state.conversations.insert(conversation.peers, conversation);
        }
        if let Some(file) = draft.attachment {
            state.files.insert(file.id, file);
        }
        state.messages.push(message.clone());
        Ok(message)
    }

    async fn delete_by_room(&self, room_id: RoomId) -> Result<u64, RepositoryError> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        let before = state.messages.len();
        state
            .messages
            .retain(|message| message.target != MessageTarget::Room(room_id));
        Ok((before - state.messages.len()) as u64)
    }

    async fn list_by_room(
        &self,
        room_id: RoomId,
        limit: u32,
        before: Option<Timestamp>,
    ) -> Result<Vec<Message>, RepositoryError> {
        let state = self.state.read().await;
        Ok(newest_first(&state.messages, limit, before, |message| {
            message.target == MessageTarget::Room(room_id)
        }))
    }

    async fn list_by_conversation(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<Timestamp>,
    ) -> Result<Vec<Message>, RepositoryError> {
        let state = self.state.read().await;
        Ok(newest_first(&state.messages, limit, before, |message| {
            message.target == MessageTarget::Conversation(conversation_id)
        }))
    }

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        reader: UserId,
    ) -> Result<u64, RepositoryError> {
        let mut state = self.state.write().await;
        let mut updated = 0;
        for message in state.messages.iter_mut().filter(|message| {
            message.target == MessageTarget::Conversation(conversation_id)
                && message.recipient == Some(reader)
                && !message.read
        }) {
            message.read = true;
            updated += 1;
        }
        Ok(updated)
    }
}

#[async_trait]
impl ConversationRepository for InMemoryStore {
    async fn find_between(
        &self,
        peers: ConversationPeers,
    ) -> Result<Option<Conversation>, RepositoryError> {
        Ok(self.state.read().await.conversations.get(&peers).cloned())
    }
}

#[async_trait]
impl CallRepository for InMemoryStore {
    async fn create(&self, call: CallSession) -> Result<CallSession, RepositoryError> {
        let mut state = self.state.write().await;
        if state.calls.contains_key(&call.id) {
            return Err(RepositoryError::Conflict);
        }
        state.calls.insert(call.id, call.clone());
        Ok(call)
    }

    async fn find_by_id(&self, id: CallId) -> Result<Option<CallSession>, RepositoryError> {
        Ok(self.state.read().await.calls.get(&id).cloned())
    }

    async fn transition(
        &self,
        id: CallId,
        next: CallStatus,
        at: Timestamp,
    ) -> Result<CallSession, RepositoryError> {
        let mut state = self.state.write().await;
        let call = state.calls.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        let mut updated = call.clone();
        updated.transition(next, at)?;
        *call = updated.clone();
        Ok(updated)
    }
}

#[async_trait]
impl FileRepository for InMemoryStore {
    async fn find_by_id(&self, id: FileId) -> Result<Option<UploadedFile>, RepositoryError> {
        Ok(self.state.read().await.files.get(&id).cloned())
    }
}
