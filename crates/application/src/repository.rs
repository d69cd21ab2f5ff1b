use async_trait::async_trait;
use domain::{
    CallId, CallSession, CallStatus, Conversation, ConversationId, ConversationPeers, FileId,
    Message, MessageContent, MessageId, RepositoryError, Room, RoomId, RoomSlug, Timestamp,
    UploadedFile, User, UserId,
};

/// 待写入消息的目标。会话模式下由仓储负责在同一事务内确保会话存在。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftTarget {
    Room(RoomId),
    Peers(ConversationPeers),
}

/// 已通过校验、尚未持久化的消息。
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub id: MessageId,
    pub target: DraftTarget,
    pub sender: UserId,
    pub recipient: Option<UserId>,
    pub content: Option<MessageContent>,
    pub attachment: Option<UploadedFile>,
    pub created_at: Timestamp,
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError>;
}

#[async_trait]
pub trait RoomRepository: Send + Sync {
    /// slug 已存在时返回 `Conflict`。
    async fn create(&self, room: Room) -> Result<Room, RepositoryError>;
    async fn find_by_id(&self, id: RoomId) -> Result<Option<Room>, RepositoryError>;
    async fn find_by_slug(&self, slug: &RoomSlug) -> Result<Option<Room>, RepositoryError>;
    /// 幂等。
    async fn add_member(&self, room_id: RoomId, user_id: UserId) -> Result<(), RepositoryError>;
    async fn list_members(&self, room_id: RoomId) -> Result<Vec<UserId>, RepositoryError>;
    /// 保存新文件并替换房间图标，同一事务。
    async fn replace_icon(
        &self,
        room_id: RoomId,
        file: UploadedFile,
    ) -> Result<Room, RepositoryError>;
    /// 级联删除房间消息与成员关系。
    async fn delete(&self, room_id: RoomId) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    // 附件、会话、消息在同一事务内写入
    async fn create(&self, draft: MessageDraft) -> Result<Message, RepositoryError>;

    // 返回删除条数
    async fn delete_by_room(&self, room_id: RoomId) -> Result<u64, RepositoryError>;

    // 最新的在前
    async fn list_by_room(
        &self,
        room_id: RoomId,
        limit: u32,
        before: Option<Timestamp>,
    ) -> Result<Vec<Message>, RepositoryError>;

    async fn list_by_conversation(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<Timestamp>,
    ) -> Result<Vec<Message>, RepositoryError>;

    // 把发给 reader 的未读消息标记为已读，返回条数
    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        reader: UserId,
    ) -> Result<u64, RepositoryError>;
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn find_between(
        &self,
        peers: ConversationPeers,
    ) -> Result<Option<Conversation>, RepositoryError>;
}

#[async_trait]
pub trait CallRepository: Send + Sync {
    async fn create(&self, call: CallSession) -> Result<CallSession, RepositoryError>;
    async fn find_by_id(&self, id: CallId) -> Result<Option<CallSession>, RepositoryError>;
    /// 在行锁内校验并应用状态迁移；非法迁移以 `RepositoryError::Domain` 返回且不做修改。
    async fn transition(
        &self,
        id: CallId,
        next: CallStatus,
        at: Timestamp,
    ) -> Result<CallSession, RepositoryError>;
}

#[async_trait]
pub trait FileRepository: Send + Sync {
    async fn find_by_id(&self, id: FileId) -> Result<Option<UploadedFile>, RepositoryError>;
}
