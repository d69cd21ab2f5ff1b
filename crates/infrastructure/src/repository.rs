use std::sync::Arc;

use application::{
    repository::{
        CallRepository, ConversationRepository, DraftTarget, FileRepository, MessageDraft,
        MessageRepository, RoomRepository, UserRepository,
    },
    Clock, GatewayLimits, PersistenceGatewayDependencies,
};
use async_trait::async_trait;
use domain::{
    CallId, CallSession, CallStatus, Conversation, ConversationId, ConversationPeers, FileId,
    Message, MessageContent, MessageId, MessageTarget, RepositoryError, Room, RoomId, RoomName,
    RoomSlug, Timestamp, UploadedFile, User, UserId,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return RepositoryError::Conflict;
        }
        // 引用的房间或用户不存在
        if db.is_foreign_key_violation() {
            return RepositoryError::NotFound;
        }
    }
    RepositoryError::storage(err.to_string())
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

#[derive(Debug, FromRow)]
struct UserRecord {
    id: Uuid,
    username: String,
}

impl From<UserRecord> for User {
    fn from(value: UserRecord) -> Self {
        User::new(UserId::from(value.id), value.username)
    }
}

#[derive(Debug, FromRow)]
struct RoomRecord {
    id: Uuid,
    name: String,
    slug: String,
    creator_id: Option<Uuid>,
    icon_file_id: Option<Uuid>,
    created_at: OffsetDateTime,
}

impl TryFrom<RoomRecord> for Room {
    type Error = RepositoryError;

    fn try_from(value: RoomRecord) -> Result<Self, Self::Error> {
        let name = RoomName::parse(value.name).map_err(|err| invalid_data(err.to_string()))?;
        let slug = RoomSlug::parse(&value.slug).map_err(|err| invalid_data(err.to_string()))?;
        Ok(Room {
            id: RoomId::from(value.id),
            name,
            slug,
            creator: value.creator_id.map(UserId::from),
            icon: value.icon_file_id.map(FileId::from),
            created_at: value.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: Uuid,
    room_id: Option<Uuid>,
    conversation_id: Option<Uuid>,
    sender_id: Uuid,
    recipient_id: Option<Uuid>,
    content: Option<String>,
    file_id: Option<Uuid>,
    is_read: bool,
    created_at: OffsetDateTime,
}

impl TryFrom<MessageRecord> for Message {
    type Error = RepositoryError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        let target = match (value.room_id, value.conversation_id) {
            (Some(room_id), None) => MessageTarget::Room(RoomId::from(room_id)),
            (None, Some(conversation_id)) => {
                MessageTarget::Conversation(ConversationId::from(conversation_id))
            }
            _ => return Err(invalid_data("message must belong to a room or a conversation")),
        };
        let content = value
            .content
            .map(MessageContent::new)
            .transpose()
            .map_err(|err| invalid_data(err.to_string()))?;
        let mut message = Message::new(
            MessageId::from(value.id),
            target,
            UserId::from(value.sender_id),
            value.recipient_id.map(UserId::from),
            content,
            value.file_id.map(FileId::from),
            value.created_at,
        )?;
        message.read = value.is_read;
        Ok(message)
    }
}

#[derive(Debug, FromRow)]
struct ConversationRecord {
    id: Uuid,
    user_low: Uuid,
    user_high: Uuid,
    created_at: OffsetDateTime,
}

impl TryFrom<ConversationRecord> for Conversation {
    type Error = RepositoryError;

    fn try_from(value: ConversationRecord) -> Result<Self, Self::Error> {
        let peers = ConversationPeers::new(
            UserId::from(value.user_low),
            UserId::from(value.user_high),
        )?;
        Ok(Conversation::new(
            ConversationId::from(value.id),
            peers,
            value.created_at,
        ))
    }
}

#[derive(Debug, FromRow)]
struct CallRecord {
    id: Uuid,
    caller_id: Uuid,
    receiver_id: Uuid,
    status: i16,
    started_at: OffsetDateTime,
    ended_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<CallRecord> for CallSession {
    type Error = RepositoryError;

    fn try_from(value: CallRecord) -> Result<Self, Self::Error> {
        let status = CallStatus::from_code(value.status)
            .ok_or_else(|| invalid_data(format!("unknown call status {}", value.status)))?;
        Ok(CallSession {
            id: CallId::from(value.id),
            caller: UserId::from(value.caller_id),
            receiver: UserId::from(value.receiver_id),
            status,
            started_at: value.started_at,
            ended_at: value.ended_at,
            created_at: value.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct FileRecord {
    id: Uuid,
    uploaded_by: Uuid,
    file_name: String,
    content_type: String,
    data: Vec<u8>,
    uploaded_at: OffsetDateTime,
}

impl From<FileRecord> for UploadedFile {
    fn from(value: FileRecord) -> Self {
        UploadedFile {
            id: FileId::from(value.id),
            uploaded_by: UserId::from(value.uploaded_by),
            file_name: value.file_name,
            content_type: value.content_type,
            data: value.data,
            uploaded_at: value.uploaded_at,
        }
    }
}

const ROOM_COLUMNS: &str = "id, name, slug, creator_id, icon_file_id, created_at";
const MESSAGE_COLUMNS: &str =
    "id, room_id, conversation_id, sender_id, recipient_id, content, file_id, is_read, created_at";
const CALL_COLUMNS: &str =
    "id, caller_id, receiver_id, status, started_at, ended_at, created_at";

async fn insert_file(conn: &mut PgConnection, file: &UploadedFile) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"
        INSERT INTO uploaded_files (id, uploaded_by, file_name, content_type, data, uploaded_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::from(file.id))
    .bind(Uuid::from(file.uploaded_by))
    .bind(&file.file_name)
    .bind(&file.content_type)
    .bind(&file.data)
    .bind(file.uploaded_at)
    .execute(conn)
    .await
    .map_err(map_sqlx_err)?;
    Ok(())
}

#[derive(Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
        let record = sqlx::query_as::<_, UserRecord>("SELECT id, username FROM users WHERE id = $1")
            .bind(Uuid::from(id))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(record.map(User::from))
    }
}

#[derive(Clone)]
pub struct PgRoomRepository {
    pool: PgPool,
}

impl PgRoomRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoomRepository for PgRoomRepository {
    async fn create(&self, room: Room) -> Result<Room, RepositoryError> {
        let record = sqlx::query_as::<_, RoomRecord>(&format!(
            r#"
            INSERT INTO chat_rooms (id, name, slug, creator_id, icon_file_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {ROOM_COLUMNS}
            "#
        ))
        .bind(Uuid::from(room.id))
        .bind(room.name.as_str())
        .bind(room.slug.as_str())
        .bind(room.creator.map(Uuid::from))
        .bind(room.icon.map(Uuid::from))
        .bind(room.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Room::try_from(record)
    }

    async fn find_by_id(&self, id: RoomId) -> Result<Option<Room>, RepositoryError> {
        let record = sqlx::query_as::<_, RoomRecord>(&format!(
            "SELECT {ROOM_COLUMNS} FROM chat_rooms WHERE id = $1"
        ))
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        record.map(Room::try_from).transpose()
    }

    async fn find_by_slug(&self, slug: &RoomSlug) -> Result<Option<Room>, RepositoryError> {
        let record = sqlx::query_as::<_, RoomRecord>(&format!(
            "SELECT {ROOM_COLUMNS} FROM chat_rooms WHERE slug = $1"
        ))
        .bind(slug.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        record.map(Room::try_from).transpose()
    }

    async fn add_member(&self, room_id: RoomId, user_id: UserId) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO room_members (room_id, user_id, joined_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (room_id, user_id) DO NOTHING
            "#,
        )
        .bind(Uuid::from(room_id))
        .bind(Uuid::from(user_id))
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn list_members(&self, room_id: RoomId) -> Result<Vec<UserId>, RepositoryError> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT user_id FROM room_members WHERE room_id = $1 ORDER BY joined_at",
        )
        .bind(Uuid::from(room_id))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(ids.into_iter().map(UserId::from).collect())
    }

    async fn replace_icon(
        &self,
        room_id: RoomId,
        file: UploadedFile,
    ) -> Result<Room, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        insert_file(&mut tx, &file).await?;
        let record = sqlx::query_as::<_, RoomRecord>(&format!(
            "UPDATE chat_rooms SET icon_file_id = $2 WHERE id = $1 RETURNING {ROOM_COLUMNS}"
        ))
        .bind(Uuid::from(room_id))
        .bind(Uuid::from(file.id))
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?
        .ok_or(RepositoryError::NotFound)?;
        tx.commit().await.map_err(map_sqlx_err)?;
        Room::try_from(record)
    }

    async fn delete(&self, room_id: RoomId) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM chat_rooms WHERE id = $1")
            .bind(Uuid::from(room_id))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn list_where(
        &self,
        column: &str,
        id: Uuid,
        limit: u32,
        before: Option<Timestamp>,
    ) -> Result<Vec<Message>, RepositoryError> {
        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE {column} = $1 AND ($2::timestamptz IS NULL OR created_at < $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#
        ))
        .bind(id)
        .bind(before)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        records.into_iter().map(Message::try_from).collect()
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn create(&self, draft: MessageDraft) -> Result<Message, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let target = match draft.target {
            DraftTarget::Room(room_id) => MessageTarget::Room(room_id),
            DraftTarget::Peers(peers) => {
                // 并发首条私信时由唯一约束收敛到同一会话
                let id = sqlx::query_scalar::<_, Uuid>(
                    r#"
                    INSERT INTO conversations (id, user_low, user_high, created_at)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (user_low, user_high) DO UPDATE SET user_low = EXCLUDED.user_low
                    RETURNING id
                    "#,
                )
                .bind(Uuid::from(ConversationId::generate()))
                .bind(Uuid::from(peers.low()))
                .bind(Uuid::from(peers.high()))
                .bind(draft.created_at)
                .fetch_one(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
                MessageTarget::Conversation(ConversationId::from(id))
            }
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

        if let Some(file) = &draft.attachment {
            insert_file(&mut tx, file).await?;
        }

        sqlx::query(
            r#"
            INSERT INTO messages
                (id, room_id, conversation_id, sender_id, recipient_id, content, file_id, is_read, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE, $8)
            "#,
        )
        .bind(Uuid::from(message.id))
        .bind(message.room_id().map(Uuid::from))
        .bind(message.conversation_id().map(Uuid::from))
        .bind(Uuid::from(message.sender))
        .bind(message.recipient.map(Uuid::from))
        .bind(message.content.as_ref().map(MessageContent::as_str))
        .bind(message.file.map(Uuid::from))
        .bind(message.created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(message)
    }

    async fn delete_by_room(&self, room_id: RoomId) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM messages WHERE room_id = $1")
            .bind(Uuid::from(room_id))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(result.rows_affected())
    }

    async fn list_by_room(
        &self,
        room_id: RoomId,
        limit: u32,
        before: Option<Timestamp>,
    ) -> Result<Vec<Message>, RepositoryError> {
        self.list_where("room_id", Uuid::from(room_id), limit, before)
            .await
    }

    async fn list_by_conversation(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<Timestamp>,
    ) -> Result<Vec<Message>, RepositoryError> {
        self.list_where("conversation_id", Uuid::from(conversation_id), limit, before)
            .await
    }

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        reader: UserId,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET is_read = TRUE
            WHERE conversation_id = $1 AND recipient_id = $2 AND NOT is_read
            "#,
        )
        .bind(Uuid::from(conversation_id))
        .bind(Uuid::from(reader))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(result.rows_affected())
    }
}

#[derive(Clone)]
pub struct PgConversationRepository {
    pool: PgPool,
}

impl PgConversationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationRepository for PgConversationRepository {
    async fn find_between(
        &self,
        peers: ConversationPeers,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let record = sqlx::query_as::<_, ConversationRecord>(
            r#"
            SELECT id, user_low, user_high, created_at FROM conversations
            WHERE user_low = $1 AND user_high = $2
            "#,
        )
        .bind(Uuid::from(peers.low()))
        .bind(Uuid::from(peers.high()))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        record.map(Conversation::try_from).transpose()
    }
}

#[derive(Clone)]
pub struct PgCallRepository {
    pool: PgPool,
}

impl PgCallRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CallRepository for PgCallRepository {
    async fn create(&self, call: CallSession) -> Result<CallSession, RepositoryError> {
        let record = sqlx::query_as::<_, CallRecord>(&format!(
            r#"
            INSERT INTO call_sessions (id, caller_id, receiver_id, status, started_at, ended_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {CALL_COLUMNS}
            "#
        ))
        .bind(Uuid::from(call.id))
        .bind(Uuid::from(call.caller))
        .bind(Uuid::from(call.receiver))
        .bind(call.status.code())
        .bind(call.started_at)
        .bind(call.ended_at)
        .bind(call.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        CallSession::try_from(record)
    }

    async fn find_by_id(&self, id: CallId) -> Result<Option<CallSession>, RepositoryError> {
        let record = sqlx::query_as::<_, CallRecord>(&format!(
            "SELECT {CALL_COLUMNS} FROM call_sessions WHERE id = $1"
        ))
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        record.map(CallSession::try_from).transpose()
    }

    async fn transition(
        &self,
        id: CallId,
        next: CallStatus,
        at: Timestamp,
    ) -> Result<CallSession, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        let record = sqlx::query_as::<_, CallRecord>(&format!(
            "SELECT {CALL_COLUMNS} FROM call_sessions WHERE id = $1 FOR UPDATE"
        ))
        .bind(Uuid::from(id))
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?
        .ok_or(RepositoryError::NotFound)?;

        let mut call = CallSession::try_from(record)?;
        // 非法迁移直接返回，事务随 tx 释放回滚
        call.transition(next, at)?;

        sqlx::query(
            "UPDATE call_sessions SET status = $2, started_at = $3, ended_at = $4 WHERE id = $1",
        )
        .bind(Uuid::from(call.id))
        .bind(call.status.code())
        .bind(call.started_at)
        .bind(call.ended_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(call)
    }
}

#[derive(Clone)]
pub struct PgFileRepository {
    pool: PgPool,
}

impl PgFileRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FileRepository for PgFileRepository {
    async fn find_by_id(&self, id: FileId) -> Result<Option<UploadedFile>, RepositoryError> {
        let record = sqlx::query_as::<_, FileRecord>(
            r#"
            SELECT id, uploaded_by, file_name, content_type, data, uploaded_at
            FROM uploaded_files WHERE id = $1
            "#,
        )
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(record.map(UploadedFile::from))
    }
}

#[derive(Clone)]
pub struct PgStorage {
    pub pool: PgPool,
    pub user_repository: Arc<PgUserRepository>,
    pub room_repository: Arc<PgRoomRepository>,
    pub message_repository: Arc<PgMessageRepository>,
    pub conversation_repository: Arc<PgConversationRepository>,
    pub call_repository: Arc<PgCallRepository>,
    pub file_repository: Arc<PgFileRepository>,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            user_repository: Arc::new(PgUserRepository::new(pool.clone())),
            room_repository: Arc::new(PgRoomRepository::new(pool.clone())),
            message_repository: Arc::new(PgMessageRepository::new(pool.clone())),
            conversation_repository: Arc::new(PgConversationRepository::new(pool.clone())),
            call_repository: Arc::new(PgCallRepository::new(pool.clone())),
            file_repository: Arc::new(PgFileRepository::new(pool.clone())),
            pool,
        }
    }

    pub fn gateway_dependencies(
        &self,
        clock: Arc<dyn Clock>,
        limits: GatewayLimits,
    ) -> PersistenceGatewayDependencies {
        PersistenceGatewayDependencies {
            user_repository: self.user_repository.clone(),
            room_repository: self.room_repository.clone(),
            message_repository: self.message_repository.clone(),
            conversation_repository: self.conversation_repository.clone(),
            call_repository: self.call_repository.clone(),
            file_repository: self.file_repository.clone(),
            clock,
            limits,
        }
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
