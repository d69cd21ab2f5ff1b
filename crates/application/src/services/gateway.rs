use std::sync::Arc;

use domain::{
    CallId, CallSession, CallStatus, ConversationPeers, DomainError, FileId, Message,
    MessageContent, MessageId, RepositoryError, Room, RoomId, RoomSlug, Timestamp, UploadedFile,
    UserId,
};

use crate::{
    clock::Clock,
    error::ApplicationError,
    events::FileUpload,
    repository::{
        CallRepository, ConversationRepository, DraftTarget, FileRepository, MessageDraft,
        MessageRepository, RoomRepository, UserRepository,
    },
};

/// 写消息的目标：房间，或者一对一会话的两个参与者。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDestination {
    Room(RoomId),
    Conversation(ConversationPeers),
}

#[derive(Debug, Clone)]
pub struct CreateMessageRequest {
    pub destination: MessageDestination,
    pub sender: UserId,
    pub recipient: Option<UserId>,
    pub content: Option<String>,
    pub file: Option<FileUpload>,
}

/// 已持久化的消息，附带附件的规范化文件名。
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message: Message,
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct GatewayLimits {
    pub max_upload_bytes: usize,
    pub history_page_limit: u32,
}

impl GatewayLimits {
    pub fn from_config(session: &config::SessionConfig) -> Self {
        Self {
            max_upload_bytes: session.max_upload_bytes,
            history_page_limit: session.history_page_limit,
        }
    }
}

impl Default for GatewayLimits {
    fn default() -> Self {
        Self::from_config(&config::SessionConfig::default())
    }
}

pub struct PersistenceGatewayDependencies {
    pub user_repository: Arc<dyn UserRepository>,
    pub room_repository: Arc<dyn RoomRepository>,
    pub message_repository: Arc<dyn MessageRepository>,
    pub conversation_repository: Arc<dyn ConversationRepository>,
    pub call_repository: Arc<dyn CallRepository>,
    pub file_repository: Arc<dyn FileRepository>,
    pub clock: Arc<dyn Clock>,
    pub limits: GatewayLimits,
}

impl PersistenceGatewayDependencies {
    /// 用同一个存储实现全部仓储。
    pub fn from_store<S>(store: Arc<S>, clock: Arc<dyn Clock>, limits: GatewayLimits) -> Self
    where
        S: UserRepository
            + RoomRepository
            + MessageRepository
            + ConversationRepository
            + CallRepository
            + FileRepository
            + 'static,
    {
        Self {
            user_repository: store.clone(),
            room_repository: store.clone(),
            message_repository: store.clone(),
            conversation_repository: store.clone(),
            call_repository: store.clone(),
            file_repository: store,
            clock,
            limits,
        }
    }
}

/// 唯一访问持久化存储的组件。每个操作要么整体成功，要么整体失败。
pub struct PersistenceGateway {
    deps: PersistenceGatewayDependencies,
}

fn not_found(
    resource: &'static str,
    id: impl ToString,
) -> impl FnOnce(RepositoryError) -> ApplicationError {
    let id = id.to_string();
    move |err| match err {
        RepositoryError::NotFound => ApplicationError::not_found(resource, id),
        other => other.into(),
    }
}

impl PersistenceGateway {
    pub fn new(deps: PersistenceGatewayDependencies) -> Self {
        Self { deps }
    }

    pub fn limits(&self) -> GatewayLimits {
        self.deps.limits
    }

    async fn ensure_user(&self, user_id: UserId) -> Result<(), ApplicationError> {
        self.deps
            .user_repository
            .find_by_id(user_id)
            .await?
            .map(|_| ())
            .ok_or_else(|| ApplicationError::not_found("user", user_id))
    }

    fn build_file(
        &self,
        uploaded_by: UserId,
        upload: FileUpload,
        now: Timestamp,
    ) -> Result<UploadedFile, DomainError> {
        UploadedFile::new(
            FileId::generate(),
            uploaded_by,
            &upload.name,
            upload.content_type.as_deref(),
            upload.data,
            self.deps.limits.max_upload_bytes,
            now,
        )
    }

    /// 持久化一条消息。
    ///
    /// 会话模式下，两人之间的会话不存在时在同一事务内创建。
    pub async fn create_message(
        &self,
        request: CreateMessageRequest,
    ) -> Result<Message, ApplicationError> {
        self.store_message(request).await.map(|stored| stored.message)
    }

    pub async fn store_message(
        &self,
        request: CreateMessageRequest,
    ) -> Result<StoredMessage, ApplicationError> {
        let content = request.content.map(MessageContent::new).transpose()?;
        if content.is_none() && request.file.is_none() {
            return Err(ApplicationError::validation(
                "content",
                "message requires text content or a file",
            ));
        }

        self.ensure_user(request.sender).await?;

        let (target, recipient) = match request.destination {
            MessageDestination::Room(room_id) => {
                self.get_room(room_id).await?;
                (DraftTarget::Room(room_id), request.recipient)
            }
            MessageDestination::Conversation(peers) => {
                let other = peers.other(request.sender).ok_or_else(|| {
                    ApplicationError::validation("sender", "not part of the conversation")
                })?;
                if request.recipient.is_some_and(|recipient| recipient != other) {
                    return Err(ApplicationError::validation(
                        "recipient",
                        "recipient does not match the conversation",
                    ));
                }
                (DraftTarget::Peers(peers), Some(other))
            }
        };
        if let Some(recipient) = recipient {
            self.ensure_user(recipient).await?;
        }

        let now = self.deps.clock.now();
        let attachment = request
            .file
            .map(|upload| self.build_file(request.sender, upload, now))
            .transpose()?;
        let file_name = attachment.as_ref().map(|file| file.file_name.clone());

        let draft = MessageDraft {
            id: MessageId::generate(),
            target,
            sender: request.sender,
            recipient,
            content,
            attachment,
            created_at: now,
        };
        let message = self
            .deps
            .message_repository
            .create(draft)
            .await
            .map_err(|err| {
                tracing::error!(error = %err, sender = %request.sender, "消息持久化失败");
                ApplicationError::from(err)
            })?;
        Ok(StoredMessage { message, file_name })
    }

    /// 删除房间全部消息，返回删除条数（可以为 0）。
    pub async fn clear_history(&self, room_id: RoomId) -> Result<u64, ApplicationError> {
        self.get_room(room_id).await?;
        let deleted = self
            .deps
            .message_repository
            .delete_by_room(room_id)
            .await
            .map_err(not_found("room", room_id))?;
        tracing::info!(room_id = %room_id, deleted, "房间历史已清空");
        Ok(deleted)
    }

    pub async fn update_room_icon(
        &self,
        room_id: RoomId,
        uploaded_by: UserId,
        upload: FileUpload,
    ) -> Result<Room, ApplicationError> {
        let file = self.build_file(uploaded_by, upload, self.deps.clock.now())?;
        let room = self
            .deps
            .room_repository
            .replace_icon(room_id, file)
            .await
            .map_err(not_found("room", room_id))?;
        Ok(room)
    }

    pub async fn get_room(&self, room_id: RoomId) -> Result<Room, ApplicationError> {
        self.deps
            .room_repository
            .find_by_id(room_id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("room", room_id))
    }

    pub async fn get_room_by_slug(&self, slug: &str) -> Result<Room, ApplicationError> {
        let slug = RoomSlug::from_name(slug)?;
        self.deps
            .room_repository
            .find_by_slug(&slug)
            .await?
            .ok_or_else(|| ApplicationError::not_found("room", slug))
    }

    /// 按名称取房间，不存在则创建。并发创建同名房间时以先写入者为准。
    pub async fn get_or_create_room(
        &self,
        name: &str,
        creator: Option<UserId>,
    ) -> Result<Room, ApplicationError> {
        let room = Room::create(RoomId::generate(), name, creator, self.deps.clock.now())?;
        if let Some(existing) = self.deps.room_repository.find_by_slug(&room.slug).await? {
            return Ok(existing);
        }
        let slug = room.slug.clone();
        match self.deps.room_repository.create(room).await {
            Ok(created) => {
                tracing::info!(room_id = %created.id, slug = %created.slug, "创建房间");
                Ok(created)
            }
            Err(RepositoryError::Conflict) => self
                .deps
                .room_repository
                .find_by_slug(&slug)
                .await?
                .ok_or_else(|| ApplicationError::not_found("room", slug)),
            Err(err) => Err(err.into()),
        }
    }

    /// 幂等。
    pub async fn add_member(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<(), ApplicationError> {
        self.deps
            .room_repository
            .add_member(room_id, user_id)
            .await
            .map_err(not_found("room", room_id))
    }

    pub async fn list_members(&self, room_id: RoomId) -> Result<Vec<UserId>, ApplicationError> {
        self.get_room(room_id).await?;
        Ok(self.deps.room_repository.list_members(room_id).await?)
    }

    /// 只有创建者可以删除房间，消息随之级联删除。
    pub async fn delete_room(
        &self,
        room_id: RoomId,
        actor: UserId,
    ) -> Result<(), ApplicationError> {
        let room = self.get_room(room_id).await?;
        if room.creator != Some(actor) {
            return Err(ApplicationError::Forbidden(
                "only the room creator can delete it".to_string(),
            ));
        }
        self.deps
            .room_repository
            .delete(room_id)
            .await
            .map_err(not_found("room", room_id))?;
        tracing::info!(room_id = %room_id, "房间已删除");
        Ok(())
    }

    pub async fn room_history(
        &self,
        room_id: RoomId,
        limit: Option<u32>,
        before: Option<Timestamp>,
    ) -> Result<Vec<Message>, ApplicationError> {
        self.get_room(room_id).await?;
        let limit = self.page_limit(limit);
        Ok(self
            .deps
            .message_repository
            .list_by_room(room_id, limit, before)
            .await?)
    }

    pub async fn conversation_history(
        &self,
        user: UserId,
        peer: UserId,
        limit: Option<u32>,
        before: Option<Timestamp>,
    ) -> Result<Vec<Message>, ApplicationError> {
        let peers = ConversationPeers::new(user, peer)?;
        let Some(conversation) = self.deps.conversation_repository.find_between(peers).await?
        else {
            return Ok(Vec::new());
        };
        let limit = self.page_limit(limit);
        Ok(self
            .deps
            .message_repository
            .list_by_conversation(conversation.id, limit, before)
            .await?)
    }

    /// 把对端发给 `reader` 的消息标记为已读。
    pub async fn mark_conversation_read(
        &self,
        reader: UserId,
        peer: UserId,
    ) -> Result<u64, ApplicationError> {
        let peers = ConversationPeers::new(reader, peer)?;
        match self.deps.conversation_repository.find_between(peers).await? {
            Some(conversation) => Ok(self
                .deps
                .message_repository
                .mark_read(conversation.id, reader)
                .await?),
            None => Ok(0),
        }
    }

    pub async fn get_file(&self, file_id: FileId) -> Result<UploadedFile, ApplicationError> {
        self.deps
            .file_repository
            .find_by_id(file_id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("file", file_id))
    }

    pub async fn start_call(
        &self,
        caller: UserId,
        receiver: UserId,
    ) -> Result<CallSession, ApplicationError> {
        let call = CallSession::start(CallId::generate(), caller, receiver, self.deps.clock.now())?;
        self.ensure_user(caller).await?;
        self.ensure_user(receiver).await?;
        Ok(self.deps.call_repository.create(call).await?)
    }

    pub async fn get_call(&self, call_id: CallId) -> Result<CallSession, ApplicationError> {
        self.deps
            .call_repository
            .find_by_id(call_id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("call", call_id))
    }

    /// 校验并持久化状态迁移；进入终态时时长随之确定。
    pub async fn record_call_status(
        &self,
        call_id: CallId,
        status: CallStatus,
    ) -> Result<CallSession, ApplicationError> {
        let call = self
            .deps
            .call_repository
            .transition(call_id, status, self.deps.clock.now())
            .await
            .map_err(not_found("call", call_id))?;
        Ok(call)
    }

    fn page_limit(&self, requested: Option<u32>) -> u32 {
        let max = self.deps.limits.history_page_limit;
        requested.unwrap_or(max).clamp(1, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::InMemoryStore;
    use domain::User;
    use time::OffsetDateTime;

    struct Fixture {
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
        gateway: PersistenceGateway,
        alice: UserId,
        bob: UserId,
    }

    async fn fixture() -> Fixture {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(OffsetDateTime::now_utc()));
        let alice = UserId::generate();
        let bob = UserId::generate();
        store.insert_user(User::new(alice, "alice")).await;
        store.insert_user(User::new(bob, "bob")).await;
        let gateway = PersistenceGateway::new(PersistenceGatewayDependencies::from_store(
            store.clone(),
            clock.clone(),
            GatewayLimits {
                max_upload_bytes: 16,
                history_page_limit: 3,
            },
        ));
        Fixture {
            store,
            clock,
            gateway,
            alice,
            bob,
        }
    }

    fn text(destination: MessageDestination, sender: UserId, content: &str) -> CreateMessageRequest {
        CreateMessageRequest {
            destination,
            sender,
            recipient: None,
            content: Some(content.to_string()),
            file: None,
        }
    }

    #[tokio::test]
    async fn get_or_create_room_reuses_the_slug() {
        let fx = fixture().await;
        let first = fx
            .gateway
            .get_or_create_room("General Chat", Some(fx.alice))
            .await
            .unwrap();
        let second = fx
            .gateway
            .get_or_create_room("general   chat", Some(fx.bob))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.creator, Some(fx.alice));
        assert_eq!(
            fx.gateway.get_room_by_slug("general-chat").await.unwrap().id,
            first.id
        );
    }

    #[tokio::test]
    async fn direct_message_creates_one_conversation_per_pair() {
        let fx = fixture().await;
        let peers = ConversationPeers::new(fx.alice, fx.bob).unwrap();
        let destination = MessageDestination::Conversation(peers);

        let first = fx
            .gateway
            .create_message(text(destination, fx.alice, "hi bob"))
            .await
            .unwrap();
        let reply = fx
            .gateway
            .create_message(text(destination, fx.bob, "hi alice"))
            .await
            .unwrap();
        assert_eq!(first.recipient, Some(fx.bob));
        assert_eq!(reply.recipient, Some(fx.alice));
        assert_eq!(first.conversation_id(), reply.conversation_id());
        assert_eq!(fx.store.conversation_count().await, 1);

        let history = fx
            .gateway
            .conversation_history(fx.bob, fx.alice, None, None)
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, reply.id);

        assert_eq!(fx.gateway.mark_conversation_read(fx.bob, fx.alice).await.unwrap(), 1);
        assert_eq!(fx.gateway.mark_conversation_read(fx.bob, fx.alice).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn invalid_messages_leave_no_trace() {
        let fx = fixture().await;
        let room = fx.gateway.get_or_create_room("lobby", None).await.unwrap();
        let destination = MessageDestination::Room(room.id);

        let err = fx
            .gateway
            .create_message(text(destination, fx.alice, "   "))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let mut empty = text(destination, fx.alice, "x");
        empty.content = None;
        let err = fx.gateway.create_message(empty).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let err = fx
            .gateway
            .create_message(text(destination, UserId::generate(), "ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::NotFound { resource: "user", .. }));

        let err = fx
            .gateway
            .create_message(text(MessageDestination::Room(RoomId::generate()), fx.alice, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::NotFound { resource: "room", .. }));

        let mut oversized = text(destination, fx.alice, "x");
        oversized.content = None;
        oversized.file = Some(FileUpload {
            name: "big.bin".into(),
            content_type: None,
            data: vec![0; 17],
        });
        let err = fx.gateway.create_message(oversized).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        fx.store.set_fail_writes(true);
        let err = fx
            .gateway
            .create_message(text(destination, fx.alice, "lost"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "STORAGE_FAILURE");
        assert_eq!(fx.store.message_count().await, 0);
    }

    #[tokio::test]
    async fn file_messages_store_the_attachment() {
        let fx = fixture().await;
        let room = fx.gateway.get_or_create_room("files", None).await.unwrap();
        let stored = fx
            .gateway
            .store_message(CreateMessageRequest {
                destination: MessageDestination::Room(room.id),
                sender: fx.alice,
                recipient: None,
                content: None,
                file: Some(FileUpload {
                    name: "../notes.txt".into(),
                    content_type: Some("text/plain".into()),
                    data: b"hello".to_vec(),
                }),
            })
            .await
            .unwrap();
        assert_eq!(stored.file_name.as_deref(), Some("notes.txt"));
        let file_id = stored.message.file.unwrap();
        let file = fx.gateway.get_file(file_id).await.unwrap();
        assert_eq!(file.data, b"hello");
        assert_eq!(file.content_type, "text/plain");
    }

    #[tokio::test]
    async fn clear_history_reports_deleted_rows() {
        let fx = fixture().await;
        let room = fx.gateway.get_or_create_room("noisy", None).await.unwrap();
        for n in 0..4 {
            fx.gateway
                .create_message(text(MessageDestination::Room(room.id), fx.alice, &format!("m{n}")))
                .await
                .unwrap();
        }
        let page = fx.gateway.room_history(room.id, Some(100), None).await.unwrap();
        assert_eq!(page.len(), 3);

        assert_eq!(fx.gateway.clear_history(room.id).await.unwrap(), 4);
        assert_eq!(fx.gateway.clear_history(room.id).await.unwrap(), 0);
        let err = fx.gateway.clear_history(RoomId::generate()).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn room_icon_replacement_and_deletion() {
        let fx = fixture().await;
        let room = fx
            .gateway
            .get_or_create_room("design", Some(fx.alice))
            .await
            .unwrap();
        let upload = FileUpload {
            name: "icon.png".into(),
            content_type: Some("image/png".into()),
            data: vec![1, 2, 3],
        };
        let updated = fx
            .gateway
            .update_room_icon(room.id, fx.bob, upload)
            .await
            .unwrap();
        let icon = updated.icon.unwrap();
        assert_eq!(fx.gateway.get_file(icon).await.unwrap().uploaded_by, fx.bob);

        let err = fx.gateway.delete_room(room.id, fx.bob).await.unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
        fx.gateway.delete_room(room.id, fx.alice).await.unwrap();
        assert_eq!(fx.gateway.get_room(room.id).await.unwrap_err().code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn call_status_is_persisted_with_duration() {
        let fx = fixture().await;
        let call = fx.gateway.start_call(fx.alice, fx.bob).await.unwrap();
        assert_eq!(call.status, CallStatus::Contacting);

        fx.gateway
            .record_call_status(call.id, CallStatus::Accepted)
            .await
            .unwrap();
        fx.clock.advance(time::Duration::seconds(42));
        let ended = fx
            .gateway
            .record_call_status(call.id, CallStatus::Ended)
            .await
            .unwrap();
        assert_eq!(ended.duration(), Some(time::Duration::seconds(42)));

        let err = fx
            .gateway
            .record_call_status(call.id, CallStatus::Accepted)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ApplicationError::InvalidTransition {
                from: CallStatus::Ended,
                to: CallStatus::Accepted
            }
        );
        assert_eq!(fx.gateway.get_call(call.id).await.unwrap().status, CallStatus::Ended);

        let err = fx
            .gateway
            .record_call_status(CallId::generate(), CallStatus::Ended)
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::NotFound { resource: "call", .. }));

        let err = fx.gateway.start_call(fx.alice, fx.alice).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
