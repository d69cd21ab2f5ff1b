//! 单个连接的会话状态机：Unauthenticated → Admitted → InRoom → Closed。
//!
//! 传输层把收到的文本帧逐条交给 [`Session::process`]，并把
//! [`Session::admit`] 返回的接收端写回连接。入站指令严格串行处理；
//! 无论以何种方式结束，注册表里的登记都由守卫在 `Drop` 时撤销。

use std::sync::Arc;

use domain::{ConversationPeers, Room, RoomId, UploadedFile, UserId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::Credentials;
use crate::engine::ChatEngine;
use crate::error::ApplicationError;
use crate::events::{ClientCommand, FilePayload, OutboundFrame, ServerEvent};
use crate::outbound::SessionHandle;
use crate::registry::{RoomMembership, UserPresence};
use crate::services::{CreateMessageRequest, MessageDestination};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Admitted,
    InRoom,
    Closed,
}

pub struct Session {
    engine: Arc<ChatEngine>,
    state: SessionState,
    user_id: Option<UserId>,
    handle: Option<SessionHandle>,
    presence: Option<UserPresence>,
    membership: Option<RoomMembership>,
}

/// 一条聊天帧的投递范围。
enum Audience {
    Room(RoomId),
    Peers(ConversationPeers),
}

impl Session {
    pub(crate) fn new(engine: Arc<ChatEngine>) -> Self {
        Self {
            engine,
            state: SessionState::Unauthenticated,
            user_id: None,
            handle: None,
            presence: None,
            membership: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn room_id(&self) -> Option<RoomId> {
        self.membership.as_ref().map(RoomMembership::room_id)
    }

    /// 出站投递超时被强制断开时取消。未准入前返回一个独立的令牌。
    pub fn closed_token(&self) -> CancellationToken {
        self.handle
            .as_ref()
            .map(SessionHandle::closed_token)
            .unwrap_or_default()
    }

    /// 认证并登记连接，返回出站帧的接收端。
    ///
    /// 认证失败时会话直接进入 Closed，调用方应关闭连接且不附带错误内容。
    pub async fn admit(
        &mut self,
        credentials: &Credentials,
    ) -> Result<mpsc::Receiver<OutboundFrame>, ApplicationError> {
        if self.state != SessionState::Unauthenticated {
            return Err(ApplicationError::validation("session", "already admitted"));
        }
        let user_id = match self.engine.authenticator().current_identity(credentials).await {
            Ok(user_id) => user_id,
            Err(_) => {
                self.state = SessionState::Closed;
                tracing::info!("连接认证失败，关闭");
                return Err(ApplicationError::Unauthorized);
            }
        };

        let limits = self.engine.limits();
        let (handle, receiver) = SessionHandle::channel(
            user_id,
            limits.outbound_capacity,
            limits.control_send_timeout,
        );
        self.presence = Some(self.engine.registry().register_user_session(handle.clone()));
        tracing::info!(user_id = %user_id, session_id = %handle.id(), "连接已准入");
        self.handle = Some(handle);
        self.user_id = Some(user_id);
        self.state = SessionState::Admitted;
        Ok(receiver)
    }

    /// 加入房间（不存在则创建）。已在其他房间时先离开。
    pub async fn join_room(&mut self, name: &str) -> Result<Room, ApplicationError> {
        let (user_id, handle) = self.admitted()?;
        let gateway = self.engine.gateway();
        let room = gateway.get_or_create_room(name, Some(user_id)).await?;
        gateway.add_member(room.id, user_id).await?;

        // 先离开旧房间，同一时刻只属于一个房间
        self.membership = None;
        self.membership = Some(self.engine.registry().join_scoped(room.id, handle.clone()));
        self.state = SessionState::InRoom;
        tracing::info!(
            user_id = %user_id,
            session_id = %handle.id(),
            room_id = %room.id,
            slug = %room.slug,
            "加入房间"
        );

        handle
            .deliver(OutboundFrame::new(ServerEvent::RoomJoined { room: room.clone() }))
            .await;
        Ok(room)
    }

    /// 处理一帧文本。失败只回报给本连接，连接保持打开。
    pub async fn process(&mut self, text: &str) {
        if self.is_closed() {
            return;
        }
        let result = self.handle_text(text).await;
        self.report(result).await;
    }

    /// 执行一条已解析的指令，失败同样只回报给本连接。
    pub async fn execute(&mut self, command: ClientCommand) {
        if self.is_closed() {
            return;
        }
        let result = match self.admitted() {
            Ok(_) => self.handle_command(command).await,
            Err(err) => Err(err),
        };
        self.report(result).await;
    }

    async fn report(&self, result: Result<(), ApplicationError>) {
        let Err(err) = result else {
            return;
        };
        match &err {
            ApplicationError::Storage(_) => {
                tracing::error!(user_id = ?self.user_id, error = %err, "指令处理失败")
            }
            _ => tracing::debug!(user_id = ?self.user_id, error = %err, "指令被拒绝"),
        }
        if let Some(handle) = &self.handle {
            handle
                .deliver(OutboundFrame::new(ServerEvent::error(&err)))
                .await;
        }
    }

    pub async fn handle_text(&mut self, text: &str) -> Result<(), ApplicationError> {
        self.admitted()?;
        let command = ClientCommand::parse(text)?;
        tracing::debug!(user_id = ?self.user_id, command = command.name(), "收到指令");
        self.handle_command(command).await
    }

    pub async fn handle_command(
        &mut self,
        command: ClientCommand,
    ) -> Result<(), ApplicationError> {
        match command {
            ClientCommand::JoinRoom { room } => self.join_room(&room).await.map(|_| ()),
            ClientCommand::SendMessage {
                content,
                recipient,
                to,
            } => self.send(Some(content), None, recipient, to).await,
            ClientCommand::SendFile {
                file,
                recipient,
                to,
            } => self.send(None, Some(file), recipient, to).await,
            ClientCommand::ChangeRoomIcon { file } => self.change_room_icon(file).await,
            ClientCommand::ClearHistory => self.clear_history().await,
        }
    }

    async fn send(
        &mut self,
        content: Option<String>,
        file: Option<FilePayload>,
        recipient: Option<UserId>,
        to: Option<UserId>,
    ) -> Result<(), ApplicationError> {
        let (room_id, user_id) = self.in_room()?;
        let file = file.as_ref().map(FilePayload::decode).transpose()?;

        let (destination, audience) = match to {
            Some(peer) => {
                let peers = ConversationPeers::new(user_id, peer)?;
                (MessageDestination::Conversation(peers), Audience::Peers(peers))
            }
            None => (MessageDestination::Room(room_id), Audience::Room(room_id)),
        };
        let stored = self
            .engine
            .gateway()
            .store_message(CreateMessageRequest {
                destination,
                sender: user_id,
                recipient,
                content,
                file,
            })
            .await?;

        let event = match stored.file_name {
            Some(file_name) => ServerEvent::file_message(stored.message, file_name),
            None => ServerEvent::NewMessage {
                message: stored.message,
            },
        };
        self.fan_out(audience, OutboundFrame::new(event)).await;
        Ok(())
    }

    async fn fan_out(&self, audience: Audience, frame: OutboundFrame) {
        let broadcaster = self.engine.broadcaster();
        match audience {
            Audience::Room(room_id) => {
                broadcaster.broadcast(room_id, frame).await;
            }
            Audience::Peers(peers) => {
                broadcaster.notify_user(peers.low(), frame.clone()).await;
                broadcaster.notify_user(peers.high(), frame).await;
            }
        }
    }

    async fn change_room_icon(&mut self, file: FilePayload) -> Result<(), ApplicationError> {
        let (room_id, user_id) = self.in_room()?;
        let upload = file.decode()?;
        let room = self
            .engine
            .gateway()
            .update_room_icon(room_id, user_id, upload)
            .await?;
        let icon_id = room
            .icon
            .ok_or_else(|| ApplicationError::Storage("room icon was not stored".to_string()))?;

        let event = ServerEvent::ChangeIcon {
            room_id,
            icon_id,
            icon_url: UploadedFile::url_for(icon_id),
            changed_by: user_id,
        };
        self.fan_out(Audience::Room(room_id), OutboundFrame::new(event))
            .await;
        Ok(())
    }

    async fn clear_history(&mut self) -> Result<(), ApplicationError> {
        let (room_id, user_id) = self.in_room()?;
        let deleted = self.engine.gateway().clear_history(room_id).await?;
        let event = ServerEvent::HistoryCleared {
            room_id,
            deleted,
            cleared_by: user_id,
        };
        self.fan_out(Audience::Room(room_id), OutboundFrame::new(event))
            .await;
        Ok(())
    }

    /// 结束会话并撤销全部登记。可重复调用。
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.membership = None;
        self.presence = None;
        if let Some(handle) = self.handle.take() {
            handle.close();
            tracing::info!(user_id = %handle.user_id(), session_id = %handle.id(), "连接已关闭");
        }
        self.state = SessionState::Closed;
    }

    fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
            || self.handle.as_ref().is_some_and(SessionHandle::is_closed)
    }

    fn admitted(&self) -> Result<(UserId, SessionHandle), ApplicationError> {
        match (self.state, self.user_id, &self.handle) {
            (SessionState::Admitted | SessionState::InRoom, Some(user_id), Some(handle)) => {
                Ok((user_id, handle.clone()))
            }
            _ => Err(ApplicationError::Unauthorized),
        }
    }

    fn in_room(&self) -> Result<(RoomId, UserId), ApplicationError> {
        let (user_id, _) = self.admitted()?;
        self.room_id()
            .map(|room_id| (room_id, user_id))
            .ok_or_else(|| ApplicationError::validation("room", "join a room first"))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
