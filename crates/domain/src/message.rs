use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{
    ConversationId, FileId, MessageContent, MessageId, RoomId, Timestamp, UserId,
};

/// 消息的寻址方式：属于某个房间，或属于某个一对一会话。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageTarget {
    #[serde(rename = "room_id")]
    Room(RoomId),
    #[serde(rename = "conversation_id")]
    Conversation(ConversationId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(flatten)]
    pub target: MessageTarget,
    pub sender: UserId,
    pub recipient: Option<UserId>,
    pub content: Option<MessageContent>,
    pub file: Option<FileId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: Timestamp,
    pub read: bool,
}

impl Message {
    /// 构造一条新消息。
    ///
    /// 正文和附件至少要有一个；会话消息必须带接收者。
    pub fn new(
        id: MessageId,
        target: MessageTarget,
        sender: UserId,
        recipient: Option<UserId>,
        content: Option<MessageContent>,
        file: Option<FileId>,
        created_at: Timestamp,
    ) -> Result<Self, DomainError> {
        if content.is_none() && file.is_none() {
            return Err(DomainError::validation(
                "content",
                "message requires text content or a file",
            ));
        }
        if matches!(target, MessageTarget::Conversation(_)) && recipient.is_none() {
            return Err(DomainError::validation(
                "recipient",
                "direct message requires a recipient",
            ));
        }
        Ok(Self {
            id,
            target,
            sender,
            recipient,
            content,
            file,
            created_at,
            read: false,
        })
    }

    pub fn room_id(&self) -> Option<RoomId> {
        match self.target {
            MessageTarget::Room(room_id) => Some(room_id),
            MessageTarget::Conversation(_) => None,
        }
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self.target {
            MessageTarget::Conversation(id) => Some(id),
            MessageTarget::Room(_) => None,
        }
    }

    pub fn has_file(&self) -> bool {
        self.file.is_some()
    }
}
