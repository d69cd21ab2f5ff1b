//! 聊天服务核心领域模型
//!
//! 包含房间、消息、一对一会话、通话记录与上传文件等实体，以及它们的校验规则。

pub mod call;
pub mod chat_room;
pub mod conversation;
pub mod errors;
pub mod file;
pub mod message;
pub mod user;
pub mod value_objects;

pub use call::{CallSession, CallStatus};
pub use chat_room::Room;
pub use conversation::{Conversation, ConversationPeers};
pub use errors::{DomainError, DomainResult, RepositoryError};
pub use file::UploadedFile;
pub use message::{Message, MessageTarget};
pub use user::User;
pub use value_objects::{
    CallId, ConversationId, FileId, MessageContent, MessageId, RoomId, RoomName, RoomSlug,
    Timestamp, UserId,
};
