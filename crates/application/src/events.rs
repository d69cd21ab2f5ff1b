//! 连接上的 JSON 文本帧协议。
//!
//! 入站帧以 `command` 字段区分指令；出站帧同时带 `command` 与 `type`，
//! `type` 决定投递策略（`chat` 可丢弃，其余不可丢弃）。

use data_encoding::BASE64;
use domain::{
    CallId, CallSession, CallStatus, FileId, Message, Room, RoomId, Timestamp, UploadedFile,
    UserId,
};
use serde::{Deserialize, Serialize};

use crate::error::ApplicationError;

const KNOWN_COMMANDS: [&str; 5] = [
    "join_room",
    "send_message",
    "send_file",
    "change_room_icon",
    "clear_history",
];

/// 客户端指令，封闭集合。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientCommand {
    JoinRoom {
        room: String,
    },
    SendMessage {
        content: String,
        #[serde(default)]
        recipient: Option<UserId>,
        /// 设置后按一对一会话投递
        #[serde(default)]
        to: Option<UserId>,
    },
    SendFile {
        file: FilePayload,
        #[serde(default)]
        recipient: Option<UserId>,
        #[serde(default)]
        to: Option<UserId>,
    },
    ChangeRoomIcon {
        file: FilePayload,
    },
    ClearHistory,
}

impl ClientCommand {
    /// 解析一帧文本。
    ///
    /// 未知指令返回 `UnsupportedCommand`；已知指令但字段不合法返回 `Validation`。
    pub fn parse(text: &str) -> Result<Self, ApplicationError> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|err| ApplicationError::validation("frame", err.to_string()))?;
        let command = value
            .get("command")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ApplicationError::validation("command", "missing command field"))?;
        if !KNOWN_COMMANDS.contains(&command) {
            return Err(ApplicationError::UnsupportedCommand(command.to_owned()));
        }
        serde_json::from_value(value)
            .map_err(|err| ApplicationError::validation("payload", err.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::JoinRoom { .. } => "join_room",
            ClientCommand::SendMessage { .. } => "send_message",
            ClientCommand::SendFile { .. } => "send_file",
            ClientCommand::ChangeRoomIcon { .. } => "change_room_icon",
            ClientCommand::ClearHistory => "clear_history",
        }
    }
}

/// 帧内携带的文件，`data` 为 base64，也接受 `data:<mime>;base64,` 形式的 data URL。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FilePayload {
    pub name: String,
    #[serde(default)]
    pub content_type: Option<String>,
    pub data: String,
}

/// 解码后的上传内容。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub name: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl FilePayload {
    pub fn decode(&self) -> Result<FileUpload, ApplicationError> {
        let (declared_type, encoded) = match self.data.strip_prefix("data:") {
            Some(rest) => {
                let (header, body) = rest.split_once(',').ok_or_else(|| {
                    ApplicationError::validation("file.data", "malformed data URL")
                })?;
                let mime = header.strip_suffix(";base64").ok_or_else(|| {
                    ApplicationError::validation("file.data", "data URL must be base64")
                })?;
                (Some(mime.to_owned()).filter(|m| !m.is_empty()), body)
            }
            None => (None, self.data.as_str()),
        };
        let data = BASE64
            .decode(encoded.trim().as_bytes())
            .map_err(|err| ApplicationError::validation("file.data", err.to_string()))?;
        Ok(FileUpload {
            name: self.name.clone(),
            content_type: self.content_type.clone().or(declared_type),
            data,
        })
    }
}

/// 出站帧的投递类别。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Chat,
    Info,
    Control,
    Call,
    Error,
}

/// 通话状态通知，同时也是 `user_{id}_calls` 主题上的负载。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallNotice {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub status: CallStatus,
    pub status_code: i16,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: Timestamp,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<Timestamp>,
    pub duration_seconds: Option<i64>,
}

impl From<&CallSession> for CallNotice {
    fn from(call: &CallSession) -> Self {
        Self {
            call_id: call.id,
            caller_id: call.caller,
            receiver_id: call.receiver,
            status: call.status,
            status_code: call.status.code(),
            started_at: call.started_at,
            ended_at: call.ended_at,
            duration_seconds: call.duration().map(|d| d.whole_seconds()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage {
        message: Message,
    },
    File {
        message: Message,
        file_name: String,
        file_url: String,
    },
    ChangeIcon {
        room_id: RoomId,
        icon_id: FileId,
        icon_url: String,
        changed_by: UserId,
    },
    HistoryCleared {
        room_id: RoomId,
        deleted: u64,
        cleared_by: UserId,
    },
    RoomJoined {
        room: Room,
    },
    CallStatus(CallNotice),
    Error {
        code: &'static str,
        message: String,
    },
}

impl ServerEvent {
    pub fn kind(&self) -> FrameKind {
        match self {
            ServerEvent::NewMessage { .. } | ServerEvent::File { .. } => FrameKind::Chat,
            ServerEvent::ChangeIcon { .. } | ServerEvent::HistoryCleared { .. } => FrameKind::Info,
            ServerEvent::RoomJoined { .. } => FrameKind::Control,
            ServerEvent::CallStatus(_) => FrameKind::Call,
            ServerEvent::Error { .. } => FrameKind::Error,
        }
    }

    pub fn file_message(message: Message, file_name: impl Into<String>) -> Self {
        let file_url = message.file.map(UploadedFile::url_for).unwrap_or_default();
        ServerEvent::File {
            message,
            file_name: file_name.into(),
            file_url,
        }
    }

    pub fn error(err: &ApplicationError) -> Self {
        ServerEvent::Error {
            code: err.code(),
            message: err.public_message(),
        }
    }
}

/// 写回连接的一帧。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(flatten)]
    pub event: ServerEvent,
}

impl OutboundFrame {
    pub fn new(event: ServerEvent) -> Self {
        Self {
            kind: event.kind(),
            event,
        }
    }

    /// 队列满时只有聊天帧可以丢弃，丢失的内容可从历史记录补回。
    pub fn is_droppable(&self) -> bool {
        self.kind == FrameKind::Chat
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<ServerEvent> for OutboundFrame {
    fn from(event: ServerEvent) -> Self {
        Self::new(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{MessageContent, MessageId, MessageTarget};
    use time::OffsetDateTime;

    #[test]
    fn parses_send_message_with_optional_fields() {
        let command =
            ClientCommand::parse(r#"{"command":"send_message","content":"hi"}"#).unwrap();
        assert_eq!(
            command,
            ClientCommand::SendMessage {
                content: "hi".into(),
                recipient: None,
                to: None
            }
        );
        assert_eq!(
            ClientCommand::parse(r#"{"command":"clear_history"}"#).unwrap(),
            ClientCommand::ClearHistory
        );
    }

    #[test]
    fn unknown_command_is_unsupported_and_bad_payload_is_invalid() {
        let err = ClientCommand::parse(r#"{"command":"dance"}"#).unwrap_err();
        assert_eq!(err, ApplicationError::UnsupportedCommand("dance".into()));

        let err = ClientCommand::parse(r#"{"command":"send_message"}"#).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let err = ClientCommand::parse("not json").unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let err = ClientCommand::parse(r#"{"content":"hi"}"#).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn file_payload_accepts_plain_base64_and_data_urls() {
        let plain = FilePayload {
            name: "a.txt".into(),
            content_type: None,
            data: BASE64.encode(b"hello"),
        };
        let upload = plain.decode().unwrap();
        assert_eq!(upload.data, b"hello");
        assert_eq!(upload.content_type, None);

        let data_url = FilePayload {
            name: "a.png".into(),
            content_type: None,
            data: format!("data:image/png;base64,{}", BASE64.encode(&[1, 2, 3])),
        };
        let upload = data_url.decode().unwrap();
        assert_eq!(upload.data, vec![1, 2, 3]);
        assert_eq!(upload.content_type.as_deref(), Some("image/png"));

        let broken = FilePayload {
            name: "a.png".into(),
            content_type: None,
            data: "%%%".into(),
        };
        assert!(broken.decode().is_err());
    }

    #[test]
    fn outbound_frame_carries_type_and_command() {
        let message = Message::new(
            MessageId::generate(),
            MessageTarget::Room(RoomId::generate()),
            UserId::generate(),
            None,
            Some(MessageContent::new("hi").unwrap()),
            None,
            OffsetDateTime::now_utc(),
        )
        .unwrap();
        let frame = OutboundFrame::new(ServerEvent::NewMessage { message });
        assert!(frame.is_droppable());
        let json: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "chat");
        assert_eq!(json["command"], "new_message");
        assert_eq!(json["message"]["content"], "hi");

        let err = ApplicationError::UnsupportedCommand("dance".into());
        let frame = OutboundFrame::new(ServerEvent::error(&err));
        assert!(!frame.is_droppable());
        let json: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["command"], "error");
        assert_eq!(json["code"], "UNSUPPORTED_COMMAND");
    }
}
