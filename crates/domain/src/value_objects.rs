use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::errors::DomainError;

/// 统一的时间戳类型。
pub type Timestamp = OffsetDateTime;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new(id: Uuid) -> Self {
                Self(id)
            }

            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$name> for Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

uuid_id!(
    /// 用户唯一标识。
    UserId
);
uuid_id!(
    /// 聊天室唯一标识。
    RoomId
);
uuid_id!(
    /// 消息唯一标识。
    MessageId
);
uuid_id!(
    /// 一对一会话唯一标识。
    ConversationId
);
uuid_id!(
    /// 通话记录唯一标识。
    CallId
);
uuid_id!(
    /// 上传文件唯一标识。
    FileId
);

const MAX_MESSAGE_LEN: usize = 4000;
const MAX_ROOM_NAME_LEN: usize = 50;

/// 经过验证的消息正文。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageContent(String);

impl MessageContent {
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::validation("content", "cannot be blank"));
        }
        if value.chars().count() > MAX_MESSAGE_LEN {
            return Err(DomainError::validation("content", "too long"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 房间的 URL 标识，由房间名规范化得到。
///
/// 规则：转小写；只保留字母数字、下划线、连字符与空白；连续的空白和连字符
/// 折叠为单个 `-`；去掉首尾的 `-` 与 `_`。对已规范化的值再次规范化结果不变。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomSlug(String);

impl RoomSlug {
    pub fn from_name(name: &str) -> Result<Self, DomainError> {
        let slug = slugify(name);
        if slug.is_empty() {
            return Err(DomainError::validation(
                "room",
                "name must contain at least one letter or digit",
            ));
        }
        Ok(Self(slug))
    }

    /// 解析外部传入的 slug，要求它已经是规范形式。
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        let slug = Self::from_name(value)?;
        if slug.0 != value {
            return Err(DomainError::validation("slug", "not a normalized slug"));
        }
        Ok(slug)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.chars().flat_map(char::to_lowercase) {
        if ch.is_whitespace() || ch == '-' {
            pending_dash = true;
        } else if ch.is_alphanumeric() || ch == '_' {
            if pending_dash {
                slug.push('-');
                pending_dash = false;
            }
            slug.push(ch);
        }
    }
    slug.trim_matches(|c| c == '-' || c == '_').to_owned()
}

/// 经过验证的房间名。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomName(String);

impl RoomName {
    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into().trim().to_owned();
        if value.is_empty() {
            return Err(DomainError::validation("room", "name cannot be empty"));
        }
        if value.chars().count() > MAX_ROOM_NAME_LEN {
            return Err(DomainError::validation("room", "name too long"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn slug(&self) -> Result<RoomSlug, DomainError> {
        RoomSlug::from_name(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_collapses_separators_and_strips_punctuation() {
        let slug = RoomSlug::from_name("  General -- Chat! ").unwrap();
        assert_eq!(slug.as_str(), "general-chat");

        let slug = RoomSlug::from_name("Rust & Friends").unwrap();
        assert_eq!(slug.as_str(), "rust-friends");

        let slug = RoomSlug::from_name("_hidden_room_").unwrap();
        assert_eq!(slug.as_str(), "hidden_room");
    }

    #[test]
    fn slug_is_stable_when_applied_twice() {
        let once = RoomSlug::from_name("Weekend Plans 2024").unwrap();
        let twice = RoomSlug::from_name(once.as_str()).unwrap();
        assert_eq!(once, twice);
        assert!(RoomSlug::parse(once.as_str()).is_ok());
        assert!(RoomSlug::parse("Weekend Plans").is_err());
    }

    #[test]
    fn slug_rejects_names_without_word_characters() {
        assert!(RoomSlug::from_name("!!!").is_err());
        assert!(RoomSlug::from_name("   ").is_err());
    }

    #[test]
    fn message_content_rejects_blank_and_oversized_text() {
        assert!(MessageContent::new("   ").is_err());
        assert!(MessageContent::new("x".repeat(MAX_MESSAGE_LEN + 1)).is_err());
        assert_eq!(MessageContent::new("hi").unwrap().as_str(), "hi");
    }

    #[test]
    fn room_name_is_trimmed_and_bounded() {
        assert_eq!(RoomName::parse("  lobby ").unwrap().as_str(), "lobby");
        assert!(RoomName::parse("a".repeat(MAX_ROOM_NAME_LEN + 1)).is_err());
    }
}
