use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{FileId, RoomId, RoomName, RoomSlug, Timestamp, UserId};

/// 聊天室。
///
/// slug 在创建时由名称推导，之后不再变化；成员集合单独存放在仓储中。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: RoomName,
    pub slug: RoomSlug,
    pub creator: Option<UserId>,
    pub icon: Option<FileId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: Timestamp,
}

impl Room {
    pub fn create(
        id: RoomId,
        name: impl Into<String>,
        creator: Option<UserId>,
        now: Timestamp,
    ) -> Result<Self, DomainError> {
        let name = RoomName::parse(name)?;
        let slug = name.slug()?;
        Ok(Self {
            id,
            name,
            slug,
            creator,
            icon: None,
            created_at: now,
        })
    }

    pub fn replace_icon(&mut self, file: FileId) -> Option<FileId> {
        self.icon.replace(file)
    }
}
