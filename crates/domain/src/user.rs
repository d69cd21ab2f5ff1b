use serde::{Deserialize, Serialize};

use crate::value_objects::UserId;

/// 账户子系统中的用户。这里只关心身份，不涉及注册、密码与资料。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
}

impl User {
    pub fn new(id: UserId, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
        }
    }
}
