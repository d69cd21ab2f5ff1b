use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{ConversationId, Timestamp, UserId};

/// 无序的用户对。`(a, b)` 与 `(b, a)` 规范化为同一个值。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationPeers {
    low: UserId,
    high: UserId,
}

impl ConversationPeers {
    pub fn new(a: UserId, b: UserId) -> Result<Self, DomainError> {
        if a == b {
            return Err(DomainError::validation(
                "recipient",
                "cannot start a conversation with yourself",
            ));
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        Ok(Self { low, high })
    }

    pub fn low(&self) -> UserId {
        self.low
    }

    pub fn high(&self) -> UserId {
        self.high
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.low == user || self.high == user
    }

    /// 返回对端用户；`user` 不在该会话中时为 `None`。
    pub fn other(&self, user: UserId) -> Option<UserId> {
        if user == self.low {
            Some(self.high)
        } else if user == self.high {
            Some(self.low)
        } else {
            None
        }
    }
}

/// 两个用户之间唯一的一对一会话。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub peers: ConversationPeers,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: Timestamp,
}

impl Conversation {
    pub fn new(id: ConversationId, peers: ConversationPeers, now: Timestamp) -> Self {
        Self {
            id,
            peers,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peers_are_symmetric() {
        let alice = UserId::generate();
        let bob = UserId::generate();
        let ab = ConversationPeers::new(alice, bob).unwrap();
        let ba = ConversationPeers::new(bob, alice).unwrap();
        assert_eq!(ab, ba);
        assert!(ab.low() < ab.high());
        assert_eq!(ab.other(alice), Some(bob));
        assert_eq!(ab.other(bob), Some(alice));
        assert_eq!(ab.other(UserId::generate()), None);
    }

    #[test]
    fn self_conversation_is_rejected() {
        let alice = UserId::generate();
        let err = ConversationPeers::new(alice, alice).unwrap_err();
        assert!(matches!(err, DomainError::Validation { .. }));
    }
}
