//! 通话信令状态机。
//!
//! ```text
//! Contacting ──> Accepted ──> Processing ──> Ended
//!     │              └──────────────────────> Ended
//!     └──> Rejected | Busy | NotAvailable | Missed
//! ```
//!
//! 终态不接受任何迁移。

use std::fmt;

use serde::{Deserialize, Serialize};
use time::Duration;

use crate::errors::DomainError;
use crate::value_objects::{CallId, Timestamp, UserId};

/// 通话状态。持久化编码见 [`CallStatus::code`]。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Contacting,
    NotAvailable,
    Accepted,
    Rejected,
    Busy,
    Processing,
    Ended,
    Missed,
}

impl CallStatus {
    pub fn code(self) -> i16 {
        match self {
            CallStatus::Contacting => 0,
            CallStatus::NotAvailable => 1,
            CallStatus::Accepted => 2,
            CallStatus::Rejected => 3,
            CallStatus::Busy => 4,
            CallStatus::Processing => 5,
            CallStatus::Ended => 6,
            CallStatus::Missed => 7,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        let status = match code {
            0 => CallStatus::Contacting,
            1 => CallStatus::NotAvailable,
            2 => CallStatus::Accepted,
            3 => CallStatus::Rejected,
            4 => CallStatus::Busy,
            5 => CallStatus::Processing,
            6 => CallStatus::Ended,
            7 => CallStatus::Missed,
            _ => return None,
        };
        Some(status)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallStatus::Ended
                | CallStatus::Rejected
                | CallStatus::Busy
                | CallStatus::NotAvailable
                | CallStatus::Missed
        )
    }

    pub fn can_transition_to(self, next: CallStatus) -> bool {
        use CallStatus::*;
        matches!(
            (self, next),
            (Contacting, Accepted | Rejected | Busy | NotAvailable | Missed)
                | (Accepted, Processing | Ended)
                | (Processing, Ended)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Contacting => "contacting",
            CallStatus::NotAvailable => "not_available",
            CallStatus::Accepted => "accepted",
            CallStatus::Rejected => "rejected",
            CallStatus::Busy => "busy",
            CallStatus::Processing => "processing",
            CallStatus::Ended => "ended",
            CallStatus::Missed => "missed",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSession {
    pub id: CallId,
    pub caller: UserId,
    pub receiver: UserId,
    pub status: CallStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: Timestamp,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<Timestamp>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: Timestamp,
}

impl CallSession {
    pub fn start(
        id: CallId,
        caller: UserId,
        receiver: UserId,
        now: Timestamp,
    ) -> Result<Self, DomainError> {
        if caller == receiver {
            return Err(DomainError::validation("receiver", "cannot call yourself"));
        }
        Ok(Self {
            id,
            caller,
            receiver,
            status: CallStatus::Contacting,
            started_at: now,
            ended_at: None,
            created_at: now,
        })
    }

    /// 迁移到 `next`。失败时自身状态不变。
    pub fn transition(&mut self, next: CallStatus, now: Timestamp) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invalid_transition(self.status, next));
        }
        // 接通时重置起始时间，时长只统计通话部分
        if next == CallStatus::Accepted {
            self.started_at = now;
        }
        if next.is_terminal() {
            self.ended_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// 仅终态有意义。
    pub fn duration(&self) -> Option<Duration> {
        if !self.status.is_terminal() {
            return None;
        }
        self.ended_at
            .map(|ended| (ended - self.started_at).max(Duration::ZERO))
    }

    pub fn involves(&self, user: UserId) -> bool {
        self.caller == user || self.receiver == user
    }

    pub fn parties(&self) -> [UserId; 2] {
        [self.caller, self.receiver]
    }
}
