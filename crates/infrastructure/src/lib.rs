//! 基础设施层实现。
//!
//! PostgreSQL 仓储与 Redis 通知通道，实现应用层定义的存储与通知接口。

pub mod builder;
pub mod migrations;
pub mod redis;
pub mod repository;

pub use builder::{Infrastructure, InfrastructureError};
pub use migrations::MIGRATOR;
pub use self::redis::{RedisCallRelay, RedisError, RedisNotifier};
pub use repository::{
    create_pg_pool, PgCallRepository, PgConversationRepository, PgFileRepository,
    PgMessageRepository, PgRoomRepository, PgStorage, PgUserRepository,
};
