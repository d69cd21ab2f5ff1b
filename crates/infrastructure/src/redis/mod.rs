//! 跨实例的通话通知通道
//!
//! 通知发布到 `user_{id}_calls` 频道，每个实例订阅全部通话频道并把收到的
//! 通知投递给本地连接。

mod error;
mod publisher;
mod subscriber;

pub use error::{RedisError, RedisResult};
pub use publisher::RedisNotifier;
pub use subscriber::RedisCallRelay;
