//! 应用层实现。
//!
//! 房间注册表、广播分发器、连接会话状态机、持久化网关与通话信令协调器，
//! 以及它们依赖的仓储、通知与认证抽象。

pub mod auth;
pub mod broadcaster;
pub mod clock;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod memory;
pub mod notifier;
pub mod outbound;
pub mod registry;
pub mod repository;
pub mod retry;
pub mod services;
pub mod session;

pub use auth::{Authenticator, Credentials};
pub use broadcaster::{DeliveryReport, MessageBroadcaster};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::BroadcastDispatcher;
pub use engine::{ChatEngine, ChatEngineDependencies, SessionLimits};
pub use error::ApplicationError;
pub use events::{ClientCommand, FrameKind, OutboundFrame, ServerEvent};
pub use memory::InMemoryStore;
pub use notifier::{call_topic, parse_call_topic, Notifier, NotifyError, SessionNotifier};
pub use outbound::{Delivery, SessionHandle, SessionId};
pub use registry::{RoomMembership, RoomRegistry, UserPresence};
pub use retry::{retry_async, RetryPolicy};
pub use services::{
    CallCoordinator, CallCoordinatorDependencies, CreateMessageRequest, GatewayLimits,
    MessageDestination, PersistenceGateway, PersistenceGatewayDependencies, StoredMessage,
};
pub use session::{Session, SessionState};
