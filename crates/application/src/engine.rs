use std::sync::Arc;
use std::time::Duration;

use config::{CallConfig, SessionConfig};
use domain::{RoomId, UserId};

use crate::auth::Authenticator;
use crate::broadcaster::MessageBroadcaster;
use crate::dispatcher::BroadcastDispatcher;
use crate::error::ApplicationError;
use crate::notifier::{Notifier, SessionNotifier};
use crate::registry::RoomRegistry;
use crate::retry::RetryPolicy;
use crate::services::{
    CallCoordinator, CallCoordinatorDependencies, PersistenceGateway,
    PersistenceGatewayDependencies,
};
use crate::session::Session;

/// 每个连接的出站队列参数。
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub outbound_capacity: usize,
    pub control_send_timeout: Duration,
}

impl SessionLimits {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            outbound_capacity: config.outbound_capacity,
            control_send_timeout: Duration::from_millis(config.control_send_timeout_ms),
        }
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

pub struct ChatEngineDependencies {
    pub registry: Arc<RoomRegistry>,
    pub broadcaster: Arc<dyn MessageBroadcaster>,
    pub gateway: Arc<PersistenceGateway>,
    pub authenticator: Arc<dyn Authenticator>,
    pub calls: Arc<CallCoordinator>,
    pub limits: SessionLimits,
}

/// 显式构造的共享状态，注入到每个会话中。
pub struct ChatEngine {
    deps: ChatEngineDependencies,
}

impl ChatEngine {
    pub fn new(deps: ChatEngineDependencies) -> Arc<Self> {
        Arc::new(Self { deps })
    }

    /// 按配置组装完整引擎。`notifier` 为空时通话通知走进程内投递。
    pub fn assemble(
        gateway: PersistenceGatewayDependencies,
        authenticator: Arc<dyn Authenticator>,
        notifier: Option<Arc<dyn Notifier>>,
        session: &SessionConfig,
        calls: &CallConfig,
    ) -> Arc<Self> {
        let registry = RoomRegistry::new();
        let broadcaster: Arc<dyn MessageBroadcaster> =
            Arc::new(BroadcastDispatcher::new(registry.clone()));
        let gateway = Arc::new(PersistenceGateway::new(gateway));
        let notifier = notifier
            .unwrap_or_else(|| Arc::new(SessionNotifier::new(broadcaster.clone())));
        let calls = CallCoordinator::new(CallCoordinatorDependencies {
            gateway: gateway.clone(),
            notifier,
            retry: RetryPolicy::from_config(calls),
            missed_timeout: Duration::from_secs(calls.missed_timeout_secs),
        });
        Self::new(ChatEngineDependencies {
            registry,
            broadcaster,
            gateway,
            authenticator,
            calls,
            limits: SessionLimits::from_config(session),
        })
    }

    pub fn open_session(self: &Arc<Self>) -> Session {
        Session::new(Arc::clone(self))
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.deps.registry
    }

    pub fn broadcaster(&self) -> &Arc<dyn MessageBroadcaster> {
        &self.deps.broadcaster
    }

    pub fn gateway(&self) -> &Arc<PersistenceGateway> {
        &self.deps.gateway
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.deps.authenticator
    }

    pub fn calls(&self) -> &Arc<CallCoordinator> {
        &self.deps.calls
    }

    pub fn limits(&self) -> SessionLimits {
        self.deps.limits
    }

    /// 删除房间并丢弃注册表条目。仍在房间里的连接之后收不到任何广播。
    pub async fn delete_room(
        &self,
        room_id: RoomId,
        actor: UserId,
    ) -> Result<(), ApplicationError> {
        self.deps.gateway.delete_room(room_id, actor).await?;
        self.deps.registry.forget_room(room_id);
        Ok(())
    }
}
