//! 通话信令协调器。
//!
//! 状态迁移先持久化，再通过 [`Notifier`] 通知双方。通知失败按退避策略重试，
//! 重试耗尽只记录错误，已提交的状态不回滚。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use domain::{CallId, CallSession, CallStatus, UserId};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::ApplicationError;
use crate::events::CallNotice;
use crate::notifier::{call_topic, Notifier};
use crate::retry::{retry_async, RetryPolicy};
use crate::services::gateway::PersistenceGateway;

pub struct CallCoordinatorDependencies {
    pub gateway: Arc<PersistenceGateway>,
    pub notifier: Arc<dyn Notifier>,
    pub retry: RetryPolicy,
    /// 呼叫无人应答多久后自动标记为 Missed
    pub missed_timeout: Duration,
}

pub struct CallCoordinator {
    deps: CallCoordinatorDependencies,
    timers: Mutex<HashMap<CallId, CancellationToken>>,
}

impl CallCoordinator {
    pub fn new(deps: CallCoordinatorDependencies) -> Arc<Self> {
        Arc::new(Self {
            deps,
            timers: Mutex::new(HashMap::new()),
        })
    }

    /// 发起呼叫：写入 Contacting 记录，启动未接听计时，通知双方。
    pub async fn start_call(
        self: &Arc<Self>,
        caller: UserId,
        receiver: UserId,
    ) -> Result<CallSession, ApplicationError> {
        let call = self.deps.gateway.start_call(caller, receiver).await?;
        tracing::info!(
            call_id = %call.id,
            caller = %caller,
            receiver = %receiver,
            "发起通话"
        );
        self.schedule_missed(call.id);
        self.notify_parties(&call);
        Ok(call)
    }

    pub async fn get_call(
        &self,
        call_id: CallId,
        viewer: UserId,
    ) -> Result<CallSession, ApplicationError> {
        let call = self.deps.gateway.get_call(call_id).await?;
        if !call.involves(viewer) {
            return Err(ApplicationError::not_found("call", call_id));
        }
        Ok(call)
    }

    /// 由通话一方驱动的状态更新。Missed 只能由计时器产生。
    pub async fn update_status(
        &self,
        call_id: CallId,
        actor: UserId,
        status: CallStatus,
    ) -> Result<CallSession, ApplicationError> {
        if status == CallStatus::Missed {
            return Err(ApplicationError::validation(
                "status",
                "missed is assigned by the server",
            ));
        }
        self.get_call(call_id, actor).await?;
        self.apply(call_id, status).await
    }

    async fn apply(
        &self,
        call_id: CallId,
        status: CallStatus,
    ) -> Result<CallSession, ApplicationError> {
        let call = self.deps.gateway.record_call_status(call_id, status).await?;
        if call.status != CallStatus::Contacting {
            self.cancel_timer(call_id);
        }
        tracing::info!(
            call_id = %call.id,
            status = %call.status,
            duration_seconds = call.duration().map(|d| d.whole_seconds()),
            "通话状态已更新"
        );
        self.notify_parties(&call);
        Ok(call)
    }

    fn schedule_missed(self: &Arc<Self>, call_id: CallId) {
        let token = CancellationToken::new();
        self.timers.lock().insert(call_id, token.clone());

        let coordinator = Arc::clone(self);
        let timeout = self.deps.missed_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    coordinator.timers.lock().remove(&call_id);
                    match coordinator.apply(call_id, CallStatus::Missed).await {
                        Ok(_) => {}
                        // 计时器与应答竞争，应答先落库
                        Err(ApplicationError::InvalidTransition { from, .. }) => {
                            tracing::debug!(
                                call_id = %call_id,
                                from = %from,
                                "通话已应答，跳过超时"
                            );
                        }
                        Err(err) => {
                            tracing::error!(call_id = %call_id, error = %err, "标记未接听失败");
                        }
                    }
                }
            }
        });
    }

    fn cancel_timer(&self, call_id: CallId) {
        if let Some(token) = self.timers.lock().remove(&call_id) {
            token.cancel();
        }
    }

    pub fn pending_timeouts(&self) -> usize {
        self.timers.lock().len()
    }

    fn notify_parties(&self, call: &CallSession) {
        let notice = CallNotice::from(call);
        let payload = match serde_json::to_value(&notice) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(call_id = %call.id, error = %err, "通话通知序列化失败");
                return;
            }
        };

        for user_id in call.parties() {
            let notifier = Arc::clone(&self.deps.notifier);
            let policy = self.deps.retry.clone();
            let payload = payload.clone();
            let call_id = call.id;
            let status = call.status;
            tokio::spawn(async move {
                let topic = call_topic(user_id);
                let result = retry_async(&policy, "call_notification", || {
                    notifier.enqueue(&topic, payload.clone())
                })
                .await;
                if let Err(err) = result {
                    let err = ApplicationError::Notification(err.to_string());
                    tracing::error!(
                        call_id = %call_id,
                        user_id = %user_id,
                        status = %status,
                        attempts = policy.max_attempts,
                        error = %err,
                        "通话通知重试耗尽"
                    );
                }
            });
        }
    }
}
