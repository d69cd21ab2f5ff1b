//! 主应用程序入口
//!
//! 加载配置、连接存储并执行迁移，启动 Axum Web API 服务。

use std::sync::Arc;

use application::{
    ChatEngine, GatewayLimits, Notifier, RetryPolicy, SessionNotifier, SystemClock,
};
use config::AppConfig;
use infrastructure::{Infrastructure, RedisCallRelay};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = AppConfig::load()?;
    config.validate()?;
    tracing::info!(
        bind = %config.bind_address(),
        redis = config.redis.url.is_some(),
        "配置加载完成"
    );

    let infrastructure = Infrastructure::connect(&config).await?;
    let jwt_service = Arc::new(JwtService::new(config.jwt.clone()));
    let notifier = infrastructure
        .notifier
        .clone()
        .map(|notifier| notifier as Arc<dyn Notifier>);

    let engine = ChatEngine::assemble(
        infrastructure.storage.gateway_dependencies(
            Arc::new(SystemClock),
            GatewayLimits::from_config(&config.session),
        ),
        jwt_service.clone(),
        notifier,
        &config.session,
        &config.calls,
    );

    // 多实例部署时，其他实例发布的通话通知经 Redis 转交给本实例的连接
    let shutdown = CancellationToken::new();
    let relay_task = match &config.redis.url {
        Some(url) => {
            let local = Arc::new(SessionNotifier::new(engine.broadcaster().clone()));
            let relay = RedisCallRelay::new(url, local)?;
            let token = shutdown.clone();
            let policy = RetryPolicy::from_config(&config.calls);
            Some(tokio::spawn(relay.run(token, policy)))
        }
        None => None,
    };

    let app = router(AppState::new(engine, jwt_service));
    let listener = tokio::net::TcpListener::bind(config.bind_address()).await?;
    tracing::info!(addr = %listener.local_addr()?, "聊天服务器已启动");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "监听退出信号失败");
            }
            tracing::info!("收到退出信号，开始关停");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(task) = relay_task {
        let _ = task.await;
    }
    tracing::info!("服务器已关闭");
    Ok(())
}
