use std::sync::Arc;

use config::AppConfig;
use thiserror::Error;

use crate::{
    migrations::MIGRATOR,
    redis::{RedisError, RedisNotifier},
    repository::{create_pg_pool, PgStorage},
};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("redis error: {0}")]
    Redis(#[from] RedisError),
}

#[derive(Clone)]
pub struct Infrastructure {
    pub storage: Arc<PgStorage>,
    /// 配置了 `REDIS_URL` 时存在
    pub notifier: Option<Arc<RedisNotifier>>,
}

impl Infrastructure {
    /// 连接数据库并执行迁移；配置了 Redis 时同时建立通知发布连接。
    pub async fn connect(config: &AppConfig) -> Result<Self, InfrastructureError> {
        let pool =
            create_pg_pool(&config.database.url, config.database.max_connections).await?;
        MIGRATOR.run(&pool).await?;
        tracing::info!("数据库迁移完成");

        let notifier = match &config.redis.url {
            Some(url) => Some(Arc::new(RedisNotifier::connect(url).await?)),
            None => None,
        };

        Ok(Self {
            storage: Arc::new(PgStorage::new(pool)),
            notifier,
        })
    }
}
