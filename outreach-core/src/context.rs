use std::sync::Arc;
use crate::config::Config;
use crate::db::{create_pool as create_db_pool, run_migrations};
use crate::limiter::{create_redis_pool, ApprovalRateLimiter, RedisApprovalLimiter};
use crate::pg_store::PgMessageStore;
use crate::store::MessageStore;

#[derive(Clone)]
pub struct OutreachContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn MessageStore>,
    pub approval_limiter: Arc<dyn ApprovalRateLimiter>,
}

impl OutreachContext {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let db_pool = create_db_pool(&config.database).await?;
        if config.database.run_migrations {
            run_migrations(&config.database.url).await?;
        }
        let redis_pool = create_redis_pool(&config.redis).await?;
        let approval_limiter = RedisApprovalLimiter::new(redis_pool, &config.redis);

        Ok(OutreachContext {
            config: Arc::new(config),
            store: Arc::new(PgMessageStore::new(db_pool)),
            approval_limiter: Arc::new(approval_limiter),
        })
    }

    /// Builds a context around already constructed backends.
    pub fn from_parts(
        config: Config,
        store: Arc<dyn MessageStore>,
        approval_limiter: Arc<dyn ApprovalRateLimiter>,
    ) -> Self {
        OutreachContext {
            config: Arc::new(config),
            store,
            approval_limiter,
        }
    }
}
