use anyhow::{anyhow, Result};
use diesel_async::async_connection_wrapper::AsyncConnectionWrapper;
use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::sync::Arc;
use tokio::time::Duration;
use tracing;

use crate::config::DatabaseConfig;

pub type DbPool = Pool<AsyncPgConnection>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

pub async fn create_pool(config: &DatabaseConfig) -> Result<Arc<DbPool>> {
    tracing::info!("Connecting to Postgres at {}", mask_database_url(&config.url));

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.url);
    let pool = Pool::builder(manager)
        .max_size(config.max_connections as usize)
        .build()
        .map_err(|e| anyhow!("Failed to create connection pool: {}", e))?;

    wait_for_database(&pool).await?;
    Ok(Arc::new(pool))
}

/// Checks out one connection, backing off 1s, 2s, 4s... between attempts so
/// the service can start alongside its database.
async fn wait_for_database(pool: &DbPool) -> Result<()> {
    let mut attempt = 1;
    loop {
        let error = match tokio::time::timeout(CONNECT_TIMEOUT, pool.get()).await {
            Ok(Ok(_conn)) => {
                tracing::info!("Database connection established");
                return Ok(());
            }
            Ok(Err(e)) => anyhow!("Database connection failed: {}", e),
            Err(_) => anyhow!("Database connection timed out after {:?}", CONNECT_TIMEOUT),
        };

        if attempt == CONNECT_ATTEMPTS {
            tracing::error!("Giving up on the database after {} attempts", attempt);
            return Err(error);
        }

        let backoff = Duration::from_secs(1 << (attempt - 1));
        tracing::warn!("{} (attempt {}/{}), retrying in {:?}", error, attempt, CONNECT_ATTEMPTS, backoff);
        tokio::time::sleep(backoff).await;
        attempt += 1;
    }
}

/// Applies pending embedded migrations on a blocking thread.
pub async fn run_migrations(url: &str) -> Result<()> {
    let url = url.to_string();
    let applied = tokio::task::spawn_blocking(move || -> Result<usize> {
        use diesel::Connection;

        let mut conn = AsyncConnectionWrapper::<AsyncPgConnection>::establish(&url)
            .map_err(|e| anyhow!("Failed to connect for migrations: {}", e))?;
        let versions = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow!("Failed to run migrations: {}", e))?;
        Ok(versions.len())
    })
    .await
    .map_err(|e| anyhow!("Migration task panicked: {}", e))??;

    tracing::info!("Applied {} pending migration(s)", applied);
    Ok(())
}

pub(crate) fn mask_database_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        let (before_at, after_at) = url.split_at(at_pos);
        if let Some(colon_pos) = before_at.rfind(':') {
            let (protocol_user, _password) = before_at.split_at(colon_pos);
            format!("{}:****{}", protocol_user, after_at)
        } else {
            "postgres://****@****".to_string()
        }
    } else {
        "Invalid URL format".to_string()
    }
}
