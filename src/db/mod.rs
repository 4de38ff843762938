mod mappers;
mod queue_ops;
mod state_ops;
mod types;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, SchedulerError};

/// Schema for the agent state table and the work queue.
pub const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Postgres-backed agent state store and work channel.
#[derive(Clone)]
pub struct SchedulerDb {
    pool: PgPool,
}

impl SchedulerDb {
    /// # Errors
    /// Returns an error if the database connection fails.
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::new_with_timeout(database_url, None).await
    }

    /// # Errors
    /// Returns an error if the database connection fails.
    pub async fn new_with_timeout(database_url: &str, timeout_ms: Option<u64>) -> Result<Self> {
        let max_connections = resolve_pool_max_connections();
        let connect_timeout = Duration::from_millis(timeout_ms.unwrap_or(3_000));

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(connect_timeout)
            .connect(database_url)
            .await
            .map_err(|e| {
                SchedulerError::DatabaseError(format!("Failed to connect to database: {e}"))
            })?;

        info!(max_connections, "Connected to PostgreSQL scheduler database");
        Ok(Self { pool })
    }

    /// Create a new `SchedulerDb` with an existing pool (for testing).
    #[must_use]
    pub const fn new_with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// # Errors
    /// Returns an error if any schema statement fails.
    pub async fn initialize_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(self.pool())
            .await
            .map(|_result| ())
            .map_err(|e| SchedulerError::DatabaseError(format!("Failed to initialize schema: {e}")))
    }
}

fn resolve_pool_max_connections() -> u32 {
    resolve_pool_max_connections_from(|key| std::env::var(key).ok())
}

fn resolve_pool_max_connections_from<F>(env_lookup: F) -> u32
where
    F: Fn(&str) -> Option<String>,
{
    env_lookup("SCHEDULER_DB_MAX_CONNECTIONS")
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or_else(|| {
            let workers = env_lookup("SCHEDULER_RUNNER_WORKERS")
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(4);

            // one connection per runner plus headroom for the control loop
            8_u32.max(workers.saturating_mul(2))
        })
}
