//! PostgreSQL connection manager
//! Owns the shared `PgPool`, applies the schema idempotently and exposes a
//! lightweight health check.

use crate::config::DatabaseConfig;
use crate::error_handling::{ErrorContext, InsightResult, RetryPolicy};

use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Table definitions, applied at startup
pub const SCHEMA_SQL: &str = include_str!("storage/schema.sql");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// A probe slower than this is reported as degraded
    pub const SLOW_PROBE: Duration = Duration::from_millis(500);

    pub fn classify(succeeded: bool, latency: Duration) -> Self {
        match (succeeded, latency < Self::SLOW_PROBE) {
            (false, _) => HealthStatus::Unhealthy,
            (true, true) => HealthStatus::Healthy,
            (true, false) => HealthStatus::Degraded,
        }
    }
}

/// Snapshot of pool usage and the last health probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub size: u32,
    pub idle: usize,
    pub health_status: HealthStatus,
    pub probe_latency_ms: u64,
}

pub struct DatabaseManager {
    pool: PgPool,
}

impl DatabaseManager {
    /// Connect with retry; failure here is fatal for the process
    pub async fn connect(config: &DatabaseConfig) -> InsightResult<Self> {
        let retry_policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 8000,
            backoff_multiplier: 2.0,
        };

        let pool = retry_policy
            .execute(|| async move {
                PgPoolOptions::new()
                    .min_connections(config.min_connections)
                    .max_connections(config.max_connections)
                    .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
                    .connect(&config.url)
                    .await
                    .with_database_context(|| "Failed to connect to PostgreSQL".to_string())
            })
            .await
            .map_err(|e| {
                error!(error = %e, "Database unavailable after retries");
                e
            })?;

        info!(
            min_connections = config.min_connections,
            max_connections = config.max_connections,
            "Connected to PostgreSQL"
        );

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist
    pub async fn init_schema(&self) -> InsightResult<()> {
        self.pool
            .execute(SCHEMA_SQL)
            .await
            .with_database_context(|| "Failed to apply schema".to_string())?;
        info!("Schema applied");
        Ok(())
    }

    pub async fn health_check(&self) -> ConnectionStats {
        let started = Instant::now();
        let probe: Result<i32, sqlx::Error> = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await;
        let latency = started.elapsed();

        if let Err(e) = &probe {
            error!(error = %e, "Database health probe failed");
        }
        let health_status = HealthStatus::classify(probe.is_ok(), latency);

        ConnectionStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            health_status,
            probe_latency_ms: latency.as_millis() as u64,
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }
}
