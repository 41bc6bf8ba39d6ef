//! Postgres pool and schema migrations

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;
use wacast_common::config::DatabaseConfig;
use wacast_common::{Error, Result};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared Postgres connection pool
#[derive(Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    /// Open a pool against `database.url`
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = config.url.as_deref().ok_or_else(|| {
            Error::Config("database.url is required for the postgres backend".to_string())
        })?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(url)
            .await
            .map_err(|e| Error::Database(format!("Cannot connect to postgres: {}", e)))?;

        info!(max_connections = config.max_connections, "Postgres pool ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations from `migrations/`
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Migration failed: {}", e)))?;
        info!("Schema up to date");
        Ok(())
    }

    /// Round-trip a trivial query
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| Error::Database(format!("Ping failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_requires_url() {
        let config = DatabaseConfig {
            url: None,
            ..DatabaseConfig::default()
        };
        match DatabasePool::connect(&config).await {
            Err(Error::Config(message)) => assert!(message.contains("database.url")),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("connected without a url"),
        }
    }
}
