// src/utils/db_connect.rs

use anyhow::{Context, Result};
use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use log::{debug, info};
use std::env;
use std::time::Duration;
use tokio_postgres::{Config, NoTls};

pub type PgPool = Pool<PostgresConnectionManager<NoTls>>;

const DEFAULT_POOL_SIZE: u32 = 8;

/// Connection settings read from `POSTGRES_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgSettings {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: Option<String>,
    pub pool_size: u32,
}

impl PgSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from any key lookup; missing or unparsable values fall
    /// back to local defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            host: get("POSTGRES_HOST").unwrap_or_else(|| "localhost".to_string()),
            port: get("POSTGRES_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432),
            dbname: get("POSTGRES_DB").unwrap_or_else(|| "postgres".to_string()),
            user: get("POSTGRES_USER").unwrap_or_else(|| "postgres".to_string()),
            password: get("POSTGRES_PASSWORD").filter(|p| !p.is_empty()),
            pool_size: get("POSTGRES_POOL_SIZE")
                .and_then(|p| p.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_POOL_SIZE),
        }
    }

    fn to_pg_config(&self) -> Config {
        let mut config = Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.dbname)
            .user(&self.user)
            .application_name("pgdedupe")
            .connect_timeout(Duration::from_secs(10));
        if let Some(password) = &self.password {
            config.password(password);
        }
        config
    }
}

pub async fn connect() -> Result<PgPool> {
    connect_with(&PgSettings::from_env()).await
}

pub async fn connect_with(settings: &PgSettings) -> Result<PgPool> {
    info!(
        "Connecting to PostgreSQL at {}:{}/{} as {}",
        settings.host, settings.port, settings.dbname, settings.user
    );
    let manager = PostgresConnectionManager::new(settings.to_pg_config(), NoTls);
    let pool = Pool::builder()
        .max_size(settings.pool_size)
        .connection_timeout(Duration::from_secs(30))
        .build(manager)
        .await
        .context("Failed to build connection pool")?;

    {
        let conn = pool.get().await.context("Failed to get test connection")?;
        conn.query_one("SELECT 1", &[])
            .await
            .context("Test query failed")?;
    }
    debug!("Connection pool ready (max size {})", settings.pool_size);
    Ok(pool)
}

/// `(connections, idle, in_use)` for progress messages.
pub fn get_pool_status(pool: &PgPool) -> (usize, usize, usize) {
    let state = pool.state();
    let total = state.connections as usize;
    let idle = state.idle_connections as usize;
    (total, idle, total.saturating_sub(idle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_settings_defaults() {
        let settings = PgSettings::from_lookup(|_| None);
        assert_eq!(settings.host, "localhost");
        assert_eq!(settings.port, 5432);
        assert_eq!(settings.password, None);
        assert_eq!(settings.pool_size, DEFAULT_POOL_SIZE);
    }

    #[test]
    fn test_settings_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("POSTGRES_HOST", "db.internal"),
            ("POSTGRES_PORT", "6543"),
            ("POSTGRES_DB", "people"),
            ("POSTGRES_USER", "dedupe"),
            ("POSTGRES_PASSWORD", "secret"),
            ("POSTGRES_POOL_SIZE", "not-a-number"),
        ]);
        let settings = PgSettings::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(settings.host, "db.internal");
        assert_eq!(settings.port, 6543);
        assert_eq!(settings.dbname, "people");
        assert_eq!(settings.password.as_deref(), Some("secret"));
        assert_eq!(settings.pool_size, DEFAULT_POOL_SIZE);
    }
}
