//! Connection pool configuration.

use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use stevedore_core::{ConfigError, StevedoreResult};
use tokio_postgres::NoTls;

/// PostgreSQL connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// How long to wait for a pooled connection
    pub timeout: Duration,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "stevedore".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            max_size: 16,
            timeout: Duration::from_secs(30),
        }
    }
}

impl PgConfig {
    /// Reads `STEVEDORE_DB_*` environment variables, falling back to the
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("STEVEDORE_DB_HOST").unwrap_or(defaults.host),
            port: std::env::var("STEVEDORE_DB_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            dbname: std::env::var("STEVEDORE_DB_NAME").unwrap_or(defaults.dbname),
            user: std::env::var("STEVEDORE_DB_USER").unwrap_or(defaults.user),
            password: std::env::var("STEVEDORE_DB_PASSWORD").unwrap_or_default(),
            max_size: std::env::var("STEVEDORE_DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_size),
            timeout: std::env::var("STEVEDORE_DB_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_dbname(mut self, dbname: impl Into<String>) -> Self {
        self.dbname = dbname.into();
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `host:port/dbname`, used to label connection failures.
    pub fn target(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.dbname)
    }

    pub fn validate(&self) -> StevedoreResult<()> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "host".to_string(),
            }
            .into());
        }
        if self.dbname.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "dbname".to_string(),
            }
            .into());
        }
        if self.max_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_size".to_string(),
                value: "0".to_string(),
                reason: "pool needs at least one connection".to_string(),
            }
            .into());
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "timeout".to_string(),
                value: format!("{:?}", self.timeout),
                reason: "timeout must be positive".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// deadpool configuration equivalent to this one.
    pub fn pool_config(&self) -> Config {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool = PoolConfig::new(self.max_size);
        pool.timeouts.wait = Some(self.timeout);
        pool.timeouts.create = Some(self.timeout);
        cfg.pool = Some(pool);
        cfg
    }

    /// Creates a connection pool. Connections are established lazily.
    pub fn create_pool(&self) -> StevedoreResult<Pool> {
        self.validate()?;
        self.pool_config()
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| {
                ConfigError::InvalidValue {
                    field: "pool".to_string(),
                    value: self.target(),
                    reason: format!("Failed to create pool: {}", e),
                }
                .into()
            })
    }
}
