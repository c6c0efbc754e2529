use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    ConnectOptions, PgPool,
};

use crate::error::AppResult;

/// Dialect+driver scheme of the database connection URL
pub const DRIVER_SCHEME: &str = "postgresql+asyncpg";

/// Connection cap used when the pool settings ask for no limit
///
/// sqlx preallocates its idle queue to `max_connections`, so "unbounded" is a
/// ceiling far above any server's `max_connections` rather than `u32::MAX`.
pub const UNBOUNDED_MAX_CONNECTIONS: u32 = 10_000;

/// Connection settings for the PostgreSQL engine
///
/// Loaded from `DB_*` environment variables (see [`crate::config::Config`]) or built
/// with [`DbSettings::new`] and the `with_*` setters.
#[derive(Clone, Deserialize)]
pub struct DbSettings {
    pub username: String,
    pub password: String,
    pub host: String,
    pub database: String,

    /// Log every SQL statement at INFO
    #[serde(default)]
    pub echo: bool,

    /// Connections kept by the pool; 0 removes the size limit
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connections allowed above `pool_size`; negative means unlimited
    #[serde(default = "default_max_overflow")]
    pub max_overflow: i32,

    /// Seconds to wait for a free connection
    #[serde(default = "default_pool_timeout")]
    pub pool_timeout: u64,

    /// Seconds before a connection is recycled; negative disables recycling
    #[serde(default = "default_pool_recycle")]
    pub pool_recycle: i64,

    /// Additional options forwarded verbatim to the engine initializer
    #[serde(skip)]
    pub extra_options: BTreeMap<String, String>,
}

fn default_pool_size() -> u32 {
    5
}

fn default_max_overflow() -> i32 {
    10
}

fn default_pool_timeout() -> u64 {
    30
}

fn default_pool_recycle() -> i64 {
    3600
}

impl fmt::Debug for DbSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbSettings")
            .field("username", &self.username)
            .field("password", &"***")
            .field("host", &self.host)
            .field("database", &self.database)
            .field("echo", &self.echo)
            .field("pool_size", &self.pool_size)
            .field("max_overflow", &self.max_overflow)
            .field("pool_timeout", &self.pool_timeout)
            .field("pool_recycle", &self.pool_recycle)
            .field("extra_options", &self.extra_options)
            .finish()
    }
}

impl DbSettings {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        host: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            host: host.into(),
            database: database.into(),
            echo: false,
            pool_size: default_pool_size(),
            max_overflow: default_max_overflow(),
            pool_timeout: default_pool_timeout(),
            pool_recycle: default_pool_recycle(),
            extra_options: BTreeMap::new(),
        }
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_max_overflow(mut self, max_overflow: i32) -> Self {
        self.max_overflow = max_overflow;
        self
    }

    pub fn with_pool_timeout(mut self, pool_timeout: u64) -> Self {
        self.pool_timeout = pool_timeout;
        self
    }

    pub fn with_pool_recycle(mut self, pool_recycle: i64) -> Self {
        self.pool_recycle = pool_recycle;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_options.insert(key.into(), value.into());
        self
    }

    /// Connection URL handed to the engine initializer
    ///
    /// Values are substituted as-is; no escaping or validation happens here.
    pub fn connection_url(&self) -> String {
        format!(
            "{}://{}:{}@{}/{}",
            DRIVER_SCHEME, self.username, self.password, self.host, self.database
        )
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            url: self.connection_url(),
            echo: self.echo,
            pool_size: self.pool_size,
            max_overflow: self.max_overflow,
            pool_timeout: self.pool_timeout,
            pool_recycle: self.pool_recycle,
            extra_options: self.extra_options.clone(),
        }
    }
}

/// Everything forwarded to an [`EngineInitializer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub url: String,
    pub echo: bool,
    pub pool_size: u32,
    pub max_overflow: i32,
    pub pool_timeout: u64,
    pub pool_recycle: i64,
    pub extra_options: BTreeMap<String, String>,
}

/// Builds a database engine from forwarded settings
#[async_trait]
pub trait EngineInitializer: Send + Sync {
    type Engine: EngineHandle;

    async fn init_engine(&self, config: EngineConfig) -> AppResult<Self::Engine>;
}

/// A running engine that can be closed
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EngineHandle: Send + Sync {
    async fn close(&self);
}

#[async_trait]
impl EngineHandle for PgPool {
    async fn close(&self) {
        sqlx::Pool::close(self).await
    }
}

/// sqlx-backed engine initializer producing a [`PgPool`]
#[derive(Debug, Clone, Copy, Default)]
pub struct PgEngine;

impl PgEngine {
    /// Strips the `+driver` part of a dialect+driver scheme so sqlx can parse the URL
    pub fn sqlx_url(url: &str) -> String {
        match url.split_once("://") {
            Some((scheme, rest)) => {
                let dialect = scheme.split('+').next().unwrap_or(scheme);
                format!("{}://{}", dialect, rest)
            }
            None => url.to_string(),
        }
    }

    pub fn connect_options(config: &EngineConfig) -> AppResult<PgConnectOptions> {
        let mut options = PgConnectOptions::from_str(&Self::sqlx_url(&config.url))?;

        if !config.extra_options.is_empty() {
            options = options.options(config.extra_options.iter());
        }

        let options = if config.echo {
            options.log_statements(log::LevelFilter::Info)
        } else {
            options.disable_statement_logging()
        };

        Ok(options)
    }

    /// Upper bound on open connections
    ///
    /// A zero `pool_size` or a negative `max_overflow` leaves the pool unbounded.
    pub fn max_connections(config: &EngineConfig) -> u32 {
        match u32::try_from(config.max_overflow) {
            Ok(overflow) if config.pool_size > 0 => config
                .pool_size
                .saturating_add(overflow)
                .min(UNBOUNDED_MAX_CONNECTIONS),
            _ => UNBOUNDED_MAX_CONNECTIONS,
        }
    }

    pub fn pool_options(config: &EngineConfig) -> PgPoolOptions {
        let max_lifetime = u64::try_from(config.pool_recycle)
            .ok()
            .map(Duration::from_secs);

        PgPoolOptions::new()
            .max_connections(Self::max_connections(config))
            .acquire_timeout(Duration::from_secs(config.pool_timeout))
            .max_lifetime(max_lifetime)
    }
}

#[async_trait]
impl EngineInitializer for PgEngine {
    type Engine = PgPool;

    async fn init_engine(&self, config: EngineConfig) -> AppResult<PgPool> {
        let connect_options = Self::connect_options(&config)?;
        let pool = Self::pool_options(&config)
            .connect_with(connect_options)
            .await?;

        Ok(pool)
    }
}

/// Creates the PostgreSQL connection pool
///
/// Returns once the pool has opened its first connection. Bad credentials and
/// unreachable hosts surface as [`crate::error::AppError::Database`].
pub async fn setup_db(settings: &DbSettings) -> AppResult<PgPool> {
    setup_db_with(&PgEngine, settings).await
}

/// Builds the connection URL and forwards it, with the pool settings, to `initializer`
pub async fn setup_db_with<I>(initializer: &I, settings: &DbSettings) -> AppResult<I::Engine>
where
    I: EngineInitializer + ?Sized,
{
    tracing::info!(
        host = %settings.host,
        database = %settings.database,
        pool_size = settings.pool_size,
        max_overflow = settings.max_overflow,
        pool_timeout = settings.pool_timeout,
        pool_recycle = settings.pool_recycle,
        echo = settings.echo,
        "Initializing database engine"
    );

    let engine = initializer.init_engine(settings.engine_config()).await?;

    tracing::info!(database = %settings.database, "Database engine ready");
    Ok(engine)
}

/// Closes the engine returned by [`setup_db`] or [`setup_db_with`]
pub async fn shutdown_db<E>(engine: &E)
where
    E: EngineHandle + ?Sized,
{
    engine.close().await;
    tracing::info!("Database engine closed");
}
