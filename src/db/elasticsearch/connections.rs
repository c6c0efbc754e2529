use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;

use super::client::EsClient;
use crate::error::{AppError, AppResult};

/// Alias used by [`setup_es`] and [`shutdown_es`]
pub const DEFAULT_ALIAS: &str = "default";

/// Connection settings for the search service
///
/// Loaded from `ES_*` environment variables (see [`crate::config::Config`]) or built
/// with [`SearchSettings::new`] and the `with_*` setters.
#[derive(Clone, Deserialize)]
pub struct SearchSettings {
    /// Endpoint URL, or a comma-separated list of them
    pub host: String,
    pub username: String,
    pub password: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: f64,

    #[serde(default = "default_sniff_on_start")]
    pub sniff_on_start: bool,

    /// Sniff request timeout in seconds
    #[serde(default = "default_timeout")]
    pub sniff_timeout: f64,
}

fn default_timeout() -> f64 {
    3.0
}

fn default_sniff_on_start() -> bool {
    true
}

impl fmt::Debug for SearchSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchSettings")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"***")
            .field("timeout", &self.timeout)
            .field("sniff_on_start", &self.sniff_on_start)
            .field("sniff_timeout", &self.sniff_timeout)
            .finish()
    }
}

impl SearchSettings {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            password: password.into(),
            timeout: default_timeout(),
            sniff_on_start: default_sniff_on_start(),
            sniff_timeout: default_timeout(),
        }
    }

    pub fn with_timeout(mut self, timeout: f64) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_sniff_on_start(mut self, sniff_on_start: bool) -> Self {
        self.sniff_on_start = sniff_on_start;
        self
    }

    pub fn with_sniff_timeout(mut self, sniff_timeout: f64) -> Self {
        self.sniff_timeout = sniff_timeout;
        self
    }

    /// Parameters handed to the connection registry
    ///
    /// Certificate verification is always off and node-failure sniffing always on.
    pub fn connection_params(&self) -> ConnectionParams {
        ConnectionParams {
            hosts: self.host.clone(),
            verify_certs: false,
            request_timeout: self.timeout,
            sniff_on_start: self.sniff_on_start,
            sniff_timeout: self.sniff_timeout,
            sniff_on_node_failure: true,
            http_auth: (self.username.clone(), self.password.clone()),
        }
    }
}

/// Everything forwarded to a [`ConnectionFactory`]
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionParams {
    pub hosts: String,
    pub verify_certs: bool,
    /// Seconds
    pub request_timeout: f64,
    pub sniff_on_start: bool,
    /// Seconds
    pub sniff_timeout: f64,
    pub sniff_on_node_failure: bool,
    pub http_auth: (String, String),
}

/// A registered search connection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SearchConnection: Send + Sync + 'static {
    async fn close(&self) -> AppResult<()>;
}

/// Opens connections on behalf of a [`ConnectionRegistry`]
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    type Connection: SearchConnection;

    async fn connect(&self, params: ConnectionParams) -> AppResult<Self::Connection>;
}

/// Factory producing [`EsClient`] connections
#[derive(Debug, Clone, Copy, Default)]
pub struct EsConnectionFactory;

#[async_trait]
impl ConnectionFactory for EsConnectionFactory {
    type Connection = EsClient;

    async fn connect(&self, params: ConnectionParams) -> AppResult<EsClient> {
        EsClient::connect(&params).await
    }
}

/// Named search connections owned by the caller
///
/// Registering under an existing alias replaces the previous connection without
/// closing it.
pub struct ConnectionRegistry<F: ConnectionFactory = EsConnectionFactory> {
    factory: F,
    connections: RwLock<HashMap<String, Arc<F::Connection>>>,
}

impl ConnectionRegistry<EsConnectionFactory> {
    pub fn new() -> Self {
        Self::with_factory(EsConnectionFactory)
    }
}

impl Default for ConnectionRegistry<EsConnectionFactory> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ConnectionFactory> ConnectionRegistry<F> {
    pub fn with_factory(factory: F) -> Self {
        Self {
            factory,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Opens a connection and stores it under `alias`
    pub async fn create_connection(
        &self,
        alias: &str,
        params: ConnectionParams,
    ) -> AppResult<Arc<F::Connection>> {
        let connection = Arc::new(self.factory.connect(params).await?);

        let previous = self
            .connections
            .write()
            .await
            .insert(alias.to_string(), Arc::clone(&connection));
        if previous.is_some() {
            tracing::debug!(alias, "Replaced registered search connection");
        }

        Ok(connection)
    }

    pub async fn get_connection(&self, alias: &str) -> AppResult<Arc<F::Connection>> {
        self.connections
            .read()
            .await
            .get(alias)
            .cloned()
            .ok_or_else(|| AppError::ConnectionNotFound(alias.to_string()))
    }

    pub async fn remove_connection(&self, alias: &str) -> Option<Arc<F::Connection>> {
        self.connections.write().await.remove(alias)
    }

    pub async fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.connections.read().await.keys().cloned().collect();
        aliases.sort();
        aliases
    }
}

/// Registers the default search connection
pub async fn setup_es<F: ConnectionFactory>(
    registry: &ConnectionRegistry<F>,
    settings: &SearchSettings,
) -> AppResult<Arc<F::Connection>> {
    tracing::info!(
        host = %settings.host,
        timeout = settings.timeout,
        sniff_on_start = settings.sniff_on_start,
        sniff_timeout = settings.sniff_timeout,
        "Creating search connection"
    );

    registry
        .create_connection(DEFAULT_ALIAS, settings.connection_params())
        .await
}

/// Closes the default search connection
///
/// The connection stays registered; closing it twice is left to the connection.
pub async fn shutdown_es<F: ConnectionFactory>(
    registry: &ConnectionRegistry<F>,
) -> AppResult<()> {
    registry.get_connection(DEFAULT_ALIAS).await?.close().await?;
    tracing::info!("Search connection closed");
    Ok(())
}
