//! Backend factories, connected sources, and named query templates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::error::{ChainError, Result};

/// Poll interval for [`BackendRegistry::wait_for_source`].
const WAIT_INTERVAL: Duration = Duration::from_millis(100);
/// Polls before waiting gives up.
const WAIT_ATTEMPTS: u32 = 60;

/// Connection settings handed to a [`BackendFactory`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Backend type identifier (postgres, mongodb, ...).
    pub backend: String,
    /// Host or connection endpoint.
    pub host: Option<String>,
    /// Port number.
    pub port: Option<u16>,
    /// Username or access key.
    pub username: Option<String>,
    /// Password or secret key.
    pub password: Option<String>,
    /// Database name.
    pub database: Option<String>,
    /// Additional driver options as key-value pairs.
    pub options: HashMap<String, String>,
}

impl ConnectionConfig {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            host: None,
            port: None,
            username: None,
            password: None,
            database: None,
            options: HashMap::new(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Connection string for display purposes, without the password.
    pub fn connection_string(&self) -> String {
        let mut out = format!("{}://", self.backend);

        if let Some(username) = &self.username {
            out.push_str(username);
            out.push('@');
        }

        if let Some(host) = &self.host {
            out.push_str(host);

            if let Some(port) = self.port {
                out.push(':');
                out.push_str(&port.to_string());
            }
        }

        if let Some(database) = &self.database {
            out.push('/');
            out.push_str(database);
        }

        out
    }
}

/// Factory trait for connecting backends from configurations.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// Backend type this factory handles.
    fn backend_type(&self) -> &'static str;

    /// Connect a backend from the configuration.
    async fn create(&self, config: &ConnectionConfig) -> Result<Arc<dyn Backend>>;
}

/// Registry of backend factories and connected sources.
///
/// Factories are keyed by backend type, sources by caller-chosen ids.
/// Shared behind `Arc` between the code that opens connections and the
/// code that builds pipelines.
pub struct BackendRegistry {
    factories: Arc<RwLock<HashMap<String, Arc<dyn BackendFactory>>>>,
    sources: Arc<RwLock<HashMap<String, Arc<dyn Backend>>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: Arc::new(RwLock::new(HashMap::new())),
            sources: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a factory under its backend type.
    pub async fn register_factory(&self, factory: Arc<dyn BackendFactory>) {
        let backend = factory.backend_type();
        let mut factories = self.factories.write().await;

        if factories.contains_key(backend) {
            warn!("overwriting existing factory for backend: {}", backend);
        }

        factories.insert(backend.to_string(), factory);
        debug!("registered factory for backend: {}", backend);
    }

    /// Connect a new source and cache it under `source_id`.
    pub async fn create_source(
        &self,
        source_id: &str,
        config: ConnectionConfig,
    ) -> Result<Arc<dyn Backend>> {
        let factories = self.factories.read().await;

        let factory = factories
            .get(&config.backend)
            .ok_or_else(|| {
                ChainError::connection_failed(format!(
                    "no factory registered for backend '{}'",
                    config.backend
                ))
            })?
            .clone();

        drop(factories);

        debug!(
            "creating source {} via {}",
            source_id,
            config.connection_string()
        );

        let source = factory.create(&config).await?;

        let mut sources = self.sources.write().await;
        if sources.contains_key(source_id) {
            warn!("overwriting existing source: {}", source_id);
        }
        sources.insert(source_id.to_string(), source.clone());

        Ok(source)
    }

    /// Cache an already connected backend under `source_id`.
    pub async fn register_source(&self, source_id: &str, source: Arc<dyn Backend>) {
        let mut sources = self.sources.write().await;

        if sources.contains_key(source_id) {
            warn!("overwriting existing source: {}", source_id);
        }

        sources.insert(source_id.to_string(), source);
    }

    /// Look up a cached source.
    pub async fn get(&self, source_id: &str) -> Option<Arc<dyn Backend>> {
        let sources = self.sources.read().await;
        sources.get(source_id).cloned()
    }

    /// Wait for a source another task is still connecting.
    ///
    /// Polls every 100ms, giving up after a minute with
    /// [`ChainError::ConnectionTimeout`].
    pub async fn wait_for_source(&self, source_id: &str) -> Result<Arc<dyn Backend>> {
        let mut attempts = 0;
        loop {
            if let Some(source) = self.get(source_id).await {
                return Ok(source);
            }
            attempts += 1;
            if attempts >= WAIT_ATTEMPTS {
                return Err(ChainError::ConnectionTimeout {
                    source_id: source_id.to_string(),
                    attempts,
                });
            }
            tokio::time::sleep(WAIT_INTERVAL).await;
        }
    }

    /// Remove a cached source, closing its connection.
    pub async fn remove(&self, source_id: &str) -> Result<()> {
        let mut sources = self.sources.write().await;

        if let Some(source) = sources.remove(source_id) {
            debug!("closing source: {}", source_id);
            source.close().await?;
        }

        Ok(())
    }

    /// Ids of every cached source.
    pub async fn list(&self) -> Vec<String> {
        let sources = self.sources.read().await;
        sources.keys().cloned().collect()
    }

    /// Close and drop every cached source.
    pub async fn clear(&self) {
        let mut sources = self.sources.write().await;

        for (_, source) in sources.drain() {
            let _ = source.close().await;
        }
    }

    /// Backend types with a registered factory.
    pub async fn list_backends(&self) -> Vec<String> {
        let factories = self.factories.read().await;
        factories.keys().cloned().collect()
    }

    /// True when a factory is registered for the backend type.
    pub async fn has_backend(&self, backend: &str) -> bool {
        let factories = self.factories.read().await;
        factories.contains_key(backend)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Named SQL templates shared between pipelines.
///
/// Registered once at startup and pulled by key through
/// [`Pipeline::named_query`](crate::Pipeline::named_query). Reads far
/// outnumber writes, so entries sit behind a plain `std` lock usable
/// from synchronous builder code.
pub struct QueryTemplates {
    entries: std::sync::RwLock<HashMap<String, String>>,
}

impl QueryTemplates {
    pub fn new() -> Self {
        Self {
            entries: std::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Register a template under a key. Later registrations win.
    pub fn register(&self, key: impl Into<String>, sql: impl Into<String>) {
        let key = key.into();
        if let Ok(mut entries) = self.entries.write() {
            if entries.contains_key(&key) {
                warn!("overwriting existing query template: {}", key);
            }
            entries.insert(key, sql.into());
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.read().ok().and_then(|e| e.get(key).cloned())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .read()
            .map(|e| e.contains_key(key))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for QueryTemplates {
    fn default() -> Self {
        Self::new()
    }
}
