//! PostgreSQL backend for querychain
//!
//! Implements the [`Backend`] trait on top of tokio-postgres. Rendered
//! statements arrive as SQL text; result rows come back as JSON objects
//! keyed by column name.

use std::sync::Arc;

use async_trait::async_trait;
use querychain::{
    AdapterReply, Backend, BackendFactory, Capability, ChainError, ConnectionConfig,
    PostgresDialect, QueryFormat, RenderedQuery, Result, SqlShape, SqlStatement,
};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error};

/// PostgreSQL backend implementation
pub struct PostgresBackend {
    client: Arc<RwLock<Client>>,
    dialect: PostgresDialect,
    database_name: String,
}

impl PostgresBackend {
    /// Connect to a PostgreSQL server
    pub async fn connect(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        database: &str,
    ) -> Result<Self> {
        let options = Self::connect_options(host, port, username, password, database);

        debug!(
            "Connecting to PostgreSQL: {}@{}:{}/{}",
            username, host, port, database
        );

        let (client, connection) = tokio_postgres::connect(&options, NoTls)
            .await
            .map_err(|e| {
                ChainError::connection_failed(format!("PostgreSQL connection failed: {}", e))
            })?;

        // Spawn connection handler
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        debug!(
            "Successfully connected to PostgreSQL database: {}",
            database
        );

        Ok(Self {
            client: Arc::new(RwLock::new(client)),
            dialect: PostgresDialect::new(),
            database_name: database.to_string(),
        })
    }

    /// Connect using a registry configuration
    pub async fn from_config(config: &ConnectionConfig) -> Result<Self> {
        let host = config.host.as_deref().unwrap_or("localhost");
        let port = config.port.unwrap_or(5432);
        let username = config.username.as_deref().unwrap_or("postgres");
        let password = config.password.as_deref().unwrap_or("");
        let database = config.database.as_deref().unwrap_or("postgres");
        Self::connect(host, port, username, password, database).await
    }

    /// Name of the connected database
    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    fn connect_options(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        database: &str,
    ) -> String {
        format!(
            "host={} port={} user={} password={} dbname={}",
            host, port, username, password, database
        )
    }

    /// Convert PostgreSQL row to a JSON object
    fn row_to_value(row: &Row) -> Value {
        let mut object = serde_json::Map::new();

        for (idx, column) in row.columns().iter().enumerate() {
            object.insert(column.name().to_string(), Self::extract_value(row, idx));
        }

        Value::Object(object)
    }

    /// Extract a single column as JSON. Values the driver cannot read
    /// degrade to null instead of failing the row.
    fn extract_value(row: &Row, idx: usize) -> Value {
        let column = &row.columns()[idx];
        let type_name = column.type_().name();

        match type_name {
            "bool" => row
                .try_get::<_, Option<bool>>(idx)
                .ok()
                .flatten()
                .map(Value::Bool)
                .unwrap_or(Value::Null),

            "int2" => row
                .try_get::<_, Option<i16>>(idx)
                .ok()
                .flatten()
                .map(|v| Value::Number(v.into()))
                .unwrap_or(Value::Null),

            "int4" => row
                .try_get::<_, Option<i32>>(idx)
                .ok()
                .flatten()
                .map(|v| Value::Number(v.into()))
                .unwrap_or(Value::Null),

            "int8" => row
                .try_get::<_, Option<i64>>(idx)
                .ok()
                .flatten()
                .map(|v| Value::Number(v.into()))
                .unwrap_or(Value::Null),

            "float4" => row
                .try_get::<_, Option<f32>>(idx)
                .ok()
                .flatten()
                .and_then(|v| serde_json::Number::from_f64(v as f64))
                .map(Value::Number)
                .unwrap_or(Value::Null),

            "float8" => row
                .try_get::<_, Option<f64>>(idx)
                .ok()
                .flatten()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),

            "varchar" | "text" | "char" | "bpchar" | "name" => row
                .try_get::<_, Option<String>>(idx)
                .ok()
                .flatten()
                .map(Value::String)
                .unwrap_or(Value::Null),

            "date" => row
                .try_get::<_, Option<chrono::NaiveDate>>(idx)
                .ok()
                .flatten()
                .map(|v| Value::String(v.to_string()))
                .unwrap_or(Value::Null),

            "timestamp" => row
                .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
                .ok()
                .flatten()
                .map(|v| Value::String(v.to_string()))
                .unwrap_or(Value::Null),

            "timestamptz" => row
                .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
                .ok()
                .flatten()
                .map(|v| Value::String(v.to_rfc3339()))
                .unwrap_or(Value::Null),

            "json" | "jsonb" => row
                .try_get::<_, Option<Value>>(idx)
                .ok()
                .flatten()
                .unwrap_or(Value::Null),

            "uuid" => row
                .try_get::<_, Option<uuid::Uuid>>(idx)
                .ok()
                .flatten()
                .map(|v| Value::String(v.to_string()))
                .unwrap_or(Value::Null),

            _ => {
                // Try to get as string for unknown types
                row.try_get::<_, Option<String>>(idx)
                    .ok()
                    .flatten()
                    .map(Value::String)
                    .unwrap_or(Value::Null)
            }
        }
    }

    /// Box raw-query bind parameters for the driver
    fn bind_params(params: &[Value]) -> Vec<Box<dyn ToSql + Sync + Send>> {
        params
            .iter()
            .map(|value| -> Box<dyn ToSql + Sync + Send> {
                match value {
                    Value::Null => Box::new(Option::<String>::None),
                    Value::Bool(b) => Box::new(*b),
                    Value::Number(n) => {
                        if let Some(i) = n.as_i64() {
                            Box::new(i)
                        } else {
                            Box::new(n.as_f64().unwrap_or(0.0))
                        }
                    }
                    Value::String(s) => Box::new(s.clone()),
                    // Arrays and objects bind as json/jsonb
                    other => Box::new(other.clone()),
                }
            })
            .collect()
    }

    /// Build a backend error carrying the server's details when present
    fn query_error(e: tokio_postgres::Error, sql: &str) -> ChainError {
        error!("PostgreSQL query failed: {}", e);
        error!("Failed SQL: {}", sql);

        let message = if let Some(db_error) = e.as_db_error() {
            let mut msg = db_error.message().to_string();

            if let Some(detail) = db_error.detail() {
                msg.push_str(&format!("; detail: {}", detail));
            }

            if let Some(hint) = db_error.hint() {
                msg.push_str(&format!("; hint: {}", hint));
            }

            if let Some(position) = db_error.position() {
                msg.push_str(&format!("; position: {:?}", position));
            }

            if let Some(column) = db_error.column() {
                msg.push_str(&format!("; column: {}", column));
            }

            msg
        } else {
            e.to_string()
        };

        ChainError::backend(message)
    }

    async fn run_statement(client: &Client, statement: &SqlStatement) -> Result<AdapterReply> {
        let text = statement.text.as_str();
        let boxed = Self::bind_params(&statement.params);
        let params: Vec<&(dyn ToSql + Sync)> = boxed
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        debug!("Executing: {}", text);

        match statement.shape {
            SqlShape::Rows => {
                let rows = client
                    .query(text, &params)
                    .await
                    .map_err(|e| Self::query_error(e, text))?;
                Ok(AdapterReply::Rows(
                    rows.iter().map(Self::row_to_value).collect(),
                ))
            }
            SqlShape::Affected => {
                let affected = client
                    .execute(text, &params)
                    .await
                    .map_err(|e| Self::query_error(e, text))?;
                Ok(AdapterReply::Affected(affected))
            }
            SqlShape::Inserted => {
                // RETURNING yields at most one row holding the identity
                let rows = client
                    .query(text, &params)
                    .await
                    .map_err(|e| Self::query_error(e, text))?;
                let identity = rows.first().map(|row| Self::extract_value(row, 0));
                Ok(AdapterReply::Inserted(identity))
            }
        }
    }
}

#[async_trait]
impl Backend for PostgresBackend {
    fn backend_type(&self) -> &'static str {
        "postgres"
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![
            Capability::Transactions,
            Capability::RawSql,
            Capability::Aggregation,
        ]
    }

    fn format(&self) -> QueryFormat<'_> {
        QueryFormat::Sql(&self.dialect)
    }

    async fn execute(&self, query: RenderedQuery) -> Result<AdapterReply> {
        let statement = match query {
            RenderedQuery::Sql(statement) => statement,
            RenderedQuery::Document(_) => {
                return Err(ChainError::unsupported("postgres", "document statements"))
            }
        };

        let client = self.client.read().await;
        Self::run_statement(&client, &statement).await
    }

    async fn begin(&self) -> Result<()> {
        let client = self.client.read().await;
        client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| Self::query_error(e, "BEGIN"))
    }

    async fn commit(&self) -> Result<()> {
        let client = self.client.read().await;
        client
            .batch_execute("COMMIT")
            .await
            .map_err(|e| Self::query_error(e, "COMMIT"))
    }

    async fn rollback(&self) -> Result<()> {
        let client = self.client.read().await;
        client
            .batch_execute("ROLLBACK")
            .await
            .map_err(|e| Self::query_error(e, "ROLLBACK"))
    }

    async fn close(&self) -> Result<()> {
        debug!("Closing PostgreSQL connection");
        // Connection cleanup handled by Drop
        Ok(())
    }
}

/// Factory for registering PostgreSQL with a
/// [`BackendRegistry`](querychain::BackendRegistry)
pub struct PostgresFactory;

#[async_trait]
impl BackendFactory for PostgresFactory {
    fn backend_type(&self) -> &'static str {
        "postgres"
    }

    async fn create(&self, config: &ConnectionConfig) -> Result<Arc<dyn Backend>> {
        let backend = PostgresBackend::from_config(config).await?;
        Ok(Arc::new(backend))
    }
}
