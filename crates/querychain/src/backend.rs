//! The backend adapter contract.
//!
//! Storage engines plug into the pipeline by implementing [`Backend`].
//! The engine never sees connection handles or driver types; it renders
//! statements through the backend's [`QueryFormat`], hands them to
//! [`Backend::execute`] and folds the [`AdapterReply`] into the result
//! map. Capabilities advertise optional behavior so pipelines can
//! reject unsupported operations while they are being built instead of
//! at run time.

use async_trait::async_trait;
use downcast_rs::{impl_downcast, DowncastSync};
use serde_json::Value;

use crate::dialect::{SqlDialect, SqlStatement};
use crate::document::DocumentStatement;
use crate::error::Result;

/// Optional behavior a backend may advertise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    /// begin / commit / rollback are real operations.
    Transactions,
    /// Raw SQL text can be executed.
    RawSql,
    /// Averaging aggregates are available.
    Aggregation,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Transactions => write!(f, "transactions"),
            Capability::RawSql => write!(f, "raw sql"),
            Capability::Aggregation => write!(f, "aggregation"),
        }
    }
}

/// Statement language the engine should render for a backend.
pub enum QueryFormat<'a> {
    Sql(&'a dyn SqlDialect),
    Document,
}

/// A statement ready for an adapter.
#[derive(Clone, Debug)]
pub enum RenderedQuery {
    Sql(SqlStatement),
    Document(DocumentStatement),
}

impl RenderedQuery {
    /// Human-readable form for events and logs.
    pub fn display_text(&self) -> String {
        match self {
            RenderedQuery::Sql(st) => st.text.clone(),
            RenderedQuery::Document(st) => {
                let mut doc = serde_json::json!({
                    "op": format!("{:?}", st.op),
                    "collection": st.target,
                    "filter": st.filter,
                });
                if let Some(update) = &st.update {
                    if let Some(map) = doc.as_object_mut() {
                        map.insert("update".to_string(), update.clone());
                    }
                }
                doc.to_string()
            }
        }
    }

    /// Bind parameters carried by the statement, if any.
    pub fn params(&self) -> Vec<Value> {
        match self {
            RenderedQuery::Sql(st) => st.params.clone(),
            RenderedQuery::Document(_) => Vec::new(),
        }
    }
}

/// What came back from an adapter call.
#[derive(Clone, Debug)]
pub enum AdapterReply {
    /// All matching rows as JSON objects.
    Rows(Vec<Value>),
    /// At most one row.
    Row(Option<Value>),
    /// A server-side count.
    Count(u64),
    /// Rows changed by a write.
    Affected(u64),
    /// Identity generated by an insert, when the backend reports one.
    Inserted(Option<Value>),
    /// The statement completed without producing a value.
    Nothing,
}

/// A connected storage engine.
///
/// Implementations are shared behind `Arc<dyn Backend>`; every method
/// takes `&self`.
#[async_trait]
pub trait Backend: DowncastSync {
    /// Stable identifier such as `postgres` or `mongodb`.
    fn backend_type(&self) -> &'static str;

    fn capabilities(&self) -> Vec<Capability>;

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Statement language this backend consumes.
    fn format(&self) -> QueryFormat<'_>;

    async fn execute(&self, query: RenderedQuery) -> Result<AdapterReply>;

    async fn begin(&self) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

impl_downcast!(sync Backend);

impl std::fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("type", &self.backend_type())
            .finish()
    }
}
