//! # querychain
//!
//! Core engine for chaining queries against heterogeneous storage
//! backends.
//!
//! A pipeline collects commands (selects, inserts, updates, raw
//! statements, callbacks, transaction control) and runs them strictly
//! in order, one at a time, against a single backend:
//! - PostgreSQL (SQL)
//! - MySQL (SQL)
//! - SQL Server (SQL)
//! - MongoDB (Document)
//!
//! ## Architecture
//!
//! The crate separates building a chain from running it:
//!
//! - **Pipeline**: Collects commands and owns the backend handle
//! - **ConditionBuilder**: Backend-neutral filters, ordering, paging
//!   and assignments attached to a command
//! - **DeferredValue**: Lazy argument resolved against earlier results
//!   when its command is rendered
//! - **Backend**: Trait adapters implement to execute rendered
//!   statements
//! - **BackendRegistry**: Shared factories and connected sources,
//!   keyed by backend type and source id
//!
//! Each named command writes at most one slot in the shared result map;
//! later commands read earlier slots through deferred values or the
//! pinned identity left behind by inserts.
//!
//! ## Example
//!
//! ```rust
//! use querychain::{BackendRegistry, ConnectionConfig};
//!
//! # async fn example() -> querychain::Result<()> {
//! // Create registry
//! let registry = BackendRegistry::new();
//!
//! // Create connection config
//! let config = ConnectionConfig::new("postgres")
//!     .with_host("localhost")
//!     .with_port(5432)
//!     .with_database("mydb");
//!
//! // Create backend (requires factory registration first)
//! // let backend = registry.create_source("main", config).await?;
//!
//! // Chain commands; each named command fills a result slot
//! // let mut chain = Pipeline::new(backend);
//! // chain.insert("user", "users").set("name", "Ada");
//! // let author = chain.expected("user", "identity");
//! // chain.select("posts", "posts").where_eq("author_id", author);
//! // let outcome = chain.exec().await;
//!
//! # let _ = (registry, config);
//! # Ok(())
//! # }
//! ```
//!
//! ## Backend Implementation
//!
//! To implement a new backend:
//!
//! 1. Create a struct that implements `Backend`
//! 2. Advertise optional behavior through `Capability`
//! 3. Create a `BackendFactory` implementation
//! 4. Register the factory with `BackendRegistry`
//!
//! Example backend crates:
//! - `querychain-postgres` - PostgreSQL implementation
//! - `querychain-mongodb` - MongoDB implementation

pub mod backend;
pub mod builder;
pub mod column;
pub mod command;
pub mod deferred;
pub mod dialect;
pub mod document;
pub mod error;
pub mod events;
pub mod executor;
pub mod pipeline;
pub mod registry;
pub mod serial;
pub mod value;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export commonly used items
pub use backend::{AdapterReply, Backend, Capability, QueryFormat, RenderedQuery};
pub use builder::{ConditionBuilder, IncOp, Op};
pub use command::Verdict;
pub use deferred::{DeferredContext, DeferredValue};
pub use dialect::{
    MySqlDialect, Paging, PostgresDialect, SqlDialect, SqlServerDialect, SqlShape, SqlStatement,
};
pub use document::{DocOp, DocumentStatement, FindOptions};
pub use error::{ChainError, ErrorReport, Result, StepError};
pub use events::PipelineEvent;
pub use executor::ExecOutcome;
pub use pipeline::Pipeline;
pub use registry::{BackendFactory, BackendRegistry, ConnectionConfig, QueryTemplates};
pub use value::{pin, Arg, ResultMap};
