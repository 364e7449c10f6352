//! Run progress events.
//!
//! A pipeline broadcasts its progress over a [`tokio::sync::broadcast`]
//! channel. Subscribers that fall behind lose the oldest events;
//! execution never blocks on listeners.

use serde_json::Value;

use crate::error::ErrorReport;
use crate::value::ResultMap;

pub use tokio::sync::broadcast::{error::RecvError, Receiver, Sender};

/// Number of events buffered per subscriber before lag kicks in.
pub(crate) const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub enum PipelineEvent {
    /// A data command is about to hit the backend.
    Query {
        name: String,
        query: String,
        params: Vec<Value>,
    },
    /// A data command stored its result.
    Data {
        name: String,
        results: ResultMap,
    },
    /// The run finished.
    End {
        errors: ErrorReport,
        results: ResultMap,
        elapsed_ms: u64,
    },
}
