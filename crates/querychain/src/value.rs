//! Value arguments accepted by condition builders.
//!
//! Builder methods take [`Arg`] so call sites can mix literals, the
//! pinned identity of the last insert, and deferred lookups against
//! earlier results without separate method variants.

use std::collections::HashMap;

use serde_json::Value;

use crate::deferred::{DeferredContext, DeferredValue};

/// Shared result bag for a pipeline run, keyed by command name.
pub type ResultMap = HashMap<String, Value>;

/// A value passed to a condition builder.
///
/// Resolution happens when the owning command is rendered, not when the
/// builder method is called, so deferred and pinned arguments observe
/// the results of every command that ran before them.
#[derive(Clone, Debug)]
pub enum Arg {
    /// A plain JSON literal.
    Value(Value),
    /// The pinned identity of the most recent insert (or an explicit put).
    Pin,
    /// A lookup computed against the result map at render time.
    Deferred(DeferredValue),
}

impl Arg {
    pub fn is_pin(&self) -> bool {
        matches!(self, Arg::Pin)
    }

    /// Resolve to a concrete JSON value against the current run state.
    pub(crate) fn resolve(&self, ctx: &DeferredContext<'_>) -> Value {
        match self {
            Arg::Value(v) => v.clone(),
            Arg::Pin => ctx.pin().cloned().unwrap_or(Value::Null),
            Arg::Deferred(d) => d.resolve(ctx),
        }
    }
}

/// Shorthand for [`Arg::Pin`].
pub fn pin() -> Arg {
    Arg::Pin
}

/// Negate a numeric JSON value, passing anything else through.
pub(crate) fn negate_number(value: Value) -> Value {
    match &value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(-i)
            } else if let Some(f) = n.as_f64() {
                Value::from(-f)
            } else {
                value
            }
        }
        _ => value,
    }
}

pub(crate) fn is_zero_number(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.as_f64() == Some(0.0),
        _ => false,
    }
}

impl From<Value> for Arg {
    fn from(v: Value) -> Self {
        Arg::Value(v)
    }
}

impl From<DeferredValue> for Arg {
    fn from(d: DeferredValue) -> Self {
        Arg::Deferred(d)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Value(Value::String(v.to_string()))
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Value(Value::String(v))
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Value(Value::Bool(v))
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::Value(Value::from(v))
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Value(Value::from(v))
    }
}

impl From<u32> for Arg {
    fn from(v: u32) -> Self {
        Arg::Value(Value::from(v))
    }
}

impl From<u64> for Arg {
    fn from(v: u64) -> Self {
        Arg::Value(Value::from(v))
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Value(Value::from(v))
    }
}
