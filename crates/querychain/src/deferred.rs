//! Deferred value resolution.
//!
//! A [`DeferredValue`] wraps a producer closure that is invoked when the
//! command holding it is rendered. Producers read the shared result map
//! and the pinned identity; they must not mutate anything. Each
//! materialization of a query invokes the producer exactly once.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::value::ResultMap;

/// Read-only view of run state handed to deferred producers.
pub struct DeferredContext<'a> {
    results: &'a ResultMap,
    pin: Option<&'a Value>,
}

impl<'a> DeferredContext<'a> {
    pub fn new(results: &'a ResultMap, pin: Option<&'a Value>) -> Self {
        Self { results, pin }
    }

    pub fn results(&self) -> &ResultMap {
        self.results
    }

    /// Identity of the most recent insert, or of an explicit put.
    pub fn pin(&self) -> Option<&Value> {
        self.pin
    }

    /// Stored result for a named command, if the command has run.
    pub fn slot(&self, name: &str) -> Option<&Value> {
        self.results.get(name)
    }
}

type Producer = dyn Fn(&DeferredContext<'_>) -> Value + Send + Sync;

/// A value computed against run state at render time.
#[derive(Clone)]
pub struct DeferredValue {
    producer: Arc<Producer>,
}

impl DeferredValue {
    /// Wrap an arbitrary producer closure.
    pub fn new(producer: impl Fn(&DeferredContext<'_>) -> Value + Send + Sync + 'static) -> Self {
        Self {
            producer: Arc::new(producer),
        }
    }

    /// The whole result slot of a named command.
    pub fn slot(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(move |ctx| ctx.slot(&name).cloned().unwrap_or(Value::Null))
    }

    /// A field of an object result slot. Resolves to null when the slot
    /// is absent or not an object.
    pub fn slot_field(name: impl Into<String>, field: impl Into<String>) -> Self {
        let name = name.into();
        let field = field.into();
        Self::new(move |ctx| match ctx.slot(&name) {
            Some(Value::Object(map)) => map.get(&field).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        })
    }

    /// A field of a row inside an array result slot.
    pub fn slot_at(name: impl Into<String>, index: usize, field: impl Into<String>) -> Self {
        let name = name.into();
        let field = field.into();
        Self::new(move |ctx| match ctx.slot(&name) {
            Some(Value::Array(rows)) => match rows.get(index) {
                Some(Value::Object(map)) => map.get(&field).cloned().unwrap_or(Value::Null),
                _ => Value::Null,
            },
            _ => Value::Null,
        })
    }

    /// The pinned identity at render time.
    pub fn pinned() -> Self {
        Self::new(|ctx| ctx.pin().cloned().unwrap_or(Value::Null))
    }

    pub fn resolve(&self, ctx: &DeferredContext<'_>) -> Value {
        (self.producer)(ctx)
    }
}

impl fmt::Debug for DeferredValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeferredValue")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> ResultMap {
        let mut map = ResultMap::new();
        map.insert("user".into(), json!({"id": 7, "name": "ada"}));
        map.insert(
            "posts".into(),
            json!([{"title": "first"}, {"title": "second"}]),
        );
        map.insert("flag".into(), json!(true));
        map
    }

    #[test]
    fn slot_returns_whole_value() {
        let results = sample();
        let ctx = DeferredContext::new(&results, None);
        assert_eq!(
            DeferredValue::slot("user").resolve(&ctx),
            json!({"id": 7, "name": "ada"})
        );
        assert_eq!(DeferredValue::slot("missing").resolve(&ctx), Value::Null);
    }

    #[test]
    fn slot_field_handles_shape_mismatch() {
        let results = sample();
        let ctx = DeferredContext::new(&results, None);
        assert_eq!(
            DeferredValue::slot_field("user", "name").resolve(&ctx),
            json!("ada")
        );
        assert_eq!(
            DeferredValue::slot_field("user", "missing").resolve(&ctx),
            Value::Null
        );
        // not an object
        assert_eq!(
            DeferredValue::slot_field("flag", "name").resolve(&ctx),
            Value::Null
        );
        assert_eq!(
            DeferredValue::slot_field("absent", "name").resolve(&ctx),
            Value::Null
        );
    }

    #[test]
    fn slot_at_indexes_rows() {
        let results = sample();
        let ctx = DeferredContext::new(&results, None);
        assert_eq!(
            DeferredValue::slot_at("posts", 1, "title").resolve(&ctx),
            json!("second")
        );
        assert_eq!(
            DeferredValue::slot_at("posts", 9, "title").resolve(&ctx),
            Value::Null
        );
        assert_eq!(
            DeferredValue::slot_at("user", 0, "name").resolve(&ctx),
            Value::Null
        );
    }

    #[test]
    fn pinned_reads_current_identity() {
        let results = sample();
        let id = json!(99);
        let ctx = DeferredContext::new(&results, Some(&id));
        assert_eq!(DeferredValue::pinned().resolve(&ctx), json!(99));
    }

    #[test]
    fn producers_share_state_across_clones() {
        let deferred = DeferredValue::new(|ctx| {
            json!(ctx.results().len())
        });
        let copy = deferred.clone();
        let results = sample();
        let ctx = DeferredContext::new(&results, None);
        assert_eq!(deferred.resolve(&ctx), json!(3));
        assert_eq!(copy.resolve(&ctx), json!(3));
    }
}
