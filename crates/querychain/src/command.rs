//! Queued commands and the callback signatures they carry.

use std::fmt;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::builder::ConditionBuilder;
use crate::deferred::DeferredValue;
use crate::error::{ErrorReport, Result};
use crate::value::ResultMap;

/// Outcome of a validation callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Keep running.
    Pass,
    /// Fail with the step's default message.
    Fail,
    /// Fail with a specific message.
    FailWith(String),
}

/// Synchronous validation predicate.
pub type ValidateFn = Box<dyn FnMut(&ErrorReport, &ResultMap) -> Verdict + Send>;

/// Async checkpoint with mutable access to the run state.
pub type PrepareFn =
    Box<dyn for<'a> FnMut(&'a mut ErrorReport, &'a mut ResultMap) -> BoxFuture<'a, Result<()>> + Send>;

/// Synchronous checkpoint with mutable access to the run state.
pub type BookmarkFn = Box<dyn FnMut(&mut ErrorReport, &mut ResultMap) -> Result<()> + Send>;

/// Result-map rewrite hook.
pub type ModifyFn = Box<dyn FnMut(&mut ResultMap) -> Result<()> + Send>;

/// Listener fired after a named command stores its result.
pub type WhenFn = Box<dyn FnMut(&ErrorReport, &ResultMap, &Value) + Send>;

/// Where a pinned identity comes from.
pub(crate) enum PinSource {
    Value(Value),
    Deferred(DeferredValue),
    /// Freeze whatever is pinned right now.
    Current,
}

/// Scalar reads folded to a single value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ScalarKind {
    Count,
    Max(String),
    Min(String),
    Avg(String),
    Exists,
}

/// Shape of a read command's result.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ReadKind {
    /// Rows, or a single row when the builder's single flag is set.
    Rows,
    Scalar(ScalarKind),
    /// Count plus a page of rows folded into one summary object.
    Listing,
    /// Fetch one row and diff it against the given object.
    Compare(Value),
}

/// What a validation step checks.
pub(crate) enum ValidateCheck {
    Custom(ValidateFn),
    NonEmpty(ValidateTarget),
    Empty(ValidateTarget),
}

#[derive(Clone, Debug)]
pub(crate) enum ValidateTarget {
    /// The most recent data command's slot.
    Last,
    Named(String),
}

pub(crate) enum CommandKind {
    Select(ReadKind),
    Insert,
    Update,
    Delete,
    RawQuery { sql: String, params: Vec<Value> },
    Validate {
        check: ValidateCheck,
        message: Option<String>,
    },
    Prepare(PrepareFn),
    Bookmark(BookmarkFn),
    Modify(ModifyFn),
    Put(PinSource),
    Unlock,
    Begin,
    End,
}

/// One queued pipeline step.
pub(crate) struct Command {
    pub name: Option<String>,
    pub target: Option<String>,
    pub builder: Option<ConditionBuilder>,
    pub kind: CommandKind,
}

impl Command {
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            CommandKind::Select(ReadKind::Rows) => "select",
            CommandKind::Select(ReadKind::Scalar(ScalarKind::Count)) => "count",
            CommandKind::Select(ReadKind::Scalar(ScalarKind::Max(_))) => "max",
            CommandKind::Select(ReadKind::Scalar(ScalarKind::Min(_))) => "min",
            CommandKind::Select(ReadKind::Scalar(ScalarKind::Avg(_))) => "avg",
            CommandKind::Select(ReadKind::Scalar(ScalarKind::Exists)) => "exists",
            CommandKind::Select(ReadKind::Listing) => "listing",
            CommandKind::Select(ReadKind::Compare(_)) => "compare",
            CommandKind::Insert => "insert",
            CommandKind::Update => "update",
            CommandKind::Delete => "delete",
            CommandKind::RawQuery { .. } => "query",
            CommandKind::Validate { .. } => "validate",
            CommandKind::Prepare(_) => "prepare",
            CommandKind::Bookmark(_) => "bookmark",
            CommandKind::Modify(_) => "modify",
            CommandKind::Put(_) => "put",
            CommandKind::Unlock => "unlock",
            CommandKind::Begin => "begin",
            CommandKind::End => "end",
        }
    }

    /// True for commands that touch the backend and respect skip gates.
    pub fn is_data(&self) -> bool {
        matches!(
            self.kind,
            CommandKind::Select(_)
                | CommandKind::Insert
                | CommandKind::Update
                | CommandKind::Delete
                | CommandKind::RawQuery { .. }
        )
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("kind", &self.kind_name())
            .field("name", &self.name)
            .field("target", &self.target)
            .finish()
    }
}

/// True when a result slot holds nothing worth gating on: absent,
/// null, false, zero, an empty string or an empty array.
pub(crate) fn slot_is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Bool(b)) => !b,
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_names_match_operations() {
        let cmd = Command {
            name: Some("fetch".into()),
            target: Some("users".into()),
            builder: Some(ConditionBuilder::new()),
            kind: CommandKind::Select(ReadKind::Rows),
        };
        assert_eq!(cmd.kind_name(), "select");
        assert!(cmd.is_data());

        let cmd = Command {
            name: None,
            target: None,
            builder: None,
            kind: CommandKind::Begin,
        };
        assert_eq!(cmd.kind_name(), "begin");
        assert!(!cmd.is_data());
    }

    #[test]
    fn empty_slots_cover_falsy_values() {
        assert!(slot_is_empty(None));
        assert!(slot_is_empty(Some(&Value::Null)));
        assert!(slot_is_empty(Some(&json!(false))));
        assert!(slot_is_empty(Some(&json!(0))));
        assert!(slot_is_empty(Some(&json!(""))));
        assert!(slot_is_empty(Some(&json!([]))));

        assert!(!slot_is_empty(Some(&json!(true))));
        assert!(!slot_is_empty(Some(&json!(3))));
        assert!(!slot_is_empty(Some(&json!("x"))));
        assert!(!slot_is_empty(Some(&json!([1]))));
        assert!(!slot_is_empty(Some(&json!({}))));
    }
}
