//! The command pipeline.
//!
//! A [`Pipeline`] queues commands against one backend and runs them
//! strictly in order with [`exec`](Pipeline::exec). Data methods return
//! the command's [`ConditionBuilder`] so predicates and values chain
//! off the call site. Misusing a backend (transactions on a backend
//! without them, raw SQL on a document store) panics at build time;
//! run-time failures go through the error report instead.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::backend::{Backend, Capability};
use crate::builder::ConditionBuilder;
use crate::command::{
    slot_is_empty, BookmarkFn, Command, CommandKind, PinSource, ReadKind, ScalarKind,
    ValidateCheck, ValidateTarget, Verdict, WhenFn,
};
use crate::deferred::DeferredValue;
use crate::error::{ErrorReport, Result};
use crate::events::{PipelineEvent, CHANNEL_CAPACITY};
use crate::executor::ExecOutcome;
use crate::registry::QueryTemplates;
use crate::value::{Arg, ResultMap};

pub struct Pipeline {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) commands: Vec<Command>,
    pub(crate) templates: Option<Arc<QueryTemplates>>,
    pub(crate) whens: HashMap<String, Vec<WhenFn>>,
    pub(crate) skips: HashSet<String>,
    pub(crate) skip_count: u32,
    pub(crate) events: broadcast::Sender<PipelineEvent>,
}

impl Pipeline {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            backend,
            commands: Vec::new(),
            templates: None,
            whens: HashMap::new(),
            skips: HashSet::new(),
            skip_count: 0,
            events,
        }
    }

    /// Attach a shared template registry for [`named_query`](Self::named_query).
    pub fn with_templates(mut self, templates: Arc<QueryTemplates>) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Subscribe to run progress events.
    pub fn events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Drop every queued command and reset skip state. Event listeners
    /// and `when` callbacks stay registered.
    pub fn clear(&mut self) {
        self.commands.clear();
        self.skips.clear();
        self.skip_count = 0;
    }

    fn data(&mut self, name: &str, target: &str, kind: CommandKind) -> &mut ConditionBuilder {
        self.commands.push(Command {
            name: Some(name.to_string()),
            target: Some(target.to_string()),
            builder: Some(ConditionBuilder::new()),
            kind,
        });
        let last = self.commands.len() - 1;
        self.commands[last]
            .builder
            .get_or_insert_with(ConditionBuilder::new)
    }

    /// Queue a row read. The slot receives an array, or a single object
    /// when the builder's [`first`](ConditionBuilder::first) flag is set.
    pub fn select(&mut self, name: &str, target: &str) -> &mut ConditionBuilder {
        self.data(name, target, CommandKind::Select(ReadKind::Rows))
    }

    /// Queue an insert. The slot receives `{"identity": <id>}` and the
    /// identity is pinned unless a put has locked it.
    pub fn insert(&mut self, name: &str, target: &str) -> &mut ConditionBuilder {
        self.data(name, target, CommandKind::Insert)
    }

    /// Queue an update against the builder's predicates.
    pub fn update(&mut self, name: &str, target: &str) -> &mut ConditionBuilder {
        self.data(name, target, CommandKind::Update)
    }

    /// Queue an insert or an update depending on `is_new`.
    pub fn save(&mut self, name: &str, target: &str, is_new: bool) -> &mut ConditionBuilder {
        if is_new {
            self.insert(name, target)
        } else {
            self.update(name, target)
        }
    }

    /// Queue a delete against the builder's predicates.
    pub fn delete(&mut self, name: &str, target: &str) -> &mut ConditionBuilder {
        self.data(name, target, CommandKind::Delete)
    }

    /// Alias for [`delete`](Self::delete).
    pub fn remove(&mut self, name: &str, target: &str) -> &mut ConditionBuilder {
        self.delete(name, target)
    }

    /// Queue a count; the slot receives a number.
    pub fn count(&mut self, name: &str, target: &str) -> &mut ConditionBuilder {
        self.data(
            name,
            target,
            CommandKind::Select(ReadKind::Scalar(ScalarKind::Count)),
        )
    }

    /// Queue an existence probe; the slot receives a boolean.
    pub fn exists(&mut self, name: &str, target: &str) -> &mut ConditionBuilder {
        let builder = self.data(
            name,
            target,
            CommandKind::Select(ReadKind::Scalar(ScalarKind::Exists)),
        );
        builder.first();
        builder
    }

    /// Queue a maximum-value read over one column.
    pub fn max(&mut self, name: &str, target: &str, column: &str) -> &mut ConditionBuilder {
        self.data(
            name,
            target,
            CommandKind::Select(ReadKind::Scalar(ScalarKind::Max(column.to_string()))),
        )
    }

    /// Queue a minimum-value read over one column.
    pub fn min(&mut self, name: &str, target: &str, column: &str) -> &mut ConditionBuilder {
        self.data(
            name,
            target,
            CommandKind::Select(ReadKind::Scalar(ScalarKind::Min(column.to_string()))),
        )
    }

    /// Queue an average over one column.
    ///
    /// # Panics
    ///
    /// Panics when the backend does not advertise
    /// [`Capability::Aggregation`].
    pub fn avg(&mut self, name: &str, target: &str, column: &str) -> &mut ConditionBuilder {
        if !self.backend.supports(Capability::Aggregation) {
            panic!(
                "backend '{}' does not support aggregation",
                self.backend.backend_type()
            );
        }
        self.data(
            name,
            target,
            CommandKind::Select(ReadKind::Scalar(ScalarKind::Avg(column.to_string()))),
        )
    }

    /// Queue a paged listing. The slot receives a summary object with
    /// `count`, `items`, `page`, `pages` and `limit`.
    pub fn listing(&mut self, name: &str, target: &str) -> &mut ConditionBuilder {
        self.data(name, target, CommandKind::Select(ReadKind::Listing))
    }

    /// Queue a comparison of one row against the given object. The slot
    /// receives `false` when every key matches, otherwise a diff record.
    pub fn compare(&mut self, name: &str, target: &str, value: Value) -> &mut ConditionBuilder {
        let builder = self.data(name, target, CommandKind::Select(ReadKind::Compare(value)));
        builder.first();
        builder
    }

    /// Queue a raw SQL query with bind parameters. Builder predicates
    /// and paging are appended to the text.
    ///
    /// # Panics
    ///
    /// Panics when the backend does not advertise [`Capability::RawSql`].
    pub fn query(&mut self, name: &str, sql: &str, params: Vec<Value>) -> &mut ConditionBuilder {
        if !self.backend.supports(Capability::RawSql) {
            panic!(
                "backend '{}' does not support raw sql",
                self.backend.backend_type()
            );
        }
        self.data(
            name,
            "",
            CommandKind::RawQuery {
                sql: sql.to_string(),
                params,
            },
        )
    }

    /// Queue a registered query template by key.
    ///
    /// # Panics
    ///
    /// Panics when no template registry is attached, the key is
    /// unknown, or the backend does not advertise [`Capability::RawSql`].
    pub fn named_query(&mut self, name: &str, key: &str) -> &mut ConditionBuilder {
        let sql = self
            .templates
            .as_ref()
            .and_then(|t| t.get(key))
            .unwrap_or_else(|| panic!("unknown query template '{key}'"));
        self.query(name, &sql, Vec::new())
    }

    /// Queue a custom validation. A failing verdict aborts the rest of
    /// the run, or marks the transaction for rollback inside one.
    pub fn validate(
        &mut self,
        check: impl FnMut(&ErrorReport, &ResultMap) -> Verdict + Send + 'static,
    ) -> &mut Self {
        self.commands.push(Command {
            name: None,
            target: None,
            builder: None,
            kind: CommandKind::Validate {
                check: ValidateCheck::Custom(Box::new(check)),
                message: None,
            },
        });
        self
    }

    /// Alias for [`validate`](Self::validate).
    pub fn cancel(
        &mut self,
        check: impl FnMut(&ErrorReport, &ResultMap) -> Verdict + Send + 'static,
    ) -> &mut Self {
        self.validate(check)
    }

    /// Validate that the most recent data command stored a non-empty
    /// result.
    pub fn validate_last(&mut self, message: Option<&str>) -> &mut Self {
        self.commands.push(Command {
            name: None,
            target: None,
            builder: None,
            kind: CommandKind::Validate {
                check: ValidateCheck::NonEmpty(ValidateTarget::Last),
                message: message.map(str::to_string),
            },
        });
        self
    }

    /// Validate that a named slot holds a non-empty result.
    pub fn validate_result(&mut self, name: &str, message: Option<&str>) -> &mut Self {
        self.commands.push(Command {
            name: None,
            target: None,
            builder: None,
            kind: CommandKind::Validate {
                check: ValidateCheck::NonEmpty(ValidateTarget::Named(name.to_string())),
                message: message.map(str::to_string),
            },
        });
        self
    }

    /// Validate that a named slot is empty or absent.
    pub fn validate_absent(&mut self, name: &str, message: Option<&str>) -> &mut Self {
        self.commands.push(Command {
            name: None,
            target: None,
            builder: None,
            kind: CommandKind::Validate {
                check: ValidateCheck::Empty(ValidateTarget::Named(name.to_string())),
                message: message.map(str::to_string),
            },
        });
        self
    }

    /// Queue an async checkpoint with mutable run state. An error
    /// return aborts like a failed validation.
    pub fn prepare<F>(&mut self, callback: F) -> &mut Self
    where
        F: for<'a> FnMut(&'a mut ErrorReport, &'a mut ResultMap) -> BoxFuture<'a, Result<()>>
            + Send
            + 'static,
    {
        self.commands.push(Command {
            name: None,
            target: None,
            builder: None,
            kind: CommandKind::Prepare(Box::new(callback)),
        });
        self
    }

    /// Queue a synchronous checkpoint with mutable run state.
    pub fn bookmark<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnMut(&mut ErrorReport, &mut ResultMap) -> Result<()> + Send + 'static,
    {
        self.commands.push(Command {
            name: None,
            target: None,
            builder: None,
            kind: CommandKind::Bookmark(Box::new(callback)),
        });
        self
    }

    /// Queue a result-map rewrite.
    pub fn modify<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnMut(&mut ResultMap) -> Result<()> + Send + 'static,
    {
        self.commands.push(Command {
            name: None,
            target: None,
            builder: None,
            kind: CommandKind::Modify(Box::new(callback)),
        });
        self
    }

    /// Run a checkpoint only when the named slot is empty (absent,
    /// null, false, zero, empty string or empty array).
    pub fn ifnot<F>(&mut self, name: &str, mut callback: F) -> &mut Self
    where
        F: FnMut(&mut ErrorReport, &mut ResultMap) -> Result<()> + Send + 'static,
    {
        let name = name.to_string();
        let gated: BookmarkFn = Box::new(move |errors, results| {
            if slot_is_empty(results.get(&name)) {
                callback(errors, results)
            } else {
                Ok(())
            }
        });
        self.commands.push(Command {
            name: None,
            target: None,
            builder: None,
            kind: CommandKind::Bookmark(gated),
        });
        self
    }

    /// Run a checkpoint only when the named slot holds content.
    pub fn ifexists<F>(&mut self, name: &str, mut callback: F) -> &mut Self
    where
        F: FnMut(&mut ErrorReport, &mut ResultMap) -> Result<()> + Send + 'static,
    {
        let name = name.to_string();
        let gated: BookmarkFn = Box::new(move |errors, results| {
            if slot_is_empty(results.get(&name)) {
                Ok(())
            } else {
                callback(errors, results)
            }
        });
        self.commands.push(Command {
            name: None,
            target: None,
            builder: None,
            kind: CommandKind::Bookmark(gated),
        });
        self
    }

    /// Pin an identity explicitly and lock it against later inserts.
    pub fn put(&mut self, value: impl Into<Arg>) -> &mut Self {
        let source = match value.into() {
            Arg::Value(v) => PinSource::Value(v),
            Arg::Deferred(d) => PinSource::Deferred(d),
            Arg::Pin => PinSource::Current,
        };
        self.commands.push(Command {
            name: None,
            target: None,
            builder: None,
            kind: CommandKind::Put(source),
        });
        self
    }

    /// Lock the currently pinned identity in place.
    pub fn lock(&mut self) -> &mut Self {
        self.put(crate::value::pin())
    }

    /// Let later inserts pin their identity again.
    pub fn unlock(&mut self) -> &mut Self {
        self.commands.push(Command {
            name: None,
            target: None,
            builder: None,
            kind: CommandKind::Unlock,
        });
        self
    }

    /// Open a transaction.
    ///
    /// # Panics
    ///
    /// Panics when the backend does not advertise
    /// [`Capability::Transactions`].
    pub fn begin(&mut self) -> &mut Self {
        if !self.backend.supports(Capability::Transactions) {
            panic!(
                "backend '{}' does not support transactions",
                self.backend.backend_type()
            );
        }
        self.commands.push(Command {
            name: None,
            target: None,
            builder: None,
            kind: CommandKind::Begin,
        });
        self
    }

    /// Close the open transaction: commit, or roll back when a failure
    /// marked the transaction.
    pub fn end(&mut self) -> &mut Self {
        self.commands.push(Command {
            name: None,
            target: None,
            builder: None,
            kind: CommandKind::End,
        });
        self
    }

    /// Alias for [`end`](Self::end).
    pub fn commit(&mut self) -> &mut Self {
        self.end()
    }

    /// Skip the named data command when the run reaches it.
    pub fn skip_step(&mut self, name: &str) -> &mut Self {
        self.skips.insert(name.to_string());
        self
    }

    /// Skip the next not-yet-skipped data command of the run.
    pub fn skip_next(&mut self) -> &mut Self {
        self.skip_count += 1;
        self
    }

    /// Move the most recently queued command to the front of the queue.
    pub fn priority(&mut self) -> &mut Self {
        if self.commands.len() > 1 {
            if let Some(cmd) = self.commands.pop() {
                self.commands.insert(0, cmd);
            }
        }
        self
    }

    /// Remove the first queued command with the given name. Returns
    /// whether anything was removed.
    pub fn destroy(&mut self, name: &str) -> bool {
        let found = self
            .commands
            .iter()
            .position(|c| c.name.as_deref() == Some(name));
        match found {
            Some(index) => {
                self.commands.remove(index);
                true
            }
            None => false,
        }
    }

    /// Listener fired right after the named command stores its result.
    pub fn when<F>(&mut self, name: &str, callback: F) -> &mut Self
    where
        F: FnMut(&ErrorReport, &ResultMap, &Value) + Send + 'static,
    {
        self.whens
            .entry(name.to_string())
            .or_default()
            .push(Box::new(callback));
        self
    }

    /// Deferred lookup of a field in a named slot, for wiring one
    /// command's output into a later command's input.
    pub fn expected(&self, name: &str, field: &str) -> DeferredValue {
        DeferredValue::slot_field(name, field)
    }

    /// Deferred lookup of a field in a row of a named array slot.
    pub fn expected_at(&self, name: &str, index: usize, field: &str) -> DeferredValue {
        DeferredValue::slot_at(name, index, field)
    }

    /// Builder of the first queued command with the given name, for
    /// inspection before a run.
    pub fn find(&self, name: &str) -> Option<&ConditionBuilder> {
        self.commands
            .iter()
            .find(|c| c.name.as_deref() == Some(name))
            .and_then(|c| c.builder.as_ref())
    }

    /// Mutable access to a queued command's builder.
    pub fn find_mut(&mut self, name: &str) -> Option<&mut ConditionBuilder> {
        self.commands
            .iter_mut()
            .find(|c| c.name.as_deref() == Some(name))
            .and_then(|c| c.builder.as_mut())
    }

    /// Run every queued command in order. Commands stay queued, so a
    /// pipeline can be executed again; call [`clear`](Self::clear) to
    /// discard them.
    pub async fn exec(&mut self) -> ExecOutcome {
        crate::executor::run(self).await
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("backend", &self.backend.backend_type())
            .field("commands", &self.commands)
            .finish()
    }
}
