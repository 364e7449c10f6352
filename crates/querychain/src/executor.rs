//! Sequential command execution.
//!
//! [`run`] drains a pipeline's queue one command at a time over the
//! backend, never concurrently, threading run state through
//! [`serial::drive`]. Failed data commands record an error and let the
//! run continue; failed validations and checkpoints abort it, or mark
//! an open transaction for rollback so only the closing `end` still
//! executes. A transaction left open when the queue ends is rolled
//! back, never committed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{AdapterReply, Backend, QueryFormat, RenderedQuery};
use crate::builder::ConditionBuilder;
use crate::command::{
    slot_is_empty, Command, CommandKind, PinSource, ReadKind, ScalarKind, ValidateCheck,
    ValidateTarget, Verdict, WhenFn,
};
use crate::deferred::DeferredContext;
use crate::dialect;
use crate::document;
use crate::error::{ChainError, ErrorReport, Result};
use crate::events::PipelineEvent;
use crate::pipeline::Pipeline;
use crate::serial::{self, Flow};
use crate::value::ResultMap;

/// Everything a finished run produced.
#[derive(Debug)]
pub struct ExecOutcome {
    pub results: ResultMap,
    pub errors: ErrorReport,
    pub elapsed: Duration,
}

impl ExecOutcome {
    /// True when no error was recorded.
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn slot(&self, name: &str) -> Option<&Value> {
        self.results.get(name)
    }

    /// The result map, or the first recorded error.
    pub fn into_result(self) -> Result<ResultMap> {
        match self.errors.first() {
            None => Ok(self.results),
            Some(entry) => Err(entry.error.clone()),
        }
    }
}

struct RunState {
    results: ResultMap,
    errors: ErrorReport,
    /// Name of the most recent data command, failed or not.
    last: Option<String>,
    transaction: bool,
    rollback_pending: bool,
    pin: Option<Value>,
    pin_locked: bool,
    skip_budget: u32,
}

struct Scope<'p> {
    commands: &'p mut [Command],
    backend: &'p Arc<dyn Backend>,
    events: &'p broadcast::Sender<PipelineEvent>,
    whens: &'p mut HashMap<String, Vec<WhenFn>>,
    skips: &'p HashSet<String>,
    run: RunState,
    run_id: Uuid,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum StepKind {
    Validate,
    Prepare,
    Bookmark,
    Modify,
    Put,
    Unlock,
    Begin,
    End,
    Data,
}

fn classify(kind: &CommandKind) -> StepKind {
    match kind {
        CommandKind::Validate { .. } => StepKind::Validate,
        CommandKind::Prepare(_) => StepKind::Prepare,
        CommandKind::Bookmark(_) => StepKind::Bookmark,
        CommandKind::Modify(_) => StepKind::Modify,
        CommandKind::Put(_) => StepKind::Put,
        CommandKind::Unlock => StepKind::Unlock,
        CommandKind::Begin => StepKind::Begin,
        CommandKind::End => StepKind::End,
        _ => StepKind::Data,
    }
}

pub(crate) async fn run(pipeline: &mut Pipeline) -> ExecOutcome {
    let started = Instant::now();
    let run_id = Uuid::new_v4();
    let count = pipeline.commands.len();
    debug!(
        run = %run_id,
        backend = pipeline.backend.backend_type(),
        commands = count,
        "run started"
    );
    let scope = Scope {
        commands: pipeline.commands.as_mut_slice(),
        backend: &pipeline.backend,
        events: &pipeline.events,
        whens: &mut pipeline.whens,
        skips: &pipeline.skips,
        run: RunState {
            results: ResultMap::new(),
            errors: ErrorReport::new(),
            last: None,
            transaction: false,
            rollback_pending: false,
            pin: None,
            pin_locked: false,
            skip_budget: pipeline.skip_count,
        },
        run_id,
    };

    let (mut scope, ran) = serial::drive(scope, 0..count, |mut scope, index| async move {
        let flow = scope.step(index).await;
        (scope, flow)
    })
    .await;

    // A transaction left open never commits implicitly.
    if scope.run.transaction {
        warn!(run = %run_id, "queue drained inside an open transaction, rolling back");
        if let Err(error) = scope.backend.rollback().await {
            scope.run.errors.push(error);
        }
        scope.run.transaction = false;
        scope.run.rollback_pending = false;
    }

    let elapsed = started.elapsed();
    let _ = scope.events.send(PipelineEvent::End {
        errors: scope.run.errors.clone(),
        results: scope.run.results.clone(),
        elapsed_ms: elapsed.as_millis() as u64,
    });
    debug!(
        run = %run_id,
        steps = ran,
        errors = scope.run.errors.len(),
        elapsed_ms = elapsed.as_millis() as u64,
        "run finished"
    );
    ExecOutcome {
        results: scope.run.results,
        errors: scope.run.errors,
        elapsed,
    }
}

impl<'p> Scope<'p> {
    async fn step(&mut self, index: usize) -> Flow {
        let step_kind = classify(&self.commands[index].kind);

        // Once a rollback is pending only the closing end still runs.
        if self.run.rollback_pending && step_kind != StepKind::End {
            debug!(run = %self.run_id, step = index, "skipped, rollback pending");
            return Flow::Continue;
        }

        match step_kind {
            StepKind::Validate => self.run_validate(index),
            StepKind::Prepare => self.run_prepare(index).await,
            StepKind::Bookmark => self.run_bookmark(index),
            StepKind::Modify => self.run_modify(index),
            StepKind::Put => self.run_put(index),
            StepKind::Unlock => {
                self.run.pin_locked = false;
                Flow::Continue
            }
            StepKind::Begin => self.run_begin().await,
            StepKind::End => self.run_end().await,
            StepKind::Data => {
                // Skip gates cover data commands only.
                if self.run.skip_budget > 0 {
                    self.run.skip_budget -= 1;
                    debug!(run = %self.run_id, step = index, "skipped by budget");
                    return Flow::Continue;
                }
                if let Some(name) = self.commands[index].name.as_deref() {
                    if self.skips.contains(name) {
                        debug!(run = %self.run_id, step = name, "skipped by name");
                        return Flow::Continue;
                    }
                }
                self.run_data(index).await
            }
        }
    }

    fn run_validate(&mut self, index: usize) -> Flow {
        let Scope { commands, run, .. } = self;
        let failure = match &mut commands[index].kind {
            CommandKind::Validate { check, message } => {
                let verdict = match check {
                    ValidateCheck::Custom(callback) => callback(&run.errors, &run.results),
                    ValidateCheck::NonEmpty(target) => {
                        if slot_is_empty(resolve_target(run, target)) {
                            Verdict::Fail
                        } else {
                            Verdict::Pass
                        }
                    }
                    ValidateCheck::Empty(target) => {
                        if slot_is_empty(resolve_target(run, target)) {
                            Verdict::Pass
                        } else {
                            Verdict::Fail
                        }
                    }
                };
                match verdict {
                    Verdict::Pass => None,
                    Verdict::Fail => Some(
                        message
                            .clone()
                            .unwrap_or_else(|| "validation failed".to_string()),
                    ),
                    Verdict::FailWith(text) => Some(text),
                }
            }
            _ => None,
        };
        match failure {
            None => Flow::Continue,
            Some(text) => {
                self.run.errors.push(ChainError::Validation(text));
                self.fail_or_abort("validation failed")
            }
        }
    }

    async fn run_prepare(&mut self, index: usize) -> Flow {
        let Scope { commands, run, .. } = self;
        let outcome = match &mut commands[index].kind {
            CommandKind::Prepare(callback) => callback(&mut run.errors, &mut run.results).await,
            _ => Ok(()),
        };
        self.absorb_checkpoint(outcome)
    }

    fn run_bookmark(&mut self, index: usize) -> Flow {
        let Scope { commands, run, .. } = self;
        let outcome = match &mut commands[index].kind {
            CommandKind::Bookmark(callback) => callback(&mut run.errors, &mut run.results),
            _ => Ok(()),
        };
        self.absorb_checkpoint(outcome)
    }

    fn run_modify(&mut self, index: usize) -> Flow {
        let Scope { commands, run, .. } = self;
        let outcome = match &mut commands[index].kind {
            CommandKind::Modify(callback) => callback(&mut run.results),
            _ => Ok(()),
        };
        self.absorb_checkpoint(outcome)
    }

    fn run_put(&mut self, index: usize) -> Flow {
        let Scope { commands, run, .. } = self;
        if let CommandKind::Put(source) = &commands[index].kind {
            let value = match source {
                PinSource::Value(v) => v.clone(),
                PinSource::Deferred(deferred) => {
                    let ctx = DeferredContext::new(&run.results, run.pin.as_ref());
                    deferred.resolve(&ctx)
                }
                PinSource::Current => run.pin.clone().unwrap_or(Value::Null),
            };
            run.pin = Some(value);
            run.pin_locked = true;
        }
        Flow::Continue
    }

    async fn run_begin(&mut self) -> Flow {
        debug!(run = %self.run_id, "begin transaction");
        match self.backend.begin().await {
            Ok(()) => {
                self.run.transaction = true;
                self.run.rollback_pending = false;
                Flow::Continue
            }
            Err(error) => {
                warn!(run = %self.run_id, error = %error, "begin failed, aborting run");
                self.run.errors.push(error);
                Flow::Stop
            }
        }
    }

    async fn run_end(&mut self) -> Flow {
        if !self.run.transaction {
            warn!(run = %self.run_id, "end without begin");
            return Flow::Continue;
        }
        self.run.transaction = false;
        if self.run.rollback_pending {
            self.run.rollback_pending = false;
            debug!(run = %self.run_id, "rolling back transaction");
            match self.backend.rollback().await {
                Ok(()) => Flow::Continue,
                Err(error) => {
                    self.run.errors.push(error);
                    Flow::Stop
                }
            }
        } else {
            debug!(run = %self.run_id, "committing transaction");
            match self.backend.commit().await {
                Ok(()) => Flow::Continue,
                Err(error) => {
                    warn!(run = %self.run_id, error = %error, "commit failed, attempting rollback");
                    self.run.errors.push(error);
                    if let Err(error) = self.backend.rollback().await {
                        self.run.errors.push(error);
                    }
                    Flow::Continue
                }
            }
        }
    }

    async fn run_data(&mut self, index: usize) -> Flow {
        let name = self.commands[index]
            .name
            .clone()
            .unwrap_or_else(|| index.to_string());

        if matches!(
            self.commands[index].kind,
            CommandKind::Select(ReadKind::Listing)
        ) {
            return self.run_listing(index, &name).await;
        }

        let rendered = match self.render(index) {
            Ok(rendered) => rendered,
            Err(error) => return self.data_failed(&name, error),
        };
        let text = rendered.display_text();
        let _ = self.events.send(PipelineEvent::Query {
            name: name.clone(),
            query: text.clone(),
            params: rendered.params(),
        });
        debug!(run = %self.run_id, step = %name, query = %text, "executing");
        match self.backend.execute(rendered).await {
            Ok(reply) => {
                self.fold(index, &name, reply);
                self.run.last = Some(name.clone());
                self.notify(&name);
                Flow::Continue
            }
            Err(error) => self.data_failed(&name, error),
        }
    }

    /// A listing issues a count and a page fetch, then folds both into
    /// one summary slot.
    async fn run_listing(&mut self, index: usize, name: &str) -> Flow {
        let rendered = {
            let command = &self.commands[index];
            match &command.builder {
                Some(builder) => {
                    let target = command.target.as_deref().unwrap_or("");
                    render_read(
                        self.backend.as_ref(),
                        builder,
                        target,
                        &ReadKind::Scalar(ScalarKind::Count),
                        &self.run,
                    )
                    .and_then(|count| {
                        render_read(
                            self.backend.as_ref(),
                            builder,
                            target,
                            &ReadKind::Rows,
                            &self.run,
                        )
                        .map(|rows| (count, rows))
                    })
                }
                None => Err(ChainError::invalid_value("data command without a builder")),
            }
        };
        let (count_query, rows_query) = match rendered {
            Ok(pair) => pair,
            Err(error) => return self.data_failed(name, error),
        };

        let _ = self.events.send(PipelineEvent::Query {
            name: name.to_string(),
            query: count_query.display_text(),
            params: count_query.params(),
        });
        let count = match self.backend.execute(count_query).await {
            Ok(reply) => fold_count(&reply, false),
            Err(error) => return self.data_failed(name, error),
        };

        let _ = self.events.send(PipelineEvent::Query {
            name: name.to_string(),
            query: rows_query.display_text(),
            params: rows_query.params(),
        });
        let items = match self.backend.execute(rows_query).await {
            Ok(reply) => reply_rows(reply),
            Err(error) => return self.data_failed(name, error),
        };

        let (skip, take) = self.commands[index]
            .builder
            .as_ref()
            .map(|b| b.paging())
            .unwrap_or((0, 0));
        let summary = listing_summary(count, items, skip, take);
        self.run.results.insert(name.to_string(), summary);
        self.run.last = Some(name.to_string());
        self.notify(name);
        Flow::Continue
    }

    fn render(&self, index: usize) -> Result<RenderedQuery> {
        let command = &self.commands[index];
        let builder = command
            .builder
            .as_ref()
            .ok_or_else(|| ChainError::invalid_value("data command without a builder"))?;
        let target = command.target.as_deref().unwrap_or("");
        match &command.kind {
            CommandKind::Select(read) => {
                render_read(self.backend.as_ref(), builder, target, read, &self.run)
            }
            CommandKind::Insert => match self.backend.format() {
                QueryFormat::Sql(dialect) => Ok(RenderedQuery::Sql(dialect::render_insert(
                    dialect,
                    builder,
                    target,
                    &self.ctx(),
                )?)),
                QueryFormat::Document => Ok(RenderedQuery::Document(
                    document::render_insert_doc(builder, target, &self.ctx())?,
                )),
            },
            CommandKind::Update => match self.backend.format() {
                QueryFormat::Sql(dialect) => Ok(RenderedQuery::Sql(dialect::render_update(
                    dialect,
                    builder,
                    target,
                    &self.ctx(),
                )?)),
                QueryFormat::Document => Ok(RenderedQuery::Document(
                    document::render_update_doc(builder, target, &self.ctx())?,
                )),
            },
            CommandKind::Delete => match self.backend.format() {
                QueryFormat::Sql(dialect) => Ok(RenderedQuery::Sql(dialect::render_delete(
                    dialect,
                    builder,
                    target,
                    &self.ctx(),
                )?)),
                QueryFormat::Document => Ok(RenderedQuery::Document(
                    document::render_delete_doc(builder, target, &self.ctx())?,
                )),
            },
            CommandKind::RawQuery { sql, params } => match self.backend.format() {
                QueryFormat::Sql(dialect) => Ok(RenderedQuery::Sql(dialect::render_raw(
                    dialect,
                    builder,
                    sql,
                    params,
                    &self.ctx(),
                )?)),
                QueryFormat::Document => Err(ChainError::unsupported(
                    self.backend.backend_type(),
                    "raw sql",
                )),
            },
            _ => Err(ChainError::invalid_value("not a data command")),
        }
    }

    fn ctx(&self) -> DeferredContext<'_> {
        DeferredContext::new(&self.run.results, self.run.pin.as_ref())
    }

    /// Fold an adapter reply into the result map.
    fn fold(&mut self, index: usize, name: &str, reply: AdapterReply) {
        let Scope { commands, run, .. } = self;
        let command = &commands[index];
        let single = command
            .builder
            .as_ref()
            .map(ConditionBuilder::is_single)
            .unwrap_or(false);
        match &command.kind {
            CommandKind::Insert => {
                let identity = match reply {
                    AdapterReply::Inserted(id) => id.unwrap_or(Value::Null),
                    AdapterReply::Rows(rows) => rows
                        .into_iter()
                        .next()
                        .and_then(first_column)
                        .unwrap_or(Value::Null),
                    _ => Value::Null,
                };
                if !run.pin_locked {
                    run.pin = Some(identity.clone());
                }
                run.results
                    .insert(name.to_string(), json!({ "identity": identity }));
            }
            CommandKind::Update | CommandKind::Delete => {
                let affected = match reply {
                    AdapterReply::Affected(n) | AdapterReply::Count(n) => n,
                    AdapterReply::Rows(rows) => rows.len() as u64,
                    _ => 0,
                };
                run.results.insert(name.to_string(), json!(affected));
            }
            CommandKind::RawQuery { .. } => {
                fold_rows(run, name, reply, single);
            }
            CommandKind::Select(read) => match read {
                ReadKind::Rows => fold_rows(run, name, reply, single),
                ReadKind::Scalar(kind) => {
                    let grouped = command
                        .builder
                        .as_ref()
                        .map(|b| !b.groups.is_empty())
                        .unwrap_or(false);
                    fold_scalar(run, name, kind, reply, grouped);
                }
                ReadKind::Compare(expected) => {
                    let record = match reply {
                        AdapterReply::Rows(rows) => rows.into_iter().next(),
                        AdapterReply::Row(row) => row,
                        _ => None,
                    };
                    let value = compare_value(expected, record);
                    run.results.insert(name.to_string(), value);
                }
                ReadKind::Listing => {}
            },
            _ => {}
        }
    }

    /// Fire the data event and any `when` listeners for a stored slot.
    fn notify(&mut self, name: &str) {
        let _ = self.events.send(PipelineEvent::Data {
            name: name.to_string(),
            results: self.run.results.clone(),
        });
        let Scope { whens, run, .. } = self;
        if let Some(listeners) = whens.get_mut(name) {
            let value = run.results.get(name).cloned().unwrap_or(Value::Null);
            for listener in listeners {
                listener(&run.errors, &run.results, &value);
            }
        }
    }

    fn data_failed(&mut self, name: &str, error: ChainError) -> Flow {
        warn!(run = %self.run_id, step = %name, error = %error, "data command failed");
        self.run.errors.push_step(name, error);
        self.run.last = Some(name.to_string());
        if self.run.transaction {
            self.run.rollback_pending = true;
        }
        Flow::Continue
    }

    fn absorb_checkpoint(&mut self, outcome: Result<()>) -> Flow {
        match outcome {
            Ok(()) => Flow::Continue,
            Err(error) => {
                self.run.errors.push(error);
                self.fail_or_abort("checkpoint failed")
            }
        }
    }

    /// Abort the run, or mark the transaction for rollback so the
    /// closing end still executes.
    fn fail_or_abort(&mut self, reason: &str) -> Flow {
        if self.run.transaction {
            debug!(run = %self.run_id, reason, "rollback pending");
            self.run.rollback_pending = true;
            Flow::Continue
        } else {
            debug!(run = %self.run_id, reason, "aborting run");
            Flow::Stop
        }
    }
}

fn resolve_target<'a>(run: &'a RunState, target: &ValidateTarget) -> Option<&'a Value> {
    match target {
        ValidateTarget::Last => run.last.as_ref().and_then(|name| run.results.get(name)),
        ValidateTarget::Named(name) => run.results.get(name),
    }
}

fn render_read(
    backend: &dyn Backend,
    builder: &ConditionBuilder,
    target: &str,
    read: &ReadKind,
    run: &RunState,
) -> Result<RenderedQuery> {
    let ctx = DeferredContext::new(&run.results, run.pin.as_ref());
    match backend.format() {
        QueryFormat::Sql(dialect) => Ok(RenderedQuery::Sql(dialect::render_select(
            dialect, builder, target, read, &ctx,
        )?)),
        QueryFormat::Document => Ok(RenderedQuery::Document(document::render_find(
            builder, target, read, &ctx,
        )?)),
    }
}

fn first_column(row: Value) -> Option<Value> {
    match row {
        Value::Object(map) => map.into_iter().next().map(|(_, v)| v),
        other => Some(other),
    }
}

fn normalize_scalar(value: Value) -> Value {
    match value {
        Value::String(s) => {
            if let Ok(i) = s.parse::<i64>() {
                Value::from(i)
            } else if let Ok(f) = s.parse::<f64>() {
                Value::from(f)
            } else {
                Value::String(s)
            }
        }
        other => other,
    }
}

fn scalar_from_row(row: &Value) -> Option<Value> {
    row.get(dialect::SCALAR_ALIAS)
        .cloned()
        .map(normalize_scalar)
}

fn fold_count(reply: &AdapterReply, grouped: bool) -> u64 {
    let value = match reply {
        AdapterReply::Count(n) => json!(n),
        AdapterReply::Rows(rows) if grouped => json!(rows.len() as u64),
        AdapterReply::Rows(rows) => rows
            .first()
            .and_then(scalar_from_row)
            .unwrap_or_else(|| json!(0)),
        AdapterReply::Row(Some(row)) => scalar_from_row(row).unwrap_or_else(|| json!(0)),
        _ => json!(0),
    };
    value.as_u64().unwrap_or(0)
}

fn reply_rows(reply: AdapterReply) -> Vec<Value> {
    match reply {
        AdapterReply::Rows(rows) => rows,
        AdapterReply::Row(Some(row)) => vec![row],
        _ => Vec::new(),
    }
}

fn fold_rows(run: &mut RunState, name: &str, reply: AdapterReply, single: bool) {
    match reply {
        AdapterReply::Rows(rows) => {
            if single {
                // An empty single read leaves the slot unwritten.
                if let Some(row) = rows.into_iter().next() {
                    run.results.insert(name.to_string(), row);
                }
            } else {
                run.results.insert(name.to_string(), Value::Array(rows));
            }
        }
        AdapterReply::Row(Some(row)) => {
            run.results.insert(name.to_string(), row);
        }
        AdapterReply::Row(None) => {
            if !single {
                run.results.insert(name.to_string(), json!([]));
            }
        }
        AdapterReply::Count(n) => {
            run.results.insert(name.to_string(), json!(n));
        }
        _ => {}
    }
}

fn fold_scalar(run: &mut RunState, name: &str, kind: &ScalarKind, reply: AdapterReply, grouped: bool) {
    match kind {
        ScalarKind::Count => {
            let count = fold_count(&reply, grouped);
            run.results.insert(name.to_string(), json!(count));
        }
        ScalarKind::Exists => {
            let found = match reply {
                AdapterReply::Rows(rows) => !rows.is_empty(),
                AdapterReply::Row(row) => row.is_some(),
                AdapterReply::Count(n) => n > 0,
                _ => false,
            };
            run.results.insert(name.to_string(), json!(found));
        }
        ScalarKind::Max(column) | ScalarKind::Min(column) | ScalarKind::Avg(column) => {
            let row = match reply {
                AdapterReply::Rows(rows) => rows.into_iter().next(),
                AdapterReply::Row(row) => row,
                _ => None,
            };
            // No row at all (empty collection) leaves the slot unwritten.
            if let Some(row) = row {
                let value = row
                    .get(dialect::SCALAR_ALIAS)
                    .or_else(|| row.get(column))
                    .cloned()
                    .map(normalize_scalar)
                    .unwrap_or(Value::Null);
                run.results.insert(name.to_string(), value);
            }
        }
    }
}

fn listing_summary(count: u64, items: Vec<Value>, skip: u64, take: u64) -> Value {
    if items.is_empty() {
        return json!({
            "count": count,
            "items": [],
            "page": 1,
            "pages": 0,
            "limit": take,
        });
    }
    let page = if take > 0 { skip / take + 1 } else { 1 };
    let pages = if take > 0 {
        count.div_ceil(take)
    } else if count > 0 {
        1
    } else {
        0
    };
    json!({
        "count": count,
        "items": items,
        "page": page,
        "pages": pages,
        "limit": take,
    })
}

fn compare_value(expected: &Value, record: Option<Value>) -> Value {
    let keys: Vec<String> = expected
        .as_object()
        .map(|map| map.keys().cloned().collect())
        .unwrap_or_default();
    let diff: Vec<String> = match &record {
        Some(Value::Object(row)) => keys
            .into_iter()
            .filter(|key| row.get(key) != expected.get(key))
            .collect(),
        _ => keys,
    };
    if diff.is_empty() {
        Value::Bool(false)
    } else {
        json!({
            "diff": diff,
            "record": record.unwrap_or(Value::Null),
            "value": expected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockBackend;
    use crate::value::pin;
    use crate::{DeferredValue, Pipeline};

    fn sql_pipeline(mock: MockBackend) -> Pipeline {
        Pipeline::new(Arc::new(mock))
    }

    #[tokio::test]
    async fn results_flow_into_later_commands() {
        let mock = MockBackend::sql().reply(AdapterReply::Rows(vec![json!({
            "id": 42,
            "name": "ada"
        })]));
        let mut p = sql_pipeline(mock);
        p.select("user", "users").where_eq("name", "ada").first();
        p.select("posts", "posts")
            .where_eq("owner_id", DeferredValue::slot_field("user", "id"));
        let outcome = p.exec().await;

        assert!(outcome.ok(), "unexpected errors: {}", outcome.errors);
        assert_eq!(outcome.slot("user"), Some(&json!({"id": 42, "name": "ada"})));
        let statements = p
            .backend()
            .downcast_ref::<MockBackend>()
            .map(|m| m.statements())
            .unwrap_or_default();
        assert_eq!(statements.len(), 2);
        assert!(statements[1].contains("\"owner_id\"=42"));
    }

    #[tokio::test]
    async fn insert_pins_identity_for_later_steps() {
        let mut p = sql_pipeline(MockBackend::sql());
        p.insert("created", "users").set("name", "ada");
        p.update("touch", "users")
            .set("active", true)
            .where_eq("id", pin());
        let outcome = p.exec().await;

        assert!(outcome.ok(), "unexpected errors: {}", outcome.errors);
        assert_eq!(outcome.slot("created"), Some(&json!({"identity": 1})));
        assert_eq!(outcome.slot("touch"), Some(&json!(1)));
        let statements = p
            .backend()
            .downcast_ref::<MockBackend>()
            .map(|m| m.statements())
            .unwrap_or_default();
        assert!(statements[1].contains("\"id\"=1"));
    }

    #[tokio::test]
    async fn put_locks_the_pin_until_unlock() {
        let mut p = sql_pipeline(MockBackend::sql());
        p.put(json!(99));
        p.insert("first", "users").set("name", "a");
        p.update("touch", "users").set("x", 1).where_eq("id", pin());
        p.unlock();
        p.insert("second", "users").set("name", "b");
        p.update("touch2", "users").set("x", 2).where_eq("id", pin());
        let outcome = p.exec().await;

        assert!(outcome.ok(), "unexpected errors: {}", outcome.errors);
        let statements = p
            .backend()
            .downcast_ref::<MockBackend>()
            .map(|m| m.statements())
            .unwrap_or_default();
        // the locked pin survives the first insert
        assert!(statements[1].contains("\"id\"=99"));
        // after unlock the second insert repins
        assert!(statements[3].contains("\"id\"=2"));
    }

    #[tokio::test]
    async fn data_errors_record_and_execution_continues() {
        let mock = MockBackend::sql().fail_on("\"users\"");
        let mut p = sql_pipeline(mock);
        p.select("people", "users");
        p.select("posts", "posts");
        let outcome = p.exec().await;

        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors.has_step("people"));
        // the failed step leaves no slot, the next one still ran
        assert!(outcome.slot("people").is_none());
        assert_eq!(outcome.slot("posts"), Some(&json!([])));
    }

    #[tokio::test]
    async fn failed_validation_stops_the_rest_of_the_run() {
        let mut p = sql_pipeline(MockBackend::sql());
        p.select("user", "users").first();
        p.validate_last(Some("user not found"));
        p.select("posts", "posts");
        let outcome = p.exec().await;

        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(
            outcome.errors.first().map(|e| e.error.to_string()),
            Some("validation failed: user not found".to_string())
        );
        let statements = p
            .backend()
            .downcast_ref::<MockBackend>()
            .map(|m| m.statements())
            .unwrap_or_default();
        assert_eq!(statements.len(), 1, "posts must never execute");
    }

    #[tokio::test]
    async fn custom_validation_passes_state_through() {
        let mock = MockBackend::sql().reply(AdapterReply::Rows(vec![json!({"id": 1})]));
        let mut p = sql_pipeline(mock);
        p.select("rows", "users");
        p.validate(|errors, results| {
            if errors.is_empty() && results.contains_key("rows") {
                Verdict::Pass
            } else {
                Verdict::FailWith("state missing".into())
            }
        });
        p.select("after", "posts");
        let outcome = p.exec().await;
        assert!(outcome.ok(), "unexpected errors: {}", outcome.errors);
        assert!(outcome.slot("after").is_some());
    }

    #[tokio::test]
    async fn transaction_failure_skips_to_rollback() {
        let mock = MockBackend::sql().fail_on("INSERT");
        let mut p = sql_pipeline(mock);
        p.begin();
        p.insert("created", "users").set("name", "ada");
        p.select("after", "users");
        p.end();
        let outcome = p.exec().await;

        assert_eq!(outcome.errors.len(), 1);
        let backend = p.backend().clone();
        let mock = backend.downcast_ref::<MockBackend>().unwrap();
        assert_eq!(mock.rollbacks.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(mock.commits.load(std::sync::atomic::Ordering::SeqCst), 0);
        // the select after the failure never ran
        assert_eq!(mock.statements().len(), 1);
        assert!(outcome.slot("after").is_none());
    }

    #[tokio::test]
    async fn failed_validation_inside_transaction_rolls_back() {
        let mut p = sql_pipeline(MockBackend::sql());
        p.begin();
        p.select("user", "users").first();
        p.validate_last(None);
        p.insert("created", "audit").set("ok", true);
        p.end();
        let outcome = p.exec().await;

        assert_eq!(outcome.errors.len(), 1);
        let backend = p.backend().clone();
        let mock = backend.downcast_ref::<MockBackend>().unwrap();
        assert_eq!(mock.rollbacks.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(mock.commits.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(mock.statements().len(), 1, "insert must not run");
    }

    #[tokio::test]
    async fn clean_transaction_commits() {
        let mut p = sql_pipeline(MockBackend::sql());
        p.begin();
        p.insert("created", "users").set("name", "ada");
        p.end();
        let outcome = p.exec().await;

        assert!(outcome.ok(), "unexpected errors: {}", outcome.errors);
        let backend = p.backend().clone();
        let mock = backend.downcast_ref::<MockBackend>().unwrap();
        assert_eq!(mock.begins.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(mock.commits.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(mock.rollbacks.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn open_transaction_rolls_back_at_queue_end() {
        let mut p = sql_pipeline(MockBackend::sql());
        p.begin();
        p.insert("created", "users").set("name", "ada");
        // no end()
        let outcome = p.exec().await;

        assert!(outcome.ok(), "an open transaction is not itself an error");
        let backend = p.backend().clone();
        let mock = backend.downcast_ref::<MockBackend>().unwrap();
        assert_eq!(mock.commits.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(mock.rollbacks.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn begin_failure_aborts_the_run() {
        let mut p = sql_pipeline(MockBackend::sql().fail_begin());
        p.begin();
        p.select("rows", "users");
        let outcome = p.exec().await;

        assert_eq!(outcome.errors.len(), 1);
        let backend = p.backend().clone();
        let mock = backend.downcast_ref::<MockBackend>().unwrap();
        assert!(mock.statements().is_empty());
    }

    #[tokio::test]
    async fn commit_failure_records_and_falls_back_to_rollback() {
        let mut p = sql_pipeline(MockBackend::sql().fail_commit());
        p.begin();
        p.insert("created", "users").set("name", "ada");
        p.end();
        let outcome = p.exec().await;

        assert_eq!(outcome.errors.len(), 1);
        let backend = p.backend().clone();
        let mock = backend.downcast_ref::<MockBackend>().unwrap();
        assert_eq!(mock.rollbacks.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn skip_budget_consumes_data_commands_only() {
        let mut p = sql_pipeline(MockBackend::sql());
        let marker = Arc::new(std::sync::Mutex::new(false));
        let seen = marker.clone();
        p.skip_next();
        p.bookmark(move |_errors, _results| {
            if let Ok(mut m) = seen.lock() {
                *m = true;
            }
            Ok(())
        });
        p.select("skipped", "users");
        p.select("ran", "posts");
        let outcome = p.exec().await;

        assert!(outcome.ok(), "unexpected errors: {}", outcome.errors);
        assert!(*marker.lock().unwrap(), "checkpoints are not skippable");
        assert!(outcome.slot("skipped").is_none());
        assert!(outcome.slot("ran").is_some());
        let backend = p.backend().clone();
        let mock = backend.downcast_ref::<MockBackend>().unwrap();
        assert_eq!(mock.statements().len(), 1);
    }

    #[tokio::test]
    async fn named_skips_suppress_matching_commands() {
        let mut p = sql_pipeline(MockBackend::sql());
        p.select("a", "users");
        p.select("b", "posts");
        p.skip_step("a");
        let outcome = p.exec().await;
        assert!(outcome.slot("a").is_none());
        assert!(outcome.slot("b").is_some());
    }

    #[tokio::test]
    async fn listing_folds_count_and_page() {
        let mock = MockBackend::sql()
            .reply(AdapterReply::Rows(vec![json!({"qcscalar": 25})]))
            .reply(AdapterReply::Rows(vec![
                json!({"id": 11}),
                json!({"id": 12}),
            ]));
        let mut p = sql_pipeline(mock);
        p.listing("feed", "posts").page(2, 10).order_by_desc("id");
        let outcome = p.exec().await;

        assert!(outcome.ok(), "unexpected errors: {}", outcome.errors);
        assert_eq!(
            outcome.slot("feed"),
            Some(&json!({
                "count": 25,
                "items": [{"id": 11}, {"id": 12}],
                "page": 2,
                "pages": 3,
                "limit": 10,
            }))
        );
        let backend = p.backend().clone();
        let mock = backend.downcast_ref::<MockBackend>().unwrap();
        let statements = mock.statements();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("COUNT(*)"));
        assert!(statements[1].contains("OFFSET 10"));
    }

    #[tokio::test]
    async fn empty_listing_reports_page_one() {
        let mock = MockBackend::sql()
            .reply(AdapterReply::Rows(vec![json!({"qcscalar": 0})]))
            .reply(AdapterReply::Rows(vec![]));
        let mut p = sql_pipeline(mock);
        p.listing("feed", "posts").page(4, 10);
        let outcome = p.exec().await;
        assert_eq!(
            outcome.slot("feed"),
            Some(&json!({
                "count": 0,
                "items": [],
                "page": 1,
                "pages": 0,
                "limit": 10,
            }))
        );
    }

    #[tokio::test]
    async fn compare_reports_differing_keys() {
        let mock = MockBackend::sql().reply(AdapterReply::Rows(vec![json!({
            "name": "ada",
            "role": "admin"
        })]));
        let mut p = sql_pipeline(mock);
        p.compare("same", "users", json!({"name": "ada", "role": "guest"}))
            .where_eq("id", 1);
        let outcome = p.exec().await;

        assert_eq!(
            outcome.slot("same"),
            Some(&json!({
                "diff": ["role"],
                "record": {"name": "ada", "role": "admin"},
                "value": {"name": "ada", "role": "guest"},
            }))
        );
    }

    #[tokio::test]
    async fn compare_matches_fold_to_false() {
        let mock = MockBackend::sql().reply(AdapterReply::Rows(vec![json!({"name": "ada"})]));
        let mut p = sql_pipeline(mock);
        p.compare("same", "users", json!({"name": "ada"}));
        let outcome = p.exec().await;
        assert_eq!(outcome.slot("same"), Some(&json!(false)));
    }

    #[tokio::test]
    async fn missing_compare_row_diffs_every_key() {
        let mut p = sql_pipeline(MockBackend::sql());
        p.compare("same", "users", json!({"a": 1, "b": 2}));
        let outcome = p.exec().await;
        assert_eq!(
            outcome.slot("same"),
            Some(&json!({
                "diff": ["a", "b"],
                "record": null,
                "value": {"a": 1, "b": 2},
            }))
        );
    }

    #[tokio::test]
    async fn scalar_folds_extract_the_alias() {
        let mock = MockBackend::sql()
            .reply(AdapterReply::Rows(vec![json!({"qcscalar": 7})]))
            .reply(AdapterReply::Rows(vec![json!({"qcscalar": "99"})]))
            .reply(AdapterReply::Rows(vec![]));
        let mut p = sql_pipeline(mock);
        p.count("total", "users");
        p.max("newest", "users", "id");
        p.exists("any", "users");
        let outcome = p.exec().await;

        assert_eq!(outcome.slot("total"), Some(&json!(7)));
        // string scalars normalize to numbers
        assert_eq!(outcome.slot("newest"), Some(&json!(99)));
        assert_eq!(outcome.slot("any"), Some(&json!(false)));
    }

    #[tokio::test]
    async fn document_exists_writes_false_for_missing_rows() {
        let mut p = Pipeline::new(Arc::new(MockBackend::document()));
        p.exists("present", "users").where_eq("name", "ada");
        let outcome = p.exec().await;
        assert_eq!(outcome.slot("present"), Some(&json!(false)));
    }

    #[tokio::test]
    async fn prepare_checkpoints_mutate_state_in_order() {
        let mut p = sql_pipeline(MockBackend::sql());
        p.prepare(|errors, results| {
            Box::pin(async move {
                if errors.is_empty() {
                    results.insert("stage".into(), json!({"id": 5}));
                }
                Ok(())
            })
        });
        p.select("rows", "items")
            .where_eq("stage_id", DeferredValue::slot_field("stage", "id"));
        let outcome = p.exec().await;

        assert!(outcome.ok(), "unexpected errors: {}", outcome.errors);
        let backend = p.backend().clone();
        let mock = backend.downcast_ref::<MockBackend>().unwrap();
        assert!(mock.statements()[0].contains("\"stage_id\"=5"));
    }

    #[tokio::test]
    async fn failing_checkpoint_aborts_outside_transactions() {
        let mut p = sql_pipeline(MockBackend::sql());
        p.bookmark(|_errors, _results| Err(ChainError::callback("nope")));
        p.select("rows", "users");
        let outcome = p.exec().await;

        assert_eq!(outcome.errors.len(), 1);
        let backend = p.backend().clone();
        let mock = backend.downcast_ref::<MockBackend>().unwrap();
        assert!(mock.statements().is_empty());
    }

    #[tokio::test]
    async fn modify_rewrites_the_result_map() {
        let mock = MockBackend::sql().reply(AdapterReply::Rows(vec![json!({"id": 1})]));
        let mut p = sql_pipeline(mock);
        p.select("rows", "users");
        p.modify(|results| {
            let total = results.len();
            results.insert("meta".into(), json!({ "slots": total }));
            Ok(())
        });
        let outcome = p.exec().await;
        assert_eq!(outcome.slot("meta"), Some(&json!({"slots": 1})));
    }

    #[tokio::test]
    async fn ifnot_runs_only_on_empty_slots() {
        let mock = MockBackend::sql().reply(AdapterReply::Rows(vec![]));
        let mut p = sql_pipeline(mock);
        p.select("user", "users").first();
        let fired = Arc::new(std::sync::Mutex::new(0));
        let counter = fired.clone();
        p.ifnot("user", move |_errors, results| {
            if let Ok(mut count) = counter.lock() {
                *count += 1;
            }
            results.insert("user".into(), json!({"id": 0, "fallback": true}));
            Ok(())
        });
        let counter = fired.clone();
        p.ifnot("user", move |_errors, _results| {
            if let Ok(mut count) = counter.lock() {
                *count += 1;
            }
            Ok(())
        });
        let outcome = p.exec().await;

        assert!(outcome.ok(), "unexpected errors: {}", outcome.errors);
        // the first gate filled the slot, the second saw content
        assert_eq!(*fired.lock().unwrap(), 1);
        assert_eq!(
            outcome.slot("user"),
            Some(&json!({"id": 0, "fallback": true}))
        );
    }

    #[tokio::test]
    async fn when_listeners_observe_the_stored_slot() {
        let mock = MockBackend::sql().reply(AdapterReply::Rows(vec![json!({"id": 3})]));
        let mut p = sql_pipeline(mock);
        let seen = Arc::new(std::sync::Mutex::new(None));
        let sink = seen.clone();
        p.when("rows", move |_errors, _results, value| {
            if let Ok(mut slot) = sink.lock() {
                *slot = Some(value.clone());
            }
        });
        p.select("rows", "users");
        let outcome = p.exec().await;

        assert!(outcome.ok(), "unexpected errors: {}", outcome.errors);
        assert_eq!(*seen.lock().unwrap(), Some(json!([{"id": 3}])));
    }

    #[tokio::test]
    async fn events_report_query_data_and_end() {
        let mut p = sql_pipeline(MockBackend::sql());
        let mut rx = p.events();
        p.select("rows", "users");
        let outcome = p.exec().await;
        assert!(outcome.ok(), "unexpected errors: {}", outcome.errors);

        match rx.try_recv().unwrap() {
            PipelineEvent::Query { name, query, .. } => {
                assert_eq!(name, "rows");
                assert!(query.starts_with("SELECT"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        match rx.try_recv().unwrap() {
            PipelineEvent::Data { name, results } => {
                assert_eq!(name, "rows");
                assert!(results.contains_key("rows"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        match rx.try_recv().unwrap() {
            PipelineEvent::End { errors, .. } => assert!(errors.is_empty()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn replaying_a_pipeline_runs_the_queue_again() {
        let mut p = sql_pipeline(MockBackend::sql());
        p.select("rows", "users");
        let first = p.exec().await;
        let second = p.exec().await;
        assert!(first.ok() && second.ok());
        let backend = p.backend().clone();
        let mock = backend.downcast_ref::<MockBackend>().unwrap();
        assert_eq!(mock.statements().len(), 2);
    }

    #[tokio::test]
    async fn replaying_an_unreset_insert_repeats_the_side_effect() {
        let mut p = sql_pipeline(MockBackend::sql());
        p.insert("created", "users").set("name", "ada");
        let first = p.exec().await;
        let second = p.exec().await;

        // Each run inserts again and pins a fresh identity.
        assert_eq!(first.slot("created"), Some(&json!({"identity": 1})));
        assert_eq!(second.slot("created"), Some(&json!({"identity": 2})));
        let backend = p.backend().clone();
        let mock = backend.downcast_ref::<MockBackend>().unwrap();
        let statements = mock.statements();
        assert_eq!(statements.len(), 2);
        assert!(statements.iter().all(|s| s.starts_with("INSERT")));
    }

    #[tokio::test]
    async fn duplicate_names_overwrite_in_queue_order() {
        let mock = MockBackend::sql()
            .reply(AdapterReply::Rows(vec![json!({"v": 1})]))
            .reply(AdapterReply::Rows(vec![json!({"v": 2})]));
        let mut p = sql_pipeline(mock);
        p.select("slot", "first_table").first();
        p.select("slot", "second_table").first();
        let outcome = p.exec().await;

        assert!(outcome.ok(), "unexpected errors: {}", outcome.errors);
        assert_eq!(outcome.slot("slot"), Some(&json!({"v": 2})));
    }

    #[tokio::test]
    async fn expected_wires_identity_across_three_steps() {
        let mut p = sql_pipeline(MockBackend::sql());
        p.insert("user", "users").set("name", "ada");
        p.update("touch", "users").set("active", true).where_eq("id", pin());
        let owner = p.expected("user", "identity");
        p.select("posts", "posts").where_eq("owner_id", owner);
        let outcome = p.exec().await;

        assert!(outcome.ok(), "unexpected errors: {}", outcome.errors);
        let backend = p.backend().clone();
        let mock = backend.downcast_ref::<MockBackend>().unwrap();
        let statements = mock.statements();
        assert_eq!(statements.len(), 3);
        assert!(statements[2].contains("\"owner_id\"=1"));
    }

    #[tokio::test]
    async fn grouped_count_folds_group_rows() {
        let mock = MockBackend::sql().reply(AdapterReply::Rows(vec![
            json!({"role": "admin", "qcscalar": 2}),
            json!({"role": "guest", "qcscalar": 5}),
        ]));
        let mut p = sql_pipeline(mock);
        p.count("by_role", "users").group_by(&["role"]);
        let outcome = p.exec().await;

        // A grouped count reports the number of groups.
        assert_eq!(outcome.slot("by_role"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn validate_absent_guards_inserts() {
        let mock = MockBackend::sql().reply(AdapterReply::Rows(vec![json!({"id": 1})]));
        let mut p = sql_pipeline(mock);
        p.select("existing", "users").where_eq("name", "ada").first();
        p.validate_absent("existing", Some("name already taken"));
        p.insert("created", "users").set("name", "ada");
        let outcome = p.exec().await;

        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(
            outcome.errors.first().map(|e| e.error.to_string()),
            Some("validation failed: name already taken".to_string())
        );
        assert!(outcome.slot("created").is_none());

        // With no matching row the guard passes and the insert runs.
        let mut p = sql_pipeline(MockBackend::sql());
        p.select("existing", "users").where_eq("name", "ada").first();
        p.validate_absent("existing", Some("name already taken"));
        p.insert("created", "users").set("name", "ada");
        let outcome = p.exec().await;
        assert!(outcome.ok(), "unexpected errors: {}", outcome.errors);
        assert!(outcome.slot("created").is_some());
    }

    #[tokio::test]
    async fn raw_queries_carry_bind_parameters() {
        let mut p = sql_pipeline(MockBackend::sql());
        let mut rx = p.events();
        p.query("recent", "SELECT * FROM logs", vec![json!("error")])
            .take(5);
        let outcome = p.exec().await;
        assert!(outcome.ok(), "unexpected errors: {}", outcome.errors);
        match rx.try_recv().unwrap() {
            PipelineEvent::Query { query, params, .. } => {
                assert_eq!(query, "SELECT * FROM logs LIMIT 5");
                assert_eq!(params, vec![json!("error")]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn end_without_begin_is_harmless() {
        let mut p = sql_pipeline(MockBackend::sql());
        p.end();
        p.select("rows", "users");
        let outcome = p.exec().await;
        assert!(outcome.ok(), "unexpected errors: {}", outcome.errors);
        assert!(outcome.slot("rows").is_some());
    }

    #[tokio::test]
    async fn into_result_surfaces_the_first_error() {
        let mock = MockBackend::sql().fail_on("SELECT");
        let mut p = sql_pipeline(mock);
        p.select("rows", "users");
        let outcome = p.exec().await;
        let err = outcome.into_result().unwrap_err();
        assert!(matches!(err, ChainError::Backend(_)));
    }
}
