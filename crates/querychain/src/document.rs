//! Document statement rendering for MongoDB-style backends.
//!
//! The same [`ConditionBuilder`] that feeds SQL renderers is turned
//! into filter and update documents here. SQL-only features (raw SQL
//! fragments, raw expression assignments, joins, grouping) are skipped
//! with a log line rather than rejected, so one pipeline definition can
//! run against either backend family.

use serde_json::{json, Map, Value};

use crate::builder::{Assignment, ConditionBuilder, IncOp, Join, Like, Node, Test};
use crate::column::parse_sort;
use crate::command::{ReadKind, ScalarKind};
use crate::deferred::DeferredContext;
use crate::dialect::splice_in_members;
use crate::error::{ChainError, Result};

/// Collection operation an adapter should perform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocOp {
    Find,
    FindOne,
    Count,
    InsertOne,
    UpdateOne,
    UpdateMany,
    DeleteOne,
    DeleteMany,
}

/// Cursor modifiers for find operations.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FindOptions {
    pub projection: Option<Value>,
    pub sort: Option<Value>,
    pub skip: Option<u64>,
    pub limit: Option<i64>,
}

/// A rendered document-store operation.
#[derive(Clone, Debug)]
pub struct DocumentStatement {
    pub op: DocOp,
    /// Collection name.
    pub target: String,
    pub filter: Value,
    /// Insert document or update document, depending on the operation.
    pub update: Option<Value>,
    pub options: FindOptions,
}

fn op_filter(op: crate::builder::Op, value: Value) -> Value {
    match op.mongo() {
        None => value,
        Some(key) => json!({ key: value }),
    }
}

fn node_filter(node: &Node, ctx: &DeferredContext<'_>) -> Option<(Join, Value)> {
    match node {
        Node::Test { join, field, test } => {
            let body = match test {
                Test::Cmp(op, arg) => op_filter(*op, arg.resolve(ctx)),
                Test::In(args) => json!({ "$in": splice_in_members(args, ctx) }),
                Test::Like(like, arg) => {
                    let text = match arg.resolve(ctx) {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    let pattern = match like {
                        Like::Begins => format!("^{}", text),
                        Like::Ends => format!("{}$", text),
                        Like::Contains => text,
                    };
                    json!({ "$regex": pattern })
                }
                Test::Between(low, high) => json!({
                    "$gte": low.resolve(ctx),
                    "$lte": high.resolve(ctx),
                }),
            };
            Some((*join, json!({ field.clone(): body })))
        }
        Node::Group { join, nodes } => {
            let inner = combine(collect_filters(nodes, ctx));
            if matches!(&inner, Value::Object(map) if map.is_empty()) {
                None
            } else {
                Some((*join, inner))
            }
        }
        Node::RawDoc { join, value } => Some((*join, value.clone())),
        Node::RawSql { .. } => {
            tracing::debug!("raw sql fragment skipped by document renderer");
            None
        }
    }
}

fn collect_filters(nodes: &[Node], ctx: &DeferredContext<'_>) -> Vec<(Join, Value)> {
    nodes.iter().filter_map(|n| node_filter(n, ctx)).collect()
}

/// Combine node filters: any OR connector lifts the whole set into an
/// `$or` array, otherwise filters merge into one document, falling back
/// to `$and` when two filters constrain the same field.
fn combine(parts: Vec<(Join, Value)>) -> Value {
    if parts.is_empty() {
        return json!({});
    }
    if parts.len() == 1 {
        return parts.into_iter().map(|(_, v)| v).next().unwrap_or(json!({}));
    }
    let any_or = parts.iter().skip(1).any(|(join, _)| *join == Join::Or);
    if any_or {
        let items: Vec<Value> = parts.into_iter().map(|(_, v)| v).collect();
        return json!({ "$or": items });
    }
    let mut merged = Map::new();
    let mut collision = false;
    'merge: for (_, part) in &parts {
        let map = match part {
            Value::Object(map) => map,
            _ => {
                collision = true;
                break 'merge;
            }
        };
        for (key, value) in map {
            if merged.contains_key(key) {
                collision = true;
                break 'merge;
            }
            merged.insert(key.clone(), value.clone());
        }
    }
    if collision {
        let items: Vec<Value> = parts.into_iter().map(|(_, v)| v).collect();
        return json!({ "$and": items });
    }
    Value::Object(merged)
}

pub(crate) fn render_filter(b: &ConditionBuilder, ctx: &DeferredContext<'_>) -> Value {
    combine(collect_filters(&b.nodes, ctx))
}

fn sort_doc(b: &ConditionBuilder) -> Option<Value> {
    if b.random {
        tracing::warn!("random ordering is ignored on document backends");
    }
    if b.sorts.is_empty() {
        return None;
    }
    let mut doc = Map::new();
    for key in &b.sorts {
        let parsed = parse_sort(&key.raw);
        let desc = parsed.desc.unwrap_or(key.desc);
        doc.insert(parsed.column, json!(if desc { -1 } else { 1 }));
    }
    Some(Value::Object(doc))
}

fn projection_doc(b: &ConditionBuilder) -> Option<Value> {
    if b.projection.is_empty() {
        return None;
    }
    let mut doc = Map::new();
    for (name, visible) in &b.projection {
        doc.insert(name.clone(), json!(if *visible { 1 } else { 0 }));
    }
    Some(Value::Object(doc))
}

fn find_options(b: &ConditionBuilder) -> FindOptions {
    FindOptions {
        projection: projection_doc(b),
        sort: sort_doc(b),
        skip: (b.skip > 0).then_some(b.skip),
        limit: (b.take > 0).then_some(b.take as i64),
    }
}

/// Render a read command against a collection.
pub(crate) fn render_find(
    b: &ConditionBuilder,
    target: &str,
    read: &ReadKind,
    ctx: &DeferredContext<'_>,
) -> Result<DocumentStatement> {
    let filter = render_filter(b, ctx);
    let statement = |op: DocOp, options: FindOptions| DocumentStatement {
        op,
        target: target.to_string(),
        filter: filter.clone(),
        update: None,
        options,
    };
    match read {
        ReadKind::Rows | ReadKind::Listing => {
            if b.single {
                Ok(statement(
                    DocOp::FindOne,
                    FindOptions {
                        projection: projection_doc(b),
                        ..FindOptions::default()
                    },
                ))
            } else {
                Ok(statement(DocOp::Find, find_options(b)))
            }
        }
        ReadKind::Compare(_) => Ok(statement(DocOp::FindOne, FindOptions::default())),
        ReadKind::Scalar(ScalarKind::Count) => {
            Ok(statement(DocOp::Count, FindOptions::default()))
        }
        ReadKind::Scalar(ScalarKind::Exists) => Ok(statement(
            DocOp::FindOne,
            FindOptions {
                projection: Some(json!({ "_id": 1 })),
                ..FindOptions::default()
            },
        )),
        ReadKind::Scalar(ScalarKind::Max(col)) => Ok(statement(
            DocOp::Find,
            FindOptions {
                projection: Some(json!({ col.clone(): 1 })),
                sort: Some(json!({ col.clone(): -1 })),
                skip: None,
                limit: Some(1),
            },
        )),
        ReadKind::Scalar(ScalarKind::Min(col)) => Ok(statement(
            DocOp::Find,
            FindOptions {
                projection: Some(json!({ col.clone(): 1 })),
                sort: Some(json!({ col.clone(): 1 })),
                skip: None,
                limit: Some(1),
            },
        )),
        ReadKind::Scalar(ScalarKind::Avg(_)) => Err(ChainError::unsupported(
            "document",
            "avg aggregation",
        )),
    }
}

/// Render an insert document.
pub(crate) fn render_insert_doc(
    b: &ConditionBuilder,
    target: &str,
    ctx: &DeferredContext<'_>,
) -> Result<DocumentStatement> {
    let mut doc = Map::new();
    for assignment in &b.assignments {
        match assignment {
            Assignment::Set { field, value } => {
                doc.insert(field.clone(), value.resolve(ctx));
            }
            Assignment::Inc { field, op, value } => {
                let mut amount = value.resolve(ctx);
                if *op == IncOp::Sub {
                    amount = crate::value::negate_number(amount);
                }
                doc.insert(field.clone(), amount);
            }
            Assignment::Raw { field, .. } => {
                tracing::debug!(field = %field, "raw assignment skipped by document renderer");
            }
        }
    }
    if doc.is_empty() {
        return Err(ChainError::invalid_value("insert requires at least one value"));
    }
    Ok(DocumentStatement {
        op: DocOp::InsertOne,
        target: target.to_string(),
        filter: json!({}),
        update: Some(Value::Object(doc)),
        options: FindOptions::default(),
    })
}

/// Render an update document (`$set` / `$inc` / `$mul`).
pub(crate) fn render_update_doc(
    b: &ConditionBuilder,
    target: &str,
    ctx: &DeferredContext<'_>,
) -> Result<DocumentStatement> {
    let mut set = Map::new();
    let mut inc = Map::new();
    let mut mul = Map::new();
    for assignment in &b.assignments {
        match assignment {
            Assignment::Set { field, value } => {
                set.insert(field.clone(), value.resolve(ctx));
            }
            Assignment::Inc { field, op, value } => {
                let amount = value.resolve(ctx);
                if crate::value::is_zero_number(&amount) {
                    continue;
                }
                match op {
                    IncOp::Add => {
                        inc.insert(field.clone(), amount);
                    }
                    IncOp::Sub => {
                        inc.insert(field.clone(), crate::value::negate_number(amount));
                    }
                    IncOp::Mul => {
                        mul.insert(field.clone(), amount);
                    }
                    IncOp::Div => {
                        tracing::warn!(field = %field, "division increment skipped by document renderer");
                    }
                }
            }
            Assignment::Raw { field, .. } => {
                tracing::debug!(field = %field, "raw assignment skipped by document renderer");
            }
        }
    }
    let mut update = Map::new();
    if !set.is_empty() {
        update.insert("$set".to_string(), Value::Object(set));
    }
    if !inc.is_empty() {
        update.insert("$inc".to_string(), Value::Object(inc));
    }
    if !mul.is_empty() {
        update.insert("$mul".to_string(), Value::Object(mul));
    }
    if update.is_empty() {
        return Err(ChainError::invalid_value(
            "update requires at least one assignment",
        ));
    }
    Ok(DocumentStatement {
        op: if b.single {
            DocOp::UpdateOne
        } else {
            DocOp::UpdateMany
        },
        target: target.to_string(),
        filter: render_filter(b, ctx),
        update: Some(Value::Object(update)),
        options: FindOptions::default(),
    })
}

pub(crate) fn render_delete_doc(
    b: &ConditionBuilder,
    target: &str,
    ctx: &DeferredContext<'_>,
) -> Result<DocumentStatement> {
    Ok(DocumentStatement {
        op: if b.single {
            DocOp::DeleteOne
        } else {
            DocOp::DeleteMany
        },
        target: target.to_string(),
        filter: render_filter(b, ctx),
        update: None,
        options: FindOptions::default(),
    })
}
