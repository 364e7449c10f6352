//! SQL dialects and statement rendering.
//!
//! A [`SqlDialect`] captures the syntax differences between SQL servers:
//! identifier quoting, boolean literals, paging clauses, random ordering
//! and identity retrieval. Each dialect instance owns its
//! [`ColumnCache`]. The render functions turn a command's
//! [`ConditionBuilder`] into a [`SqlStatement`] with literals inlined
//! and escaped; only raw queries carry bind parameters through.

use serde_json::Value;

use crate::builder::{Assignment, ConditionBuilder, IncOp, Join, Like, Node, Test};
use crate::column::ColumnCache;
use crate::command::{ReadKind, ScalarKind};
use crate::deferred::DeferredContext;
use crate::error::{ChainError, Result};

/// Alias under which scalar reads (count, max, min, avg, exists) are
/// selected so folding can find the value by name.
pub const SCALAR_ALIAS: &str = "qcscalar";

/// How the adapter should run a statement and read its outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SqlShape {
    /// Rows come back; fetch them all.
    Rows,
    /// No rows; report the affected-row count.
    Affected,
    /// Insert; report the generated identity.
    Inserted,
}

/// A rendered SQL statement.
#[derive(Clone, Debug)]
pub struct SqlStatement {
    pub text: String,
    /// Bind parameters, populated only for raw queries.
    pub params: Vec<Value>,
    pub shape: SqlShape,
}

/// Paging clause description returned by a dialect.
#[derive(Clone, Debug, Default)]
pub struct Paging {
    /// Row cap injected right after SELECT (`TOP n`).
    pub top: Option<u64>,
    /// Clause appended after ORDER BY.
    pub tail: Option<String>,
    /// True when the tail is only valid after an ORDER BY clause.
    pub requires_order: bool,
}

/// Syntax profile for one SQL server family.
pub trait SqlDialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Quote a single identifier segment.
    fn quote(&self, ident: &str) -> String;

    /// Literal for a boolean value.
    fn boolean(&self, value: bool) -> &'static str;

    /// Expression that orders rows randomly.
    fn random_function(&self) -> &'static str;

    /// Paging clause for a skip/take pair. A take of zero means
    /// unbounded.
    fn paging(&self, skip: u64, take: u64) -> Paging;

    /// Statement tail that returns the generated identity of an insert,
    /// if the dialect has one.
    fn insert_tail(&self, primary: &str) -> Option<String>;

    /// Aggregate expression for AVG. Dialects override this when the
    /// natural result type does not convert cleanly to a float.
    fn avg_expr(&self, column: &str) -> String {
        format!("AVG({})", column)
    }

    fn cache(&self) -> &ColumnCache;
}

/// PostgreSQL syntax.
#[derive(Default)]
pub struct PostgresDialect {
    cache: ColumnCache,
}

impl PostgresDialect {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn quote(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn boolean(&self, value: bool) -> &'static str {
        if value {
            "TRUE"
        } else {
            "FALSE"
        }
    }

    fn random_function(&self) -> &'static str {
        "RANDOM()"
    }

    fn paging(&self, skip: u64, take: u64) -> Paging {
        let mut tail = String::new();
        if take > 0 {
            tail.push_str(&format!("LIMIT {}", take));
        }
        if skip > 0 {
            if !tail.is_empty() {
                tail.push(' ');
            }
            tail.push_str(&format!("OFFSET {}", skip));
        }
        Paging {
            top: None,
            tail: (!tail.is_empty()).then_some(tail),
            requires_order: false,
        }
    }

    fn insert_tail(&self, primary: &str) -> Option<String> {
        Some(format!(" RETURNING {}", self.quote(primary)))
    }

    // AVG over integer columns comes back as NUMERIC, which has no
    // float wire conversion.
    fn avg_expr(&self, column: &str) -> String {
        format!("CAST(AVG({}) AS DOUBLE PRECISION)", column)
    }

    fn cache(&self) -> &ColumnCache {
        &self.cache
    }
}

/// MySQL / MariaDB syntax.
#[derive(Default)]
pub struct MySqlDialect {
    cache: ColumnCache,
}

impl MySqlDialect {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SqlDialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quote(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn boolean(&self, value: bool) -> &'static str {
        if value {
            "1"
        } else {
            "0"
        }
    }

    fn random_function(&self) -> &'static str {
        "RAND()"
    }

    fn paging(&self, skip: u64, take: u64) -> Paging {
        let tail = match (skip, take) {
            (0, 0) => None,
            (0, take) => Some(format!("LIMIT {}", take)),
            (skip, 0) => Some(format!("LIMIT {},18446744073709551615", skip)),
            (skip, take) => Some(format!("LIMIT {},{}", skip, take)),
        };
        Paging {
            top: None,
            tail,
            requires_order: false,
        }
    }

    fn insert_tail(&self, _primary: &str) -> Option<String> {
        None
    }

    fn cache(&self) -> &ColumnCache {
        &self.cache
    }
}

/// SQL Server syntax.
#[derive(Default)]
pub struct SqlServerDialect {
    cache: ColumnCache,
}

impl SqlServerDialect {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SqlDialect for SqlServerDialect {
    fn name(&self) -> &'static str {
        "sqlserver"
    }

    fn quote(&self, ident: &str) -> String {
        format!("[{}]", ident.replace(']', "]]"))
    }

    fn boolean(&self, value: bool) -> &'static str {
        if value {
            "1"
        } else {
            "0"
        }
    }

    fn random_function(&self) -> &'static str {
        "NEWID()"
    }

    fn paging(&self, skip: u64, take: u64) -> Paging {
        if skip == 0 {
            return Paging {
                top: (take > 0).then_some(take),
                tail: None,
                requires_order: false,
            };
        }
        let mut tail = format!("OFFSET {} ROWS", skip);
        if take > 0 {
            tail.push_str(&format!(" FETCH NEXT {} ROWS ONLY", take));
        }
        Paging {
            top: None,
            tail: Some(tail),
            requires_order: true,
        }
    }

    fn insert_tail(&self, _primary: &str) -> Option<String> {
        Some("; SELECT SCOPE_IDENTITY() AS qcidentity".to_string())
    }

    fn cache(&self) -> &ColumnCache {
        &self.cache
    }
}

/// Quote a possibly dotted identifier path, leaving `*` segments alone.
fn quote_path(d: &dyn SqlDialect, ident: &str) -> String {
    if ident == "*" {
        return "*".to_string();
    }
    ident
        .split('.')
        .map(|part| {
            if part == "*" {
                "*".to_string()
            } else {
                d.quote(part)
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Render a projection entry, honoring `!` raw and `as` alias syntax.
fn render_column(d: &dyn SqlDialect, raw: &str) -> String {
    let parsed = d.cache().column(raw);
    if parsed.raw {
        return parsed.column;
    }
    let quoted = quote_path(d, &parsed.column);
    match parsed.alias {
        Some(alias) => format!("{} AS {}", quoted, quote_path(d, &alias)),
        None => quoted,
    }
}

/// Render a predicate column, honoring `!` raw syntax.
fn predicate_column(d: &dyn SqlDialect, raw: &str) -> String {
    let parsed = d.cache().column(raw);
    if parsed.raw {
        parsed.column
    } else {
        quote_path(d, &parsed.column)
    }
}

/// Escape a JSON value into a SQL literal.
fn escape_literal(d: &dyn SqlDialect, value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => d.boolean(*b).to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Array(items) => {
            let inner = items
                .iter()
                .map(|v| escape_literal(d, v))
                .collect::<Vec<_>>()
                .join(",");
            format!("({})", inner)
        }
        Value::Object(_) => format!("'{}'", value.to_string().replace('\'', "''")),
    }
}

fn pattern_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

fn connector(join: Join) -> &'static str {
    match join {
        Join::And => " AND ",
        Join::Or => " OR ",
    }
}

/// Render predicate nodes into a WHERE body. Empty when every node
/// rendered as a no-op.
fn render_nodes(d: &dyn SqlDialect, nodes: &[Node], ctx: &DeferredContext<'_>) -> String {
    let mut out = String::new();
    for node in nodes {
        let (join, fragment) = match node {
            Node::Test { join, field, test } => (*join, render_test(d, field, test, ctx)),
            Node::Group { join, nodes } => {
                let inner = render_nodes(d, nodes, ctx);
                if inner.is_empty() {
                    (*join, String::new())
                } else {
                    (*join, format!("({})", inner))
                }
            }
            Node::RawSql { join, text } => (*join, text.clone()),
            Node::RawDoc { join, .. } => (*join, String::new()),
        };
        if fragment.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push_str(connector(join));
        }
        out.push_str(&fragment);
    }
    out
}

fn render_test(d: &dyn SqlDialect, field: &str, test: &Test, ctx: &DeferredContext<'_>) -> String {
    let column = predicate_column(d, field);
    match test {
        Test::Cmp(op, arg) => {
            let value = arg.resolve(ctx);
            format!("{}{}{}", column, op.sql(), escape_literal(d, &value))
        }
        Test::In(args) => {
            let members = splice_in_members(args, ctx);
            if members.is_empty() {
                return String::new();
            }
            let list = members
                .iter()
                .map(|v| escape_literal(d, v))
                .collect::<Vec<_>>()
                .join(",");
            format!("{} IN ({})", column, list)
        }
        Test::Like(like, arg) => {
            let text = pattern_text(&arg.resolve(ctx));
            let pattern = match like {
                Like::Begins => format!("{}%", text),
                Like::Ends => format!("%{}", text),
                Like::Contains => format!("%{}%", text),
            };
            format!(
                "{} LIKE {}",
                column,
                escape_literal(d, &Value::String(pattern))
            )
        }
        Test::Between(low, high) => {
            format!(
                "{} BETWEEN {} AND {}",
                column,
                escape_literal(d, &low.resolve(ctx)),
                escape_literal(d, &high.resolve(ctx))
            )
        }
    }
}

/// Resolve an IN list, splicing a single element that resolves to an
/// array into the member list.
pub(crate) fn splice_in_members(
    args: &[crate::value::Arg],
    ctx: &DeferredContext<'_>,
) -> Vec<Value> {
    if args.len() == 1 {
        if let Value::Array(items) = args[0].resolve(ctx) {
            return items;
        }
    }
    args.iter().map(|a| a.resolve(ctx)).collect()
}

fn render_order(d: &dyn SqlDialect, b: &ConditionBuilder) -> Option<String> {
    if b.random {
        return Some(format!("ORDER BY {}", d.random_function()));
    }
    if b.sorts.is_empty() {
        return None;
    }
    let keys = b
        .sorts
        .iter()
        .map(|key| {
            let parsed = d.cache().sort(&key.raw);
            let desc = parsed.desc.unwrap_or(key.desc);
            format!(
                "{} {}",
                quote_path(d, &parsed.column),
                if desc { "DESC" } else { "ASC" }
            )
        })
        .collect::<Vec<_>>()
        .join(",");
    Some(format!("ORDER BY {}", keys))
}

fn table_name(d: &dyn SqlDialect, b: &ConditionBuilder, target: &str) -> String {
    match &b.schema {
        Some(schema) => format!("{}.{}", d.quote(schema), quote_path(d, target)),
        None => quote_path(d, target),
    }
}

fn projection(d: &dyn SqlDialect, b: &ConditionBuilder) -> String {
    let columns = b
        .projection
        .iter()
        .filter(|(_, visible)| *visible)
        .map(|(name, _)| render_column(d, name))
        .collect::<Vec<_>>();
    if columns.is_empty() {
        "*".to_string()
    } else {
        columns.join(",")
    }
}

fn scalar_target(d: &dyn SqlDialect, raw: &str) -> String {
    let parsed = d.cache().column(raw);
    if parsed.raw {
        parsed.column
    } else {
        quote_path(d, &parsed.column)
    }
}

/// Render a read command.
pub(crate) fn render_select(
    d: &dyn SqlDialect,
    b: &ConditionBuilder,
    target: &str,
    read: &ReadKind,
    ctx: &DeferredContext<'_>,
) -> Result<SqlStatement> {
    let scalar = matches!(read, ReadKind::Scalar(_));
    let columns = match read {
        ReadKind::Scalar(ScalarKind::Count) => format!("COUNT(*) AS {}", SCALAR_ALIAS),
        ReadKind::Scalar(ScalarKind::Max(col)) => {
            format!("MAX({}) AS {}", scalar_target(d, col), SCALAR_ALIAS)
        }
        ReadKind::Scalar(ScalarKind::Min(col)) => {
            format!("MIN({}) AS {}", scalar_target(d, col), SCALAR_ALIAS)
        }
        ReadKind::Scalar(ScalarKind::Avg(col)) => {
            format!("{} AS {}", d.avg_expr(&scalar_target(d, col)), SCALAR_ALIAS)
        }
        ReadKind::Scalar(ScalarKind::Exists) => format!("1 AS {}", SCALAR_ALIAS),
        _ => projection(d, b),
    };

    // Exists still pages (the builder caps it at one row); the other
    // scalars aggregate and take neither ordering nor paging.
    let paged = !scalar || matches!(read, ReadKind::Scalar(ScalarKind::Exists));

    let mut text = String::from("SELECT ");
    let paging = if paged {
        d.paging(b.skip, b.take)
    } else {
        Paging::default()
    };
    if let Some(top) = paging.top {
        text.push_str(&format!("TOP {} ", top));
    }
    text.push_str(&columns);
    text.push_str(" FROM ");
    text.push_str(&table_name(d, b, target));
    for join in &b.joins {
        text.push(' ');
        text.push_str(join);
    }
    let where_body = render_nodes(d, &b.nodes, ctx);
    if !where_body.is_empty() {
        text.push_str(" WHERE ");
        text.push_str(&where_body);
    }
    if !b.groups.is_empty() {
        let groups = b
            .groups
            .iter()
            .map(|g| quote_path(d, g))
            .collect::<Vec<_>>()
            .join(",");
        text.push_str(" GROUP BY ");
        text.push_str(&groups);
    }
    if let Some(having) = &b.having_clause {
        text.push_str(" HAVING ");
        text.push_str(having);
    }
    let order = if paged { render_order(d, b) } else { None };
    if let Some(order) = &order {
        text.push(' ');
        text.push_str(order);
    }
    if let Some(tail) = paging.tail {
        if paging.requires_order && order.is_none() {
            text.push_str(" ORDER BY 1");
        }
        text.push(' ');
        text.push_str(&tail);
    }

    Ok(SqlStatement {
        text,
        params: Vec::new(),
        shape: SqlShape::Rows,
    })
}

/// Render an insert from the builder's assignments.
pub(crate) fn render_insert(
    d: &dyn SqlDialect,
    b: &ConditionBuilder,
    target: &str,
    ctx: &DeferredContext<'_>,
) -> Result<SqlStatement> {
    let mut columns = Vec::new();
    let mut values = Vec::new();
    for assignment in &b.assignments {
        match assignment {
            Assignment::Set { field, value } => {
                columns.push(quote_path(d, field));
                values.push(escape_literal(d, &value.resolve(ctx)));
            }
            // On insert an increment contributes its starting amount.
            Assignment::Inc { field, op, value } => {
                let mut amount = value.resolve(ctx);
                if *op == IncOp::Sub {
                    amount = crate::value::negate_number(amount);
                }
                columns.push(quote_path(d, field));
                values.push(escape_literal(d, &amount));
            }
            Assignment::Raw { field, expr } => {
                columns.push(quote_path(d, field));
                values.push(expr.clone());
            }
        }
    }
    if columns.is_empty() {
        return Err(ChainError::invalid_value("insert requires at least one value"));
    }
    let mut text = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table_name(d, b, target),
        columns.join(","),
        values.join(",")
    );
    if let Some(tail) = d.insert_tail(&b.primary) {
        text.push_str(&tail);
    }
    Ok(SqlStatement {
        text,
        params: Vec::new(),
        shape: SqlShape::Inserted,
    })
}

/// Render an update. Zero-amount increments are dropped; an update
/// whose every assignment dropped is an error.
pub(crate) fn render_update(
    d: &dyn SqlDialect,
    b: &ConditionBuilder,
    target: &str,
    ctx: &DeferredContext<'_>,
) -> Result<SqlStatement> {
    let mut sets = Vec::new();
    for assignment in &b.assignments {
        match assignment {
            Assignment::Set { field, value } => {
                let column = quote_path(d, field);
                sets.push(format!(
                    "{}={}",
                    column,
                    escape_literal(d, &value.resolve(ctx))
                ));
            }
            Assignment::Inc { field, op, value } => {
                let amount = value.resolve(ctx);
                if crate::value::is_zero_number(&amount) {
                    continue;
                }
                let column = quote_path(d, field);
                sets.push(format!(
                    "{}={}{}{}",
                    column,
                    column,
                    op.symbol(),
                    escape_literal(d, &amount)
                ));
            }
            Assignment::Raw { field, expr } => {
                sets.push(format!("{}={}", quote_path(d, field), expr));
            }
        }
    }
    if sets.is_empty() {
        return Err(ChainError::invalid_value(
            "update requires at least one assignment",
        ));
    }
    let mut text = format!("UPDATE {} SET {}", table_name(d, b, target), sets.join(","));
    let where_body = render_nodes(d, &b.nodes, ctx);
    if !where_body.is_empty() {
        text.push_str(" WHERE ");
        text.push_str(&where_body);
    }
    Ok(SqlStatement {
        text,
        params: Vec::new(),
        shape: SqlShape::Affected,
    })
}

pub(crate) fn render_delete(
    d: &dyn SqlDialect,
    b: &ConditionBuilder,
    target: &str,
    ctx: &DeferredContext<'_>,
) -> Result<SqlStatement> {
    let mut text = format!("DELETE FROM {}", table_name(d, b, target));
    let where_body = render_nodes(d, &b.nodes, ctx);
    if !where_body.is_empty() {
        text.push_str(" WHERE ");
        text.push_str(&where_body);
    }
    Ok(SqlStatement {
        text,
        params: Vec::new(),
        shape: SqlShape::Affected,
    })
}

/// Render a raw query. Builder predicates, ordering and paging are
/// appended to the given text; bind parameters pass through untouched.
pub(crate) fn render_raw(
    d: &dyn SqlDialect,
    b: &ConditionBuilder,
    sql: &str,
    params: &[Value],
    ctx: &DeferredContext<'_>,
) -> Result<SqlStatement> {
    let mut text = sql.to_string();
    let where_body = render_nodes(d, &b.nodes, ctx);
    if !where_body.is_empty() {
        text.push_str(" WHERE ");
        text.push_str(&where_body);
    }
    let order = render_order(d, b);
    if let Some(order) = &order {
        text.push(' ');
        text.push_str(order);
    }
    let paging = d.paging(b.skip, b.take);
    if let Some(tail) = paging.tail {
        if paging.requires_order && order.is_none() {
            text.push_str(" ORDER BY 1");
        }
        text.push(' ');
        text.push_str(&tail);
    }
    Ok(SqlStatement {
        text,
        params: params.to_vec(),
        shape: SqlShape::Rows,
    })
}
