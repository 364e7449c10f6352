//! Fluent condition builder attached to data commands.
//!
//! A [`ConditionBuilder`] accumulates predicates, sort keys, paging,
//! projections and assignments. It never talks to a backend itself; the
//! executor hands it to the dialect or document renderer when the owning
//! command runs, so deferred arguments resolve against up-to-date run
//! state.

use serde_json::Value;

use crate::value::Arg;

/// Comparison operators for [`ConditionBuilder::push`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
}

impl Op {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Ne => "<>",
            Op::Gt => ">",
            Op::Lt => "<",
            Op::Gte => ">=",
            Op::Lte => "<=",
        }
    }

    pub(crate) fn mongo(self) -> Option<&'static str> {
        match self {
            Op::Eq => None,
            Op::Ne => Some("$ne"),
            Op::Gt => Some("$gt"),
            Op::Lt => Some("$lt"),
            Op::Gte => Some("$gte"),
            Op::Lte => Some("$lte"),
        }
    }
}

/// Pattern-match variants for the `like` family of predicates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Like {
    Begins,
    Ends,
    Contains,
}

/// Connector between adjacent predicates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Join {
    And,
    Or,
}

#[derive(Clone, Debug)]
pub(crate) enum Test {
    Cmp(Op, Arg),
    In(Vec<Arg>),
    Like(Like, Arg),
    Between(Arg, Arg),
}

#[derive(Clone, Debug)]
pub(crate) enum Node {
    Test {
        join: Join,
        field: String,
        test: Test,
    },
    Group {
        join: Join,
        nodes: Vec<Node>,
    },
    RawSql {
        join: Join,
        text: String,
    },
    RawDoc {
        join: Join,
        value: Value,
    },
}

/// Increment operators accepted through field or value sigils.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IncOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl IncOp {
    pub(crate) fn symbol(self) -> char {
        match self {
            IncOp::Add => '+',
            IncOp::Sub => '-',
            IncOp::Mul => '*',
            IncOp::Div => '/',
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) enum Assignment {
    Set { field: String, value: Arg },
    Inc { field: String, op: IncOp, value: Arg },
    Raw { field: String, expr: String },
}

#[derive(Clone, Debug)]
pub(crate) struct SortKey {
    pub raw: String,
    /// Direction requested by the method; an `asc`/`desc` suffix in the
    /// expression itself wins over this.
    pub desc: bool,
}

/// Predicates, paging, projection and assignments for one command.
#[derive(Clone, Debug)]
pub struct ConditionBuilder {
    pub(crate) nodes: Vec<Node>,
    pub(crate) assignments: Vec<Assignment>,
    pub(crate) sorts: Vec<SortKey>,
    pub(crate) projection: Vec<(String, bool)>,
    pub(crate) joins: Vec<String>,
    pub(crate) groups: Vec<String>,
    pub(crate) having_clause: Option<String>,
    pub(crate) schema: Option<String>,
    pub(crate) primary: String,
    pub(crate) skip: u64,
    pub(crate) take: u64,
    pub(crate) single: bool,
    pub(crate) random: bool,
    join: Join,
}

impl Default for ConditionBuilder {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            assignments: Vec::new(),
            sorts: Vec::new(),
            projection: Vec::new(),
            joins: Vec::new(),
            groups: Vec::new(),
            having_clause: None,
            schema: None,
            primary: "id".to_string(),
            skip: 0,
            take: 0,
            single: false,
            random: false,
            join: Join::And,
        }
    }
}

impl ConditionBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a comparison predicate.
    pub fn push(&mut self, field: &str, op: Op, value: impl Into<Arg>) -> &mut Self {
        let join = self.join;
        self.nodes.push(Node::Test {
            join,
            field: field.to_string(),
            test: Test::Cmp(op, value.into()),
        });
        self
    }

    /// Equality shorthand for [`push`](Self::push).
    pub fn where_eq(&mut self, field: &str, value: impl Into<Arg>) -> &mut Self {
        self.push(field, Op::Eq, value)
    }

    /// Membership predicate. An empty list renders as a no-op on SQL
    /// backends. A single deferred element that resolves to an array is
    /// spliced into the member list.
    pub fn where_in<I, T>(&mut self, field: &str, values: I) -> &mut Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Arg>,
    {
        let join = self.join;
        self.nodes.push(Node::Test {
            join,
            field: field.to_string(),
            test: Test::In(values.into_iter().map(Into::into).collect()),
        });
        self
    }

    /// Prefix pattern match (`value%`).
    pub fn begins_with(&mut self, field: &str, value: impl Into<Arg>) -> &mut Self {
        self.like(field, Like::Begins, value)
    }

    /// Suffix pattern match (`%value`).
    pub fn ends_with(&mut self, field: &str, value: impl Into<Arg>) -> &mut Self {
        self.like(field, Like::Ends, value)
    }

    /// Substring pattern match (`%value%`).
    pub fn contains(&mut self, field: &str, value: impl Into<Arg>) -> &mut Self {
        self.like(field, Like::Contains, value)
    }

    fn like(&mut self, field: &str, like: Like, value: impl Into<Arg>) -> &mut Self {
        let join = self.join;
        self.nodes.push(Node::Test {
            join,
            field: field.to_string(),
            test: Test::Like(like, value.into()),
        });
        self
    }

    /// Range predicate, inclusive on both ends.
    pub fn between(&mut self, field: &str, low: impl Into<Arg>, high: impl Into<Arg>) -> &mut Self {
        let join = self.join;
        self.nodes.push(Node::Test {
            join,
            field: field.to_string(),
            test: Test::Between(low.into(), high.into()),
        });
        self
    }

    /// Raw SQL fragment, emitted verbatim by SQL renderers and ignored
    /// by document renderers.
    pub fn sql(&mut self, fragment: &str) -> &mut Self {
        let join = self.join;
        self.nodes.push(Node::RawSql {
            join,
            text: fragment.to_string(),
        });
        self
    }

    /// Raw filter document, merged verbatim by document renderers and
    /// ignored by SQL renderers.
    pub fn filter_doc(&mut self, value: Value) -> &mut Self {
        let join = self.join;
        self.nodes.push(Node::RawDoc { join, value });
        self
    }

    /// Connect subsequent predicates with AND (the default).
    pub fn and(&mut self) -> &mut Self {
        self.join = Join::And;
        self
    }

    /// Connect subsequent predicates with OR until [`and`](Self::and)
    /// is called.
    pub fn or(&mut self) -> &mut Self {
        self.join = Join::Or;
        self
    }

    /// Group predicates built by the closure into a parenthesised
    /// sub-expression. Only predicates from the sub-builder are kept;
    /// its paging and sorting are discarded.
    pub fn scope(&mut self, f: impl FnOnce(&mut ConditionBuilder)) -> &mut Self {
        let mut sub = ConditionBuilder::new();
        f(&mut sub);
        if !sub.nodes.is_empty() {
            let join = self.join;
            self.nodes.push(Node::Group {
                join,
                nodes: sub.nodes,
            });
        }
        self
    }

    /// Ascending sort key. An `asc`/`desc` suffix inside the expression
    /// overrides the direction.
    pub fn order_by(&mut self, field: &str) -> &mut Self {
        self.sorts.push(SortKey {
            raw: field.to_string(),
            desc: false,
        });
        self
    }

    /// Descending sort key, same suffix rule as [`order_by`](Self::order_by).
    pub fn order_by_desc(&mut self, field: &str) -> &mut Self {
        self.sorts.push(SortKey {
            raw: field.to_string(),
            desc: true,
        });
        self
    }

    /// Order rows randomly. Replaces any explicit sort keys.
    pub fn random(&mut self) -> &mut Self {
        self.random = true;
        self
    }

    pub fn skip(&mut self, count: u64) -> &mut Self {
        self.skip = count;
        self
    }

    pub fn take(&mut self, count: u64) -> &mut Self {
        self.take = count;
        self
    }

    /// Alias for [`take`](Self::take).
    pub fn limit(&mut self, count: u64) -> &mut Self {
        self.take(count)
    }

    /// Position paging on a one-based page. Page zero is treated as
    /// page one.
    pub fn page(&mut self, page: u64, size: u64) -> &mut Self {
        let page = page.max(1);
        self.skip = (page - 1).saturating_mul(size);
        self.take = size;
        self
    }

    /// Fetch a single row: the result slot holds an object instead of
    /// an array, absent when nothing matched.
    pub fn first(&mut self) -> &mut Self {
        self.single = true;
        self.skip = 0;
        self.take = 1;
        self
    }

    /// Project the listed columns.
    pub fn fields(&mut self, names: &[&str]) -> &mut Self {
        for name in names {
            self.projection.push((name.to_string(), true));
        }
        self
    }

    /// Project or exclude a single column. Exclusions only apply to
    /// document backends.
    pub fn field(&mut self, name: &str, visible: bool) -> &mut Self {
        self.projection.push((name.to_string(), visible));
        self
    }

    /// Assign a value to a column.
    pub fn set(&mut self, field: &str, value: impl Into<Arg>) -> &mut Self {
        self.assignments.push(Assignment::Set {
            field: field.to_string(),
            value: value.into(),
        });
        self
    }

    /// Route each entry of an object to [`set`](Self::set),
    /// [`inc`](Self::inc) or [`raw`](Self::raw) based on a key sigil:
    /// `+`/`-`/`*`/`/` increments, `!` raw expression, anything else a
    /// plain assignment.
    pub fn values(&mut self, object: Value) -> &mut Self {
        let map = match object {
            Value::Object(map) => map,
            other => {
                tracing::warn!(value = %other, "values expects an object, ignoring");
                return self;
            }
        };
        for (key, value) in map {
            match key.chars().next() {
                Some('+') | Some('-') | Some('*') | Some('/') => {
                    self.inc(&key, value);
                }
                Some('!') => match value {
                    Value::String(expr) => {
                        self.raw(&key[1..], &expr);
                    }
                    other => {
                        self.set(&key[1..], other);
                    }
                },
                _ => {
                    self.set(&key, value);
                }
            }
        }
        self
    }

    /// Arithmetic assignment. The operator comes from a sigil on the
    /// field name (`+views`), from a sigil on a string value (`"-5"`),
    /// or defaults to addition. A sigil on the value wins over one on
    /// the field.
    ///
    /// # Panics
    ///
    /// Panics when the value is [`Arg::Pin`]; identities are not
    /// increment amounts.
    pub fn inc(&mut self, field: &str, value: impl Into<Arg>) -> &mut Self {
        let (field_op, field) = split_field_sigil(field);
        let (op, value) = match value.into() {
            Arg::Pin => panic!("increment amount for '{field}' cannot be the pinned identity"),
            Arg::Value(Value::String(s)) => match split_value_sigil(&s) {
                Some((op, amount)) => (op, Arg::Value(amount)),
                None => (
                    field_op.unwrap_or(IncOp::Add),
                    Arg::Value(Value::String(s)),
                ),
            },
            other => (field_op.unwrap_or(IncOp::Add), other),
        };
        self.assignments.push(Assignment::Inc {
            field: field.to_string(),
            op,
            value,
        });
        self
    }

    /// Assign a raw SQL expression to a column. Document renderers skip
    /// raw assignments.
    pub fn raw(&mut self, field: &str, expr: &str) -> &mut Self {
        self.assignments.push(Assignment::Raw {
            field: field.to_string(),
            expr: expr.to_string(),
        });
        self
    }

    /// Qualify the target with a schema (SQL backends only).
    pub fn schema(&mut self, name: &str) -> &mut Self {
        self.schema = Some(name.to_string());
        self
    }

    /// Column holding the row identity. Defaults to `id`.
    pub fn primary_key(&mut self, name: &str) -> &mut Self {
        self.primary = name.to_string();
        self
    }

    pub fn group_by(&mut self, fields: &[&str]) -> &mut Self {
        for field in fields {
            self.groups.push(field.to_string());
        }
        self
    }

    /// Raw HAVING clause body.
    pub fn having(&mut self, raw: &str) -> &mut Self {
        self.having_clause = Some(raw.to_string());
        self
    }

    /// Raw join fragment appended after the target table.
    pub fn join(&mut self, fragment: &str) -> &mut Self {
        self.joins.push(fragment.to_string());
        self
    }

    /// Current `(skip, take)` pair. A take of zero means unbounded.
    pub fn paging(&self) -> (u64, u64) {
        (self.skip, self.take)
    }

    pub fn is_single(&self) -> bool {
        self.single
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub(crate) fn has_predicates(&self) -> bool {
        !self.nodes.is_empty()
    }
}

fn split_field_sigil(field: &str) -> (Option<IncOp>, &str) {
    match field.chars().next() {
        Some('+') => (Some(IncOp::Add), &field[1..]),
        Some('-') => (Some(IncOp::Sub), &field[1..]),
        Some('*') => (Some(IncOp::Mul), &field[1..]),
        Some('/') => (Some(IncOp::Div), &field[1..]),
        _ => (None, field),
    }
}

fn split_value_sigil(s: &str) -> Option<(IncOp, Value)> {
    let op = match s.chars().next() {
        Some('+') => IncOp::Add,
        Some('-') => IncOp::Sub,
        Some('*') => IncOp::Mul,
        Some('/') => IncOp::Div,
        _ => return None,
    };
    let rest = s[1..].trim();
    if let Ok(n) = rest.parse::<i64>() {
        return Some((op, Value::from(n)));
    }
    if let Ok(f) = rest.parse::<f64>() {
        return Some((op, Value::from(f)));
    }
    None
}
