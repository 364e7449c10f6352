//! Scriptable in-memory backend for engine tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::backend::{AdapterReply, Backend, Capability, QueryFormat, RenderedQuery};
use crate::dialect::{PostgresDialect, SqlShape};
use crate::document::DocOp;
use crate::error::{ChainError, Result};

enum MockFormat {
    Sql(PostgresDialect),
    Document,
}

/// Backend double that records every statement and replays scripted
/// replies. With no script it answers with shape-appropriate defaults
/// and hands out auto-incremented insert identities.
pub(crate) struct MockBackend {
    format: MockFormat,
    capabilities: Vec<Capability>,
    log: Mutex<Vec<String>>,
    replies: Mutex<VecDeque<Result<AdapterReply>>>,
    fail_contains: Mutex<Option<String>>,
    next_id: AtomicI64,
    pub begins: AtomicU32,
    pub commits: AtomicU32,
    pub rollbacks: AtomicU32,
    fail_begin: Mutex<bool>,
    fail_commit: Mutex<bool>,
}

impl MockBackend {
    pub fn sql() -> Self {
        Self {
            format: MockFormat::Sql(PostgresDialect::new()),
            capabilities: vec![
                Capability::Transactions,
                Capability::RawSql,
                Capability::Aggregation,
            ],
            log: Mutex::new(Vec::new()),
            replies: Mutex::new(VecDeque::new()),
            fail_contains: Mutex::new(None),
            next_id: AtomicI64::new(1),
            begins: AtomicU32::new(0),
            commits: AtomicU32::new(0),
            rollbacks: AtomicU32::new(0),
            fail_begin: Mutex::new(false),
            fail_commit: Mutex::new(false),
        }
    }

    pub fn document() -> Self {
        Self {
            format: MockFormat::Document,
            capabilities: Vec::new(),
            ..Self::sql()
        }
    }

    pub fn reply(self, reply: AdapterReply) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(Ok(reply));
        }
        self
    }

    pub fn reply_err(self, error: ChainError) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(Err(error));
        }
        self
    }

    /// Fail any statement whose text contains the fragment.
    pub fn fail_on(self, fragment: &str) -> Self {
        if let Ok(mut fail) = self.fail_contains.lock() {
            *fail = Some(fragment.to_string());
        }
        self
    }

    pub fn fail_begin(self) -> Self {
        if let Ok(mut flag) = self.fail_begin.lock() {
            *flag = true;
        }
        self
    }

    pub fn fail_commit(self) -> Self {
        if let Ok(mut flag) = self.fail_commit.lock() {
            *flag = true;
        }
        self
    }

    /// Display text of every executed statement, in order.
    pub fn statements(&self) -> Vec<String> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    fn default_reply(&self, query: &RenderedQuery) -> AdapterReply {
        match query {
            RenderedQuery::Sql(st) => match st.shape {
                SqlShape::Rows => AdapterReply::Rows(Vec::new()),
                SqlShape::Affected => AdapterReply::Affected(1),
                SqlShape::Inserted => {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    AdapterReply::Inserted(Some(serde_json::json!(id)))
                }
            },
            RenderedQuery::Document(st) => match st.op {
                DocOp::Find => AdapterReply::Rows(Vec::new()),
                DocOp::FindOne => AdapterReply::Row(None),
                DocOp::Count => AdapterReply::Count(0),
                DocOp::InsertOne => {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    AdapterReply::Inserted(Some(serde_json::json!(id)))
                }
                DocOp::UpdateOne
                | DocOp::UpdateMany
                | DocOp::DeleteOne
                | DocOp::DeleteMany => AdapterReply::Affected(1),
            },
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn backend_type(&self) -> &'static str {
        match self.format {
            MockFormat::Sql(_) => "mock-sql",
            MockFormat::Document => "mock-document",
        }
    }

    fn capabilities(&self) -> Vec<Capability> {
        self.capabilities.clone()
    }

    fn format(&self) -> QueryFormat<'_> {
        match &self.format {
            MockFormat::Sql(dialect) => QueryFormat::Sql(dialect),
            MockFormat::Document => QueryFormat::Document,
        }
    }

    async fn execute(&self, query: RenderedQuery) -> Result<AdapterReply> {
        let text = query.display_text();
        if let Ok(mut log) = self.log.lock() {
            log.push(text.clone());
        }
        if let Ok(fail) = self.fail_contains.lock() {
            if let Some(fragment) = fail.as_ref() {
                if text.contains(fragment.as_str()) {
                    return Err(ChainError::backend("scripted failure"));
                }
            }
        }
        let scripted = self.replies.lock().ok().and_then(|mut r| r.pop_front());
        match scripted {
            Some(reply) => reply,
            None => Ok(self.default_reply(&query)),
        }
    }

    async fn begin(&self) -> Result<()> {
        if self.fail_begin.lock().map(|f| *f).unwrap_or(false) {
            return Err(ChainError::backend("begin refused"));
        }
        self.begins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        if self.fail_commit.lock().map(|f| *f).unwrap_or(false) {
            return Err(ChainError::backend("commit refused"));
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
