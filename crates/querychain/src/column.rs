//! Column and sort expression parsing with a bounded per-dialect cache.
//!
//! Parsing is cheap but happens on every render, and the same handful of
//! expressions repeat across an application, so each dialect instance
//! keeps a small cache. The cache stops accepting new entries at its
//! capacity instead of evicting; lookups past that point parse directly.

use std::collections::HashMap;
use std::sync::RwLock;

/// Default number of entries each cache map will hold.
pub const DEFAULT_CACHE_CAPACITY: usize = 2000;

/// A parsed column expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedColumn {
    pub column: String,
    /// Alias from an `as` clause, if present.
    pub alias: Option<String>,
    /// True when the expression started with `!` and must be emitted
    /// verbatim, without quoting.
    pub raw: bool,
}

/// A parsed sort expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedSort {
    pub column: String,
    /// Direction from an `asc`/`desc` suffix. `None` when the
    /// expression carried no suffix and the caller decides.
    pub desc: Option<bool>,
}

/// Bounded cache of parsed column and sort expressions.
pub struct ColumnCache {
    columns: RwLock<HashMap<String, ParsedColumn>>,
    sorts: RwLock<HashMap<String, ParsedSort>>,
    capacity: usize,
}

impl ColumnCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            columns: RwLock::new(HashMap::new()),
            sorts: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Parse a column expression, consulting the cache first.
    pub fn column(&self, raw: &str) -> ParsedColumn {
        if let Ok(cache) = self.columns.read() {
            if let Some(hit) = cache.get(raw) {
                return hit.clone();
            }
        }
        let parsed = parse_column(raw);
        if let Ok(mut cache) = self.columns.write() {
            if cache.len() < self.capacity {
                cache.insert(raw.to_string(), parsed.clone());
            }
        }
        parsed
    }

    /// Parse a sort expression, consulting the cache first.
    pub fn sort(&self, raw: &str) -> ParsedSort {
        if let Ok(cache) = self.sorts.read() {
            if let Some(hit) = cache.get(raw) {
                return hit.clone();
            }
        }
        let parsed = parse_sort(raw);
        if let Ok(mut cache) = self.sorts.write() {
            if cache.len() < self.capacity {
                cache.insert(raw.to_string(), parsed.clone());
            }
        }
        parsed
    }

    /// Total cached entries across both maps.
    pub fn len(&self) -> usize {
        let columns = self.columns.read().map(|c| c.len()).unwrap_or(0);
        let sorts = self.sorts.read().map(|c| c.len()).unwrap_or(0);
        columns + sorts
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ColumnCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

fn parse_column(raw: &str) -> ParsedColumn {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix('!') {
        return ParsedColumn {
            column: rest.trim().to_string(),
            alias: None,
            raw: true,
        };
    }
    let lower = trimmed.to_ascii_lowercase();
    if let Some(pos) = lower.find(" as ") {
        let column = trimmed[..pos].trim().to_string();
        let alias = trimmed[pos + 4..].trim().to_string();
        let alias = if alias.is_empty() { None } else { Some(alias) };
        return ParsedColumn {
            column,
            alias,
            raw: false,
        };
    }
    ParsedColumn {
        column: trimmed.to_string(),
        alias: None,
        raw: false,
    }
}

pub(crate) fn parse_sort(raw: &str) -> ParsedSort {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();
    if lower.ends_with(" desc") {
        return ParsedSort {
            column: trimmed[..trimmed.len() - 5].trim().to_string(),
            desc: Some(true),
        };
    }
    if lower.ends_with(" asc") {
        return ParsedSort {
            column: trimmed[..trimmed.len() - 4].trim().to_string(),
            desc: Some(false),
        };
    }
    ParsedSort {
        column: trimmed.to_string(),
        desc: None,
    }
}
