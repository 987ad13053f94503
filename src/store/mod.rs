//! Record store boundary — the narrow CRUD + realtime interface we consume.
//!
//! ARCHITECTURE
//! ============
//! `RecordStore` is the seam between this crate and the remote collection
//! store. `http::HttpRecordStore` talks to a PocketBase-compatible server;
//! `memory::MemoryRecordStore` is an in-process implementation used by
//! tests and local development. Callers pass the bearer token explicitly,
//! so the store itself holds no auth state.

pub mod http;
pub mod memory;

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// RECORD
// =============================================================================

/// A store record: an `id` plus arbitrary JSON fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default)]
    pub id: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

impl Record {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), fields: serde_json::Map::new() }
    }

    #[must_use]
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_owned(), value.into());
        self
    }

    /// Read a field as a string. `id` resolves to the record id.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        if key == "id" {
            return Some(&self.id);
        }
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Field rendered as text for matching; numbers are stringified.
    fn field_text(&self, key: &str) -> Option<String> {
        if key == "id" {
            return Some(self.id.clone());
        }
        match self.fields.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    #[must_use]
    pub fn role(&self) -> Option<&str> {
        self.get_str("role")
    }
}

// =============================================================================
// QUERIES
// =============================================================================

/// Case-insensitive substring match over a fixed field set, OR-combined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub fields: Vec<String>,
    pub needle: String,
}

impl Filter {
    #[must_use]
    pub fn any_contains(fields: &[&str], needle: &str) -> Self {
        Self { fields: fields.iter().map(|f| (*f).to_owned()).collect(), needle: needle.to_owned() }
    }

    /// Render in the store's filter syntax, e.g. `name ~ "07" || phone_no ~ "07"`.
    #[must_use]
    pub fn to_expression(&self) -> String {
        let quoted = quote_literal(&self.needle);
        self.fields
            .iter()
            .map(|field| format!("{field} ~ {quoted}"))
            .collect::<Vec<_>>()
            .join(" || ")
    }

    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        let needle = self.needle.to_lowercase();
        self.fields.iter().any(|field| {
            record
                .field_text(field)
                .is_some_and(|text| text.to_lowercase().contains(&needle))
        })
    }
}

fn quote_literal(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('"');
    for c in raw.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Sort key list in store syntax: `-created,name` (leading `-` = descending).
#[must_use]
pub fn compare_by_sort(sort: &str, a: &Record, b: &Record) -> Ordering {
    for key in sort.split(',').map(str::trim).filter(|k| !k.is_empty()) {
        let (field, descending) = match key.strip_prefix('-') {
            Some(field) => (field, true),
            None => (key.strip_prefix('+').unwrap_or(key), false),
        };
        let ord = a.field_text(field).cmp(&b.field_text(field));
        let ord = if descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub page: u32,
    pub per_page: u32,
    pub sort: Option<String>,
    pub filter: Option<Filter>,
}

impl ListQuery {
    #[must_use]
    pub fn page(page: u32, per_page: u32) -> Self {
        Self { page: page.max(1), per_page: per_page.max(1), sort: None, filter: None }
    }

    #[must_use]
    pub fn sorted(mut self, sort: &str) -> Self {
        self.sort = Some(sort.to_owned());
        self
    }

    #[must_use]
    pub fn filtered(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// One page of records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResult {
    pub page: u32,
    pub per_page: u32,
    pub total_items: u64,
    pub total_pages: u64,
    pub items: Vec<Record>,
}

/// Successful password authentication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    pub record: Record,
}

// =============================================================================
// REALTIME
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

/// Event delivered to a realtime callback.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Change { action: ChangeAction, record: Record },
    /// The transport went away. No further events follow.
    Disconnected { reason: String },
}

pub type EventSink = Arc<dyn Fn(FeedEvent) + Send + Sync>;

/// A live store-side registration. `close` must be idempotent.
pub trait RealtimeHandle: Send {
    fn close(&mut self);
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(String),
    #[error("store request timed out")]
    Timeout,
    #[error("store responded {status}: {message}")]
    Response { status: u16, message: String },
    #[error("store response parse failed: {0}")]
    Parse(String),
    #[error("record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("realtime subscribe failed: {0}")]
    Realtime(String),
}

// =============================================================================
// TRAIT
// =============================================================================

#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    async fn authenticate(&self, collection: &str, identity: &str, secret: &str) -> Result<AuthResponse, StoreError>;

    async fn list(&self, token: Option<&str>, collection: &str, query: &ListQuery) -> Result<ListResult, StoreError>;

    async fn get_one(&self, token: Option<&str>, collection: &str, id: &str) -> Result<Record, StoreError>;

    async fn create(&self, token: Option<&str>, collection: &str, data: &Value) -> Result<Record, StoreError>;

    async fn update(&self, token: Option<&str>, collection: &str, id: &str, data: &Value) -> Result<Record, StoreError>;

    async fn delete(&self, token: Option<&str>, collection: &str, id: &str) -> Result<(), StoreError>;

    /// Register `sink` for changes on `collection`. `topic` is `*` or a record id.
    async fn subscribe(
        &self,
        token: Option<&str>,
        collection: &str,
        topic: &str,
        sink: EventSink,
    ) -> Result<Box<dyn RealtimeHandle>, StoreError>;
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
