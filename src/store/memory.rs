//! In-process record store.
//!
//! Behaves like the remote store closely enough for the session and record
//! layers: password users per auth collection, JWT-shaped tokens with a real
//! `exp` claim, `-created` ordering, structured filters, pagination, and
//! synchronous realtime fan-out on every mutation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;
use uuid::Uuid;

use super::{
    AuthResponse, ChangeAction, EventSink, FeedEvent, ListQuery, ListResult, RealtimeHandle, Record, RecordStore,
    StoreError, compare_by_sort,
};
use crate::credential::{now_unix, token_expiry};

const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;

/// Build an unsigned JWT-shaped token carrying `sub` and `exp`.
#[must_use]
pub fn encode_unsigned_token(sub: &str, exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let claims = serde_json::json!({ "id": sub, "exp": exp, "type": "auth" });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.{}", Uuid::new_v4().simple())
}

struct Watcher {
    collection: String,
    topic: String,
    sink: EventSink,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, Vec<Record>>,
    /// (auth collection, identity) -> (secret, user record)
    users: HashMap<(String, String), (String, Record)>,
    issued: HashSet<String>,
    watchers: HashMap<u64, Watcher>,
    next_watcher: u64,
    clock: i64,
}

pub struct MemoryRecordStore {
    inner: Arc<Mutex<Inner>>,
    token_ttl_secs: i64,
    require_auth: bool,
    auth_calls: AtomicUsize,
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            require_auth: false,
            auth_calls: AtomicUsize::new(0),
        }
    }

    /// Issue tokens that expire `secs` after authentication.
    #[must_use]
    pub fn with_token_ttl(mut self, secs: i64) -> Self {
        self.token_ttl_secs = secs;
        self
    }

    /// Reject record calls that do not carry a token this store issued.
    #[must_use]
    pub fn requiring_auth(mut self) -> Self {
        self.require_auth = true;
        self
    }

    pub fn add_user(&self, collection: &str, identity: &str, secret: &str, record: Record) {
        self.lock()
            .users
            .insert((collection.to_owned(), identity.to_owned()), (secret.to_owned(), record));
    }

    /// Insert a record without notifying watchers. Missing ids are generated.
    pub fn seed(&self, collection: &str, mut record: Record) -> Record {
        let mut inner = self.lock();
        stamp(&mut inner, &mut record, true);
        inner
            .collections
            .entry(collection.to_owned())
            .or_default()
            .push(record.clone());
        record
    }

    /// Number of `authenticate` calls served, successful or not.
    #[must_use]
    pub fn auth_calls(&self) -> usize {
        self.auth_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.lock().watchers.len()
    }

    /// Simulate transport loss: every watcher gets `Disconnected` and is dropped.
    pub fn disconnect_all(&self, reason: &str) {
        let sinks: Vec<EventSink> = self.lock().watchers.drain().map(|(_, w)| w.sink).collect();
        for sink in sinks {
            sink(FeedEvent::Disconnected { reason: reason.to_owned() });
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_token(&self, token: Option<&str>) -> Result<(), StoreError> {
        if !self.require_auth {
            return Ok(());
        }
        let unauthorized = || StoreError::Response { status: 401, message: "The request requires valid record authorization token.".into() };
        let token = token.ok_or_else(unauthorized)?;
        let now = now_unix();
        let mut inner = self.lock();
        inner.issued.retain(|t| token_expiry(t).is_ok_and(|exp| exp > now));
        if inner.issued.contains(token) { Ok(()) } else { Err(unauthorized()) }
    }

    fn notify(&self, collection: &str, action: ChangeAction, record: &Record) {
        let sinks: Vec<EventSink> = self
            .lock()
            .watchers
            .values()
            .filter(|w| w.collection == collection && (w.topic == "*" || w.topic == record.id))
            .map(|w| Arc::clone(&w.sink))
            .collect();
        for sink in sinks {
            sink(FeedEvent::Change { action, record: record.clone() });
        }
    }
}

fn stamp(inner: &mut Inner, record: &mut Record, creating: bool) {
    inner.clock += 1;
    // Fixed-width so lexical order matches insertion order.
    let ts = format!("{:020}", inner.clock);
    if creating {
        if record.id.is_empty() {
            record.id = Uuid::new_v4().simple().to_string()[..15].to_owned();
        }
        record.fields.insert("created".into(), Value::String(ts.clone()));
    }
    record.fields.insert("updated".into(), Value::String(ts));
}

fn merge(record: &mut Record, data: &Value) {
    if let Value::Object(map) = data {
        for (k, v) in map {
            if k == "id" || k == "created" || k == "updated" {
                continue;
            }
            record.fields.insert(k.clone(), v.clone());
        }
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryRecordStore {
    async fn authenticate(&self, collection: &str, identity: &str, secret: &str) -> Result<AuthResponse, StoreError> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.lock();
        let Some((expected, record)) = inner
            .users
            .get(&(collection.to_owned(), identity.to_owned()))
            .cloned()
        else {
            return Err(StoreError::InvalidCredentials);
        };
        if expected != secret {
            return Err(StoreError::InvalidCredentials);
        }
        let token = encode_unsigned_token(&record.id, now_unix() + self.token_ttl_secs);
        inner.issued.insert(token.clone());
        Ok(AuthResponse { token, record })
    }

    async fn list(&self, token: Option<&str>, collection: &str, query: &ListQuery) -> Result<ListResult, StoreError> {
        self.check_token(token)?;
        let inner = self.lock();
        let mut items: Vec<Record> = inner
            .collections
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| query.filter.as_ref().is_none_or(|f| f.matches(r)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(inner);

        if let Some(sort) = &query.sort {
            items.sort_by(|a, b| compare_by_sort(sort, a, b));
        }

        let total_items = items.len() as u64;
        let per_page = u64::from(query.per_page.max(1));
        let total_pages = total_items.div_ceil(per_page);
        #[allow(clippy::cast_possible_truncation)]
        let skip = (u64::from(query.page.max(1) - 1) * per_page) as usize;
        #[allow(clippy::cast_possible_truncation)]
        let items = items.into_iter().skip(skip).take(per_page as usize).collect();

        Ok(ListResult { page: query.page.max(1), per_page: query.per_page.max(1), total_items, total_pages, items })
    }

    async fn get_one(&self, token: Option<&str>, collection: &str, id: &str) -> Result<Record, StoreError> {
        self.check_token(token)?;
        self.lock()
            .collections
            .get(collection)
            .and_then(|records| records.iter().find(|r| r.id == id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound { collection: collection.to_owned(), id: id.to_owned() })
    }

    async fn create(&self, token: Option<&str>, collection: &str, data: &Value) -> Result<Record, StoreError> {
        self.check_token(token)?;
        let mut record = Record::default();
        if let Some(id) = data.get("id").and_then(Value::as_str) {
            record.id = id.to_owned();
        }
        merge(&mut record, data);
        {
            let mut inner = self.lock();
            stamp(&mut inner, &mut record, true);
            inner
                .collections
                .entry(collection.to_owned())
                .or_default()
                .push(record.clone());
        }
        self.notify(collection, ChangeAction::Create, &record);
        Ok(record)
    }

    async fn update(&self, token: Option<&str>, collection: &str, id: &str, data: &Value) -> Result<Record, StoreError> {
        self.check_token(token)?;
        let updated = {
            let mut inner = self.lock();
            let inner = &mut *inner;
            let record = inner
                .collections
                .get_mut(collection)
                .and_then(|records| records.iter_mut().find(|r| r.id == id))
                .ok_or_else(|| StoreError::NotFound { collection: collection.to_owned(), id: id.to_owned() })?;
            merge(record, data);
            let mut snapshot = record.clone();
            inner.clock += 1;
            let ts = Value::String(format!("{:020}", inner.clock));
            record.fields.insert("updated".into(), ts.clone());
            snapshot.fields.insert("updated".into(), ts);
            snapshot
        };
        self.notify(collection, ChangeAction::Update, &updated);
        Ok(updated)
    }

    async fn delete(&self, token: Option<&str>, collection: &str, id: &str) -> Result<(), StoreError> {
        self.check_token(token)?;
        let removed = {
            let mut inner = self.lock();
            let records = inner.collections.entry(collection.to_owned()).or_default();
            let Some(pos) = records.iter().position(|r| r.id == id) else {
                return Err(StoreError::NotFound { collection: collection.to_owned(), id: id.to_owned() });
            };
            records.remove(pos)
        };
        self.notify(collection, ChangeAction::Delete, &removed);
        Ok(())
    }

    async fn subscribe(
        &self,
        token: Option<&str>,
        collection: &str,
        topic: &str,
        sink: EventSink,
    ) -> Result<Box<dyn RealtimeHandle>, StoreError> {
        self.check_token(token)?;
        let mut inner = self.lock();
        inner.next_watcher += 1;
        let id = inner.next_watcher;
        inner
            .watchers
            .insert(id, Watcher { collection: collection.to_owned(), topic: topic.to_owned(), sink });
        Ok(Box::new(MemoryHandle { id, inner: Arc::downgrade(&self.inner), closed: false }))
    }
}

struct MemoryHandle {
    id: u64,
    inner: Weak<Mutex<Inner>>,
    closed: bool,
}

impl RealtimeHandle for MemoryHandle {
    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(inner) = self.inner.upgrade() {
            inner
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .watchers
                .remove(&self.id);
        }
    }
}

impl Drop for MemoryHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
