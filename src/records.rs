//! Record access layer — authenticated CRUD, search, and realtime watches.
//!
//! DESIGN
//! ======
//! Every call first resolves a token through `authenticate`:
//! 1. the shared `CredentialHolder` (the signed-in user), if valid;
//! 2. otherwise a cached service-identity token, if valid;
//! 3. otherwise a fresh password login as the service identity.
//! With no service identity configured, calls go out anonymously and the
//! store's own rules decide. Service credentials never touch the shared
//! holder, so the session's user is never replaced behind its back.
//!
//! LIFECYCLE
//! =========
//! `watch` hands the caller an owned `Subscription`. `subscribe` keeps one
//! per collection inside the layer: a second `subscribe` closes the first
//! before the new registration is made, and `unsubscribe` on an empty slot
//! does nothing. Closing a subscription takes the callback gate, so once
//! `close` returns the old callback can no longer run.
//!
//! Store errors are returned unchanged; nothing here retries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::credential::{AuthStore, CredentialHolder};
use crate::store::{EventSink, FeedEvent, Filter, ListQuery, ListResult, RealtimeHandle, Record, RecordStore, StoreError};

/// Default list ordering: newest first.
pub const RECENT_FIRST: &str = "-created";

/// Account used when no user session is available.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub collection: String,
    pub identity: String,
    pub secret: String,
}

impl std::fmt::Debug for ServiceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceIdentity")
            .field("collection", &self.collection)
            .field("identity", &self.identity)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl ServiceIdentity {
    /// Read `SERVICE_IDENTITY` / `SERVICE_SECRET`. `None` unless both are set.
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>, collection: &str) -> Option<Self> {
        let identity = lookup("SERVICE_IDENTITY").filter(|s| !s.is_empty())?;
        let secret = lookup("SERVICE_SECRET").filter(|s| !s.is_empty())?;
        Some(Self { collection: collection.to_owned(), identity, secret })
    }
}

// =============================================================================
// SUBSCRIPTION
// =============================================================================

type Gate = Arc<Mutex<Option<EventSink>>>;

/// A live realtime registration. Closing is idempotent; dropping closes.
pub struct Subscription {
    id: Uuid,
    collection: String,
    gate: Gate,
    handle: Option<Box<dyn RealtimeHandle>>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.handle.is_some()
    }

    pub fn close(&mut self) {
        // Taking the gate waits out any callback already running.
        self.gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = self.handle.take() {
            handle.close();
            debug!(id = %self.id, collection = %self.collection, "subscription closed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("collection", &self.collection)
            .field("live", &self.is_live())
            .finish()
    }
}

// =============================================================================
// ACCESS LAYER
// =============================================================================

pub struct RecordAccess {
    store: Arc<dyn RecordStore>,
    holder: CredentialHolder,
    service: Option<ServiceIdentity>,
    service_auth: AsyncMutex<AuthStore>,
    watches: AsyncMutex<HashMap<String, Subscription>>,
}

impl RecordAccess {
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, holder: CredentialHolder, service: Option<ServiceIdentity>) -> Self {
        Self {
            store,
            holder,
            service,
            service_auth: AsyncMutex::new(AuthStore::default()),
            watches: AsyncMutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn holder(&self) -> &CredentialHolder {
        &self.holder
    }

    /// Resolve the token for the next store call, logging in as the service
    /// identity if nothing valid is held.
    ///
    /// # Errors
    ///
    /// Returns the store's error if the service login fails.
    pub async fn authenticate(&self) -> Result<Option<String>, StoreError> {
        if let Some(token) = self.holder.valid_token() {
            return Ok(Some(token));
        }
        let Some(service) = &self.service else {
            return Ok(None);
        };

        // Held across the login so concurrent callers share one attempt.
        let mut cached = self.service_auth.lock().await;
        if cached.is_valid() {
            return Ok(cached.token().map(str::to_owned));
        }
        let auth = self
            .store
            .authenticate(&service.collection, &service.identity, &service.secret)
            .await?;
        info!(identity = %service.identity, "record access: service identity authenticated");
        cached.save(auth.token.clone(), Some(auth.record));
        Ok(Some(auth.token))
    }

    /// One page of records, newest first.
    ///
    /// # Errors
    ///
    /// Propagates authentication and store errors unchanged.
    pub async fn list(&self, collection: &str, page: u32, per_page: u32) -> Result<ListResult, StoreError> {
        let token = self.authenticate().await?;
        let query = ListQuery::page(page, per_page).sorted(RECENT_FIRST);
        self.store.list(token.as_deref(), collection, &query).await
    }

    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids; other store errors unchanged.
    pub async fn get(&self, collection: &str, id: &str) -> Result<Record, StoreError> {
        let token = self.authenticate().await?;
        self.store.get_one(token.as_deref(), collection, id).await
    }

    /// Case-insensitive substring search across `fields`, OR-combined.
    ///
    /// # Errors
    ///
    /// Propagates authentication and store errors unchanged.
    pub async fn search(
        &self,
        collection: &str,
        fields: &[&str],
        query: &str,
        page: u32,
        per_page: u32,
    ) -> Result<ListResult, StoreError> {
        let token = self.authenticate().await?;
        let query = ListQuery::page(page, per_page).filtered(Filter::any_contains(fields, query));
        self.store.list(token.as_deref(), collection, &query).await
    }

    /// # Errors
    ///
    /// Propagates authentication and store errors unchanged.
    pub async fn create(&self, collection: &str, data: &Value) -> Result<Record, StoreError> {
        let token = self.authenticate().await?;
        self.store.create(token.as_deref(), collection, data).await
    }

    /// # Errors
    ///
    /// Propagates authentication and store errors unchanged.
    pub async fn update(&self, collection: &str, id: &str, data: &Value) -> Result<Record, StoreError> {
        let token = self.authenticate().await?;
        self.store.update(token.as_deref(), collection, id, data).await
    }

    /// # Errors
    ///
    /// Propagates authentication and store errors unchanged.
    pub async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let token = self.authenticate().await?;
        self.store.delete(token.as_deref(), collection, id).await
    }

    /// Open an independent realtime watch owned by the caller.
    ///
    /// # Errors
    ///
    /// Propagates authentication and store errors unchanged.
    pub async fn watch<F>(&self, collection: &str, topic: &str, callback: F) -> Result<Subscription, StoreError>
    where
        F: Fn(FeedEvent) + Send + Sync + 'static,
    {
        let token = self.authenticate().await?;
        let callback: EventSink = Arc::new(callback);
        let gate: Gate = Arc::new(Mutex::new(Some(callback)));
        let sink: EventSink = {
            let gate = Arc::clone(&gate);
            Arc::new(move |event| {
                let guard = gate.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(callback) = guard.as_ref() {
                    callback(event);
                }
            })
        };
        let handle = self
            .store
            .subscribe(token.as_deref(), collection, topic, sink)
            .await?;
        Ok(Subscription { id: Uuid::new_v4(), collection: collection.to_owned(), gate, handle: Some(handle) })
    }

    /// Watch every change in `collection`, replacing any earlier watch on it.
    ///
    /// # Errors
    ///
    /// Propagates authentication and store errors. The earlier watch is
    /// closed even when the new one fails.
    pub async fn subscribe<F>(&self, collection: &str, callback: F) -> Result<Uuid, StoreError>
    where
        F: Fn(FeedEvent) + Send + Sync + 'static,
    {
        let mut watches = self.watches.lock().await;
        if let Some(mut previous) = watches.remove(collection) {
            previous.close();
            debug!(%collection, id = %previous.id(), "subscription replaced");
        }
        let subscription = self.watch(collection, "*", callback).await?;
        let id = subscription.id();
        watches.insert(collection.to_owned(), subscription);
        Ok(id)
    }

    /// Close the watch on `collection`. Returns whether one was live.
    pub async fn unsubscribe(&self, collection: &str) -> bool {
        match self.watches.lock().await.remove(collection) {
            Some(mut subscription) => {
                subscription.close();
                true
            }
            None => false,
        }
    }

    /// Close every layer-owned watch.
    pub async fn close_all(&self) {
        let mut watches = self.watches.lock().await;
        for (_, mut subscription) in watches.drain() {
            subscription.close();
        }
    }

    /// Collections with a live layer-owned watch.
    pub async fn watched(&self) -> Vec<String> {
        let watches = self.watches.lock().await;
        let mut out: Vec<String> = watches
            .iter()
            .filter(|(_, s)| s.is_live())
            .map(|(c, _)| c.clone())
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
#[path = "records_test.rs"]
mod tests;
