//! Session manager — keeps the credential holder, the durable store and the
//! auth cookie in agreement, and broadcasts `SessionState` to observers.
//!
//! DESIGN
//! ======
//! Every mutation (`restore`, `login`, `logout`, `update_user`) runs under
//! one async lock and ends in `commit`, which re-derives the cookie from the
//! holder and publishes a fresh state. The last mutation to finish wins.
//!
//! The durable store is written only for remembered logins; the cookie is
//! written on every commit so the route guard always sees what the holder
//! holds. Storage failures never block a state transition: they are logged
//! and, for logout, returned to the caller as warnings.
//!
//! A restore that finds nothing remembered leaves the cookie alone: the
//! one-day cookie of an unremembered login outlives the in-memory holder.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::credential::{CredentialBlob, CredentialError, CredentialHolder, now_unix, parse_blob, validate_blob};
use crate::persist::{
    COOKIE_NAME, CookieLifetime, CookieStore, DURABLE_KEY, DurableStore, PersistError, auth_cookie, removal_cookie,
};
use crate::store::{Record, RecordStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
}

/// Snapshot broadcast to observers. `is_authenticated == user.is_some()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub user: Option<Record>,
    pub is_authenticated: bool,
    pub is_loading: bool,
}

impl SessionState {
    fn loading() -> Self {
        Self { user: None, is_authenticated: false, is_loading: true }
    }

    fn settled(user: Option<Record>) -> Self {
        Self { is_authenticated: user.is_some(), user, is_loading: false }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Collection passed to the store's password login.
    pub auth_collection: String,
    /// Only client contexts have a durable store to restore from.
    pub client_side: bool,
    pub secure_cookie: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { auth_collection: "users".into(), client_side: true, secure_cookie: false }
    }
}

/// Result of `logout`. The session is logged out regardless of warnings.
#[derive(Debug, Default)]
pub struct LogoutReport {
    pub warnings: Vec<PersistError>,
}

impl LogoutReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

struct Lifecycle {
    restored: bool,
    lifetime: CookieLifetime,
}

pub struct SessionManager {
    store: Arc<dyn RecordStore>,
    durable: Arc<dyn DurableStore>,
    cookies: Arc<dyn CookieStore>,
    holder: CredentialHolder,
    config: SessionConfig,
    state_tx: watch::Sender<SessionState>,
    mutations: Mutex<Lifecycle>,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        store: Arc<dyn RecordStore>,
        durable: Arc<dyn DurableStore>,
        cookies: Arc<dyn CookieStore>,
        holder: CredentialHolder,
        config: SessionConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::loading());
        Self {
            store,
            durable,
            cookies,
            holder,
            config,
            state_tx,
            mutations: Mutex::new(Lifecycle { restored: false, lifetime: CookieLifetime::Session }),
        }
    }

    #[must_use]
    pub fn holder(&self) -> &CredentialHolder {
        &self.holder
    }

    // =========================================================================
    // MUTATIONS
    // =========================================================================

    /// Load the remembered credential, once. Later calls return the current
    /// state unchanged.
    pub async fn restore(&self) -> SessionState {
        let mut lifecycle = self.mutations.lock().await;
        if lifecycle.restored {
            return self.state();
        }
        lifecycle.restored = true;

        if !self.config.client_side {
            self.state_tx.send_replace(SessionState::settled(None));
            return self.state();
        }

        let raw = self.durable.get(DURABLE_KEY).unwrap_or_else(|e| {
            warn!(error = %e, "session restore: durable store unreadable");
            None
        });

        match raw {
            None => {
                debug!("session restore: nothing remembered");
                self.holder.clear();
                self.state_tx.send_replace(SessionState::settled(None));
                return self.state();
            }
            Some(raw) => match parse_blob(&raw).and_then(|blob| validate_blob(blob, now_unix())) {
                Ok(auth) => {
                    self.holder.replace(auth);
                    lifecycle.lifetime = CookieLifetime::Remembered;
                    info!(user = %self.holder.record().map(|r| r.id).unwrap_or_default(), "session restored");
                }
                Err(e) => {
                    warn!(error = %e, "session restore: discarding remembered credential");
                    self.holder.clear();
                    if let Err(e) = self.durable.remove(DURABLE_KEY) {
                        warn!(error = %e, "session restore: durable purge failed");
                    }
                }
            },
        }

        if let Err(e) = self.commit(&lifecycle) {
            warn!(error = %e, "session restore: cookie write failed");
        }
        self.state()
    }

    /// Password login. On failure nothing is mutated.
    ///
    /// # Errors
    ///
    /// Returns the store's error unchanged, or `Credential` if the returned
    /// auth cannot be serialized for persistence.
    pub async fn login(&self, identity: &str, secret: &str, remember: bool) -> Result<Record, SessionError> {
        let mut lifecycle = self.mutations.lock().await;
        let auth = self
            .store
            .authenticate(&self.config.auth_collection, identity, secret)
            .await?;

        let blob = CredentialBlob { token: auth.token.clone(), record: Some(auth.record.clone()) };
        let serialized = blob.to_json()?;

        self.holder.save(auth.token, Some(auth.record.clone()));
        lifecycle.lifetime = CookieLifetime::for_remember(remember);
        lifecycle.restored = true;
        if remember {
            if let Err(e) = self.durable.set(DURABLE_KEY, &serialized) {
                warn!(error = %e, "login: durable store write failed");
            }
        }
        if let Err(e) = self.commit(&lifecycle) {
            warn!(error = %e, "login: cookie write failed");
        }
        info!(user = %auth.record.id, remember, "login succeeded");
        Ok(auth.record)
    }

    /// Clear every credential copy. Always ends logged out.
    pub async fn logout(&self) -> LogoutReport {
        let mut lifecycle = self.mutations.lock().await;
        let mut report = LogoutReport::default();

        self.holder.clear();
        lifecycle.lifetime = CookieLifetime::Session;
        lifecycle.restored = true;
        if let Err(e) = self.durable.remove(DURABLE_KEY) {
            warn!(error = %e, "logout: durable purge failed");
            report.warnings.push(e);
        }
        if let Err(e) = self.commit(&lifecycle) {
            warn!(error = %e, "logout: cookie purge failed");
            report.warnings.push(e);
        }
        info!("logout");
        report
    }

    /// Replace the session's identity, keeping the token. Ignored while
    /// logged out.
    pub async fn update_user(&self, user: Record) -> bool {
        let lifecycle = self.mutations.lock().await;
        let auth = self.holder.snapshot();
        if !auth.is_valid() {
            return false;
        }
        let token = auth.token().unwrap_or_default().to_owned();
        self.holder.save(token, Some(user));
        if lifecycle.lifetime == CookieLifetime::Remembered {
            match self.holder.snapshot().export().to_json() {
                Ok(serialized) => {
                    if let Err(e) = self.durable.set(DURABLE_KEY, &serialized) {
                        warn!(error = %e, "update_user: durable store write failed");
                    }
                }
                Err(e) => warn!(error = %e, "update_user: encode failed"),
            }
        }
        if let Err(e) = self.commit(&lifecycle) {
            warn!(error = %e, "update_user: cookie write failed");
        }
        true
    }

    /// Re-derive the cookie from the holder and publish the state.
    fn commit(&self, lifecycle: &Lifecycle) -> Result<(), PersistError> {
        let auth = self.holder.snapshot();
        let user = auth.record().cloned();
        self.state_tx.send_replace(SessionState::settled(user));

        if auth.is_valid() {
            let value = auth
                .export()
                .to_json()
                .map_err(|e| PersistError::Unavailable(e.to_string()))?;
            self.cookies
                .set(auth_cookie(value, lifecycle.lifetime, self.config.secure_cookie))
        } else {
            self.cookies.set(removal_cookie(self.config.secure_cookie))?;
            self.cookies.remove(COOKIE_NAME)
        }
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Live check against the holder; expiry is evaluated now.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.holder.is_valid()
    }

    #[must_use]
    pub fn user(&self) -> Option<Record> {
        self.holder.record()
    }

    /// Last published state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    /// Observe state changes. Dropping the receiver unsubscribes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
