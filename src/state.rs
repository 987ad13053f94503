//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! Server requests carry their own identity in the `pb_auth` cookie, so
//! there is no long-lived session here: each handler builds a `RecordAccess`
//! over the caller's token, with the service identity as the fallback.

use std::sync::Arc;

use crate::credential::CredentialHolder;
use crate::guard::{AuthUser, RouteGuard};
use crate::records::{RecordAccess, ServiceIdentity};
use crate::store::RecordStore;

/// Clone is required by Axum; every field is Arc-wrapped or Copy.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub service: Option<ServiceIdentity>,
    pub guard: Arc<RouteGuard>,
    pub auth_collection: String,
    pub cookie_secure: bool,
}

impl AppState {
    #[must_use]
    pub fn new(
        store: Arc<dyn RecordStore>,
        guard: RouteGuard,
        service: Option<ServiceIdentity>,
        auth_collection: impl Into<String>,
        cookie_secure: bool,
    ) -> Self {
        Self { store, service, guard: Arc::new(guard), auth_collection: auth_collection.into(), cookie_secure }
    }

    /// Record access acting as the request's user.
    #[must_use]
    pub fn records_for(&self, auth: &AuthUser) -> RecordAccess {
        let holder = CredentialHolder::new();
        holder.save(auth.token.clone(), Some(auth.user.clone()));
        RecordAccess::new(Arc::clone(&self.store), holder, self.service.clone())
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
