//! Route guard — per-request path classification and redirect policy.
//!
//! DESIGN
//! ======
//! `RouteGuard::decide` is a pure function of (path, cookie, now); the axum
//! middleware only extracts those inputs and turns the `Decision` into a
//! response. The guard keeps no state between requests beyond its
//! immutable route tables.
//!
//! Policy:
//! - protected path, missing/invalid cookie -> 302 `/login?redirect=<path>`
//! - protected path, valid cookie -> continue with `AuthUser` attached
//! - exactly the login page, valid cookie -> 302 to the role's landing page
//! - anything else -> continue unchanged
//!
//! The login page can never be protected (config rejects that), so the
//! unauthenticated redirect cannot loop.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::CookieJar;
use tracing::warn;

use crate::credential::{CredentialError, now_unix, parse_blob, validate_blob};
use crate::persist::COOKIE_NAME;
use crate::store::Record;

// =============================================================================
// CLASSIFICATION
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    Public,
    Protected,
    Neutral,
}

/// Public entries match exactly or as `entry/...`; protected entries match by prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTable {
    public: Vec<String>,
    protected: Vec<String>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new(
            ["/", "/login", "/forgot-password", "/register"].map(str::to_owned).to_vec(),
            ["/Gatepass", "/dashboard", "/admin"].map(str::to_owned).to_vec(),
        )
    }
}

impl RouteTable {
    #[must_use]
    pub fn new(public: Vec<String>, protected: Vec<String>) -> Self {
        Self { public, protected }
    }

    #[must_use]
    pub fn public(&self) -> &[String] {
        &self.public
    }

    #[must_use]
    pub fn protected(&self) -> &[String] {
        &self.protected
    }

    #[must_use]
    pub fn classify(&self, path: &str) -> RouteClass {
        if self.protected.iter().any(|route| path.starts_with(route.as_str())) {
            return RouteClass::Protected;
        }
        let is_public = self.public.iter().any(|route| {
            path == route
                || path
                    .strip_prefix(route.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        });
        if is_public { RouteClass::Public } else { RouteClass::Neutral }
    }
}

// =============================================================================
// CONFIG
// =============================================================================

#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub routes: RouteTable,
    pub login_path: String,
    pub default_landing: String,
    /// role -> landing page for authenticated users hitting the login page
    pub role_landings: HashMap<String, String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            routes: RouteTable::default(),
            login_path: "/login".into(),
            default_landing: "/dashboard".into(),
            role_landings: HashMap::from([("clerk".to_owned(), "/Gatepass".to_owned())]),
        }
    }
}

// =============================================================================
// DECISION
// =============================================================================

/// Identity resolved from a valid `pb_auth` cookie.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthUser {
    pub user: Record,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Let the request through, with the identity when one was resolved.
    Continue(Option<AuthUser>),
    /// Send a 302 to this path (origin is added by the middleware).
    Redirect(String),
}

#[derive(Debug, Clone, Default)]
pub struct RouteGuard {
    config: GuardConfig,
}

impl RouteGuard {
    #[must_use]
    pub fn new(config: GuardConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    #[must_use]
    pub fn decide(&self, path: &str, cookie: Option<&str>) -> Decision {
        self.decide_at(path, cookie, now_unix())
    }

    #[must_use]
    pub fn decide_at(&self, path: &str, cookie: Option<&str>, now: i64) -> Decision {
        let class = self.config.routes.classify(path);

        if class == RouteClass::Protected {
            let Some(raw) = cookie.filter(|c| !c.is_empty()) else {
                return Decision::Redirect(self.login_redirect(path));
            };
            return match load_identity(raw, now) {
                Ok(user) => Decision::Continue(Some(user)),
                Err(e) => {
                    warn!(error = %e, %path, "auth cookie validation failed");
                    Decision::Redirect(self.login_redirect(path))
                }
            };
        }

        if path == self.config.login_path {
            if let Some(raw) = cookie.filter(|c| !c.is_empty()) {
                match load_identity(raw, now) {
                    Ok(auth) => return Decision::Redirect(self.landing_for(&auth.user).to_owned()),
                    Err(e) => warn!(error = %e, %path, "auth cookie validation failed; rendering login"),
                }
            }
        }

        Decision::Continue(None)
    }

    /// Landing page for an authenticated user, by role.
    #[must_use]
    pub fn landing_for(&self, user: &Record) -> &str {
        user.role()
            .and_then(|role| self.config.role_landings.get(role))
            .map_or(self.config.default_landing.as_str(), String::as_str)
    }

    #[must_use]
    pub fn login_redirect(&self, path: &str) -> String {
        format!("{}?redirect={}", self.config.login_path, urlencoding::encode(path))
    }
}

fn load_identity(raw: &str, now: i64) -> Result<AuthUser, CredentialError> {
    let auth = validate_blob(parse_blob(raw)?, now)?;
    let token = auth.token().unwrap_or_default().to_owned();
    let user = auth
        .export()
        .record
        .ok_or(CredentialError::MissingIdentity)?;
    Ok(AuthUser { user, token })
}

// =============================================================================
// MIDDLEWARE
// =============================================================================

/// `<scheme>://<host>` of the incoming request.
fn request_origin(headers: &HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map_or("http", str::trim);
    format!("{scheme}://{host}")
}

/// The `pb_auth` value, as read by both the middleware and the extractor.
pub(crate) fn auth_cookie_value(headers: &HeaderMap) -> Option<String> {
    CookieJar::from_headers(headers)
        .get(COOKIE_NAME)
        .map(|c| c.value().to_owned())
}

fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_owned())]).into_response()
}

/// Axum middleware wrapping every page and API route.
pub async fn route_guard(State(guard): State<Arc<RouteGuard>>, mut req: Request, next: Next) -> Response {
    let path = req.uri().path().to_owned();
    let cookie = auth_cookie_value(req.headers());

    match guard.decide(&path, cookie.as_deref()) {
        Decision::Continue(user) => {
            if let Some(user) = user {
                req.extensions_mut().insert(user);
            }
            next.run(req).await
        }
        Decision::Redirect(target) => {
            let origin = request_origin(req.headers());
            found(&format!("{origin}{target}"))
        }
    }
}

// =============================================================================
// EXTRACTOR
// =============================================================================

/// Authenticated user for handlers. Uses the identity the guard attached,
/// falling back to validating the cookie for routes outside the protected
/// table (e.g. `/api/*`).
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(user) = parts.extensions.get::<AuthUser>() {
            return Ok(user.clone());
        }
        let raw = auth_cookie_value(&parts.headers).ok_or(StatusCode::UNAUTHORIZED)?;
        load_identity(&raw, now_unix()).map_err(|e| {
            warn!(error = %e, "api auth cookie rejected");
            StatusCode::UNAUTHORIZED
        })
    }
}

#[cfg(test)]
#[path = "guard_test.rs"]
mod tests;
