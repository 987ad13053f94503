//! Auth routes — password login, logout, current identity.
//!
//! The server holds no session table: login exchanges a password for a store
//! token and hands the exported credential back as the `pb_auth` cookie,
//! which the route guard validates on every later request.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::credential::CredentialBlob;
use crate::guard::AuthUser;
use crate::persist::{CookieLifetime, auth_cookie, removal_cookie};
use crate::routes::store_error_to_status;
use crate::state::AppState;
use crate::store::{Record, StoreError};

#[derive(Deserialize)]
pub struct LoginBody {
    pub identity: String,
    pub password: String,
    #[serde(default)]
    pub remember: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user: Record,
    /// Where the client should navigate next.
    pub landing: String,
}

/// `POST /api/auth/login` — authenticate and set the auth cookie.
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(body): Json<LoginBody>,
) -> Result<(CookieJar, Json<LoginResponse>), StatusCode> {
    let identity = body.identity.trim();
    if identity.is_empty() || body.password.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let auth = state
        .store
        .authenticate(&state.auth_collection, identity, &body.password)
        .await
        .map_err(|e| {
            match &e {
                StoreError::InvalidCredentials => info!(%identity, "login rejected"),
                other => warn!(error = %other, "login: store error"),
            }
            store_error_to_status(&e)
        })?;

    let value = CredentialBlob { token: auth.token, record: Some(auth.record.clone()) }
        .to_json()
        .map_err(|e| {
            warn!(error = %e, "login: credential encode failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    let cookie = auth_cookie(value, CookieLifetime::for_remember(body.remember), state.cookie_secure);

    let landing = state.guard.landing_for(&auth.record).to_owned();
    info!(user = %auth.record.id, remember = body.remember, "login succeeded");
    Ok((jar.add(cookie), Json(LoginResponse { user: auth.record, landing })))
}

/// `POST /api/auth/logout` — clear the auth cookie. Always succeeds.
pub async fn logout(State(state): State<AppState>, jar: CookieJar) -> impl IntoResponse {
    (jar.add(removal_cookie(state.cookie_secure)), StatusCode::NO_CONTENT)
}

/// `GET /api/auth/me` — identity resolved from the cookie.
pub async fn me(auth: AuthUser) -> Json<Record> {
    Json(auth.user)
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
