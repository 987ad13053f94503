//! Driver, vehicle and gate-pass routes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::gatepass::{self, DEFAULT_PER_PAGE, Driver, Vehicle};
use crate::guard::AuthUser;
use crate::routes::store_error_to_status;
use crate::state::AppState;
use crate::store::{Record, StoreError};

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    /// Free-text search over name, id number and phone number.
    pub q: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl ListParams {
    fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    fn per_page(&self) -> u32 {
        self.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, 500)
    }
}

fn to_status(err: &StoreError) -> StatusCode {
    if !matches!(err, StoreError::NotFound { .. }) {
        warn!(error = %err, "record route: store error");
    }
    store_error_to_status(err)
}

/// `GET /api/drivers` — newest first, or matching `q`.
pub async fn list_drivers(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Driver>>, StatusCode> {
    let access = state.records_for(&auth);
    let drivers = match params.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        Some(q) => gatepass::search_drivers(&access, q, params.page(), params.per_page()).await,
        None => gatepass::list_drivers(&access, params.page(), params.per_page()).await,
    }
    .map_err(|e| to_status(&e))?;
    Ok(Json(drivers))
}

/// `GET /api/drivers/{id}` — full driver record.
pub async fn get_driver(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Record>, StatusCode> {
    let access = state.records_for(&auth);
    gatepass::get_driver(&access, &id)
        .await
        .map(Json)
        .map_err(|e| to_status(&e))
}

/// `GET /api/vehicles` — newest first.
pub async fn list_vehicles(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Vehicle>>, StatusCode> {
    let access = state.records_for(&auth);
    gatepass::list_vehicles(&access, params.page(), params.per_page())
        .await
        .map(Json)
        .map_err(|e| to_status(&e))
}

/// `POST /api/gatepasses` — issue a pass. The caller is stamped as `issued_by`.
pub async fn create_gatepass(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Record>), StatusCode> {
    let Value::Object(mut fields) = body else {
        return Err(StatusCode::BAD_REQUEST);
    };
    fields.insert("issued_by".into(), Value::String(auth.user.id.clone()));

    let access = state.records_for(&auth);
    let record = gatepass::create_gatepass(&access, &Value::Object(fields))
        .await
        .map_err(|e| to_status(&e))?;
    info!(id = %record.id, issued_by = %auth.user.id, "gatepass issued");
    Ok((StatusCode::CREATED, Json(record)))
}

#[cfg(test)]
#[path = "records_test.rs"]
mod tests;
