//! Gatepass desk — drivers, vehicles and issued passes on top of `RecordAccess`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::records::{RecordAccess, Subscription};
use crate::store::{FeedEvent, ListResult, Record, StoreError};

pub const DRIVERS: &str = "driver_profile";
pub const VEHICLES: &str = "vehicles";
pub const GATEPASSES: &str = "gatepasses";

pub const DEFAULT_PER_PAGE: u32 = 50;

/// Fields matched by driver search.
pub const DRIVER_SEARCH_FIELDS: [&str; 3] = ["name", "id_no", "phone_no"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Driver {
    pub id: String,
    pub name: String,
    pub id_no: String,
    pub phone_no: String,
}

impl From<&Record> for Driver {
    fn from(record: &Record) -> Self {
        Self {
            id: record.id.clone(),
            name: text(record, "name"),
            id_no: text(record, "id_no"),
            phone_no: text(record, "phone_no"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: String,
    pub vehicle_number: String,
    pub model: String,
    pub number_plate: String,
}

impl From<&Record> for Vehicle {
    fn from(record: &Record) -> Self {
        Self {
            id: record.id.clone(),
            vehicle_number: text(record, "vehicle_number"),
            model: text(record, "model"),
            number_plate: text(record, "number_plate"),
        }
    }
}

/// Missing fields become empty strings; numbers are stringified.
fn text(record: &Record, key: &str) -> String {
    match record.fields.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

// =============================================================================
// DRIVERS
// =============================================================================

/// Newest drivers first.
///
/// # Errors
///
/// Propagates `StoreError` from the access layer.
pub async fn list_drivers(access: &RecordAccess, page: u32, per_page: u32) -> Result<Vec<Driver>, StoreError> {
    let result = access.list(DRIVERS, page, per_page).await?;
    Ok(result.items.iter().map(Driver::from).collect())
}

/// Full driver record.
///
/// # Errors
///
/// `NotFound` for unknown ids.
pub async fn get_driver(access: &RecordAccess, id: &str) -> Result<Record, StoreError> {
    access.get(DRIVERS, id).await
}

/// Drivers whose name, id number or phone number contains `query`.
///
/// # Errors
///
/// Propagates `StoreError` from the access layer.
pub async fn search_drivers(
    access: &RecordAccess,
    query: &str,
    page: u32,
    per_page: u32,
) -> Result<Vec<Driver>, StoreError> {
    let result = access
        .search(DRIVERS, &DRIVER_SEARCH_FIELDS, query, page, per_page)
        .await?;
    Ok(result.items.iter().map(Driver::from).collect())
}

/// # Errors
///
/// Propagates `StoreError` from the access layer.
pub async fn create_driver(access: &RecordAccess, data: &Value) -> Result<Record, StoreError> {
    access.create(DRIVERS, data).await
}

/// # Errors
///
/// Propagates `StoreError` from the access layer.
pub async fn update_driver(access: &RecordAccess, id: &str, data: &Value) -> Result<Record, StoreError> {
    access.update(DRIVERS, id, data).await
}

/// # Errors
///
/// Propagates `StoreError` from the access layer.
pub async fn delete_driver(access: &RecordAccess, id: &str) -> Result<(), StoreError> {
    access.delete(DRIVERS, id).await
}

/// Stream every driver change to `callback`, replacing any earlier watch.
///
/// # Errors
///
/// Propagates `StoreError` from the access layer.
pub async fn watch_drivers<F>(access: &RecordAccess, callback: F) -> Result<Uuid, StoreError>
where
    F: Fn(FeedEvent) + Send + Sync + 'static,
{
    access.subscribe(DRIVERS, callback).await
}

pub async fn unwatch_drivers(access: &RecordAccess) -> bool {
    access.unsubscribe(DRIVERS).await
}

/// Watch a single driver record; the caller owns the subscription.
///
/// # Errors
///
/// Propagates `StoreError` from the access layer.
pub async fn watch_driver<F>(access: &RecordAccess, id: &str, callback: F) -> Result<Subscription, StoreError>
where
    F: Fn(FeedEvent) + Send + Sync + 'static,
{
    access.watch(DRIVERS, id, callback).await
}

// =============================================================================
// VEHICLES
// =============================================================================

/// # Errors
///
/// Propagates `StoreError` from the access layer.
pub async fn list_vehicles(access: &RecordAccess, page: u32, per_page: u32) -> Result<Vec<Vehicle>, StoreError> {
    let result = access.list(VEHICLES, page, per_page).await?;
    Ok(result.items.iter().map(Vehicle::from).collect())
}

/// # Errors
///
/// `NotFound` for unknown ids.
pub async fn get_vehicle(access: &RecordAccess, id: &str) -> Result<Record, StoreError> {
    access.get(VEHICLES, id).await
}

// =============================================================================
// GATE PASSES
// =============================================================================

/// # Errors
///
/// Propagates `StoreError` from the access layer.
pub async fn create_gatepass(access: &RecordAccess, data: &Value) -> Result<Record, StoreError> {
    access.create(GATEPASSES, data).await
}

/// Raw page of issued passes, newest first.
///
/// # Errors
///
/// Propagates `StoreError` from the access layer.
pub async fn list_gatepasses(access: &RecordAccess, page: u32, per_page: u32) -> Result<ListResult, StoreError> {
    access.list(GATEPASSES, page, per_page).await
}

#[cfg(test)]
#[path = "gatepass_test.rs"]
mod tests;
