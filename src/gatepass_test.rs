use std::sync::{Arc, Mutex};

use super::*;
use crate::credential::CredentialHolder;
use crate::state::test_helpers::{seeded_store, service_identity};
use crate::store::ChangeAction;
use crate::store::memory::MemoryRecordStore;

fn desk() -> (Arc<MemoryRecordStore>, RecordAccess) {
    let store = Arc::new(seeded_store());
    let access = RecordAccess::new(store.clone(), CredentialHolder::new(), Some(service_identity()));
    (store, access)
}

#[test]
fn driver_projection_fills_missing_and_numeric_fields() {
    let record = Record::new("d1")
        .with_field("name", "Peter")
        .with_field("id_no", 2_207_731)
        .with_field("extra", "ignored");
    let driver = Driver::from(&record);
    assert_eq!(
        driver,
        Driver { id: "d1".into(), name: "Peter".into(), id_no: "2207731".into(), phone_no: String::new() }
    );
}

#[test]
fn vehicle_projection_reads_plate() {
    let record = Record::new("v1")
        .with_field("vehicle_number", "V-01")
        .with_field("model", "Isuzu")
        .with_field("number_plate", "KDA 123A");
    assert_eq!(Vehicle::from(&record).number_plate, "KDA 123A");
}

#[tokio::test]
async fn list_and_search_drivers() {
    let (_store, access) = desk();
    let drivers = list_drivers(&access, 1, DEFAULT_PER_PAGE).await.unwrap();
    assert_eq!(drivers.len(), 3);
    assert_eq!(drivers[0].name, "John Kamau");

    let hits = search_drivers(&access, "0711", 1, DEFAULT_PER_PAGE).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].name, "Peter Otieno");

    let paged = list_drivers(&access, 2, 2).await.unwrap();
    assert_eq!(paged.len(), 1);
}

#[tokio::test]
async fn driver_lifecycle() {
    let (_store, access) = desk();
    let created = create_driver(&access, &serde_json::json!({ "name": "Agnes", "id_no": "4455", "phone_no": "0700" }))
        .await
        .unwrap();
    assert_eq!(get_driver(&access, &created.id).await.unwrap().get_str("name"), Some("Agnes"));

    let updated = update_driver(&access, &created.id, &serde_json::json!({ "phone_no": "0701" }))
        .await
        .unwrap();
    assert_eq!(Driver::from(&updated).phone_no, "0701");

    delete_driver(&access, &created.id).await.unwrap();
    assert!(matches!(get_driver(&access, &created.id).await, Err(StoreError::NotFound { .. })));
}

#[tokio::test]
async fn vehicles_and_gatepasses() {
    let (_store, access) = desk();
    let vehicles = list_vehicles(&access, 1, DEFAULT_PER_PAGE).await.unwrap();
    assert_eq!(vehicles.len(), 1);
    let vehicle = get_vehicle(&access, &vehicles[0].id).await.unwrap();
    assert_eq!(vehicle.get_str("model"), Some("Isuzu FRR"));

    let drivers = list_drivers(&access, 1, 1).await.unwrap();
    let pass = create_gatepass(&access, &serde_json::json!({ "driver": drivers[0].id, "vehicle": vehicle.id }))
        .await
        .unwrap();
    let issued = list_gatepasses(&access, 1, 10).await.unwrap();
    assert_eq!(issued.total_items, 1);
    assert_eq!(issued.items[0].id, pass.id);
}

#[tokio::test]
async fn watch_drivers_replaces_and_unwatches() {
    let (store, access) = desk();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    watch_drivers(&access, move |event| {
        if let FeedEvent::Change { action, .. } = event {
            sink.lock().unwrap().push(action);
        }
    })
    .await
    .unwrap();
    watch_drivers(&access, |_| {}).await.unwrap();
    assert_eq!(store.watcher_count(), 1);

    create_driver(&access, &serde_json::json!({ "name": "X" })).await.unwrap();
    assert!(seen.lock().unwrap().is_empty(), "replaced watcher must stay silent");

    assert!(unwatch_drivers(&access).await);
    assert!(!unwatch_drivers(&access).await);
    assert_eq!(store.watcher_count(), 0);
}

#[tokio::test]
async fn watch_single_driver() {
    let (store, access) = desk();
    let drivers = list_drivers(&access, 1, 10).await.unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let _subscription = watch_driver(&access, &drivers[0].id, move |event| {
        if let FeedEvent::Change { action, record } = event {
            sink.lock().unwrap().push((action, record.id));
        }
    })
    .await
    .unwrap();

    update_driver(&access, &drivers[1].id, &serde_json::json!({ "name": "other" })).await.unwrap();
    update_driver(&access, &drivers[0].id, &serde_json::json!({ "name": "mine" })).await.unwrap();
    assert_eq!(*seen.lock().unwrap(), [(ChangeAction::Update, drivers[0].id.clone())]);
    assert_eq!(store.watcher_count(), 1);
}
