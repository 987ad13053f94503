use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;
use crate::state::test_helpers::{PASSWORD, live_token, seeded_store, service_identity, user};
use crate::store::ChangeAction;
use crate::store::memory::MemoryRecordStore;

fn access(store: &Arc<MemoryRecordStore>, service: Option<ServiceIdentity>) -> RecordAccess {
    RecordAccess::new(store.clone(), CredentialHolder::new(), service)
}

fn counter() -> (Arc<AtomicUsize>, impl Fn(FeedEvent) + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    (count, move |event| {
        if matches!(event, FeedEvent::Change { .. }) {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    })
}

// =============================================================================
// authenticate
// =============================================================================

#[tokio::test]
async fn authenticate_prefers_session_token() {
    let store = Arc::new(seeded_store());
    let holder = CredentialHolder::new();
    let token = live_token("alice");
    holder.save(token.clone(), Some(user("alice", "admin")));
    let access = RecordAccess::new(store.clone(), holder, Some(service_identity()));

    assert_eq!(access.authenticate().await.unwrap(), Some(token));
    assert_eq!(store.auth_calls(), 0);
}

#[tokio::test]
async fn authenticate_logs_in_service_identity_once() {
    let store = Arc::new(seeded_store());
    let access = access(&store, Some(service_identity()));

    let first = access.authenticate().await.unwrap();
    let second = access.authenticate().await.unwrap();
    assert!(first.is_some());
    assert_eq!(first, second);
    assert_eq!(store.auth_calls(), 1);
    assert!(access.holder().snapshot().token().is_none(), "service auth never lands in the shared holder");
}

#[tokio::test]
async fn concurrent_callers_share_one_service_login() {
    let store = Arc::new(seeded_store());
    let access = access(&store, Some(service_identity()));

    let (a, b, c) = tokio::join!(access.authenticate(), access.authenticate(), access.authenticate());
    let a = a.unwrap();
    assert!(a.is_some());
    assert_eq!(b.unwrap(), a);
    assert_eq!(c.unwrap(), a);
    assert_eq!(store.auth_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn service_login_is_shared_across_tasks() {
    let store = Arc::new(seeded_store().requiring_auth());
    let access = Arc::new(access(&store, Some(service_identity())));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let access = Arc::clone(&access);
            tokio::spawn(async move { access.list("vehicles", 1, 10).await })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap().items.len(), 1);
    }
    assert_eq!(store.auth_calls(), 1);
}

#[tokio::test]
async fn authenticate_reauths_when_service_token_expires() {
    let store = Arc::new(MemoryRecordStore::new().with_token_ttl(crate::credential::EXPIRY_THRESHOLD_SECS));
    let service = service_identity();
    store.add_user(&service.collection, &service.identity, PASSWORD, user("desk", "service"));
    let access = access(&store, Some(service));

    access.authenticate().await.unwrap();
    access.authenticate().await.unwrap();
    assert_eq!(store.auth_calls(), 2);
}

#[tokio::test]
async fn authenticate_without_service_is_anonymous() {
    let store = Arc::new(seeded_store());
    assert_eq!(access(&store, None).authenticate().await.unwrap(), None);
}

#[tokio::test]
async fn authenticate_propagates_bad_service_secret() {
    let store = Arc::new(seeded_store());
    let service = ServiceIdentity { secret: "wrong".into(), ..service_identity() };
    let err = access(&store, Some(service)).list("driver_profile", 1, 10).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidCredentials));
}

#[tokio::test]
async fn store_rejection_propagates_unchanged() {
    let store = Arc::new(MemoryRecordStore::new().requiring_auth());
    let err = access(&store, None).list("driver_profile", 1, 10).await.unwrap_err();
    assert!(matches!(err, StoreError::Response { status: 401, .. }));
}

#[test]
fn service_identity_debug_hides_secret() {
    let rendered = format!("{:?}", service_identity());
    assert!(!rendered.contains(PASSWORD));
    assert!(rendered.contains("redacted"));
}

// =============================================================================
// CRUD + search
// =============================================================================

#[tokio::test]
async fn crud_round_trip_through_service_identity() {
    let store = Arc::new(seeded_store().requiring_auth());
    let access = access(&store, Some(service_identity()));

    let created = access
        .create("vehicles", &serde_json::json!({ "vehicle_number": "V-02", "model": "Canter" }))
        .await
        .unwrap();
    assert_eq!(access.get("vehicles", &created.id).await.unwrap().get_str("model"), Some("Canter"));

    let updated = access
        .update("vehicles", &created.id, &serde_json::json!({ "model": "Canter 2" }))
        .await
        .unwrap();
    assert_eq!(updated.get_str("model"), Some("Canter 2"));

    access.delete("vehicles", &created.id).await.unwrap();
    assert!(matches!(access.get("vehicles", &created.id).await, Err(StoreError::NotFound { .. })));
}

#[tokio::test]
async fn list_is_newest_first() {
    let store = Arc::new(seeded_store());
    let access = access(&store, None);
    let page = access.list("driver_profile", 1, 50).await.unwrap();
    let names: Vec<_> = page.items.iter().filter_map(|r| r.get_str("name")).collect();
    assert_eq!(names, ["John Kamau", "Mary Wanjiku", "Peter Otieno"]);
}

#[tokio::test]
async fn search_matches_any_field_case_insensitively() {
    let store = Arc::new(seeded_store());
    store.seed("driver_profile", Record::default().with_field("name", "Agnes 07"));
    let access = access(&store, None);

    let hits = access
        .search("driver_profile", &["name", "id_no", "phone_no"], "07", 1, 50)
        .await
        .unwrap();
    let mut names: Vec<_> = hits.items.iter().filter_map(|r| r.get_str("name")).collect();
    names.sort_unstable();
    // Peter hits on id_no and phone_no, Agnes on name.
    assert_eq!(names, ["Agnes 07", "Peter Otieno"]);

    let hits = access
        .search("driver_profile", &["name", "id_no", "phone_no"], "wANJ", 1, 50)
        .await
        .unwrap();
    assert_eq!(hits.items.len(), 1);

    let none = access
        .search("driver_profile", &["name", "id_no", "phone_no"], "zzz", 1, 50)
        .await
        .unwrap();
    assert!(none.items.is_empty());
}

// =============================================================================
// subscriptions
// =============================================================================

#[tokio::test]
async fn unsubscribe_before_subscribe_is_noop() {
    let store = Arc::new(seeded_store());
    let access = access(&store, None);
    assert!(!access.unsubscribe("driver_profile").await);
    assert!(!access.unsubscribe("driver_profile").await);
}

#[tokio::test]
async fn unsubscribe_twice_is_noop() {
    let store = Arc::new(seeded_store());
    let access = access(&store, None);
    let (_count, callback) = counter();
    access.subscribe("driver_profile", callback).await.unwrap();

    assert!(access.unsubscribe("driver_profile").await);
    assert!(!access.unsubscribe("driver_profile").await);
    assert_eq!(store.watcher_count(), 0);
    assert!(access.watched().await.is_empty());
}

#[tokio::test]
async fn second_subscribe_retires_first() {
    let store = Arc::new(seeded_store());
    let access = access(&store, None);
    let (first_count, first) = counter();
    let (second_count, second) = counter();

    let first_id = access.subscribe("driver_profile", first).await.unwrap();
    let second_id = access.subscribe("driver_profile", second).await.unwrap();
    assert_ne!(first_id, second_id);
    assert_eq!(store.watcher_count(), 1);
    assert_eq!(access.watched().await, ["driver_profile"]);

    access
        .create("driver_profile", &serde_json::json!({ "name": "New" }))
        .await
        .unwrap();
    assert_eq!(first_count.load(Ordering::SeqCst), 0);
    assert_eq!(second_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn subscriptions_are_per_collection() {
    let store = Arc::new(seeded_store());
    let access = access(&store, None);
    let (drivers, on_driver) = counter();
    let (vehicles, on_vehicle) = counter();
    access.subscribe("driver_profile", on_driver).await.unwrap();
    access.subscribe("vehicles", on_vehicle).await.unwrap();
    assert_eq!(store.watcher_count(), 2);

    access.create("vehicles", &serde_json::json!({})).await.unwrap();
    assert_eq!(drivers.load(Ordering::SeqCst), 0);
    assert_eq!(vehicles.load(Ordering::SeqCst), 1);

    access.close_all().await;
    assert_eq!(store.watcher_count(), 0);
}

#[tokio::test]
async fn failed_resubscribe_still_retires_old_handle() {
    let store = Arc::new(seeded_store().requiring_auth());
    let holder = CredentialHolder::new();
    let access = RecordAccess::new(store.clone(), holder.clone(), Some(service_identity()));
    let (_count, callback) = counter();
    access.subscribe("driver_profile", callback).await.unwrap();

    // A forged session token takes precedence and the store rejects it.
    holder.save(live_token("mallory"), Some(user("mallory", "admin")));
    let (_count, callback) = counter();
    assert!(access.subscribe("driver_profile", callback).await.is_err());
    assert_eq!(store.watcher_count(), 0);
    assert!(access.watched().await.is_empty());
}

#[tokio::test]
async fn transport_loss_reaches_callback() {
    let store = Arc::new(seeded_store());
    let access = access(&store, None);
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reasons);
    access
        .subscribe("driver_profile", move |event| {
            if let FeedEvent::Disconnected { reason } = event {
                sink.lock().unwrap().push(reason);
            }
        })
        .await
        .unwrap();

    store.disconnect_all("network down");
    assert_eq!(*reasons.lock().unwrap(), ["network down"]);
}

#[tokio::test]
async fn watch_is_owned_by_caller() {
    let store = Arc::new(seeded_store());
    let access = access(&store, None);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let mut subscription = access
        .watch("driver_profile", "*", move |event| {
            if let FeedEvent::Change { action, .. } = event {
                sink.lock().unwrap().push(action);
            }
        })
        .await
        .unwrap();
    assert!(subscription.is_live());
    assert_eq!(subscription.collection(), "driver_profile");
    assert!(access.watched().await.is_empty());

    access.create("driver_profile", &serde_json::json!({})).await.unwrap();
    subscription.close();
    subscription.close();
    assert!(!subscription.is_live());
    access.create("driver_profile", &serde_json::json!({})).await.unwrap();

    assert_eq!(*seen.lock().unwrap(), [ChangeAction::Create]);
}

#[tokio::test]
async fn dropping_subscription_closes_it() {
    let store = Arc::new(seeded_store());
    let access = access(&store, None);
    let (_count, callback) = counter();
    drop(access.watch("vehicles", "*", callback).await.unwrap());
    assert_eq!(store.watcher_count(), 0);
}
