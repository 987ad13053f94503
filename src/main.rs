use std::sync::Arc;

use gatepass::config::AppConfig;
use gatepass::guard::RouteGuard;
use gatepass::routes;
use gatepass::state::AppState;
use gatepass::store::RecordStore;
use gatepass::store::http::HttpRecordStore;
use gatepass::store::memory::MemoryRecordStore;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let config = AppConfig::from_env().expect("invalid configuration");

    // `--memory` runs against an in-process store, seeded with the service
    // identity when one is configured.
    let store: Arc<dyn RecordStore> = if std::env::args().any(|arg| arg == "--memory") {
        let store = MemoryRecordStore::new();
        if let Some(service) = &config.service {
            let record = gatepass::store::Record::new("service").with_field("email", service.identity.clone());
            store.add_user(&service.collection, &service.identity, &service.secret, record);
        }
        tracing::warn!("using in-memory record store; data is not persisted");
        Arc::new(store)
    } else {
        let store = HttpRecordStore::new(&config.store).expect("record store client init failed");
        tracing::info!(url = %config.store.base_url, "record store configured");
        Arc::new(store)
    };

    if config.service.is_none() {
        tracing::warn!("SERVICE_IDENTITY not set; record calls without a session go out anonymously");
    }

    let state = AppState::new(
        store,
        RouteGuard::new(config.guard.clone()),
        config.service.clone(),
        config.store.auth_collection.clone(),
        config.cookie_secure,
    );
    let app = routes::app(state, &config.website_dir);

    let port = config.port;
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "gatepass listening");
    axum::serve(listener, app).await.expect("server failed");
}
