use axum::body::Body;
use axum::http::{Request, header};
use tower::ServiceExt;

use super::*;
use crate::state::test_helpers::{auth_cookie_header, test_app_state, user};

fn site() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "home").unwrap();
    std::fs::create_dir_all(dir.path().join("dashboard")).unwrap();
    std::fs::write(dir.path().join("dashboard/index.html"), "dashboard").unwrap();
    std::fs::create_dir_all(dir.path().join("login")).unwrap();
    std::fs::write(dir.path().join("login/index.html"), "login").unwrap();
    dir
}

fn get(path: &str, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(path).header(header::HOST, "localhost:3000");
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn healthz_ok() {
    let resp = api_routes(test_app_state()).oneshot(get("/healthz", None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn app_serves_public_pages() {
    let site = site();
    let resp = app(test_app_state(), site.path()).oneshot(get("/", None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn app_guards_protected_pages() {
    let site = site();
    let resp = app(test_app_state(), site.path())
        .oneshot(get("/dashboard/", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(resp.headers()[header::LOCATION], "http://localhost:3000/login?redirect=%2Fdashboard%2F");

    let cookie = auth_cookie_header(&user("alice", "admin"));
    let resp = app(test_app_state(), site.path())
        .oneshot(get("/dashboard/", Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn app_redirects_signed_in_user_away_from_login() {
    let site = site();
    let cookie = auth_cookie_header(&user("carol", "clerk"));
    let resp = app(test_app_state(), site.path())
        .oneshot(get("/login", Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(resp.headers()[header::LOCATION], "http://localhost:3000/Gatepass");
}

#[tokio::test]
async fn api_without_cookie_is_unauthorized_not_redirected() {
    let site = site();
    let resp = app(test_app_state(), site.path())
        .oneshot(get("/api/drivers", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[test]
fn store_errors_map_to_statuses() {
    let not_found = StoreError::NotFound { collection: "c".into(), id: "x".into() };
    assert_eq!(store_error_to_status(&not_found), StatusCode::NOT_FOUND);
    assert_eq!(store_error_to_status(&StoreError::InvalidCredentials), StatusCode::UNAUTHORIZED);
    assert_eq!(
        store_error_to_status(&StoreError::Response { status: 400, message: String::new() }),
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        store_error_to_status(&StoreError::Response { status: 403, message: String::new() }),
        StatusCode::FORBIDDEN
    );
    assert_eq!(store_error_to_status(&StoreError::Request("timeout".into())), StatusCode::BAD_GATEWAY);
    assert_eq!(store_error_to_status(&StoreError::Timeout), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(
        store_error_to_status(&StoreError::Response { status: 500, message: String::new() }),
        StatusCode::BAD_GATEWAY
    );
}
