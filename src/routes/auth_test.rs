use axum::body::Body;
use axum::http::{Request, header};
use axum::response::Response;
use tower::ServiceExt;

use super::*;
use crate::credential::parse_blob;
use crate::routes::api_routes;
use crate::state::test_helpers::{PASSWORD, auth_cookie_header, test_app_state, user};

fn post_json(path: &str, body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body<T: serde::de::DeserializeOwned>(resp: Response) -> T {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn set_cookie(resp: &Response) -> String {
    resp.headers()[header::SET_COOKIE].to_str().unwrap().to_owned()
}

/// Value of the `pb_auth` pair in a `Set-Cookie` header.
fn cookie_value(set_cookie: &str) -> String {
    let pair = set_cookie.split(';').next().unwrap();
    pair.strip_prefix("pb_auth=").unwrap().to_owned()
}

#[tokio::test]
async fn login_sets_session_cookie() {
    let body = serde_json::json!({ "identity": "alice@gatepass.test", "password": PASSWORD });
    let resp = api_routes(test_app_state()).oneshot(post_json("/api/auth/login", &body)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let line = set_cookie(&resp);
    assert!(line.contains("Max-Age=86400"), "{line}");
    assert!(line.contains("Path=/"));
    assert!(line.contains("SameSite=Strict"));

    let blob = parse_blob(&cookie_value(&line)).unwrap();
    assert_eq!(blob.record.unwrap().id, "alice");

    let login: LoginResponse = json_body(resp).await;
    assert_eq!(login.user.id, "alice");
    assert_eq!(login.landing, "/dashboard");
}

#[tokio::test]
async fn login_remember_sets_thirty_day_cookie() {
    let body = serde_json::json!({ "identity": "carol@gatepass.test", "password": PASSWORD, "remember": true });
    let resp = api_routes(test_app_state()).oneshot(post_json("/api/auth/login", &body)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(set_cookie(&resp).contains("Max-Age=2592000"));

    let login: LoginResponse = json_body(resp).await;
    assert_eq!(login.landing, "/Gatepass");
}

#[tokio::test]
async fn login_wrong_password_is_unauthorized() {
    let body = serde_json::json!({ "identity": "alice@gatepass.test", "password": "nope" });
    let resp = api_routes(test_app_state()).oneshot(post_json("/api/auth/login", &body)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert!(resp.headers().get(header::SET_COOKIE).is_none());
}

#[tokio::test]
async fn login_blank_fields_rejected() {
    let body = serde_json::json!({ "identity": "  ", "password": PASSWORD });
    let resp = api_routes(test_app_state()).oneshot(post_json("/api/auth/login", &body)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn logout_clears_cookie_without_session() {
    let resp = api_routes(test_app_state())
        .oneshot(post_json("/api/auth/logout", &serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    let line = set_cookie(&resp);
    assert!(line.starts_with("pb_auth=;"), "{line}");
    assert!(line.contains("Max-Age=0"));
}

#[tokio::test]
async fn me_returns_cookie_identity() {
    let req = Request::builder()
        .uri("/api/auth/me")
        .header(header::COOKIE, auth_cookie_header(&user("alice", "admin")))
        .body(Body::empty())
        .unwrap();
    let resp = api_routes(test_app_state()).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let me: Record = json_body(resp).await;
    assert_eq!(me.id, "alice");
    assert_eq!(me.role(), Some("admin"));
}

#[tokio::test]
async fn me_without_cookie_is_unauthorized() {
    let req = Request::builder().uri("/api/auth/me").body(Body::empty()).unwrap();
    let resp = api_routes(test_app_state()).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}
