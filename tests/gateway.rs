//! Gateway integration tests — drive the HTTP surface end to end via
//! `tower::ServiceExt::oneshot`, the same pattern used to exercise axum
//! services without binding a socket.

use authority_server::bootstrap;
use authority_server::db::Db;
use authority_server::gateway::{self, AppState};
use authority_server::token::{Subject, TokenService};
use authority_server::webauthn::RelyingParty;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn test_state() -> (AppState, Arc<Db>) {
    let db = Arc::new(Db::open_memory().unwrap());
    bootstrap::seed(&db).unwrap();
    let state = AppState {
        db: db.clone(),
        tokens: Arc::new(TokenService::new([3u8; 32])),
        rp: Arc::new(RelyingParty {
            server_domain: "example.com".into(),
            origins: vec!["https://example.com".into()],
        }),
        session_lifetime: chrono::Duration::hours(1),
        challenge_lifetime: chrono::Duration::minutes(5),
    };
    (state, db)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn bearer_for(state: &AppState, db: &Db, user_id: &str, display_name: &str, roles: Vec<String>) -> String {
    db.create_user(user_id, display_name, None).ok();
    let subject = Subject {
        user_id: user_id.to_string(),
        display_name: display_name.to_string(),
        email: None,
        roles,
    };
    let (token, jti) = state.tokens.mint(&subject, state.session_lifetime);
    db.insert_session(&jti, user_id, None, state.session_lifetime, None, None).unwrap();
    token
}

#[tokio::test]
async fn health_check_reports_ok() {
    let (state, _db) = test_state();
    let app = gateway::router(state);

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn protected_routes_reject_missing_bearer() {
    let (state, _db) = test_state();
    let app = gateway::router(state);

    let response = app
        .oneshot(Request::builder().uri("/auth/session").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn protected_routes_reject_malformed_bearer() {
    let (state, _db) = test_state();
    let app = gateway::router(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/auth/session")
                .header("authorization", "Basic abc")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn session_endpoint_returns_claims_for_valid_token() {
    let (state, db) = test_state();
    let token = bearer_for(&state, &db, "u1", "Ada", vec!["user".into()]);
    let app = gateway::router(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/auth/session")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let payload = body_json(response).await;
    assert_eq!(payload["userId"], "u1");
    assert_eq!(payload["displayName"], "Ada");
    assert_eq!(payload["roles"][0], "user");
}

#[tokio::test]
async fn logout_revokes_session_and_future_checks_fail() {
    let (state, db) = test_state();
    let token = bearer_for(&state, &db, "u1", "Ada", vec!["user".into()]);
    let app = gateway::router(state);

    let logout_response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/auth/logout")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(logout_response.status(), StatusCode::NO_CONTENT);

    let session_response = app
        .oneshot(
            Request::builder()
                .uri("/auth/session")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(session_response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn authz_check_reflects_seeded_role_permission() {
    let (state, db) = test_state();
    let token = bearer_for(&state, &db, "u1", "Ada", vec!["user".into()]);
    let user_role = db.get_role_by_name("user").unwrap().unwrap();
    db.assign_role("u1", &user_role.id, None, None).unwrap();
    let app = gateway::router(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/authz/check?permission=user:profile")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["allowed"], true);

    let denied = app
        .oneshot(
            Request::builder()
                .uri("/authz/check?permission=admin:users:delete")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::OK);
    assert_eq!(body_json(denied).await["allowed"], false);
}

#[tokio::test]
async fn authz_check_without_permission_param_is_bad_request() {
    let (state, db) = test_state();
    let token = bearer_for(&state, &db, "u1", "Ada", vec![]);
    let app = gateway::router(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/authz/check")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn authz_evaluate_preserves_order_and_does_not_short_circuit() {
    let (state, db) = test_state();
    let token = bearer_for(&state, &db, "u1", "Ada", vec![]);
    let admin_role = db.get_role_by_name("admin").unwrap().unwrap();
    db.assign_role("u1", &admin_role.id, None, None).unwrap();
    let app = gateway::router(state);

    let body = json!({
        "checks": [
            { "permission": "nonexistent:thing" },
            { "permission": "admin:users:delete" },
            { "permission": "another:unknown" },
        ]
    });

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/authz/evaluate")
                .header("authorization", format!("Bearer {token}"))
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let payload = body_json(response).await;
    let results = payload["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["allowed"], false);
    assert_eq!(results[1]["allowed"], true);
    assert_eq!(results[2]["allowed"], false);
}

#[tokio::test]
async fn authz_permissions_lists_effective_set() {
    let (state, db) = test_state();
    let token = bearer_for(&state, &db, "u1", "Ada", vec![]);
    let user_role = db.get_role_by_name("user").unwrap().unwrap();
    db.assign_role("u1", &user_role.id, None, None).unwrap();
    let app = gateway::router(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/authz/permissions")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let payload = body_json(response).await;
    let codes: Vec<&str> = payload["permissions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["code"].as_str().unwrap())
        .collect();
    assert!(codes.contains(&"user:profile"));
    assert!(codes.contains(&"user:credentials"));
}

#[tokio::test]
async fn register_begin_issues_discoverable_options() {
    let (state, _db) = test_state();
    let app = gateway::router(state);

    let body = json!({ "email": "ada@example.com", "displayName": "Ada Lovelace" });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/auth/register/begin")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let payload = body_json(response).await;
    assert!(payload["challengeId"].as_str().is_some());
    let options: Value = serde_json::from_str(payload["optionsJson"].as_str().unwrap()).unwrap();
    assert_eq!(options["attestation"], "none");
    assert_eq!(options["authenticatorSelection"]["userVerification"], "required");
}

#[tokio::test]
async fn register_begin_rejects_blank_email() {
    let (state, _db) = test_state();
    let app = gateway::router(state);

    let body = json!({ "email": "  ", "displayName": "Ada" });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/auth/register/begin")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn login_begin_ignores_supplied_email_and_issues_empty_allow_list() {
    let (state, _db) = test_state();
    let app = gateway::router(state);

    let body = json!({ "email": "nobody@example.com" });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/auth/login/begin")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let payload = body_json(response).await;
    let options: Value = serde_json::from_str(payload["optionsJson"].as_str().unwrap()).unwrap();
    assert_eq!(options["allowCredentials"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn register_complete_with_unknown_challenge_is_rejected() {
    let (state, _db) = test_state();
    let app = gateway::router(state);

    let body = json!({
        "challengeId": "does-not-exist",
        "credentialId": "abc",
        "attestationObject": "abc",
        "clientDataJson": "abc",
    });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/auth/register/complete")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
