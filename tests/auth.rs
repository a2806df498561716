use reqwest::{Client, StatusCode, Url};
use serde_json::json;
use std::time::{Duration, Instant};
use tado_exporter::auth::{AuthError, DeviceFlow, OAuthClient, Token, TokenManager, CLIENT_ID};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn oauth(server: &MockServer) -> OAuthClient {
    OAuthClient::new(Client::new(), Url::parse(&server.uri()).unwrap())
}

async fn mount_device_authorize(server: &MockServer, expires_in: u64, interval: u64) {
    Mock::given(method("POST"))
        .and(path("/device_authorize"))
        .and(body_string_contains(format!("client_id={}", CLIENT_ID).as_str()))
        .and(body_string_contains("scope=offline_access"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "device_code": "dev-123",
            "user_code": "ABC123",
            "verification_uri": "https://login.tado.com/oauth2/device",
            "verification_uri_complete": "https://login.tado.com/oauth2/device?user_code=ABC123",
            "expires_in": expires_in,
            "interval": interval,
        })))
        .expect(1)
        .mount(server)
        .await;
}

fn token_body(access: &str, refresh: Option<&str>, expires_in: u64) -> serde_json::Value {
    match refresh {
        Some(r) => json!({"access_token": access, "refresh_token": r, "expires_in": expires_in, "token_type": "bearer"}),
        None => json!({"access_token": access, "expires_in": expires_in, "token_type": "bearer"}),
    }
}

fn expired(access: &str, refresh: &str) -> Token {
    Token::new(
        access.to_owned(),
        refresh.to_owned(),
        Instant::now().checked_sub(Duration::from_secs(1)).unwrap(),
    )
}

#[tokio::test]
async fn test_device_flow_poll_until_authorized() {
    let server = MockServer::start().await;
    mount_device_authorize(&server, 60, 0).await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("device_code=dev-123"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "authorization_pending"})))
        .up_to_n_times(2)
        .with_priority(1)
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("device_code=dev-123"))
        .and(body_string_contains("grant-type%3Adevice_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("access", Some("refresh"), 600)))
        .expect(1)
        .mount(&server)
        .await;

    let before = Instant::now();
    let tokens = TokenManager::authenticate(oauth(&server), DeviceFlow::Poll)
        .await
        .unwrap();
    let after = Instant::now();

    assert_eq!("access", tokens.access_token());
    assert_eq!("refresh", tokens.token().refresh_token);
    assert!(tokens.token().expires_at >= before + Duration::from_secs(570));
    assert!(tokens.token().expires_at <= after + Duration::from_secs(570));
    assert!(!tokens.is_expired(after));
}

#[tokio::test]
async fn test_device_flow_expiry_counts_from_receipt() {
    let server = MockServer::start().await;
    mount_device_authorize(&server, 60, 1).await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("device_code=dev-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("access", Some("refresh"), 600)))
        .expect(1)
        .mount(&server)
        .await;

    let before = Instant::now();
    let tokens = TokenManager::authenticate(oauth(&server), DeviceFlow::Poll)
        .await
        .unwrap();
    let after = Instant::now();

    // The token is requested after waiting one polling interval.
    assert!(tokens.token().expires_at >= before + Duration::from_secs(571));
    assert!(tokens.token().expires_at <= after + Duration::from_secs(570));
}

#[tokio::test]
async fn test_device_flow_code_expired() {
    let server = MockServer::start().await;
    mount_device_authorize(&server, 0, 0).await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("access", Some("refresh"), 600)))
        .expect(0)
        .mount(&server)
        .await;

    let res = TokenManager::authenticate(oauth(&server), DeviceFlow::Poll).await;
    assert!(matches!(res, Err(AuthError::Expired)));
}

#[tokio::test]
async fn test_device_flow_denied() {
    let server = MockServer::start().await;
    mount_device_authorize(&server, 60, 0).await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "access_denied",
            "error_description": "the user denied access",
        })))
        .expect(1)
        .mount(&server)
        .await;

    match TokenManager::authenticate(oauth(&server), DeviceFlow::Poll).await {
        Err(AuthError::Rejected {
            status,
            error,
            description,
        }) => {
            assert_eq!(StatusCode::BAD_REQUEST, status);
            assert_eq!("access_denied", error);
            assert_eq!(Some("the user denied access".to_owned()), description);
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[tokio::test]
async fn test_device_authorization_failure() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/device_authorize"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .mount(&server)
        .await;

    match TokenManager::authenticate(oauth(&server), DeviceFlow::Poll).await {
        Err(AuthError::Rejected { status, error, .. }) => {
            assert_eq!(StatusCode::SERVICE_UNAVAILABLE, status);
            assert_eq!("unknown_error", error);
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[tokio::test]
async fn test_refresh_rotates_refresh_token() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=old-refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("fresh", Some("new-refresh"), 600)))
        .expect(1)
        .mount(&server)
        .await;

    let mut tokens = TokenManager::new(oauth(&server), expired("stale", "old-refresh"));
    assert!(tokens.is_expired(Instant::now()));

    tokens.refresh().await.unwrap();

    assert_eq!("fresh", tokens.access_token());
    assert_eq!("new-refresh", tokens.token().refresh_token);
    assert!(!tokens.is_expired(Instant::now()));
}

#[tokio::test]
async fn test_refresh_keeps_refresh_token() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("fresh", None, 600)))
        .mount(&server)
        .await;

    let mut tokens = TokenManager::new(oauth(&server), expired("stale", "old-refresh"));
    tokens.refresh().await.unwrap();

    assert_eq!("fresh", tokens.access_token());
    assert_eq!("old-refresh", tokens.token().refresh_token);
}

#[tokio::test]
async fn test_refresh_failure_keeps_stale_token() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})))
        .mount(&server)
        .await;

    let mut tokens = TokenManager::new(oauth(&server), expired("stale", "old-refresh"));
    let res = tokens.refresh().await;

    assert!(matches!(res, Err(AuthError::Rejected { .. })));
    assert_eq!("stale", tokens.access_token());
    assert_eq!("old-refresh", tokens.token().refresh_token);
    assert!(tokens.is_expired(Instant::now()));
}
