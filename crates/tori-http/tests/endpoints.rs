use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Form, Query};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{TimeZone, Utc};
use tori_core::{AccessToken, Credentials, TimeWindow};
use tori_http::{
    build_client, AuthError, FetchError, HttpClientConfig, ReportFetcher, TokenProvider,
};

async fn spawn(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    format!("http://{addr}")
}

async fn token_handler(Form(form): Form<HashMap<String, String>>) -> impl IntoResponse {
    let ok = form.get("grant_type").map(String::as_str) == Some("client_credentials")
        && form.get("client_id").map(String::as_str) == Some("tori-client")
        && form.get("client_secret").map(String::as_str) == Some("s3cret")
        && form.get("scope").map(String::as_str) == Some("reports/.default");
    if ok {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "token_type": "Bearer",
                "expires_in": 3599,
                "access_token": "tok-123",
            })),
        )
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "invalid_client" })),
        )
    }
}

async fn reports_handler(
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some("Bearer tok-123");
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "token expired".to_string()).into_response();
    }
    let body = format!(
        "start,end\n{},{}\n",
        query.get("start").cloned().unwrap_or_default(),
        query.get("end").cloned().unwrap_or_default()
    );
    ([(header::CONTENT_TYPE, "text/csv")], body).into_response()
}

fn credentials(base: &str, secret: &str) -> Credentials {
    Credentials {
        client_id: "tori-client".into(),
        client_secret: secret.into(),
        token_endpoint: format!("{base}/token"),
        scope: Some("reports/.default".into()),
    }
}

fn window() -> TimeWindow {
    TimeWindow::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
    )
    .unwrap()
}

fn client() -> reqwest::Client {
    build_client(&HttpClientConfig::default()).expect("client")
}

#[tokio::test]
async fn client_credentials_grant_returns_token() {
    let base = spawn(Router::new().route("/token", post(token_handler))).await;
    let provider = TokenProvider::new(client(), Duration::from_secs(5));

    let token = provider
        .acquire(&credentials(&base, "s3cret"))
        .await
        .expect("token");
    assert_eq!(token.bearer(), "tok-123");
    assert!(token.expires_at.is_some());
}

#[tokio::test]
async fn rejected_credentials_surface_as_auth_status() {
    let base = spawn(Router::new().route("/token", post(token_handler))).await;
    let provider = TokenProvider::new(client(), Duration::from_secs(5));

    let err = provider
        .acquire(&credentials(&base, "wrong"))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::Status { status: 401, .. }), "{err}");
}

#[tokio::test]
async fn unreachable_token_endpoint_is_a_transport_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let provider = TokenProvider::new(client(), Duration::from_secs(5));
    let err = provider
        .acquire(&credentials(&format!("http://{addr}"), "s3cret"))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::Transport { .. }), "{err}");
}

#[tokio::test]
async fn report_fetch_sends_window_and_bearer() {
    let base = spawn(Router::new().route("/reports/", get(reports_handler))).await;
    let fetcher = ReportFetcher::new(
        client(),
        format!("{base}/reports/"),
        Duration::from_secs(5),
    );
    let token = AccessToken {
        value: "tok-123".into(),
        expires_at: None,
    };

    let report = fetcher.fetch(&token, &window()).await.expect("report");
    assert_eq!(
        std::str::from_utf8(report.as_bytes()).unwrap(),
        "start,end\n2024-01-01T00:00:00,2024-01-02T00:00:00\n"
    );
}

#[tokio::test]
async fn unauthorized_report_fetch_keeps_status_and_body() {
    let base = spawn(Router::new().route("/reports/", get(reports_handler))).await;
    let fetcher = ReportFetcher::new(
        client(),
        format!("{base}/reports/"),
        Duration::from_secs(5),
    );
    let stale = AccessToken {
        value: "stale".into(),
        expires_at: None,
    };

    let err = fetcher.fetch(&stale, &window()).await.unwrap_err();
    assert_eq!(err.status(), Some(401));
    match err {
        FetchError::Status { body, .. } => assert_eq!(body, "token expired"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn refused_connection_is_a_network_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let fetcher = ReportFetcher::new(
        client(),
        format!("http://{addr}/reports/"),
        Duration::from_secs(5),
    );
    let token = AccessToken {
        value: "tok-123".into(),
        expires_at: None,
    };
    let err = fetcher.fetch(&token, &window()).await.unwrap_err();
    assert!(matches!(err, FetchError::Network { .. }), "{err}");
}
