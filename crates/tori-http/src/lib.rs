//! OAuth2 client-credentials token acquisition + report download for TORI.

use std::time::Duration;

use chrono::Utc;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tori_core::{AccessToken, Credentials, RawReport, TimeWindow};
use tracing::{debug, info, info_span, Instrument};

/// Longest response body kept in error messages.
const BODY_EXCERPT_CHARS: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub user_agent: String,
    pub token_timeout: Duration,
    pub report_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user_agent: "TORI Data Processor".to_string(),
            token_timeout: Duration::from_secs(30),
            report_timeout: Duration::from_secs(60),
        }
    }
}

pub fn build_client(config: &HttpClientConfig) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .user_agent(config.user_agent.clone())
        .build()
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token endpoint {endpoint} unreachable")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("token endpoint {endpoint} returned http status {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("token response from {endpoint} is not valid JSON")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("token response from {endpoint} has no access_token")]
    MissingToken { endpoint: String },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http status {status} for {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },
    #[error("network error calling {url}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            FetchError::Network { .. } => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
}

/// Turn a token endpoint reply into an [`AccessToken`].
pub fn parse_token_response(
    endpoint: &str,
    status: StatusCode,
    body: &str,
) -> Result<AccessToken, AuthError> {
    if !status.is_success() {
        return Err(AuthError::Status {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            body: body_excerpt(body),
        });
    }

    let parsed: TokenResponse = serde_json::from_str(body).map_err(|source| AuthError::Decode {
        endpoint: endpoint.to_string(),
        source,
    })?;

    let value = parsed
        .access_token
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| AuthError::MissingToken {
            endpoint: endpoint.to_string(),
        })?;

    if let Some(kind) = parsed.token_type.as_deref() {
        if !kind.eq_ignore_ascii_case("bearer") {
            debug!(token_type = kind, "token endpoint returned a non-bearer token type");
        }
    }

    // An expiry past the calendar range is dropped; the token itself is still usable.
    let expires_at = parsed
        .expires_in
        .and_then(chrono::Duration::try_seconds)
        .and_then(|ttl| Utc::now().checked_add_signed(ttl));

    Ok(AccessToken { value, expires_at })
}

fn body_excerpt(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(BODY_EXCERPT_CHARS) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// Exchanges client credentials for a bearer token. One token per run; nothing is cached.
#[derive(Debug, Clone)]
pub struct TokenProvider {
    client: reqwest::Client,
    timeout: Duration,
}

impl TokenProvider {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub async fn acquire(&self, credentials: &Credentials) -> Result<AccessToken, AuthError> {
        let endpoint = credentials.token_endpoint.as_str();
        let span = info_span!("token_acquire", endpoint, client_id = %credentials.client_id);

        async move {
            let mut form = vec![
                ("grant_type", "client_credentials"),
                ("client_id", credentials.client_id.as_str()),
                ("client_secret", credentials.client_secret.as_str()),
            ];
            if let Some(scope) = credentials.scope.as_deref() {
                form.push(("scope", scope));
            }

            info!("requesting access token");
            let transport = |source| AuthError::Transport {
                endpoint: endpoint.to_string(),
                source,
            };
            let resp = self
                .client
                .post(endpoint)
                .header(ACCEPT, "*/*")
                .timeout(self.timeout)
                .form(&form)
                .send()
                .await
                .map_err(transport)?;
            let status = resp.status();
            let body = resp.text().await.map_err(transport)?;

            let token = parse_token_response(endpoint, status, &body)?;
            info!(expires_at = ?token.expires_at, "obtained access token");
            Ok(token)
        }
        .instrument(span)
        .await
    }
}

/// Authenticated GET against the reports endpoint for one window.
#[derive(Debug, Clone)]
pub struct ReportFetcher {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl ReportFetcher {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn fetch(
        &self,
        token: &AccessToken,
        window: &TimeWindow,
    ) -> Result<RawReport, FetchError> {
        let span = info_span!("report_fetch", endpoint = %self.endpoint, %window);

        async move {
            let network = |source| FetchError::Network {
                url: self.endpoint.clone(),
                source,
            };
            info!("fetching reports");
            let resp = self
                .client
                .get(&self.endpoint)
                .query(&window.query_params())
                .header(AUTHORIZATION, format!("Bearer {}", token.bearer()))
                .header(ACCEPT, "*/*")
                .timeout(self.timeout)
                .send()
                .await
                .map_err(network)?;

            let status = resp.status();
            let url = resp.url().to_string();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(FetchError::Status {
                    status: status.as_u16(),
                    url,
                    body: body_excerpt(&body),
                });
            }

            let bytes = resp.bytes().await.map_err(network)?;
            info!(bytes = bytes.len(), "received report payload");
            Ok(RawReport::new(bytes.to_vec()))
        }
        .instrument(span)
        .await
    }
}
