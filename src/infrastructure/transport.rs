// HTTP transport for the cloud REST API
use crate::error::{AnalyticsError, CloudErrorKind, Result};
use crate::infrastructure::auth::Token;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::error::Error as _;
use std::time::Duration;

/// A GET against the API: a path relative to the API root (or an absolute
/// pagination link) plus query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query: Vec::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// A `next` link returned by a paginated response; it already carries its query.
    pub fn from_link(link: &str) -> Self {
        Self::new(link)
    }

    pub fn has_param(&self, key: &str) -> bool {
        self.query.iter().any(|(k, _)| k == key)
    }

    /// Stable key identifying the request, used for response caching.
    pub fn key(&self) -> String {
        if self.query.is_empty() {
            return self.path.clone();
        }

        let query = self
            .query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let separator = if self.path.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.path, separator, query)
    }
}

/// Raw access to the API; the session layers retry and concurrency on top.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn get(&self, request: &ApiRequest, token: Option<&Token>) -> Result<serde_json::Value>;

    async fn login(&self, email: &str, password: &str) -> Result<Token>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    api_root: String,
    token_ttl: Duration,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(alias = "jwt")]
    token: String,
}

impl HttpTransport {
    pub fn new(domain: &str, verify_tls: bool, token_ttl: Duration) -> Result<Self> {
        if !verify_tls {
            tracing::warn!("TLS certificate verification is disabled for {}", domain);
        }

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|e| AnalyticsError::usage(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_root: format!("{}/api/v1/", domain.trim_end_matches('/')),
            token_ttl,
        })
    }

    fn url(&self, request: &ApiRequest) -> String {
        if request.path.starts_with("http://") || request.path.starts_with("https://") {
            return request.key();
        }
        let key = request.key();
        format!("{}{}", self.api_root, key.trim_start_matches('/'))
    }
}

fn classify_send_error(err: reqwest::Error) -> AnalyticsError {
    let mut source = err.source();
    while let Some(cause) = source {
        if cause.to_string().to_lowercase().contains("certificate") {
            return AnalyticsError::CertificateVerification(cause.to_string());
        }
        source = cause.source();
    }

    if err.is_timeout() || err.is_connect() || err.is_request() {
        return AnalyticsError::transient(None, None, err.to_string());
    }
    AnalyticsError::Cloud {
        kind: CloudErrorKind::Client(err.status().map(|s| s.as_u16()).unwrap_or_default()),
        message: err.to_string(),
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Map a non-success HTTP status to the error taxonomy.
pub fn status_error(status: u16, retry_after: Option<Duration>, url: &str, body: &str) -> AnalyticsError {
    let message = format!("GET {} returned {}: {}", url, status, body);
    match status {
        401 | 403 => AnalyticsError::Authentication(message),
        404 => AnalyticsError::not_found("resource", url.to_string()),
        429 | 500..=599 => AnalyticsError::transient(Some(status), retry_after, message),
        _ => AnalyticsError::Cloud {
            kind: CloudErrorKind::Client(status),
            message,
        },
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, request: &ApiRequest, token: Option<&Token>) -> Result<serde_json::Value> {
        let url = self.url(request);
        tracing::debug!("GET {}", url);

        let mut builder = self.client.get(&url).header("Accept", "application/json");
        if let Some(token) = token {
            builder = builder.header("Authorization", token.header_value());
        }

        let response = builder.send().await.map_err(classify_send_error)?;
        let status = response.status();
        if !status.is_success() {
            let wait = retry_after(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), wait, &url, &body));
        }

        let bytes = response.bytes().await.map_err(classify_send_error)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn login(&self, email: &str, password: &str) -> Result<Token> {
        let url = format!("{}auth/login/", self.api_root);
        tracing::info!("Logging in to {} as {}", self.api_root, email);

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                400 | 401 | 403 => AnalyticsError::Authentication(format!("login rejected for {}: {}", email, body)),
                code => status_error(code, None, &url, &body),
            });
        }

        let bytes = response.bytes().await.map_err(classify_send_error)?;
        let login: LoginResponse = serde_json::from_slice(&bytes)?;
        let expires_at = chrono::TimeDelta::from_std(self.token_ttl)
            .ok()
            .map(|ttl| Utc::now() + ttl);
        Ok(Token::new(login.token, "jwt", expires_at))
    }
}
