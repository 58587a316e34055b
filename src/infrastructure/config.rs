// Configuration loading for the cloud connection and fetch session
use crate::domain::telemetry::SourceId;
use crate::infrastructure::auth::{Credentials, Token};
use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AnalyticsConfig {
    #[serde(default)]
    pub cloud: CloudSettings,
    #[serde(default)]
    pub session: SessionSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CloudSettings {
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Project, device or archive slug to analyse.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionSettings {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_true")]
    pub cache_responses: bool,
}

fn default_domain() -> String {
    "https://iotile.cloud".to_string()
}

fn default_token_type() -> String {
    "jwt".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_concurrency() -> usize {
    10
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    8000
}

fn default_page_size() -> usize {
    1000
}

fn default_token_ttl_secs() -> u64 {
    12 * 60 * 60
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            source: None,
            token: None,
            token_type: default_token_type(),
            email: None,
            password: None,
            verify_tls: true,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            page_size: default_page_size(),
            token_ttl_secs: default_token_ttl_secs(),
            cache_responses: true,
        }
    }
}

impl CloudSettings {
    /// A static token wins over a login; with neither, requests go out unauthenticated.
    pub fn credentials(&self) -> Credentials {
        if let Some(token) = self.token.as_deref().filter(|t| !t.is_empty()) {
            return Credentials::Token(Token::new(token, self.token_type.clone(), None));
        }

        match (&self.email, &self.password) {
            (Some(email), Some(password)) => Credentials::Login {
                email: email.clone(),
                password: password.clone(),
            },
            _ => Credentials::Anonymous,
        }
    }

    pub fn source_id(&self) -> anyhow::Result<Option<SourceId>> {
        self.source
            .as_deref()
            .map(SourceId::parse)
            .transpose()
            .context("Invalid cloud.source setting")
    }
}

fn build(builder: config::ConfigBuilder<config::builder::DefaultState>) -> anyhow::Result<AnalyticsConfig> {
    let settings = builder
        .add_source(
            config::Environment::with_prefix("ANALYTICS")
                .prefix_separator("__")
                .separator("__"),
        )
        .build()
        .context("Failed to build analytics configuration")?;

    settings
        .try_deserialize()
        .context("Failed to parse analytics configuration")
}

/// Load `config/analytics.*` (optional) overlaid with `ANALYTICS__*` environment variables.
pub fn load_config() -> anyhow::Result<AnalyticsConfig> {
    build(config::Config::builder().add_source(config::File::with_name("config/analytics").required(false)))
}
