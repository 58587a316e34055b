// Credentials and single-flight token refresh
use crate::error::Result;
use crate::infrastructure::transport::Transport;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Mutex, RwLock};

/// Tokens this close to expiry are refreshed before use.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Token {
    pub fn new(value: impl Into<String>, token_type: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            value: value.into(),
            token_type: token_type.into(),
            expires_at,
        }
    }

    pub fn header_value(&self) -> String {
        format!("{} {}", self.token_type, self.value)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_some_and(|at| now + TimeDelta::seconds(EXPIRY_MARGIN_SECS) >= at)
    }
}

// Keep token values out of logs.
impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum Credentials {
    /// Unauthenticated access, for public endpoints.
    Anonymous,
    /// A token issued elsewhere; used as is and never refreshed.
    Token(Token),
    /// Logged in on first use and again whenever the token expires.
    Login { email: String, password: String },
}

/// Holds the session token. Concurrent callers needing a refresh wait on
/// the one refresh in progress instead of starting their own.
#[derive(Debug)]
pub struct TokenManager {
    credentials: Credentials,
    current: RwLock<Option<Token>>,
    refresh: Mutex<()>,
}

impl TokenManager {
    pub fn new(credentials: Credentials) -> Self {
        let current = match &credentials {
            Credentials::Token(token) => Some(token.clone()),
            _ => None,
        };

        Self {
            credentials,
            current: RwLock::new(current),
            refresh: Mutex::new(()),
        }
    }

    async fn valid_token(&self) -> Option<Token> {
        self.current
            .read()
            .await
            .as_ref()
            .filter(|token| !token.is_expired(Utc::now()))
            .cloned()
    }

    /// Token to attach to the next request, logging in first if needed.
    pub async fn token<T: Transport>(&self, transport: &T) -> Result<Option<Token>> {
        let (email, password) = match &self.credentials {
            Credentials::Anonymous => return Ok(None),
            Credentials::Token(token) => return Ok(Some(token.clone())),
            Credentials::Login { email, password } => (email, password),
        };

        if let Some(token) = self.valid_token().await {
            return Ok(Some(token));
        }

        let _refreshing = self.refresh.lock().await;
        // Whoever held the lock before us may already have refreshed.
        if let Some(token) = self.valid_token().await {
            return Ok(Some(token));
        }

        tracing::debug!("Refreshing session token for {}", email);
        let token = transport.login(email, password).await?;
        *self.current.write().await = Some(token.clone());
        Ok(Some(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AnalyticsError;
    use crate::infrastructure::transport::tests::FakeTransport;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn login(password: &str) -> Credentials {
        Credentials::Login {
            email: "user@example.com".to_string(),
            password: password.to_string(),
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let transport = Arc::new(FakeTransport::new().with_login_delay(Duration::from_millis(20)));
        let manager = Arc::new(TokenManager::new(login("secret")));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let transport = Arc::clone(&transport);
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.token(transport.as_ref()).await })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().unwrap().is_some());
        }
        assert_eq!(transport.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_static_token_is_never_refreshed() {
        let transport = FakeTransport::new();
        let expired = Token::new("abc", "jwt", Some(Utc::now() - TimeDelta::hours(1)));
        let manager = TokenManager::new(Credentials::Token(expired.clone()));

        assert_eq!(manager.token(&transport).await.unwrap(), Some(expired));
        assert_eq!(transport.logins.load(Ordering::SeqCst), 0);
        assert_eq!(TokenManager::new(Credentials::Anonymous).token(&transport).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rejected_login_is_an_authentication_error() {
        let transport = FakeTransport::new();
        let manager = TokenManager::new(login("wrong"));
        assert!(matches!(
            manager.token(&transport).await,
            Err(AnalyticsError::Authentication(_))
        ));
    }

    #[test]
    fn test_expiry_margin() {
        let now = Utc::now();
        assert!(Token::new("a", "jwt", Some(now + TimeDelta::seconds(30))).is_expired(now));
        assert!(!Token::new("a", "jwt", Some(now + TimeDelta::hours(1))).is_expired(now));
        assert!(!Token::new("a", "jwt", None).is_expired(now));
        assert_eq!(Token::new("a", "JWT", None).header_value(), "JWT a");
    }
}
