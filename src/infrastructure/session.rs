// Bounded-concurrency request session with retry, pagination and auth
use crate::error::{AnalyticsError, CloudErrorKind, Result};
use crate::infrastructure::auth::{Credentials, TokenManager};
use crate::infrastructure::config::SessionSettings;
use crate::infrastructure::transport::{ApiRequest, HttpTransport, Transport};
use futures::{Stream, StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, mpsc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per request, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt` (1-based).
    /// A server hint is honored as a lower bound, but never past `max_backoff`.
    pub fn backoff(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.initial_backoff.saturating_mul(factor);
        hint.map_or(delay, |hint| delay.max(hint)).min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Upper bound on requests in flight at any moment.
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    pub page_size: usize,
    pub cache_responses: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&SessionSettings::default())
    }
}

impl From<&SessionSettings> for SessionConfig {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            max_concurrency: settings.max_concurrency.max(1),
            retry: RetryPolicy {
                max_attempts: settings.max_attempts.max(1),
                initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
                max_backoff: Duration::from_millis(settings.max_backoff_ms),
            },
            page_size: settings.page_size.max(1),
            cache_responses: settings.cache_responses,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    results: Vec<Value>,
}

struct SessionInner<T> {
    transport: T,
    tokens: TokenManager,
    limiter: Semaphore,
    config: SessionConfig,
    cache: std::sync::Mutex<HashMap<String, Value>>,
}

/// Executes API requests for one channel. Owns the token, the concurrency
/// limiter and the response cache; clones share all three.
pub struct Session<T: Transport = HttpTransport> {
    inner: Arc<SessionInner<T>>,
}

impl<T: Transport> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn aborted(message: &str) -> AnalyticsError {
    AnalyticsError::Cloud {
        kind: CloudErrorKind::Aborted,
        message: message.to_string(),
    }
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, credentials: Credentials, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                transport,
                tokens: TokenManager::new(credentials),
                limiter: Semaphore::new(config.max_concurrency.max(1)),
                config,
                cache: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    fn cached(&self, key: &str) -> Option<Value> {
        if !self.inner.config.cache_responses {
            return None;
        }
        let cache = self.inner.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(key).cloned()
    }

    fn remember(&self, key: String, value: &Value) {
        if self.inner.config.cache_responses {
            let mut cache = self.inner.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.insert(key, value.clone());
        }
    }

    pub fn clear_cache(&self) {
        self.inner
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Run one request, retrying transient failures with exponential backoff.
    pub async fn execute(&self, request: &ApiRequest) -> Result<Value> {
        let key = request.key();
        if let Some(value) = self.cached(&key) {
            tracing::debug!("Cache hit for {}", key);
            return Ok(value);
        }

        let retry = self.inner.config.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let token = self.inner.tokens.token(&self.inner.transport).await?;

            let outcome = {
                let _permit = self
                    .inner
                    .limiter
                    .acquire()
                    .await
                    .map_err(|_| aborted("session limiter closed"))?;
                self.inner.transport.get(request, token.as_ref()).await
            };

            match outcome {
                Ok(value) => {
                    self.remember(key, &value);
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                    let wait = retry.backoff(attempt, e.retry_after());
                    tracing::warn!(
                        "Attempt {}/{} for {} failed ({}), retrying in {:?}",
                        attempt,
                        retry.max_attempts,
                        key,
                        e,
                        wait
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!("Giving up on {} after {} attempts: {}", key, attempt, e);
                    return Err(AnalyticsError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run independent requests on a fixed pool of workers.
    ///
    /// Results come back in input order, each holding its own outcome.
    /// Authentication and certificate failures stop dispatch and fail the
    /// whole call; requests already in flight finish in the background.
    pub async fn fetch_multiple<K: Send>(&self, requests: Vec<(K, ApiRequest)>) -> Result<Vec<(K, Result<Value>)>> {
        let total = requests.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let (keys, requests): (Vec<K>, Vec<ApiRequest>) = requests.into_iter().unzip();
        let workers = self.inner.config.max_concurrency.max(1).min(total);
        tracing::debug!("Dispatching {} requests over {} workers", total, workers);

        let (job_tx, job_rx) = mpsc::unbounded_channel::<(usize, ApiRequest)>();
        for job in requests.into_iter().enumerate() {
            // The receiver is alive until the workers are spawned.
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        let jobs = Arc::new(Mutex::new(job_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(usize, Result<Value>)>();
        let abort = Arc::new(AtomicBool::new(false));

        for _ in 0..workers {
            let session = self.clone();
            let jobs = Arc::clone(&jobs);
            let results = result_tx.clone();
            let abort = Arc::clone(&abort);

            tokio::spawn(async move {
                loop {
                    if abort.load(Ordering::SeqCst) || results.is_closed() {
                        break;
                    }
                    let next = jobs.lock().await.recv().await;
                    let Some((index, request)) = next else {
                        break;
                    };

                    let outcome = session.execute(&request).await;
                    if outcome.as_ref().is_err_and(|e| e.is_fatal()) {
                        abort.store(true, Ordering::SeqCst);
                    }
                    if results.send((index, outcome)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        let mut slots: Vec<Option<Result<Value>>> = (0..total).map(|_| None).collect();
        while let Some((index, outcome)) = result_rx.recv().await {
            match outcome {
                Err(e) if e.is_fatal() => {
                    tracing::warn!("Aborting batch of {} requests: {}", total, e);
                    return Err(e);
                }
                outcome => slots[index] = Some(outcome),
            }
        }

        let failed = slots.iter().filter(|s| !matches!(s, Some(Ok(_)))).count();
        if failed > 0 {
            tracing::debug!("{} of {} requests failed", failed, total);
        }

        Ok(keys
            .into_iter()
            .zip(slots)
            .map(|(key, slot)| (key, slot.unwrap_or_else(|| Err(aborted("request was never dispatched")))))
            .collect())
    }

    /// Lazily walk a paginated endpoint, yielding each page's results in
    /// server order. The first failing page ends the stream.
    pub fn pages(&self, request: ApiRequest) -> impl Stream<Item = Result<Vec<Value>>> + Send + 'static {
        let session = self.clone();
        let first = if request.has_param("page_size") {
            request
        } else {
            request.param("page_size", session.inner.config.page_size)
        };

        async_stream::try_stream! {
            let mut next = Some(first);
            while let Some(request) = next.take() {
                let value = session.execute(&request).await?;
                let page: Page = match value {
                    Value::Array(results) => Page { next: None, results },
                    other => serde_json::from_value(other)?,
                };

                next = page
                    .next
                    .filter(|link| !link.is_empty())
                    .map(|link| ApiRequest::from_link(&link));
                yield page.results;
            }
        }
    }

    /// Drive a paginated endpoint to exhaustion.
    pub async fn fetch_all(&self, request: ApiRequest) -> Result<Vec<Value>> {
        let mut pages = std::pin::pin!(self.pages(request));
        let mut items = Vec::new();
        while let Some(page) = pages.try_next().await? {
            items.extend(page);
        }
        Ok(items)
    }

    /// Several paginated fetches at once, ordered like the input. Each
    /// endpoint fails on its own; fatal errors fail the whole call.
    pub async fn fetch_all_multiple<K: Send>(
        &self,
        requests: Vec<(K, ApiRequest)>,
    ) -> Result<Vec<(K, Result<Vec<Value>>)>> {
        let limit = self.inner.config.max_concurrency.max(1);
        let outcomes: Vec<(K, Result<Vec<Value>>)> = futures::stream::iter(requests)
            .map(|(key, request)| async move { (key, self.fetch_all(request).await) })
            .buffered(limit)
            .collect()
            .await;

        let mut results = Vec::with_capacity(outcomes.len());
        for (key, outcome) in outcomes {
            match outcome {
                Err(e) if e.is_fatal() => return Err(e),
                outcome => results.push((key, outcome)),
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::transport::tests::FakeTransport;
    use serde_json::json;

    fn config(max_concurrency: usize, max_attempts: u32) -> SessionConfig {
        SessionConfig {
            max_concurrency,
            retry: RetryPolicy {
                max_attempts,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
            },
            page_size: 2,
            cache_responses: false,
        }
    }

    fn item_request(i: usize) -> ApiRequest {
        ApiRequest::new(format!("item/{}/", i))
    }

    fn item_transport(n: usize) -> FakeTransport {
        (0..n).fold(FakeTransport::new(), |t, i| {
            t.respond(&item_request(i).key(), json!({ "id": i }))
        })
    }

    #[tokio::test]
    async fn test_fetch_multiple_bounds_concurrency_and_keeps_order() {
        let transport = item_transport(40)
            .with_delay(Duration::from_millis(10))
            .failing(|key, _| {
                let id: usize = key.trim_start_matches("item/").trim_end_matches('/').parse().unwrap();
                (id % 10 == 3).then(|| AnalyticsError::transient(Some(503), None, "unavailable"))
            });
        let session = Session::new(transport, Credentials::Anonymous, config(4, 3));

        let requests = (0..40).map(|i| (i, item_request(i))).collect();
        let results = session.fetch_multiple(requests).await.unwrap();

        assert_eq!(results.len(), 40);
        assert!(session.transport().peak.load(Ordering::SeqCst) <= 4);

        for (i, (key, outcome)) in results.iter().enumerate() {
            assert_eq!(*key, i);
            if i % 10 == 3 {
                assert!(matches!(
                    outcome,
                    Err(AnalyticsError::RetriesExhausted { attempts: 3, .. })
                ));
                assert_eq!(session.transport().attempts(&item_request(i).key()), 3);
            } else {
                assert_eq!(outcome.as_ref().unwrap()["id"], json!(i));
            }
        }
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let transport = item_transport(1).failing(|_, attempt| {
            (attempt < 3).then(|| AnalyticsError::transient(Some(429), Some(Duration::from_millis(2)), "slow down"))
        });
        let session = Session::new(transport, Credentials::Anonymous, config(2, 5));

        let value = session.execute(&item_request(0)).await.unwrap();
        assert_eq!(value["id"], json!(0));
        assert_eq!(session.transport().attempts(&item_request(0).key()), 3);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let transport = item_transport(1).failing(|_, _| {
            Some(AnalyticsError::Cloud {
                kind: CloudErrorKind::Client(400),
                message: "bad filter".to_string(),
            })
        });
        let session = Session::new(transport, Credentials::Anonymous, config(2, 5));

        assert!(session.execute(&item_request(0)).await.is_err());
        assert_eq!(session.transport().attempts(&item_request(0).key()), 1);
    }

    #[tokio::test]
    async fn test_authentication_failure_aborts_batch() {
        let transport = item_transport(20)
            .with_delay(Duration::from_millis(5))
            .failing(|key, _| {
                (key == "item/0/").then(|| AnalyticsError::Authentication("expired".to_string()))
            });
        let session = Session::new(transport, Credentials::Anonymous, config(2, 3));

        let requests = (0..20).map(|i| (i, item_request(i))).collect();
        let outcome = session.fetch_multiple(requests).await;

        assert!(matches!(outcome, Err(AnalyticsError::Authentication(_))));
        assert!(session.transport().calls.load(Ordering::SeqCst) < 20);
        assert_eq!(session.transport().attempts("item/0/"), 1);
    }

    #[tokio::test]
    async fn test_fetch_all_follows_next_links() {
        let transport = FakeTransport::new()
            .respond(
                "data/?filter=s--1&page_size=2",
                json!({ "count": 3, "next": "https://cloud/api/v1/data/?page=2", "results": [1, 2] }),
            )
            .respond(
                "https://cloud/api/v1/data/?page=2",
                json!({ "count": 3, "next": null, "results": [3] }),
            );
        let session = Session::new(transport, Credentials::Anonymous, config(2, 1));

        let items = session
            .fetch_all(ApiRequest::new("data/").param("filter", "s--1"))
            .await
            .unwrap();
        assert_eq!(items, vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_fetch_all_fails_on_any_page() {
        let transport = FakeTransport::new().respond(
            "data/?filter=s--1&page_size=2",
            json!({ "next": "https://cloud/api/v1/data/?page=2", "results": [1, 2] }),
        );
        let session = Session::new(transport, Credentials::Anonymous, config(2, 1));

        let outcome = session
            .fetch_all(ApiRequest::new("data/").param("filter", "s--1"))
            .await;
        assert!(matches!(outcome, Err(AnalyticsError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_fetch_all_multiple_keeps_order() {
        let transport = FakeTransport::new()
            .respond("a/?page_size=2", json!({ "results": ["a1"] }))
            .respond("b/?page_size=2", json!([ "b1", "b2" ]));
        let session = Session::new(transport, Credentials::Anonymous, config(2, 1));

        let results = session
            .fetch_all_multiple(vec![
                ("b", ApiRequest::new("b/")),
                ("missing", ApiRequest::new("missing/")),
                ("a", ApiRequest::new("a/")),
            ])
            .await
            .unwrap();

        assert_eq!(results[0].0, "b");
        assert_eq!(results[0].1.as_ref().unwrap().len(), 2);
        assert!(results[1].1.is_err());
        assert_eq!(results[2].1.as_ref().unwrap(), &vec![json!("a1")]);
    }

    #[tokio::test]
    async fn test_login_happens_once_for_many_requests() {
        let transport = item_transport(10).with_login_delay(Duration::from_millis(10));
        let credentials = Credentials::Login {
            email: "user@example.com".to_string(),
            password: "secret".to_string(),
        };
        let session = Session::new(transport, credentials, config(5, 1));

        let requests = (0..10).map(|i| (i, item_request(i))).collect();
        let results = session.fetch_multiple(requests).await.unwrap();

        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(session.transport().logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_responses_are_cached() {
        let mut cfg = config(2, 1);
        cfg.cache_responses = true;
        let session = Session::new(item_transport(1), Credentials::Anonymous, cfg);

        session.execute(&item_request(0)).await.unwrap();
        session.execute(&item_request(0)).await.unwrap();
        assert_eq!(session.transport().calls.load(Ordering::SeqCst), 1);

        session.clear_cache();
        session.execute(&item_request(0)).await.unwrap();
        assert_eq!(session.transport().calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backoff_is_bounded_and_honors_hint() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(2),
        };
        assert_eq!(policy.backoff(1, None), Duration::from_millis(250));
        assert_eq!(policy.backoff(3, None), Duration::from_millis(1000));
        assert_eq!(policy.backoff(10, None), Duration::from_secs(2));
        assert_eq!(policy.backoff(1, Some(Duration::from_secs(1))), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_caps_server_hint() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
        };
        assert_eq!(policy.backoff(1, Some(Duration::from_secs(86_400))), Duration::from_secs(8));
        assert_eq!(policy.backoff(2, Some(Duration::from_secs(3))), Duration::from_secs(3));
    }
}
