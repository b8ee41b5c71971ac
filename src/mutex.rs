//! Distributed mutex client.
//!
//! Serializes mutation of a shared remote resource through an HTTP lock
//! service. `POST /api/{key}` answers 201 when the lock is obtained and 409
//! when it is held; both carry `{id, timestamp}` and an `ETag`. A lock older
//! than the stale threshold may be taken over with `If-Match: <ETag>`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::clock::Clock;
use crate::completion::{self, PollCheck, Tick};
use crate::config::MutexTimings;
use crate::error::{ApiError, Result};
use crate::http::{HttpClient, HttpRequest, HttpResponse};

/// A lock held by this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutex {
    /// Lock key (already URL-encoded).
    pub key: String,
    /// Concurrency-control token required to release or take over.
    pub etag: String,
    /// Holder id assigned by the lock service.
    pub holder_id: String,
    /// When the lock service recorded the acquisition.
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct MutexResponse {
    id: String,
    timestamp: DateTime<Utc>,
}

/// Client for the remote lock service.
#[derive(Clone)]
pub struct MutexClient {
    http: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
    base_url: String,
    timings: MutexTimings,
}

impl MutexClient {
    pub fn new(
        http: Arc<dyn HttpClient>,
        clock: Arc<dyn Clock>,
        base_url: impl Into<String>,
        timings: MutexTimings,
    ) -> Self {
        Self {
            http,
            clock,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timings,
        }
    }

    fn url(&self, key: &str) -> String {
        format!("{}/api/{}", self.base_url, key)
    }

    /// Polls until the lock for `key` is obtained.
    ///
    /// Contention and unexpected responses are logged and retried on the
    /// next tick; only the acquire timeout is fatal.
    pub async fn acquire(&self, key: &str) -> Result<Mutex> {
        let mut attempt = AcquireAttempt { client: self, key };
        let mutex = completion::poll(&mut attempt, self.timings.schedule()).await?;
        tracing::info!(key = %mutex.key, holder = %mutex.holder_id, "acquired mutex");
        Ok(mutex)
    }

    /// Releases a held lock with a conditional delete.
    pub async fn release(&self, mutex: &Mutex) -> Result<()> {
        let request = HttpRequest::delete(self.url(&mutex.key)).header("If-Match", &mutex.etag);
        let response = self.http.send(request).await?;
        if !response.is_success() {
            return Err(ApiError::from_response(&response)
                .with_message("Could not release Mutex.")
                .into());
        }
        tracing::info!(key = %mutex.key, "released mutex");
        Ok(())
    }

    fn is_stale(&self, recorded: DateTime<Utc>) -> bool {
        self.clock.now() - recorded >= self.timings.stale_after()
    }

    fn parse_mutex(&self, key: &str, response: &HttpResponse) -> std::result::Result<Mutex, ApiError> {
        let body: MutexResponse = response.json()?;
        Ok(Mutex {
            key: key.to_string(),
            etag: response.header("etag").unwrap_or_default().to_string(),
            holder_id: body.id,
            acquired_at: body.timestamp,
        })
    }

    async fn try_create(&self, key: &str) -> Result<Tick<Mutex>> {
        tracing::debug!(key = %key, "attempting to acquire mutex");
        let response = self.http.send(HttpRequest::post(self.url(key))).await?;

        match response.status {
            201 => Ok(Tick::Done(self.parse_mutex(key, &response)?)),
            409 => {
                let held = self.parse_mutex(key, &response)?;
                tracing::debug!(
                    key = %key,
                    holder = %held.holder_id,
                    since = %held.acquired_at,
                    "mutex already locked"
                );
                if !self.is_stale(held.acquired_at) {
                    return Ok(Tick::Continue);
                }

                tracing::info!(key = %key, "mutex considered stale, attempting to forcibly acquire");
                let forced = self
                    .http
                    .send(HttpRequest::post(self.url(key)).header("If-Match", &held.etag))
                    .await?;
                if forced.is_success() {
                    Ok(Tick::Done(self.parse_mutex(key, &forced)?))
                } else {
                    tracing::debug!(key = %key, status = forced.status, "forced acquisition lost");
                    Ok(Tick::Continue)
                }
            }
            _ => Err(ApiError::from_response(&response).into()),
        }
    }
}

struct AcquireAttempt<'a> {
    client: &'a MutexClient,
    key: &'a str,
}

#[async_trait]
impl PollCheck for AcquireAttempt<'_> {
    type Output = Mutex;

    async fn check(&mut self) -> Result<Tick<Mutex>> {
        match self.client.try_create(self.key).await {
            Ok(tick) => Ok(tick),
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "mutex acquisition attempt failed");
                Ok(Tick::Continue)
            }
        }
    }
}

/// Encodes a lock key for use as a URL path segment.
pub fn encode_key(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'!' | b'~' | b'*'
            | b'\'' | b'(' | b')' => encoded.push(byte as char),
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;
    use tokio::time::Instant;

    use super::*;
    use crate::clock::FakeClock;
    use crate::error::Error;
    use crate::http::testing::ScriptedClient;
    use crate::http::Method;

    fn lock_body(id: &str, timestamp: DateTime<Utc>) -> String {
        serde_json::json!({ "id": id, "timestamp": timestamp.to_rfc3339() }).to_string()
    }

    fn client(http: Arc<dyn HttpClient>, clock: FakeClock) -> MutexClient {
        MutexClient::new(http, Arc::new(clock), "https://locks.test/", MutexTimings::default())
    }

    #[test]
    fn encode_key_matches_uri_component_rules() {
        assert_eq!(
            encode_key("https://api.cloudflare.com:acc:proj"),
            "https%3A%2F%2Fapi.cloudflare.com%3Aacc%3Aproj"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn acquires_on_created() {
        let clock = FakeClock::default();
        let http = Arc::new(ScriptedClient::new());
        http.push(
            Method::Post,
            "/api/k",
            HttpResponse::new(201, lock_body("holder-1", clock.now())).with_header("ETag", "\"e1\""),
        );

        let mutex = client(http.clone(), clock.clone()).acquire("k").await.unwrap();
        assert_eq!(mutex.holder_id, "holder-1");
        assert_eq!(mutex.etag, "\"e1\"");
        assert_eq!(mutex.key, "k");
        assert_eq!(http.requests()[0].url, "https://locks.test/api/k");
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_conflict_keeps_polling_without_forcing() {
        let clock = FakeClock::default();
        let http = Arc::new(ScriptedClient::new());
        let held = HttpResponse::new(409, lock_body("other", clock.now())).with_header("ETag", "\"o\"");
        http.push(Method::Post, "/api/k", held.clone())
            .push(Method::Post, "/api/k", held)
            .push(
                Method::Post,
                "/api/k",
                HttpResponse::new(201, lock_body("me", clock.now())).with_header("ETag", "\"m\""),
            );

        let mutex = client(http.clone(), clock).acquire("k").await.unwrap();
        assert_eq!(mutex.holder_id, "me");
        let requests = http.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.header_value("If-Match").is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_conflict_forces_with_etag() {
        let clock = FakeClock::default();
        let recorded = clock.now() - ChronoDuration::seconds(61);
        let http = Arc::new(ScriptedClient::new());
        http.push(
            Method::Post,
            "/api/k",
            HttpResponse::new(409, lock_body("old", recorded)).with_header("ETag", "\"old\""),
        )
        .push(
            Method::Post,
            "/api/k",
            HttpResponse::new(200, lock_body("me", clock.now())).with_header("ETag", "\"new\""),
        );

        let mutex = client(http.clone(), clock).acquire("k").await.unwrap();
        assert_eq!(mutex.etag, "\"new\"");
        assert_eq!(http.requests()[1].header_value("If-Match"), Some("\"old\""));
    }

    #[tokio::test(start_paused = true)]
    async fn staleness_uses_recorded_timestamp_not_poll_start() {
        // The lock was taken "now" by the service even though this poller
        // has been running a long time; it must not be treated as stale.
        let clock = FakeClock::default();
        let http = Arc::new(ScriptedClient::new());
        clock.advance(ChronoDuration::minutes(30));
        http.push(
            Method::Post,
            "/api/k",
            HttpResponse::new(409, lock_body("other", clock.now())).with_header("ETag", "\"o\""),
        )
        .push(
            Method::Post,
            "/api/k",
            HttpResponse::new(201, lock_body("me", clock.now())).with_header("ETag", "\"m\""),
        );

        client(http.clone(), clock).acquire("k").await.unwrap();
        assert!(http.requests().iter().all(|r| r.header_value("If-Match").is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_status_is_soft_failure() {
        let clock = FakeClock::default();
        let http = Arc::new(ScriptedClient::new());
        http.push(Method::Post, "/api/k", HttpResponse::new(503, "busy"))
            .push_error(Method::Post, "/api/k", "connection reset")
            .push(
                Method::Post,
                "/api/k",
                HttpResponse::new(201, lock_body("me", clock.now())).with_header("ETag", "\"m\""),
            );

        let mutex = client(http.clone(), clock).acquire("k").await.unwrap();
        assert_eq!(mutex.holder_id, "me");
        assert_eq!(http.count(Method::Post, "/api/k"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out() {
        let clock = FakeClock::default();
        let http = Arc::new(ScriptedClient::new());
        http.always(
            Method::Post,
            "/api/k",
            HttpResponse::new(409, lock_body("other", clock.now())).with_header("ETag", "\"o\""),
        );

        let start = Instant::now();
        let err = client(http, clock).acquire("k").await.unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() > Duration::from_secs(600));
    }

    struct Unresponsive;

    #[async_trait]
    impl HttpClient for Unresponsive {
        async fn send(&self, _: HttpRequest) -> Result<HttpResponse> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_lock_service_still_times_out() {
        let start = Instant::now();
        let err = client(Arc::new(Unresponsive), FakeClock::default())
            .acquire("k")
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(start.elapsed(), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn release_sends_conditional_delete() {
        let http = Arc::new(ScriptedClient::new());
        http.push(Method::Delete, "/api/k", HttpResponse::new(200, ""));
        let mutex = Mutex {
            key: "k".to_string(),
            etag: "\"e\"".to_string(),
            holder_id: "me".to_string(),
            acquired_at: Utc::now(),
        };

        client(http.clone(), FakeClock::default()).release(&mutex).await.unwrap();
        assert_eq!(http.requests()[0].header_value("If-Match"), Some("\"e\""));
    }

    #[tokio::test]
    async fn release_conflict_is_api_error() {
        let http = Arc::new(ScriptedClient::new());
        http.push(Method::Delete, "/api/k", HttpResponse::new(412, "moved on"));
        let mutex = Mutex {
            key: "k".to_string(),
            etag: "\"e\"".to_string(),
            holder_id: "me".to_string(),
            acquired_at: Utc::now(),
        };

        let err = client(http, FakeClock::default()).release(&mutex).await.unwrap_err();
        match err {
            Error::Api(api) => {
                assert_eq!(api.status, 412);
                assert_eq!(api.message.as_deref(), Some("Could not release Mutex."));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    /// In-memory lock service speaking the same protocol.
    struct LockService {
        clock: FakeClock,
        locks: StdMutex<HashMap<String, (String, DateTime<Utc>, String)>>,
        next: StdMutex<u32>,
    }

    impl LockService {
        fn new(clock: FakeClock) -> Self {
            Self {
                clock,
                locks: StdMutex::new(HashMap::new()),
                next: StdMutex::new(0),
            }
        }

        fn issue(&self) -> (String, String) {
            let mut next = self.next.lock().unwrap();
            *next += 1;
            (format!("holder-{}", next), format!("\"etag-{}\"", next))
        }
    }

    #[async_trait]
    impl HttpClient for LockService {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
            let key = request.url.rsplit('/').next().unwrap_or_default().to_string();
            let mut locks = self.locks.lock().unwrap();
            let now = self.clock.now();
            let reply = |id: &str, ts: DateTime<Utc>, etag: &str, status: u16| {
                HttpResponse::new(status, lock_body(id, ts)).with_header("ETag", etag)
            };

            Ok(match request.method {
                Method::Post => match (locks.get(&key).cloned(), request.header_value("If-Match")) {
                    (None, _) => {
                        let (id, etag) = self.issue();
                        locks.insert(key, (id.clone(), now, etag.clone()));
                        reply(&id, now, &etag, 201)
                    }
                    (Some((_, _, current)), Some(precondition)) if precondition == current => {
                        let (id, etag) = self.issue();
                        locks.insert(key, (id.clone(), now, etag.clone()));
                        reply(&id, now, &etag, 200)
                    }
                    (Some((_, _, _)), Some(_)) => HttpResponse::new(412, ""),
                    (Some((id, ts, etag)), None) => reply(&id, ts, &etag, 409),
                },
                Method::Delete => match locks.get(&key).cloned() {
                    Some((_, _, etag)) if request.header_value("If-Match") == Some(etag.as_str()) => {
                        locks.remove(&key);
                        HttpResponse::new(200, "")
                    }
                    _ => HttpResponse::new(412, ""),
                },
                _ => HttpResponse::new(405, ""),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_acquirer_waits_for_release() {
        let clock = FakeClock::default();
        let service: Arc<dyn HttpClient> = Arc::new(LockService::new(clock.clone()));
        let first_client = client(service.clone(), clock.clone());
        let second_client = client(service, clock.clone());

        let first = first_client.acquire("k").await.unwrap();
        let second = tokio::spawn(async move { second_client.acquire("k").await });

        // Well under the stale threshold: the second acquirer is still waiting.
        tokio::time::sleep(Duration::from_secs(30)).await;
        clock.advance(ChronoDuration::seconds(30));
        assert!(!second.is_finished());

        first_client.release(&first).await.unwrap();
        let second = second.await.unwrap().unwrap();
        assert_ne!(second.holder_id, first.holder_id);
    }

    #[tokio::test(start_paused = true)]
    async fn second_acquirer_takes_over_stale_lock() {
        let clock = FakeClock::default();
        let service: Arc<dyn HttpClient> = Arc::new(LockService::new(clock.clone()));
        let first = client(service.clone(), clock.clone()).acquire("k").await.unwrap();

        clock.advance(ChronoDuration::seconds(60));
        let second = client(service.clone(), clock.clone()).acquire("k").await.unwrap();
        assert_ne!(second.etag, first.etag);

        // The previous holder has lost the lock.
        assert!(client(service, clock).release(&first).await.is_err());
    }
}
