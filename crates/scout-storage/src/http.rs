use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, SET_COOKIE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(JsonValue),
    Form(Vec<(String, String)>),
}

/// Transport-neutral description of one outbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub bearer_token: Option<String>,
    pub basic_auth: Option<(String, String)>,
    pub body: Option<RequestBody>,
    pub timeout: Option<Duration>,
    /// Reconnect attempts after a failed connection; `None` uses the transport default.
    pub max_retries: Option<usize>,
}

impl HttpRequest {
    fn with_method(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            bearer_token: None,
            basic_auth: None,
            body: None,
            timeout: None,
            max_retries: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::with_method(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::with_method(HttpMethod::Post, url)
    }

    pub fn query(mut self, name: &str, value: impl ToString) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((user.into(), password.into()));
        self
    }

    pub fn json(mut self, body: JsonValue) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = Some(RequestBody::Form(fields));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn no_retries(mut self) -> Self {
        self.max_retries = Some(0);
        self
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn new(status: StatusCode, final_url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            final_url: final_url.into(),
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Appends a header; invalid names or values are skipped.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn cookies(&self) -> Vec<(String, String)> {
        cookie_pairs(&self.headers)
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.cookies()
            .into_iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }
}

/// Name/value pairs from every `Set-Cookie` header, attributes dropped.
pub fn cookie_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|raw| raw.to_str().ok())
        .filter_map(|raw| {
            let pair = raw.split(';').next()?.trim();
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                None
            } else {
                Some((name.to_string(), value.trim().to_string()))
            }
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("transport error: {0}")]
    Transport(String),
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Request(err) if err.is_timeout())
    }
}

/// Seam between providers and the network.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends the request and returns the final response whatever its status; only
    /// transport failures are errors.
    async fn execute(&self, source_id: &str, request: &HttpRequest) -> Result<FetchedResponse, FetchError>;

    async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.execute(source_id, &HttpRequest::get(url)).await?;
        if !response.is_success() {
            return Err(FetchError::HttpStatus {
                status: response.status.as_u16(),
                url: response.final_url,
            });
        }
        Ok(response.body)
    }
}

/// Re-sends a request only when no connection could be opened. Responses come back as they
/// arrive, whatever their status: a 429 or a 5xx is for the caller to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub attempts: usize,
    pub pause: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            pause: Duration::from_millis(500),
        }
    }
}

impl ReconnectPolicy {
    /// Pause before reconnect `n` (1-based); grows linearly.
    pub fn pause_before(&self, n: usize) -> Duration {
        self.pause
            .saturating_mul(u32::try_from(n).unwrap_or(u32::MAX))
    }
}

/// Request spacing per provider: `burst` requests go out back to back, then one per
/// `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingConfig {
    pub burst: u32,
    pub interval: Duration,
}

/// Hands out send slots on a virtual schedule.
#[derive(Debug)]
struct Pacer {
    config: PacingConfig,
    next_slot: Mutex<Instant>,
}

impl Pacer {
    fn new(config: PacingConfig) -> Self {
        Self {
            config,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// Books the next slot and returns how long the caller has to wait for it.
    async fn reserve(&self) -> Duration {
        let mut next_slot = self.next_slot.lock().await;
        let now = Instant::now();
        let slot = (*next_slot).max(now);
        *next_slot = slot + self.config.interval;
        let allowance = self
            .config
            .interval
            .saturating_mul(self.config.burst.saturating_sub(1));
        slot.saturating_duration_since(now).saturating_sub(allowance)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub reconnect: ReconnectPolicy,
    pub pacing: Option<PacingConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            reconnect: ReconnectPolicy::default(),
            pacing: None,
        }
    }
}

/// Concurrency permits and pacing for one provider.
#[derive(Debug, Clone)]
struct SourceLane {
    permits: Arc<Semaphore>,
    pacer: Option<Arc<Pacer>>,
}

/// Reqwest-backed transport with global and per-provider concurrency limits and optional
/// per-provider pacing.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_concurrency: usize,
    pacing: Option<PacingConfig>,
    reconnect: ReconnectPolicy,
    lanes: Mutex<HashMap<String, SourceLane>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build().context("building reqwest client")?,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_concurrency: config.per_source_concurrency.max(1),
            pacing: config.pacing.filter(|p| !p.interval.is_zero()),
            reconnect: config.reconnect,
            lanes: Mutex::new(HashMap::new()),
        })
    }

    async fn lane(&self, source_id: &str) -> SourceLane {
        let mut lanes = self.lanes.lock().await;
        lanes
            .entry(source_id.to_string())
            .or_insert_with(|| SourceLane {
                permits: Arc::new(Semaphore::new(self.per_source_concurrency)),
                pacer: self.pacing.map(|config| Arc::new(Pacer::new(config))),
            })
            .clone()
    }

    fn build(&self, request: &HttpRequest) -> reqwest::RequestBuilder {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(token) = &request.bearer_token {
            builder = builder.bearer_auth(token);
        }
        if let Some((user, password)) = &request.basic_auth {
            builder = builder.basic_auth(user, Some(password));
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        match &request.body {
            Some(RequestBody::Json(value)) => builder.json(value),
            Some(RequestBody::Form(fields)) => builder.form(fields),
            None => builder,
        }
    }

    async fn send(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
        let allowed = request.max_retries.unwrap_or(self.reconnect.attempts);
        let mut reconnects = 0;
        loop {
            match self.build(request).send().await {
                Ok(response) => {
                    let status = response.status();
                    let final_url = response.url().to_string();
                    let headers = response.headers().clone();
                    let body = response.bytes().await?.to_vec();
                    debug!(%status, bytes = body.len(), "response received");
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        headers,
                        body,
                    });
                }
                Err(err) if err.is_connect() && reconnects < allowed => {
                    reconnects += 1;
                    let pause = self.reconnect.pause_before(reconnects);
                    debug!(error = %err, reconnects, ?pause, "connection failed; reconnecting");
                    tokio::time::sleep(pause).await;
                }
                Err(err) => return Err(FetchError::Request(err)),
            }
        }
    }
}

#[async_trait]
impl HttpTransport for HttpFetcher {
    async fn execute(&self, source_id: &str, request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        let lane = self.lane(source_id).await;
        let _source = lane
            .permits
            .acquire()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        if let Some(pacer) = &lane.pacer {
            let wait = pacer.reserve().await;
            if !wait.is_zero() {
                debug!(source_id, ?wait, "pacing request");
                tokio::time::sleep(wait).await;
            }
        }

        let span = info_span!("http_fetch", source_id, url = %request.url);
        self.send(request).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn reconnect_pauses_grow_linearly() {
        let policy = ReconnectPolicy {
            attempts: 3,
            pause: Duration::from_millis(200),
        };
        assert_eq!(policy.pause_before(1), Duration::from_millis(200));
        assert_eq!(policy.pause_before(3), Duration::from_millis(600));
        assert_eq!(ReconnectPolicy::default().attempts, 1);
    }

    #[tokio::test]
    async fn pacer_allows_a_burst_then_spaces_requests() {
        let pacer = Pacer::new(PacingConfig {
            burst: 2,
            interval: Duration::from_secs(60),
        });
        assert_eq!(pacer.reserve().await, Duration::ZERO);
        assert_eq!(pacer.reserve().await, Duration::ZERO);
        let third = pacer.reserve().await;
        assert!(third > Duration::from_secs(59) && third <= Duration::from_secs(60));
        let fourth = pacer.reserve().await;
        assert!(fourth > Duration::from_secs(119));
    }

    #[test]
    fn zero_interval_disables_pacing() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            pacing: Some(PacingConfig {
                burst: 1,
                interval: Duration::ZERO,
            }),
            ..Default::default()
        })
        .unwrap();
        assert!(fetcher.pacing.is_none());
    }

    #[tokio::test]
    async fn throttled_responses_are_returned_without_resending() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut request = [0u8; 4096];
                let _ = socket.read(&mut request).await;
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 429 Too Many Requests\r\nretry-after: 7\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    )
                    .await;
            }
        });

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let response = fetcher
            .execute("ebay", &HttpRequest::get(format!("http://{addr}/search")))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.header_str("retry-after"), Some("7"));
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn set_cookie_headers_are_split_into_pairs() {
        let mut headers = HeaderMap::new();
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("access_token_web=abc.def; Path=/; HttpOnly"),
        );
        headers.append(SET_COOKIE, HeaderValue::from_static("_session=s1"));
        headers.append(SET_COOKIE, HeaderValue::from_static("broken"));

        let pairs = cookie_pairs(&headers);
        assert_eq!(
            pairs,
            vec![
                ("access_token_web".to_string(), "abc.def".to_string()),
                ("_session".to_string(), "s1".to_string()),
            ]
        );
    }

    #[test]
    fn request_builder_collects_parts() {
        let req = HttpRequest::get("https://example.test/api")
            .query("page", 2)
            .header("X-Api-Key", "k")
            .bearer("tok")
            .no_retries();
        assert_eq!(req.query_value("page"), Some("2"));
        assert_eq!(req.header_value("x-api-key"), Some("k"));
        assert_eq!(req.bearer_token.as_deref(), Some("tok"));
        assert_eq!(req.max_retries, Some(0));
        assert_eq!(req.method, HttpMethod::Get);
    }
}
