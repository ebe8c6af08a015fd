//! HTTP transport for the courier backend.
//!
//! Every request goes through the same pipeline: bearer-token injection,
//! dispatch, error classification, 401 handling via a single-flight refresh
//! with one replay, and transparent retries for transient failures.

mod error;
mod refresh;

pub use error::{ErrorClass, TransportError, TransportResult};
pub use refresh::{RefreshCoordinator, RefreshOutcome};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::credentials::{keys, CredentialStore};
use crate::events::{EventBus, SyncEvent};
use crate::retry::{RetryDecision, RetryPolicy};

/// Path of the token refresh endpoint. Requests to it are never intercepted.
pub const REFRESH_PATH: &str = "/auth/refresh";
/// Path used to probe connectivity.
pub const HEALTH_PATH: &str = "/health";

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// An outbound request, relative to the transport's base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    method: Method,
    path: String,
    body: Option<serde_json::Value>,
    headers: Vec<(String, String)>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    /// Attaches a JSON body.
    pub fn with_json<T: Serialize>(mut self, body: &T) -> TransportResult<Self> {
        let value = serde_json::to_value(body).map_err(|e| TransportError::Build(e.to_string()))?;
        self.body = Some(value);
        Ok(self)
    }

    /// Adds an extra header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn body(&self) -> Option<&serde_json::Value> {
        self.body.as_ref()
    }
}

/// A successful (2xx) response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> TransportResult<T> {
        serde_json::from_str(&self.body).map_err(|e| TransportError::Decode(e.to_string()))
    }

    pub fn text(&self) -> &str {
        &self.body
    }

    pub fn is_empty(&self) -> bool {
        self.body.trim().is_empty()
    }
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenPair {
    access_token: String,
    refresh_token: String,
}

/// Authenticated HTTP client shared by the queue, the location buffer and
/// direct calls.
pub struct Transport {
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialStore>,
    refresh: RefreshCoordinator,
    retry: RetryPolicy,
    events: EventBus,
    /// Set once the session is torn down; cleared when a new refresh token appears.
    expired: AtomicBool,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("base_url", &self.base_url)
            .field("retry", &self.retry)
            .field("refresh_epoch", &self.refresh.epoch())
            .field("expired", &self.expired.load(Ordering::SeqCst))
            .finish()
    }
}

impl Transport {
    /// Creates a transport from configuration.
    pub fn new(
        config: &ClientConfig,
        credentials: Arc<dyn CredentialStore>,
        events: EventBus,
    ) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.receive_timeout)
            .build()
            .map_err(|e| TransportError::Build(e.to_string()))?;

        Ok(Self {
            client,
            base_url: normalize_base_url(&config.base_url),
            credentials,
            refresh: RefreshCoordinator::new(),
            retry: config.transport_retry,
            events,
            expired: AtomicBool::new(false),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Whether a token refresh is currently in flight.
    pub fn refresh_in_progress(&self) -> bool {
        self.refresh.in_progress()
    }

    /// Releases every request waiting on a refresh with
    /// [`TransportError::Cancelled`].
    pub async fn cancel_pending_refresh(&self) {
        self.refresh.cancel_waiters().await;
    }

    /// Sends a request, retrying transient failures per the transport policy.
    pub async fn send(&self, request: &Request) -> TransportResult<Response> {
        let mut attempt = 0;
        loop {
            let err = match self.send_authorized(request).await {
                Ok(response) => {
                    debug!(
                        method = %request.method,
                        path = %request.path,
                        status = response.status,
                        attempt,
                        "request succeeded"
                    );
                    return Ok(response);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                debug!(method = %request.method, path = %request.path, error = %err, "request failed");
                return Err(err);
            }

            let class = err.class();
            match self.retry.decide(class, attempt) {
                RetryDecision::Retry(delay) => {
                    if class == ErrorClass::Unknown {
                        error!(
                            method = %request.method,
                            path = %request.path,
                            error = %err,
                            "unexpected transport failure, retrying"
                        );
                    } else {
                        warn!(
                            method = %request.method,
                            path = %request.path,
                            error = %err,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "request failed, retrying"
                        );
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::GiveUp => {
                    if class == ErrorClass::Unknown {
                        error!(method = %request.method, path = %request.path, error = %err, "giving up on request");
                    } else {
                        warn!(method = %request.method, path = %request.path, error = %err, attempts = attempt + 1, "giving up on request");
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Checks whether the backend answers at all. Any HTTP response counts.
    pub async fn probe(&self) -> bool {
        match self
            .client
            .get(self.url(HEALTH_PATH))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "connectivity probe failed");
                false
            }
        }
    }

    /// Whether the session has expired and no new refresh token was stored
    /// since.
    pub fn session_expired(&self) -> bool {
        if !self.expired.load(Ordering::SeqCst) {
            return false;
        }
        if self.credentials.read(keys::REFRESH_TOKEN).is_some() {
            self.expired.store(false, Ordering::SeqCst);
            info!("new session credentials found");
            return false;
        }
        true
    }

    async fn send_authorized(&self, request: &Request) -> TransportResult<Response> {
        if self.session_expired() {
            debug!(method = %request.method, path = %request.path, "session expired, not sending");
            return Err(TransportError::SessionExpired);
        }

        let epoch = self.refresh.epoch();
        match self.dispatch(request).await {
            Err(err) if err.class() == ErrorClass::Unauthorized => {}
            other => return other,
        }

        if request.path == REFRESH_PATH {
            warn!("refresh endpoint rejected the request");
            self.expire_session();
            return Err(TransportError::SessionExpired);
        }

        match self
            .refresh
            .refresh_after(epoch, || self.refresh_tokens())
            .await
        {
            RefreshOutcome::Refreshed => {
                debug!(path = %request.path, "replaying request after token refresh");
                self.dispatch(request).await
            }
            RefreshOutcome::Expired => Err(TransportError::SessionExpired),
            RefreshOutcome::Cancelled => Err(TransportError::Cancelled),
        }
    }

    async fn dispatch(&self, request: &Request) -> TransportResult<Response> {
        let mut builder = self
            .client
            .request(request.method.clone(), self.url(&request.path));
        if let Some(token) = self.credentials.read(keys::ACCESS_TOKEN) {
            builder = builder.bearer_auth(token);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(TransportError::from_reqwest)?;
        let status = response.status();
        let body = response.text().await.map_err(TransportError::from_reqwest)?;

        match ErrorClass::from_status(status) {
            None => Ok(Response {
                status: status.as_u16(),
                body,
            }),
            Some(class) => Err(TransportError::http(class, Some(status.as_u16()), body)),
        }
    }

    /// Exchanges the stored refresh token for a new token pair. Runs outside
    /// the 401 interception so it can never recurse.
    async fn refresh_tokens(&self) -> RefreshOutcome {
        let Some(refresh_token) = self.credentials.read(keys::REFRESH_TOKEN) else {
            warn!("no refresh token stored, session cannot be renewed");
            self.expire_session();
            return RefreshOutcome::Expired;
        };

        info!("refreshing access token");
        let response = match self
            .client
            .post(self.url(REFRESH_PATH))
            .json(&RefreshRequest {
                refresh_token: &refresh_token,
            })
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let class = ErrorClass::from_reqwest(&e);
                warn!(error = %e, %class, "token refresh could not reach the server");
                self.expire_session();
                return RefreshOutcome::Expired;
            }
        };

        let status = response.status();
        if !status.is_success() {
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                warn!(status = status.as_u16(), "refresh token rejected");
            } else {
                let class = ErrorClass::from_status(status).unwrap_or(ErrorClass::Unknown);
                warn!(status = status.as_u16(), %class, "token refresh failed");
            }
            self.expire_session();
            return RefreshOutcome::Expired;
        }

        let tokens: TokenPair = match response.json().await {
            Ok(tokens) => tokens,
            Err(e) => {
                error!(error = %e, "malformed token refresh response");
                self.expire_session();
                return RefreshOutcome::Expired;
            }
        };

        let stored = self
            .credentials
            .write(keys::ACCESS_TOKEN, &tokens.access_token)
            .and_then(|_| {
                self.credentials
                    .write(keys::REFRESH_TOKEN, &tokens.refresh_token)
            });
        if let Err(e) = stored {
            error!(error = %e, "failed to persist refreshed tokens");
            self.expire_session();
            return RefreshOutcome::Expired;
        }

        info!("access token refreshed");
        RefreshOutcome::Refreshed
    }

    /// Clears the tokens and announces the expiry once per session.
    fn expire_session(&self) {
        if let Err(e) = self.credentials.clear_tokens() {
            error!(error = %e, "failed to clear credentials");
        }
        if !self.expired.swap(true, Ordering::SeqCst) {
            self.events.emit(SyncEvent::SessionExpired);
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn normalize_base_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, Reply, TestContext};
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("http://localhost:8080/"), "http://localhost:8080");
        assert_eq!(normalize_base_url("localhost:8080"), "http://localhost:8080");
        assert_eq!(
            normalize_base_url("https://api.example.com"),
            "https://api.example.com"
        );
    }

    #[tokio::test]
    async fn test_injects_bearer_token() {
        let ctx = TestContext::new().await;
        let response = ctx.transport.send(&Request::get("/orders/1")).await.unwrap();
        assert_eq!(response.status, 200);

        let requests = ctx.backend.requests();
        assert_eq!(
            requests[0].authorization.as_deref(),
            Some(format!("Bearer {}", ctx.backend.valid_token()).as_str())
        );
    }

    #[tokio::test]
    async fn test_concurrent_unauthorized_requests_share_one_refresh() {
        let ctx = TestContext::new().await;
        ctx.credentials
            .write(keys::ACCESS_TOKEN, "stale-token")
            .unwrap();
        ctx.backend.set_refresh_delay(Duration::from_millis(100));

        let first = Request::get("/orders/1");
        let second = Request::get("/orders/2");
        let (a, b) = tokio::join!(ctx.transport.send(&first), ctx.transport.send(&second));

        assert!(a.is_ok(), "{:?}", a);
        assert!(b.is_ok(), "{:?}", b);
        assert_eq!(ctx.backend.refresh_calls(), 1);
        assert_eq!(
            ctx.credentials.read(keys::ACCESS_TOKEN),
            Some(ctx.backend.valid_token())
        );
        assert!(!ctx.transport.refresh_in_progress());
    }

    #[tokio::test]
    async fn test_rejected_refresh_expires_session_once() {
        let ctx = TestContext::new().await;
        let mut events = ctx.events.subscribe();
        ctx.credentials
            .write(keys::ACCESS_TOKEN, "stale-token")
            .unwrap();
        ctx.backend
            .script("POST /auth/refresh", vec![Reply::status(401)]);

        let err = ctx
            .transport
            .send(&Request::get("/orders/1"))
            .await
            .unwrap_err();

        assert_eq!(err, TransportError::SessionExpired);
        assert!(ctx.credentials.read(keys::ACCESS_TOKEN).is_none());
        assert!(ctx.credentials.read(keys::REFRESH_TOKEN).is_none());
        assert_eq!(ctx.backend.refresh_calls(), 1);
        assert_eq!(events.try_recv().unwrap(), SyncEvent::SessionExpired);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_unauthorized_refresh_path_is_terminal() {
        let ctx = TestContext::new().await;
        let mut events = ctx.events.subscribe();
        ctx.backend
            .script("POST /auth/refresh", vec![Reply::status(401)]);

        let request = Request::post(REFRESH_PATH)
            .with_json(&serde_json::json!({ "refresh_token": "r" }))
            .unwrap();
        let err = ctx.transport.send(&request).await.unwrap_err();

        assert_eq!(err, TransportError::SessionExpired);
        // Only the intercepted request itself; no nested refresh
        assert_eq!(ctx.backend.refresh_calls(), 1);
        assert!(ctx.credentials.read(keys::REFRESH_TOKEN).is_none());
        assert_eq!(events.try_recv().unwrap(), SyncEvent::SessionExpired);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_expires_without_network() {
        let ctx = TestContext::new().await;
        ctx.credentials.clear_tokens().unwrap();

        let err = ctx
            .transport
            .send(&Request::get("/orders/1"))
            .await
            .unwrap_err();

        assert_eq!(err, TransportError::SessionExpired);
        assert_eq!(ctx.backend.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_refresh_server_error_expires_session() {
        let ctx = TestContext::with_transport_retry(
            RetryPolicy::default().with_base_delay(Duration::from_millis(1)),
        )
        .await;
        let mut events = ctx.events.subscribe();
        ctx.credentials
            .write(keys::ACCESS_TOKEN, "stale-token")
            .unwrap();
        ctx.backend
            .script("POST /auth/refresh", vec![Reply::status(503)]);

        let err = ctx
            .transport
            .send(&Request::get("/orders/1"))
            .await
            .unwrap_err();

        assert_eq!(err, TransportError::SessionExpired);
        assert!(ctx.credentials.read(keys::ACCESS_TOKEN).is_none());
        assert!(ctx.credentials.read(keys::REFRESH_TOKEN).is_none());
        // Not retried by the transport policy
        assert_eq!(ctx.backend.refresh_calls(), 1);
        assert_eq!(ctx.backend.hits("GET /orders/1"), 1);
        assert_eq!(events.try_recv().unwrap(), SyncEvent::SessionExpired);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_unreachable_refresh_expires_session() {
        let ctx = TestContext::new().await;
        let mut events = ctx.events.subscribe();
        ctx.credentials
            .write(keys::ACCESS_TOKEN, "stale-token")
            .unwrap();
        ctx.backend.set_refresh_delay(Duration::from_secs(10));
        let transport = Transport::new(
            &ctx.config
                .clone()
                .with_receive_timeout(Duration::from_millis(100)),
            ctx.transport.credentials().clone(),
            ctx.events.clone(),
        )
        .unwrap();

        let err = transport
            .send(&Request::get("/orders/1"))
            .await
            .unwrap_err();

        assert_eq!(err, TransportError::SessionExpired);
        assert!(ctx.credentials.read(keys::REFRESH_TOKEN).is_none());
        assert_eq!(events.try_recv().unwrap(), SyncEvent::SessionExpired);
    }

    #[tokio::test]
    async fn test_expired_session_stops_sending() {
        let ctx = TestContext::new().await;
        let mut events = ctx.events.subscribe();
        ctx.credentials
            .write(keys::ACCESS_TOKEN, "stale-token")
            .unwrap();
        ctx.backend
            .script("POST /auth/refresh", vec![Reply::status(401)]);

        for _ in 0..3 {
            let err = ctx
                .transport
                .send(&Request::get("/orders/1"))
                .await
                .unwrap_err();
            assert_eq!(err, TransportError::SessionExpired);
        }

        assert!(ctx.transport.session_expired());
        assert_eq!(ctx.backend.hits("GET /orders/1"), 1);
        assert_eq!(ctx.backend.refresh_calls(), 1);
        assert_eq!(events.try_recv().unwrap(), SyncEvent::SessionExpired);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_new_tokens_resume_after_expiry() {
        let ctx = TestContext::new().await;
        let mut events = ctx.events.subscribe();
        ctx.credentials
            .write(keys::ACCESS_TOKEN, "stale-token")
            .unwrap();
        ctx.backend
            .script("POST /auth/refresh", vec![Reply::status(401)]);
        let err = ctx
            .transport
            .send(&Request::get("/orders/1"))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::SessionExpired);
        assert_eq!(events.try_recv().unwrap(), SyncEvent::SessionExpired);

        ctx.credentials
            .write(keys::ACCESS_TOKEN, &ctx.backend.valid_token())
            .unwrap();
        ctx.credentials
            .write(keys::REFRESH_TOKEN, "refresh-1")
            .unwrap();

        let response = ctx.transport.send(&Request::get("/orders/1")).await.unwrap();
        assert_eq!(response.status, 200);
        assert!(!ctx.transport.session_expired());

        // A second expiry is announced again
        ctx.credentials
            .write(keys::ACCESS_TOKEN, "stale-again")
            .unwrap();
        ctx.backend
            .script("POST /auth/refresh", vec![Reply::status(401)]);
        let err = ctx
            .transport
            .send(&Request::get("/orders/2"))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::SessionExpired);
        assert_eq!(events.try_recv().unwrap(), SyncEvent::SessionExpired);
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let ctx = TestContext::with_transport_retry(
            RetryPolicy::default().with_base_delay(Duration::from_millis(5)),
        )
        .await;
        ctx.backend.script(
            "GET /orders/1",
            vec![Reply::status(503), Reply::status(502)],
        );

        let response = ctx.transport.send(&Request::get("/orders/1")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(ctx.backend.hits("GET /orders/1"), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let ctx = TestContext::with_transport_retry(
            RetryPolicy::default().with_base_delay(Duration::from_millis(1)),
        )
        .await;
        ctx.backend.set_default("GET /orders/1", Reply::status(500));

        let err = ctx
            .transport
            .send(&Request::get("/orders/1"))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::ServerError);
        // initial attempt plus three retries
        assert_eq!(ctx.backend.hits("GET /orders/1"), 4);
    }

    #[tokio::test]
    async fn test_does_not_retry_permanent_failures() {
        let ctx = TestContext::with_transport_retry(
            RetryPolicy::default().with_base_delay(Duration::from_millis(1)),
        )
        .await;
        ctx.backend.set_default("GET /orders/1", Reply::status(403));

        let err = ctx
            .transport
            .send(&Request::get("/orders/1"))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Forbidden);
        assert_eq!(ctx.backend.hits("GET /orders/1"), 1);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_classified() {
        let ctx = TestContext::unreachable().await;
        let err = ctx
            .transport
            .send(&Request::get("/orders/1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.class(),
            ErrorClass::NetworkUnreachable | ErrorClass::Timeout
        ));
        assert!(!ctx.transport.probe().await);
    }

    #[tokio::test]
    async fn test_receive_timeout_is_retried() {
        let ctx = TestContext::with_receive_timeout(
            Duration::from_millis(100),
            RetryPolicy::default().with_base_delay(Duration::from_millis(1)),
        )
        .await;
        ctx.backend.set_response_delay(Duration::from_millis(500));

        let err = ctx
            .transport
            .send(&Request::get("/orders/1"))
            .await
            .unwrap_err();

        assert_eq!(err.class(), ErrorClass::Timeout);
        assert!(err.is_retryable());
        // initial attempt plus three retries
        assert_eq!(ctx.backend.hits("GET /orders/1"), 4);
    }

    #[tokio::test]
    async fn test_probe_reaches_backend() {
        let backend = FakeBackend::start().await;
        let ctx = TestContext::with_backend(backend).await;
        assert!(ctx.transport.probe().await);
    }
}
