//! In-process fake backend and test fixtures.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header::AUTHORIZATION, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio::task::JoinHandle;

use crate::api::OrderApi;
use crate::config::{ClientConfig, LocationConfig};
use crate::credentials::{CredentialStore, MemoryCredentialStore};
use crate::events::EventBus;
use crate::location::LocationBuffer;
use crate::models::OrderId;
use crate::queue::ActionQueue;
use crate::retry::RetryPolicy;
use crate::store::{init_db, ActionRepository, LocationRepository};
use crate::transport::{Transport, HEALTH_PATH, REFRESH_PATH};

/// Canned response for a route.
#[derive(Debug, Clone)]
pub struct Reply {
    status: u16,
    body: Value,
}

impl Reply {
    pub fn status(status: u16) -> Self {
        let body = if (200..300).contains(&status) {
            json!({})
        } else {
            json!({ "error": format!("status {}", status) })
        };
        Self { status, body }
    }

    pub fn json(status: u16, body: Value) -> Self {
        Self { status, body }
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.body)).into_response()
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub body: Value,
}

impl RecordedRequest {
    fn route(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

#[derive(Default)]
struct BackendInner {
    token_generation: u64,
    requests: Vec<RecordedRequest>,
    scripts: HashMap<String, VecDeque<Reply>>,
    defaults: HashMap<String, Reply>,
    orders: HashMap<OrderId, Option<DateTime<Utc>>>,
    removed: HashSet<OrderId>,
    refresh_delay: Duration,
    response_delay: Duration,
}

impl BackendInner {
    fn valid_token(&self) -> String {
        format!("access-{}", self.token_generation)
    }

    fn bump(&mut self, order_id: OrderId) -> Option<String> {
        if self.removed.contains(&order_id) {
            return None;
        }
        let now = Utc::now();
        self.orders.insert(order_id, Some(now));
        Some(stamp(&now))
    }

    fn default_reply(&mut self, method: &Method, path: &str, body: &Value) -> Reply {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        match (method.as_str(), segments.as_slice()) {
            ("GET", ["health"]) => Reply::status(200),
            ("POST", ["auth", "refresh"]) => {
                self.token_generation += 1;
                Reply::json(
                    200,
                    json!({
                        "access_token": self.valid_token(),
                        "refresh_token": format!("refresh-{}", self.token_generation),
                    }),
                )
            }
            ("POST", ["orders", "batch-pickup" | "batch-delivery"]) => {
                let ids: Vec<OrderId> = body["order_ids"]
                    .as_array()
                    .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
                    .unwrap_or_default();
                let mut orders = Vec::new();
                let mut latest = None;
                for id in ids {
                    match self.bump(id) {
                        Some(updated_at) => {
                            latest = Some(updated_at.clone());
                            orders.push(json!({ "id": id, "updated_at": updated_at }));
                        }
                        None => return Reply::status(404),
                    }
                }
                Reply::json(200, json!({ "updated_at": latest, "orders": orders }))
            }
            ("GET", ["orders", id]) => match id.parse::<OrderId>() {
                Ok(id) if self.removed.contains(&id) => Reply::status(404),
                Ok(id) => {
                    let updated_at = self.orders.get(&id).copied().flatten().map(|ts| stamp(&ts));
                    Reply::json(
                        200,
                        json!({ "id": id, "status": "assigned", "updated_at": updated_at }),
                    )
                }
                Err(_) => Reply::status(404),
            },
            ("PATCH", ["orders", id, "status"]) | ("POST", ["orders", id, "return"]) => {
                match id.parse::<OrderId>().ok().and_then(|id| self.bump(id)) {
                    Some(updated_at) => Reply::json(200, json!({ "updated_at": updated_at })),
                    None => Reply::status(404),
                }
            }
            ("POST", ["drivers", "location"]) => Reply::status(201),
            ("PATCH", ["drivers", "me", "status"]) => Reply::json(
                200,
                json!({ "is_available": body["is_available"].as_bool().unwrap_or(false) }),
            ),
            _ => Reply::status(404),
        }
    }
}

fn stamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[derive(Default)]
struct BackendState {
    inner: Mutex<BackendInner>,
}

impl BackendState {
    fn lock(&self) -> MutexGuard<'_, BackendInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn handle(
    State(state): State<Arc<BackendState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let recorded = RecordedRequest {
        method: method.to_string(),
        path: path.clone(),
        authorization: headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: serde_json::from_slice(&body).unwrap_or(Value::Null),
    };
    let route = recorded.route();
    let authorization = recorded.authorization.clone();
    let body = recorded.body.clone();

    let delay = {
        let mut inner = state.lock();
        inner.requests.push(recorded);
        if path == REFRESH_PATH {
            inner.refresh_delay
        } else {
            inner.response_delay
        }
    };
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let mut inner = state.lock();
    let public = path == REFRESH_PATH || path == HEALTH_PATH;
    if !public && authorization != Some(format!("Bearer {}", inner.valid_token())) {
        return Reply::status(401).into_response();
    }
    if let Some(reply) = inner.scripts.get_mut(&route).and_then(VecDeque::pop_front) {
        return reply.into_response();
    }
    if let Some(reply) = inner.defaults.get(&route) {
        return reply.clone().into_response();
    }
    inner.default_reply(&method, &path, &body).into_response()
}

/// A scriptable backend served on a random local port.
pub struct FakeBackend {
    state: Arc<BackendState>,
    addr: SocketAddr,
    server: JoinHandle<()>,
}

impl FakeBackend {
    pub async fn start() -> Self {
        let state = Arc::new(BackendState::default());
        let app = Router::new().fallback(handle).with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            state,
            addr,
            server,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn valid_token(&self) -> String {
        self.state.lock().valid_token()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    /// Requests for a route such as `"PATCH /orders/7/status"`.
    pub fn requests_to(&self, route: &str) -> Vec<RecordedRequest> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.route() == route)
            .cloned()
            .collect()
    }

    pub fn hits(&self, route: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.route() == route)
            .count()
    }

    pub fn refresh_calls(&self) -> usize {
        self.hits(&format!("POST {}", REFRESH_PATH))
    }

    /// Queues one-shot replies for a route, consumed in order.
    pub fn script(&self, route: &str, replies: Vec<Reply>) {
        self.state
            .lock()
            .scripts
            .entry(route.to_string())
            .or_default()
            .extend(replies);
    }

    /// Replaces the built-in behaviour of a route.
    pub fn set_default(&self, route: &str, reply: Reply) {
        self.state.lock().defaults.insert(route.to_string(), reply);
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        self.state.lock().refresh_delay = delay;
    }

    pub fn set_response_delay(&self, delay: Duration) {
        self.state.lock().response_delay = delay;
    }

    pub fn set_order(&self, order_id: OrderId, updated_at: Option<DateTime<Utc>>) {
        let mut inner = self.state.lock();
        inner.removed.remove(&order_id);
        inner.orders.insert(order_id, updated_at);
    }

    pub fn remove_order(&self, order_id: OrderId) {
        let mut inner = self.state.lock();
        inner.orders.remove(&order_id);
        inner.removed.insert(order_id);
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// A fake backend, a logged-in credential store and a fresh database.
pub struct TestContext {
    pub backend: FakeBackend,
    pub credentials: Arc<MemoryCredentialStore>,
    pub events: EventBus,
    pub transport: Arc<Transport>,
    pub config: ClientConfig,
    pub pool: SqlitePool,
    pub db_path: PathBuf,
    _temp_dir: TempDir,
}

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

impl TestContext {
    pub async fn new() -> Self {
        Self::with_backend(FakeBackend::start().await).await
    }

    pub async fn with_backend(backend: FakeBackend) -> Self {
        let url = backend.url();
        Self::build(backend, url, RetryPolicy::no_retry(), RECEIVE_TIMEOUT).await
    }

    pub async fn with_transport_retry(policy: RetryPolicy) -> Self {
        let backend = FakeBackend::start().await;
        let url = backend.url();
        Self::build(backend, url, policy, RECEIVE_TIMEOUT).await
    }

    /// A context whose requests give up waiting for a response after
    /// `receive_timeout`.
    pub async fn with_receive_timeout(receive_timeout: Duration, policy: RetryPolicy) -> Self {
        let backend = FakeBackend::start().await;
        let url = backend.url();
        Self::build(backend, url, policy, receive_timeout).await
    }

    /// A context whose transport points at a closed port.
    pub async fn unreachable() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = FakeBackend::start().await;
        Self::build(
            backend,
            format!("http://{}", addr),
            RetryPolicy::no_retry(),
            RECEIVE_TIMEOUT,
        )
        .await
    }

    async fn build(
        backend: FakeBackend,
        base_url: String,
        transport_retry: RetryPolicy,
        receive_timeout: Duration,
    ) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("courier.db");
        let pool = init_db(&db_path).await.unwrap();

        let config = ClientConfig::new(base_url)
            .with_connect_timeout(Duration::from_secs(2))
            .with_receive_timeout(receive_timeout)
            .with_transport_retry(transport_retry)
            .with_queue_retry(RetryPolicy::default().with_base_delay(Duration::ZERO));

        let credentials = Arc::new(MemoryCredentialStore::with_tokens(
            &backend.valid_token(),
            "refresh-0",
        ));
        let store: Arc<dyn CredentialStore> = credentials.clone();
        let events = EventBus::new(config.event_capacity);
        let transport = Arc::new(Transport::new(&config, store, events.clone()).unwrap());

        Self {
            backend,
            credentials,
            events,
            transport,
            config,
            pool,
            db_path,
            _temp_dir: temp_dir,
        }
    }

    pub fn api(&self) -> OrderApi {
        OrderApi::new(self.transport.clone())
    }

    /// A queue that retries without waiting.
    pub fn queue(&self) -> ActionQueue {
        self.queue_with_policy(self.config.queue_retry)
    }

    pub fn queue_with_policy(&self, policy: RetryPolicy) -> ActionQueue {
        ActionQueue::new(
            ActionRepository::new(self.pool.clone()),
            self.api(),
            policy,
            self.events.clone(),
        )
    }

    pub fn location_buffer(&self, config: LocationConfig) -> LocationBuffer {
        LocationBuffer::new(
            LocationRepository::new(self.pool.clone()),
            self.api(),
            config,
            RetryPolicy::default().with_base_delay(Duration::from_millis(10)),
        )
    }
}
