#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::post,
};
use drm_manager::{
    ActivatorLayout, Config, Credentials, DrmManager, ErrorObserver, RegisterPort,
    register::STATUS_ACTIVE_BIT, register::STATUS_READY_BIT,
};
use serde_json::{Value, json};
use tokio::{
    net::TcpListener,
    task::JoinHandle,
    time::{Instant, sleep},
};
use uuid::Uuid;

pub const CLIENT_ID: &str = "test-client";
pub const CLIENT_SECRET: &str = "test-secret";

pub const LAYOUT: ActivatorLayout = ActivatorLayout {
    base_address: 0x1000,
    address_range: 0x10,
    count: 2,
};

/// Behaviour of the fake licensing server.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub quota: u64,
    pub floating_limit: Option<usize>,
    pub license_duration: u32,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            quota: 1000,
            floating_limit: None,
            license_duration: 3,
        }
    }
}

#[derive(Debug)]
struct ServerState {
    options: ServerOptions,
    tokens: HashSet<String>,
    sessions: HashMap<String, u64>,
    usage: u64,
    requests: Vec<Value>,
    answered: Vec<String>,
    failures_to_inject: u32,
    renewal_delay: Duration,
}

/// In-process License Web Service implementing OAuth2, metered quota,
/// floating limit and error payloads.
pub struct FakeLicenseServer {
    pub url: String,
    state: Arc<Mutex<ServerState>>,
    task: JoinHandle<()>,
}

impl FakeLicenseServer {
    pub async fn start(options: ServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let state = Arc::new(Mutex::new(ServerState {
            options,
            tokens: HashSet::new(),
            sessions: HashMap::new(),
            usage: 0,
            requests: Vec::new(),
            answered: Vec::new(),
            failures_to_inject: 0,
            renewal_delay: Duration::ZERO,
        }));

        let app = Router::new()
            .route("/o/token/", post(token))
            .route("/auth/metering/genlicense/", post(genlicense))
            .with_state(state.clone());

        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("fake server");
        });

        Self {
            url: format!("http://{addr}"),
            state,
            task,
        }
    }

    pub fn usage(&self) -> u64 {
        self.state.lock().unwrap().usage
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    /// License requests received so far, oldest first.
    pub fn requests(&self) -> Vec<Value> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn requests_of_kind(&self, kind: &str) -> Vec<Value> {
        self.requests()
            .into_iter()
            .filter(|request| request["request"] == kind)
            .collect()
    }

    /// Kinds of the license requests answered so far, in completion order.
    pub fn answered(&self) -> Vec<String> {
        self.state.lock().unwrap().answered.clone()
    }

    /// Answers the next `count` license requests with a 503.
    pub fn inject_failures(&self, count: u32) {
        self.state.lock().unwrap().failures_to_inject = count;
    }

    /// Holds every renewal answer back for `delay`.
    pub fn delay_renewals(&self, delay: Duration) {
        self.state.lock().unwrap().renewal_delay = delay;
    }
}

impl Drop for FakeLicenseServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

type SharedState = State<Arc<Mutex<ServerState>>>;

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn token(State(state): SharedState, body: String) -> Response {
    let params: HashMap<String, String> = url::form_urlencoded::parse(body.as_bytes())
        .into_owned()
        .collect();

    let valid = params.get("client_id").map(String::as_str) == Some(CLIENT_ID)
        && params.get("client_secret").map(String::as_str) == Some(CLIENT_SECRET)
        && params.get("grant_type").map(String::as_str) == Some("client_credentials");
    if !valid {
        return error(StatusCode::UNAUTHORIZED, "invalid_client");
    }

    let token = Uuid::new_v4().simple().to_string();
    state.lock().unwrap().tokens.insert(token.clone());
    Json(json!({"access_token": token, "expires_in": 3600, "token_type": "Bearer"})).into_response()
}

async fn genlicense(State(state): SharedState, headers: HeaderMap, Json(request): Json<Value>) -> Response {
    let admitted = admit(&mut state.lock().unwrap(), &headers, &request);
    let delay = match admitted {
        Ok(delay) => delay,
        Err(response) => return response,
    };
    if !delay.is_zero() {
        sleep(delay).await;
    }

    let mut state = state.lock().unwrap();
    let response = answer(&mut state, &request);
    if let Some(kind) = request["request"].as_str() {
        state.answered.push(kind.to_owned());
    }
    response
}

/// Authenticates and records a license request, returning how long its
/// answer is held back.
fn admit(state: &mut ServerState, headers: &HeaderMap, request: &Value) -> Result<Duration, Response> {
    let authorized = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| state.tokens.contains(token));
    if !authorized {
        return Err(error(StatusCode::UNAUTHORIZED, "Authentication credentials were not provided"));
    }

    state.requests.push(request.clone());

    if state.failures_to_inject > 0 {
        state.failures_to_inject -= 1;
        return Err(error(StatusCode::SERVICE_UNAVAILABLE, "Service temporarily unavailable"));
    }

    Ok(if request["request"] == "running" {
        state.renewal_delay
    } else {
        Duration::ZERO
    })
}

fn answer(state: &mut ServerState, request: &Value) -> Response {
    let metering_data = request["meteringData"].as_u64().unwrap_or(0);
    let duration = state.options.license_duration;
    let quota = state.options.quota;
    let quota_error = format!(
        "Entitlement Limit Reached: You have reached the maximum quantity of {quota}. Please contact your sales representative."
    );

    match request["request"].as_str() {
        Some("open") => {
            if request["mode"] == 1 {
                let session_id = Uuid::new_v4().to_string();
                return Json(json!({
                    "metering": {"sessionId": session_id},
                    "license": {"nodelocked": true, "udid": request["udid"]},
                }))
                .into_response();
            }

            if let Some(limit) = state.options.floating_limit
                && state.sessions.len() >= limit
            {
                return error(
                    StatusCode::from_u16(470).expect("valid status"),
                    "No floating license available",
                );
            }
            if state.usage >= quota {
                return error(StatusCode::BAD_REQUEST, &quota_error);
            }

            let session_id = Uuid::new_v4().to_string();
            state.sessions.insert(session_id.clone(), 0);
            Json(json!({
                "metering": {
                    "sessionId": session_id,
                    "timeoutSecond": duration,
                    "quotaRemaining": quota - state.usage,
                },
                "license": {"key": Uuid::new_v4().simple().to_string()},
            }))
            .into_response()
        }
        Some(kind @ ("running" | "close")) => {
            let Some(session_id) = request["sessionId"].as_str().map(str::to_owned) else {
                return error(StatusCode::BAD_REQUEST, "Missing sessionId");
            };
            let Some(last) = state.sessions.get(&session_id).copied() else {
                return error(StatusCode::BAD_REQUEST, "Unknown session");
            };

            state.usage += metering_data.saturating_sub(last);
            state.sessions.insert(session_id.clone(), metering_data.max(last));

            if kind == "close" {
                state.sessions.remove(&session_id);
                return Json(json!({"metering": {"sessionId": session_id}})).into_response();
            }
            if state.usage >= quota {
                return error(StatusCode::BAD_REQUEST, &quota_error);
            }

            Json(json!({
                "metering": {
                    "sessionId": session_id,
                    "timeoutSecond": duration,
                    "quotaRemaining": quota - state.usage,
                },
                "license": {"key": Uuid::new_v4().simple().to_string()},
            }))
            .into_response()
        }
        _ => error(StatusCode::BAD_REQUEST, "Unsupported request"),
    }
}

/// In-memory FPGA register map with activators at [`LAYOUT`].
#[derive(Debug, Default)]
pub struct FakeBoard {
    registers: Mutex<HashMap<u64, u32>>,
    fail_access: AtomicBool,
}

impl FakeBoard {
    pub fn new() -> Arc<Self> {
        let board = Self::default();
        {
            let mut registers = board.registers.lock().unwrap();
            for index in 0..LAYOUT.count {
                registers.insert(LAYOUT.status_address(index), STATUS_READY_BIT);
            }
        }
        Arc::new(board)
    }

    /// Adds `coins` to the counter of an active activator. Returns false, and
    /// counts nothing, when the activator is disabled.
    pub fn generate_coin(&self, index: u32, coins: u32) -> bool {
        if !self.is_active(index) {
            return false;
        }
        let mut registers = self.registers.lock().unwrap();
        let counter = registers.entry(LAYOUT.counter_address(index)).or_insert(0);
        *counter = counter.wrapping_add(coins);
        true
    }

    pub fn set_counter(&self, index: u32, raw: u32) {
        self.registers
            .lock()
            .unwrap()
            .insert(LAYOUT.counter_address(index), raw);
    }

    pub fn is_active(&self, index: u32) -> bool {
        let registers = self.registers.lock().unwrap();
        registers
            .get(&LAYOUT.status_address(index))
            .is_some_and(|status| status & STATUS_ACTIVE_BIT != 0)
    }

    pub fn fail_access(&self, fail: bool) {
        self.fail_access.store(fail, Ordering::SeqCst);
    }
}

impl RegisterPort for FakeBoard {
    fn read(&self, address: u64) -> io::Result<u32> {
        if self.fail_access.load(Ordering::SeqCst) {
            return Err(io::Error::other("bus error"));
        }
        Ok(self
            .registers
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .unwrap_or(0))
    }

    fn write(&self, address: u64, value: u32) -> io::Result<()> {
        if self.fail_access.load(Ordering::SeqCst) {
            return Err(io::Error::other("bus error"));
        }
        self.registers.lock().unwrap().insert(address, value);
        Ok(())
    }
}

/// Collects the messages delivered to the asynchronous error observer.
#[derive(Debug, Clone, Default)]
pub struct ErrorRecorder(Arc<Mutex<Vec<String>>>);

impl ErrorRecorder {
    pub fn observer(&self) -> ErrorObserver {
        let messages = self.0.clone();
        Arc::new(move |message: &str| messages.lock().unwrap().push(message.to_owned()))
    }

    pub fn messages(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Waits until at least `count` messages arrived or `within` elapsed.
    pub async fn wait_for(&self, count: usize, within: Duration) -> Vec<String> {
        let deadline = Instant::now() + within;
        loop {
            let messages = self.messages();
            if messages.len() >= count || Instant::now() >= deadline {
                return messages;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Settings shortened so that retries and renewals happen within a test.
pub fn fast_settings() -> Value {
    json!({
        "log_verbosity": 1,
        "ws_retry_period_short": 0.1,
        "ws_retry_period_long": 0.5,
        "ws_request_timeout": 3,
        "ws_attempt_timeout": 2,
        "ws_max_attempts": 4,
        "renewal_threshold": 0.5,
        "scheduler_tick": 0.1,
        "scheduler_stop_grace": 2,
    })
}

pub fn metered_config(url: &str) -> Config {
    Config::from_json_str(
        &json!({
            "licensing": {"url": url},
            "drm": {
                "frequency_mhz": 125,
                "activators": {
                    "base_address": LAYOUT.base_address,
                    "address_range": LAYOUT.address_range,
                    "count": LAYOUT.count,
                },
            },
            "design": {"udid": "6AE1A700-0000-0000-0000-000000000001", "boardType": "FAKE_BOARD"},
            "settings": fast_settings(),
        })
        .to_string(),
    )
    .expect("valid test configuration")
}

pub fn credentials() -> Credentials {
    Credentials::new(CLIENT_ID, CLIENT_SECRET)
}

pub fn manager(config: Config, board: &Arc<FakeBoard>, recorder: &ErrorRecorder) -> DrmManager {
    DrmManager::new(config, credentials(), board.clone(), recorder.observer())
        .expect("manager construction")
}
