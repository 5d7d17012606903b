//! Test doubles shared by the integration tests: an in-process registration
//! API and an in-memory broker.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use para_sdk::{BrokerAuth, Connector, Publish, TransportError};
use serde_json::{json, Value};

/// How the mock registration API answers.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Accept,
    /// Accept and hand out per-device broker credentials.
    AcceptWithBrokerCredentials,
    /// Answer 400 to the first `n` requests, then accept.
    CollideFirst(usize),
    /// Always answer with this status.
    Fail(u16),
}

#[derive(Clone)]
struct ApiState {
    behavior: Behavior,
    calls: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Value>>>,
}

pub struct MockApi {
    pub base_url: String,
    requests: Arc<Mutex<Vec<Value>>>,
}

impl MockApi {
    pub async fn start(behavior: Behavior) -> Self {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = ApiState {
            behavior,
            calls: Arc::new(AtomicUsize::new(0)),
            requests: requests.clone(),
        };
        let app = Router::new()
            .route("/api/v1/devices/register", post(register))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}/api/v1", addr),
            requests,
        }
    }

    /// Every request body received so far, in arrival order.
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    /// The device secret submitted for `device_id`.
    pub fn device_secret(&self, device_id: &str) -> Option<String> {
        self.requests()
            .iter()
            .find(|r| r["device_id"] == device_id)
            .and_then(|r| r["device_secret"].as_str().map(str::to_string))
    }
}

async fn register(State(state): State<ApiState>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let call = state.calls.fetch_add(1, Ordering::SeqCst) + 1;
    state.requests.lock().unwrap().push(body.clone());
    let device_id = body["device_id"].as_str().unwrap_or_default().to_string();

    match state.behavior {
        Behavior::CollideFirst(n) if call <= n => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Device already exists"})),
        ),
        Behavior::Fail(status) => (
            StatusCode::from_u16(status).unwrap(),
            Json(json!({"error": "unavailable"})),
        ),
        Behavior::AcceptWithBrokerCredentials => (
            StatusCode::CREATED,
            Json(json!({
                "api_key": format!("key-{}", device_id),
                "device_id": device_id,
                "mqtt_username": format!("mqtt-{}", device_id),
                "mqtt_password": "issued",
            })),
        ),
        _ => (
            StatusCode::OK,
            Json(json!({
                "api_key": format!("key-{}", device_id),
                "device_id": device_id,
            })),
        ),
    }
}

#[derive(Default)]
struct Outbox {
    messages: Mutex<Vec<(String, Vec<u8>)>>,
    closed: AtomicBool,
}

/// In-memory broker connection.
#[derive(Clone)]
pub struct MockTransport {
    pub client_id: String,
    pub username: String,
    outbox: Arc<Outbox>,
}

impl MockTransport {
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.outbox.messages.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.outbox.closed.load(Ordering::SeqCst)
    }
}

impl Publish for MockTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.outbox
            .messages
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn close(&self) {
        self.outbox.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out [`MockTransport`]s and remembers them. Clones share the record.
#[derive(Clone, Default)]
pub struct MockConnector {
    opened: Arc<Mutex<Vec<MockTransport>>>,
}

impl MockConnector {
    pub fn transports(&self) -> Vec<MockTransport> {
        self.opened.lock().unwrap().clone()
    }
}

impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn connect(&self, client_id: &str, auth: &BrokerAuth) -> Result<MockTransport, TransportError> {
        let transport = MockTransport {
            client_id: client_id.to_string(),
            username: auth.username.clone(),
            outbox: Arc::new(Outbox::default()),
        };
        self.opened.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}
