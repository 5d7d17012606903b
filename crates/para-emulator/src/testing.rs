//! In-memory broker doubles for unit tests.

use para_sdk::{BrokerAuth, Connector, Publish, TransportError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct Log {
    client_id: String,
    username: String,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    closed: AtomicBool,
    failing: AtomicBool,
    stalled: AtomicBool,
}

/// Records every publish. Clones share the same log.
#[derive(Debug, Clone)]
pub struct RecordingTransport {
    log: Arc<Log>,
}

impl RecordingTransport {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self::with_user(client_id, "")
    }

    fn with_user(client_id: impl Into<String>, username: &str) -> Self {
        Self {
            log: Arc::new(Log {
                client_id: client_id.into(),
                username: username.to_string(),
                ..Log::default()
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.log.client_id
    }

    pub fn username(&self) -> &str {
        &self.log.username
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.log.published.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.log.closed.load(Ordering::SeqCst)
    }

    /// Make every later publish fail.
    pub fn fail_publishes(&self) {
        self.log.failing.store(true, Ordering::SeqCst);
    }

    /// Make every later publish hang forever, like a session whose outgoing
    /// queue never drains.
    pub fn stall_publishes(&self) {
        self.log.stalled.store(true, Ordering::SeqCst);
    }
}

impl Publish for RecordingTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.log.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.is_closed() || self.log.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.log
            .published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn close(&self) {
        self.log.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out [`RecordingTransport`]s and keeps a clone of each.
#[derive(Debug, Default)]
pub struct RecordingConnector {
    refuse_every: Option<usize>,
    attempts: AtomicUsize,
    transports: Mutex<Vec<RecordingTransport>>,
}

impl RecordingConnector {
    /// Refuse every `n`th connection attempt.
    pub fn refusing_every(n: usize) -> Self {
        Self {
            refuse_every: Some(n),
            ..Self::default()
        }
    }

    pub fn transports(&self) -> Vec<RecordingTransport> {
        self.transports.lock().unwrap().clone()
    }
}

impl Connector for RecordingConnector {
    type Transport = RecordingTransport;

    async fn connect(&self, client_id: &str, auth: &BrokerAuth) -> Result<RecordingTransport, TransportError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.refuse_every.is_some_and(|n| attempt % n == 0) {
            return Err(TransportError::ConnectTimeout(Duration::ZERO));
        }
        let transport = RecordingTransport::with_user(client_id, &auth.username);
        self.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}
