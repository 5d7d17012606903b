//! Shared broker connections for large fleets.
//!
//! Above the dedicated-connection threshold devices do not get a session of
//! their own. They borrow handles from a [`TransportPool`], handed out round
//! robin, so the emulator stays within file descriptor and broker limits.

use chrono::Utc;
use para_sdk::{BrokerAuth, Connector, Publish};
use std::sync::{Arc, Mutex, PoisonError};

pub struct TransportPool<T> {
    handles: Vec<Arc<T>>,
    cursor: Mutex<usize>,
}

impl<T: Publish> TransportPool<T> {
    pub fn from_handles(handles: Vec<T>) -> Self {
        Self {
            handles: handles.into_iter().map(Arc::new).collect(),
            cursor: Mutex::new(0),
        }
    }

    /// Open up to `size` connections. Failed connections are logged and
    /// left out, so the pool may come back smaller than requested.
    pub async fn connect<C>(connector: &C, auth: &BrokerAuth, size: usize) -> Self
    where
        C: Connector<Transport = T>,
    {
        tracing::info!("Creating MQTT connection pool with {} connections", size);
        let stamp = Utc::now().timestamp();
        let mut handles = Vec::with_capacity(size);
        for i in 0..size {
            let client_id = format!("pool-{}-{}", i, stamp);
            match connector.connect(&client_id, auth).await {
                Ok(handle) => handles.push(handle),
                Err(e) => tracing::warn!("Failed to create pool connection {}: {}", i, e),
            }
        }
        tracing::info!("Created {} pool connections", handles.len());
        Self::from_handles(handles)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Next handle in rotation. Callers share it with other devices.
    pub fn next(&self) -> Option<Arc<T>> {
        if self.handles.is_empty() {
            return None;
        }
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = self.handles[*cursor % self.handles.len()].clone();
        *cursor = (*cursor + 1) % self.handles.len();
        Some(handle)
    }

    pub async fn close_all(&self) {
        for handle in &self.handles {
            handle.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingConnector, RecordingTransport};

    #[test]
    fn next_rotates_through_every_handle() {
        let pool = TransportPool::from_handles(
            (0..4).map(|i| RecordingTransport::new(format!("pool-{}", i))).collect(),
        );

        let first: Vec<String> = (0..4).map(|_| pool.next().unwrap().client_id().to_string()).collect();
        assert_eq!(first, ["pool-0", "pool-1", "pool-2", "pool-3"]);

        let second: Vec<String> = (0..4).map(|_| pool.next().unwrap().client_id().to_string()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn empty_pool_has_nothing_to_hand_out() {
        let pool: TransportPool<RecordingTransport> = TransportPool::from_handles(Vec::new());
        assert!(pool.next().is_none());
    }

    #[tokio::test]
    async fn connect_skips_refused_connections() {
        let connector = RecordingConnector::refusing_every(3);
        let pool = TransportPool::connect(&connector, &BrokerAuth::new("u", "p"), 6).await;
        assert_eq!(pool.len(), 4);
        assert!(connector.transports().iter().all(|t| t.username() == "u"));

        pool.close_all().await;
        assert!(connector.transports().iter().all(|t| t.is_closed()));
    }
}
