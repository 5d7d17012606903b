//! Signs and sends one telemetry point per tick.

use chrono::Utc;
use para_sdk::{telemetry, Publish};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use crate::session::DeviceSession;
use crate::stats::Statistics;

pub struct TelemetryPublisher {
    stats: Arc<Statistics>,
    send_timeout: Duration,
}

impl TelemetryPublisher {
    /// A send that takes longer than `send_timeout` counts as failed.
    pub fn new(stats: Arc<Statistics>, send_timeout: Duration) -> Self {
        Self { stats, send_timeout }
    }

    /// Publish the session's current state. Failures, including sends that
    /// outlive the timeout, are logged and counted, never propagated;
    /// returns whether the point went out.
    pub async fn publish<T, R>(&self, session: &DeviceSession<T>, rng: &mut R) -> bool
    where
        T: Publish,
        R: Rng + Send + ?Sized,
    {
        let message = match telemetry::prepare(&session.device, &session.state, Utc::now(), rng) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Failed to build telemetry for {}: {}", session.device_id(), e);
                self.stats.record_publish_failure();
                return false;
            }
        };

        let sent = tokio::time::timeout(self.send_timeout, telemetry::send(session.transport.get(), message)).await;
        match sent {
            Ok(Ok(())) => {
                self.stats.record_point();
                true
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed to send GPS for {}: {}", session.device_id(), e);
                self.stats.record_publish_failure();
                false
            }
            Err(_) => {
                tracing::warn!(
                    "Sending GPS for {} timed out after {:?}",
                    session.device_id(),
                    self.send_timeout
                );
                self.stats.record_publish_failure();
                false
            }
        }
    }
}
