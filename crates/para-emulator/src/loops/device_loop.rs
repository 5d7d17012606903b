//! Per-device simulation loop.
//!
//! One task per flying device: advance the flight, publish, sleep. The
//! shutdown token is raced against both the publish and the sleep, so
//! cancellation is observed within one update interval even when the broker
//! stops accepting messages.

use std::sync::Arc;
use std::time::Duration;

use para_core::{advance, ThermalField, BATTERY_FLOOR_PCT};
use para_sdk::Publish;
use rand::rngs::StdRng;
use tokio_util::sync::CancellationToken;

use crate::publisher::TelemetryPublisher;
use crate::session::DeviceSession;
use crate::stats::Statistics;

/// Shared, read-only inputs for every device loop.
pub struct LoopContext {
    pub thermals: Arc<ThermalField>,
    pub publisher: TelemetryPublisher,
    pub stats: Arc<Statistics>,
    pub interval: Duration,
    pub shutdown: CancellationToken,
}

/// Why a device loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceExit {
    Shutdown,
    BatteryDepleted,
    /// The dedicated broker connection could not be opened.
    ConnectFailed,
}

/// Run one device until shutdown or battery depletion, then release its
/// transport.
pub async fn run_device_loop<T: Publish>(
    mut session: DeviceSession<T>,
    ctx: Arc<LoopContext>,
    mut rng: StdRng,
) -> DeviceExit {
    let dt = ctx.interval.as_secs_f64();
    ctx.stats.set_phase(session.device_id(), session.state.phase.kind());

    let exit = loop {
        if ctx.shutdown.is_cancelled() {
            break DeviceExit::Shutdown;
        }

        let previous = session.state.phase.kind();
        session.state = advance(&session.state, dt, &ctx.thermals, &session.site, &mut rng);
        let phase = session.state.phase.kind();
        if phase != previous {
            tracing::debug!("{} {} -> {}", session.device_id(), previous, phase);
            ctx.stats.set_phase(session.device_id(), phase);
        }

        tokio::select! {
            _ = ctx.shutdown.cancelled() => break DeviceExit::Shutdown,
            _ = ctx.publisher.publish(&session, &mut rng) => {}
        }

        if session.state.battery_pct < BATTERY_FLOOR_PCT {
            tracing::info!("{} battery depleted", session.device_id());
            break DeviceExit::BatteryDepleted;
        }

        tokio::select! {
            _ = ctx.shutdown.cancelled() => break DeviceExit::Shutdown,
            _ = tokio::time::sleep(ctx.interval) => {}
        }
    };

    session.active = false;
    ctx.stats.deactivate(session.device_id());
    session.transport.release().await;
    exit
}
