//! Top-level run coordinator.
//!
//! A run moves through INIT -> REGISTERING -> RUNNING -> DRAINING ->
//! TERMINATED. Registration and flying overlap: each device starts its loop
//! as soon as it is provisioned. The run clock starts once registration is
//! over, and a shutdown signal at any point skips straight to draining.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use para_core::thermals::THERMALS_PER_SITE;
use para_core::{default_sites, Device, FlightState, Site, ThermalField};
use para_sdk::{BrokerAuth, Connector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::guard::InstanceGuard;
use crate::loops::device_loop::{run_device_loop, DeviceExit, LoopContext};
use crate::pool::TransportPool;
use crate::publisher::TelemetryPublisher;
use crate::registration::{BatchPlan, RegistrationOutcome, RegistrationPipeline};
use crate::session::{DeviceSession, TransportHandle};
use crate::stats::Statistics;
use crate::summary::{RunSummary, SimulationTotals};

/// How often aggregate statistics are logged.
pub const STATS_INTERVAL: Duration = Duration::from_secs(10);
/// How long workers get to exit on their own before being aborted.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    Registering,
    Running,
    Draining,
    Terminated,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunPhase::Init => "INIT",
            RunPhase::Registering => "REGISTERING",
            RunPhase::Running => "RUNNING",
            RunPhase::Draining => "DRAINING",
            RunPhase::Terminated => "TERMINATED",
        })
    }
}

/// Everything a device launch needs, built once during INIT.
struct Fleet<T> {
    sites: Vec<Site>,
    pool: Option<TransportPool<T>>,
    shared_auth: BrokerAuth,
    ctx: Arc<LoopContext>,
}

pub struct Simulation<C: Connector> {
    config: Config,
    pipeline: Arc<RegistrationPipeline>,
    connector: Arc<C>,
    shutdown: CancellationToken,
    stats: Arc<Statistics>,
    stats_interval: Duration,
    phase: RunPhase,
}

impl<C: Connector> Simulation<C> {
    pub fn new(
        config: Config,
        pipeline: RegistrationPipeline,
        connector: C,
        shutdown: CancellationToken,
    ) -> Self {
        let stats = Arc::new(Statistics::new(config.devices));
        Self {
            config,
            pipeline: Arc::new(pipeline),
            connector: Arc::new(connector),
            shutdown,
            stats,
            stats_interval: STATS_INTERVAL,
            phase: RunPhase::Init,
        }
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    pub fn stats(&self) -> Arc<Statistics> {
        Arc::clone(&self.stats)
    }

    fn enter(&mut self, phase: RunPhase) {
        tracing::info!("Simulation {} -> {}", self.phase, phase);
        self.phase = phase;
    }

    /// Run to completion and write the summary. `guard` is released once
    /// the summary is on disk.
    pub async fn run(mut self, guard: InstanceGuard) -> RunSummary {
        let fleet = self.prepare().await;

        let mut ticker = interval_at(Instant::now() + self.stats_interval, self.stats_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut workers: JoinSet<DeviceExit> = JoinSet::new();

        self.enter(RunPhase::Registering);
        let plan = BatchPlan {
            workers: self.config.registration_workers,
            batch_size: self.config.registration_batch_size,
            batch_delay: self.config.registration_batch_delay,
        };
        let (mut outcomes, registration) =
            self.pipeline
                .spawn(0..self.config.devices, plan, self.shutdown.clone());

        loop {
            tokio::select! {
                outcome = outcomes.recv() => match outcome {
                    Some(outcome) => self.launch(outcome, &fleet, &mut workers),
                    None => break,
                },
                _ = ticker.tick() => self.stats.log_report(),
                Some(result) = workers.join_next(), if !workers.is_empty() => log_exit(result),
            }
        }

        let snap = self.stats.snapshot();
        if snap.failed > 0 {
            tracing::warn!("{} devices failed to register", snap.failed);
        }
        tracing::info!("Registered {} devices, all transmitting", snap.registered);

        if !self.shutdown.is_cancelled() {
            self.enter(RunPhase::Running);
            let deadline = tokio::time::sleep(self.config.duration());
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => {
                        tracing::info!("Simulation duration elapsed");
                        break;
                    }
                    _ = self.shutdown.cancelled() => {
                        tracing::info!("Simulation interrupted");
                        break;
                    }
                    _ = ticker.tick() => self.stats.log_report(),
                    Some(result) = workers.join_next(), if !workers.is_empty() => log_exit(result),
                }
            }
        }

        self.enter(RunPhase::Draining);
        self.shutdown.cancel();
        if let Err(e) = registration.await {
            tracing::warn!("Registration task ended abnormally: {}", e);
        }
        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            while let Some(result) = workers.join_next().await {
                log_exit(result);
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                "{} device workers still running after {:?}, aborting",
                workers.len(),
                DRAIN_GRACE
            );
            workers.shutdown().await;
        }
        if let Some(pool) = &fleet.pool {
            tracing::info!("Disconnecting {} pool connections", pool.len());
            pool.close_all().await;
        }

        self.enter(RunPhase::Terminated);
        self.stats.log_report();
        let summary = RunSummary::new(
            SimulationTotals {
                devices: self.config.devices,
                duration_minutes: self.config.duration_minutes,
                total_points: self.stats.total_points(),
                registered_devices: self.stats.registered(),
            },
            Utc::now(),
        );
        match summary.write(&self.config.results_file) {
            Ok(()) => tracing::info!(
                "Simulation complete. Results saved to {}",
                self.config.results_file.display()
            ),
            Err(e) => tracing::error!("{:#}", e),
        }
        guard.release();
        summary
    }

    /// INIT: thermal field, shared loop context and, for large fleets, the
    /// connection pool.
    async fn prepare(&self) -> Fleet<C::Transport> {
        let sites = default_sites();
        tracing::info!(
            "Starting paraglider simulation: {} devices, {:?}, {} flying sites",
            self.config.devices,
            self.config.duration(),
            sites.len()
        );

        let mut rng = StdRng::from_os_rng();
        let thermals = ThermalField::generate(&sites, THERMALS_PER_SITE, &mut rng);
        tracing::debug!("Generated {} thermals", thermals.len());

        let shared_auth = BrokerAuth::new(&self.config.mqtt_user, &self.config.mqtt_password);
        let pool = if self.config.uses_pool() {
            Some(TransportPool::connect(&*self.connector, &shared_auth, self.config.pool_size()).await)
        } else {
            None
        };

        let ctx = Arc::new(LoopContext {
            thermals: Arc::new(thermals),
            publisher: TelemetryPublisher::new(Arc::clone(&self.stats), self.config.update_interval()),
            stats: Arc::clone(&self.stats),
            interval: self.config.update_interval(),
            shutdown: self.shutdown.clone(),
        });

        Fleet {
            sites,
            pool,
            shared_auth,
            ctx,
        }
    }

    /// Turn a registration outcome into a running device loop.
    fn launch(
        &self,
        outcome: RegistrationOutcome,
        fleet: &Fleet<C::Transport>,
        workers: &mut JoinSet<DeviceExit>,
    ) {
        let RegistrationOutcome { ordinal, result } = outcome;
        let device = match result {
            Ok(device) => device,
            Err(e) => {
                self.stats.record_failed();
                tracing::warn!(
                    "Failed to register device {} after {} attempts: {}",
                    ordinal,
                    self.config.retry.max_attempts,
                    e
                );
                return;
            }
        };

        let registered = self.stats.record_registered();
        if registered % 100 == 0 {
            tracing::info!("Registered and started {}/{} devices", registered, self.config.devices);
        }

        let site = fleet.sites[ordinal % fleet.sites.len()].clone();
        let mut rng = StdRng::from_os_rng();
        let state = FlightState::on_ground(&site, &mut rng);
        let ctx = Arc::clone(&fleet.ctx);

        if let Some(pool) = &fleet.pool {
            let Some(handle) = pool.next() else {
                tracing::warn!("No pool connection available for {}", device.device_id);
                return;
            };
            let session = DeviceSession::new(device, site, state, TransportHandle::Pooled(handle));
            workers.spawn(run_device_loop(session, ctx, rng));
            return;
        }

        let connector = Arc::clone(&self.connector);
        let auth = device_auth(&device, &fleet.shared_auth);
        workers.spawn(async move {
            let client_id = format!("{}-{}", device.device_id, Utc::now().timestamp());
            let connected = tokio::select! {
                _ = ctx.shutdown.cancelled() => return DeviceExit::Shutdown,
                connected = connector.connect(&client_id, &auth) => connected,
            };
            match connected {
                Ok(transport) => {
                    let session = DeviceSession::new(device, site, state, TransportHandle::Dedicated(transport));
                    run_device_loop(session, ctx, rng).await
                }
                Err(e) => {
                    tracing::warn!("MQTT connection failed for {}: {}", device.device_id, e);
                    DeviceExit::ConnectFailed
                }
            }
        });
    }
}

/// Per-device broker credentials when registration issued them, the shared
/// account otherwise.
fn device_auth(device: &Device, shared: &BrokerAuth) -> BrokerAuth {
    match (&device.credentials.mqtt_username, &device.credentials.mqtt_password) {
        (Some(username), Some(password)) => BrokerAuth::new(username, password),
        _ => shared.clone(),
    }
}

fn log_exit(result: Result<DeviceExit, JoinError>) {
    match result {
        Ok(exit) => tracing::debug!("Device worker finished: {:?}", exit),
        Err(e) if e.is_cancelled() => {}
        Err(e) => tracing::warn!("Device worker failed: {}", e),
    }
}
