//! Device provisioning against the registration API.
//!
//! Each ordinal goes through [`RegistrationPipeline::register`]: a signed
//! request under the rate limiter, one disambiguated retry when the API
//! reports a duplicate identifier, and a bounded number of attempts with a
//! jittered pause in between. [`RegistrationPipeline::spawn`] runs the whole
//! fleet through a small worker pool in delayed batches.

use chrono::Utc;
use dashmap::DashSet;
use para_core::{registration_token, Credentials, Device, SigningSecret};
use para_sdk::{DeviceInfo, RegisterRequest, RegistrationClient, RegistrationError, RetryPolicy};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::rate_limit::RateLimiter;

const DEVICE_TYPE: &str = "PARAGLIDER_TRACKER";
const FIRMWARE_VERSION: &str = "2.1.0";
const BATTERY_CAPACITY_MAH: u32 = 5000;
const DEVICE_SECRET_BYTES: usize = 16;
/// Offset added to an ordinal whose identifier collided.
const DISAMBIGUATION_OFFSET: usize = 1000;
const GLIDER_MODELS: [&str; 4] = ["Advance Omega", "Ozone Enzo", "Gin Boomerang", "Nova Mentor"];
const HARNESSES: [&str; 4] = ["Woody Valley", "Advance", "Supair", "Kortel"];

/// Result of provisioning one ordinal.
#[derive(Debug)]
pub struct RegistrationOutcome {
    pub ordinal: usize,
    pub result: Result<Device, RegistrationError>,
}

/// How the fleet is fed to the API.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub workers: usize,
    pub batch_size: usize,
    pub batch_delay: Duration,
}

pub struct RegistrationPipeline {
    client: RegistrationClient,
    limiter: RateLimiter,
    manufacturer: String,
    manufacturer_secret: String,
    retry: RetryPolicy,
    issued: DashSet<String>,
}

impl fmt::Debug for RegistrationPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationPipeline")
            .field("api", &self.client.base_url())
            .field("manufacturer", &self.manufacturer)
            .field("issued", &self.issued.len())
            .finish_non_exhaustive()
    }
}

impl RegistrationPipeline {
    pub fn new(
        client: RegistrationClient,
        limiter: RateLimiter,
        manufacturer: impl Into<String>,
        manufacturer_secret: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            limiter,
            manufacturer: manufacturer.into(),
            manufacturer_secret: manufacturer_secret.into(),
            retry,
            issued: DashSet::new(),
        }
    }

    /// Number of identifiers handed out so far.
    pub fn issued_count(&self) -> usize {
        self.issued.len()
    }

    /// A fresh identifier for `ordinal`, never one issued before in this run.
    fn next_device_id(&self, ordinal: usize) -> String {
        let now = Utc::now();
        let date = now.format("%Y%m%d").to_string();
        let mut stamp = now.timestamp_millis().rem_euclid(100_000);
        loop {
            let device_id = format!("EMU-PARA-{}-{}-{:04}", date, stamp, ordinal);
            if self.issued.insert(device_id.clone()) {
                return device_id;
            }
            stamp = (stamp + 1) % 100_000;
        }
    }

    fn build_request<R: Rng + ?Sized>(&self, ordinal: usize, device_id: String, rng: &mut R) -> RegisterRequest {
        let mut secret = [0u8; DEVICE_SECRET_BYTES];
        rng.fill(&mut secret[..]);
        let device_secret = hex::encode(secret);
        let registration_token = registration_token(
            &self.manufacturer,
            &self.manufacturer_secret,
            &device_id,
            &device_secret,
        );

        RegisterRequest {
            device_id,
            manufacturer: self.manufacturer.clone(),
            registration_token,
            device_secret,
            name: format!("Paraglider Tracker #{}", ordinal),
            device_type: DEVICE_TYPE.to_string(),
            firmware_version: FIRMWARE_VERSION.to_string(),
            device_info: DeviceInfo {
                pilot: pilot_name(ordinal),
                glider_model: GLIDER_MODELS.choose(rng).copied().unwrap_or_default().to_string(),
                harness: HARNESSES.choose(rng).copied().unwrap_or_default().to_string(),
                reserve: "Yes".to_string(),
                battery_capacity: BATTERY_CAPACITY_MAH,
            },
        }
    }

    /// One registration attempt. A duplicate identifier is retried once
    /// under a perturbed ordinal; any other failure is returned.
    pub async fn register_once<R: Rng + Send + ?Sized>(
        &self,
        ordinal: usize,
        rng: &mut R,
    ) -> Result<Device, RegistrationError> {
        let mut current = ordinal;
        let mut disambiguated = false;
        loop {
            self.limiter.acquire().await;

            let device_id = self.next_device_id(current);
            let request = self.build_request(current, device_id, rng);

            match self.client.register(&request).await {
                Ok(response) => {
                    return Ok(Device {
                        device_id: request.device_id,
                        pilot: request.device_info.pilot,
                        signing_secret: SigningSecret::new(request.device_secret),
                        credentials: Credentials {
                            api_key: response.api_key,
                            mqtt_username: response.mqtt_username,
                            mqtt_password: response.mqtt_password,
                        },
                    });
                }
                Err(RegistrationError::Collision) if !disambiguated => {
                    let next = ordinal + DISAMBIGUATION_OFFSET + rng.random_range(0..1000);
                    tracing::debug!(
                        "Device {} may already exist, retrying as ordinal {}",
                        request.device_id,
                        next
                    );
                    current = next;
                    disambiguated = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Register `ordinal`, retrying soft failures within the retry budget.
    pub async fn register<R: Rng + Send + ?Sized>(
        &self,
        ordinal: usize,
        rng: &mut R,
    ) -> Result<Device, RegistrationError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.register_once(ordinal, rng).await {
                Ok(device) => return Ok(device),
                Err(e) => e,
            };
            if !error.is_connect() {
                tracing::debug!("Registration attempt {} for device {} failed: {}", attempt, ordinal, error);
            }
            match self.retry.pause_after(attempt, rng) {
                Some(pause) => tokio::time::sleep(pause).await,
                None => return Err(error),
            }
        }
    }

    /// Register every ordinal in `ordinals` with at most `plan.workers`
    /// requests in flight, submitting `plan.batch_size` at a time with
    /// `plan.batch_delay` between batches. Outcomes arrive on the returned
    /// channel as they complete; the channel closes once all are done or
    /// `shutdown` fires.
    pub fn spawn(
        self: &Arc<Self>,
        ordinals: Range<usize>,
        plan: BatchPlan,
        shutdown: CancellationToken,
    ) -> (mpsc::Receiver<RegistrationOutcome>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(plan.batch_size.max(1) * 4);
        let pipeline = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(plan.workers.max(1)));
            let mut tasks = JoinSet::new();
            let batch_size = plan.batch_size.max(1);
            let end = ordinals.end;

            for batch_start in ordinals.step_by(batch_size) {
                let batch_end = (batch_start + batch_size).min(end);
                for ordinal in batch_start..batch_end {
                    let pipeline = Arc::clone(&pipeline);
                    let permits = Arc::clone(&permits);
                    let tx = tx.clone();
                    let shutdown = shutdown.clone();
                    tasks.spawn(async move {
                        let mut rng = StdRng::from_os_rng();
                        let work = async {
                            match permits.acquire_owned().await {
                                Ok(_permit) => Some(pipeline.register(ordinal, &mut rng).await),
                                Err(_) => None,
                            }
                        };
                        let result = tokio::select! {
                            _ = shutdown.cancelled() => None,
                            result = work => result,
                        };
                        if let Some(result) = result {
                            let _ = tx.send(RegistrationOutcome { ordinal, result }).await;
                        }
                    });
                }

                if batch_end < end {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(plan.batch_delay) => {}
                    }
                }
            }

            while tasks.join_next().await.is_some() {}
        });

        (rx, handle)
    }
}

/// Pilot name for a device ordinal.
pub fn pilot_name(ordinal: usize) -> String {
    format!("Pilot_{}", ordinal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> RegistrationPipeline {
        RegistrationPipeline::new(
            RegistrationClient::new("http://127.0.0.1:1/api/v1", false).unwrap(),
            RateLimiter::unlimited(),
            "DIGIFLY",
            "manufacturer-secret",
            RetryPolicy::default(),
        )
    }

    #[test]
    fn identifiers_follow_the_emulator_format_and_never_repeat() {
        let pipeline = pipeline();
        let ids: Vec<String> = (0..50).map(|_| pipeline.next_device_id(7)).collect();

        for id in &ids {
            let parts: Vec<&str> = id.split('-').collect();
            assert_eq!(parts[0], "EMU");
            assert_eq!(parts[1], "PARA");
            assert_eq!(parts[2].len(), 8);
            assert!(parts[3].parse::<u32>().unwrap() < 100_000);
            assert_eq!(parts[4], "0007");
        }
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
        assert_eq!(pipeline.issued_count(), 50);
    }

    #[test]
    fn request_carries_a_verifiable_token() {
        let pipeline = pipeline();
        let mut rng = StdRng::seed_from_u64(3);
        let request = pipeline.build_request(12, "EMU-X".to_string(), &mut rng);

        assert_eq!(request.device_secret.len(), DEVICE_SECRET_BYTES * 2);
        assert_eq!(
            request.registration_token,
            registration_token("DIGIFLY", "manufacturer-secret", "EMU-X", &request.device_secret)
        );
        assert_eq!(request.name, "Paraglider Tracker #12");
        assert_eq!(request.device_info.pilot, "Pilot_12");
        assert!(GLIDER_MODELS.contains(&request.device_info.glider_model.as_str()));
    }

    #[tokio::test]
    async fn unreachable_api_gives_up_after_the_retry_budget() {
        let mut pipeline = pipeline();
        pipeline.retry = RetryPolicy {
            max_attempts: 2,
            pause: Duration::from_millis(1)..Duration::from_millis(2),
        };
        let mut rng = StdRng::seed_from_u64(1);
        let err = pipeline.register(0, &mut rng).await.unwrap_err();
        assert!(err.is_connect(), "{:?}", err);
        assert_eq!(pipeline.issued_count(), 2);
    }
}
