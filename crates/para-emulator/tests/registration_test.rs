//! Registration pipeline tests against an in-process registration API.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{Behavior, MockApi};
use para_core::registration_token;
use para_emulator::rate_limit::RateLimiter;
use para_emulator::registration::{BatchPlan, RegistrationPipeline};
use para_sdk::{RegistrationClient, RegistrationError, RetryPolicy};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;

const MANUFACTURER: &str = "DIGIFLY";
const MANUFACTURER_SECRET: &str = "mfg-secret";

fn quick_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        pause: Duration::from_millis(10)..Duration::from_millis(20),
    }
}

fn pipeline(api: &MockApi, limiter: RateLimiter, retry: RetryPolicy) -> RegistrationPipeline {
    let client = RegistrationClient::new(api.base_url.clone(), false).unwrap();
    RegistrationPipeline::new(client, limiter, MANUFACTURER, MANUFACTURER_SECRET, retry)
}

fn ordinal_of(device_id: &str) -> usize {
    device_id.rsplit('-').next().unwrap().parse().unwrap()
}

#[tokio::test]
async fn test_collision_is_retried_under_a_disambiguated_ordinal() {
    let api = MockApi::start(Behavior::CollideFirst(1)).await;
    let pipeline = pipeline(&api, RateLimiter::unlimited(), quick_retry(3));

    let device = pipeline
        .register(7, &mut StdRng::seed_from_u64(1))
        .await
        .unwrap();

    let requests = api.requests();
    assert_eq!(requests.len(), 2);
    let first = requests[0]["device_id"].as_str().unwrap();
    let second = requests[1]["device_id"].as_str().unwrap();
    assert_eq!(ordinal_of(first), 7);
    assert!((1007..2007).contains(&ordinal_of(second)));
    assert_eq!(device.device_id, second);
    assert_eq!(device.credentials.api_key, format!("key-{}", second));
    assert!(device.credentials.mqtt_username.is_none());
}

#[tokio::test]
async fn test_registration_token_proves_the_manufacturer_secret() {
    let api = MockApi::start(Behavior::Accept).await;
    let pipeline = pipeline(&api, RateLimiter::unlimited(), quick_retry(1));

    let device = pipeline
        .register(3, &mut StdRng::seed_from_u64(2))
        .await
        .unwrap();

    let requests = api.requests();
    let request = &requests[0];
    let device_secret = request["device_secret"].as_str().unwrap();
    assert_eq!(device_secret.len(), 32);
    assert_eq!(
        request["registration_token"].as_str().unwrap(),
        registration_token(MANUFACTURER, MANUFACTURER_SECRET, &device.device_id, device_secret)
    );
    assert_eq!(request["manufacturer"], MANUFACTURER);
    assert_eq!(request["device_type"], "PARAGLIDER_TRACKER");
    assert_eq!(request["device_info"]["pilot"], "Pilot_3");
    assert_eq!(device.signing_secret.as_bytes(), device_secret.as_bytes());
}

#[tokio::test]
async fn test_persistent_collision_exhausts_the_retry_budget() {
    let api = MockApi::start(Behavior::CollideFirst(usize::MAX)).await;
    let pipeline = pipeline(&api, RateLimiter::unlimited(), quick_retry(2));

    let result = pipeline.register(5, &mut StdRng::seed_from_u64(3)).await;

    assert!(matches!(result, Err(RegistrationError::Collision)));
    let ids: HashSet<String> = api
        .requests()
        .iter()
        .map(|r| r["device_id"].as_str().unwrap().to_string())
        .collect();
    // Two attempts, each with one disambiguated retry
    assert_eq!(ids.len(), 4);
}

#[tokio::test]
async fn test_server_errors_are_retried_then_reported() {
    let api = MockApi::start(Behavior::Fail(503)).await;
    let pipeline = pipeline(&api, RateLimiter::unlimited(), quick_retry(3));

    let result = pipeline.register(1, &mut StdRng::seed_from_u64(4)).await;

    match result {
        Err(RegistrationError::Rejected(status)) => assert_eq!(status.as_u16(), 503),
        other => panic!("expected rejection, got {:?}", other.map(|d| d.device_id)),
    }
    assert_eq!(api.requests().len(), 3);
}

#[tokio::test]
async fn test_batched_registration_reports_every_ordinal() {
    let api = MockApi::start(Behavior::Accept).await;
    let pipeline = Arc::new(pipeline(&api, RateLimiter::new(1000), quick_retry(3)));
    let plan = BatchPlan {
        workers: 3,
        batch_size: 10,
        batch_delay: Duration::from_millis(20),
    };

    let (mut outcomes, handle) = pipeline.spawn(0..25, plan, CancellationToken::new());
    let mut ordinals = HashSet::new();
    let mut ids = HashSet::new();
    while let Some(outcome) = outcomes.recv().await {
        let device = outcome.result.unwrap();
        assert!(ordinals.insert(outcome.ordinal));
        assert!(ids.insert(device.device_id));
    }
    handle.await.unwrap();

    assert_eq!(ordinals, (0..25).collect());
    assert_eq!(ids.len(), 25);
    assert_eq!(api.requests().len(), 25);
}

#[tokio::test]
async fn test_rate_limit_spreads_registrations_over_time() {
    let api = MockApi::start(Behavior::Accept).await;
    let pipeline = Arc::new(pipeline(&api, RateLimiter::new(5), quick_retry(1)));
    let plan = BatchPlan {
        workers: 10,
        batch_size: 10,
        batch_delay: Duration::ZERO,
    };

    let started = Instant::now();
    let (mut outcomes, handle) = pipeline.spawn(0..10, plan, CancellationToken::new());
    let mut completed = 0;
    while let Some(outcome) = outcomes.recv().await {
        assert!(outcome.result.is_ok());
        completed += 1;
    }
    handle.await.unwrap();

    assert_eq!(completed, 10);
    assert!(started.elapsed() >= Duration::from_millis(950));
}

#[tokio::test]
async fn test_cancelled_registration_closes_the_channel() {
    let api = MockApi::start(Behavior::Accept).await;
    let pipeline = Arc::new(pipeline(&api, RateLimiter::new(2), quick_retry(1)));
    let plan = BatchPlan {
        workers: 1,
        batch_size: 5,
        batch_delay: Duration::from_secs(30),
    };
    let shutdown = CancellationToken::new();

    let (mut outcomes, handle) = pipeline.spawn(0..50, plan, shutdown.clone());
    let first = outcomes.recv().await.unwrap();
    assert!(first.result.is_ok());
    shutdown.cancel();

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        let mut received = 1;
        while outcomes.recv().await.is_some() {
            received += 1;
        }
        received
    })
    .await
    .unwrap();
    handle.await.unwrap();

    assert!(drained < 50);
}
