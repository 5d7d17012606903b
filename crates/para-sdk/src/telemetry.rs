//! Signed telemetry messages.

use chrono::{DateTime, Utc};
use para_core::models::{Device, FlightState, TelemetryRecord};
use para_core::signing::{seal, SignatureError};
use rand::Rng;
use thiserror::Error;

use crate::transport::{Publish, TransportError};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to sign telemetry: {0}")]
    Sign(#[from] SignatureError),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Topic a device publishes its fixes on.
pub fn topic_for(device_id: &str) -> String {
    format!("gps/{}/data", device_id)
}

/// A ready-to-send message.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Snapshot, sign and encode a device's current state.
pub fn prepare<R: Rng + ?Sized>(
    device: &Device,
    state: &FlightState,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Result<Outbound, TelemetryError> {
    let record = TelemetryRecord::from_state(device, state, now, rng);
    let envelope = seal(record, &device.signing_secret, &device.credentials.api_key)?;
    Ok(Outbound {
        topic: topic_for(&device.device_id),
        payload: serde_json::to_vec(&envelope)?,
    })
}

/// Push a prepared message through `transport`.
pub async fn send<T: Publish>(transport: &T, message: Outbound) -> Result<(), TelemetryError> {
    transport.publish(&message.topic, message.payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use para_core::models::{default_sites, Credentials, SigningSecret, TelemetryEnvelope};
    use para_core::signing::verify_envelope;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn prepared_payload_is_a_verifiable_envelope() {
        let mut rng = StdRng::seed_from_u64(42);
        let device = Device {
            device_id: "EMU-PARA-20240101-00001-0001".to_string(),
            pilot: "Pilot_0001".to_string(),
            signing_secret: SigningSecret::new("secret"),
            credentials: Credentials {
                api_key: "api-key".to_string(),
                mqtt_username: None,
                mqtt_password: None,
            },
        };
        let state = FlightState::on_ground(&default_sites()[1], &mut rng);

        let message = prepare(&device, &state, Utc::now(), &mut rng).unwrap();
        assert_eq!(message.topic, "gps/EMU-PARA-20240101-00001-0001/data");

        let envelope: TelemetryEnvelope = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(envelope.api_key, "api-key");
        assert_eq!(envelope.data.device_id, device.device_id);
        assert!(verify_envelope(&envelope, &device.signing_secret).is_ok());
    }
}
