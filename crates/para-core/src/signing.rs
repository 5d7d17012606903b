//! Canonical serialization and HMAC-SHA256 signing.
//!
//! The canonical form of a record is compact JSON with object keys sorted at
//! every level. `serde_json::Value` keeps keys in a `BTreeMap` unless the
//! `preserve_order` feature is enabled, which this workspace must not do.

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use thiserror::Error;

use crate::models::{SigningSecret, TelemetryEnvelope, TelemetryRecord};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("canonical serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("signature is not valid hex")]
    Malformed,
    #[error("signature does not match payload")]
    Mismatch,
}

/// Compact, key-sorted JSON bytes for `value`.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    serde_json::to_vec(&value)
}

fn keyed(key: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length")
}

/// Hex-encoded HMAC-SHA256 of `message` under `key`.
pub fn hmac_hex(key: &[u8], message: &[u8]) -> String {
    let mut mac = keyed(key);
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a hex signature.
pub fn verify_hex(key: &[u8], message: &[u8], signature: &str) -> Result<(), SignatureError> {
    let expected = hex::decode(signature).map_err(|_| SignatureError::Malformed)?;
    let mut mac = keyed(key);
    mac.update(message);
    mac.verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}

/// Token proving knowledge of the manufacturer secret:
/// HMAC over `manufacturer:device_id:device_secret`.
pub fn registration_token(
    manufacturer: &str,
    manufacturer_secret: &str,
    device_id: &str,
    device_secret: &str,
) -> String {
    let message = format!("{}:{}:{}", manufacturer, device_id, device_secret);
    hmac_hex(manufacturer_secret.as_bytes(), message.as_bytes())
}

/// Sign a record and wrap it for publishing.
pub fn seal(
    record: TelemetryRecord,
    secret: &SigningSecret,
    api_key: &str,
) -> Result<TelemetryEnvelope, SignatureError> {
    let canonical = canonical_bytes(&record)?;
    let signature = hmac_hex(secret.as_bytes(), &canonical);
    Ok(TelemetryEnvelope {
        data: record,
        signature,
        api_key: api_key.to_string(),
    })
}

/// Recompute the canonical bytes of `envelope.data` and check its signature.
pub fn verify_envelope(
    envelope: &TelemetryEnvelope,
    secret: &SigningSecret,
) -> Result<(), SignatureError> {
    let canonical = canonical_bytes(&envelope.data)?;
    verify_hex(secret.as_bytes(), &canonical, &envelope.signature)
}
