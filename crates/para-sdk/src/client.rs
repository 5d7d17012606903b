//! HTTP client for the device registration API.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Body of `POST /devices/register`.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub device_id: String,
    pub manufacturer: String,
    pub registration_token: String,
    pub device_secret: String,
    pub name: String,
    pub device_type: String,
    pub firmware_version: String,
    pub device_info: DeviceInfo,
}

/// Free-form hardware description sent at registration.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub pilot: String,
    pub glider_model: String,
    pub harness: String,
    pub reserve: String,
    pub battery_capacity: u32,
}

/// Credentials issued on successful registration.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    pub api_key: String,
    #[serde(default)]
    pub mqtt_username: Option<String>,
    #[serde(default)]
    pub mqtt_password: Option<String>,
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    /// The API answered 400, which it uses for identifiers that already exist.
    #[error("device identifier rejected as duplicate")]
    Collision,
    #[error("registration rejected with HTTP {0}")]
    Rejected(StatusCode),
    #[error("registration request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl RegistrationError {
    /// Connection-level failure, as opposed to an answer from the API.
    pub fn is_connect(&self) -> bool {
        matches!(self, RegistrationError::Http(err) if err.is_connect() || err.is_timeout())
    }
}

/// Client for the registration API. Cheap to clone; clones share a pool.
#[derive(Debug, Clone)]
pub struct RegistrationClient {
    client: reqwest::Client,
    base_url: String,
}

impl RegistrationClient {
    /// Create a client for `base_url` (e.g. "http://localhost/api/v1").
    ///
    /// `accept_invalid_certs` disables TLS verification and must only be set
    /// on explicit operator request.
    pub fn new(base_url: impl Into<String>, accept_invalid_certs: bool) -> Result<Self, RegistrationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Submit one registration.
    pub async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, RegistrationError> {
        let url = format!("{}/devices/register", self.base_url);

        let response = self.client.post(&url).json(request).send().await?;

        match response.status() {
            status if status.is_success() => Ok(response.json().await?),
            StatusCode::BAD_REQUEST => Err(RegistrationError::Collision),
            status => Err(RegistrationError::Rejected(status)),
        }
    }
}
