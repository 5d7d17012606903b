//! Para SDK - device-side integration
//!
//! Registration against the platform API and signed telemetry publishing
//! over MQTT.

pub mod backoff;
pub mod client;
pub mod telemetry;
pub mod transport;

pub use backoff::{Backoff, RetryPolicy};
pub use client::{DeviceInfo, RegisterRequest, RegisterResponse, RegistrationClient, RegistrationError};
pub use telemetry::{prepare, send, topic_for, Outbound, TelemetryError};
pub use transport::{
    BrokerAuth, Connector, MqttConnector, MqttSettings, MqttTransport, Publish, TlsSettings,
    TransportError,
};
