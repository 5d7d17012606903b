pub mod flight;
pub mod models;
pub mod signing;
pub mod spatial;
pub mod thermals;

pub use flight::{advance, BATTERY_FLOOR_PCT};
pub use models::{
    default_sites, Credentials, Device, FlightState, GeoPoint, Phase, PhaseKind, SigningSecret,
    Site, TelemetryEnvelope, TelemetryMetadata, TelemetryRecord, Thermal, ThermalId,
};
pub use signing::{registration_token, seal, verify_envelope, SignatureError};
pub use spatial::{haversine_distance, initial_bearing, limit_turn};
pub use thermals::ThermalField;
