//! Core data models for the paraglider fleet emulator.

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A named launch location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    /// Launch altitude in meters
    pub launch_alt_m: f64,
    /// Landing field altitude in meters
    pub landing_alt_m: f64,
}

impl Site {
    pub fn new(name: &str, lat: f64, lon: f64, launch_alt_m: f64, landing_alt_m: f64) -> Self {
        Self {
            name: name.to_string(),
            lat,
            lon,
            launch_alt_m,
            landing_alt_m,
        }
    }
}

/// Built-in flying sites. Device ordinal `i` flies from `sites[i % len]`.
pub fn default_sites() -> Vec<Site> {
    vec![
        Site::new("Chamonix", 45.9237, 6.8694, 2400.0, 1050.0),
        Site::new("Interlaken", 46.6863, 7.8632, 1800.0, 570.0),
        Site::new("Annecy", 45.8992, 6.1294, 1450.0, 450.0),
        Site::new("Zermatt", 46.0207, 7.7491, 2800.0, 1620.0),
        Site::new("Dolomites", 46.4102, 11.8440, 2200.0, 1000.0),
    ]
}

/// A column of rising air.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thermal {
    pub lat: f64,
    pub lon: f64,
    pub radius_m: f64,
    /// Lift in m/s
    pub strength_mps: f64,
    pub ceiling_m: f64,
}

/// Lookup key into the thermal field. Devices never own thermals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThermalId(pub usize);

/// A point on the ground.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Flight phase, carrying only the data each phase needs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "lowercase")]
pub enum Phase {
    Ground,
    Takeoff,
    Climbing,
    Gliding,
    Thermaling { thermal: ThermalId },
    Landing { target: GeoPoint },
    Landed,
}

impl Phase {
    pub fn kind(&self) -> PhaseKind {
        match self {
            Phase::Ground => PhaseKind::Ground,
            Phase::Takeoff => PhaseKind::Takeoff,
            Phase::Climbing => PhaseKind::Climbing,
            Phase::Gliding => PhaseKind::Gliding,
            Phase::Thermaling { .. } => PhaseKind::Thermaling,
            Phase::Landing { .. } => PhaseKind::Landing,
            Phase::Landed => PhaseKind::Landed,
        }
    }
}

/// Data-less phase tag used for statistics and telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseKind {
    Ground,
    Takeoff,
    Climbing,
    Gliding,
    Thermaling,
    Landing,
    Landed,
}

impl PhaseKind {
    pub const ALL: [PhaseKind; 7] = [
        PhaseKind::Ground,
        PhaseKind::Takeoff,
        PhaseKind::Climbing,
        PhaseKind::Gliding,
        PhaseKind::Thermaling,
        PhaseKind::Landing,
        PhaseKind::Landed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::Ground => "ground",
            PhaseKind::Takeoff => "takeoff",
            PhaseKind::Climbing => "climbing",
            PhaseKind::Gliding => "gliding",
            PhaseKind::Thermaling => "thermaling",
            PhaseKind::Landing => "landing",
            PhaseKind::Landed => "landed",
        }
    }

    /// Whether a single tick may move a device from `self` to `next`.
    ///
    /// LANDED -> GROUND is the only edge that closes the cycle.
    pub fn can_transition_to(&self, next: PhaseKind) -> bool {
        use PhaseKind::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Ground, Takeoff)
                | (Takeoff, Climbing)
                | (Climbing, Thermaling)
                | (Climbing, Gliding)
                | (Thermaling, Gliding)
                | (Gliding, Landing)
                | (Landing, Landed)
                | (Landed, Ground)
        )
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable kinematic record owned by one device worker.
#[derive(Debug, Clone, PartialEq)]
pub struct FlightState {
    pub phase: Phase,
    pub lat: f64,
    pub lon: f64,
    pub altitude_m: f64,
    /// Ground speed in km/h
    pub speed_kmh: f64,
    /// Degrees, 0 = North
    pub heading_deg: f64,
    /// Vertical speed in m/s, positive = climbing
    pub vario_mps: f64,
    pub battery_pct: f64,
    pub elapsed_s: f64,
    /// Set at takeoff, cleared when the pilot packs up for another flight
    pub flight_id: Option<String>,
}

impl FlightState {
    /// A fresh device sitting at launch.
    pub fn on_ground<R: Rng + ?Sized>(site: &Site, rng: &mut R) -> Self {
        Self {
            phase: Phase::Ground,
            lat: site.lat + rng.random_range(-0.001..0.001),
            lon: site.lon + rng.random_range(-0.001..0.001),
            altitude_m: site.launch_alt_m + rng.random_range(-20.0..20.0),
            speed_kmh: 0.0,
            heading_deg: rng.random_range(0.0..360.0),
            vario_mps: 0.0,
            battery_pct: rng.random_range(85.0..100.0),
            elapsed_s: 0.0,
            flight_id: None,
        }
    }

    pub fn position(&self) -> GeoPoint {
        GeoPoint {
            lat: self.lat,
            lon: self.lon,
        }
    }

    /// Whole minutes since the device started.
    pub fn flight_time_min(&self) -> u64 {
        (self.elapsed_s / 60.0).max(0.0) as u64
    }
}

/// Opaque per-device signing secret. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningSecret(Vec<u8>);

impl SigningSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningSecret(<redacted>)")
    }
}

/// Credentials issued by the registration API.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("mqtt_username", &self.mqtt_username)
            .field("mqtt_password", &self.mqtt_password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A provisioned device. Immutable after registration.
#[derive(Debug, Clone)]
pub struct Device {
    pub device_id: String,
    pub pilot: String,
    pub signing_secret: SigningSecret,
    pub credentials: Credentials,
}

/// Extra fields published under `device_metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMetadata {
    pub vario: f64,
    pub phase: PhaseKind,
    pub flight_time: u64,
    pub pilot: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flight_id: Option<String>,
}

/// One GPS fix as published to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub speed: f64,
    pub heading: f64,
    pub accuracy: f64,
    pub satellites: u8,
    pub battery_level: f64,
    pub timestamp: String,
    pub device_metadata: TelemetryMetadata,
}

impl TelemetryRecord {
    /// Snapshot a device's state with simulated GPS quality jitter.
    pub fn from_state<R: Rng + ?Sized>(
        device: &Device,
        state: &FlightState,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Self {
        Self {
            device_id: device.device_id.clone(),
            latitude: round_to(state.lat, 6),
            longitude: round_to(state.lon, 6),
            altitude: round_to(state.altitude_m, 1),
            speed: round_to(state.speed_kmh, 1),
            heading: round_to(state.heading_deg, 1),
            accuracy: round_to(rng.random_range(3.0..8.0), 1),
            satellites: rng.random_range(8..=15),
            battery_level: round_to(state.battery_pct, 1),
            timestamp: now.to_rfc3339_opts(SecondsFormat::Micros, false),
            device_metadata: TelemetryMetadata {
                vario: round_to(state.vario_mps, 1),
                phase: state.phase.kind(),
                flight_time: state.flight_time_min(),
                pilot: device.pilot.clone(),
                flight_id: state.flight_id.clone(),
            },
        }
    }
}

/// Signed message published on `gps/{device_id}/data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEnvelope {
    pub data: TelemetryRecord,
    pub signature: String,
    pub api_key: String,
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
