//! Per-device flight state machine.
//!
//! [`advance`] is a pure function of the previous state, the tick length and
//! the random draws it pulls from the supplied generator. Seeding the
//! generator makes a whole flight reproducible.

use crate::models::{FlightState, GeoPoint, Phase, Site, ThermalId};
use crate::spatial::{flat_delta, initial_bearing, limit_turn, normalize_heading, offset_flat};
use crate::thermals::ThermalField;
use rand::Rng;

/// Chance per tick that a pilot on the ground launches.
pub const TAKEOFF_PROBABILITY: f64 = 0.05;
/// Chance per tick of ground handling movement while waiting to launch.
pub const TAXI_PROBABILITY: f64 = 0.3;
pub const TAKEOFF_SPEED_KMH: f64 = 25.0;
pub const TAKEOFF_VARIO_MPS: f64 = 2.0;
/// Below this charge the worker drops the device, whatever its phase.
pub const BATTERY_FLOOR_PCT: f64 = 5.0;

const TAKEOFF_MAX_SPEED_KMH: f64 = 40.0;
const CLIMB_TRANSITION_AGL_M: f64 = 50.0;
const CLIMB_GIVE_UP_PROBABILITY: f64 = 0.1;
const CLIMB_GIVE_UP_SINK_MPS: f64 = -1.0;
const CLIMB_MAX_SINK_MPS: f64 = -2.0;
const THERMAL_EXIT_PROBABILITY: f64 = 0.02;
const GLIDE_FAST_SINK_MPS: f64 = -1.5;
const GLIDE_MAX_SPEED_KMH: f64 = 55.0;
const WEAK_LIFT_PROBABILITY: f64 = 0.05;
const LANDING_PATTERN_AGL_M: f64 = 200.0;
const LANDING_MAX_TURN_DEG: f64 = 15.0;
const LANDING_MIN_SPEED_KMH: f64 = 18.0;
const LANDING_MAX_SINK_MPS: f64 = -4.0;
const GROUND_EFFECT_AGL_M: f64 = 20.0;
const GROUND_EFFECT_SINK_MPS: f64 = -2.0;
const RELAUNCH_PROBABILITY: f64 = 0.03;
const PACKING_JITTER_PROBABILITY: f64 = 0.2;
const MAX_WIND_KMH: f64 = 10.0;

/// Advance one device by one tick of `dt` seconds.
pub fn advance<R: Rng + ?Sized>(
    state: &FlightState,
    dt: f64,
    thermals: &ThermalField,
    site: &Site,
    rng: &mut R,
) -> FlightState {
    let mut next = state.clone();
    next.battery_pct -= rng.random_range(0.01..0.03);
    next.elapsed_s += dt;

    let positioned = match state.phase {
        Phase::Ground => {
            on_ground(&mut next, rng);
            false
        }
        Phase::Takeoff => {
            taking_off(&mut next, dt, site, rng);
            false
        }
        Phase::Climbing => {
            climbing(&mut next, dt, thermals, rng);
            false
        }
        Phase::Thermaling { thermal } => thermaling(&mut next, thermal, dt, thermals, rng),
        Phase::Gliding => {
            gliding(&mut next, dt, site, rng);
            false
        }
        Phase::Landing { target } => {
            landing(&mut next, target, dt, site, rng);
            false
        }
        Phase::Landed => {
            landed(&mut next, site, rng);
            false
        }
    };

    if !positioned && next.speed_kmh > 0.0 {
        integrate_position(&mut next, dt, rng);
    }

    debug_assert!(state.phase.kind().can_transition_to(next.phase.kind()));
    next
}

fn on_ground<R: Rng + ?Sized>(s: &mut FlightState, rng: &mut R) {
    if rng.random::<f64>() < TAKEOFF_PROBABILITY {
        s.phase = Phase::Takeoff;
        s.speed_kmh = TAKEOFF_SPEED_KMH;
        s.vario_mps = TAKEOFF_VARIO_MPS;
        s.heading_deg = rng.random_range(0.0..360.0);
        s.flight_id = Some(new_flight_id(rng));
    } else if rng.random::<f64>() < TAXI_PROBABILITY {
        s.speed_kmh = rng.random_range(2.0..5.0);
        s.heading_deg = normalize_heading(s.heading_deg + rng.random_range(-45.0..45.0));
    }
}

fn taking_off<R: Rng + ?Sized>(s: &mut FlightState, dt: f64, site: &Site, rng: &mut R) {
    s.speed_kmh = (s.speed_kmh + rng.random_range(1.0..3.0)).min(TAKEOFF_MAX_SPEED_KMH);
    s.vario_mps = rng.random_range(1.5..3.0);
    s.altitude_m += s.vario_mps * dt;
    s.heading_deg = normalize_heading(s.heading_deg + rng.random_range(-10.0..10.0));

    if s.altitude_m > site.launch_alt_m + CLIMB_TRANSITION_AGL_M {
        s.phase = Phase::Climbing;
    }
}

fn climbing<R: Rng + ?Sized>(s: &mut FlightState, dt: f64, thermals: &ThermalField, rng: &mut R) {
    s.speed_kmh = rng.random_range(35.0..45.0);
    s.vario_mps = (s.vario_mps - rng.random_range(0.1..0.4)).max(CLIMB_MAX_SINK_MPS);
    s.altitude_m += s.vario_mps * dt;
    s.heading_deg = normalize_heading(s.heading_deg + rng.random_range(-20.0..20.0));

    if let Some(thermal) = thermals.nearest_usable(s.lat, s.lon, s.altitude_m) {
        s.phase = Phase::Thermaling { thermal };
    } else if s.vario_mps < CLIMB_GIVE_UP_SINK_MPS
        || rng.random::<f64>() < CLIMB_GIVE_UP_PROBABILITY
    {
        s.phase = Phase::Gliding;
    }
}

/// Returns true when the position was placed on the thermal circle.
fn thermaling<R: Rng + ?Sized>(
    s: &mut FlightState,
    id: ThermalId,
    dt: f64,
    thermals: &ThermalField,
    rng: &mut R,
) -> bool {
    let Some(thermal) = thermals.get(id) else {
        s.phase = Phase::Gliding;
        return false;
    };

    let turn_rate = rng.random_range(12.0..18.0);
    s.heading_deg = normalize_heading(s.heading_deg + turn_rate * dt);

    let radius = rng.random_range(30.0..70.0);
    let (lat, lon) = offset_flat(thermal.lat, thermal.lon, radius, s.heading_deg);
    s.lat = lat;
    s.lon = lon;

    s.vario_mps = thermal.strength_mps * rng.random_range(0.6..1.2);
    s.altitude_m += s.vario_mps * dt;
    s.speed_kmh = rng.random_range(30.0..40.0);

    if s.altitude_m > thermal.ceiling_m || rng.random::<f64>() < THERMAL_EXIT_PROBABILITY {
        s.phase = Phase::Gliding;
        s.speed_kmh = rng.random_range(40.0..50.0);
    }
    true
}

fn gliding<R: Rng + ?Sized>(s: &mut FlightState, dt: f64, site: &Site, rng: &mut R) {
    s.vario_mps = rng.random_range(-1.8..-0.5);
    s.altitude_m += s.vario_mps * dt;
    s.speed_kmh = rng.random_range(35.0..50.0);
    s.heading_deg = normalize_heading(s.heading_deg + rng.random_range(-15.0..15.0));

    if s.vario_mps < GLIDE_FAST_SINK_MPS {
        s.speed_kmh = (s.speed_kmh + 2.0).min(GLIDE_MAX_SPEED_KMH);
    }
    if rng.random::<f64>() < WEAK_LIFT_PROBABILITY {
        s.vario_mps = rng.random_range(0.0..1.0);
    }

    if s.altitude_m < site.landing_alt_m + LANDING_PATTERN_AGL_M {
        s.phase = Phase::Landing {
            target: landing_target(site, rng),
        };
    }
}

fn landing<R: Rng + ?Sized>(
    s: &mut FlightState,
    target: GeoPoint,
    dt: f64,
    site: &Site,
    rng: &mut R,
) {
    let bearing = initial_bearing(s.lat, s.lon, target.lat, target.lon);
    let turned = limit_turn(s.heading_deg, bearing, LANDING_MAX_TURN_DEG);
    s.heading_deg = normalize_heading(turned + rng.random_range(-5.0..5.0));

    s.speed_kmh = (s.speed_kmh - rng.random_range(1.0..3.0)).max(LANDING_MIN_SPEED_KMH);
    s.vario_mps = (s.vario_mps - rng.random_range(0.1..0.3)).max(LANDING_MAX_SINK_MPS);
    s.altitude_m += s.vario_mps * dt;

    if s.altitude_m < site.landing_alt_m + GROUND_EFFECT_AGL_M {
        s.vario_mps = s.vario_mps.max(GROUND_EFFECT_SINK_MPS);
    }

    if s.altitude_m <= site.landing_alt_m {
        s.phase = Phase::Landed;
        s.altitude_m = site.landing_alt_m;
        s.speed_kmh = 0.0;
        s.vario_mps = 0.0;
    }
}

fn landed<R: Rng + ?Sized>(s: &mut FlightState, site: &Site, rng: &mut R) {
    if rng.random::<f64>() < RELAUNCH_PROBABILITY {
        s.phase = Phase::Ground;
        s.lat = site.lat + rng.random_range(-0.001..0.001);
        s.lon = site.lon + rng.random_range(-0.001..0.001);
        s.altitude_m = site.launch_alt_m;
        s.heading_deg = rng.random_range(0.0..360.0);
        s.flight_id = None;
    } else if rng.random::<f64>() < PACKING_JITTER_PROBABILITY {
        s.lat += rng.random_range(-0.00001..0.00001);
        s.lon += rng.random_range(-0.00001..0.00001);
    }
}

/// Heading-driven displacement plus an independent wind drift.
fn integrate_position<R: Rng + ?Sized>(s: &mut FlightState, dt: f64, rng: &mut R) {
    let distance = s.speed_kmh / 3.6 * dt;
    let (dlat, dlon) = flat_delta(s.lat, distance, s.heading_deg);

    let wind_mps = rng.random_range(0.0..MAX_WIND_KMH) / 3.6;
    let wind_dir = rng.random_range(0.0..360.0);
    let (wlat, wlon) = flat_delta(s.lat, wind_mps * dt, wind_dir);

    s.lat += dlat + wlat;
    s.lon += dlon + wlon;
}

fn landing_target<R: Rng + ?Sized>(site: &Site, rng: &mut R) -> GeoPoint {
    let bearing = rng.random_range(0.0..360.0);
    let distance = rng.random_range(100.0..1000.0);
    let (lat, lon) = offset_flat(site.lat, site.lon, distance, bearing);
    GeoPoint { lat, lon }
}

fn new_flight_id<R: Rng + ?Sized>(rng: &mut R) -> String {
    uuid::Builder::from_random_bytes(rng.random())
        .into_uuid()
        .to_string()
}
