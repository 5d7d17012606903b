//! Thermal field generation and lookup.

use crate::models::{Site, Thermal, ThermalId};
use crate::spatial::{haversine_distance, offset_flat};
use rand::Rng;

/// Thermals generated per site when none is specified.
pub const THERMALS_PER_SITE: usize = 10;

/// Read-only set of thermals shared by every device worker.
#[derive(Debug, Clone, Default)]
pub struct ThermalField {
    thermals: Vec<Thermal>,
}

impl ThermalField {
    pub fn new(thermals: Vec<Thermal>) -> Self {
        Self { thermals }
    }

    /// Scatter `per_site` thermals around each site.
    pub fn generate<R: Rng + ?Sized>(sites: &[Site], per_site: usize, rng: &mut R) -> Self {
        let mut thermals = Vec::with_capacity(sites.len() * per_site);
        for site in sites {
            for _ in 0..per_site {
                thermals.push(random_thermal(site, rng));
            }
        }
        Self { thermals }
    }

    pub fn get(&self, id: ThermalId) -> Option<&Thermal> {
        self.thermals.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.thermals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thermals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ThermalId, &Thermal)> {
        self.thermals
            .iter()
            .enumerate()
            .map(|(idx, thermal)| (ThermalId(idx), thermal))
    }

    /// Closest thermal whose radius contains the point and whose ceiling is above it.
    pub fn nearest_usable(&self, lat: f64, lon: f64, altitude_m: f64) -> Option<ThermalId> {
        self.iter()
            .filter(|(_, t)| altitude_m < t.ceiling_m)
            .map(|(id, t)| (id, haversine_distance(lat, lon, t.lat, t.lon), t.radius_m))
            .filter(|(_, dist, radius)| dist < radius)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _, _)| id)
    }
}

fn random_thermal<R: Rng + ?Sized>(site: &Site, rng: &mut R) -> Thermal {
    let bearing = rng.random_range(0.0..360.0);
    let distance = rng.random_range(300.0..7000.0);
    let (lat, lon) = offset_flat(site.lat, site.lon, distance, bearing);

    Thermal {
        lat,
        lon,
        radius_m: rng.random_range(50.0..300.0),
        strength_mps: rng.random_range(1.0..5.0),
        ceiling_m: site.launch_alt_m + rng.random_range(300.0..2000.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::default_sites;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn generated_thermals_respect_bounds() {
        let sites = default_sites();
        let mut rng = StdRng::seed_from_u64(11);
        let field = ThermalField::generate(&sites, THERMALS_PER_SITE, &mut rng);
        assert_eq!(field.len(), sites.len() * THERMALS_PER_SITE);

        for (idx, (_, thermal)) in field.iter().enumerate() {
            let site = &sites[idx / THERMALS_PER_SITE];
            let dist = haversine_distance(site.lat, site.lon, thermal.lat, thermal.lon);
            assert!(dist > 280.0 && dist < 7050.0, "distance {dist}");
            assert!((50.0..300.0).contains(&thermal.radius_m));
            assert!((1.0..5.0).contains(&thermal.strength_mps));
            assert!(thermal.ceiling_m >= site.launch_alt_m + 300.0);
            assert!(thermal.ceiling_m < site.launch_alt_m + 2000.0);
        }
    }

    #[test]
    fn nearest_usable_prefers_closest_and_checks_ceiling() {
        let far = Thermal {
            lat: 45.9,
            lon: 6.8 + 0.002,
            radius_m: 300.0,
            strength_mps: 2.0,
            ceiling_m: 3000.0,
        };
        let near = Thermal {
            lat: 45.9,
            lon: 6.8 + 0.0005,
            radius_m: 100.0,
            strength_mps: 3.0,
            ceiling_m: 3000.0,
        };
        let capped = Thermal {
            lat: 45.9,
            lon: 6.8,
            radius_m: 300.0,
            strength_mps: 4.0,
            ceiling_m: 2000.0,
        };
        let field = ThermalField::new(vec![far, near, capped]);

        assert_eq!(field.nearest_usable(45.9, 6.8, 2500.0), Some(ThermalId(1)));
        assert_eq!(field.nearest_usable(45.9, 6.8, 1500.0), Some(ThermalId(2)));
        assert_eq!(field.nearest_usable(45.9, 6.8, 3500.0), None);
        assert_eq!(field.nearest_usable(46.5, 7.5, 2500.0), None);
    }
}
