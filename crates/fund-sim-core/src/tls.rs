//! Traffic-Light System (TLS) suburb data provider.
//!
//! The engine only reads from this interface; the dataset is initialized
//! once and shared across runs. `TLS_MOCK` (default true) selects the mock
//! source; the production connector is not wired in this build and falls
//! back to mock with a warning.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::types::{PerZone, Zone};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyData {
    pub property_id: String,
    pub base_value: f64,
    pub property_type: String,
    pub bedrooms: u8,
    pub bathrooms: u8,
    pub land_size: f64,
    pub building_size: f64,
    pub year_built: u16,
    /// Condition score, 0..1.
    pub condition: f64,
    /// Build quality score, 0..1.
    pub quality: f64,
    /// Additive adjustment to the suburb appreciation rate.
    pub appreciation_modifier: f64,
    /// Multiplicative adjustment to the suburb default probability.
    pub risk_modifier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuburbData {
    pub suburb_id: String,
    pub name: String,
    pub zone: Zone,
    pub latitude: f64,
    pub longitude: f64,
    /// 0..1, higher is more liquid.
    pub liquidity_score: f64,
    /// Annualized appreciation volatility observed for the suburb.
    pub vol_appreciation: f64,
    pub default_probability: f64,
    /// Sensitivity to the macro index.
    pub beta: f64,
    /// Sensitivity to the suburb's zone index.
    pub zone_beta: f64,
    /// Share of price variance that is idiosyncratic to the suburb.
    pub idiosyncratic_share: f64,
    pub properties: Vec<PropertyData>,
}

/// Read-only TLS data source, shared across concurrent runs.
pub trait TlsDataProvider: Send + Sync {
    /// Share of suburbs per zone.
    fn zone_distribution(&self) -> PerZone<f64>;
    fn suburbs_by_zone(&self, zone: Zone) -> Vec<SuburbData>;
    fn suburb_data(&self, suburb_id: &str) -> Option<SuburbData>;
    fn num_suburbs(&self) -> usize;
}

// ---------------------------------------------------------------------------
// Mock source
// ---------------------------------------------------------------------------

const PROPERTY_TYPES: [&str; 4] = ["house", "apartment", "townhouse", "duplex"];

/// Deterministic mock dataset. Suburb zones come from a hash of the suburb
/// id (roughly 60% green / 30% orange / 10% red) and every attribute is
/// drawn from a generator seeded only by the dataset seed, so two sources
/// built with the same parameters are identical.
pub struct MockTlsDataSource {
    suburbs: Vec<SuburbData>,
    by_id: HashMap<String, usize>,
}

fn suburb_zone(suburb_id: &str) -> Zone {
    let hash: u32 = suburb_id.bytes().map(u32::from).sum();
    match hash % 10 {
        0..=5 => Zone::Green,
        6..=8 => Zone::Orange,
        _ => Zone::Red,
    }
}

impl MockTlsDataSource {
    pub fn new(num_suburbs: usize, properties_per_suburb: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut suburbs = Vec::with_capacity(num_suburbs);
        let mut by_id = HashMap::with_capacity(num_suburbs);

        for i in 0..num_suburbs {
            let suburb_id = format!("SUB{i:04}");
            let zone = suburb_zone(&suburb_id);

            let (liq_lo, liq_hi, median_value) = match zone {
                Zone::Green => (0.70, 0.95, 900_000.0),
                Zone::Orange => (0.50, 0.80, 650_000.0),
                Zone::Red => (0.30, 0.60, 450_000.0),
            };
            let base_vol = match zone {
                Zone::Green => 0.05,
                Zone::Orange => 0.07,
                Zone::Red => 0.09,
            };
            let base_default = match zone {
                Zone::Green => 0.01,
                Zone::Orange => 0.03,
                Zone::Red => 0.05,
            };

            let mut properties = Vec::with_capacity(properties_per_suburb);
            for j in 0..properties_per_suburb {
                let spread: f64 = rng.gen_range(0.5..1.8);
                properties.push(PropertyData {
                    property_id: format!("{suburb_id}-P{j:03}"),
                    base_value: median_value * spread,
                    property_type: PROPERTY_TYPES[rng.gen_range(0..PROPERTY_TYPES.len())]
                        .to_string(),
                    bedrooms: rng.gen_range(1..=5),
                    bathrooms: rng.gen_range(1..=3),
                    land_size: rng.gen_range(150.0..900.0),
                    building_size: rng.gen_range(70.0..350.0),
                    year_built: rng.gen_range(1950..=2023),
                    condition: rng.gen_range(0.3..1.0),
                    quality: rng.gen_range(0.3..1.0),
                    appreciation_modifier: rng.gen_range(-0.005..0.005),
                    risk_modifier: rng.gen_range(0.8..1.2),
                });
            }

            let suburb = SuburbData {
                name: format!("Suburb {i:04}"),
                suburb_id: suburb_id.clone(),
                zone,
                latitude: -33.87 + rng.gen_range(-0.35..0.35),
                longitude: 151.21 + rng.gen_range(-0.35..0.35),
                liquidity_score: rng.gen_range(liq_lo..liq_hi),
                vol_appreciation: base_vol * rng.gen_range(0.8..1.3),
                default_probability: base_default * rng.gen_range(0.7..1.4),
                beta: rng.gen_range(0.8..1.2),
                zone_beta: rng.gen_range(0.9..1.1),
                idiosyncratic_share: rng.gen_range(0.2..0.5),
                properties,
            };
            by_id.insert(suburb_id, suburbs.len());
            suburbs.push(suburb);
        }

        info!(
            num_suburbs = suburbs.len(),
            "mock TLS dataset generated"
        );
        MockTlsDataSource { suburbs, by_id }
    }
}

impl TlsDataProvider for MockTlsDataSource {
    fn zone_distribution(&self) -> PerZone<f64> {
        let mut counts = PerZone::new(0usize, 0, 0);
        for s in &self.suburbs {
            *counts.get_mut(s.zone) += 1;
        }
        let total = self.suburbs.len().max(1) as f64;
        counts.map(|_, c| *c as f64 / total)
    }

    fn suburbs_by_zone(&self, zone: Zone) -> Vec<SuburbData> {
        self.suburbs
            .iter()
            .filter(|s| s.zone == zone)
            .cloned()
            .collect()
    }

    fn suburb_data(&self, suburb_id: &str) -> Option<SuburbData> {
        self.by_id.get(suburb_id).map(|&i| self.suburbs[i].clone())
    }

    fn num_suburbs(&self) -> usize {
        self.suburbs.len()
    }
}

/// Build the TLS source selected by the `TLS_MOCK` environment variable.
pub fn provider_from_env(seed: u64) -> Arc<dyn TlsDataProvider> {
    let use_mock = std::env::var("TLS_MOCK")
        .map(|v| v.to_lowercase() != "false")
        .unwrap_or(true);
    if !use_mock {
        warn!("production TLS source not available, falling back to mock data");
    }
    Arc::new(MockTlsDataSource::new(60, 40, seed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_generation() {
        let a = MockTlsDataSource::new(20, 5, 7);
        let b = MockTlsDataSource::new(20, 5, 7);
        for (sa, sb) in a.suburbs.iter().zip(&b.suburbs) {
            assert_eq!(sa.suburb_id, sb.suburb_id);
            assert_eq!(sa.zone, sb.zone);
            assert_eq!(sa.liquidity_score, sb.liquidity_score);
            assert_eq!(sa.properties[0].base_value, sb.properties[0].base_value);
        }
    }

    #[test]
    fn test_every_zone_represented() {
        let source = MockTlsDataSource::new(60, 2, 1);
        for zone in Zone::ALL {
            assert!(
                !source.suburbs_by_zone(zone).is_empty(),
                "no suburbs in {zone}"
            );
        }
    }

    #[test]
    fn test_zone_distribution_sums_to_one() {
        let source = MockTlsDataSource::new(50, 2, 1);
        let dist = source.zone_distribution();
        assert!((dist.sum() - 1.0).abs() < 1e-12);
        // Hash split should be roughly 60/30/10.
        assert!(dist.green > dist.red);
    }

    #[test]
    fn test_suburb_lookup() {
        let source = MockTlsDataSource::new(10, 3, 1);
        let suburb = source.suburb_data("SUB0003").unwrap();
        assert_eq!(suburb.suburb_id, "SUB0003");
        assert_eq!(suburb.properties.len(), 3);
        assert!(source.suburb_data("SUB9999").is_none());
    }

    #[test]
    fn test_attribute_ranges() {
        let source = MockTlsDataSource::new(30, 10, 3);
        for s in &source.suburbs {
            assert!((0.0..=1.0).contains(&s.liquidity_score));
            assert!(s.vol_appreciation > 0.0);
            assert!((0.0..1.0).contains(&s.default_probability));
            for p in &s.properties {
                assert!(p.base_value > 0.0);
                assert!((1..=5).contains(&p.bedrooms));
            }
        }
    }
}
