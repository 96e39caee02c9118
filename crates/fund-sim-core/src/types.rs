use serde::{Deserialize, Serialize};
use std::fmt;

/// Dollar amounts. The stochastic core works in f64 like every price/return
/// quantity; exact-to-the-cent arithmetic lives in the capital allocator,
/// which uses `rust_decimal` internally.
pub type Money = f64;

/// Rates expressed as decimals (0.05 = 5%). Never as percentages.
pub type Rate = f64;

/// Traffic-light risk tier of a geographic area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    Green,
    Orange,
    Red,
}

impl Zone {
    pub const ALL: [Zone; 3] = [Zone::Green, Zone::Orange, Zone::Red];

    pub fn index(self) -> usize {
        match self {
            Zone::Green => 0,
            Zone::Orange => 1,
            Zone::Red => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Zone::Green => "green",
            Zone::Orange => "orange",
            Zone::Red => "red",
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record with one value per zone. Used for allocations, appreciation,
/// default and recovery rates, volatilities, and exposure breakdowns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerZone<T> {
    pub green: T,
    pub orange: T,
    pub red: T,
}

impl<T> PerZone<T> {
    pub fn new(green: T, orange: T, red: T) -> Self {
        PerZone { green, orange, red }
    }

    pub fn get(&self, zone: Zone) -> &T {
        match zone {
            Zone::Green => &self.green,
            Zone::Orange => &self.orange,
            Zone::Red => &self.red,
        }
    }

    pub fn get_mut(&mut self, zone: Zone) -> &mut T {
        match zone {
            Zone::Green => &mut self.green,
            Zone::Orange => &mut self.orange,
            Zone::Red => &mut self.red,
        }
    }

    pub fn map<U>(&self, mut f: impl FnMut(Zone, &T) -> U) -> PerZone<U> {
        PerZone {
            green: f(Zone::Green, &self.green),
            orange: f(Zone::Orange, &self.orange),
            red: f(Zone::Red, &self.red),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Zone, &T)> {
        [
            (Zone::Green, &self.green),
            (Zone::Orange, &self.orange),
            (Zone::Red, &self.red),
        ]
        .into_iter()
    }
}

impl<T: Clone> PerZone<T> {
    pub fn splat(value: T) -> Self {
        PerZone {
            green: value.clone(),
            orange: value.clone(),
            red: value,
        }
    }
}

impl PerZone<f64> {
    pub fn sum(&self) -> f64 {
        self.green + self.orange + self.red
    }
}

impl<T: Default> Default for PerZone<T> {
    fn default() -> Self {
        PerZone {
            green: T::default(),
            orange: T::default(),
            red: T::default(),
        }
    }
}

/// A metric that may be unavailable or approximated depending on whether
/// Monte-Carlo is enabled. `value: None` with `requires_mc: true` means the
/// metric has no deterministic substitute.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricValue {
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_approximation: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub requires_mc: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl MetricValue {
    pub fn exact(value: f64) -> Self {
        MetricValue {
            value: Some(value),
            ..Default::default()
        }
    }

    pub fn approximation(value: f64, note: &str) -> Self {
        MetricValue {
            value: Some(value),
            is_approximation: true,
            note: Some(note.to_string()),
            ..Default::default()
        }
    }

    pub fn requires_mc(note: &str) -> Self {
        MetricValue {
            value: None,
            requires_mc: true,
            note: Some(note.to_string()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_roundtrip() {
        for zone in Zone::ALL {
            let json = serde_json::to_string(&zone).unwrap();
            let back: Zone = serde_json::from_str(&json).unwrap();
            assert_eq!(zone, back);
        }
        assert_eq!(serde_json::to_string(&Zone::Green).unwrap(), "\"green\"");
    }

    #[test]
    fn test_per_zone_access() {
        let mut pz = PerZone::new(1.0, 2.0, 3.0);
        assert_eq!(*pz.get(Zone::Orange), 2.0);
        *pz.get_mut(Zone::Red) += 1.0;
        assert_eq!(pz.red, 4.0);
        assert_eq!(pz.sum(), 7.0);
    }

    #[test]
    fn test_per_zone_map_preserves_order() {
        let pz = PerZone::new(10.0, 20.0, 30.0);
        let doubled = pz.map(|_, v| v * 2.0);
        assert_eq!(doubled.green, 20.0);
        assert_eq!(doubled.orange, 40.0);
        assert_eq!(doubled.red, 60.0);
    }

    #[test]
    fn test_metric_value_flags() {
        let m = MetricValue::requires_mc("CFaR needs a simulated distribution");
        assert!(m.value.is_none());
        assert!(m.requires_mc);

        let m = MetricValue::approximation(0.12, "log-normal analytic VaR");
        assert!(m.is_approximation);
        assert_eq!(m.value, Some(0.12));
    }
}
