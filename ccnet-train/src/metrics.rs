//! Running sums of named training metrics.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{AddAssign, Div};

/// Accumulates named scalar metrics between checkpoints.
///
/// Adding two trackers sums matching names; names present on only one side
/// are carried over. Dividing by the checkpoint interval gives the time average.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsTracker {
    values: BTreeMap<String, f64>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `value` to the running sum for `name`.
    pub fn record(&mut self, name: &str, value: f64) {
        *self.values.entry(name.to_string()).or_insert(0.0) += value;
    }

    /// Builder-style [`record`](Self::record).
    pub fn with(mut self, name: &str, value: f64) -> Self {
        self.record(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn reset(&mut self) {
        self.values.clear();
    }

    /// Divide every entry by `count`.
    pub fn averaged(&self, count: f64) -> Self {
        self / count
    }
}

impl AddAssign<&MetricsTracker> for MetricsTracker {
    fn add_assign(&mut self, rhs: &MetricsTracker) {
        for (name, value) in &rhs.values {
            self.record(name, *value);
        }
    }
}

impl AddAssign<MetricsTracker> for MetricsTracker {
    fn add_assign(&mut self, rhs: MetricsTracker) {
        *self += &rhs;
    }
}

impl Div<f64> for &MetricsTracker {
    type Output = MetricsTracker;

    fn div(self, rhs: f64) -> MetricsTracker {
        MetricsTracker {
            values: self
                .values
                .iter()
                .map(|(k, v)| (k.clone(), v / rhs))
                .collect(),
        }
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for MetricsTracker {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        let mut tracker = Self::new();
        for (name, value) in iter {
            tracker.record(&name.into(), value);
        }
        tracker
    }
}
