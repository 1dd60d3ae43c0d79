//! Exponential RSSI smoothing, one moving average per device address.

use std::collections::HashMap;

use crate::core::bluetooth::constants::RSSI_SMOOTHING_ALPHA;

/// Maintains an exponential moving average of RSSI per device address.
/// The first sample for an address seeds the average; each subsequent
/// sample contributes `alpha * raw + (1 - alpha) * previous`.
#[derive(Debug)]
pub struct RssiSmoother {
    alpha: f64,
    smoothed: HashMap<String, f64>,
}

impl Default for RssiSmoother {
    fn default() -> Self {
        Self::new(RSSI_SMOOTHING_ALPHA)
    }
}

impl RssiSmoother {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            smoothed: HashMap::new(),
        }
    }

    /// Feed one raw sample for an address and return the updated average.
    pub fn observe(&mut self, address: &str, raw: i16) -> f64 {
        let raw = f64::from(raw);
        let value = match self.smoothed.get(address) {
            Some(previous) => self.alpha * raw + (1.0 - self.alpha) * previous,
            None => raw,
        };
        self.smoothed.insert(address.to_string(), value);
        value
    }

    pub fn get(&self, address: &str) -> Option<f64> {
        self.smoothed.get(address).copied()
    }

    /// Forget all tracked averages (a new scan session starts fresh).
    pub fn clear(&mut self) {
        self.smoothed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_the_average() {
        let mut smoother = RssiSmoother::default();
        assert_eq!(smoother.observe("AA:BB", -60), -60.0);
    }

    #[test]
    fn subsequent_samples_follow_the_smoothing_formula() {
        let mut smoother = RssiSmoother::default();
        smoother.observe("AA:BB", -60);
        let second = smoother.observe("AA:BB", -40);
        assert!((second - (0.3 * -40.0 + 0.7 * -60.0)).abs() < f64::EPSILON);

        let third = smoother.observe("AA:BB", -80);
        assert!((third - (0.3 * -80.0 + 0.7 * second)).abs() < f64::EPSILON);
    }

    #[test]
    fn addresses_are_tracked_independently() {
        let mut smoother = RssiSmoother::default();
        smoother.observe("AA:BB", -60);
        assert_eq!(smoother.observe("CC:DD", -90), -90.0);
        assert_eq!(smoother.get("AA:BB"), Some(-60.0));
    }

    #[test]
    fn clear_forgets_previous_averages() {
        let mut smoother = RssiSmoother::default();
        smoother.observe("AA:BB", -60);
        smoother.clear();
        assert_eq!(smoother.observe("AA:BB", -40), -40.0);
    }
}
