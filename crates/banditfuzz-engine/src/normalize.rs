//! Gain normalization pipeline.
//!
//! Raw gains from different arms live on different scales (new signal
//! count vs. new corpus entries), so two rescaling stages run before
//! anything reaches the bandit:
//!
//! 1. Exchange-rate normalization: rescale gain into cost units using the
//!    population-wide gain/cost ratio of a reference accumulator, then
//!    subtract cost. A positive result means "earned more than it spent".
//! 2. Z-score + logistic squash into `(-1, 1)`, so a single outlier
//!    observation cannot blow up the exponential arm weights.

use banditfuzz_protocol::Glc;

/// Whether the z-score stage is applied or bypassed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NormalizeMode {
    /// Pass gains through unchanged.
    Disabled,
    /// Z-score against the reference accumulator, logistic squash,
    /// rescaled to `(-1, 1)`.
    ZLogistic,
}

/// Exchange-rate normalization against a raw reference accumulator.
///
/// Returns `gain * (Σcost / Σgain) - cost`, or `0.0` while the reference
/// has no accumulated gain (nothing to calibrate against yet).
pub fn nael(gain: f64, cost: f64, raw: &Glc) -> f64 {
    if raw.total_gain > 0.0 {
        gain * (raw.total_cost / raw.total_gain) - cost
    } else {
        0.0
    }
}

/// Z-score a value against running statistics, squash with a logistic.
///
/// Returns `(y, mean, std)` with `y` in `(0, 1)`. Degenerate statistics
/// (no samples, zero variance, or a negative variance from floating-point
/// cancellation) return the neutral midpoint `0.5`.
pub fn z_logistic(x: f64, n: u64, sum: f64, sum2: f64, offset: f64) -> (f64, f64, f64) {
    if n == 0 {
        return (0.5, 0.0, 0.0);
    }
    let mean = sum / n as f64;
    let variance = sum2 / n as f64 - mean * mean;
    if variance < 0.0 {
        log::warn!("negative variance {variance} from running stats, returning neutral");
        return (0.5, 0.0, 0.0);
    }
    let std = variance.sqrt();
    if std == 0.0 {
        return (0.5, mean, 0.0);
    }
    let z = (x - mean - offset) / std;
    (1.0 / (1.0 + (-z).exp()), mean, std)
}

/// Full second-stage normalization of a gain against a normalized
/// reference accumulator. Output is in `(-1, 1)`, with `0.0` neutral.
///
/// The offset recenters on the reference mean so the typical observation
/// lands at the midpoint regardless of drift in the running statistics.
pub fn normalized_gain(x: f64, nael_ref: &Glc, mode: NormalizeMode) -> f64 {
    match mode {
        NormalizeMode::Disabled => x,
        NormalizeMode::ZLogistic => {
            if nael_ref.count == 0 {
                return 0.0;
            }
            let offset = -nael_ref.total_gain / nael_ref.count as f64;
            let (y, _, _) = z_logistic(
                x,
                nael_ref.count,
                nael_ref.total_gain,
                nael_ref.total_gain2,
                offset,
            );
            2.0 * y - 1.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_glc(samples: &[(f64, f64)]) -> Glc {
        let mut glc = Glc::default();
        for &(g, c) in samples {
            glc.update(g, c);
        }
        glc
    }

    #[test]
    fn test_nael_zero_reference_guard() {
        let raw = Glc::default();
        assert_eq!(nael(5.0, 2.0, &raw), 0.0);
    }

    #[test]
    fn test_nael_exchange_rate() {
        // Population: 10 gain for 20 cost → rate 2 cost per gain.
        let raw = make_glc(&[(10.0, 20.0)]);
        // 3 gain is worth 6 cost-units; spent 4 → net +2.
        assert!((nael(3.0, 4.0, &raw) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_nael_negative_when_overpriced() {
        let raw = make_glc(&[(100.0, 1.0)]);
        // Cheap gain population; spending 5.0 for 1 gain is a net loss.
        assert!(nael(1.0, 5.0, &raw) < 0.0);
    }

    #[test]
    fn test_z_logistic_empty() {
        assert_eq!(z_logistic(1.0, 0, 0.0, 0.0, 0.0), (0.5, 0.0, 0.0));
    }

    #[test]
    fn test_z_logistic_zero_std() {
        // All samples identical → std 0, neutral result but real mean.
        let (y, mean, std) = z_logistic(3.0, 4, 8.0, 16.0, 0.0);
        assert_eq!(y, 0.5);
        assert_eq!(mean, 2.0);
        assert_eq!(std, 0.0);
    }

    #[test]
    fn test_z_logistic_at_mean_is_midpoint() {
        // mean 1, variance 1; x == mean → z == 0 → y == 0.5.
        let (y, mean, std) = z_logistic(1.0, 2, 2.0, 4.0, 0.0);
        assert!((y - 0.5).abs() < 1e-12);
        assert_eq!(mean, 1.0);
        assert_eq!(std, 1.0);
    }

    #[test]
    fn test_z_logistic_monotone() {
        let (lo, _, _) = z_logistic(0.0, 2, 2.0, 4.0, 0.0);
        let (hi, _, _) = z_logistic(2.0, 2, 2.0, 4.0, 0.0);
        assert!(lo < 0.5 && hi > 0.5);
    }

    #[test]
    fn test_normalized_gain_disabled_passthrough() {
        let glc = make_glc(&[(1.0, 0.0), (2.0, 0.0)]);
        assert_eq!(normalized_gain(42.0, &glc, NormalizeMode::Disabled), 42.0);
    }

    #[test]
    fn test_normalized_gain_empty_reference_neutral() {
        let glc = Glc::default();
        assert_eq!(normalized_gain(5.0, &glc, NormalizeMode::ZLogistic), 0.0);
    }

    #[test]
    fn test_normalized_gain_bounded() {
        let glc = make_glc(&[(1.0, 0.0), (2.0, 0.0), (3.0, 0.0)]);
        // The logistic saturates to exactly ±1 for extreme inputs; it
        // must never escape the interval.
        for x in [-1e9, -10.0, 0.0, 10.0, 1e9] {
            let y = normalized_gain(x, &glc, NormalizeMode::ZLogistic);
            assert!((-1.0..=1.0).contains(&y), "x={x} escaped to {y}");
        }
        let moderate = normalized_gain(1.0, &glc, NormalizeMode::ZLogistic);
        assert!(moderate > -1.0 && moderate < 1.0);
    }

    #[test]
    fn test_normalized_gain_offset_recenters() {
        // With offset = -mean, x == 0 sits at z = 0 → output 0.
        let glc = make_glc(&[(4.0, 0.0), (6.0, 0.0)]);
        let y = normalized_gain(0.0, &glc, NormalizeMode::ZLogistic);
        assert!(y.abs() < 1e-12);
    }
}
