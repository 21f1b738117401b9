//! Bandit weight and probability engine.
//!
//! Three arms: Generate a fresh program, Mutate a corpus seed, Triage a
//! pending discovery. Arm weights are exponentials of accumulated
//! normalized gain; probabilities mix in explicit exploration (Exp3) or
//! leave exploration to the estimator (Exp3-IX). The optional Exp3.1
//! meta-algorithm periodically resets the accumulators and re-bootstraps
//! gamma/eta so regret stays bounded without knowing the time horizon
//! up front.

use crate::config::{Algorithm, SchedulerConfig};
use banditfuzz_protocol::{Glc, MabGlc};
use rand::Rng;

/// Weight clamps around the exponentials.
const WEIGHT_MAX: f64 = 1.0e300;
const WEIGHT_MIN: f64 = 1.0e-300;

/// One scheduling choice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arm {
    Generate,
    Mutate,
    Triage,
}

impl Arm {
    pub fn index(self) -> usize {
        match self {
            Arm::Generate => 0,
            Arm::Mutate => 1,
            Arm::Triage => 2,
        }
    }
}

/// Per-round arm probabilities. Unavailable arms hold exactly `0.0`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ArmProbs {
    pub pr: [f64; 3],
    /// Number of arms actually offered this round.
    pub k: u32,
}

/// The bandit state: accumulators plus the scalar schedule parameters.
#[derive(Clone, Debug)]
pub struct Bandit {
    pub glc: MabGlc,
    pub gamma: f64,
    pub eta: f64,
    /// Scheduling choices made so far. Monotonic; versions sync state.
    pub round: u64,
    pub exp31_round: u64,
    pub threshold: f64,
    algorithm: Algorithm,
    exp31: bool,
}

impl Bandit {
    pub fn new(config: &SchedulerConfig) -> Self {
        let mut bandit = Self {
            glc: MabGlc::default(),
            gamma: config.gamma,
            eta: config.eta,
            round: 0,
            exp31_round: 1,
            threshold: f64::INFINITY,
            algorithm: config.algorithm,
            exp31: config.exp31,
        };
        if bandit.exp31 {
            bandit.bootstrap_exp31();
        }
        bandit
    }

    /// Exponential weights over accumulated normalized gain. The median
    /// of the three exponents is subtracted before exponentiating so one
    /// runaway arm cannot overflow the others into zero.
    pub fn weights(&self) -> [f64; 3] {
        let x = [
            self.eta * self.glc.normalized_generate.total_gain,
            self.eta * self.glc.normalized_mutate.total_gain,
            self.eta * self.glc.normalized_triage.total_gain,
        ];
        let median = median3(x);
        let mut weights = [1.0; 3];
        for i in 0..3 {
            weights[i] = (x[i] - median).exp().clamp(WEIGHT_MIN, WEIGHT_MAX);
        }
        weights
    }

    /// Compute this round's offered probabilities.
    ///
    /// `mutate_available` is false while the corpus is empty,
    /// `triage_available` while no discoveries are pending. Returns `None`
    /// on a degenerate zero total weight (skip the round).
    pub fn probabilities(&self, mutate_available: bool, triage_available: bool) -> Option<ArmProbs> {
        let weights = self.weights();
        let m = if mutate_available { 1.0 } else { 0.0 };
        let t = if triage_available { 1.0 } else { 0.0 };
        let k = 1 + mutate_available as u32 + triage_available as u32;
        let total = weights[0] + m * weights[1] + t * weights[2];
        if total == 0.0 {
            log::warn!("zero total arm weight, skipping round");
            return None;
        }
        let pr = |w: f64| match self.algorithm {
            Algorithm::Exp3 => (1.0 - self.gamma) * w / total + self.gamma / k as f64,
            Algorithm::Exp3Ix => w / total,
        };
        Some(ArmProbs {
            pr: [pr(weights[0]), m * pr(weights[1]), t * pr(weights[2])],
            k,
        })
    }

    /// Draw an arm proportionally to the offered probabilities.
    pub fn choose(&self, probs: &ArmProbs, rng: &mut impl Rng) -> Arm {
        let total = probs.pr[0] + probs.pr[1] + probs.pr[2];
        let u = rng.gen::<f64>() * total;
        if u <= probs.pr[0] {
            Arm::Generate
        } else if u <= probs.pr[0] + probs.pr[1] {
            Arm::Mutate
        } else {
            Arm::Triage
        }
    }

    /// Inverse-propensity gain estimate for the chosen arm.
    pub fn estimate_gain(&self, gain: f64, pr: f64) -> f64 {
        match self.algorithm {
            Algorithm::Exp3 => gain / pr,
            Algorithm::Exp3Ix => gain / (pr + self.gamma),
        }
    }

    /// Recompute gamma/eta/threshold for the current Exp3.1 round.
    pub fn bootstrap_exp31(&mut self) {
        self.gamma = (-(self.exp31_round as f64)).exp2();
        self.eta = match self.algorithm {
            Algorithm::Exp3 => self.gamma / 3.0,
            Algorithm::Exp3Ix => 2.0 * self.gamma,
        };
        self.threshold = 3.0 * 3.0_f64.ln() * (2.0 * self.exp31_round as f64).exp2()
            / (std::f64::consts::E - 1.0)
            - 3.0 / self.gamma;
        log::info!(
            "exp3.1 round {}: gamma={:.6} eta={:.6} threshold={:.3}",
            self.exp31_round,
            self.gamma,
            self.eta,
            self.threshold
        );
    }

    /// Zero the per-arm estimates and the normalized reference. The
    /// all-time raw accumulators survive: the gain/cost exchange rate is
    /// a property of the workload, not of the current Exp3.1 epoch.
    pub fn reset(&mut self) {
        self.glc.normalized_generate = Glc::default();
        self.glc.normalized_mutate = Glc::default();
        self.glc.normalized_triage = Glc::default();
        self.glc.nael_all = Glc::default();
    }

    /// Post-update Exp3.1 boundary check. Returns true when a new epoch
    /// started.
    pub fn check_exp31(&mut self) -> bool {
        if !self.exp31 {
            return false;
        }
        let gains = [
            self.glc.normalized_generate.total_gain,
            self.glc.normalized_mutate.total_gain,
            self.glc.normalized_triage.total_gain,
        ];
        let max = gains.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let min = gains.iter().cloned().fold(f64::INFINITY, f64::min);
        if max - min > self.threshold || max.abs() > self.threshold || min.abs() > self.threshold {
            self.exp31_round += 1;
            self.reset();
            self.bootstrap_exp31();
            return true;
        }
        false
    }

    /// Adopt a newer snapshot from a sync exchange.
    pub fn adopt(&mut self, round: u64, exp31_round: u64, glc: MabGlc) {
        self.round = round;
        self.exp31_round = exp31_round;
        self.glc = glc;
        if self.exp31 {
            self.bootstrap_exp31();
        }
    }
}

fn median3(x: [f64; 3]) -> f64 {
    let mut sorted = x;
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("arm exponents are finite"));
    sorted[1]
}
