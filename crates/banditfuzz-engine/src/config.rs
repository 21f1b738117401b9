//! Scheduler configuration.

use crate::normalize::NormalizeMode;
use std::str::FromStr;
use std::time::Duration;

/// Which bandit variant drives arm selection.
///
/// The two differ only in where exploration lives: `Exp3` mixes an
/// explicit `gamma/K` term into the probabilities, `Exp3Ix` keeps the
/// probabilities pure and adds `gamma` to the estimator denominator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    Exp3,
    Exp3Ix,
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exp3" => Ok(Algorithm::Exp3),
            "exp3-ix" => Ok(Algorithm::Exp3Ix),
            other => Err(format!("unknown bandit algorithm: {other}")),
        }
    }
}

/// Tuning knobs for the scheduler. All opaque inputs to the components;
/// see each component for what its knobs mean.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub algorithm: Algorithm,
    /// Exploration rate. Overwritten by the Exp3.1 bootstrap when enabled.
    pub gamma: f64,
    /// Weight learning rate. Overwritten by the Exp3.1 bootstrap when enabled.
    pub eta: f64,
    /// Exploration rate for seed selection.
    pub corpus_gamma: f64,
    /// Learning rate for seed selection weights.
    pub corpus_eta: f64,
    /// Enable the Exp3.1 periodic-reset meta-algorithm.
    pub exp31: bool,
    /// Whether seed-selection weights follow the bandit estimates or stay
    /// proportional to discovered signal.
    pub bandit_seed_selection: bool,
    pub normalize: NormalizeMode,
    /// Rounds at worker start that are forced to Generate, so the raw
    /// accumulators have an exchange rate before the bandit takes over.
    pub generate_first: u64,
    /// Mutations executed per Mutate round.
    pub mutate_weight: usize,
    /// Total focused mutations queued when a seed is first accepted.
    pub smash_weight: usize,
    /// Re-executions when verifying a discovery's signal.
    pub verify_runs: usize,
    /// Executions per minimization keep-check.
    pub minimize_attempts: usize,
    /// When set, pending triage work preempts the bandit entirely.
    pub triage_first: bool,
    /// Executor retries before the worker gives up.
    pub execute_retries: usize,
    pub retry_backoff: Duration,
    /// Nanoseconds per cost unit.
    pub time_unit: f64,
    /// Cost ceiling in cost units; observations above it are outliers and
    /// clamped before attribution.
    pub cost_max: f64,
    /// Max candidate inputs returned per sync call.
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Exp3,
            gamma: 0.1,
            eta: 0.1 / 3.0,
            corpus_gamma: 0.1,
            corpus_eta: 0.1,
            exp31: true,
            bandit_seed_selection: true,
            normalize: NormalizeMode::ZLogistic,
            generate_first: 10,
            mutate_weight: 4,
            smash_weight: 12,
            verify_runs: 3,
            minimize_attempts: 3,
            triage_first: false,
            execute_retries: 10,
            retry_backoff: Duration::from_secs(1),
            time_unit: 1.0e6, // cost in milliseconds
            cost_max: 5000.0, // 5s of wall clock per execution
            batch_size: 5,
        }
    }
}
