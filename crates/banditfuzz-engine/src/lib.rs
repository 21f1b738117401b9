//! Adaptive bandit scheduler for coverage-guided fuzzing.
//!
//! Every fuzzing round is a three-way choice: **generate** a fresh test
//! program, **mutate** an existing corpus seed, or **triage** a pending
//! coverage-increasing discovery. This crate makes that choice with an
//! adversarial-bandit scheduler (Exp3 / Exp3-IX, optionally wrapped in
//! the Exp3.1 periodic-reset meta-algorithm) that re-weights the arms —
//! and, inside the Mutate arm, the corpus seeds — from normalized
//! historical gain/cost statistics.
//!
//! # Architecture
//!
//! ```text
//! 1. Worker queries arm probabilities, draws an arm
//! 2. Dispatch: generate / mutate / verify+minimize via the external
//!    Executor and ProgramSource collaborators
//! 3. Outcome → (gain, cost) → exchange-rate + z-score normalization
//! 4. Inverse-propensity estimate → per-arm accumulator and, for
//!    mutations, the owning seed's selection weight
//! 5. Periodically: round-versioned sync with the coordinator, which
//!    merges dirty-set deltas monotonically across workers
//! ```
//!
//! # Module Structure
//!
//! - [`normalize`] — exchange-rate (gain↔cost) and z-score–logistic
//!   rescaling
//! - [`bandit`] — arm weights, probabilities, estimator, Exp3.1 reset
//! - [`corpus`] — accepted seeds + weighted selection via prefix sums
//! - [`signal`] — coverage-fingerprint set arithmetic
//! - [`queue`] — pending triage and smash work
//! - [`exec`] / [`program`] — executor and program-source collaborator
//!   seams, bounded admission gate
//! - [`scheduler`] — shared state and outcome attribution (the
//!   associative gain split)
//! - [`worker`] — the per-round loop
//! - [`sync`] / [`coordinator`] — cross-worker state merge
//! - [`checkpoint`] — resumable campaign state
//! - [`report`] — campaign summaries
//!
//! # Determinism
//!
//! Given one worker and a fixed seed, a campaign against a deterministic
//! executor is reproducible: all randomness flows from seeded ChaCha8
//! RNGs and all maps iterate in key order.

pub mod bandit;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod corpus;
pub mod exec;
pub mod normalize;
pub mod program;
pub mod queue;
pub mod report;
pub mod scheduler;
pub mod signal;
pub mod sync;
pub mod worker;

pub use bandit::{Arm, ArmProbs, Bandit};
pub use checkpoint::{load_checkpoint, save_checkpoint, CheckpointError, SchedulerCheckpoint};
pub use config::{Algorithm, SchedulerConfig};
pub use coordinator::Coordinator;
pub use corpus::{Corpus, SeedEntry};
pub use exec::{ExecError, ExecOutcome, Executor, Gate, OpResult};
pub use normalize::NormalizeMode;
pub use program::{ProgramSource, TestProgram};
pub use report::{format_report, CampaignReport};
pub use scheduler::{ExecStats, Outcome, Scheduler, TriageOutcome};
pub use worker::{Worker, WorkerError};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let config = SchedulerConfig::default();
        let _ = Bandit::new(&config);
        let _ = Corpus::new(&config);
        let _ = Coordinator::new(4);
        let _ = Gate::new(1, None);
    }
}
