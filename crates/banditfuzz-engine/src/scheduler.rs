//! Shared scheduler state and outcome attribution.
//!
//! One [`Scheduler`] instance is shared by every worker thread of a
//! process. Three resources are independently lockable — the corpus, the
//! signal store, and the bandit state — so signal merges do not stall
//! seed selection and vice versa. Weight computation and weight update
//! both go through the bandit lock, which keeps the read-then-update pair
//! of a round atomic.
//!
//! Attribution is where a raw outcome becomes bandit food. A Mutate
//! outcome is split four ways (mutate / verify / minimize / triage)
//! using cost-weighted blends of the owning seed's cumulative figures,
//! and only the round-over-round difference of the normalized mutate and
//! triage figures enters the estimator — gain credited in an earlier
//! round must not be credited again.

use crate::bandit::{Arm, ArmProbs, Bandit};
use crate::config::SchedulerConfig;
use crate::corpus::Corpus;
use crate::exec::Gate;
use crate::normalize::{nael, normalized_gain};
use crate::queue::WorkQueue;
use crate::signal::SignalStore;
use banditfuzz_protocol::{Sig, TriageStats};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

/// Raw result of a Generate or Mutate dispatch.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExecStats {
    /// Novel fingerprints observed.
    pub gain_raw: f64,
    /// Execution cost, in cost units.
    pub cost: f64,
    /// Wall-clock cost of the whole dispatch, in cost units.
    pub cost_total: f64,
    /// Mutation source index, or -1.
    pub pidx: i64,
}

/// Raw result of a Triage dispatch.
#[derive(Clone, Debug, Default)]
pub struct TriageOutcome {
    /// Fingerprints the accepted input added to the corpus frontier.
    pub corpus_gain_raw: f64,
    /// Fingerprints discovered while verifying.
    pub verify_gain_raw: f64,
    pub verify_cost: f64,
    /// Fingerprints discovered while minimizing.
    pub minimize_gain_raw: f64,
    pub minimize_cost: f64,
    /// Per-execution cost saved by the shorter program.
    pub minimize_time_save: f64,
    pub source: i64,
    pub source_sig: Sig,
    pub source_cost: f64,
    /// Corpus index assigned on acceptance, or -1.
    pub pidx: i64,
    pub success: bool,
    pub cost_total: f64,
}

/// What a dispatch produced, tagged by arm.
#[derive(Clone, Debug)]
pub enum Outcome {
    Generate(ExecStats),
    Mutate(ExecStats),
    Triage(TriageOutcome),
}

impl Outcome {
    pub fn arm(&self) -> Arm {
        match self {
            Outcome::Generate(_) => Arm::Generate,
            Outcome::Mutate(_) => Arm::Mutate,
            Outcome::Triage(_) => Arm::Triage,
        }
    }
}

/// Monotone campaign counters, updated lock-free.
#[derive(Debug, Default)]
pub struct Counters {
    pub rounds: AtomicU64,
    pub generated: AtomicU64,
    pub mutated: AtomicU64,
    pub triaged: AtomicU64,
    pub executions: AtomicU64,
    pub accepted: AtomicU64,
}

/// Shared scheduler state for one worker process.
pub struct Scheduler {
    pub config: SchedulerConfig,
    pub bandit: Mutex<Bandit>,
    pub corpus: RwLock<Corpus>,
    pub signal: RwLock<SignalStore>,
    pub queue: Mutex<WorkQueue>,
    pub triage_info: Mutex<BTreeMap<Sig, TriageStats>>,
    pub gate: Gate,
    pub counters: Counters,
    shutdown: AtomicBool,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, gate: Gate) -> Self {
        let bandit = Bandit::new(&config);
        let corpus = Corpus::new(&config);
        Self {
            config,
            bandit: Mutex::new(bandit),
            corpus: RwLock::new(corpus),
            signal: RwLock::new(SignalStore::new()),
            queue: Mutex::new(WorkQueue::new()),
            triage_info: Mutex::new(BTreeMap::new()),
            gate,
            counters: Counters::default(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Bump the round version counter. Every round counts toward the
    /// sync version, bandit-driven or not.
    pub fn begin_round(&self) -> u64 {
        let mut bandit = self.bandit.lock().expect("bandit poisoned");
        bandit.round += 1;
        bandit.round
    }

    /// Compute this round's probabilities from arm availability and draw.
    ///
    /// Returns `None` on a degenerate zero total weight; the caller skips
    /// the round.
    pub fn select_arm(&self, rng: &mut impl Rng) -> Option<(Arm, ArmProbs)> {
        let mutate_available = !self.corpus.read().expect("corpus poisoned").is_empty();
        let triage_available = self.queue.lock().expect("queue poisoned").triage_len() > 0;
        let bandit = self.bandit.lock().expect("bandit poisoned");
        let probs = bandit.probabilities(mutate_available, triage_available)?;
        let arm = bandit.choose(&probs, rng);
        Some((arm, probs))
    }

    /// Clamp cost outliers before they hit the accumulators. A wedged
    /// executor reporting an hour of cost would otherwise dominate every
    /// normalization reference.
    fn preprocess(&self, outcome: &mut Outcome) {
        let cost_max = self.config.cost_max;
        match outcome {
            Outcome::Generate(stats) | Outcome::Mutate(stats) => {
                stats.cost = stats.cost.clamp(0.0, cost_max);
            }
            Outcome::Triage(triage) => {
                triage.verify_cost = triage.verify_cost.clamp(0.0, cost_max);
                triage.minimize_cost = triage.minimize_cost.clamp(0.0, cost_max);
                if triage.minimize_time_save.abs() > cost_max {
                    triage.minimize_time_save = 0.0;
                }
            }
        }
    }

    /// Route an outcome into the accumulators, the owning seed's stats,
    /// and the seed-selection weights, then run the Exp3.1 boundary
    /// check.
    pub fn attribute(&self, mut outcome: Outcome, probs: &ArmProbs) {
        let pr = probs.pr[outcome.arm().index()];
        if pr == 0.0 {
            log::warn!("attribution for arm offered with zero probability, skipping");
            return;
        }
        self.preprocess(&mut outcome);
        // Lock order: bandit, then corpus. The whole attribution is
        // atomic with respect to weight reads.
        let mut bandit = self.bandit.lock().expect("bandit poisoned");
        match outcome {
            Outcome::Generate(stats) => self.attribute_generate(&mut bandit, &stats, pr),
            Outcome::Mutate(stats) => self.attribute_mutate(&mut bandit, &stats, pr),
            Outcome::Triage(triage) => self.attribute_triage(&mut bandit, &triage, pr),
        }
        bandit.check_exp31();
    }

    fn attribute_generate(&self, bandit: &mut Bandit, stats: &ExecStats, pr: f64) {
        let (gain, cost) = (stats.gain_raw, stats.cost);
        let g_nael = nael(gain, cost, &bandit.glc.raw_all);
        let x = normalized_gain(g_nael, &bandit.glc.nael_all, self.config.normalize);
        let estimate = bandit.estimate_gain(x, pr);
        bandit.glc.normalized_generate.update(estimate, 0.0);
        bandit.glc.nael_all.update(g_nael, 0.0);
        bandit.glc.raw_all.update(gain, cost);
    }

    fn attribute_triage(&self, bandit: &mut Bandit, triage: &TriageOutcome, pr: f64) {
        let gain = triage.minimize_gain_raw;
        let cost = triage.verify_cost + triage.minimize_cost;
        let g_nael = nael(gain, cost, &bandit.glc.raw_all);
        let x = normalized_gain(g_nael, &bandit.glc.nael_all, self.config.normalize);
        let estimate = bandit.estimate_gain(x, pr);
        bandit.glc.normalized_triage.update(estimate, 0.0);
        bandit.glc.nael_all.update(g_nael, 0.0);
        if triage.success && triage.pidx >= 0 {
            let mut corpus = self.corpus.write().expect("corpus poisoned");
            if let Some(stats) = corpus.stats_mut(triage.pidx as usize) {
                stats.triage_gain_norm = g_nael;
                stats.verify_gain = triage.verify_gain_raw;
                stats.minimize_gain = triage.minimize_gain_raw;
                stats.verify_cost = triage.verify_cost;
                stats.minimize_cost = triage.minimize_cost;
                stats.minimize_time_save = triage.minimize_time_save;
                stats.cost_before_minimize = triage.source_cost;
            }
        }
        bandit.glc.raw_all.update(gain, cost);
    }

    /// The associative split. A mutation's gain also reflects work that
    /// verification, minimization, and triage did for the seed earlier,
    /// so the seed's cumulative figures are blended by cost share and
    /// only the marginal movement of the normalized mutate/triage figures
    /// is credited this round. The blend formulas are load-bearing; do
    /// not refactor them algebraically.
    fn attribute_mutate(&self, bandit: &mut Bandit, stats: &ExecStats, pr: f64) {
        let (gain, cost) = (stats.gain_raw, stats.cost);
        let mut corpus = self.corpus.write().expect("corpus poisoned");
        if stats.pidx < 0 || stats.pidx as usize >= corpus.len() {
            log::warn!("mutate outcome with bad seed index {}", stats.pidx);
            return;
        }
        let pidx = stats.pidx as usize;
        let seed = corpus.entry(pidx).expect("checked above").stats;

        let cost_ver = seed.verify_cost;
        let cost_min = seed.minimize_cost;
        let gain_min = seed.minimize_gain;
        let gain_ver = seed.verify_gain;
        let gain_mut_cur = seed.mutate_gain + gain;
        let cost_mut_cur = seed.mutate_cost + cost;
        let n_mut_prev = seed.mutate_gain_norm;
        let n_tri_prev = seed.triage_gain_norm;
        let cost_mut_time_save = seed.mutate_count as f64 * seed.minimize_time_save;

        if cost_mut_cur + cost_ver == 0.0 {
            log::warn!("mutate attribution with zero cumulative cost for seed {pidx}");
            bandit.glc.raw_all.update(gain, cost);
            bandit.glc.raw_mutate.update(gain, cost);
            return;
        }

        // Minimization: signal it found, plus the per-mutation time it
        // has been saving ever since.
        let n_min_cur = nael(gain_min, 0.0, &bandit.glc.raw_all) + cost_mut_time_save;
        // Verification: mutate gain proportional to verify's share of the
        // seed's total cost, plus what verification itself found.
        let n_ver_cur = nael(
            gain_mut_cur * cost_ver / (cost_mut_cur + cost_ver) + gain_ver,
            0.0,
            &bandit.glc.raw_all,
        );
        // Triage inherits both, net of its own spend.
        let n_tri_cur = n_ver_cur + n_min_cur - (cost_ver + cost_min);
        // Mutation keeps the remaining share of its gain, priced at its
        // cumulative cost.
        let n_mut_cur = nael(
            gain_mut_cur * cost_mut_cur / (cost_mut_cur + cost_ver),
            cost_mut_cur,
            &bandit.glc.raw_all,
        );

        let n_mut_diff = n_mut_cur - n_mut_prev;
        let n_tri_diff = n_tri_cur - n_tri_prev;
        let x_mut = normalized_gain(n_mut_diff, &bandit.glc.nael_all, self.config.normalize);
        let x_tri = normalized_gain(n_tri_diff, &bandit.glc.nael_all, self.config.normalize);
        let est_mut = bandit.estimate_gain(x_mut, pr);
        // Triage may have been unavailable this round, so its offered
        // probability can be zero; mutate was certainly offered, so its
        // probability stands in.
        let est_tri = bandit.estimate_gain(x_tri, pr);
        bandit.glc.normalized_mutate.update(est_mut, 0.0);
        bandit.glc.normalized_triage.update(est_tri, 0.0);

        {
            let seed = corpus.stats_mut(pidx).expect("checked above");
            seed.mutate_gain = gain_mut_cur;
            seed.mutate_cost = cost_mut_cur;
            seed.mutate_gain_norm = n_mut_cur;
            seed.triage_gain_norm = n_tri_cur;
        }
        // The associated figures are blends; the normalization reference
        // only ever sees the outcome's own gain.
        let n_norm = nael(gain, cost, &bandit.glc.raw_all);
        bandit.glc.nael_all.update(n_norm, 0.0);

        if self.config.bandit_seed_selection {
            let n_norm1 = nael(gain, cost, &bandit.glc.raw_mutate);
            let x_norm = normalized_gain(n_norm1, &bandit.glc.nael_mutate, self.config.normalize);
            corpus.update_weight(pidx, x_norm);
            bandit.glc.nael_mutate.update(n_norm1, 0.0);
        }
        if let Some(seed) = corpus.stats_mut(pidx) {
            seed.mutate_count += 1;
        }
        bandit.glc.raw_all.update(gain, cost);
        bandit.glc.raw_mutate.update(gain, cost);
    }

    /// Register one more pending sub-triage for a discovery.
    pub fn note_pending_triage(&self, sig: Sig, source: i64, source_cost: f64) {
        let mut info = self.triage_info.lock().expect("triage info poisoned");
        let entry = info.entry(sig).or_insert_with(|| TriageStats {
            source,
            source_cost,
            ..Default::default()
        });
        entry.triage_total += 1;
    }

    /// Fold a completed sub-triage into its discovery record; drops the
    /// record once every pending sub-triage has reported. Called on every
    /// triage return path, give-ups included.
    pub fn complete_triage(&self, sig: Sig, outcome: &TriageOutcome) {
        let triage_gain_norm = {
            let bandit = self.bandit.lock().expect("bandit poisoned");
            nael(
                outcome.minimize_gain_raw,
                outcome.verify_cost + outcome.minimize_cost,
                &bandit.glc.raw_all,
            )
        };
        let mut info = self.triage_info.lock().expect("triage info poisoned");
        let done = {
            let entry = info.entry(sig).or_insert_with(|| TriageStats {
                source: outcome.source,
                source_cost: outcome.source_cost,
                triage_total: 1,
                ..Default::default()
            });
            entry.triage_count += 1;
            entry.triage_gain += outcome.corpus_gain_raw;
            entry.verify_gain += outcome.verify_gain_raw;
            entry.verify_cost += outcome.verify_cost;
            entry.minimize_gain += outcome.minimize_gain_raw;
            entry.minimize_cost += outcome.minimize_cost;
            entry.minimize_time_save += outcome.minimize_time_save;
            entry.triage_gain_norm = triage_gain_norm;
            entry.done()
        };
        if done {
            info.remove(&sig);
        }
    }
}
