//! Corpus of accepted seeds with bandit-weighted selection.
//!
//! Append-only: a seed that made it through triage is never evicted, and
//! its index stays valid for the life of the worker. Selection draws
//! proportionally to per-seed weights via a prefix-sum array; weight
//! updates after an attributable outcome patch the affected suffix.

use crate::config::SchedulerConfig;
use crate::program::TestProgram;
use banditfuzz_protocol::{InputRecord, SeedStats, Sig};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};

/// Seed-selection weight clamps.
const PRIO_MAX_EXP: f64 = 64.0;

/// One accepted seed.
#[derive(Clone, Debug)]
pub struct SeedEntry {
    pub sig: Sig,
    pub program: TestProgram,
    /// The fingerprints the seed proved at acceptance.
    pub signal: Vec<u64>,
    pub stats: SeedStats,
}

/// The corpus: seeds, hash index, and the weighted-selection arrays.
#[derive(Debug)]
pub struct Corpus {
    entries: Vec<SeedEntry>,
    index: BTreeMap<Sig, usize>,
    prios: Vec<f64>,
    prios_sum: Vec<f64>,
    sum_prios: f64,
    /// Entries touched since the last sync.
    dirty: BTreeSet<usize>,
    /// Entries appended since the last sync (for corpus pumping).
    appended: Vec<usize>,
    corpus_eta: f64,
    corpus_gamma: f64,
    bandit_seed_selection: bool,
}

impl Corpus {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            entries: Vec::new(),
            index: BTreeMap::new(),
            prios: Vec::new(),
            prios_sum: Vec::new(),
            sum_prios: 0.0,
            dirty: BTreeSet::new(),
            appended: Vec::new(),
            corpus_eta: config.corpus_eta,
            corpus_gamma: config.corpus_gamma,
            bandit_seed_selection: config.bandit_seed_selection,
        }
    }

    /// Append a seed, returning its index, or `None` for a duplicate sig.
    pub fn append(
        &mut self,
        program: TestProgram,
        sig: Sig,
        signal: Vec<u64>,
        stats: SeedStats,
    ) -> Option<usize> {
        if self.index.contains_key(&sig) {
            return None;
        }
        let prio = if self.bandit_seed_selection {
            clamp_prio((self.corpus_eta * stats.mutate_gain_norm_orig).exp())
        } else {
            (signal.len() as f64).max(1.0)
        };
        let idx = self.entries.len();
        self.entries.push(SeedEntry {
            sig,
            program,
            signal,
            stats,
        });
        self.index.insert(sig, idx);
        self.sum_prios += prio;
        self.prios.push(prio);
        self.prios_sum.push(self.sum_prios);
        self.dirty.insert(idx);
        self.appended.push(idx);
        Some(idx)
    }

    /// Append a seed learned from the coordinator. Same as [`append`]
    /// except the entry is neither re-pumped nor re-reported: its origin
    /// already knows it.
    ///
    /// [`append`]: Corpus::append
    pub fn adopt(
        &mut self,
        program: TestProgram,
        sig: Sig,
        signal: Vec<u64>,
        stats: SeedStats,
    ) -> Option<usize> {
        let idx = self.append(program, sig, signal, stats)?;
        self.appended.pop();
        self.dirty.remove(&idx);
        Some(idx)
    }

    /// Weighted random seed choice: binary-search the prefix sums for the
    /// first index covering the drawn mass.
    pub fn choose(&self, rng: &mut impl Rng) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let u = rng.gen::<f64>() * self.sum_prios;
        let mut idx = self.prios_sum.partition_point(|&s| s < u);
        if idx >= self.entries.len() {
            // Prefix-sum invariant violated (or u landed on the boundary
            // via fp rounding); clamp and flag.
            log::warn!("seed choice out of bounds: {}/{}", idx, self.entries.len());
            idx = self.entries.len() - 1;
        }
        Some(idx)
    }

    /// Fold a normalized gain estimate into seed `idx`'s selection weight
    /// and repair the prefix sums from `idx` onward.
    pub fn update_weight(&mut self, idx: usize, estimate: f64) {
        if idx >= self.entries.len() {
            log::warn!("weight update for missing seed {idx}");
            return;
        }
        let stats = &mut self.entries[idx].stats;
        stats.mutate_gain_norm_orig += estimate / (self.prios[idx] + self.corpus_gamma);
        let prio = clamp_prio((self.corpus_eta * stats.mutate_gain_norm_orig).exp());
        self.prios[idx] = prio;
        self.prios_sum[idx] = if idx == 0 {
            prio
        } else {
            self.prios_sum[idx - 1] + prio
        };
        for i in idx + 1..self.entries.len() {
            self.prios_sum[i] = self.prios_sum[i - 1] + self.prios[i];
        }
        // Recompute the total from the last prefix entry so fp error
        // cannot leak between the two representations.
        self.sum_prios = *self.prios_sum.last().expect("corpus non-empty");
        self.dirty.insert(idx);
    }

    pub fn lookup(&self, sig: &Sig) -> Option<usize> {
        self.index.get(sig).copied()
    }

    pub fn entry(&self, idx: usize) -> Option<&SeedEntry> {
        self.entries.get(idx)
    }

    /// Mutable stats access for attribution; marks the seed dirty.
    pub fn stats_mut(&mut self, idx: usize) -> Option<&mut SeedStats> {
        if idx < self.entries.len() {
            self.dirty.insert(idx);
            self.entries.get_mut(idx).map(|e| &mut e.stats)
        } else {
            None
        }
    }

    /// Patch a locally-known seed's stats from a sync delta. Unknown sigs
    /// are skipped (their program bytes arrive separately as candidates).
    pub fn apply_delta(&mut self, sig: &Sig, stats: &SeedStats) -> bool {
        match self.index.get(sig) {
            Some(&idx) => {
                self.entries[idx].stats = *stats;
                true
            }
            None => false,
        }
    }

    /// Drain the dirty set into a sig-keyed delta map for sync.
    pub fn take_dirty(&mut self) -> BTreeMap<Sig, SeedStats> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty
            .into_iter()
            .filter_map(|idx| self.entries.get(idx).map(|e| (e.sig, e.stats)))
            .collect()
    }

    /// Drain the entries appended since the last sync as full records
    /// (the program bytes other workers need).
    pub fn take_new_inputs(&mut self) -> Vec<InputRecord> {
        let appended = std::mem::take(&mut self.appended);
        appended
            .into_iter()
            .filter_map(|idx| self.entries.get(idx))
            .map(|e| InputRecord {
                sig: e.sig,
                program: e.program.data.clone(),
                signal: e.signal.clone(),
                stats: e.stats,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn sum_prios(&self) -> f64 {
        self.sum_prios
    }

    pub fn prios_sum(&self) -> &[f64] {
        &self.prios_sum
    }

    pub fn entries(&self) -> &[SeedEntry] {
        &self.entries
    }
}

fn clamp_prio(prio: f64) -> f64 {
    prio.clamp((-PRIO_MAX_EXP).exp(), PRIO_MAX_EXP.exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn make_corpus() -> Corpus {
        let config = SchedulerConfig {
            bandit_seed_selection: true,
            corpus_eta: 0.1,
            corpus_gamma: 0.1,
            ..Default::default()
        };
        Corpus::new(&config)
    }

    fn add_seed(corpus: &mut Corpus, byte: u8, signal_len: usize) -> usize {
        let program = TestProgram::new(vec![byte]);
        let sig = program.sig();
        let signal = (0..signal_len as u64).collect();
        corpus
            .append(program, sig, signal, SeedStats::default())
            .unwrap()
    }

    fn assert_prefix_invariant(corpus: &Corpus) {
        let mut acc = 0.0;
        for (i, &s) in corpus.prios_sum().iter().enumerate() {
            acc += corpus.prios[i];
            assert!((s - acc).abs() < 1e-9, "prefix sum broken at {i}");
        }
        assert_eq!(corpus.sum_prios(), *corpus.prios_sum().last().unwrap());
    }

    #[test]
    fn test_append_assigns_indices() {
        let mut corpus = make_corpus();
        assert_eq!(add_seed(&mut corpus, 1, 5), 0);
        assert_eq!(add_seed(&mut corpus, 2, 5), 1);
        assert_eq!(corpus.len(), 2);
        assert_prefix_invariant(&corpus);
    }

    #[test]
    fn test_append_rejects_duplicates() {
        let mut corpus = make_corpus();
        add_seed(&mut corpus, 1, 5);
        let program = TestProgram::new(vec![1]);
        let sig = program.sig();
        assert!(corpus
            .append(program, sig, vec![0, 1], SeedStats::default())
            .is_none());
        assert_eq!(corpus.len(), 1);
    }

    #[test]
    fn test_initial_prio_neutral_bandit() {
        // Fresh stats → exp(eta * 0) = 1.0 under bandit selection.
        let mut corpus = make_corpus();
        add_seed(&mut corpus, 1, 100);
        assert_eq!(corpus.prios[0], 1.0);
        assert_eq!(corpus.sum_prios(), 1.0);
    }

    #[test]
    fn test_initial_prio_signal_proportional() {
        let config = SchedulerConfig {
            bandit_seed_selection: false,
            ..Default::default()
        };
        let mut corpus = Corpus::new(&config);
        add_seed(&mut corpus, 1, 40);
        add_seed(&mut corpus, 2, 0); // empty signal floors at 1.0
        assert_eq!(corpus.prios, vec![40.0, 1.0]);
    }

    #[test]
    fn test_choose_single_entry() {
        let mut corpus = make_corpus();
        add_seed(&mut corpus, 1, 5);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..16 {
            assert_eq!(corpus.choose(&mut rng), Some(0));
        }
    }

    #[test]
    fn test_choose_empty_corpus() {
        let corpus = make_corpus();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        assert_eq!(corpus.choose(&mut rng), None);
    }

    #[test]
    fn test_choose_respects_weights() {
        let mut corpus = make_corpus();
        add_seed(&mut corpus, 1, 5);
        add_seed(&mut corpus, 2, 5);
        // Push seed 1's weight to the e^64 cap; draws should land there
        // essentially always.
        corpus.update_weight(1, 1.0e6);
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let picks: Vec<_> = (0..64).map(|_| corpus.choose(&mut rng).unwrap()).collect();
        assert!(picks.iter().all(|&i| i == 1));
    }

    #[test]
    fn test_update_weight_patches_suffix() {
        let mut corpus = make_corpus();
        for b in 0..5 {
            add_seed(&mut corpus, b, 5);
        }
        corpus.update_weight(1, 2.0);
        assert_prefix_invariant(&corpus);
        corpus.update_weight(4, -3.0);
        assert_prefix_invariant(&corpus);
        corpus.update_weight(0, 0.5);
        assert_prefix_invariant(&corpus);
    }

    #[test]
    fn test_update_weight_clamps() {
        let mut corpus = make_corpus();
        add_seed(&mut corpus, 1, 5);
        corpus.update_weight(0, 1.0e9);
        assert!(corpus.prios[0] <= PRIO_MAX_EXP.exp());
        corpus.update_weight(0, -1.0e12);
        assert!(corpus.prios[0] >= (-PRIO_MAX_EXP).exp());
        assert_prefix_invariant(&corpus);
    }

    #[test]
    fn test_update_weight_missing_seed_noop() {
        let mut corpus = make_corpus();
        add_seed(&mut corpus, 1, 5);
        corpus.update_weight(7, 1.0);
        assert_prefix_invariant(&corpus);
    }

    #[test]
    fn test_take_new_inputs_drains() {
        let mut corpus = make_corpus();
        add_seed(&mut corpus, 1, 2);
        add_seed(&mut corpus, 2, 3);
        let inputs = corpus.take_new_inputs();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0].program, vec![1]);
        assert_eq!(inputs[1].signal.len(), 3);
        assert!(corpus.take_new_inputs().is_empty());
        // Weight updates do not re-pump the program bytes.
        corpus.update_weight(0, 1.0);
        assert!(corpus.take_new_inputs().is_empty());
    }

    #[test]
    fn test_dirty_tracking() {
        let mut corpus = make_corpus();
        add_seed(&mut corpus, 1, 5);
        add_seed(&mut corpus, 2, 5);
        let delta = corpus.take_dirty();
        assert_eq!(delta.len(), 2);
        // Drained; nothing dirty until touched again.
        assert!(corpus.take_dirty().is_empty());
        corpus.stats_mut(1).unwrap().mutate_count += 1;
        let delta = corpus.take_dirty();
        assert_eq!(delta.len(), 1);
        assert_eq!(delta.values().next().unwrap().mutate_count, 1);
    }

    #[test]
    fn test_apply_delta_known_and_unknown() {
        let mut corpus = make_corpus();
        add_seed(&mut corpus, 1, 5);
        let sig = corpus.entry(0).unwrap().sig;
        let stats = SeedStats {
            mutate_count: 9,
            ..Default::default()
        };
        assert!(corpus.apply_delta(&sig, &stats));
        assert_eq!(corpus.entry(0).unwrap().stats.mutate_count, 9);
        assert!(!corpus.apply_delta(&Sig::hash(b"unknown"), &stats));
    }
}
