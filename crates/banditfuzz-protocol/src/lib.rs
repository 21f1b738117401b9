//! Wire types shared between banditfuzz workers and the coordinator.
//!
//! Every record that crosses the worker ↔ coordinator boundary lives here:
//! content hashes, the gain/cost running-statistics accumulator, the bandit
//! state snapshot, per-seed and per-discovery stat records, and the
//! round-versioned sync envelopes. The crate is pure data plus the
//! accumulator arithmetic — no scheduling logic, no I/O.
//!
//! All maps are `BTreeMap` so that serialization and iteration order are
//! deterministic across workers.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

// ═══════════════════════════════════════════════════════════════════════
//  Content hashes
// ═══════════════════════════════════════════════════════════════════════

/// Content hash of a serialized test program (blake3, 32 bytes).
///
/// Used as the stable cross-worker key for corpus entries and pending
/// triage work: indices differ between workers, hashes do not.
/// Serializes as lowercase hex so it can key JSON maps.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sig(pub [u8; 32]);

impl Sig {
    /// Hash raw program bytes.
    pub fn hash(data: &[u8]) -> Self {
        Sig(*blake3::hash(data).as_bytes())
    }
}

impl Serialize for Sig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Sig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        if hex.len() != 64 || !hex.is_ascii() {
            return Err(D::Error::custom("sig must be 64 hex chars"));
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16).map_err(D::Error::custom)?;
        }
        Ok(Sig(bytes))
    }
}

impl fmt::Display for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form; the full hash is noise in logs.
        for b in &self.0[..6] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..")
    }
}

impl Default for Sig {
    fn default() -> Self {
        Sig([0; 32])
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  GLC accumulator
// ═══════════════════════════════════════════════════════════════════════

/// Ceiling for accumulated totals. Prevents the sums from reaching
/// infinity under unbounded accumulation.
pub const GLC_TOTAL_MAX: f64 = 1.0e100;

/// Gain/cost running statistics: count, Σgain, Σgain², Σcost, Σcost².
///
/// `update` and `remove` are exact inverses (modulo clamping), so a caller
/// could maintain a sliding window by removing what it previously added.
/// No scheduler path currently does; `remove` is kept as a correct
/// primitive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Glc {
    pub count: u64,
    pub total_gain: f64,
    pub total_gain2: f64,
    pub total_cost: f64,
    pub total_cost2: f64,
}

impl Glc {
    /// Accumulate one observation. Totals are clamped into
    /// `[-GLC_TOTAL_MAX, GLC_TOTAL_MAX]`.
    pub fn update(&mut self, gain: f64, cost: f64) {
        self.count += 1;
        self.total_gain = clamp_total(self.total_gain + gain);
        self.total_gain2 = clamp_total(self.total_gain2 + gain * gain);
        self.total_cost = clamp_total(self.total_cost + cost);
        self.total_cost2 = clamp_total(self.total_cost2 + cost * cost);
    }

    /// Exact inverse of `update` (no clamping). Only meaningful for
    /// observations previously passed to `update`.
    pub fn remove(&mut self, gain: f64, cost: f64) {
        self.count = self.count.saturating_sub(1);
        self.total_gain -= gain;
        self.total_gain2 -= gain * gain;
        self.total_cost -= cost;
        self.total_cost2 -= cost * cost;
    }
}

fn clamp_total(v: f64) -> f64 {
    v.clamp(-GLC_TOTAL_MAX, GLC_TOTAL_MAX)
}

/// The full accumulator set carried by the bandit scheduler.
///
/// The three `normalized_*` accumulators hold inverse-propensity gain
/// estimates per arm and drive arm weighting. `raw_all`/`nael_all` are the
/// global normalization references; `raw_mutate`/`nael_mutate` are the
/// seed-selection references and see only mutation outcomes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MabGlc {
    pub normalized_generate: Glc,
    pub normalized_mutate: Glc,
    pub normalized_triage: Glc,
    pub raw_all: Glc,
    pub nael_all: Glc,
    pub raw_mutate: Glc,
    pub nael_mutate: Glc,
}

// ═══════════════════════════════════════════════════════════════════════
//  Per-seed and per-discovery stat records
// ═══════════════════════════════════════════════════════════════════════

/// Per-seed statistics, synchronized across workers keyed by [`Sig`].
///
/// Raw cumulative figures (`mutate_gain`, `mutate_cost`, verify/minimize
/// pairs) feed the associative gain split; the `*_norm` figures are the
/// previous round's normalized values that the split diffs against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SeedStats {
    /// Whether this seed's focused-mutation pass has run.
    pub smashed: bool,
    pub mutate_count: u64,
    pub mutate_cost: f64,
    pub mutate_gain: f64,
    pub verify_gain: f64,
    pub verify_cost: f64,
    pub minimize_gain: f64,
    pub minimize_cost: f64,
    pub minimize_time_save: f64,
    pub cost_before_minimize: f64,
    pub mutate_gain_norm: f64,
    pub mutate_gain_norm_orig: f64,
    pub triage_gain_norm: f64,
}

/// Bookkeeping for one pending coverage-increasing discovery.
///
/// Created when the candidate is first queued, updated by each completed
/// verify/minimize sub-phase, deleted once `triage_count` reaches
/// `triage_total`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TriageStats {
    /// Corpus index of the mutation source on the originating worker,
    /// or -1 for a generated program.
    pub source: i64,
    pub source_cost: f64,
    pub triage_gain: f64,
    pub verify_gain: f64,
    pub verify_cost: f64,
    pub minimize_gain: f64,
    pub minimize_cost: f64,
    pub minimize_time_save: f64,
    pub triage_count: u64,
    pub triage_total: u64,
    pub source_gain_norm: f64,
    pub triage_gain_norm: f64,
}

impl TriageStats {
    /// A discovery is done once every queued sub-triage has completed.
    pub fn done(&self) -> bool {
        self.triage_count >= self.triage_total
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Sync envelopes
// ═══════════════════════════════════════════════════════════════════════

/// Round-versioned scheduler state snapshot plus dirty-set deltas.
///
/// `round` is the version: whichever side of a sync call has the larger
/// round wins, wholesale. The delta maps carry only entries touched since
/// the sender's previous sync, bounding payload size.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub round: u64,
    pub exp31_round: u64,
    pub mab: MabGlc,
    pub corpus_delta: BTreeMap<Sig, SeedStats>,
    pub triage_delta: BTreeMap<Sig, TriageStats>,
}

/// A corpus entry in transit: program bytes plus the signal it proved and
/// its current stats. How the bytes decode is the program layer's concern.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InputRecord {
    pub sig: Sig,
    pub program: Vec<u8>,
    pub signal: Vec<u64>,
    pub stats: SeedStats,
}

/// Worker → coordinator sync call payload.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncRequest {
    pub worker: String,
    pub status: SyncStatus,
    /// Inputs this worker accepted into its corpus since the last sync.
    pub new_inputs: Vec<InputRecord>,
    /// Signal fingerprints first observed since the last sync.
    pub new_signal: Vec<u64>,
    pub need_candidates: bool,
}

/// Coordinator → worker sync call response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Present only when the coordinator's state is strictly newer.
    pub status: Option<SyncStatus>,
    /// Corpus entries this worker has not seen yet (bounded batch).
    pub candidates: Vec<InputRecord>,
    /// Signal fingerprints the coordinator knows and the worker did not.
    pub max_signal: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sig_hash_stable() {
        let a = Sig::hash(b"hello");
        let b = Sig::hash(b"hello");
        let c = Sig::hash(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_sig_display_hex() {
        let sig = Sig([0xab; 32]);
        let s = format!("{}", sig);
        assert_eq!(s.len(), 64);
        assert!(s.starts_with("abab"));
    }

    #[test]
    fn test_sig_json_roundtrip() {
        let sig = Sig::hash(b"program");
        let json = serde_json::to_string(&sig).unwrap();
        assert!(json.starts_with('"'));
        let back: Sig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sig);
        assert!(serde_json::from_str::<Sig>("\"zz\"").is_err());
    }

    #[test]
    fn test_glc_update() {
        let mut glc = Glc::default();
        glc.update(3.0, 2.0);
        glc.update(1.0, 4.0);
        assert_eq!(glc.count, 2);
        assert_eq!(glc.total_gain, 4.0);
        assert_eq!(glc.total_gain2, 10.0);
        assert_eq!(glc.total_cost, 6.0);
        assert_eq!(glc.total_cost2, 20.0);
    }

    #[test]
    fn test_glc_update_remove_inverse() {
        let mut glc = Glc::default();
        glc.update(5.0, 1.5);
        let before = glc;
        glc.update(2.5, 0.25);
        glc.remove(2.5, 0.25);
        assert_eq!(glc.count, before.count);
        assert!((glc.total_gain - before.total_gain).abs() < 1e-12);
        assert!((glc.total_gain2 - before.total_gain2).abs() < 1e-12);
        assert!((glc.total_cost - before.total_cost).abs() < 1e-12);
        assert!((glc.total_cost2 - before.total_cost2).abs() < 1e-12);
    }

    #[test]
    fn test_glc_clamps_at_max() {
        let mut glc = Glc::default();
        glc.update(1.0e101, 0.0);
        assert_eq!(glc.total_gain, GLC_TOTAL_MAX);
        // gain² would be 1e202; clamped too.
        assert_eq!(glc.total_gain2, GLC_TOTAL_MAX);
    }

    #[test]
    fn test_glc_clamps_negative() {
        let mut glc = Glc::default();
        glc.update(-1.0e101, 0.0);
        assert_eq!(glc.total_gain, -GLC_TOTAL_MAX);
    }

    #[test]
    fn test_triage_stats_done() {
        let mut t = TriageStats {
            triage_total: 2,
            ..Default::default()
        };
        assert!(!t.done());
        t.triage_count = 2;
        assert!(t.done());
    }

    #[test]
    fn test_sync_status_json_roundtrip() {
        let mut status = SyncStatus {
            round: 7,
            exp31_round: 2,
            ..Default::default()
        };
        status.mab.raw_all.update(10.0, 3.0);
        status
            .corpus_delta
            .insert(Sig::hash(b"seed"), SeedStats::default());
        let json = serde_json::to_string(&status).unwrap();
        let back: SyncStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }
}
