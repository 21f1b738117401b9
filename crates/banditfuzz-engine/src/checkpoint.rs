//! Checkpoint save/load for resumable campaigns.
//!
//! Saves the durable half of the scheduler: round counters, the bandit
//! accumulators, the corpus (programs, proven signal, stats), and the
//! max-signal frontier. The work queue and pending triage records are
//! NOT saved — in-flight discoveries are cheap to rediscover, and their
//! programs may reference executor state that no longer exists. On
//! resume the corpus is re-adopted entry by entry, so un-smashed seeds
//! get their focused-mutation budget queued again.

use crate::exec::Gate;
use crate::scheduler::Scheduler;
use banditfuzz_protocol::{InputRecord, MabGlc};
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::fs;
use std::path::Path;

/// Errors from checkpoint operations.
#[derive(Debug, Snafu)]
pub enum CheckpointError {
    #[snafu(display("I/O error"), context(false))]
    Io { source: std::io::Error },

    #[snafu(display("JSON error"), context(false))]
    Json { source: serde_json::Error },
}

/// Everything needed to resume a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerCheckpoint {
    pub round: u64,
    pub exp31_round: u64,
    pub mab: MabGlc,
    pub corpus: Vec<InputRecord>,
    pub max_signal: Vec<u64>,
}

impl Scheduler {
    /// Snapshot the durable state.
    pub fn to_checkpoint(&self) -> SchedulerCheckpoint {
        let bandit = self.bandit.lock().expect("bandit poisoned");
        let corpus = self.corpus.read().expect("corpus poisoned");
        let signal = self.signal.read().expect("signal poisoned");
        SchedulerCheckpoint {
            round: bandit.round,
            exp31_round: bandit.exp31_round,
            mab: bandit.glc,
            corpus: corpus
                .entries()
                .iter()
                .map(|e| InputRecord {
                    sig: e.sig,
                    program: e.program.data.clone(),
                    signal: e.signal.clone(),
                    stats: e.stats,
                })
                .collect(),
            max_signal: signal.max_elems(),
        }
    }

    /// Rebuild a scheduler from a checkpoint.
    pub fn from_checkpoint(
        config: crate::config::SchedulerConfig,
        gate: Gate,
        checkpoint: &SchedulerCheckpoint,
    ) -> Self {
        let scheduler = Scheduler::new(config, gate);
        {
            let mut bandit = scheduler.bandit.lock().expect("bandit poisoned");
            bandit.adopt(checkpoint.round, checkpoint.exp31_round, checkpoint.mab);
        }
        scheduler
            .signal
            .write()
            .expect("signal poisoned")
            .merge_max(&checkpoint.max_signal);
        for record in &checkpoint.corpus {
            scheduler.apply_candidate(record);
        }
        log::info!(
            "restored checkpoint: round {}, {} seeds, {} signal",
            checkpoint.round,
            checkpoint.corpus.len(),
            checkpoint.max_signal.len()
        );
        scheduler
    }
}

/// Write a checkpoint as pretty JSON.
pub fn save_checkpoint(
    path: impl AsRef<Path>,
    checkpoint: &SchedulerCheckpoint,
) -> Result<(), CheckpointError> {
    let json = serde_json::to_string_pretty(checkpoint)?;
    fs::write(path, json)?;
    Ok(())
}

/// Read a checkpoint back.
pub fn load_checkpoint(path: impl AsRef<Path>) -> Result<SchedulerCheckpoint, CheckpointError> {
    let json = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::program::TestProgram;
    use banditfuzz_protocol::SeedStats;

    fn make_scheduler() -> Scheduler {
        let config = SchedulerConfig {
            exp31: false,
            ..Default::default()
        };
        Scheduler::new(config, Gate::new(2, None))
    }

    #[test]
    fn test_checkpoint_roundtrip_through_disk() {
        let scheduler = make_scheduler();
        for _ in 0..12 {
            scheduler.begin_round();
        }
        scheduler
            .bandit
            .lock()
            .unwrap()
            .glc
            .raw_all
            .update(6.0, 2.0);
        scheduler.signal.write().unwrap().observe(&[1, 2, 3]);
        let program = TestProgram::new(vec![42]);
        let sig = program.sig();
        scheduler
            .corpus
            .write()
            .unwrap()
            .append(program, sig, vec![1, 2], SeedStats::default())
            .unwrap();

        let dir = std::env::temp_dir().join("banditfuzz_checkpoint_test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("checkpoint.json");

        save_checkpoint(&path, &scheduler.to_checkpoint()).unwrap();
        let loaded = load_checkpoint(&path).unwrap();
        assert_eq!(loaded.round, 12);
        assert_eq!(loaded.corpus.len(), 1);
        assert_eq!(loaded.max_signal, vec![1, 2, 3]);

        let restored = Scheduler::from_checkpoint(
            SchedulerConfig {
                exp31: false,
                ..Default::default()
            },
            Gate::new(2, None),
            &loaded,
        );
        assert_eq!(restored.bandit.lock().unwrap().round, 12);
        assert_eq!(restored.bandit.lock().unwrap().glc.raw_all.total_gain, 6.0);
        assert_eq!(restored.corpus.read().unwrap().len(), 1);
        assert_eq!(restored.signal.read().unwrap().max_len(), 3);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_checkpoint_missing_file() {
        assert!(load_checkpoint("/nonexistent/checkpoint.json").is_err());
    }

    #[test]
    fn test_resume_requeues_unsmashed_seeds() {
        let scheduler = make_scheduler();
        let program = TestProgram::new(vec![42]);
        let sig = program.sig();
        scheduler
            .corpus
            .write()
            .unwrap()
            .append(program, sig, vec![1], SeedStats::default())
            .unwrap();
        let checkpoint = scheduler.to_checkpoint();
        let restored = Scheduler::from_checkpoint(
            SchedulerConfig {
                exp31: false,
                ..Default::default()
            },
            Gate::new(2, None),
            &checkpoint,
        );
        assert!(restored.queue.lock().unwrap().smash_len() > 0);
    }
}
