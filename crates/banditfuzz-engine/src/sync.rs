//! Worker-side synchronization: snapshot out, merge in.
//!
//! The protocol is round-versioned and monotonic. A worker ships its
//! full bandit snapshot plus dirty-set deltas; whichever side of the
//! exchange has the larger round wins wholesale and the other adopts.
//! State never regresses — a stale snapshot is simply not applied.

use crate::program::TestProgram;
use crate::queue::SmashWork;
use crate::scheduler::Scheduler;
use banditfuzz_protocol::{InputRecord, SyncRequest, SyncResponse, SyncStatus};

impl Scheduler {
    /// Snapshot the bandit state and drain the dirty sets into a status
    /// message. Draining means a snapshot is taken at most once per sync
    /// interval; the caller must actually send it.
    pub fn take_status(&self) -> SyncStatus {
        let bandit = self.bandit.lock().expect("bandit poisoned");
        let corpus_delta = self
            .corpus
            .write()
            .expect("corpus poisoned")
            .take_dirty();
        let triage_delta = self
            .triage_info
            .lock()
            .expect("triage info poisoned")
            .clone();
        SyncStatus {
            round: bandit.round,
            exp31_round: bandit.exp31_round,
            mab: bandit.glc,
            corpus_delta,
            triage_delta,
        }
    }

    /// Merge an incoming status. The bandit snapshot and triage entries
    /// are adopted only when the incoming round is strictly ahead; the
    /// corpus delta always patches locally-known seeds (per-seed stats
    /// carry their own progress and last-writer-wins is safe for them).
    pub fn apply_status(&self, incoming: &SyncStatus) {
        {
            let mut bandit = self.bandit.lock().expect("bandit poisoned");
            if incoming.round > bandit.round {
                bandit.adopt(incoming.round, incoming.exp31_round, incoming.mab);
                let mut info = self.triage_info.lock().expect("triage info poisoned");
                for (sig, entry) in &incoming.triage_delta {
                    if entry.triage_count == 0 {
                        // No progress to learn from; keep local view.
                        continue;
                    }
                    info.insert(*sig, *entry);
                }
            }
        }
        let mut corpus = self.corpus.write().expect("corpus poisoned");
        for (sig, stats) in &incoming.corpus_delta {
            if !corpus.apply_delta(sig, stats) {
                log::debug!("stats delta for unknown seed {sig}, awaiting its program");
            }
        }
    }

    /// Build the full sync call payload, draining everything pending.
    pub fn build_sync_request(&self, worker: &str, need_candidates: bool) -> SyncRequest {
        let status = self.take_status();
        let new_inputs = self
            .corpus
            .write()
            .expect("corpus poisoned")
            .take_new_inputs();
        let new_signal = self
            .signal
            .write()
            .expect("signal poisoned")
            .take_new();
        SyncRequest {
            worker: worker.to_string(),
            status,
            new_inputs,
            new_signal,
            need_candidates,
        }
    }

    /// Fold a sync response back in: newer snapshot, candidate corpus
    /// entries, and the coordinator's signal the worker was missing.
    pub fn apply_sync_response(&self, response: &SyncResponse) {
        if let Some(status) = &response.status {
            self.apply_status(status);
        }
        if !response.max_signal.is_empty() {
            self.signal
                .write()
                .expect("signal poisoned")
                .merge_max(&response.max_signal);
        }
        for record in &response.candidates {
            self.apply_candidate(record);
        }
    }

    /// Adopt a corpus entry accepted by another worker: merge its proven
    /// signal, append it, and schedule the smashing it has not had yet.
    pub fn apply_candidate(&self, record: &InputRecord) {
        {
            let mut signal = self.signal.write().expect("signal poisoned");
            signal.merge_max(&record.signal);
            signal.merge_corpus(&record.signal);
        }
        let program = TestProgram::new(record.program.clone());
        let adopted = {
            let mut corpus = self.corpus.write().expect("corpus poisoned");
            corpus.adopt(program.clone(), record.sig, record.signal.clone(), record.stats)
        };
        if adopted.is_none() {
            return;
        }
        let config = &self.config;
        if record.stats.smashed || config.mutate_weight == 0 {
            return;
        }
        // Finish whatever share of the smash budget the seed's history
        // has not covered.
        let mut remaining = config
            .smash_weight
            .saturating_sub(record.stats.mutate_count as usize);
        let mut queue = self.queue.lock().expect("queue poisoned");
        while remaining > 0 {
            let count = remaining.min(config.mutate_weight);
            queue.enqueue_smash(SmashWork {
                program: program.clone(),
                sig: record.sig,
                count,
            });
            remaining -= count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::exec::Gate;
    use banditfuzz_protocol::{SeedStats, Sig, TriageStats};

    fn make_scheduler() -> Scheduler {
        let config = SchedulerConfig {
            exp31: false,
            mutate_weight: 2,
            smash_weight: 6,
            ..Default::default()
        };
        Scheduler::new(config, Gate::new(2, None))
    }

    fn make_record(byte: u8, signal: Vec<u64>) -> InputRecord {
        let program = TestProgram::new(vec![byte]);
        InputRecord {
            sig: program.sig(),
            program: program.data,
            signal,
            stats: SeedStats::default(),
        }
    }

    fn accept_local_seed(scheduler: &Scheduler, byte: u8, signal: Vec<u64>) {
        let program = TestProgram::new(vec![byte]);
        let sig = program.sig();
        scheduler
            .corpus
            .write()
            .unwrap()
            .append(program, sig, signal, SeedStats::default())
            .unwrap();
    }

    #[test]
    fn test_take_status_carries_round_and_deltas() {
        let scheduler = make_scheduler();
        scheduler.begin_round();
        scheduler.begin_round();
        accept_local_seed(&scheduler, 1, vec![10]);
        let status = scheduler.take_status();
        assert_eq!(status.round, 2);
        assert_eq!(status.corpus_delta.len(), 1);
        // Dirty set drained: a second snapshot is empty.
        assert!(scheduler.take_status().corpus_delta.is_empty());
    }

    #[test]
    fn test_apply_status_newer_round_adopts() {
        let scheduler = make_scheduler();
        scheduler.begin_round();
        let mut incoming = SyncStatus {
            round: 10,
            exp31_round: 2,
            ..Default::default()
        };
        incoming.mab.raw_all.update(5.0, 5.0);
        incoming.triage_delta.insert(
            Sig::hash(b"pending"),
            TriageStats {
                triage_count: 1,
                triage_total: 3,
                ..Default::default()
            },
        );
        scheduler.apply_status(&incoming);
        let bandit = scheduler.bandit.lock().unwrap();
        assert_eq!(bandit.round, 10);
        assert_eq!(bandit.exp31_round, 2);
        assert_eq!(bandit.glc.raw_all.count, 1);
        drop(bandit);
        assert_eq!(scheduler.triage_info.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_apply_status_stale_round_ignored() {
        let scheduler = make_scheduler();
        for _ in 0..5 {
            scheduler.begin_round();
        }
        let mut incoming = SyncStatus {
            round: 3,
            ..Default::default()
        };
        incoming.mab.raw_all.update(5.0, 5.0);
        scheduler.apply_status(&incoming);
        let bandit = scheduler.bandit.lock().unwrap();
        assert_eq!(bandit.round, 5);
        assert_eq!(bandit.glc.raw_all.count, 0);
    }

    #[test]
    fn test_apply_status_corpus_delta_always_patches() {
        let scheduler = make_scheduler();
        for _ in 0..5 {
            scheduler.begin_round();
        }
        let record = make_record(1, vec![10]);
        scheduler.apply_candidate(&record);
        // Stale round, but the per-seed stats still land.
        let mut incoming = SyncStatus {
            round: 1,
            ..Default::default()
        };
        incoming.corpus_delta.insert(
            record.sig,
            SeedStats {
                mutate_count: 7,
                ..Default::default()
            },
        );
        scheduler.apply_status(&incoming);
        let corpus = scheduler.corpus.read().unwrap();
        assert_eq!(corpus.entry(0).unwrap().stats.mutate_count, 7);
    }

    #[test]
    fn test_apply_candidate_schedules_remaining_smash() {
        let scheduler = make_scheduler();
        let mut record = make_record(1, vec![10, 11]);
        record.stats.mutate_count = 2;
        scheduler.apply_candidate(&record);
        assert_eq!(scheduler.corpus.read().unwrap().len(), 1);
        // smash budget 6 minus 2 already done → 4 → two bursts of 2.
        assert_eq!(scheduler.queue.lock().unwrap().smash_len(), 2);
        // Signal is adopted into both frontiers.
        let signal = scheduler.signal.read().unwrap();
        assert_eq!(signal.max_len(), 2);
        assert_eq!(signal.corpus_len(), 2);
        // And not re-reported to the coordinator as a local discovery.
        drop(signal);
        assert!(scheduler
            .signal
            .write()
            .unwrap()
            .take_new()
            .is_empty());
    }

    #[test]
    fn test_apply_candidate_smashed_seed_not_requeued() {
        let scheduler = make_scheduler();
        let mut record = make_record(1, vec![10]);
        record.stats.smashed = true;
        scheduler.apply_candidate(&record);
        assert_eq!(scheduler.queue.lock().unwrap().smash_len(), 0);
    }

    #[test]
    fn test_apply_candidate_duplicate_ignored() {
        let scheduler = make_scheduler();
        let record = make_record(1, vec![10]);
        scheduler.apply_candidate(&record);
        scheduler.apply_candidate(&record);
        assert_eq!(scheduler.corpus.read().unwrap().len(), 1);
        // Only the first application queued smash bursts.
        assert_eq!(scheduler.queue.lock().unwrap().smash_len(), 3);
    }

    #[test]
    fn test_build_sync_request_drains_everything() {
        let scheduler = make_scheduler();
        scheduler.begin_round();
        scheduler
            .signal
            .write()
            .unwrap()
            .observe(&[1, 2, 3]);
        accept_local_seed(&scheduler, 9, vec![50]);
        let request = scheduler.build_sync_request("worker-1", true);
        assert_eq!(request.worker, "worker-1");
        assert_eq!(request.status.round, 1);
        assert_eq!(request.new_signal, vec![1, 2, 3]);
        assert_eq!(request.new_inputs.len(), 1);
        assert!(request.need_candidates);
        // All drained.
        let again = scheduler.build_sync_request("worker-1", false);
        assert!(again.new_signal.is_empty());
        assert!(again.new_inputs.is_empty());
    }

    #[test]
    fn test_adopted_candidate_not_pumped_back() {
        let scheduler = make_scheduler();
        scheduler.apply_candidate(&make_record(1, vec![10]));
        let request = scheduler.build_sync_request("worker-1", false);
        assert!(request.new_inputs.is_empty());
        assert!(request.status.corpus_delta.is_empty());
    }
}
