//! The coordinator: one merge point for many workers.
//!
//! Holds the authoritative (furthest-progressed) bandit snapshot, the
//! union of per-seed stats and pending triage records, the global signal
//! frontier, and the program store used to pump corpus entries between
//! workers. Each sync call is transactional — one lock for the whole
//! merge — and calls from different workers interleave freely beyond
//! that.

use crate::signal::SignalSet;
use banditfuzz_protocol::{
    InputRecord, MabGlc, SeedStats, Sig, SyncRequest, SyncResponse, SyncStatus, TriageStats,
};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Per-worker pumping state.
#[derive(Debug, Default)]
struct WorkerView {
    /// Corpus entries this worker has not received yet.
    pending_inputs: Vec<Sig>,
    /// Signal this worker has not received yet.
    pending_signal: Vec<u64>,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    round: u64,
    exp31_round: u64,
    mab: MabGlc,
    corpus: BTreeMap<Sig, SeedStats>,
    triage: BTreeMap<Sig, TriageStats>,
    /// Program store: every accepted input any worker has reported.
    inputs: BTreeMap<Sig, InputRecord>,
    max_signal: SignalSet,
    workers: BTreeMap<String, WorkerView>,
}

/// The central merge point. Cheap to share behind an `Arc`.
pub struct Coordinator {
    state: Mutex<CoordinatorState>,
    batch_size: usize,
}

impl Coordinator {
    pub fn new(batch_size: usize) -> Self {
        Self {
            state: Mutex::new(CoordinatorState::default()),
            batch_size,
        }
    }

    /// Handle one worker sync call.
    pub fn sync(&self, request: &SyncRequest) -> SyncResponse {
        let mut state = self.state.lock().expect("coordinator poisoned");
        let mut response = SyncResponse::default();

        state.register_worker(&request.worker);

        // New signal first: what this worker discovered, the others get.
        let novel = state.max_signal.diff(&request.new_signal);
        if !novel.is_empty() {
            state.max_signal.merge(&novel);
            for (name, view) in state.workers.iter_mut() {
                if name != &request.worker {
                    view.pending_signal.extend_from_slice(&novel);
                }
            }
        }

        // Newly accepted inputs enter the program store and every other
        // worker's pump queue.
        for record in &request.new_inputs {
            if state.inputs.contains_key(&record.sig) {
                log::debug!("duplicate input {} from {}", record.sig, request.worker);
                continue;
            }
            state.inputs.insert(record.sig, record.clone());
            for (name, view) in state.workers.iter_mut() {
                if name != &request.worker {
                    view.pending_inputs.push(record.sig);
                }
            }
        }

        // The round-versioned merge proper.
        state.merge_status(&request.status, &mut response);

        // Pump a bounded candidate batch plus pending signal.
        if request.need_candidates {
            response.candidates = state.pop_candidates(&request.worker, self.batch_size);
        }
        if let Some(view) = state.workers.get_mut(&request.worker) {
            response.max_signal = std::mem::take(&mut view.pending_signal);
        }
        response
    }

    /// Snapshot of the coordinator's corpus stats (for reporting).
    pub fn corpus_len(&self) -> usize {
        self.state.lock().expect("coordinator poisoned").inputs.len()
    }

    pub fn round(&self) -> u64 {
        self.state.lock().expect("coordinator poisoned").round
    }

    pub fn signal_len(&self) -> usize {
        self.state
            .lock()
            .expect("coordinator poisoned")
            .max_signal
            .len()
    }
}

impl CoordinatorState {
    fn register_worker(&mut self, name: &str) {
        if self.workers.contains_key(name) {
            return;
        }
        // A fresh worker gets the whole store pumped.
        let view = WorkerView {
            pending_inputs: self.inputs.keys().copied().collect(),
            pending_signal: self.max_signal.elems(),
        };
        log::info!(
            "worker {} connected ({} inputs, {} signal pending)",
            name,
            view.pending_inputs.len(),
            view.pending_signal.len()
        );
        self.workers.insert(name.to_string(), view);
    }

    /// The monotonic merge: strictly-ahead incoming state is adopted,
    /// strictly-behind earns the full authoritative snapshot in response,
    /// equal rounds exchange nothing.
    fn merge_status(&mut self, incoming: &SyncStatus, response: &mut SyncResponse) {
        if incoming.round > self.round {
            self.round = incoming.round;
            self.exp31_round = incoming.exp31_round;
            self.mab = incoming.mab;
            for (sig, stats) in &incoming.corpus_delta {
                self.corpus.insert(*sig, *stats);
            }
            for (sig, entry) in &incoming.triage_delta {
                if entry.done() {
                    if self.triage.remove(sig).is_some() {
                        log::debug!("triage {} complete, dropping", sig);
                    }
                } else {
                    self.triage.insert(*sig, *entry);
                }
            }
        } else if incoming.round < self.round {
            response.status = Some(SyncStatus {
                round: self.round,
                exp31_round: self.exp31_round,
                mab: self.mab,
                corpus_delta: self.corpus.clone(),
                triage_delta: self.triage.clone(),
            });
        }
        // Equal rounds: nothing to say.
    }

    fn pop_candidates(&mut self, worker: &str, batch_size: usize) -> Vec<InputRecord> {
        let Some(view) = self.workers.get_mut(worker) else {
            return Vec::new();
        };
        let take = view.pending_inputs.len().min(batch_size);
        let sigs: Vec<Sig> = view.pending_inputs.drain(..take).collect();
        sigs.into_iter()
            .filter_map(|sig| {
                let mut record = self.inputs.get(&sig).cloned()?;
                // Ship the freshest stats we have for the seed.
                if let Some(stats) = self.corpus.get(&sig) {
                    record.stats = *stats;
                }
                Some(record)
            })
            .collect()
    }
}
