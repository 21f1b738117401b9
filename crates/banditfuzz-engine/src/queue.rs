//! Typed work queue consumed by the dispatch step.
//!
//! Two kinds of deferred work exist: triage of a pending discovery
//! (feeds the Triage arm's availability), and smash runs — focused
//! mutation bursts queued when a seed is first accepted (drained ahead of
//! ordinary seed selection by the Mutate arm).

use crate::program::TestProgram;
use banditfuzz_protocol::Sig;
use std::collections::VecDeque;

/// A candidate discovery awaiting verification and minimization.
#[derive(Clone, Debug)]
pub struct TriageWork {
    pub program: TestProgram,
    pub sig: Sig,
    /// Which operation of the program observed the novel signal.
    pub op: usize,
    /// The novel fingerprints that earned this program a triage slot.
    pub signal: Vec<u64>,
    /// Skip minimization (already-minimal input from another worker).
    pub minimized: bool,
    pub source: i64,
    pub source_cost: f64,
}

/// A focused mutation burst against an accepted seed.
#[derive(Clone, Debug)]
pub struct SmashWork {
    pub program: TestProgram,
    pub sig: Sig,
    /// Mutations to run in this burst.
    pub count: usize,
}

/// FIFO queues per work kind.
#[derive(Debug, Default)]
pub struct WorkQueue {
    triage: VecDeque<TriageWork>,
    smash: VecDeque<SmashWork>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_triage(&mut self, work: TriageWork) {
        self.triage.push_back(work);
    }

    pub fn dequeue_triage(&mut self) -> Option<TriageWork> {
        self.triage.pop_front()
    }

    pub fn enqueue_smash(&mut self, work: SmashWork) {
        self.smash.push_back(work);
    }

    pub fn dequeue_smash(&mut self) -> Option<SmashWork> {
        self.smash.pop_front()
    }

    /// Triage-arm availability for the bandit.
    pub fn triage_len(&self) -> usize {
        self.triage.len()
    }

    pub fn smash_len(&self) -> usize {
        self.smash.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_triage(byte: u8) -> TriageWork {
        let program = TestProgram::new(vec![byte]);
        let sig = program.sig();
        TriageWork {
            program,
            sig,
            op: 0,
            signal: vec![byte as u64],
            minimized: false,
            source: -1,
            source_cost: 0.0,
        }
    }

    #[test]
    fn test_queue_fifo_order() {
        let mut queue = WorkQueue::new();
        queue.enqueue_triage(make_triage(1));
        queue.enqueue_triage(make_triage(2));
        assert_eq!(queue.triage_len(), 2);
        assert_eq!(queue.dequeue_triage().unwrap().program.data, vec![1]);
        assert_eq!(queue.dequeue_triage().unwrap().program.data, vec![2]);
        assert!(queue.dequeue_triage().is_none());
    }

    #[test]
    fn test_queue_kinds_independent() {
        let mut queue = WorkQueue::new();
        let program = TestProgram::new(vec![9]);
        let sig = program.sig();
        queue.enqueue_smash(SmashWork {
            program,
            sig,
            count: 4,
        });
        assert_eq!(queue.smash_len(), 1);
        assert_eq!(queue.triage_len(), 0);
        assert!(queue.dequeue_triage().is_none());
        assert_eq!(queue.dequeue_smash().unwrap().count, 4);
    }
}
