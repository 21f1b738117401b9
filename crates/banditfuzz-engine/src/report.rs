//! Campaign reports.

use crate::scheduler::Scheduler;
use std::sync::atomic::Ordering;

/// End-of-campaign summary.
#[derive(Debug, Clone)]
pub struct CampaignReport {
    pub rounds: u64,
    pub generated: u64,
    pub mutated: u64,
    pub triaged: u64,
    pub executions: u64,
    pub accepted: u64,
    pub corpus_size: usize,
    pub max_signal: usize,
    pub corpus_signal: usize,
    pub bandit_round: u64,
    pub exp31_round: u64,
    pub gamma: f64,
    pub eta: f64,
    /// Probabilities the bandit would offer right now, all arms open.
    pub probabilities: [f64; 3],
}

impl Scheduler {
    pub fn report(&self) -> CampaignReport {
        let counters = &self.counters;
        let bandit = self.bandit.lock().expect("bandit poisoned");
        let probabilities = bandit
            .probabilities(true, true)
            .map(|p| p.pr)
            .unwrap_or([0.0; 3]);
        let corpus = self.corpus.read().expect("corpus poisoned");
        let signal = self.signal.read().expect("signal poisoned");
        CampaignReport {
            rounds: counters.rounds.load(Ordering::Relaxed),
            generated: counters.generated.load(Ordering::Relaxed),
            mutated: counters.mutated.load(Ordering::Relaxed),
            triaged: counters.triaged.load(Ordering::Relaxed),
            executions: counters.executions.load(Ordering::Relaxed),
            accepted: counters.accepted.load(Ordering::Relaxed),
            corpus_size: corpus.len(),
            max_signal: signal.max_len(),
            corpus_signal: signal.corpus_len(),
            bandit_round: bandit.round,
            exp31_round: bandit.exp31_round,
            gamma: bandit.gamma,
            eta: bandit.eta,
            probabilities,
        }
    }
}

/// Render a report for terminal output.
pub fn format_report(report: &CampaignReport) -> String {
    let mut out = String::new();
    out.push_str("=== campaign report ===\n");
    out.push_str(&format!("rounds:        {}\n", report.rounds));
    out.push_str(&format!(
        "dispatches:    {} generate, {} mutate, {} triage\n",
        report.generated, report.mutated, report.triaged
    ));
    out.push_str(&format!("executions:    {}\n", report.executions));
    out.push_str(&format!(
        "corpus:        {} seeds ({} accepted here)\n",
        report.corpus_size, report.accepted
    ));
    out.push_str(&format!(
        "signal:        {} max, {} corpus\n",
        report.max_signal, report.corpus_signal
    ));
    out.push_str(&format!(
        "bandit:        round {}, exp3.1 round {}, gamma {:.4}, eta {:.4}\n",
        report.bandit_round, report.exp31_round, report.gamma, report.eta
    ));
    out.push_str(&format!(
        "probabilities: generate {:.3}, mutate {:.3}, triage {:.3}\n",
        report.probabilities[0], report.probabilities[1], report.probabilities[2]
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::exec::Gate;

    #[test]
    fn test_report_fresh_scheduler() {
        let config = SchedulerConfig {
            exp31: false,
            gamma: 0.0,
            ..Default::default()
        };
        let scheduler = Scheduler::new(config, Gate::new(2, None));
        let report = scheduler.report();
        assert_eq!(report.rounds, 0);
        assert_eq!(report.corpus_size, 0);
        // Untrained bandit offers uniform probabilities.
        for pr in report.probabilities {
            assert!((pr - 1.0 / 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_format_report_mentions_counts() {
        let config = SchedulerConfig {
            exp31: false,
            ..Default::default()
        };
        let scheduler = Scheduler::new(config, Gate::new(2, None));
        let text = format_report(&scheduler.report());
        assert!(text.contains("campaign report"));
        assert!(text.contains("rounds:"));
        assert!(text.contains("probabilities:"));
    }
}
