//! The per-worker round loop.
//!
//! `Idle → select arm → dispatch → attribute → Idle`, forever. Dispatch
//! is the only place the worker blocks: at the admission gate around each
//! execution, and inside the executor itself. A dispatched round always
//! reaches attribution — there is no mid-round cancellation, shutdown is
//! observed between rounds.

use crate::bandit::Arm;
use crate::exec::{ExecError, ExecOutcome, Executor};
use crate::program::{ProgramSource, TestProgram};
use crate::queue::{SmashWork, TriageWork};
use crate::scheduler::{ExecStats, Outcome, Scheduler, TriageOutcome};
use banditfuzz_protocol::SeedStats;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;

/// Worker-fatal errors. Anything transient is retried below this layer.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("executor failed permanently: {0}")]
    Executor(String),

    #[error("executor still failing after {tries} retries: {last}")]
    RetriesExhausted { tries: usize, last: String },
}

/// One fuzzing worker: a scheduler handle plus its private collaborators.
pub struct Worker {
    name: String,
    scheduler: Arc<Scheduler>,
    executor: Box<dyn Executor>,
    source: Box<dyn ProgramSource>,
    rng: ChaCha8Rng,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        scheduler: Arc<Scheduler>,
        executor: Box<dyn Executor>,
        source: Box<dyn ProgramSource>,
        seed: u64,
    ) -> Self {
        Self {
            name: name.into(),
            scheduler,
            executor,
            source,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run rounds until shutdown. Returns only on shutdown or a fatal
    /// executor error.
    pub fn run(&mut self) -> Result<(), WorkerError> {
        while !self.scheduler.shutting_down() {
            self.run_round()?;
        }
        log::info!("worker {} shutting down", self.name);
        Ok(())
    }

    /// One full round of the state machine.
    pub fn run_round(&mut self) -> Result<(), WorkerError> {
        let round = self.scheduler.begin_round();
        self.scheduler.counters.rounds.fetch_add(1, Ordering::Relaxed);

        if round <= self.scheduler.config.generate_first {
            // Warmup: seed the raw accumulators with an exchange rate
            // before the bandit starts steering.
            let mut program = self.source.generate(&mut self.rng);
            self.execute_with_gain(&mut program, true, false)?;
            self.scheduler
                .counters
                .generated
                .fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        if self.scheduler.config.triage_first {
            let work = self.scheduler.queue.lock().expect("queue poisoned").dequeue_triage();
            if let Some(work) = work {
                // Preempts the bandit entirely; no attribution.
                self.triage_work(work)?;
                return Ok(());
            }
        }

        let Some((arm, probs)) = self.scheduler.select_arm(&mut self.rng) else {
            return Ok(());
        };
        let outcome = match arm {
            Arm::Generate => Some(Outcome::Generate(self.do_generate()?)),
            Arm::Mutate => self.do_mutate()?.map(Outcome::Mutate),
            Arm::Triage => self.do_triage()?.map(Outcome::Triage),
        };
        if let Some(outcome) = outcome {
            self.scheduler.attribute(outcome, &probs);
        }
        Ok(())
    }

    fn do_generate(&mut self) -> Result<ExecStats, WorkerError> {
        let mut program = self.source.generate(&mut self.rng);
        let (gain, cost) = self.execute_with_gain(&mut program, true, false)?;
        self.scheduler
            .counters
            .generated
            .fetch_add(1, Ordering::Relaxed);
        Ok(ExecStats {
            gain_raw: gain,
            cost,
            cost_total: cost,
            pidx: -1,
        })
    }

    /// Mutate dispatch: drain a queued smash burst if one exists,
    /// otherwise draw a seed and run the configured mutation burst.
    fn do_mutate(&mut self) -> Result<Option<ExecStats>, WorkerError> {
        let smash = self.scheduler.queue.lock().expect("queue poisoned").dequeue_smash();
        if let Some(work) = smash {
            return self.do_smash(work).map(Some);
        }
        let (pidx, base) = {
            let corpus = self.scheduler.corpus.read().expect("corpus poisoned");
            match corpus.choose(&mut self.rng) {
                Some(idx) => (idx, corpus.entry(idx).expect("chosen index").program.clone()),
                None => {
                    // Raced an empty corpus after the availability check.
                    log::warn!("mutate selected with empty corpus, skipping round");
                    return Ok(None);
                }
            }
        };
        let mut stats = ExecStats {
            pidx: pidx as i64,
            ..Default::default()
        };
        for _ in 0..self.scheduler.config.mutate_weight {
            let mut program = self.source.mutate(&mut self.rng, &base);
            program.source = pidx as i64;
            let (gain, cost) = self.execute_with_gain(&mut program, true, false)?;
            stats.gain_raw += gain;
            stats.cost += cost;
        }
        stats.cost_total = stats.cost;
        self.scheduler
            .counters
            .mutated
            .fetch_add(1, Ordering::Relaxed);
        Ok(Some(stats))
    }

    /// A queued focused-mutation burst against one accepted seed.
    fn do_smash(&mut self, work: SmashWork) -> Result<ExecStats, WorkerError> {
        let pidx = {
            let mut corpus = self.scheduler.corpus.write().expect("corpus poisoned");
            match corpus.lookup(&work.sig) {
                Some(idx) => {
                    if let Some(stats) = corpus.stats_mut(idx) {
                        stats.smashed = true;
                    }
                    idx as i64
                }
                None => -1,
            }
        };
        let mut stats = ExecStats {
            pidx,
            ..Default::default()
        };
        for _ in 0..work.count {
            let mut program = self.source.mutate(&mut self.rng, &work.program);
            program.source = pidx;
            let (gain, cost) = self.execute_with_gain(&mut program, true, false)?;
            stats.gain_raw += gain;
            stats.cost += cost;
        }
        stats.cost_total = stats.cost;
        self.scheduler
            .counters
            .mutated
            .fetch_add(1, Ordering::Relaxed);
        Ok(stats)
    }

    fn do_triage(&mut self) -> Result<Option<TriageOutcome>, WorkerError> {
        let work = self.scheduler.queue.lock().expect("queue poisoned").dequeue_triage();
        match work {
            Some(work) => self.triage_work(work).map(Some),
            None => {
                log::warn!("triage selected with empty queue, skipping round");
                Ok(None)
            }
        }
    }

    /// Verify a discovery reproduces, minimize it, accept it.
    fn triage_work(&mut self, work: TriageWork) -> Result<TriageOutcome, WorkerError> {
        let mut ret = TriageOutcome {
            source: work.source,
            source_sig: work.sig,
            source_cost: work.source_cost,
            pidx: -1,
            ..Default::default()
        };
        self.scheduler
            .counters
            .triaged
            .fetch_add(1, Ordering::Relaxed);

        // Is the discovery still novel relative to the accepted corpus?
        let mut new_signal = {
            let signal = self.scheduler.signal.read().expect("signal poisoned");
            signal.corpus_diff(&work.signal)
        };
        if new_signal.is_empty() {
            log::debug!("discovery {} no longer novel", work.sig);
            self.scheduler.complete_triage(work.sig, &ret);
            return Ok(ret);
        }

        // Verification: re-execute and intersect, dropping flaky signal.
        let verify_runs = self.scheduler.config.verify_runs;
        let mut not_executed = 0;
        for run in 0..verify_runs {
            let outcome = run_program(&self.scheduler, self.executor.as_mut(), &work.program)?;
            let cost = outcome.elapsed_ns as f64 / self.scheduler.config.time_unit;
            ret.verify_cost += cost;
            let op = outcome.ops.get(work.op);
            let ok = op.map(|o| o.ok && !o.signal.is_empty()).unwrap_or(false);
            if !ok {
                not_executed += 1;
                if not_executed > verify_runs / 2 + 1 {
                    log::debug!("discovery {} stopped reproducing, giving up", work.sig);
                    self.scheduler.complete_triage(work.sig, &ret);
                    return Ok(ret);
                }
                continue;
            }
            let this_signal = &op.expect("checked ok").signal;
            ret.verify_gain_raw += {
                let mut signal = self.scheduler.signal.write().expect("signal poisoned");
                signal.observe(this_signal).len() as f64
            };
            new_signal.retain(|e| this_signal.contains(e));
            if new_signal.is_empty() && !work.minimized {
                log::debug!("discovery {} signal flaky on run {run}, giving up", work.sig);
                self.scheduler.complete_triage(work.sig, &ret);
                return Ok(ret);
            }
        }

        // A reproduced discovery refines our idea of its execution cost.
        ret.source_cost = if ret.source_cost == 0.0 {
            ret.verify_cost / verify_runs as f64
        } else {
            (ret.verify_cost + ret.source_cost) / (verify_runs + 1) as f64
        };

        // Minimization: shrink while the stable signal survives.
        let mut program = work.program.clone();
        let mut time_after = ret.source_cost;
        if !work.minimized {
            let scheduler = self.scheduler.clone();
            let executor = self.executor.as_mut();
            let attempts = self.scheduler.config.minimize_attempts;
            let mut minimize_cost = 0.0;
            let mut minimize_gain = 0.0;
            let mut exec_failure = None;
            program = self.source.minimize(program, &mut |candidate| {
                let mut t_avg = 0.0;
                for attempt in 0..attempts {
                    let outcome = match run_program(&scheduler, &mut *executor, candidate) {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            exec_failure = Some(err);
                            return false;
                        }
                    };
                    let cost = outcome.elapsed_ns as f64 / scheduler.config.time_unit;
                    minimize_cost += cost;
                    t_avg += cost;
                    let this_signal = outcome.signal();
                    minimize_gain += {
                        let mut signal = scheduler.signal.write().expect("signal poisoned");
                        signal.observe(&this_signal).len() as f64
                    };
                    if new_signal.iter().all(|e| this_signal.contains(e)) {
                        time_after = t_avg / (attempt + 1) as f64;
                        return true;
                    }
                }
                false
            });
            if let Some(err) = exec_failure {
                return Err(err);
            }
            ret.minimize_cost = minimize_cost;
            ret.minimize_gain_raw = minimize_gain;
        }
        ret.minimize_time_save = ret.source_cost - time_after;
        ret.corpus_gain_raw = new_signal.len() as f64;
        ret.success = true;

        // Acceptance: corpus entry, signal frontier, smash scheduling.
        let sig = program.sig();
        {
            let mut signal = self.scheduler.signal.write().expect("signal poisoned");
            signal.merge_corpus(&new_signal);
        }
        let stats = SeedStats {
            verify_gain: ret.verify_gain_raw,
            verify_cost: ret.verify_cost,
            minimize_gain: ret.minimize_gain_raw,
            minimize_cost: ret.minimize_cost,
            minimize_time_save: ret.minimize_time_save,
            cost_before_minimize: ret.source_cost,
            ..Default::default()
        };
        let appended = {
            let mut corpus = self.scheduler.corpus.write().expect("corpus poisoned");
            corpus.append(program.clone(), sig, new_signal.clone(), stats)
        };
        if let Some(pidx) = appended {
            ret.pidx = pidx as i64;
            self.scheduler
                .counters
                .accepted
                .fetch_add(1, Ordering::Relaxed);
            log::info!(
                "worker {}: accepted {} ({} new signal)",
                self.name,
                sig,
                new_signal.len()
            );
            self.schedule_smash(&program, sig);
        }
        self.scheduler.complete_triage(work.sig, &ret);
        Ok(ret)
    }

    /// Queue the focused-mutation bursts a fresh seed gets.
    fn schedule_smash(&self, program: &TestProgram, sig: banditfuzz_protocol::Sig) {
        let config = &self.scheduler.config;
        if config.mutate_weight == 0 {
            return;
        }
        let bursts = config.smash_weight / config.mutate_weight;
        let mut queue = self.scheduler.queue.lock().expect("queue poisoned");
        for _ in 0..bursts {
            queue.enqueue_smash(SmashWork {
                program: program.clone(),
                sig,
                count: config.mutate_weight,
            });
        }
    }

    /// Execute a program, fold per-op signal into the max frontier, and
    /// enqueue triage work for every op that observed something novel.
    fn execute_with_gain(
        &mut self,
        program: &mut TestProgram,
        enqueue_triage: bool,
        minimized: bool,
    ) -> Result<(f64, f64), WorkerError> {
        let outcome = run_program(&self.scheduler, self.executor.as_mut(), program)?;
        let cost = outcome.elapsed_ns as f64 / self.scheduler.config.time_unit;
        program.cost = cost;
        let mut gain = 0.0;
        for (op, result) in outcome.ops.iter().enumerate() {
            let novel = {
                let mut signal = self.scheduler.signal.write().expect("signal poisoned");
                signal.observe(&result.signal)
            };
            if novel.is_empty() {
                continue;
            }
            gain += novel.len() as f64;
            if enqueue_triage {
                let sig = program.sig();
                self.scheduler
                    .note_pending_triage(sig, program.source, program.cost);
                self.scheduler
                    .queue
                    .lock()
                    .expect("queue poisoned")
                    .enqueue_triage(TriageWork {
                        program: program.clone(),
                        sig,
                        op,
                        signal: novel,
                        minimized,
                        source: program.source,
                        source_cost: cost,
                    });
            }
        }
        Ok((gain, cost))
    }
}

/// Execute through the admission gate with bounded retries.
///
/// Free function so the minimization closure can call it while
/// `ProgramSource::minimize` holds the source borrow.
pub(crate) fn run_program(
    scheduler: &Scheduler,
    executor: &mut dyn Executor,
    program: &TestProgram,
) -> Result<ExecOutcome, WorkerError> {
    let _slot = scheduler.gate.enter();
    let mut tries = 0;
    loop {
        scheduler
            .counters
            .executions
            .fetch_add(1, Ordering::Relaxed);
        match executor.execute(program) {
            Ok(outcome) => return Ok(outcome),
            Err(ExecError::Fatal(msg)) => return Err(WorkerError::Executor(msg)),
            Err(ExecError::Transient(msg)) => {
                tries += 1;
                if tries > scheduler.config.execute_retries {
                    return Err(WorkerError::RetriesExhausted { tries, last: msg });
                }
                log::debug!("executor failure '{msg}', retry #{tries}");
                std::thread::sleep(scheduler.config.retry_backoff);
            }
        }
    }
}
