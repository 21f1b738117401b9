//! CLI binary for banditfuzz scheduler campaigns against a synthetic
//! target.
//!
//! The synthetic target models coverage the way an instrumented program
//! would produce it: a program is a byte sequence, each adjacent byte
//! pair is an "edge" fingerprint, and execution cost grows with program
//! length. That is enough structure for the bandit to have real
//! trade-offs to learn — mutation of a good seed discovers neighboring
//! edges cheaply, generation explores blindly, triage is expensive but
//! grows the corpus.
//!
//! # Usage
//!
//! ```bash
//! # Run a campaign: 4 workers, 2000 rounds each
//! banditfuzz-sim run --workers 4 --rounds 2000
//!
//! # Choose the bandit variant and seed
//! banditfuzz-sim run --algorithm exp3-ix --seed 7
//!
//! # Save checkpoints to a directory (enables resume)
//! banditfuzz-sim run --output results/
//!
//! # Resume a previous campaign
//! banditfuzz-sim resume --corpus results/ --rounds 1000
//! ```
//!
//! # Checkpointing
//!
//! With `--output`, the final scheduler state is saved to
//! `{output}/checkpoint.json`: round counters, bandit accumulators, the
//! corpus (programs + signal + stats) and the max-signal frontier.
//! Pending triage/smash work is not saved; it is rediscovered cheaply
//! after resume.

use banditfuzz_engine::checkpoint::{load_checkpoint, save_checkpoint};
use banditfuzz_engine::config::{Algorithm, SchedulerConfig};
use banditfuzz_engine::coordinator::Coordinator;
use banditfuzz_engine::exec::{ExecError, ExecOutcome, Executor, Gate, OpResult};
use banditfuzz_engine::program::{ProgramSource, TestProgram};
use banditfuzz_engine::report::format_report;
use banditfuzz_engine::scheduler::Scheduler;
use banditfuzz_engine::worker::Worker;
use clap::{Parser, Subcommand};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "banditfuzz-sim")]
#[command(about = "Bandit-scheduled fuzzing campaign against a synthetic target")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a campaign from scratch.
    Run {
        /// Worker threads.
        #[arg(short, long, default_value = "4")]
        workers: usize,

        /// Rounds per worker.
        #[arg(short, long, default_value = "2000")]
        rounds: u64,

        /// Master seed for reproducibility.
        #[arg(short, long, default_value = "42")]
        seed: u64,

        /// Bandit algorithm: "exp3" or "exp3-ix".
        #[arg(short, long, default_value = "exp3")]
        algorithm: String,

        /// Disable the Exp3.1 periodic reset.
        #[arg(long)]
        no_exp31: bool,

        /// Rounds between coordinator syncs.
        #[arg(long, default_value = "50")]
        sync_interval: u64,

        /// Output directory for the final checkpoint.
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Resume a campaign from a checkpoint directory.
    Resume {
        /// Directory holding checkpoint.json from a previous run.
        #[arg(short, long)]
        corpus: String,

        /// Worker threads.
        #[arg(short, long, default_value = "4")]
        workers: usize,

        /// Additional rounds per worker.
        #[arg(short, long, default_value = "2000")]
        rounds: u64,

        /// Master seed.
        #[arg(short, long, default_value = "43")]
        seed: u64,

        /// Rounds between coordinator syncs.
        #[arg(long, default_value = "50")]
        sync_interval: u64,
    },
}

/// Executor over the synthetic edge-coverage target.
///
/// Fingerprints are adjacent byte pairs (`prev << 8 | cur`), op k covers
/// the pair ending at byte k. A 0xFF byte models an operation that fails
/// to execute. Cost is proportional to program length.
struct SimExecutor;

impl Executor for SimExecutor {
    fn execute(&mut self, program: &TestProgram) -> Result<ExecOutcome, ExecError> {
        let mut prev = 0u8;
        let mut ops = Vec::with_capacity(program.data.len());
        for &byte in &program.data {
            let ok = byte != 0xFF;
            let signal = if ok {
                vec![(prev as u64) << 8 | byte as u64]
            } else {
                Vec::new()
            };
            ops.push(OpResult { signal, ok });
            prev = byte;
        }
        Ok(ExecOutcome {
            ops,
            elapsed_ns: 200_000 + 150_000 * program.data.len() as u64,
        })
    }
}

/// Byte-sequence program source: random short programs, single-byte
/// mutations, suffix-dropping minimization.
struct SimSource;

impl ProgramSource for SimSource {
    fn generate(&mut self, rng: &mut dyn RngCore) -> TestProgram {
        let len = 2 + (rng.next_u32() % 7) as usize;
        let mut data = vec![0u8; len];
        rng.fill_bytes(&mut data);
        TestProgram::new(data)
    }

    fn mutate(&mut self, rng: &mut dyn RngCore, base: &TestProgram) -> TestProgram {
        let mut data = base.data.clone();
        match rng.next_u32() % 3 {
            0 if data.len() < 16 => {
                let pos = rng.next_u32() as usize % (data.len() + 1);
                data.insert(pos, rng.next_u32() as u8);
            }
            1 if data.len() > 1 => {
                let pos = rng.next_u32() as usize % data.len();
                data.remove(pos);
            }
            _ => {
                if data.is_empty() {
                    data.push(rng.next_u32() as u8);
                } else {
                    let pos = rng.next_u32() as usize % data.len();
                    data[pos] = rng.next_u32() as u8;
                }
            }
        }
        TestProgram::new(data)
    }

    fn minimize(
        &mut self,
        program: TestProgram,
        keep: &mut dyn FnMut(&TestProgram) -> bool,
    ) -> TestProgram {
        let mut best = program;
        loop {
            if best.data.len() <= 1 {
                return best;
            }
            let candidate = TestProgram::new(best.data[..best.data.len() - 1].to_vec());
            if keep(&candidate) {
                best = candidate;
            } else {
                return best;
            }
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            workers,
            rounds,
            seed,
            algorithm,
            no_exp31,
            sync_interval,
            output,
        } => {
            let algorithm: Algorithm = match algorithm.parse() {
                Ok(algorithm) => algorithm,
                Err(err) => {
                    eprintln!("{err}");
                    std::process::exit(1);
                }
            };
            let config = SchedulerConfig {
                algorithm,
                exp31: !no_exp31,
                retry_backoff: Duration::from_millis(10),
                ..Default::default()
            };
            let scheduler = Arc::new(Scheduler::new(config, make_gate(workers)));
            run_campaign(scheduler, workers, rounds, seed, sync_interval, output);
        }
        Commands::Resume {
            corpus,
            workers,
            rounds,
            seed,
            sync_interval,
        } => {
            let path = Path::new(&corpus).join("checkpoint.json");
            let checkpoint = match load_checkpoint(&path) {
                Ok(checkpoint) => checkpoint,
                Err(err) => {
                    eprintln!("failed to load {}: {err}", path.display());
                    std::process::exit(1);
                }
            };
            let config = SchedulerConfig {
                retry_backoff: Duration::from_millis(10),
                ..Default::default()
            };
            let scheduler = Arc::new(Scheduler::from_checkpoint(
                config,
                make_gate(workers),
                &checkpoint,
            ));
            run_campaign(
                scheduler,
                workers,
                rounds,
                seed,
                sync_interval,
                Some(corpus),
            );
        }
    }
}

fn make_gate(workers: usize) -> Gate {
    // 2 slots per worker; the periodic callback is the campaign's cheap
    // stand-in for expensive diagnostics.
    Gate::new(
        2 * workers.max(1),
        Some(Box::new(|| {
            log::debug!("gate drained, diagnostics checkpoint");
        })),
    )
}

fn run_campaign(
    scheduler: Arc<Scheduler>,
    workers: usize,
    rounds: u64,
    seed: u64,
    sync_interval: u64,
    output: Option<String>,
) {
    let coordinator = Arc::new(Coordinator::new(scheduler.config.batch_size));
    let sync_interval = sync_interval.max(1);
    let mut seed_rng = ChaCha8Rng::seed_from_u64(seed);

    log::info!(
        "starting campaign: {} workers x {} rounds, sync every {}",
        workers,
        rounds,
        sync_interval
    );

    let mut handles = Vec::new();
    for id in 0..workers {
        let scheduler = scheduler.clone();
        let coordinator = coordinator.clone();
        let worker_seed = seed_rng.next_u64();
        handles.push(std::thread::spawn(move || {
            let name = format!("worker-{id}");
            let mut worker = Worker::new(
                name.clone(),
                scheduler.clone(),
                Box::new(SimExecutor),
                Box::new(SimSource),
                worker_seed,
            );
            for round in 1..=rounds {
                if scheduler.shutting_down() {
                    break;
                }
                if let Err(err) = worker.run_round() {
                    log::error!("{name}: fatal: {err}");
                    scheduler.request_shutdown();
                    break;
                }
                if round % sync_interval == 0 {
                    let request = scheduler.build_sync_request(&name, true);
                    let response = coordinator.sync(&request);
                    scheduler.apply_sync_response(&response);
                }
            }
            // Final sync so the coordinator sees the full campaign.
            let request = scheduler.build_sync_request(&name, false);
            coordinator.sync(&request);
        }));
    }
    for handle in handles {
        let _ = handle.join();
    }

    let report = scheduler.report();
    println!("{}", format_report(&report));
    log::info!(
        "coordinator: round {}, {} inputs, {} signal",
        coordinator.round(),
        coordinator.corpus_len(),
        coordinator.signal_len()
    );

    if let Some(dir) = output {
        if let Err(err) = fs::create_dir_all(&dir) {
            log::error!("cannot create {dir}: {err}");
            return;
        }
        let path = Path::new(&dir).join("checkpoint.json");
        match save_checkpoint(&path, &scheduler.to_checkpoint()) {
            Ok(()) => log::info!("checkpoint saved to {}", path.display()),
            Err(err) => log::error!("checkpoint save failed: {err}"),
        }
    }
}
