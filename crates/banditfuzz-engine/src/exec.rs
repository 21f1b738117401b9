//! Execution collaborator seam and the admission gate.
//!
//! The scheduler treats execution as an opaque, retryable call: hand over
//! program bytes, get back per-operation signal and an elapsed cost.
//! The [`Gate`] bounds how many executions are in flight system-wide and
//! doubles as the checkpoint where periodic expensive diagnostics run,
//! once the window has drained.

use crate::program::TestProgram;
use std::sync::{Condvar, Mutex};
use thiserror::Error;

/// Result of one operation within an executed program.
#[derive(Clone, Debug, Default)]
pub struct OpResult {
    /// Raw signal fingerprints observed while running this operation.
    pub signal: Vec<u64>,
    /// Whether the operation actually executed (vs. skipped/failed).
    pub ok: bool,
}

/// Result of executing a whole program.
#[derive(Clone, Debug, Default)]
pub struct ExecOutcome {
    pub ops: Vec<OpResult>,
    pub elapsed_ns: u64,
}

impl ExecOutcome {
    /// Union of all per-op signal.
    pub fn signal(&self) -> Vec<u64> {
        let mut all = Vec::new();
        for op in &self.ops {
            all.extend_from_slice(&op.signal);
        }
        all
    }
}

/// Execution errors. Transient errors are retried a bounded number of
/// times by the worker; anything past the bound is fatal for that worker.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("transient executor failure: {0}")]
    Transient(String),

    #[error("executor failed permanently: {0}")]
    Fatal(String),
}

/// Runs test programs. Implementations own sandboxing, instrumentation,
/// and signal extraction; the scheduler only sees the outcome.
pub trait Executor: Send {
    fn execute(&mut self, program: &TestProgram) -> Result<ExecOutcome, ExecError>;
}

struct GateInner {
    in_flight: usize,
    admitted: u64,
    draining: bool,
}

/// Bounded admission gate with a periodic drain-and-diagnose checkpoint.
///
/// At most `capacity` executions run concurrently. When a callback is
/// installed, every `period` admissions the gate stops admitting, waits
/// for in-flight work to finish, runs the callback, then reopens. The
/// callback therefore never observes a half-finished execution.
pub struct Gate {
    inner: Mutex<GateInner>,
    cond: Condvar,
    capacity: usize,
    period: u64,
    callback: Option<Box<dyn Fn() + Send + Sync>>,
}

impl Gate {
    pub fn new(capacity: usize, callback: Option<Box<dyn Fn() + Send + Sync>>) -> Self {
        assert!(capacity > 0);
        Self {
            inner: Mutex::new(GateInner {
                in_flight: 0,
                admitted: 0,
                draining: false,
            }),
            cond: Condvar::new(),
            period: 2 * capacity as u64,
            capacity,
            callback,
        }
    }

    /// Block until a slot is free, then occupy it for the guard's
    /// lifetime.
    pub fn enter(&self) -> GateGuard<'_> {
        let mut inner = self.inner.lock().expect("gate poisoned");
        while inner.draining || inner.in_flight >= self.capacity {
            inner = self.cond.wait(inner).expect("gate poisoned");
        }
        inner.in_flight += 1;
        inner.admitted += 1;
        if self.callback.is_some() && inner.admitted % self.period == 0 {
            inner.draining = true;
        }
        GateGuard { gate: self }
    }

    fn leave(&self) {
        let mut inner = self.inner.lock().expect("gate poisoned");
        inner.in_flight -= 1;
        if inner.draining && inner.in_flight == 0 {
            if let Some(cb) = &self.callback {
                cb();
            }
            inner.draining = false;
        }
        drop(inner);
        self.cond.notify_all();
    }
}

/// RAII occupation of one gate slot.
pub struct GateGuard<'a> {
    gate: &'a Gate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.leave();
    }
}
