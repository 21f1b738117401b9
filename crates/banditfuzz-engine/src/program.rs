//! Opaque test programs and the generation/mutation collaborator seam.
//!
//! The scheduler never looks inside a program: it hashes the bytes for
//! identity, hands them to the executor, and tracks provenance and cost.
//! How programs are built, mutated, and shrunk is the [`ProgramSource`]
//! implementation's business.

use banditfuzz_protocol::Sig;
use rand::RngCore;

/// A test program as the scheduler sees it: bytes plus provenance.
#[derive(Clone, Debug, PartialEq)]
pub struct TestProgram {
    pub data: Vec<u8>,
    /// Corpus index of the mutation source, or -1 for generated programs.
    pub source: i64,
    /// Last observed execution cost, in cost units.
    pub cost: f64,
}

impl TestProgram {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            source: -1,
            cost: 0.0,
        }
    }

    pub fn sig(&self) -> Sig {
        Sig::hash(&self.data)
    }
}

/// Generates, mutates, and minimizes test programs.
///
/// Minimization repeatedly proposes smaller candidates and asks the
/// supplied predicate whether the candidate still exhibits the behavior
/// being preserved; it must return the smallest accepted candidate.
pub trait ProgramSource: Send {
    fn generate(&mut self, rng: &mut dyn RngCore) -> TestProgram;

    fn mutate(&mut self, rng: &mut dyn RngCore, base: &TestProgram) -> TestProgram;

    fn minimize(
        &mut self,
        program: TestProgram,
        keep: &mut dyn FnMut(&TestProgram) -> bool,
    ) -> TestProgram;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_sig_tracks_bytes() {
        let a = TestProgram::new(vec![1, 2, 3]);
        let b = TestProgram::new(vec![1, 2, 3]);
        let c = TestProgram::new(vec![1, 2, 4]);
        assert_eq!(a.sig(), b.sig());
        assert_ne!(a.sig(), c.sig());
    }

    #[test]
    fn test_program_defaults_unsourced() {
        let p = TestProgram::new(vec![]);
        assert_eq!(p.source, -1);
        assert_eq!(p.cost, 0.0);
    }
}
