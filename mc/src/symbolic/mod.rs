//! The symbolic-execution collaborator boundary.
//!
//! The engine itself never interprets formulas: tainted bytes carry opaque
//! blobs produced by per-domain [`Lifter`]s, accumulated into a
//! [`PathCondition`], and the SMT side is consulted through the
//! [`SolverOracle`] with exactly two questions. Everything concrete (the
//! abstract domains, the solver back-ends) lives outside this crate.

use std::sync::Arc;

use hashbrown::HashMap;
use thiserror::Error;

use crate::{
    compiler::ir::Opcode,
    heap::{Pointer, Snapshot},
};

/// The solver refused to answer within its budget. Where a boolean answer
/// is required this becomes a host error and aborts the run with `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("solver returned unknown")]
pub struct SolverUnknown;

/// One conjunct of a path condition: the branch (or lifted operation) it
/// originated from, the branch polarity, and an opaque formula blob in the
/// lifter's own encoding.
#[derive(Debug, Clone)]
pub struct Constraint {
    pub origin: u64,
    pub polarity: bool,
    pub formula: Option<Arc<[u8]>>,
}

impl Constraint {
    #[must_use]
    pub fn branch(origin: u64, polarity: bool) -> Self {
        Constraint { origin, polarity, formula: None }
    }

    #[must_use]
    pub fn lifted(origin: u64, formula: Arc<[u8]>) -> Self {
        Constraint { origin, polarity: true, formula: Some(formula) }
    }
}

/// The conjunction of constraints accumulated along one execution path.
#[derive(Debug, Clone, Default)]
pub struct PathCondition {
    pub constraints: Vec<Constraint>,
}

impl PathCondition {
    pub fn push(&mut self, constraint: Constraint) {
        self.constraints.push(constraint);
    }

    pub fn clear(&mut self) {
        self.constraints.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }
}

/// The two questions the engine may ask of an SMT back-end. Implementations
/// must be pure with respect to their arguments: the search may ask the
/// same question from several workers.
pub trait SolverOracle: Send + Sync {
    fn feasible(&self, path: &PathCondition) -> Result<bool, SolverUnknown>;

    /// Semantic state equality under symbolic values, given candidate root
    /// pairings. Purely concrete states compare by digest.
    fn equal(
        &self,
        a: &Snapshot,
        b: &Snapshot,
        pairs: &[(Pointer, Pointer)],
    ) -> Result<bool, SolverUnknown>;
}

/// The oracle used when no solver is attached: every path is feasible and
/// states are equal exactly when their canonical digests are.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrivialOracle;

impl SolverOracle for TrivialOracle {
    fn feasible(&self, _path: &PathCondition) -> Result<bool, SolverUnknown> {
        Ok(true)
    }

    fn equal(
        &self,
        a: &Snapshot,
        b: &Snapshot,
        _pairs: &[(Pointer, Pointer)],
    ) -> Result<bool, SolverUnknown> {
        Ok(a.digest() == b.digest())
    }
}

/// Identifier of an abstract domain, as carried in the per-thread stash.
pub type DomainId = u8;

/// Promotes one concrete operation into a domain formula. Returns the
/// formula blob to record, or None when the operation is not interesting
/// to the domain.
pub trait Lifter: Send + Sync {
    fn lift(&self, op: Opcode, inputs: &[u64]) -> Option<Arc<[u8]>>;
}

/// Registry of lifters keyed by domain id. The engine consults it whenever
/// an instruction produces a tainted result; the registry ships empty and
/// is populated by the instrumentation side.
#[derive(Default)]
pub struct LifterRegistry {
    domains: HashMap<DomainId, Arc<dyn Lifter>>,
}

impl LifterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, domain: DomainId, lifter: Arc<dyn Lifter>) {
        self.domains.insert(domain, lifter);
    }

    #[must_use]
    pub fn get(&self, domain: DomainId) -> Option<&Arc<dyn Lifter>> {
        self.domains.get(&domain)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

impl std::fmt::Debug for LifterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifterRegistry")
            .field("domains", &self.domains.keys().collect::<Vec<_>>())
            .finish()
    }
}
