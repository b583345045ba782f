//! Search statistics, aggregated across workers.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Live counters shared by the search workers.
#[derive(Debug, Default)]
pub struct SearchCounters {
    pub states: AtomicU64,
    pub edges: AtomicU64,
    pub instructions: AtomicU64,
}

impl SearchCounters {
    pub fn snapshot(&self) -> SearchStats {
        SearchStats {
            states: self.states.load(Ordering::Relaxed),
            edges: self.edges.load(Ordering::Relaxed),
            instructions: self.instructions.load(Ordering::Relaxed),
        }
    }
}

/// Final numbers of one search run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchStats {
    /// Unique states discovered (including the initial one).
    pub states: u64,
    /// Edges emitted.
    pub edges: u64,
    /// Guest instructions interpreted.
    pub instructions: u64,
}

impl std::fmt::Display for SearchStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} states, {} edges, {} instructions",
            self.states, self.edges, self.instructions
        )
    }
}
