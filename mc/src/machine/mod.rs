//! Top-level verification jobs: safety and liveness checking over the
//! generated state space, with counterexample reconstruction.

pub mod liveness;
pub mod safety;
pub mod trace;

pub use liveness::Liveness;
pub use safety::Safety;
pub use trace::{Trace, TraceStep};

use log::info;
use serde::{Deserialize, Serialize};

use crate::search::SearchStats;

/// The user-visible outcome of a verification job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum McResult {
    /// The search was exhausted without finding an error.
    Valid,
    /// A property violation was found; a counterexample is available.
    Error,
    /// The initial state could not be constructed.
    BootError,
    /// The search could not decide (solver timeout, bound exceeded).
    Unknown,
}

/// What a job hands back: the verdict, aggregate statistics, and a
/// counterexample when there is one.
#[derive(Debug, Clone)]
pub struct Report {
    pub result: McResult,
    pub stats: SearchStats,
    pub trace: Option<Trace>,
}

impl Report {
    pub(crate) fn new(result: McResult, stats: SearchStats, trace: Option<Trace>) -> Self {
        Report { result, stats, trace }
    }

    /// Log a one-glance summary of the outcome.
    pub fn log(&self) {
        info!("result: {:?} ({})", self.result, self.stats);
        if let Some(trace) = &self.trace {
            info!("counterexample: {} states", trace.len());
        }
    }
}
