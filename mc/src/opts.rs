//! Engine options, overridable through the environment.

use std::env;

use serde::{Deserialize, Serialize};

const DEFAULT_STEP_INSTRUCTIONS: u64 = 1 << 24;
const TEST_STEP_INSTRUCTIONS: u64 = 1 << 16;

/// Options governing a single execution step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExploreOpts {
    /// Turn every allocation into a binary choice whose failing branch
    /// returns null, modelling allocation failure.
    pub sim_fail_malloc: bool,
    /// Hard ceiling on instructions per step; a step that exceeds it is
    /// cancelled with an error (a scheduler that fails to terminate is a
    /// kernel bug, not something to explore forever).
    pub max_step_instructions: u64,
}

impl Default for ExploreOpts {
    fn default() -> Self {
        Self {
            sim_fail_malloc: env::var("KRIPKE_SIMFAIL_MALLOC").is_ok_and(|v| v != "0"),
            max_step_instructions: env::var("KRIPKE_STEP_INSTRUCTIONS").map_or_else(
                |_| DEFAULT_STEP_INSTRUCTIONS,
                |s| s.parse().unwrap_or(DEFAULT_STEP_INSTRUCTIONS),
            ),
        }
    }
}

impl ExploreOpts {
    #[must_use]
    pub fn test_opts() -> Self {
        Self {
            sim_fail_malloc: false,
            max_step_instructions: TEST_STEP_INSTRUCTIONS,
        }
    }
}

/// Options governing the graph search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchOpts {
    /// Worker threads for the parallel BFS.
    pub workers: usize,
    /// Abort with `Unknown` when a liveness search exceeds this depth.
    pub max_depth: usize,
}

impl Default for SearchOpts {
    fn default() -> Self {
        Self {
            workers: env::var("KRIPKE_WORKERS").map_or_else(
                |_| num_cpus::get(),
                |s| s.parse().unwrap_or_else(|_| num_cpus::get()),
            ),
            max_depth: env::var("KRIPKE_MAX_DEPTH")
                .map_or(1 << 20, |s| s.parse().unwrap_or(1 << 20)),
        }
    }
}

impl SearchOpts {
    #[must_use]
    pub fn test_opts() -> Self {
        Self {
            workers: 1,
            max_depth: 1 << 12,
        }
    }
}
