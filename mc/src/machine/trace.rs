//! Counterexample traces.

use serde::{Deserialize, Serialize};

use crate::{error::MachineError, explore::{Label, StateGenerator}, heap::SnapId};

/// One entry of a trace: a state, and the label of the edge that led into
/// it (absent for the initial state).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceStep {
    pub snap: SnapId,
    pub label: Option<Label>,
}

/// A counterexample: a path of states from the initial one, each step
/// carrying the choice log that reproduces it. For liveness results,
/// `lasso_from` is the index the final state loops back to (the trace is
/// a prefix plus a repeating cycle).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub steps: Vec<TraceStep>,
    pub lasso_from: Option<usize>,
}

impl Trace {
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn states(&self) -> impl Iterator<Item = SnapId> + '_ {
        self.steps.iter().map(|s| s.snap)
    }

    /// Materialise the trace as human-readable lines by replaying every
    /// step from its recorded choice log. Replay is deterministic, so this
    /// reconstructs the exact execution the search observed, including
    /// guest trace output and fault reports.
    pub fn render(&self, gen: &mut StateGenerator) -> Result<Vec<String>, MachineError> {
        let mut lines = Vec::new();
        for (index, step) in self.steps.iter().enumerate() {
            match &step.label {
                None => lines.push(format!("#{index}: initial state {}", step.snap)),
                Some(label) => {
                    let (target, replayed) = gen.replay(self.steps[index - 1].snap, &label.choices)?;
                    debug_assert_eq!(target, step.snap, "trace replay diverged");
                    lines.push(format!("#{index}: state {} via {}", step.snap, replayed.summary()));
                    for event in &replayed.trace {
                        lines.push(format!("      {}", event.text()));
                    }
                }
            }
        }
        if let Some(from) = self.lasso_from {
            lines.push(format!("      cycle: back to #{from}"));
        }
        Ok(lines)
    }
}
