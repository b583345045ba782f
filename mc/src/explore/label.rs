//! Edge labels: everything one step reports about itself.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::emulator::{Choice, Fault, InterruptEvent, TraceEvent};

/// The label of one edge in the state graph. Together with the source
/// snapshot, `choices` fully determines the step (replaying them yields the
/// same target), which is what makes counterexample traces reconstructible.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Label {
    /// The ordered choice log of the step.
    pub choices: Vec<Choice>,
    /// Interrupts delivered during the step.
    pub interrupts: Vec<InterruptEvent>,
    /// Trace events emitted by the guest and the fault machinery.
    pub trace: Vec<TraceEvent>,
    /// Whether the step observed an unabsorbed fault.
    pub error: bool,
    /// The fault behind an error edge, when there was one.
    pub fault: Option<Fault>,
}

impl Label {
    /// One-line rendering for logs.
    #[must_use]
    pub fn summary(&self) -> String {
        let choices = self.choices.iter().map(|c| format!("{}/{}", c.taken, c.total)).join(" ");
        let mut out = format!("[{choices}]");
        if !self.interrupts.is_empty() {
            out.push_str(&format!(" {} interrupts", self.interrupts.len()));
        }
        if self.error {
            out.push_str(" ERROR");
        }
        out
    }
}
