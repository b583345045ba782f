//! Guest faults. A fault is data, not an error of the engine: it either
//! transfers control to the guest's fault handler or marks the edge as an
//! error edge.

use serde::{Deserialize, Serialize};
use strum_macros::EnumIter;

use crate::{compiler::ir::Program, heap::Pointer};

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, EnumIter, Ord, PartialOrd, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum FaultKind {
    Assert = 0,
    Arithmetic = 1,
    Memory = 2,
    Control = 3,
    Locking = 4,
    Hypercall = 5,
    NotImplemented = 6,
    Float = 7,
    Integer = 8,
    Leak = 9,
}

impl FaultKind {
    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::Assert),
            1 => Some(Self::Arithmetic),
            2 => Some(Self::Memory),
            3 => Some(Self::Control),
            4 => Some(Self::Locking),
            5 => Some(Self::Hypercall),
            6 => Some(Self::NotImplemented),
            7 => Some(Self::Float),
            8 => Some(Self::Integer),
            9 => Some(Self::Leak),
            _ => None,
        }
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A fault raised during guest execution, recording where it happened and a
/// human-readable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub pc: Pointer,
    pub frame: Pointer,
    pub message: String,
}

impl Fault {
    #[must_use]
    pub fn new(kind: FaultKind, pc: Pointer, frame: Pointer, message: impl Into<String>) -> Self {
        Fault { kind, pc, frame, message: message.into() }
    }

    /// Render "kind at symbol+index (location): message" against the
    /// program's symbol and location tables; the trace line used in fault
    /// events and counterexamples.
    #[must_use]
    pub fn describe(&self, program: &Program) -> String {
        let site = match program.function(self.pc.obj()) {
            Some(function) => {
                let loc = program
                    .instruction(self.pc)
                    .and_then(|i| i.loc.as_deref())
                    .map(|l| format!(" ({l})"))
                    .unwrap_or_default();
                format!("{}+{}{}", function.name, self.pc.offset(), loc)
            }
            None => "<no frame>".to_owned(),
        };
        format!("{} fault at {}: {}", self.kind, site, self.message)
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} fault: {}", self.kind, self.message)
    }
}
