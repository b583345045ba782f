use serde::{Deserialize, Serialize};
use strum_macros::EnumIter;

/// Hypercall codes.
///
/// A hypercall is invoked by the `Hypercall` opcode with the code as its
/// first (immediate) operand. The code is a 32-bit integer with the
/// following little-endian layout:
///
/// | Byte 0 | Byte 1 | Byte 2 | Byte 3 |
/// | ------ | ------ | ------ | ------ |
/// |   ID   |  Args  | Return | Unused |
///
/// where:
/// - Byte 0: the hypercall identifier.
/// - Byte 1: the number of arguments the call consumes.
/// - Byte 2: whether the call produces a result value.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, EnumIter, Ord, PartialOrd, Serialize, Deserialize,
)]
#[allow(clippy::unreadable_literal)]
pub enum HypercallCode {
    /// Allocate a zeroed object; returns a fresh pointer.
    ObjMake = 0x01_01_10,

    /// Free an object; later access faults.
    ObjFree = 0x00_01_11,

    /// Grow or shrink an object in place.
    ObjResize = 0x00_02_12,

    /// Read an overlay layer (pointer tag or taint) at a pointer.
    Peek = 0x01_02_13,

    /// Write an overlay layer at a pointer.
    Poke = 0x00_03_14,

    /// Build a suspended frame for a function; the kernel's thread
    /// constructor.
    FrameMake = 0x01_01_15,

    /// Read a control register.
    CtlGet = 0x01_01_20,

    /// Write a control register; writing `Frame` transfers control.
    CtlSet = 0x00_02_21,

    /// Atomically clear-then-set flag bits; returns the old flag word.
    CtlFlag = 0x01_02_22,

    /// Non-deterministic pick from `[0, n)`.
    Choose = 0x01_01_30,

    /// Raise a guest fault with a message from guest memory.
    Fault = 0x00_03_31,

    /// Emit a text event into the edge label.
    Trace = 0x00_02_40,

    /// Emit an informational event into the edge label.
    TraceInfo = 0x00_02_41,

    /// Emit a fault-flavoured event without raising a fault.
    TraceFault = 0x00_02_42,

    /// Loop guard: divert to a continuation on fingerprint repetition.
    TestLoop = 0x00_02_50,

    /// Memory-access preemption point.
    InterruptMem = 0x00_01_60,

    /// Control-flow preemption point.
    InterruptCfl = 0x00_00_61,
}

impl HypercallCode {
    #[must_use]
    pub fn from_raw(value: u64) -> Option<Self> {
        match value {
            0x01_01_10 => Some(Self::ObjMake),
            0x00_01_11 => Some(Self::ObjFree),
            0x00_02_12 => Some(Self::ObjResize),
            0x01_02_13 => Some(Self::Peek),
            0x00_03_14 => Some(Self::Poke),
            0x01_01_15 => Some(Self::FrameMake),
            0x01_01_20 => Some(Self::CtlGet),
            0x00_02_21 => Some(Self::CtlSet),
            0x01_02_22 => Some(Self::CtlFlag),
            0x01_01_30 => Some(Self::Choose),
            0x00_03_31 => Some(Self::Fault),
            0x00_02_40 => Some(Self::Trace),
            0x00_02_41 => Some(Self::TraceInfo),
            0x00_02_42 => Some(Self::TraceFault),
            0x00_02_50 => Some(Self::TestLoop),
            0x00_01_60 => Some(Self::InterruptMem),
            0x00_00_61 => Some(Self::InterruptCfl),
            _ => None,
        }
    }

    /// The hypercall identifier.
    #[must_use]
    pub fn hypercall_id(self) -> u32 {
        (self as u32).to_le_bytes()[0].into()
    }

    /// The number of arguments the call consumes.
    #[must_use]
    pub fn arg_count(self) -> usize {
        (self as u32).to_le_bytes()[1].into()
    }

    /// Whether the call produces a result value.
    #[must_use]
    pub fn returns_value(self) -> bool {
        (self as u32).to_le_bytes()[2] != 0
    }
}

impl std::fmt::Display for HypercallCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
