//! The VM's control registers: the protocol surface between the engine and
//! the guest kernel.

use serde::{Deserialize, Serialize};
use strum_macros::EnumIter;

use crate::heap::Pointer;

/// Control-register slots. Each is a 64-bit word; the pointer-valued ones
/// (see [`POINTER_REGS`]) are roots for canonicalisation.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, EnumIter, Ord, PartialOrd, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum ControlReg {
    /// Current call frame; null means control is back with the engine.
    Frame = 0,
    /// Base pointer of the exported globals object.
    Globals = 1,
    /// Base pointer of the exported constants object.
    Constants = 2,
    /// The user-visible program state object. Its pointer tag doubles as
    /// the Büchi acceptance mark.
    State = 3,
    /// Code pointer of the scheduler entry, set by `__boot`.
    Scheduler = 4,
    /// Code pointer of the fault handler, or null.
    FaultHandler = 5,
    /// Frame the next interrupt delivery swaps in.
    IntFrame = 6,
    /// Flag bitfield, see [`flags`].
    Flags = 7,
    /// Seed for the object-id scramble; erased by canonicalisation.
    ObjIdShuffle = 8,
    User1 = 9,
    User2 = 10,
    User3 = 11,
}

pub const NUM_CONTROL_REGS: usize = 12;

/// The pointer-valued registers, in root order. This order is part of the
/// canonical form.
pub const POINTER_REGS: [ControlReg; 7] = [
    ControlReg::Frame,
    ControlReg::Globals,
    ControlReg::Constants,
    ControlReg::State,
    ControlReg::Scheduler,
    ControlReg::FaultHandler,
    ControlReg::IntFrame,
];

/// Index of `State` within [`POINTER_REGS`]; liveness reads the acceptance
/// mark straight out of snapshot root images.
pub const STATE_ROOT_INDEX: usize = 3;

impl ControlReg {
    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::Frame),
            1 => Some(Self::Globals),
            2 => Some(Self::Constants),
            3 => Some(Self::State),
            4 => Some(Self::Scheduler),
            5 => Some(Self::FaultHandler),
            6 => Some(Self::IntFrame),
            7 => Some(Self::Flags),
            8 => Some(Self::ObjIdShuffle),
            9 => Some(Self::User1),
            10 => Some(Self::User2),
            11 => Some(Self::User3),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_pointer(self) -> bool {
        POINTER_REGS.contains(&self)
    }
}

pub mod flags {
    /// Executing kernel code.
    pub const KERNEL_MODE: u64 = 1 << 0;
    /// Interrupts are off.
    pub const MASK: u64 = 1 << 1;
    /// An interrupt was delivered during this step.
    pub const INTERRUPTED: u64 = 1 << 2;
    /// Abandon the current step without publishing a state.
    pub const CANCEL: u64 = 1 << 3;
    /// The step observed an error; the emitted edge is an error edge.
    pub const ERROR: u64 = 1 << 4;
    /// Stop the interpreter loop after the current instruction.
    pub const STOP: u64 = 1 << 5;
    /// Suppress the loop guard.
    pub const IGNORE_LOOP: u64 = 1 << 6;
    /// Suppress fault delivery (continue past faults).
    pub const IGNORE_FAULT: u64 = 1 << 7;

    /// Flags that are step-local and never part of state identity.
    pub const TRANSIENT: u64 = KERNEL_MODE | MASK | INTERRUPTED | CANCEL | ERROR | STOP;
}

/// The register file. Pointer registers are stored as raw words; typed
/// accessors exist for both views.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlRegisters {
    words: [u64; NUM_CONTROL_REGS],
}

impl ControlRegisters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, reg: ControlReg) -> u64 {
        self.words[reg as usize]
    }

    pub fn set(&mut self, reg: ControlReg, value: u64) {
        self.words[reg as usize] = value;
    }

    #[must_use]
    pub fn pointer(&self, reg: ControlReg) -> Pointer {
        Pointer::from_raw(self.get(reg))
    }

    pub fn set_pointer(&mut self, reg: ControlReg, value: Pointer) {
        self.set(reg, value.raw());
    }

    #[must_use]
    pub fn flags(&self) -> u64 {
        self.get(ControlReg::Flags)
    }

    #[must_use]
    pub fn flag(&self, mask: u64) -> bool {
        self.flags() & mask != 0
    }

    pub fn set_flag(&mut self, mask: u64) {
        self.set(ControlReg::Flags, self.flags() | mask);
    }

    pub fn clear_flag(&mut self, mask: u64) {
        self.set(ControlReg::Flags, self.flags() & !mask);
    }

    /// Atomic-in-the-VM flag update: clear then set, returning the old
    /// word. Backs the `ctl_flag` hypercall.
    pub fn modify_flags(&mut self, clear: u64, set: u64) -> u64 {
        let old = self.flags();
        self.set(ControlReg::Flags, (old & !clear) | set);
        old
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_modify_returns_old_word() {
        let mut regs = ControlRegisters::new();
        regs.set_flag(flags::MASK);
        let old = regs.modify_flags(flags::MASK, flags::CANCEL);
        assert_eq!(old, flags::MASK);
        assert!(regs.flag(flags::CANCEL));
        assert!(!regs.flag(flags::MASK));
    }

    #[test]
    fn pointer_regs_cover_all_pointer_slots() {
        for reg in POINTER_REGS {
            assert!(reg.is_pointer());
        }
        assert!(!ControlReg::Flags.is_pointer());
        assert_eq!(POINTER_REGS[STATE_ROOT_INDEX], ControlReg::State);
    }
}
