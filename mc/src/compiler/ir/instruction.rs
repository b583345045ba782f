use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::compiler::ir::opcode::Opcode;

/// Index of an SSA value within its function's register layout.
pub type SlotId = u16;

/// Index of a basic block within its function.
pub type BlockId = u32;

/// Function ids double as the object field of `Code` pointers.
pub type FunctionId = u32;

/// A fixed-size operand descriptor.
///
/// Operand conventions per opcode:
///   - binary arithmetic/bitwise/compare: `[lhs, rhs]`
///   - conversions, `Mov`: `[src]`
///   - `Alloca`: `[size]`
///   - `Load`: `[addr]`; `Store`: `[value, addr]`; `Gep`: `[base, delta]`
///   - `Br`: `[Block]` or `[cond, Block(then), Block(else)]`
///   - `Switch`: `[value, Block(default), Imm(case), Block(target), …]`
///   - `Ret`: `[]` or `[value]`
///   - `Call`: `[callee, args…]`; `Invoke`: `[callee, Block(normal),
///     Block(pad), args…]`
///   - `Hypercall`: `[Imm(code), args…]`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    /// An SSA register of the current frame.
    Reg(SlotId),
    /// An immediate; float immediates carry their raw IEEE-754 bits.
    Imm(u64),
    /// Index into the module's global table; evaluates to a pointer into
    /// the exported globals object.
    Global(u32),
    /// Index into the module's constant table.
    Const(u32),
    /// A function; evaluates to a code pointer at instruction 0.
    Func(FunctionId),
    /// A basic-block target of a terminator (not a first-class value).
    Block(BlockId),
}

/// One IR instruction. `Store` has no result; everything width-typed takes
/// its width from the result slot's layout entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    pub result: Option<SlotId>,
    pub operands: Box<[Operand]>,
    /// Optional source location carried through from the front-end, used
    /// only for fault reports and traces.
    pub loc: Option<Arc<str>>,
}

impl Instruction {
    #[must_use]
    pub fn new(opcode: Opcode, result: Option<SlotId>, operands: Vec<Operand>) -> Self {
        Instruction {
            opcode,
            result,
            operands: operands.into_boxed_slice(),
            loc: None,
        }
    }

    #[must_use]
    pub fn with_loc(mut self, loc: &str) -> Self {
        self.loc = Some(loc.into());
        self
    }
}
