use serde::{Deserialize, Serialize};
use strum_macros::EnumIter;

/// IR opcodes. Dispatch is a single `match` in the interpreter; there is
/// exactly one opcode per operation, with comparison predicates folded into
/// the opcode rather than carried as a separate field.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, EnumIter, Ord, PartialOrd, Serialize, Deserialize,
)]
pub enum Opcode {
    // integer arithmetic; operate at the width of the result slot
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,

    // bitwise
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,

    // IEEE-754 arithmetic; width 4 is f32, width 8 is f64
    FAdd,
    FSub,
    FMul,
    FDiv,
    FRem,

    // integer comparison; result is one byte
    IEq,
    INe,
    IUlt,
    IUle,
    IUgt,
    IUge,
    ISlt,
    ISle,
    ISgt,
    ISge,

    // float comparison (ordered predicates plus the two order tests);
    // comparisons involving NaN answer false for the ordered predicates
    // and never fault
    FOeq,
    FOne,
    FOlt,
    FOle,
    FOgt,
    FOge,
    FOrd,
    FUno,

    // width conversions
    Trunc,
    ZExt,
    SExt,
    FpToSi,
    SiToFp,

    // register copy (phis are lowered to copies by the front-end)
    Mov,

    // memory
    Alloca,
    Load,
    Store,
    Gep,

    // control
    Br,
    Switch,
    Ret,
    Call,
    Invoke,

    // VM entry points; first operand is the hypercall code
    Hypercall,
}

impl Opcode {
    /// Terminators end a basic block.
    #[must_use]
    pub fn is_terminator(self) -> bool {
        matches!(self, Opcode::Br | Opcode::Switch | Opcode::Ret)
    }

    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(
            self,
            Opcode::FAdd
                | Opcode::FSub
                | Opcode::FMul
                | Opcode::FDiv
                | Opcode::FRem
                | Opcode::FOeq
                | Opcode::FOne
                | Opcode::FOlt
                | Opcode::FOle
                | Opcode::FOgt
                | Opcode::FOge
                | Opcode::FOrd
                | Opcode::FUno
        )
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
