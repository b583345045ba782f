//! The virtual machine: execution contexts, the instruction interpreter,
//! control registers, faults and hypercalls.

pub mod context;
pub mod eval;
pub mod fault;
pub mod hypercalls;
pub mod regs;

pub use context::{CallArg, Choice, ChoiceLog, Context, InterruptEvent, InterruptKind, TraceEvent};
pub use eval::{Eval, StepResult};
pub use fault::{Fault, FaultKind};
pub use hypercalls::{default_hypercall_map, Hypercall, HypercallCode};
pub use regs::{flags, ControlReg, ControlRegisters, NUM_CONTROL_REGS, POINTER_REGS, STATE_ROOT_INDEX};
