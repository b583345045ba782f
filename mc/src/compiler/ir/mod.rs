//! The IR data model: opcodes, instructions, frame layout, programs.

pub mod builder;
pub mod instruction;
pub mod layout;
pub mod opcode;
pub mod program;

pub use builder::{FunctionBuilder, ProgramBuilder};
pub use instruction::{BlockId, FunctionId, Instruction, Operand, SlotId};
pub use layout::{SlotInfo, FRAME_HEADER, FRAME_PARENT, FRAME_PC};
pub use opcode::Opcode;
pub use program::{DataItem, Function, Program};
