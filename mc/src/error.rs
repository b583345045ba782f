//! Host-side errors. Guest faults are data (see
//! [`Fault`](crate::emulator::Fault)); these are the conditions that abort
//! the run itself.

use thiserror::Error;

use crate::compiler::loader::LoadError;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("invalid module: {0}")]
    Load(#[from] LoadError),

    #[error("boot did not produce an initial state: {0}")]
    Boot(String),

    #[error("solver returned unknown for a required query")]
    SolverUnknown,

    #[error("state limit of {0} exceeded")]
    StateLimit(u64),

    #[error("search depth limit of {0} exceeded")]
    DepthLimit(usize),
}
