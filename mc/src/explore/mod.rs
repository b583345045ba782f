//! One-step state-space generation: booting the kernel and enumerating
//! successor snapshots of a committed state.

pub mod generator;
pub mod label;

pub use generator::{boot_context, is_accepting, scheduler_context, StateGenerator};
pub use label::Label;
