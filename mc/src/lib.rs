//! Kripke: an explicit-state model checker for an SSA-based intermediate
//! representation.
//!
//! Given an IR module linked with a small guest kernel, the engine
//! enumerates every reachable program state under a non-deterministic
//! scheduler and checks safety (assertions, memory errors) and liveness
//! (accepting cycles) properties. The pieces, leaves first:
//!
//! - [`heap`] — tagged pointers, copy-on-write object storage, canonical
//!   content-addressed snapshots;
//! - [`compiler`] — the IR data model and the loader boundary;
//! - [`emulator`] — the VM: contexts, control registers, the interpreter,
//!   hypercalls;
//! - [`explore`] — boot and one-step successor enumeration;
//! - [`search`] — listener-directed parallel BFS and sequential DFS;
//! - [`machine`] — the safety and liveness jobs with counterexample
//!   reconstruction;
//! - [`symbolic`] — the boundary behind which abstract domains and SMT
//!   solvers live.

pub mod compiler;
pub mod emulator;
pub mod error;
pub mod explore;
pub mod heap;
pub mod machine;
pub mod opts;
pub mod search;
pub mod symbolic;

#[cfg(test)]
pub(crate) mod testkit;

pub use error::MachineError;
pub use machine::{McResult, Report};
pub use opts::{ExploreOpts, SearchOpts};
