//! Hypercall definitions & implementations for the VM.
//!
//! A hypercall is a VM-provided operation the guest invokes as a function
//! call; it is implemented by the engine, never by IR execution. Each one
//! is a unit struct implementing [`Hypercall`], registered in
//! [`default_hypercall_map`].

pub mod code;
mod choice;
mod control;
mod guard;
mod interrupt;
mod object;
mod trace;

use std::sync::Arc;

pub use code::HypercallCode;
use hashbrown::HashMap;

use crate::emulator::{context::Context, fault::Fault};

use choice::ChooseCall;
use control::{CtlFlagCall, CtlGetCall, CtlSetCall, FaultCall};
use guard::TestLoopCall;
use interrupt::{InterruptCflCall, InterruptMemCall};
use object::{FrameMakeCall, ObjFreeCall, ObjMakeCall, ObjResizeCall, PeekCall, PokeCall};
use trace::{TraceCall, TraceFaultCall, TraceInfoCall};

/// A VM operation callable from the guest.
///
/// Arguments arrive as raw 64-bit words (pointers by their bit pattern).
/// Returning `Ok(Some(v))` writes `v` into the instruction's result slot;
/// returning `Err` raises a guest fault through the ordinary fault
/// machinery. A hypercall may switch frames by writing the `Frame`
/// control register; the interpreter commits the continuation pc before
/// dispatch, so the old frame resumes after the call site.
pub trait Hypercall: Send + Sync {
    fn invoke(&self, ctx: &mut Context, args: &[u64]) -> Result<Option<u64>, Fault>;
}

/// Creates the default hypercall map.
#[must_use]
pub fn default_hypercall_map() -> HashMap<HypercallCode, Arc<dyn Hypercall>> {
    let mut map = HashMap::<HypercallCode, Arc<dyn Hypercall>>::default();

    map.insert(HypercallCode::ObjMake, Arc::new(ObjMakeCall));
    map.insert(HypercallCode::ObjFree, Arc::new(ObjFreeCall));
    map.insert(HypercallCode::ObjResize, Arc::new(ObjResizeCall));
    map.insert(HypercallCode::Peek, Arc::new(PeekCall));
    map.insert(HypercallCode::Poke, Arc::new(PokeCall));
    map.insert(HypercallCode::FrameMake, Arc::new(FrameMakeCall));

    map.insert(HypercallCode::CtlGet, Arc::new(CtlGetCall));
    map.insert(HypercallCode::CtlSet, Arc::new(CtlSetCall));
    map.insert(HypercallCode::CtlFlag, Arc::new(CtlFlagCall));

    map.insert(HypercallCode::Choose, Arc::new(ChooseCall));
    map.insert(HypercallCode::Fault, Arc::new(FaultCall));

    map.insert(HypercallCode::Trace, Arc::new(TraceCall));
    map.insert(HypercallCode::TraceInfo, Arc::new(TraceInfoCall));
    map.insert(HypercallCode::TraceFault, Arc::new(TraceFaultCall));

    map.insert(HypercallCode::TestLoop, Arc::new(TestLoopCall));

    map.insert(HypercallCode::InterruptMem, Arc::new(InterruptMemCall));
    map.insert(HypercallCode::InterruptCfl, Arc::new(InterruptCflCall));

    map
}
