//! The loop guard: breaks busy-wait cycles without enumerating them.

use crate::{
    emulator::{
        context::Context,
        fault::{Fault, FaultKind},
        hypercalls::Hypercall,
        regs::flags,
    },
    heap::{Pointer, PointerTag},
};

pub(super) struct TestLoopCall;

impl Hypercall for TestLoopCall {
    fn invoke(&self, ctx: &mut Context, args: &[u64]) -> Result<Option<u64>, Fault> {
        if ctx.flag(flags::IGNORE_LOOP) {
            return Ok(None);
        }
        let class = args[0];
        if !ctx.loop_check(class) {
            return Ok(None);
        }
        tracing::trace!(class, "loop guard tripped");
        let stop = Pointer::from_raw(args[1]);
        if stop.is_null() {
            // no continuation: the cycle is benign, abandon the branch
            ctx.regs.set_flag(flags::CANCEL);
            return Ok(None);
        }
        if stop.tag() != Some(PointerTag::Code) {
            return Err(ctx.fault_here(FaultKind::Hypercall, "test_loop continuation is not code"));
        }
        ctx.enter(stop.obj(), &[])?;
        Ok(None)
    }
}
