//! Preemption points. With interrupts unmasked, each point is a binary
//! choice; delivery swaps the current frame with `IntFrame`, so the
//! scheduler resumes where it armed the interrupt frame and the preempted
//! thread's continuation is left behind in `IntFrame`.

use crate::emulator::{
    context::{Context, InterruptEvent, InterruptKind},
    fault::Fault,
    hypercalls::Hypercall,
    regs::{flags, ControlReg},
};

fn preempt(ctx: &mut Context, kind: InterruptKind) -> Result<(), Fault> {
    if ctx.flag(flags::MASK) {
        return Ok(());
    }
    if ctx.choose(2)? == 0 {
        return Ok(());
    }
    let pc = ctx.pc()?;
    ctx.interrupts.push(InterruptEvent {
        kind,
        pc: pc.raw(),
        at_instruction: ctx.step_instructions(),
    });
    let frame = ctx.regs.pointer(ControlReg::Frame);
    let int_frame = ctx.regs.pointer(ControlReg::IntFrame);
    ctx.regs.set_pointer(ControlReg::Frame, int_frame);
    ctx.regs.set_pointer(ControlReg::IntFrame, frame);
    ctx.regs.set_flag(flags::INTERRUPTED | flags::MASK);
    Ok(())
}

pub(super) struct InterruptMemCall;

impl Hypercall for InterruptMemCall {
    fn invoke(&self, ctx: &mut Context, _args: &[u64]) -> Result<Option<u64>, Fault> {
        preempt(ctx, InterruptKind::Mem)?;
        Ok(None)
    }
}

pub(super) struct InterruptCflCall;

impl Hypercall for InterruptCflCall {
    fn invoke(&self, ctx: &mut Context, _args: &[u64]) -> Result<Option<u64>, Fault> {
        preempt(ctx, InterruptKind::Cfl)?;
        Ok(None)
    }
}
