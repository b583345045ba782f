//! Control-register access and fault raising.

use crate::{
    emulator::{
        context::Context,
        fault::{Fault, FaultKind},
        hypercalls::Hypercall,
        regs::ControlReg,
    },
    heap::Pointer,
};

fn register(ctx: &Context, raw: u64) -> Result<ControlReg, Fault> {
    ControlReg::from_raw(raw)
        .ok_or_else(|| ctx.fault_here(FaultKind::Hypercall, format!("unknown control register {raw}")))
}

pub(super) struct CtlGetCall;

impl Hypercall for CtlGetCall {
    fn invoke(&self, ctx: &mut Context, args: &[u64]) -> Result<Option<u64>, Fault> {
        let reg = register(ctx, args[0])?;
        Ok(Some(ctx.regs.get(reg)))
    }
}

pub(super) struct CtlSetCall;

impl Hypercall for CtlSetCall {
    fn invoke(&self, ctx: &mut Context, args: &[u64]) -> Result<Option<u64>, Fault> {
        let reg = register(ctx, args[0])?;
        let value = args[1];
        ctx.regs.set(reg, value);
        // writing Frame transfers control (the interpreter already parked
        // the old frame's continuation); writing the shuffle seed takes
        // effect on the next allocation
        if reg == ControlReg::ObjIdShuffle {
            ctx.heap.set_shuffle(value as u32);
        }
        Ok(None)
    }
}

pub(super) struct CtlFlagCall;

impl Hypercall for CtlFlagCall {
    fn invoke(&self, ctx: &mut Context, args: &[u64]) -> Result<Option<u64>, Fault> {
        Ok(Some(ctx.regs.modify_flags(args[0], args[1])))
    }
}

pub(super) struct FaultCall;

impl Hypercall for FaultCall {
    fn invoke(&self, ctx: &mut Context, args: &[u64]) -> Result<Option<u64>, Fault> {
        let kind = FaultKind::from_raw(args[0])
            .ok_or_else(|| ctx.fault_here(FaultKind::Hypercall, format!("unknown fault kind {}", args[0])))?;
        let message = read_message(ctx, args[1], args[2]);
        Err(ctx.fault_here(kind, message))
    }
}

pub(super) fn read_message(ctx: &Context, ptr: u64, len: u64) -> String {
    ctx.heap
        .read_string(Pointer::from_raw(ptr), len as u32)
        .unwrap_or_else(|_| format!("<bad message pointer {ptr:#x}>"))
}
