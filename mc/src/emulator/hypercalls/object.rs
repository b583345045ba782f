//! Object-management hypercalls.

use crate::{
    emulator::{
        context::Context,
        fault::{Fault, FaultKind},
        hypercalls::Hypercall,
    },
    heap::{OverlayLayer, Pointer, PointerTag, OFFSET_MASK},
};

fn mem_fault(ctx: &Context, e: crate::heap::HeapError) -> Fault {
    ctx.fault_here(FaultKind::Memory, e.to_string())
}

pub(super) struct ObjMakeCall;

impl Hypercall for ObjMakeCall {
    fn invoke(&self, ctx: &mut Context, args: &[u64]) -> Result<Option<u64>, Fault> {
        let size = args[0];
        if size > OFFSET_MASK {
            return Err(ctx.fault_here(FaultKind::Memory, format!("allocation of {size} bytes")));
        }
        // simulated allocation failure is a choice: the failing branch
        // observes a null return
        if ctx.opts().sim_fail_malloc && ctx.choose(2)? == 1 {
            return Ok(Some(0));
        }
        Ok(Some(ctx.heap.make(size as u32).raw()))
    }
}

pub(super) struct ObjFreeCall;

impl Hypercall for ObjFreeCall {
    fn invoke(&self, ctx: &mut Context, args: &[u64]) -> Result<Option<u64>, Fault> {
        let ptr = Pointer::from_raw(args[0]);
        ctx.heap.free(ptr).map_err(|e| mem_fault(ctx, e))?;
        Ok(None)
    }
}

pub(super) struct ObjResizeCall;

impl Hypercall for ObjResizeCall {
    fn invoke(&self, ctx: &mut Context, args: &[u64]) -> Result<Option<u64>, Fault> {
        let ptr = Pointer::from_raw(args[0]);
        let size = args[1];
        if size > OFFSET_MASK {
            return Err(ctx.fault_here(FaultKind::Memory, format!("resize to {size} bytes")));
        }
        ctx.heap.resize(ptr, size as u32).map_err(|e| mem_fault(ctx, e))?;
        Ok(None)
    }
}

fn layer(ctx: &Context, raw: u64) -> Result<OverlayLayer, Fault> {
    OverlayLayer::from_raw(raw)
        .ok_or_else(|| ctx.fault_here(FaultKind::Hypercall, format!("unknown overlay layer {raw}")))
}

pub(super) struct PeekCall;

impl Hypercall for PeekCall {
    fn invoke(&self, ctx: &mut Context, args: &[u64]) -> Result<Option<u64>, Fault> {
        let ptr = Pointer::from_raw(args[0]);
        let value = match layer(ctx, args[1])? {
            OverlayLayer::PointerTag => ctx.heap.peek_tag(ptr).map_err(|e| mem_fault(ctx, e))?.into(),
            OverlayLayer::Taint => ctx.heap.tainted(ptr, 1).map_err(|e| mem_fault(ctx, e))?.into(),
        };
        Ok(Some(value))
    }
}

pub(super) struct PokeCall;

impl Hypercall for PokeCall {
    fn invoke(&self, ctx: &mut Context, args: &[u64]) -> Result<Option<u64>, Fault> {
        let ptr = Pointer::from_raw(args[0]);
        match layer(ctx, args[1])? {
            OverlayLayer::PointerTag => {
                let tag = PointerTag::from_bits(args[2] as u8).ok_or_else(|| {
                    ctx.fault_here(FaultKind::Hypercall, format!("invalid pointer tag {}", args[2]))
                })?;
                ctx.heap.poke_tag(ptr, tag).map_err(|e| mem_fault(ctx, e))?;
            }
            OverlayLayer::Taint => {
                ctx.heap.set_taint(ptr, 1, args[2] != 0).map_err(|e| mem_fault(ctx, e))?;
            }
        }
        Ok(None)
    }
}

pub(super) struct FrameMakeCall;

impl Hypercall for FrameMakeCall {
    fn invoke(&self, ctx: &mut Context, args: &[u64]) -> Result<Option<u64>, Fault> {
        let entry = Pointer::from_raw(args[0]);
        if entry.tag() != Some(PointerTag::Code) {
            return Err(ctx.fault_here(FaultKind::Hypercall, "frame_make of a non-code pointer"));
        }
        let frame = ctx.make_frame(entry.obj(), &[])?;
        Ok(Some(frame.raw()))
    }
}
