//! Trace hypercalls: guest-visible logging into the edge label.

use crate::emulator::{
    context::{Context, TraceEvent},
    fault::Fault,
    hypercalls::{control::read_message, Hypercall},
};

pub(super) struct TraceCall;

impl Hypercall for TraceCall {
    fn invoke(&self, ctx: &mut Context, args: &[u64]) -> Result<Option<u64>, Fault> {
        let text = read_message(ctx, args[0], args[1]);
        tracing::debug!(target: "kripke::guest", "{text}");
        ctx.trace.push(TraceEvent::Text(text));
        Ok(None)
    }
}

pub(super) struct TraceInfoCall;

impl Hypercall for TraceInfoCall {
    fn invoke(&self, ctx: &mut Context, args: &[u64]) -> Result<Option<u64>, Fault> {
        let text = read_message(ctx, args[0], args[1]);
        tracing::debug!(target: "kripke::guest", "info: {text}");
        ctx.trace.push(TraceEvent::Info(text));
        Ok(None)
    }
}

pub(super) struct TraceFaultCall;

impl Hypercall for TraceFaultCall {
    fn invoke(&self, ctx: &mut Context, args: &[u64]) -> Result<Option<u64>, Fault> {
        let text = read_message(ctx, args[0], args[1]);
        tracing::debug!(target: "kripke::guest", "fault: {text}");
        ctx.trace.push(TraceEvent::Fault(text));
        Ok(None)
    }
}
