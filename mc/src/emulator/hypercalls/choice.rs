//! The non-deterministic pick.

use crate::emulator::{context::Context, fault::Fault, hypercalls::Hypercall};

pub(super) struct ChooseCall;

impl Hypercall for ChooseCall {
    fn invoke(&self, ctx: &mut Context, args: &[u64]) -> Result<Option<u64>, Fault> {
        let total = u32::try_from(args[0]).unwrap_or(u32::MAX);
        Ok(Some(ctx.choose(total)?.into()))
    }
}
