//! One-step state enumeration: boot the kernel, then generate successors
//! of committed snapshots by restore-and-replay over the choice tree.

use std::sync::Arc;

use log::debug;

use crate::{
    compiler::ir::Program,
    emulator::{flags, Choice, Context, ControlReg, Eval, STATE_ROOT_INDEX},
    error::MachineError,
    explore::label::Label,
    heap::{Pointer, PointerTag, SnapId, SnapshotStore},
    opts::ExploreOpts,
};

/// Whether a committed state is accepting: its `State` register carries
/// the `Marked` tag in the canonical root image.
#[must_use]
pub fn is_accepting(store: &SnapshotStore, state: SnapId) -> bool {
    store.get(state).roots().pointers[STATE_ROOT_INDEX].tag() == Some(PointerTag::Marked)
}

/// Enter `__boot` on an empty heap with the module's pools exported.
/// Kernel mode, interrupts masked.
pub fn boot_context(ctx: &mut Context) -> Result<(), MachineError> {
    ctx.reset();
    let program = ctx.program().clone();
    let (constants, globals) = program.export_heap(&mut ctx.heap);
    ctx.regs.set_pointer(ControlReg::Constants, constants);
    ctx.regs.set_pointer(ControlReg::Globals, globals);
    let Some(boot) = program.function_by_name("__boot") else {
        return Err(MachineError::Boot("module has no __boot".into()));
    };
    ctx.enter(boot, &[]).map_err(|f| MachineError::Boot(f.to_string()))?;
    ctx.regs.set_flag(flags::KERNEL_MODE | flags::MASK);
    Ok(())
}

/// Enter the registered scheduler and arm its frame for interrupt
/// delivery. Kernel mode, interrupts masked.
pub fn scheduler_context(ctx: &mut Context) -> Result<(), MachineError> {
    let scheduler = ctx.regs.pointer(ControlReg::Scheduler);
    if scheduler.tag() != Some(PointerTag::Code) {
        return Err(MachineError::Boot("no scheduler registered".into()));
    }
    ctx.enter(scheduler.obj(), &[])
        .map_err(|f| MachineError::Boot(f.to_string()))?;
    ctx.regs.set_pointer(ControlReg::IntFrame, ctx.frame());
    ctx.regs.set_flag(flags::KERNEL_MODE | flags::MASK);
    Ok(())
}

/// The one-step successor enumerator. Holds a read-only program reference
/// and a scratch context it reuses for every step, which makes it cheap to
/// clone one per search worker; committed snapshots live in the shared
/// store.
pub struct StateGenerator {
    program: Arc<Program>,
    store: Arc<SnapshotStore>,
    ctx: Context,
    initial: Option<SnapId>,
}

impl StateGenerator {
    #[must_use]
    pub fn new(program: Arc<Program>, store: Arc<SnapshotStore>, opts: ExploreOpts) -> Self {
        StateGenerator {
            ctx: Context::new(program.clone(), opts),
            program,
            store,
            initial: None,
        }
    }

    #[must_use]
    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    #[must_use]
    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    #[must_use]
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.ctx
    }

    /// The committed initial state; only available after [`boot`].
    ///
    /// [`boot`]: StateGenerator::boot
    #[must_use]
    pub fn initial(&self) -> Option<SnapId> {
        self.initial
    }

    /// Construct the initial state: run `__boot` to completion and commit.
    pub fn boot(&mut self) -> Result<SnapId, MachineError> {
        boot_context(&mut self.ctx)?;
        Eval::new(&mut self.ctx).run();
        if let Some(error) = self.ctx.host_error.take() {
            return Err(error);
        }
        if self.ctx.flag(flags::ERROR) || self.ctx.flag(flags::CANCEL) {
            let reason = self
                .ctx
                .fault
                .as_ref()
                .map_or_else(|| "boot cancelled".to_owned(), |f| f.describe(&self.program));
            return Err(MachineError::Boot(reason));
        }
        if !self.ctx.frame().is_null() {
            return Err(MachineError::Boot("__boot did not return".into()));
        }
        if self.ctx.regs.pointer(ControlReg::Scheduler).tag() != Some(PointerTag::Code) {
            return Err(MachineError::Boot("boot registered no scheduler".into()));
        }
        let (id, _) = self.ctx.snapshot(&self.store);
        debug!("booted into initial state {id}");
        self.initial = Some(id);
        Ok(id)
    }

    /// Enumerate the successors of `from`, invoking `emit(to, label,
    /// isnew)` for each edge. The callback returns false to stop early.
    ///
    /// Enumeration walks the choice tree: each run replays a prefix of
    /// decisions and records the rest (defaulting to alternative 0), then
    /// the deepest decision with an untried alternative is bumped and the
    /// step re-run. A run publishes a state by returning to a null frame
    /// without cancelling; a run that faults unabsorbed publishes the
    /// faulting state on an error edge.
    pub fn successors(
        &mut self,
        from: SnapId,
        mut emit: impl FnMut(SnapId, &Label, bool) -> bool,
    ) -> Result<(), MachineError> {
        let snapshot = self.store.get(from);
        let mut prefix: Vec<Choice> = Vec::new();
        loop {
            self.ctx.restore(&snapshot);
            scheduler_context(&mut self.ctx)?;
            self.ctx.begin_step(prefix);
            Eval::new(&mut self.ctx).run();
            if let Some(error) = self.ctx.host_error.take() {
                return Err(error);
            }

            let error = self.ctx.flag(flags::ERROR);
            let published = self.ctx.frame().is_null() && !self.ctx.flag(flags::CANCEL);
            let entries = self.ctx.choices.take();

            if published || error {
                if !error {
                    // the interrupt frame is step-local, not state identity
                    self.ctx.regs.set_pointer(ControlReg::IntFrame, Pointer::NULL);
                }
                let label = Label {
                    choices: entries.clone(),
                    interrupts: std::mem::take(&mut self.ctx.interrupts),
                    trace: std::mem::take(&mut self.ctx.trace),
                    error,
                    fault: self.ctx.fault.clone(),
                };
                let (to, isnew) = self.ctx.snapshot(&self.store);
                tracing::trace!(from, to, isnew, error, "edge {}", label.summary());
                if !emit(to, &label, isnew) {
                    return Ok(());
                }
            }

            prefix = entries;
            loop {
                match prefix.last_mut() {
                    None => return Ok(()),
                    Some(last) if last.taken + 1 < last.total => {
                        last.taken += 1;
                        break;
                    }
                    Some(_) => {
                        prefix.pop();
                    }
                }
            }
        }
    }

    /// Re-run one step from `from` under a fixed choice log, returning the
    /// target state and the label observed. Deterministic: the same log
    /// always reproduces the same step.
    pub fn replay(&mut self, from: SnapId, choices: &[Choice]) -> Result<(SnapId, Label), MachineError> {
        let snapshot = self.store.get(from);
        self.ctx.restore(&snapshot);
        scheduler_context(&mut self.ctx)?;
        self.ctx.begin_step(choices.to_vec());
        Eval::new(&mut self.ctx).run();
        if let Some(error) = self.ctx.host_error.take() {
            return Err(error);
        }
        let error = self.ctx.flag(flags::ERROR);
        if !error {
            self.ctx.regs.set_pointer(ControlReg::IntFrame, Pointer::NULL);
        }
        let label = Label {
            choices: self.ctx.choices.take(),
            interrupts: std::mem::take(&mut self.ctx.interrupts),
            trace: std::mem::take(&mut self.ctx.trace),
            error,
            fault: self.ctx.fault.clone(),
        };
        let (to, _) = self.ctx.snapshot(&self.store);
        Ok((to, label))
    }

    /// Total instructions interpreted by this generator.
    #[must_use]
    pub fn instructions(&self) -> u64 {
        self.ctx.instruction_counter
    }
}

impl Clone for StateGenerator {
    /// A clone shares the program and snapshot store but owns a fresh
    /// scratch context; this is how each search worker gets its own
    /// generator.
    fn clone(&self) -> Self {
        let mut ctx = Context::new(self.program.clone(), *self.ctx.opts());
        ctx.set_oracle(self.ctx.oracle().clone());
        ctx.set_lifters(self.ctx.lifters().clone());
        StateGenerator {
            program: self.program.clone(),
            store: self.store.clone(),
            ctx,
            initial: self.initial,
        }
    }
}
