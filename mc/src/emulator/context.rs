//! The VM execution context: heap, control registers, logs, and the
//! per-step bookkeeping that ties them together.

use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::{
    compiler::ir::{FunctionId, Program, FRAME_PARENT, FRAME_PC},
    emulator::{
        fault::{Fault, FaultKind},
        hypercalls::{default_hypercall_map, Hypercall, HypercallCode},
        regs::{flags, ControlReg, ControlRegisters, POINTER_REGS},
    },
    error::MachineError,
    heap::{canon, CowHeap, Pointer, RootImage, RootSet, SnapId, Snapshot, SnapshotStore},
    opts::ExploreOpts,
    symbolic::{Constraint, LifterRegistry, PathCondition, SolverOracle, TrivialOracle},
};

// one shared instance of the default hypercall table; contexts only ever
// clone the Arc
static DEFAULT_HYPERCALLS: Lazy<Arc<HashMap<HypercallCode, Arc<dyn Hypercall>>>> =
    Lazy::new(|| Arc::new(default_hypercall_map()));

/// One recorded non-deterministic decision: which alternative was taken
/// out of how many.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub taken: u32,
    pub total: u32,
}

/// The ordered choice log of one step. A prefix seeded by the successor
/// enumerator is replayed; decisions past the prefix take alternative 0
/// and are recorded, so the log after a run names the complete path.
#[derive(Debug, Clone, Default)]
pub struct ChoiceLog {
    entries: Vec<Choice>,
    cursor: usize,
}

impl ChoiceLog {
    pub fn begin(&mut self, prefix: Vec<Choice>) {
        self.entries = prefix;
        self.cursor = 0;
    }

    fn next(&mut self, total: u32) -> u32 {
        if self.cursor < self.entries.len() {
            debug_assert_eq!(self.entries[self.cursor].total, total, "diverging replay");
            self.entries[self.cursor].total = total;
        } else {
            self.entries.push(Choice { taken: 0, total });
        }
        let taken = self.entries[self.cursor].taken;
        self.cursor += 1;
        taken
    }

    #[must_use]
    pub fn entries(&self) -> &[Choice] {
        &self.entries
    }

    #[must_use]
    pub fn take(&mut self) -> Vec<Choice> {
        self.cursor = 0;
        std::mem::take(&mut self.entries)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterruptKind {
    Mem,
    Cfl,
}

/// One interrupt delivery, for trace reconstruction and loop diagnosis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptEvent {
    pub kind: InterruptKind,
    /// Code pointer of the delivery point.
    pub pc: u64,
    /// Instruction count within the step at delivery time.
    pub at_instruction: u64,
}

/// Events emitted into the edge label by the trace hypercalls and the
/// fault machinery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceEvent {
    Text(String),
    Info(String),
    Fault(String),
}

impl TraceEvent {
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            TraceEvent::Text(s) | TraceEvent::Info(s) | TraceEvent::Fault(s) => s,
        }
    }
}

/// An argument passed when entering a function.
#[derive(Debug, Copy, Clone)]
pub struct CallArg {
    pub bits: u64,
    pub tainted: bool,
}

impl CallArg {
    #[must_use]
    pub fn value(bits: u64) -> Self {
        CallArg { bits, tainted: false }
    }
}

/// The mutable state of one interpreter: exclusively owned heap, control
/// registers, choice and interrupt logs, the per-thread stash, and the
/// symbolic-boundary hooks. One scratch context is reused for every step a
/// worker executes.
pub struct Context {
    pub heap: CowHeap,
    pub regs: ControlRegisters,
    program: Arc<Program>,
    opts: ExploreOpts,

    pub choices: ChoiceLog,
    pub interrupts: Vec<InterruptEvent>,
    pub trace: Vec<TraceEvent>,
    /// The most recent fault of this step, handled or not.
    pub fault: Option<Fault>,
    /// Set when the engine itself failed mid-step; aborts the search.
    pub host_error: Option<MachineError>,

    pub instruction_counter: u64,
    step_start_counter: u64,
    /// Opaque slot used by instrumentation to pass overlays alongside
    /// concrete values; its low byte selects the lifter domain.
    pub stash: u64,

    in_fault_handler: bool,
    loop_seen: HashMap<u64, HashSet<u64>>,

    pub path: PathCondition,
    hypercalls: Arc<HashMap<HypercallCode, Arc<dyn Hypercall>>>,
    oracle: Arc<dyn SolverOracle>,
    lifters: Arc<LifterRegistry>,
}

impl Context {
    #[must_use]
    pub fn new(program: Arc<Program>, opts: ExploreOpts) -> Self {
        Context {
            heap: CowHeap::new(),
            regs: ControlRegisters::new(),
            program,
            opts,
            choices: ChoiceLog::default(),
            interrupts: Vec::new(),
            trace: Vec::new(),
            fault: None,
            host_error: None,
            instruction_counter: 0,
            step_start_counter: 0,
            stash: 0,
            in_fault_handler: false,
            loop_seen: HashMap::new(),
            path: PathCondition::default(),
            hypercalls: DEFAULT_HYPERCALLS.clone(),
            oracle: Arc::new(TrivialOracle),
            lifters: Arc::new(LifterRegistry::new()),
        }
    }

    pub fn set_oracle(&mut self, oracle: Arc<dyn SolverOracle>) {
        self.oracle = oracle;
    }

    pub fn set_lifters(&mut self, lifters: Arc<LifterRegistry>) {
        self.lifters = lifters;
    }

    #[must_use]
    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    #[must_use]
    pub fn opts(&self) -> &ExploreOpts {
        &self.opts
    }

    #[must_use]
    pub fn oracle(&self) -> &Arc<dyn SolverOracle> {
        &self.oracle
    }

    #[must_use]
    pub fn lifters(&self) -> &Arc<LifterRegistry> {
        &self.lifters
    }

    #[must_use]
    pub(crate) fn hypercalls(&self) -> Arc<HashMap<HypercallCode, Arc<dyn Hypercall>>> {
        self.hypercalls.clone()
    }

    #[must_use]
    pub fn flag(&self, mask: u64) -> bool {
        self.regs.flag(mask)
    }

    #[must_use]
    pub fn frame(&self) -> Pointer {
        self.regs.pointer(ControlReg::Frame)
    }

    /// The saved program counter of the current frame.
    pub fn pc(&self) -> Result<Pointer, Fault> {
        let frame = self.frame();
        self.heap
            .read_pointer(frame.add_offset(i64::from(FRAME_PC)))
            .map_err(|e| Fault::new(FaultKind::Memory, Pointer::NULL, frame, e.to_string()))
    }

    pub fn set_pc(&mut self, pc: Pointer) -> Result<(), Fault> {
        let frame = self.frame();
        self.heap
            .write_pointer(frame.add_offset(i64::from(FRAME_PC)), pc)
            .map_err(|e| Fault::new(FaultKind::Memory, pc, frame, e.to_string()))
    }

    /// Construct a fault at the current execution point.
    #[must_use]
    pub fn fault_here(&self, kind: FaultKind, message: impl Into<String>) -> Fault {
        let pc = self.pc().unwrap_or(Pointer::NULL);
        Fault::new(kind, pc, self.frame(), message)
    }

    /// Push a fresh frame for `function` and make it current. The parent
    /// is the previous current frame (possibly null).
    pub fn enter(&mut self, function: FunctionId, args: &[CallArg]) -> Result<(), Fault> {
        let frame = self.build_frame(function, args, self.frame())?;
        self.regs.set_pointer(ControlReg::Frame, frame);
        Ok(())
    }

    /// Build a suspended frame for `function` without switching to it;
    /// backs the `frame_make` hypercall the kernel uses to create threads.
    pub fn make_frame(&mut self, function: FunctionId, args: &[CallArg]) -> Result<Pointer, Fault> {
        self.build_frame(function, args, Pointer::NULL)
    }

    fn build_frame(
        &mut self,
        function: FunctionId,
        args: &[CallArg],
        parent: Pointer,
    ) -> Result<Pointer, Fault> {
        let Some(func) = self.program.function(function).cloned() else {
            return Err(self.fault_here(FaultKind::Control, format!("no function {function}")));
        };
        if args.len() != usize::from(func.param_count) {
            return Err(self.fault_here(
                FaultKind::Control,
                format!(
                    "{} expects {} arguments, got {}",
                    func.name,
                    func.param_count,
                    args.len()
                ),
            ));
        }
        let frame = self.heap.make(func.frame_size);
        let mem = |e: crate::heap::HeapError| {
            Fault::new(FaultKind::Memory, Pointer::code(function, 0), frame, e.to_string())
        };
        self.heap
            .write_pointer(frame.add_offset(i64::from(FRAME_PC)), Pointer::code(function, 0))
            .map_err(mem)?;
        self.heap
            .write_pointer(frame.add_offset(i64::from(FRAME_PARENT)), parent)
            .map_err(mem)?;
        for (arg, slot) in args.iter().zip(func.slots.iter()) {
            let at = frame.add_offset(i64::from(slot.offset));
            if slot.is_pointer {
                self.heap.write_pointer(at, Pointer::from_raw(arg.bits)).map_err(mem)?;
            } else {
                self.heap.write(at, u32::from(slot.width), arg.bits).map_err(mem)?;
            }
            if arg.tainted {
                self.heap.set_taint(at, u32::from(slot.width), true).map_err(mem)?;
            }
        }
        Ok(frame)
    }

    /// Resolve one non-deterministic decision. `choose(1)` takes no
    /// decision and is not recorded, so it never forks the step.
    pub fn choose(&mut self, total: u32) -> Result<u32, Fault> {
        match total {
            0 => Err(self.fault_here(FaultKind::Hypercall, "choose(0)")),
            1 => Ok(0),
            _ => Ok(self.choices.next(total)),
        }
    }

    /// Resolve a two-way branch on a tainted condition by consulting the
    /// feasibility oracle for both sides. Infeasible sides are pruned; if
    /// both survive the branch becomes a recorded choice.
    pub fn branch_feasible(&mut self, origin: u64) -> Result<bool, Fault> {
        let query = |ctx: &mut Self, polarity: bool| {
            ctx.path.push(Constraint::branch(origin, polarity));
            let verdict = ctx.oracle.feasible(&ctx.path);
            ctx.path.constraints.pop();
            verdict
        };
        let (true_side, false_side) = match (query(self, true), query(self, false)) {
            (Ok(t), Ok(f)) => (t, f),
            _ => {
                self.host_error = Some(MachineError::SolverUnknown);
                self.regs.set_flag(flags::CANCEL);
                return Ok(false);
            }
        };
        let polarity = match (true_side, false_side) {
            (true, true) => self.choose(2)? == 0,
            (true, false) => true,
            (false, true) => false,
            (false, false) => {
                self.regs.set_flag(flags::CANCEL);
                false
            }
        };
        self.path.push(Constraint::branch(origin, polarity));
        Ok(polarity)
    }

    /// Consult the lifter registry for a tainted result. The active domain
    /// is named by the stash.
    pub fn lift(&mut self, op: crate::compiler::ir::Opcode, inputs: &[u64], origin: u64) {
        let domain = (self.stash & 0xFF) as u8;
        let lifters = self.lifters.clone();
        if let Some(lifter) = lifters.get(domain) {
            if let Some(formula) = lifter.lift(op, inputs) {
                self.path.push(Constraint::lifted(origin, formula));
            }
        }
    }

    /// Record a loop-guard fingerprint under `class`. Returns true when
    /// the same fingerprint was already seen in this step.
    pub fn loop_check(&mut self, class: u64) -> bool {
        let mut pointers = self.root_pointers();
        let scalars = self.root_scalars();
        let fp = canon::fingerprint(
            &self.heap,
            &RootSet { pointers: &mut pointers, scalars: &scalars },
            class,
        );
        !self.loop_seen.entry(class).or_default().insert(fp)
    }

    /// Reset per-step state and seed the choice log.
    pub fn begin_step(&mut self, prefix: Vec<Choice>) {
        self.choices.begin(prefix);
        self.interrupts.clear();
        self.trace.clear();
        self.fault = None;
        self.in_fault_handler = false;
        self.loop_seen.clear();
        self.path.clear();
        self.stash = 0;
        self.step_start_counter = self.instruction_counter;
    }

    /// Instructions executed in the current step so far.
    #[must_use]
    pub fn step_instructions(&self) -> u64 {
        self.instruction_counter - self.step_start_counter
    }

    #[must_use]
    pub fn step_budget_exceeded(&self) -> bool {
        self.step_instructions() > self.opts.max_step_instructions
    }

    pub(crate) fn enter_fault_handler(&mut self) -> bool {
        !std::mem::replace(&mut self.in_fault_handler, true)
    }

    fn root_pointers(&self) -> Vec<Pointer> {
        POINTER_REGS.iter().map(|&r| self.regs.pointer(r)).collect()
    }

    fn root_scalars(&self) -> Vec<u64> {
        vec![
            self.regs.flags() & !flags::TRANSIENT,
            self.regs.get(ControlReg::User1),
            self.regs.get(ControlReg::User2),
            self.regs.get(ControlReg::User3),
        ]
    }

    /// Canonicalise and commit the current heap and registers. Reports
    /// whether the committed state was new to the store.
    pub fn snapshot(&mut self, store: &SnapshotStore) -> (SnapId, bool) {
        let mut pointers = self.root_pointers();
        let scalars = self.root_scalars();
        let (id, isnew) = canon::commit(
            &mut self.heap,
            RootSet { pointers: &mut pointers, scalars: &scalars },
            store,
        );
        for (&reg, &ptr) in POINTER_REGS.iter().zip(pointers.iter()) {
            self.regs.set_pointer(reg, ptr);
        }
        (id, isnew)
    }

    /// Adopt a committed snapshot: heap and registers. Transient flags are
    /// clear afterwards, the shuffle seed is erased.
    pub fn restore(&mut self, snapshot: &Snapshot) {
        self.heap.restore(snapshot);
        self.apply_roots(snapshot.roots());
    }

    fn apply_roots(&mut self, roots: &RootImage) {
        self.regs = ControlRegisters::new();
        for (&reg, &ptr) in POINTER_REGS.iter().zip(roots.pointers.iter()) {
            self.regs.set_pointer(reg, ptr);
        }
        let scalars = &roots.scalars;
        self.regs.set(ControlReg::Flags, scalars.first().copied().unwrap_or(0));
        self.regs.set(ControlReg::User1, scalars.get(1).copied().unwrap_or(0));
        self.regs.set(ControlReg::User2, scalars.get(2).copied().unwrap_or(0));
        self.regs.set(ControlReg::User3, scalars.get(3).copied().unwrap_or(0));
        self.heap.set_shuffle(0);
    }

    /// Drop everything and start from an empty heap (boot).
    pub fn reset(&mut self) {
        self.heap.clear();
        self.regs = ControlRegisters::new();
        self.begin_step(Vec::new());
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("frame", &self.frame())
            .field("flags", &self.regs.flags())
            .field("instructions", &self.instruction_counter)
            .field("objects", &self.heap.pool().len())
            .finish()
    }
}
