//! The instruction interpreter.
//!
//! `Eval::step` executes exactly one instruction and reports the outcome as
//! a [`StepResult`]; `Eval::run` is the only inner loop of the VM. Faults
//! never unwind: they are values routed through the guest's registered
//! fault handler or recorded on the context.
//!
//! Frame protocol: a frame's header pc names the instruction the frame is
//! suspended at. Before dispatching a hypercall the continuation pc is
//! committed, so a hypercall that switches frames (scheduler entry,
//! interrupt delivery) leaves the old frame resumable just past the call
//! site. Returning to a frame that is *not* suspended at a call (a fault
//! handler's or loop-guard continuation's parent) resumes it exactly where
//! it parked.

use crate::{
    compiler::ir::{
        instruction::{Instruction, Operand},
        program::{Function, Program},
        Opcode, FRAME_PARENT, FRAME_PC,
    },
    emulator::{
        context::{CallArg, Context, TraceEvent},
        fault::{Fault, FaultKind},
        hypercalls::HypercallCode,
        regs::{flags, ControlReg},
    },
    heap::{Pointer, PointerTag, OFFSET_MASK},
};

/// Outcome of one `step`. `Faulted` means the fault was *not* absorbed (no
/// handler, a double fault, or `IgnoreFault` unset with no handler); the
/// error and cancel flags are already set when it is returned.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    Continued,
    Halted,
    Faulted(Fault),
}

/// Where control goes after an instruction.
enum Flow {
    /// Fall through to the next instruction.
    Next,
    /// Jump to an instruction index within the current function.
    Jump(u32),
    /// The instruction managed frames and pcs itself.
    Frame,
}

pub struct Eval<'a> {
    ctx: &'a mut Context,
}

impl<'a> Eval<'a> {
    pub fn new(ctx: &'a mut Context) -> Self {
        Eval { ctx }
    }

    /// Run until the current frame chain unwinds to null, a cancel/stop
    /// flag is raised, or the engine itself errors.
    pub fn run(&mut self) {
        loop {
            if self.ctx.flag(flags::CANCEL | flags::STOP) || self.ctx.host_error.is_some() {
                break;
            }
            match self.step() {
                StepResult::Halted => break,
                StepResult::Continued | StepResult::Faulted(_) => {}
            }
        }
    }

    /// Execute one instruction at the current frame's program counter.
    pub fn step(&mut self) -> StepResult {
        let frame = self.ctx.frame();
        if frame.is_null() {
            return StepResult::Halted;
        }
        let pc = match self.ctx.pc() {
            Ok(pc) => pc,
            Err(fault) => return self.fail(fault),
        };
        let program = self.ctx.program().clone();
        let Some(function) = program.function(pc.obj()) else {
            return self.fail(Fault::new(FaultKind::Control, pc, frame, "pc outside the program"));
        };
        let Some(instruction) = function.instructions.get(pc.offset() as usize) else {
            return self.fail(Fault::new(FaultKind::Control, pc, frame, "pc past end of function"));
        };

        self.ctx.instruction_counter += 1;
        if self.ctx.step_budget_exceeded() {
            let fault = Fault::new(FaultKind::Control, pc, frame, "step instruction budget exceeded");
            self.ctx.trace.push(TraceEvent::Fault(fault.describe(&program)));
            self.ctx.fault = Some(fault.clone());
            self.ctx.regs.set_flag(flags::ERROR | flags::CANCEL);
            return StepResult::Faulted(fault);
        }

        match self.execute(&program, function, frame, pc, instruction) {
            Ok(Flow::Next) => match self.ctx.set_pc(program.advance(pc)) {
                Ok(()) => StepResult::Continued,
                Err(fault) => self.fail(fault),
            },
            Ok(Flow::Jump(index)) => match self.ctx.set_pc(pc.with_offset(index)) {
                Ok(()) => StepResult::Continued,
                Err(fault) => self.fail(fault),
            },
            Ok(Flow::Frame) => StepResult::Continued,
            Err(fault) => self.fail(fault),
        }
    }

    /// Route a fault: trace it, then consult `IgnoreFault`, the registered
    /// handler, and the double-fault rule, in that order.
    fn fail(&mut self, fault: Fault) -> StepResult {
        let program = self.ctx.program().clone();
        let line = fault.describe(&program);
        tracing::debug!(target: "kripke::vm", "{line}");
        self.ctx.trace.push(TraceEvent::Fault(line));
        self.ctx.fault = Some(fault.clone());

        if self.ctx.flag(flags::IGNORE_FAULT) {
            // continue past the faulting instruction
            if let Ok(pc) = self.ctx.pc() {
                let _ = self.ctx.set_pc(program.advance(pc));
            }
            return StepResult::Continued;
        }

        let handler = self.ctx.regs.pointer(ControlReg::FaultHandler);
        let deliverable = handler.tag() == Some(PointerTag::Code) && self.ctx.enter_fault_handler();
        if !deliverable {
            self.ctx.regs.set_flag(flags::ERROR | flags::CANCEL);
            return StepResult::Faulted(fault);
        }

        let args = [
            CallArg::value(fault.kind as u64),
            CallArg::value(fault.pc.raw()),
            CallArg::value(fault.frame.raw()),
        ];
        match self.ctx.enter(handler.obj(), &args) {
            Ok(()) => {
                self.ctx.regs.set_flag(flags::KERNEL_MODE | flags::MASK);
                StepResult::Continued
            }
            Err(_) => {
                self.ctx.regs.set_flag(flags::ERROR | flags::CANCEL);
                StepResult::Faulted(fault)
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn execute(
        &mut self,
        program: &Program,
        function: &Function,
        frame: Pointer,
        pc: Pointer,
        instruction: &Instruction,
    ) -> Result<Flow, Fault> {
        use Opcode::*;

        let ops = &instruction.operands;
        match instruction.opcode {
            Add | Sub | Mul | UDiv | SDiv | URem | SRem | And | Or | Xor | Shl | LShr | AShr => {
                let (a, ta) = self.value(program, function, frame, &ops[0])?;
                let (b, tb) = self.value(program, function, frame, &ops[1])?;
                let width = self.result_width(function, instruction)?;
                let value = self.int_arith(instruction.opcode, a, b, width)?;
                let tainted = ta || tb;
                if tainted {
                    self.ctx.lift(instruction.opcode, &[a, b], pc.raw());
                }
                self.set_result(function, frame, instruction, value, tainted)?;
                Ok(Flow::Next)
            }

            FAdd | FSub | FMul | FDiv | FRem => {
                let (a, ta) = self.value(program, function, frame, &ops[0])?;
                let (b, tb) = self.value(program, function, frame, &ops[1])?;
                let width = self.result_width(function, instruction)?;
                let value = self.float_arith(instruction.opcode, a, b, width)?;
                let tainted = ta || tb;
                if tainted {
                    self.ctx.lift(instruction.opcode, &[a, b], pc.raw());
                }
                self.set_result(function, frame, instruction, value, tainted)?;
                Ok(Flow::Next)
            }

            IEq | INe | IUlt | IUle | IUgt | IUge | ISlt | ISle | ISgt | ISge => {
                let (a, ta) = self.value(program, function, frame, &ops[0])?;
                let (b, tb) = self.value(program, function, frame, &ops[1])?;
                let width = operand_width(function, ops);
                let value = int_compare(instruction.opcode, a, b, width);
                let tainted = ta || tb;
                if tainted {
                    self.ctx.lift(instruction.opcode, &[a, b], pc.raw());
                }
                self.set_result(function, frame, instruction, u64::from(value), tainted)?;
                Ok(Flow::Next)
            }

            FOeq | FOne | FOlt | FOle | FOgt | FOge | FOrd | FUno => {
                let (a, ta) = self.value(program, function, frame, &ops[0])?;
                let (b, tb) = self.value(program, function, frame, &ops[1])?;
                let width = operand_width(function, ops);
                let value = self.float_compare(instruction.opcode, a, b, width)?;
                let tainted = ta || tb;
                if tainted {
                    self.ctx.lift(instruction.opcode, &[a, b], pc.raw());
                }
                self.set_result(function, frame, instruction, u64::from(value), tainted)?;
                Ok(Flow::Next)
            }

            Trunc | ZExt | Mov => {
                let (a, ta) = self.value(program, function, frame, &ops[0])?;
                self.set_result(function, frame, instruction, a, ta)?;
                Ok(Flow::Next)
            }

            SExt => {
                let (a, ta) = self.value(program, function, frame, &ops[0])?;
                let src_width = operand_width(function, ops);
                self.set_result(function, frame, instruction, sext(a, src_width), ta)?;
                Ok(Flow::Next)
            }

            FpToSi => {
                let (a, ta) = self.value(program, function, frame, &ops[0])?;
                let src_width = operand_width(function, ops);
                let float = self.as_float(a, src_width)?;
                if float.is_nan() || float >= 9.3e18 || float <= -9.3e18 {
                    return Err(self.fault(FaultKind::Float, format!("{float} is not representable")));
                }
                self.set_result(function, frame, instruction, float as i64 as u64, ta)?;
                Ok(Flow::Next)
            }

            SiToFp => {
                let (a, ta) = self.value(program, function, frame, &ops[0])?;
                let src_width = operand_width(function, ops);
                let int = sext(a, src_width) as i64;
                let width = self.result_width(function, instruction)?;
                let bits = match width {
                    4 => u64::from((int as f32).to_bits()),
                    8 => (int as f64).to_bits(),
                    _ => return Err(self.fault(FaultKind::Float, "bad float width")),
                };
                self.set_result(function, frame, instruction, bits, ta)?;
                Ok(Flow::Next)
            }

            Alloca => {
                let (size, _) = self.value(program, function, frame, &ops[0])?;
                if size > OFFSET_MASK {
                    return Err(self.fault(FaultKind::Memory, format!("allocation of {size} bytes")));
                }
                let ptr = self.ctx.heap.make(size as u32);
                self.set_result(function, frame, instruction, ptr.raw(), false)?;
                Ok(Flow::Next)
            }

            Load => {
                let addr = self.pointer_value(program, function, frame, &ops[0])?;
                let info = self.result_info(function, instruction)?;
                let (bits, tainted) = if info.is_pointer {
                    let p = self.ctx.heap.read_pointer(addr).map_err(|e| self.mem(e))?;
                    (p.raw(), self.ctx.heap.tainted(addr, 8).map_err(|e| self.mem(e))?)
                } else {
                    let width = u32::from(info.width);
                    (
                        self.ctx.heap.read(addr, width).map_err(|e| self.mem(e))?,
                        self.ctx.heap.tainted(addr, width).map_err(|e| self.mem(e))?,
                    )
                };
                self.set_result(function, frame, instruction, bits, tainted)?;
                Ok(Flow::Next)
            }

            Store => {
                let (bits, tainted) = self.value(program, function, frame, &ops[0])?;
                let addr = self.pointer_value(program, function, frame, &ops[1])?;
                let (width, as_pointer) = match ops[0] {
                    Operand::Reg(slot) => {
                        let info = function.slots[slot as usize];
                        (u32::from(info.width), info.is_pointer)
                    }
                    Operand::Global(_) | Operand::Const(_) => (8, true),
                    _ => (8, false),
                };
                if as_pointer {
                    self.ctx
                        .heap
                        .write_pointer(addr, Pointer::from_raw(bits))
                        .map_err(|e| self.mem(e))?;
                } else {
                    self.ctx.heap.write(addr, width, bits).map_err(|e| self.mem(e))?;
                }
                if tainted {
                    self.ctx.heap.set_taint(addr, width, true).map_err(|e| self.mem(e))?;
                }
                Ok(Flow::Next)
            }

            Gep => {
                let base = self.pointer_value(program, function, frame, &ops[0])?;
                let (delta, _) = self.value(program, function, frame, &ops[1])?;
                let result = base.add_offset(delta as i64);
                self.set_result(function, frame, instruction, result.raw(), false)?;
                Ok(Flow::Next)
            }

            Br => {
                if ops.len() == 1 {
                    return Ok(Flow::Jump(block_target(function, &ops[0]).map_err(|m| self.fault(FaultKind::Control, m))?));
                }
                let (cond, tainted) = self.value(program, function, frame, &ops[0])?;
                let polarity = if tainted {
                    let p = self.ctx.branch_feasible(pc.raw())?;
                    if self.ctx.flag(flags::CANCEL) || self.ctx.host_error.is_some() {
                        return Ok(Flow::Next);
                    }
                    p
                } else {
                    cond != 0
                };
                let target = if polarity { &ops[1] } else { &ops[2] };
                Ok(Flow::Jump(block_target(function, target).map_err(|m| self.fault(FaultKind::Control, m))?))
            }

            Switch => {
                let (value, tainted) = self.value(program, function, frame, &ops[0])?;
                if tainted {
                    return Err(self.fault(FaultKind::NotImplemented, "switch on a symbolic value"));
                }
                let mut target = &ops[1];
                for case in ops[2..].chunks_exact(2) {
                    if let Operand::Imm(v) = case[0] {
                        if v == value {
                            target = &case[1];
                            break;
                        }
                    }
                }
                Ok(Flow::Jump(block_target(function, target).map_err(|m| self.fault(FaultKind::Control, m))?))
            }

            Ret => self.ret(program, function, frame, ops),

            Call | Invoke => {
                let arg_start = if instruction.opcode == Call { 1 } else { 3 };
                let callee = self.callee(program, function, frame, &ops[0])?;
                let mut args = Vec::with_capacity(ops.len() - arg_start);
                for op in &ops[arg_start..] {
                    let (bits, tainted) = self.value(program, function, frame, op)?;
                    args.push(CallArg { bits, tainted });
                }
                self.ctx.enter(callee, &args)?;
                Ok(Flow::Frame)
            }

            Hypercall => self.hypercall(program, function, frame, pc, instruction),
        }
    }

    fn hypercall(
        &mut self,
        program: &Program,
        function: &Function,
        frame: Pointer,
        pc: Pointer,
        instruction: &Instruction,
    ) -> Result<Flow, Fault> {
        let Some(&Operand::Imm(code_raw)) = instruction.operands.first() else {
            return Err(self.fault(FaultKind::Hypercall, "hypercall code must be immediate"));
        };
        let Some(code) = HypercallCode::from_raw(code_raw) else {
            return Err(self.fault(FaultKind::Hypercall, format!("unknown hypercall {code_raw:#x}")));
        };
        let arg_ops = &instruction.operands[1..];
        if arg_ops.len() != code.arg_count() {
            return Err(self.fault(
                FaultKind::Hypercall,
                format!("{code} takes {} arguments, got {}", code.arg_count(), arg_ops.len()),
            ));
        }
        let mut args = Vec::with_capacity(arg_ops.len());
        for op in arg_ops {
            args.push(self.value(program, function, frame, op)?.0);
        }

        let map = self.ctx.hypercalls();
        let Some(call) = map.get(&code) else {
            return Err(self.fault(FaultKind::NotImplemented, format!("{code} is not installed")));
        };

        // park the continuation before dispatch so frame switches leave
        // this frame resumable past the call site
        self.ctx.set_pc(program.advance(pc))?;
        match call.invoke(self.ctx, &args) {
            Ok(result) => {
                if self.ctx.frame() == frame {
                    if let Some(bits) = result {
                        self.set_result(function, frame, instruction, bits, false)?;
                    }
                }
                Ok(Flow::Frame)
            }
            Err(fault) => {
                // un-park: the fault machinery sees the faulting site
                self.ctx.set_pc(pc)?;
                Err(fault)
            }
        }
    }

    fn ret(
        &mut self,
        program: &Program,
        function: &Function,
        frame: Pointer,
        ops: &[Operand],
    ) -> Result<Flow, Fault> {
        let value = match ops.first() {
            Some(op) => Some(self.value(program, function, frame, op)?),
            None => None,
        };
        let parent = self
            .ctx
            .heap
            .read_pointer(frame.add_offset(i64::from(FRAME_PARENT)))
            .map_err(|e| self.mem(e))?;
        self.ctx.heap.free(frame).map_err(|e| self.mem(e))?;

        if parent.is_null() {
            self.ctx.regs.set_pointer(ControlReg::Frame, Pointer::NULL);
            return Ok(Flow::Frame);
        }

        let caller_pc = self
            .ctx
            .heap
            .read_pointer(parent.add_offset(i64::from(FRAME_PC)))
            .map_err(|e| self.mem(e))?;
        let caller = program
            .function(caller_pc.obj())
            .ok_or_else(|| self.fault(FaultKind::Control, "return into an invalid frame"))?;
        let site = caller.instructions.get(caller_pc.offset() as usize);

        if let Some(site) = site.filter(|i| matches!(i.opcode, Opcode::Call | Opcode::Invoke)) {
            if let (Some(slot), Some((bits, tainted))) = (site.result, value) {
                let info = caller.slots[slot as usize];
                let at = parent.add_offset(i64::from(info.offset));
                if info.is_pointer {
                    self.ctx
                        .heap
                        .write_pointer(at, Pointer::from_raw(bits))
                        .map_err(|e| self.mem(e))?;
                } else {
                    self.ctx
                        .heap
                        .write(at, u32::from(info.width), bits)
                        .map_err(|e| self.mem(e))?;
                }
                if tainted {
                    self.ctx
                        .heap
                        .set_taint(at, u32::from(info.width), true)
                        .map_err(|e| self.mem(e))?;
                }
            }
            let next = match site.opcode {
                Opcode::Invoke => {
                    let index = block_target(caller, &site.operands[1])
                        .map_err(|m| self.fault(FaultKind::Control, m))?;
                    caller_pc.with_offset(index)
                }
                _ => caller_pc.add_offset(1),
            };
            self.ctx
                .heap
                .write_pointer(parent.add_offset(i64::from(FRAME_PC)), next)
                .map_err(|e| self.mem(e))?;
        }
        // frames not suspended at a call (fault handler, loop-guard
        // continuation) resume exactly where they parked

        self.ctx.regs.set_pointer(ControlReg::Frame, parent);
        Ok(Flow::Frame)
    }

    fn callee(
        &mut self,
        program: &Program,
        function: &Function,
        frame: Pointer,
        op: &Operand,
    ) -> Result<u32, Fault> {
        match *op {
            Operand::Func(f) => Ok(f),
            _ => {
                let (bits, _) = self.value(program, function, frame, op)?;
                let ptr = Pointer::from_raw(bits);
                if ptr.tag() == Some(PointerTag::Code) {
                    Ok(ptr.obj())
                } else {
                    Err(self.fault(FaultKind::Control, "call through a non-code pointer"))
                }
            }
        }
    }

    /// Evaluate an operand to raw bits plus its taint.
    fn value(
        &self,
        program: &Program,
        function: &Function,
        frame: Pointer,
        op: &Operand,
    ) -> Result<(u64, bool), Fault> {
        match *op {
            Operand::Reg(slot) => {
                let info = function.slots[slot as usize];
                let at = frame.add_offset(i64::from(info.offset));
                let width = u32::from(info.width);
                let bits = if info.is_pointer {
                    self.ctx.heap.read_pointer(at).map_err(|e| self.mem(e))?.raw()
                } else {
                    self.ctx.heap.read(at, width).map_err(|e| self.mem(e))?
                };
                let tainted = self.ctx.heap.tainted(at, width).map_err(|e| self.mem(e))?;
                Ok((bits, tainted))
            }
            Operand::Imm(v) => Ok((v, false)),
            Operand::Global(index) => {
                let item = &program.globals[index as usize];
                let base = self.ctx.regs.pointer(ControlReg::Globals);
                Ok((base.add_offset(i64::from(item.offset)).raw(), false))
            }
            Operand::Const(index) => {
                let item = &program.constants[index as usize];
                let base = self.ctx.regs.pointer(ControlReg::Constants);
                Ok((base.add_offset(i64::from(item.offset)).raw(), false))
            }
            Operand::Func(f) => Ok((Pointer::code(f, 0).raw(), false)),
            Operand::Block(b) => Ok((u64::from(b), false)),
        }
    }

    fn pointer_value(
        &self,
        program: &Program,
        function: &Function,
        frame: Pointer,
        op: &Operand,
    ) -> Result<Pointer, Fault> {
        Ok(Pointer::from_raw(self.value(program, function, frame, op)?.0))
    }

    fn set_result(
        &mut self,
        function: &Function,
        frame: Pointer,
        instruction: &Instruction,
        bits: u64,
        tainted: bool,
    ) -> Result<(), Fault> {
        let Some(slot) = instruction.result else { return Ok(()) };
        let info = function.slots[slot as usize];
        let at = frame.add_offset(i64::from(info.offset));
        let width = u32::from(info.width);
        if info.is_pointer {
            self.ctx
                .heap
                .write_pointer(at, Pointer::from_raw(bits))
                .map_err(|e| self.mem(e))?;
        } else {
            self.ctx
                .heap
                .write(at, width, bits & width_mask(info.width))
                .map_err(|e| self.mem(e))?;
        }
        if tainted {
            self.ctx.heap.set_taint(at, width, true).map_err(|e| self.mem(e))?;
        }
        Ok(())
    }

    fn result_info(
        &self,
        function: &Function,
        instruction: &Instruction,
    ) -> Result<crate::compiler::ir::SlotInfo, Fault> {
        instruction
            .result
            .map(|slot| function.slots[slot as usize])
            .ok_or_else(|| self.fault(FaultKind::Control, format!("{} without a result", instruction.opcode)))
    }

    fn result_width(&self, function: &Function, instruction: &Instruction) -> Result<u8, Fault> {
        Ok(self.result_info(function, instruction)?.width)
    }

    fn int_arith(&self, op: Opcode, a: u64, b: u64, width: u8) -> Result<u64, Fault> {
        let mask = width_mask(width);
        let (a, b) = (a & mask, b & mask);
        let sa = sext(a, width) as i64;
        let sb = sext(b, width) as i64;
        let bits = u32::from(width) * 8;
        let value = match op {
            Opcode::Add => a.wrapping_add(b),
            Opcode::Sub => a.wrapping_sub(b),
            Opcode::Mul => a.wrapping_mul(b),
            Opcode::UDiv => {
                if b == 0 {
                    return Err(self.fault(FaultKind::Integer, "division by zero"));
                }
                a / b
            }
            Opcode::SDiv => {
                if b == 0 {
                    return Err(self.fault(FaultKind::Integer, "division by zero"));
                }
                if sa == sext(mask ^ (mask >> 1), width) as i64 && sb == -1 {
                    return Err(self.fault(FaultKind::Integer, "division overflow"));
                }
                (sa / sb) as u64
            }
            Opcode::URem => {
                if b == 0 {
                    return Err(self.fault(FaultKind::Integer, "remainder by zero"));
                }
                a % b
            }
            Opcode::SRem => {
                if b == 0 {
                    return Err(self.fault(FaultKind::Integer, "remainder by zero"));
                }
                (sa.wrapping_rem(sb)) as u64
            }
            Opcode::And => a & b,
            Opcode::Or => a | b,
            Opcode::Xor => a ^ b,
            // shift counts wrap at the value width
            Opcode::Shl => a.wrapping_shl(b as u32 % bits),
            Opcode::LShr => a.wrapping_shr(b as u32 % bits),
            Opcode::AShr => ((sa) >> (b as u32 % bits)) as u64,
            _ => unreachable!("not an integer op"),
        };
        Ok(value & mask)
    }

    fn float_arith(&self, op: Opcode, a: u64, b: u64, width: u8) -> Result<u64, Fault> {
        // division by zero and overflow follow IEEE-754 (inf/NaN), only
        // unrepresentable conversions fault
        match width {
            4 => {
                let (x, y) = (f32::from_bits(a as u32), f32::from_bits(b as u32));
                let value = match op {
                    Opcode::FAdd => x + y,
                    Opcode::FSub => x - y,
                    Opcode::FMul => x * y,
                    Opcode::FDiv => x / y,
                    Opcode::FRem => x % y,
                    _ => unreachable!("not a float op"),
                };
                Ok(u64::from(value.to_bits()))
            }
            8 => {
                let (x, y) = (f64::from_bits(a), f64::from_bits(b));
                let value = match op {
                    Opcode::FAdd => x + y,
                    Opcode::FSub => x - y,
                    Opcode::FMul => x * y,
                    Opcode::FDiv => x / y,
                    Opcode::FRem => x % y,
                    _ => unreachable!("not a float op"),
                };
                Ok(value.to_bits())
            }
            _ => Err(self.fault(FaultKind::Float, format!("bad float width {width}"))),
        }
    }

    fn float_compare(&self, op: Opcode, a: u64, b: u64, width: u8) -> Result<bool, Fault> {
        let x = self.as_float(a, width)?;
        let y = self.as_float(b, width)?;
        let unordered = x.is_nan() || y.is_nan();
        Ok(match op {
            Opcode::FOeq => !unordered && x == y,
            Opcode::FOne => !unordered && x != y,
            Opcode::FOlt => !unordered && x < y,
            Opcode::FOle => !unordered && x <= y,
            Opcode::FOgt => !unordered && x > y,
            Opcode::FOge => !unordered && x >= y,
            Opcode::FOrd => !unordered,
            Opcode::FUno => unordered,
            _ => unreachable!("not a float comparison"),
        })
    }

    fn as_float(&self, bits: u64, width: u8) -> Result<f64, Fault> {
        match width {
            4 => Ok(f64::from(f32::from_bits(bits as u32))),
            8 => Ok(f64::from_bits(bits)),
            _ => Err(self.fault(FaultKind::Float, format!("bad float width {width}"))),
        }
    }

    fn fault(&self, kind: FaultKind, message: impl Into<String>) -> Fault {
        self.ctx.fault_here(kind, message)
    }

    fn mem(&self, e: crate::heap::HeapError) -> Fault {
        self.ctx.fault_here(FaultKind::Memory, e.to_string())
    }
}

fn int_compare(op: Opcode, a: u64, b: u64, width: u8) -> bool {
    let mask = width_mask(width);
    let (ua, ub) = (a & mask, b & mask);
    let (sa, sb) = (sext(ua, width) as i64, sext(ub, width) as i64);
    match op {
        Opcode::IEq => ua == ub,
        Opcode::INe => ua != ub,
        Opcode::IUlt => ua < ub,
        Opcode::IUle => ua <= ub,
        Opcode::IUgt => ua > ub,
        Opcode::IUge => ua >= ub,
        Opcode::ISlt => sa < sb,
        Opcode::ISle => sa <= sb,
        Opcode::ISgt => sa > sb,
        Opcode::ISge => sa >= sb,
        _ => unreachable!("not an integer comparison"),
    }
}

fn block_target(function: &Function, op: &Operand) -> Result<u32, String> {
    match *op {
        Operand::Block(b) => Ok(function.block_start(b)),
        _ => Err("expected a block operand".to_owned()),
    }
}

/// Width of the first register operand, defaulting to 8 for immediates.
fn operand_width(function: &Function, ops: &[Operand]) -> u8 {
    ops.iter()
        .find_map(|op| match *op {
            Operand::Reg(slot) => Some(function.slots[slot as usize].width),
            _ => None,
        })
        .unwrap_or(8)
}

fn width_mask(width: u8) -> u64 {
    match width {
        8 => u64::MAX,
        w => (1u64 << (u32::from(w) * 8)) - 1,
    }
}

/// Sign-extend `value` from `width` bytes to 64 bits.
fn sext(value: u64, width: u8) -> u64 {
    let bits = u32::from(width) * 8;
    if bits >= 64 {
        return value;
    }
    let shift = 64 - bits;
    (((value << shift) as i64) >> shift) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compiler::ir::{Opcode, Operand::*, ProgramBuilder},
        emulator::context::Context,
        opts::ExploreOpts,
    };
    use std::sync::Arc;

    /// Build a one-function program, enter it, and run to completion.
    fn run(build: impl FnOnce(&mut crate::compiler::ir::FunctionBuilder)) -> Context {
        let mut b = ProgramBuilder::new();
        b.function("f", build);
        let mut ctx = Context::new(Arc::new(b.finish()), ExploreOpts::test_opts());
        ctx.enter(0, &[]).unwrap();
        Eval::new(&mut ctx).run();
        ctx
    }

    fn slot_value(ctx: &Context, offset: u32, width: u32) -> u64 {
        // the frame was freed by Ret, so faulting programs are inspected
        // through their fault instead; this helper is for mid-frame checks
        ctx.heap.read(ctx.frame().add_offset(i64::from(offset)), width).unwrap()
    }

    #[test]
    fn arithmetic_wraps_at_result_width() {
        let ctx = run(|f| {
            let x = f.slot(4, false);
            f.push(Opcode::Add, Some(x), vec![Imm(0xFFFF_FFFF), Imm(2)]);
            // stop instead of returning so the frame survives inspection
            f.push(
                Opcode::Hypercall,
                None,
                vec![Imm(HypercallCode::CtlFlag as u64), Imm(0), Imm(flags::STOP)],
            );
            f.push(Opcode::Ret, None, vec![]);
        });
        assert_eq!(slot_value(&ctx, 16, 4), 1);
    }

    #[test]
    fn signed_compare_uses_operand_width() {
        let ctx = run(|f| {
            let x = f.slot(4, false);
            let lt = f.slot(1, false);
            f.push(Opcode::Mov, Some(x), vec![Imm(0xFFFF_FFFF)]); // -1 at width 4
            f.push(Opcode::ISlt, Some(lt), vec![Reg(x), Imm(0)]);
            f.push(
                Opcode::Hypercall,
                None,
                vec![Imm(HypercallCode::CtlFlag as u64), Imm(0), Imm(flags::STOP)],
            );
            f.push(Opcode::Ret, None, vec![]);
        });
        assert_eq!(slot_value(&ctx, 20, 1), 1);
    }

    #[test]
    fn division_by_zero_faults_integer() {
        let ctx = run(|f| {
            let x = f.slot(8, false);
            f.push(Opcode::UDiv, Some(x), vec![Imm(1), Imm(0)]);
            f.push(Opcode::Ret, None, vec![]);
        });
        let fault = ctx.fault.as_ref().expect("division must fault");
        assert_eq!(fault.kind, FaultKind::Integer);
        assert!(ctx.flag(flags::ERROR | flags::CANCEL));
    }

    #[test]
    fn signed_division_overflow_faults() {
        let ctx = run(|f| {
            let x = f.slot(4, false);
            f.push(Opcode::SDiv, Some(x), vec![Imm(0x8000_0000), Imm(0xFFFF_FFFF)]);
            f.push(Opcode::Ret, None, vec![]);
        });
        assert_eq!(ctx.fault.unwrap().kind, FaultKind::Integer);
    }

    #[test]
    fn float_division_by_zero_follows_ieee() {
        let ctx = run(|f| {
            let x = f.slot(8, false);
            f.push(Opcode::FDiv, Some(x), vec![Imm(1.0f64.to_bits()), Imm(0.0f64.to_bits())]);
            f.push(
                Opcode::Hypercall,
                None,
                vec![Imm(HypercallCode::CtlFlag as u64), Imm(0), Imm(flags::STOP)],
            );
            f.push(Opcode::Ret, None, vec![]);
        });
        assert!(ctx.fault.is_none());
        assert_eq!(f64::from_bits(slot_value(&ctx, 16, 8)), f64::INFINITY);
    }

    #[test]
    fn nan_comparisons_are_unordered_and_do_not_fault() {
        let nan = f64::NAN.to_bits();
        let ctx = run(|f| {
            let eq = f.slot(1, false);
            let uno = f.slot(1, false);
            f.push(Opcode::FOeq, Some(eq), vec![Imm(nan), Imm(nan)]);
            f.push(Opcode::FUno, Some(uno), vec![Imm(nan), Imm(1.0f64.to_bits())]);
            f.push(
                Opcode::Hypercall,
                None,
                vec![Imm(HypercallCode::CtlFlag as u64), Imm(0), Imm(flags::STOP)],
            );
            f.push(Opcode::Ret, None, vec![]);
        });
        assert!(ctx.fault.is_none());
        assert_eq!(slot_value(&ctx, 16, 1), 0);
        assert_eq!(slot_value(&ctx, 17, 1), 1);
    }

    #[test]
    fn out_of_bounds_store_faults_memory() {
        let ctx = run(|f| {
            let p = f.ptr_slot();
            f.push(Opcode::Alloca, Some(p), vec![Imm(8)]);
            let q = f.ptr_slot();
            f.push(Opcode::Gep, Some(q), vec![Reg(p), Imm(8)]);
            f.push(Opcode::Store, None, vec![Imm(1), Reg(q)]);
            f.push(Opcode::Ret, None, vec![]);
        });
        assert_eq!(ctx.fault.unwrap().kind, FaultKind::Memory);
    }

    #[test]
    fn calls_pass_arguments_and_return_values() {
        let mut b = ProgramBuilder::new();
        let callee = b.declare("double");
        b.function("f", |f| {
            let r = f.slot(8, false);
            f.push(Opcode::Call, Some(r), vec![Func(callee), Imm(21)]);
            f.push(
                Opcode::Hypercall,
                None,
                vec![Imm(HypercallCode::CtlFlag as u64), Imm(0), Imm(flags::STOP)],
            );
            f.push(Opcode::Ret, None, vec![]);
        });
        b.define(callee, |f| {
            let a = f.param(8, false);
            let r = f.slot(8, false);
            f.push(Opcode::Add, Some(r), vec![Reg(a), Reg(a)]);
            f.push(Opcode::Ret, None, vec![Reg(r)]);
        });
        let mut ctx = Context::new(Arc::new(b.finish()), ExploreOpts::test_opts());
        ctx.enter(0, &[]).unwrap();
        Eval::new(&mut ctx).run();
        assert!(ctx.fault.is_none());
        assert_eq!(slot_value(&ctx, 16, 8), 42);
    }

    #[test]
    fn fault_handler_absorbs_faults() {
        let mut b = ProgramBuilder::new();
        let handler = b.declare("handler");
        b.function("f", |f| {
            let x = f.slot(8, false);
            f.push(Opcode::UDiv, Some(x), vec![Imm(1), Imm(0)]);
            f.push(Opcode::Ret, None, vec![]);
        });
        b.define(handler, |f| {
            let _kind = f.param(8, false);
            let _pc = f.param(8, false);
            let _frame = f.param(8, false);
            f.push(
                Opcode::Hypercall,
                None,
                vec![Imm(HypercallCode::CtlFlag as u64), Imm(0), Imm(flags::CANCEL)],
            );
            f.push(Opcode::Ret, None, vec![]);
        });
        let mut ctx = Context::new(Arc::new(b.finish()), ExploreOpts::test_opts());
        ctx.regs.set_pointer(ControlReg::FaultHandler, Pointer::code(handler, 0));
        ctx.enter(0, &[]).unwrap();
        Eval::new(&mut ctx).run();
        // the handler saw the fault and cancelled: no error flag
        assert!(ctx.fault.is_some());
        assert!(ctx.flag(flags::CANCEL));
        assert!(!ctx.flag(flags::ERROR));
    }

    #[test]
    fn ignore_fault_continues_past_the_instruction() {
        let mut b = ProgramBuilder::new();
        b.function("f", |f| {
            let x = f.slot(8, false);
            let y = f.slot(8, false);
            f.push(Opcode::UDiv, Some(x), vec![Imm(1), Imm(0)]);
            f.push(Opcode::Mov, Some(y), vec![Imm(7)]);
            f.push(
                Opcode::Hypercall,
                None,
                vec![Imm(HypercallCode::CtlFlag as u64), Imm(0), Imm(flags::STOP)],
            );
            f.push(Opcode::Ret, None, vec![]);
        });
        let mut ctx = Context::new(Arc::new(b.finish()), ExploreOpts::test_opts());
        ctx.regs.set_flag(flags::IGNORE_FAULT);
        ctx.enter(0, &[]).unwrap();
        Eval::new(&mut ctx).run();
        assert!(ctx.fault.is_some());
        assert!(!ctx.flag(flags::ERROR));
        assert_eq!(slot_value(&ctx, 24, 8), 7);
    }

    #[test]
    fn runaway_steps_hit_the_instruction_budget() {
        let ctx = run(|f| {
            let spin = f.block();
            f.push(Opcode::Br, None, vec![Block(spin)]);
            f.select(spin);
            f.push(Opcode::Br, None, vec![Block(spin)]);
        });
        let fault = ctx.fault.unwrap();
        assert_eq!(fault.kind, FaultKind::Control);
        assert!(fault.message.contains("budget"));
    }

    #[test]
    fn tainted_branches_become_recorded_choices() {
        let ctx = run(|f| {
            let p = f.ptr_slot();
            let x = f.slot(8, false);
            let then_b = f.block();
            let else_b = f.block();
            f.push(Opcode::Alloca, Some(p), vec![Imm(8)]);
            f.push(
                Opcode::Hypercall,
                None,
                vec![Imm(HypercallCode::Poke as u64), Reg(p), Imm(1), Imm(1)],
            );
            f.push(Opcode::Load, Some(x), vec![Reg(p)]);
            f.push(Opcode::Br, None, vec![Reg(x), Block(then_b), Block(else_b)]);
            f.select(then_b);
            f.push(
                Opcode::Hypercall,
                None,
                vec![Imm(HypercallCode::CtlFlag as u64), Imm(0), Imm(flags::STOP)],
            );
            f.push(Opcode::Ret, None, vec![]);
            f.select(else_b);
            f.push(
                Opcode::Hypercall,
                None,
                vec![Imm(HypercallCode::CtlFlag as u64), Imm(0), Imm(flags::STOP)],
            );
            f.push(Opcode::Ret, None, vec![]);
        });
        // with the trivial oracle both sides are feasible, so the branch
        // was a recorded two-way choice carrying a path constraint
        assert_eq!(ctx.choices.entries().len(), 1);
        assert_eq!(ctx.choices.entries()[0].total, 2);
        assert_eq!(ctx.path.constraints.len(), 1);
    }

    #[test]
    fn tainted_results_consult_the_lifter() {
        use crate::symbolic::{Lifter, LifterRegistry};

        struct Record;
        impl Lifter for Record {
            fn lift(&self, _op: Opcode, inputs: &[u64]) -> Option<Arc<[u8]>> {
                Some(inputs.iter().flat_map(|v| v.to_le_bytes()).collect())
            }
        }

        let mut b = ProgramBuilder::new();
        b.function("f", |f| {
            let p = f.ptr_slot();
            let x = f.slot(8, false);
            let y = f.slot(8, false);
            f.push(Opcode::Alloca, Some(p), vec![Imm(8)]);
            f.push(
                Opcode::Hypercall,
                None,
                vec![Imm(HypercallCode::Poke as u64), Reg(p), Imm(1), Imm(1)],
            );
            f.push(Opcode::Load, Some(x), vec![Reg(p)]);
            f.push(Opcode::Add, Some(y), vec![Reg(x), Imm(5)]);
            f.push(
                Opcode::Hypercall,
                None,
                vec![Imm(HypercallCode::CtlFlag as u64), Imm(0), Imm(flags::STOP)],
            );
            f.push(Opcode::Ret, None, vec![]);
        });
        let mut registry = LifterRegistry::new();
        registry.register(0, Arc::new(Record));
        let mut ctx = Context::new(Arc::new(b.finish()), ExploreOpts::test_opts());
        ctx.set_lifters(Arc::new(registry));
        ctx.enter(0, &[]).unwrap();
        Eval::new(&mut ctx).run();

        assert_eq!(ctx.path.constraints.len(), 1);
        assert!(ctx.path.constraints[0].formula.is_some());
        // taint propagated through the add into the result slot
        assert!(ctx.heap.tainted(ctx.frame().add_offset(32), 8).unwrap());
    }

    #[test]
    fn width_helpers() {
        assert_eq!(width_mask(1), 0xFF);
        assert_eq!(width_mask(8), u64::MAX);
        assert_eq!(sext(0xFF, 1), u64::MAX);
        assert_eq!(sext(0x7F, 1), 0x7F);
        assert_eq!(sext(0x8000_0000, 4) as i64, i64::from(i32::MIN));
    }
}
