//! Small guest kernels used across the test suite. Each builds a complete
//! module: a `__boot` that constructs the state object and registers the
//! scheduler, plus the scheduler (and threads) driving the behaviour under
//! test.

use std::sync::Arc;

use crate::{
    compiler::ir::{
        builder::FunctionBuilder,
        instruction::{Operand, SlotId},
        Opcode, Program, ProgramBuilder,
    },
    emulator::{flags, regs::ControlReg, FaultKind, HypercallCode},
    heap::PointerTag,
};

use Operand::{Block, Func, Imm, Reg};

/// Append a hypercall instruction.
pub fn hc(f: &mut FunctionBuilder, code: HypercallCode, result: Option<SlotId>, args: Vec<Operand>) {
    let mut operands = vec![Imm(code as u64)];
    operands.extend(args);
    f.push(Opcode::Hypercall, result, operands);
}

fn ctl(reg: ControlReg) -> Operand {
    Imm(reg as u64)
}

/// Counter to zero: the boot state holds `n`; the scheduler decrements by
/// one per step and cancels at zero. `n + 1` states, `n` edges, no error.
#[must_use]
pub fn counter(n: u64) -> Arc<Program> {
    let mut b = ProgramBuilder::new();
    let sched = b.declare("scheduler");
    b.function("__boot", |f| {
        let s = f.ptr_slot();
        hc(f, HypercallCode::ObjMake, Some(s), vec![Imm(8)]);
        f.push(Opcode::Store, None, vec![Imm(n), Reg(s)]);
        hc(f, HypercallCode::CtlSet, None, vec![ctl(ControlReg::State), Reg(s)]);
        hc(f, HypercallCode::CtlSet, None, vec![ctl(ControlReg::Scheduler), Func(sched)]);
        f.push(Opcode::Ret, None, vec![]);
    });
    b.define(sched, |f| {
        let s = f.ptr_slot();
        let x = f.slot(8, false);
        let z = f.slot(1, false);
        let x2 = f.slot(8, false);
        let halt = f.block();
        let dec = f.block();
        hc(f, HypercallCode::CtlGet, Some(s), vec![ctl(ControlReg::State)]);
        f.push(Opcode::Load, Some(x), vec![Reg(s)]);
        f.push(Opcode::IEq, Some(z), vec![Reg(x), Imm(0)]);
        f.push(Opcode::Br, None, vec![Reg(z), Block(halt), Block(dec)]);
        f.select(halt);
        hc(f, HypercallCode::CtlFlag, None, vec![Imm(0), Imm(flags::CANCEL)]);
        f.push(Opcode::Ret, None, vec![]);
        f.select(dec);
        f.push(Opcode::Sub, Some(x2), vec![Reg(x), Imm(1)]);
        f.push(Opcode::Store, None, vec![Reg(x2), Reg(s)]);
        f.push(Opcode::Ret, None, vec![]);
    });
    Arc::new(b.finish())
}

/// Non-deterministic branching: `x -= choose(2)` from `n`, cancelling on
/// underflow. `n + 1` states with a self-loop and a down-edge per positive
/// state, plus the self-loop at zero: `2n + 1` edges.
#[must_use]
pub fn counter_choose(n: u64) -> Arc<Program> {
    let mut b = ProgramBuilder::new();
    let sched = b.declare("scheduler");
    b.function("__boot", |f| {
        let s = f.ptr_slot();
        hc(f, HypercallCode::ObjMake, Some(s), vec![Imm(8)]);
        f.push(Opcode::Store, None, vec![Imm(n), Reg(s)]);
        hc(f, HypercallCode::CtlSet, None, vec![ctl(ControlReg::State), Reg(s)]);
        hc(f, HypercallCode::CtlSet, None, vec![ctl(ControlReg::Scheduler), Func(sched)]);
        f.push(Opcode::Ret, None, vec![]);
    });
    b.define(sched, |f| {
        let s = f.ptr_slot();
        let x = f.slot(8, false);
        let c = f.slot(8, false);
        let z = f.slot(1, false);
        let cz = f.slot(1, false);
        let x2 = f.slot(8, false);
        let zero = f.block();
        let sub = f.block();
        let cancel = f.block();
        let publish = f.block();
        hc(f, HypercallCode::CtlGet, Some(s), vec![ctl(ControlReg::State)]);
        f.push(Opcode::Load, Some(x), vec![Reg(s)]);
        hc(f, HypercallCode::Choose, Some(c), vec![Imm(2)]);
        f.push(Opcode::IEq, Some(z), vec![Reg(x), Imm(0)]);
        f.push(Opcode::Br, None, vec![Reg(z), Block(zero), Block(sub)]);
        f.select(zero);
        f.push(Opcode::IEq, Some(cz), vec![Reg(c), Imm(0)]);
        f.push(Opcode::Br, None, vec![Reg(cz), Block(publish), Block(cancel)]);
        f.select(sub);
        f.push(Opcode::Sub, Some(x2), vec![Reg(x), Reg(c)]);
        f.push(Opcode::Store, None, vec![Reg(x2), Reg(s)]);
        f.push(Opcode::Ret, None, vec![]);
        f.select(cancel);
        hc(f, HypercallCode::CtlFlag, None, vec![Imm(0), Imm(flags::CANCEL)]);
        f.push(Opcode::Ret, None, vec![]);
        f.select(publish);
        f.push(Opcode::Ret, None, vec![]);
    });
    Arc::new(b.finish())
}

/// Assertion violation: decrement from `n` and assert the result is
/// nonzero. The step from 1 faults; the error state holds zero.
#[must_use]
pub fn counter_assert(n: u64) -> Arc<Program> {
    let mut b = ProgramBuilder::new();
    let sched = b.declare("scheduler");
    let msg = b.constant("assert_msg", b"assertion failed: x != 0");
    let msg_len = b"assertion failed: x != 0".len() as u64;
    b.function("__boot", |f| {
        let s = f.ptr_slot();
        hc(f, HypercallCode::ObjMake, Some(s), vec![Imm(8)]);
        f.push(Opcode::Store, None, vec![Imm(n), Reg(s)]);
        hc(f, HypercallCode::CtlSet, None, vec![ctl(ControlReg::State), Reg(s)]);
        hc(f, HypercallCode::CtlSet, None, vec![ctl(ControlReg::Scheduler), Func(sched)]);
        f.push(Opcode::Ret, None, vec![]);
    });
    b.define(sched, |f| {
        let s = f.ptr_slot();
        let x = f.slot(8, false);
        let x2 = f.slot(8, false);
        let z = f.slot(1, false);
        let fail = f.block();
        let ok = f.block();
        hc(f, HypercallCode::CtlGet, Some(s), vec![ctl(ControlReg::State)]);
        f.push(Opcode::Load, Some(x), vec![Reg(s)]);
        f.push(Opcode::Sub, Some(x2), vec![Reg(x), Imm(1)]);
        f.push(Opcode::Store, None, vec![Reg(x2), Reg(s)]);
        f.push(Opcode::IEq, Some(z), vec![Reg(x2), Imm(0)]);
        f.push(Opcode::Br, None, vec![Reg(z), Block(fail), Block(ok)]);
        f.select(fail);
        hc(
            f,
            HypercallCode::Fault,
            None,
            vec![Imm(FaultKind::Assert as u64), Operand::Const(msg), Imm(msg_len)],
        );
        f.push(Opcode::Ret, None, vec![]);
        f.select(ok);
        f.push(Opcode::Ret, None, vec![]);
    });
    Arc::new(b.finish())
}

/// Cooperative loop: bump the state from 1 to 2, then spin forever behind
/// a `test_loop` guard. Two states, one edge, no error.
#[must_use]
pub fn loop_kernel() -> Arc<Program> {
    let mut b = ProgramBuilder::new();
    let sched = b.declare("scheduler");
    b.function("__boot", |f| {
        let s = f.ptr_slot();
        hc(f, HypercallCode::ObjMake, Some(s), vec![Imm(8)]);
        f.push(Opcode::Store, None, vec![Imm(1), Reg(s)]);
        hc(f, HypercallCode::CtlSet, None, vec![ctl(ControlReg::State), Reg(s)]);
        hc(f, HypercallCode::CtlSet, None, vec![ctl(ControlReg::Scheduler), Func(sched)]);
        f.push(Opcode::Ret, None, vec![]);
    });
    b.define(sched, |f| {
        let s = f.ptr_slot();
        let x = f.slot(8, false);
        let z = f.slot(1, false);
        let bump = f.block();
        let spin = f.block();
        hc(f, HypercallCode::CtlGet, Some(s), vec![ctl(ControlReg::State)]);
        f.push(Opcode::Load, Some(x), vec![Reg(s)]);
        f.push(Opcode::IUlt, Some(z), vec![Reg(x), Imm(2)]);
        f.push(Opcode::Br, None, vec![Reg(z), Block(bump), Block(spin)]);
        f.select(bump);
        f.push(Opcode::Store, None, vec![Imm(2), Reg(s)]);
        f.push(Opcode::Ret, None, vec![]);
        f.select(spin);
        hc(f, HypercallCode::TestLoop, None, vec![Imm(0), Imm(0)]);
        f.push(Opcode::Br, None, vec![Block(spin)]);
    });
    Arc::new(b.finish())
}

/// Büchi alternator: the state flips between A (x = 0) and B (x = 1)
/// forever, with B carrying the accepting mark on the `State` register.
#[must_use]
pub fn alternator() -> Arc<Program> {
    let mut b = ProgramBuilder::new();
    let sched = b.declare("scheduler");
    b.function("__boot", |f| {
        let s = f.ptr_slot();
        let g = f.ptr_slot();
        hc(f, HypercallCode::ObjMake, Some(s), vec![Imm(16)]);
        f.push(Opcode::Store, None, vec![Imm(0), Reg(s)]);
        // self-reference at offset 8, so A's shape matches later visits
        f.push(Opcode::Gep, Some(g), vec![Reg(s), Imm(8)]);
        f.push(Opcode::Store, None, vec![Reg(s), Reg(g)]);
        hc(f, HypercallCode::CtlSet, None, vec![ctl(ControlReg::State), Reg(s)]);
        hc(f, HypercallCode::CtlSet, None, vec![ctl(ControlReg::Scheduler), Func(sched)]);
        f.push(Opcode::Ret, None, vec![]);
    });
    b.define(sched, |f| {
        let s = f.ptr_slot();
        let g = f.ptr_slot();
        let s2 = f.ptr_slot();
        let x = f.slot(8, false);
        let z = f.slot(1, false);
        let to_b = f.block();
        let to_a = f.block();
        hc(f, HypercallCode::CtlGet, Some(s), vec![ctl(ControlReg::State)]);
        f.push(Opcode::Load, Some(x), vec![Reg(s)]);
        f.push(Opcode::Gep, Some(g), vec![Reg(s), Imm(8)]);
        f.push(Opcode::IEq, Some(z), vec![Reg(x), Imm(0)]);
        f.push(Opcode::Br, None, vec![Reg(z), Block(to_b), Block(to_a)]);

        let retag = |f: &mut FunctionBuilder, value: u64, tag: PointerTag| {
            f.push(Opcode::Store, None, vec![Imm(value), Reg(s)]);
            f.push(Opcode::Store, None, vec![Reg(s), Reg(g)]);
            hc(f, HypercallCode::Poke, None, vec![Reg(g), Imm(0), Imm(tag as u64)]);
            f.push(Opcode::Load, Some(s2), vec![Reg(g)]);
            hc(f, HypercallCode::CtlSet, None, vec![ctl(ControlReg::State), Reg(s2)]);
            f.push(Opcode::Ret, None, vec![]);
        };
        f.select(to_b);
        retag(f, 1, PointerTag::Marked);
        f.select(to_a);
        retag(f, 0, PointerTag::Heap);
    });
    Arc::new(b.finish())
}

/// Fork/join: two guest threads each bump a shared counter behind a
/// preemption point, the scheduler picks runnable threads one quantum at a
/// time and cancels when both are gone.
#[must_use]
pub fn forkjoin() -> Arc<Program> {
    let mut b = ProgramBuilder::new();
    let sched = b.declare("scheduler");
    let thread = b.declare("thread");
    b.function("__boot", |f| {
        let s = f.ptr_slot();
        let f1 = f.ptr_slot();
        let f2 = f.ptr_slot();
        let g8 = f.ptr_slot();
        hc(f, HypercallCode::ObjMake, Some(s), vec![Imm(24)]);
        hc(f, HypercallCode::FrameMake, Some(f1), vec![Func(thread)]);
        hc(f, HypercallCode::FrameMake, Some(f2), vec![Func(thread)]);
        f.push(Opcode::Store, None, vec![Reg(f1), Reg(s)]);
        f.push(Opcode::Gep, Some(g8), vec![Reg(s), Imm(8)]);
        f.push(Opcode::Store, None, vec![Reg(f2), Reg(g8)]);
        hc(f, HypercallCode::CtlSet, None, vec![ctl(ControlReg::State), Reg(s)]);
        hc(f, HypercallCode::CtlSet, None, vec![ctl(ControlReg::Scheduler), Func(sched)]);
        f.push(Opcode::Ret, None, vec![]);
    });
    b.define(thread, |f| {
        let s = f.ptr_slot();
        let g16 = f.ptr_slot();
        let x = f.slot(8, false);
        let x2 = f.slot(8, false);
        let k = f.ptr_slot();
        hc(f, HypercallCode::CtlGet, Some(s), vec![ctl(ControlReg::State)]);
        hc(f, HypercallCode::InterruptCfl, None, vec![]);
        f.push(Opcode::Gep, Some(g16), vec![Reg(s), Imm(16)]);
        f.push(Opcode::Load, Some(x), vec![Reg(g16)]);
        f.push(Opcode::Add, Some(x2), vec![Reg(x), Imm(1)]);
        f.push(Opcode::Store, None, vec![Reg(x2), Reg(g16)]);
        // exit: hand control back to the scheduler frame
        hc(f, HypercallCode::CtlGet, Some(k), vec![ctl(ControlReg::IntFrame)]);
        hc(f, HypercallCode::CtlSet, None, vec![ctl(ControlReg::Frame), Reg(k)]);
        f.push(Opcode::Ret, None, vec![]);
    });
    b.define(sched, |f| {
        let s = f.ptr_slot();
        let f1 = f.ptr_slot();
        let f2 = f.ptr_slot();
        let g8 = f.ptr_slot();
        let z1 = f.slot(1, false);
        let z2 = f.slot(1, false);
        let both_done = f.slot(1, false);
        let c = f.slot(8, false);
        let cz = f.slot(1, false);
        let sel = f.slot(8, false);
        let fp = f.ptr_slot();
        let fl = f.slot(8, false);
        let ib = f.slot(8, false);
        let iz = f.slot(1, false);
        let k = f.ptr_slot();
        let ga = f.ptr_slot();

        let all_done = f.block();
        let some = f.block();
        let check2 = f.block();
        let both = f.block();
        let run1 = f.block();
        let run2 = f.block();
        let dispatch = f.block();
        let finished = f.block();
        let preempted = f.block();

        hc(f, HypercallCode::CtlGet, Some(s), vec![ctl(ControlReg::State)]);
        f.push(Opcode::Load, Some(f1), vec![Reg(s)]);
        f.push(Opcode::Gep, Some(g8), vec![Reg(s), Imm(8)]);
        f.push(Opcode::Load, Some(f2), vec![Reg(g8)]);
        f.push(Opcode::IEq, Some(z1), vec![Reg(f1), Imm(0)]);
        f.push(Opcode::IEq, Some(z2), vec![Reg(f2), Imm(0)]);
        f.push(Opcode::And, Some(both_done), vec![Reg(z1), Reg(z2)]);
        f.push(Opcode::Br, None, vec![Reg(both_done), Block(all_done), Block(some)]);

        f.select(all_done);
        hc(f, HypercallCode::CtlFlag, None, vec![Imm(0), Imm(flags::CANCEL)]);
        f.push(Opcode::Ret, None, vec![]);

        f.select(some);
        f.push(Opcode::Br, None, vec![Reg(z1), Block(run2), Block(check2)]);
        f.select(check2);
        f.push(Opcode::Br, None, vec![Reg(z2), Block(run1), Block(both)]);
        f.select(both);
        hc(f, HypercallCode::Choose, Some(c), vec![Imm(2)]);
        f.push(Opcode::IEq, Some(cz), vec![Reg(c), Imm(0)]);
        f.push(Opcode::Br, None, vec![Reg(cz), Block(run1), Block(run2)]);

        f.select(run1);
        f.push(Opcode::Mov, Some(sel), vec![Imm(0)]);
        f.push(Opcode::Mov, Some(fp), vec![Reg(f1)]);
        f.push(Opcode::Br, None, vec![Block(dispatch)]);
        f.select(run2);
        f.push(Opcode::Mov, Some(sel), vec![Imm(8)]);
        f.push(Opcode::Mov, Some(fp), vec![Reg(f2)]);
        f.push(Opcode::Br, None, vec![Block(dispatch)]);

        f.select(dispatch);
        hc(f, HypercallCode::CtlFlag, None, vec![Imm(flags::MASK), Imm(0)]);
        hc(f, HypercallCode::CtlSet, None, vec![ctl(ControlReg::Frame), Reg(fp)]);
        // the thread ran; it either yielded back or was preempted
        hc(f, HypercallCode::CtlFlag, Some(fl), vec![Imm(0), Imm(0)]);
        f.push(Opcode::And, Some(ib), vec![Reg(fl), Imm(flags::INTERRUPTED)]);
        f.push(Opcode::IEq, Some(iz), vec![Reg(ib), Imm(0)]);
        f.push(Opcode::Br, None, vec![Reg(iz), Block(finished), Block(preempted)]);

        f.select(finished);
        f.push(Opcode::Gep, Some(ga), vec![Reg(s), Reg(sel)]);
        f.push(Opcode::Store, None, vec![Imm(0), Reg(ga)]);
        f.push(Opcode::Ret, None, vec![]);

        f.select(preempted);
        hc(f, HypercallCode::CtlGet, Some(k), vec![ctl(ControlReg::IntFrame)]);
        f.push(Opcode::Gep, Some(ga), vec![Reg(s), Reg(sel)]);
        f.push(Opcode::Store, None, vec![Reg(k), Reg(ga)]);
        f.push(Opcode::Ret, None, vec![]);
    });
    Arc::new(b.finish())
}
