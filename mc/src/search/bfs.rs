//! Parallel pseudo-BFS over a shared work queue.
//!
//! N workers share one MPMC queue of snapshot ids. Each worker owns its
//! expander (for the model checker, a cloned [`StateGenerator`] with its
//! own scratch context); deduplication happens in the shared snapshot
//! store, whose get-or-create tells exactly one worker that a state is
//! new. Discovery order is per-worker FIFO interleaved across workers, so
//! edge emission order is deterministic only for one worker; the emitted
//! edge *set* is deterministic regardless.
//!
//! [`StateGenerator`]: crate::explore::StateGenerator

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Mutex,
};

use crossbeam::{queue::SegQueue, utils::Backoff};
use log::debug;

use crate::{
    error::MachineError,
    explore::{Label, StateGenerator},
    heap::SnapId,
    search::{
        listener::{Listen, Listener},
        stats::{SearchCounters, SearchStats},
    },
};

/// A per-worker successor expander.
pub trait Graph: Send {
    /// Expand one state, invoking `emit(to, label, isnew)` per outgoing
    /// edge. `emit` returns false to stop the expansion early.
    fn expand(
        &mut self,
        state: SnapId,
        emit: &mut dyn FnMut(SnapId, &Label, bool) -> bool,
    ) -> Result<(), MachineError>;

    /// Instructions interpreted so far, for the aggregate report.
    fn instructions(&self) -> u64 {
        0
    }
}

impl Graph for StateGenerator {
    fn expand(
        &mut self,
        state: SnapId,
        emit: &mut dyn FnMut(SnapId, &Label, bool) -> bool,
    ) -> Result<(), MachineError> {
        self.successors(state, |to, label, isnew| emit(to, label, isnew))
    }

    fn instructions(&self) -> u64 {
        StateGenerator::instructions(self)
    }
}

/// Run a parallel BFS from `initial`. `make(worker_index)` builds the
/// per-worker expander.
pub fn search<G, M, L>(
    make: M,
    initial: SnapId,
    threads: usize,
    listener: &L,
) -> Result<SearchStats, MachineError>
where
    G: Graph,
    M: Fn(usize) -> G,
    L: Listener,
{
    let queue = SegQueue::new();
    let in_flight = AtomicUsize::new(0);
    let terminate = AtomicBool::new(false);
    let counters = SearchCounters::default();
    let failure: Mutex<Option<MachineError>> = Mutex::new(None);

    counters.states.fetch_add(1, Ordering::Relaxed);
    match listener.state(initial) {
        Listen::Terminate | Listen::Forget => return Ok(counters.snapshot()),
        Listen::Process | Listen::AsNeeded => {
            in_flight.fetch_add(1, Ordering::SeqCst);
            queue.push(initial);
        }
    }

    std::thread::scope(|scope| {
        for index in 0..threads.max(1) {
            let mut graph = make(index);
            let queue = &queue;
            let in_flight = &in_flight;
            let terminate = &terminate;
            let counters = &counters;
            let failure = &failure;
            scope.spawn(move || {
                let backoff = Backoff::new();
                loop {
                    if terminate.load(Ordering::SeqCst) {
                        break;
                    }
                    let Some(vertex) = queue.pop() else {
                        if in_flight.load(Ordering::SeqCst) == 0 {
                            break;
                        }
                        backoff.snooze();
                        continue;
                    };
                    backoff.reset();

                    let expanded = graph.expand(vertex, &mut |to, label, isnew| {
                        counters.edges.fetch_add(1, Ordering::Relaxed);
                        let verdict = listener.edge(vertex, to, label, isnew);
                        match verdict {
                            Listen::Terminate => {
                                terminate.store(true, Ordering::SeqCst);
                                return false;
                            }
                            Listen::Forget => {}
                            Listen::Process | Listen::AsNeeded => {
                                if isnew || verdict == Listen::Process {
                                    if isnew {
                                        counters.states.fetch_add(1, Ordering::Relaxed);
                                    }
                                    match listener.state(to) {
                                        Listen::Terminate => {
                                            terminate.store(true, Ordering::SeqCst);
                                            return false;
                                        }
                                        Listen::Forget => {}
                                        Listen::Process | Listen::AsNeeded => {
                                            in_flight.fetch_add(1, Ordering::SeqCst);
                                            queue.push(to);
                                        }
                                    }
                                }
                            }
                        }
                        !terminate.load(Ordering::SeqCst)
                    });
                    in_flight.fetch_sub(1, Ordering::SeqCst);

                    if let Err(error) = expanded {
                        let mut slot = failure.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(error);
                        }
                        terminate.store(true, Ordering::SeqCst);
                        break;
                    }
                }
                counters.instructions.fetch_add(graph.instructions(), Ordering::Relaxed);
            });
        }
    });

    if let Some(error) = failure.lock().unwrap().take() {
        return Err(error);
    }
    let stats = counters.snapshot();
    debug!("search finished: {stats}");
    Ok(stats)
}
