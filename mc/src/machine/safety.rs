//! Safety checking: parallel reachability with error-edge detection and
//! parent-chain counterexamples.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use log::{debug, info};

use crate::{
    compiler::ir::Program,
    error::MachineError,
    explore::{Label, StateGenerator},
    heap::{SnapId, SnapshotStore},
    machine::{
        trace::{Trace, TraceStep},
        McResult, Report,
    },
    opts::{ExploreOpts, SearchOpts},
    search::{self, Listen, Listener, Order},
};

struct ErrorEdge {
    from: SnapId,
    to: SnapId,
    label: Label,
}

/// The safety job. Every newly discovered state records its parent edge in
/// a side table keyed by snapshot id; the first error edge terminates the
/// search, and the counterexample is the parent chain replayed from the
/// stored choice logs.
pub struct Safety {
    gen: StateGenerator,
    search_opts: SearchOpts,
}

impl Safety {
    #[must_use]
    pub fn new(program: Arc<Program>, explore: ExploreOpts, search: SearchOpts) -> Self {
        Safety {
            gen: StateGenerator::new(program, Arc::new(SnapshotStore::new()), explore),
            search_opts: search,
        }
    }

    /// Access to the generator, e.g. for rendering a returned trace.
    pub fn generator_mut(&mut self) -> &mut StateGenerator {
        &mut self.gen
    }

    pub fn run(&mut self) -> anyhow::Result<Report> {
        let initial = match self.gen.boot() {
            Ok(id) => id,
            Err(MachineError::Boot(reason)) => {
                info!("boot failed: {reason}");
                return Ok(Report::new(McResult::BootError, Default::default(), None));
            }
            Err(error) => return Err(error.into()),
        };

        let parents: DashMap<SnapId, (SnapId, Label)> = DashMap::new();
        let error: Mutex<Option<ErrorEdge>> = Mutex::new(None);
        let listener = SafetyListener { parents: &parents, error: &error };

        let outcome = search::search(
            Order::PseudoBfs,
            |_| self.gen.clone(),
            initial,
            self.search_opts.workers,
            &listener,
        );
        let stats = match outcome {
            Ok(stats) => stats,
            Err(MachineError::SolverUnknown) => {
                return Ok(Report::new(McResult::Unknown, Default::default(), None));
            }
            Err(other) => return Err(other.into()),
        };

        let report = match error.into_inner().unwrap() {
            Some(edge) => {
                let trace = parent_chain(initial, &edge, &parents);
                debug!("error edge {} -> {}, trace length {}", edge.from, edge.to, trace.len());
                Report::new(McResult::Error, stats, Some(trace))
            }
            None => Report::new(McResult::Valid, stats, None),
        };
        report.log();
        Ok(report)
    }
}

/// Walk the parent table from the error edge back to the initial state.
/// The error edge itself may not be a parent edge (its target can be an
/// already known state), so it is appended explicitly.
fn parent_chain(
    initial: SnapId,
    edge: &ErrorEdge,
    parents: &DashMap<SnapId, (SnapId, Label)>,
) -> Trace {
    let mut steps = vec![TraceStep { snap: edge.to, label: Some(edge.label.clone()) }];
    let mut cursor = edge.from;
    while cursor != initial {
        let entry = parents.get(&cursor).expect("every discovered state has a parent");
        let (parent, label) = entry.value().clone();
        steps.push(TraceStep { snap: cursor, label: Some(label) });
        cursor = parent;
    }
    steps.push(TraceStep { snap: initial, label: None });
    steps.reverse();
    Trace { steps, lasso_from: None }
}

struct SafetyListener<'a> {
    parents: &'a DashMap<SnapId, (SnapId, Label)>,
    error: &'a Mutex<Option<ErrorEdge>>,
}

impl Listener for SafetyListener<'_> {
    fn edge(&self, from: SnapId, to: SnapId, label: &Label, isnew: bool) -> Listen {
        if isnew {
            self.parents.insert(to, (from, label.clone()));
        }
        if label.error {
            let mut slot = self.error.lock().unwrap();
            if slot.is_none() {
                *slot = Some(ErrorEdge { from, to, label: label.clone() });
            }
            return Listen::Terminate;
        }
        Listen::AsNeeded
    }
}
