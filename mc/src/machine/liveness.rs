//! Liveness checking: nested depth-first search for accepting cycles,
//! built on the depth-first engine in [`crate::search::dfs`].
//!
//! The outer visitor walks the state graph; when the engine retreats from
//! an accepting state, the retreat hook runs an inner traversal from that
//! state, and if the inner pass reaches any state still on the outer
//! stack, an accepting lasso exists. Each state carries two bits in a
//! side table keyed by snapshot id: `on_stack` for outer stack membership
//! and `nested` for inner visitation (each state is inner-visited at most
//! once across all inner runs).

use std::sync::Arc;

use hashbrown::HashMap;
use log::{debug, info};

use crate::{
    compiler::ir::Program,
    error::MachineError,
    explore::{is_accepting, Label, StateGenerator},
    heap::{SnapId, SnapshotStore},
    machine::{
        trace::{Trace, TraceStep},
        McResult, Report,
    },
    opts::{ExploreOpts, SearchOpts},
    search::{
        bfs::Graph,
        dfs::{self, DfsVisitor},
        Listen, SearchStats,
    },
};

const ON_STACK: u8 = 1 << 0;
const NESTED: u8 = 1 << 1;
const SEEN: u8 = 1 << 2;

type Marks = HashMap<SnapId, u8>;
type EdgeList = Arc<Vec<(SnapId, Label)>>;

fn marked(marks: &Marks, state: SnapId, bits: u8) -> bool {
    marks.get(&state).is_some_and(|m| m & bits != 0)
}

fn mark(marks: &mut Marks, state: SnapId, bits: u8) {
    *marks.entry(state).or_default() |= bits;
}

fn unmark(marks: &mut Marks, state: SnapId, bits: u8) {
    *marks.entry(state).or_default() &= !bits;
}

/// Memoising expander: the inner pass revisits what the outer pass already
/// expanded, so successor lists are generated once per state and replayed
/// from the cache.
struct CachedGraph<'a> {
    gen: &'a mut StateGenerator,
    cache: HashMap<SnapId, EdgeList>,
}

impl Graph for CachedGraph<'_> {
    fn expand(
        &mut self,
        state: SnapId,
        emit: &mut dyn FnMut(SnapId, &Label, bool) -> bool,
    ) -> Result<(), MachineError> {
        let edges = match self.cache.get(&state) {
            Some(cached) => cached.clone(),
            None => {
                let mut edges = Vec::new();
                self.gen.successors(state, |to, label, _isnew| {
                    edges.push((to, label.clone()));
                    true
                })?;
                let edges: EdgeList = Arc::new(edges);
                self.cache.insert(state, edges.clone());
                edges
            }
        };
        for (to, label) in edges.iter() {
            if !emit(*to, label, false) {
                break;
            }
        }
        Ok(())
    }

    fn instructions(&self) -> u64 {
        self.gen.instructions()
    }
}

/// The liveness job. Sequential: nested DFS does not parallelise the way
/// reachability does.
pub struct Liveness {
    gen: StateGenerator,
    opts: SearchOpts,
}

impl Liveness {
    #[must_use]
    pub fn new(program: Arc<Program>, explore: ExploreOpts, search: SearchOpts) -> Self {
        Liveness {
            gen: StateGenerator::new(program, Arc::new(SnapshotStore::new()), explore),
            opts: search,
        }
    }

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

        let store = self.gen.store().clone();
        let mut graph = CachedGraph { gen: &mut self.gen, cache: HashMap::new() };
        let mut outer = Outer {
            store: &store,
            marks: Marks::new(),
            path: Vec::new(),
            pending: None,
            found: None,
        };
        let outcome = dfs::dfv(&mut graph, initial, self.opts.max_depth, &mut outer);

        let report = match outcome {
            Ok(stats) => match outer.found {
                Some(trace) => Report::new(McResult::Error, stats, Some(trace)),
                None => Report::new(McResult::Valid, stats, None),
            },
            Err(MachineError::DepthLimit(_)) | Err(MachineError::SolverUnknown) => {
                Report::new(McResult::Unknown, SearchStats::default(), None)
            }
            Err(error) => return Err(error.into()),
        };
        report.log();
        Ok(report)
    }
}

/// The outer pass. Mirrors the engine's stack as a trace prefix; the
/// retreat hook of an accepting state runs the inner pass and terminates
/// the whole search the moment it closes a cycle.
struct Outer<'a> {
    store: &'a SnapshotStore,
    marks: Marks,
    path: Vec<TraceStep>,
    /// Label of the most recent edge, claimed by the discovery it leads to.
    pending: Option<Label>,
    found: Option<Trace>,
}

impl DfsVisitor for Outer<'_> {
    fn discover(&mut self, state: SnapId) -> Listen {
        if marked(&self.marks, state, SEEN) {
            return Listen::Forget;
        }
        mark(&mut self.marks, state, SEEN | ON_STACK);
        self.path.push(TraceStep { snap: state, label: self.pending.take() });
        Listen::AsNeeded
    }

    fn edge(&mut self, _from: SnapId, to: SnapId, label: &Label) -> Listen {
        if label.error {
            // a safety violation found on the way is still a violation;
            // report it as a linear trace
            let mut steps = self.path.clone();
            steps.push(TraceStep { snap: to, label: Some(label.clone()) });
            self.found = Some(Trace { steps, lasso_from: None });
            return Listen::Terminate;
        }
        self.pending = Some(label.clone());
        Listen::AsNeeded
    }

    fn retreat(&mut self, graph: &mut dyn Graph, state: SnapId) -> Result<Listen, MachineError> {
        if is_accepting(self.store, state) {
            let mut inner = Inner {
                marks: &mut self.marks,
                seed: state,
                parents: HashMap::new(),
                cycle: None,
            };
            dfs::dfv(graph, state, usize::MAX, &mut inner)?;
            if let Some(cycle) = inner.cycle {
                debug!("accepting cycle through {state}");
                let mut steps = self.path.clone();
                let closing = cycle.last().map(|(to, _)| *to);
                for (to, label) in cycle {
                    steps.push(TraceStep { snap: to, label: Some(label) });
                }
                let lasso_from = closing.and_then(|snap| steps.iter().position(|s| s.snap == snap));
                self.found = Some(Trace { steps, lasso_from });
                return Ok(Listen::Terminate);
            }
        }
        unmark(&mut self.marks, state, ON_STACK);
        self.path.pop();
        Ok(Listen::AsNeeded)
    }
}

/// The inner pass: hunts for any state still on the outer stack, visiting
/// each state at most once across all inner runs.
struct Inner<'a> {
    marks: &'a mut Marks,
    seed: SnapId,
    parents: HashMap<SnapId, (SnapId, Label)>,
    cycle: Option<Vec<(SnapId, Label)>>,
}

impl DfsVisitor for Inner<'_> {
    fn discover(&mut self, state: SnapId) -> Listen {
        if marked(self.marks, state, NESTED) {
            return Listen::Forget;
        }
        mark(self.marks, state, NESTED);
        Listen::AsNeeded
    }

    fn edge(&mut self, from: SnapId, to: SnapId, label: &Label) -> Listen {
        if label.error {
            return Listen::Forget;
        }
        if marked(self.marks, to, ON_STACK) {
            // cycle: seed -> … -> from -> to, with `to` on the outer stack
            let mut path = vec![(to, label.clone())];
            let mut cursor = from;
            while cursor != self.seed {
                let (parent, via) = self.parents[&cursor].clone();
                path.push((cursor, via));
                cursor = parent;
            }
            path.reverse();
            self.cycle = Some(path);
            return Listen::Terminate;
        }
        if !self.parents.contains_key(&to) {
            self.parents.insert(to, (from, label.clone()));
        }
        Listen::AsNeeded
    }
}
