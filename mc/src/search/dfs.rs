//! Sequential depth-first traversal.
//!
//! The engine is a depth-first visitor ([`DfsVisitor`]): discovery, edge
//! and post-order retreat hooks driven over an expander by [`dfv`]. The
//! listener-directed [`dfs`] (what `Order::Dfs` runs) adapts a
//! [`Listener`] onto it, and liveness builds its nested search from the
//! same engine — an outer visitor whose retreat hook starts the inner
//! traversal.

use hashbrown::HashSet;
use std::sync::atomic::Ordering;

use crate::{
    error::MachineError,
    explore::Label,
    heap::SnapId,
    search::{
        bfs::Graph,
        listener::{Listen, Listener},
        stats::{SearchCounters, SearchStats},
    },
};

/// Hooks driving one depth-first traversal. Descent is governed by
/// `discover`: the visitor's own marks are the deduplication, `Forget`
/// skips a state and `Terminate` stops the traversal. `retreat` fires in
/// post-order, once a state's successors are exhausted; it is handed the
/// expander back so it may start a nested traversal.
pub trait DfsVisitor {
    /// A state reached along the traversal (the initial one included).
    fn discover(&mut self, state: SnapId) -> Listen;

    /// One outgoing edge of a state being expanded. An edge verdict of
    /// `Forget` skips the target without discovering it.
    fn edge(&mut self, from: SnapId, to: SnapId, label: &Label) -> Listen;

    /// Post-order retreat.
    fn retreat(&mut self, graph: &mut dyn Graph, state: SnapId) -> Result<Listen, MachineError> {
        let _ = (graph, state);
        Ok(Listen::AsNeeded)
    }
}

struct DfsFrame {
    state: SnapId,
    edges: Vec<(SnapId, Label)>,
    next: usize,
}

fn expand(graph: &mut dyn Graph, state: SnapId) -> Result<Vec<(SnapId, Label)>, MachineError> {
    let mut edges = Vec::new();
    graph.expand(state, &mut |to, label, _isnew| {
        edges.push((to, label.clone()));
        true
    })?;
    Ok(edges)
}

/// Run a depth-first traversal from `initial`. A stack deeper than
/// `max_depth` aborts with a depth-limit error.
pub fn dfv<V>(
    graph: &mut dyn Graph,
    initial: SnapId,
    max_depth: usize,
    visitor: &mut V,
) -> Result<SearchStats, MachineError>
where
    V: DfsVisitor + ?Sized,
{
    let counters = SearchCounters::default();
    match visitor.discover(initial) {
        Listen::Terminate | Listen::Forget => return Ok(counters.snapshot()),
        Listen::Process | Listen::AsNeeded => {}
    }
    counters.states.fetch_add(1, Ordering::Relaxed);
    let mut stack = vec![DfsFrame { state: initial, edges: expand(graph, initial)?, next: 0 }];

    'search: while let Some(top) = stack.last_mut() {
        if top.next < top.edges.len() {
            let from = top.state;
            let (to, label) = top.edges[top.next].clone();
            top.next += 1;
            counters.edges.fetch_add(1, Ordering::Relaxed);
            match visitor.edge(from, to, &label) {
                Listen::Terminate => break 'search,
                Listen::Forget => continue,
                Listen::Process | Listen::AsNeeded => {}
            }
            match visitor.discover(to) {
                Listen::Terminate => break 'search,
                Listen::Forget => continue,
                Listen::Process | Listen::AsNeeded => {}
            }
            if stack.len() >= max_depth {
                return Err(MachineError::DepthLimit(max_depth));
            }
            counters.states.fetch_add(1, Ordering::Relaxed);
            let edges = expand(graph, to)?;
            stack.push(DfsFrame { state: to, edges, next: 0 });
        } else {
            let state = top.state;
            if visitor.retreat(graph, state)? == Listen::Terminate {
                break 'search;
            }
            stack.pop();
        }
    }
    counters.instructions.store(graph.instructions(), Ordering::Relaxed);
    Ok(counters.snapshot())
}

/// The plain listener-directed sequential search.
pub fn dfs<G, L>(graph: &mut G, initial: SnapId, listener: &L) -> Result<SearchStats, MachineError>
where
    G: Graph,
    L: Listener,
{
    let mut visitor = ListenerVisitor { listener, seen: HashSet::new() };
    dfv(graph, initial, usize::MAX, &mut visitor)
}

struct ListenerVisitor<'a, L> {
    listener: &'a L,
    seen: HashSet<SnapId>,
}

impl<L: Listener> DfsVisitor for ListenerVisitor<'_, L> {
    fn discover(&mut self, state: SnapId) -> Listen {
        if !self.seen.insert(state) {
            return Listen::Forget;
        }
        self.listener.state(state)
    }

    fn edge(&mut self, from: SnapId, to: SnapId, label: &Label) -> Listen {
        self.listener.edge(from, to, label, !self.seen.contains(&to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::listener::passive_listen;
    use std::sync::atomic::AtomicU64;

    struct Chain;

    impl Graph for Chain {
        fn expand(
            &mut self,
            state: SnapId,
            emit: &mut dyn FnMut(SnapId, &Label, bool) -> bool,
        ) -> Result<(), MachineError> {
            if state < 5 {
                emit(state + 1, &Label::default(), true);
            }
            Ok(())
        }
    }

    #[test]
    fn dfs_walks_a_chain() {
        let states = AtomicU64::new(0);
        let stats = dfs(
            &mut Chain,
            0,
            &passive_listen(|_, _, _| {}, |_| {
                states.fetch_add(1, Ordering::Relaxed);
            }),
        )
        .unwrap();
        assert_eq!(stats.states, 6);
        assert_eq!(stats.edges, 5);
        assert_eq!(states.load(Ordering::Relaxed), 6);
    }

    #[test]
    fn retreat_fires_in_post_order() {
        #[derive(Default)]
        struct Recorder {
            discovered: Vec<SnapId>,
            retreated: Vec<SnapId>,
        }
        impl DfsVisitor for Recorder {
            fn discover(&mut self, state: SnapId) -> Listen {
                self.discovered.push(state);
                Listen::AsNeeded
            }
            fn edge(&mut self, _from: SnapId, _to: SnapId, _label: &Label) -> Listen {
                Listen::AsNeeded
            }
            fn retreat(
                &mut self,
                _graph: &mut dyn Graph,
                state: SnapId,
            ) -> Result<Listen, MachineError> {
                self.retreated.push(state);
                Ok(Listen::AsNeeded)
            }
        }

        let mut recorder = Recorder::default();
        dfv(&mut Chain, 0, usize::MAX, &mut recorder).unwrap();
        assert_eq!(recorder.discovered, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(recorder.retreated, vec![5, 4, 3, 2, 1, 0]);
    }

    #[test]
    fn depth_limit_aborts() {
        struct Everything;
        impl DfsVisitor for Everything {
            fn discover(&mut self, _state: SnapId) -> Listen {
                Listen::AsNeeded
            }
            fn edge(&mut self, _from: SnapId, _to: SnapId, _label: &Label) -> Listen {
                Listen::AsNeeded
            }
        }
        let result = dfv(&mut Chain, 0, 3, &mut Everything);
        assert!(matches!(result, Err(MachineError::DepthLimit(3))));
    }
}
