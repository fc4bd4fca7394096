//! Fair task dispatch: which client should a requesting node service?
//!
//! Nodes pay a real cost to switch tasks (a possible processor download), so
//! the dispatcher both spreads nodes evenly across clients and leaves a node
//! on its current client as long as that remains fair. The policy is simply
//! "fewest current servicers wins": each task keeps a set of the node
//! handlers currently pulling from it, and an assignment request picks the
//! candidate with the smallest set.
//!
//! Registration is explicit. A node is registered when [`DispatchTable::assign`]
//! picks a task for it and deregistered when it drains the queue, switches
//! away, or its handler exits — there is no liveness guessing.

use std::collections::{HashMap, HashSet};

use super::state::{NodeId, TaskId};

/// Which nodes are currently servicing which task.
///
/// Owned by [`super::state::BrokerState`] behind the dispatcher lock; every
/// selection is serialized through it.
#[derive(Debug, Default)]
pub struct DispatchTable {
    servicers: HashMap<TaskId, HashSet<NodeId>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the candidate with the fewest servicers and register `node` to
    /// it. Ties keep the earliest candidate in iteration order.
    ///
    /// The caller's own stale registration is dropped first so a node
    /// re-selecting never counts against itself.
    pub fn assign(&mut self, node: NodeId, candidates: &[TaskId]) -> Option<TaskId> {
        self.deregister(node);

        let chosen = candidates
            .iter()
            .copied()
            .min_by_key(|task| self.servicer_count(*task))?;

        self.servicers.entry(chosen).or_default().insert(node);
        Some(chosen)
    }

    /// Remove `node` from every servicer set.
    pub fn deregister(&mut self, node: NodeId) {
        self.servicers.retain(|_, nodes| {
            nodes.remove(&node);
            !nodes.is_empty()
        });
    }

    /// Drop a task's servicer set entirely (its client disconnected).
    pub fn remove_task(&mut self, task: TaskId) {
        self.servicers.remove(&task);
    }

    /// Number of nodes currently registered to `task`.
    pub fn servicer_count(&self, task: TaskId) -> usize {
        self.servicers.get(&task).map_or(0, HashSet::len)
    }
}
