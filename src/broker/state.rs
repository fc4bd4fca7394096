//! Shared broker state: every table the connection handlers touch.
//!
//! All runtime state lives in one [`BrokerState`] shared by `Arc` across the
//! accept loop, the per-connection handler tasks, and the status reporter.
//! Each table sits behind its own mutex; operations that must see a
//! consistent view across tables take the locks in a fixed order
//! (`clients` → `subtasks` → `nodes` → dispatch) and never hold any of them
//! across an await point — every public method here is synchronous.
//!
//! # Subtask lifecycle
//!
//! ```text
//! submit_subtask ──► pending (per-client FIFO, bounded)
//!       checkout_subtask ──► in-flight (tracked on the node)
//!             complete_subtask ──► result queue (per-client FIFO, unbounded)
//!                   take_result ──► row removed, client owns the output
//!
//! remove_node: every in-flight subtask goes back to pending (bound ignored)
//! remove_client: pending and unconsumed results are dropped; in-flight rows
//!                linger until their node finishes (output discarded) or dies
//! ```
//!
//! An accepted subtask is therefore always in exactly one of
//! pending / in-flight / done-unconsumed until its client consumes it or
//! disconnects.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use uuid::Uuid;

use super::dispatch::DispatchTable;
use crate::constants::MAX_PENDING_SUBTASKS;

/// Identifies one client session and its uploaded processor.
pub type TaskId = Uuid;
/// Identifies one submitted input within a task.
pub type SubtaskId = Uuid;
/// Client-supplied tag naming a precompiled processor binary.
pub type AlgorithmId = Uuid;
/// Broker-minted identity of one node connection.
pub type NodeId = u64;

/// Per-client state, keyed by task id.
///
/// The peer address is kept for logging and the on-disk upload path only;
/// identity is the task id, so an address that reconnects gets a fresh entry
/// instead of colliding with its old one.
#[derive(Debug)]
pub struct ClientEntry {
    pub addr: SocketAddr,
    pub algorithm: Option<AlgorithmId>,
    /// Uploaded processor source, streamed to nodes that lack it.
    pub source: Bytes,
    /// Subtasks awaiting dispatch, oldest first. Bounded by
    /// [`MAX_PENDING_SUBTASKS`] on submission, unbounded on reclamation.
    pending: VecDeque<SubtaskId>,
    /// Completed subtasks awaiting consumption, completion order.
    results: VecDeque<SubtaskId>,
    pub submitted: u64,
    pub completed: u64,
}

/// One subtask's payloads. `input` is kept until the output lands so a
/// reclaimed subtask can be re-dispatched; the whole row is removed when the
/// client consumes the result or is found to be gone.
#[derive(Debug)]
struct SubtaskEntry {
    task: TaskId,
    input: Option<Bytes>,
    output: Option<Bytes>,
}

/// Per-node state.
#[derive(Debug)]
pub struct NodeEntry {
    pub addr: SocketAddr,
    /// Task this node last pulled subtasks for, if any.
    pub current_task: Option<TaskId>,
    /// Subtasks currently executing on this node.
    in_flight: Vec<SubtaskId>,
}

/// Everything the GETTASK exchange needs about a selected task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskAssignment {
    pub task: TaskId,
    pub algorithm: Option<AlgorithmId>,
}

/// All broker runtime state.
pub struct BrokerState {
    clients: Mutex<HashMap<TaskId, ClientEntry>>,
    subtasks: Mutex<HashMap<SubtaskId, SubtaskEntry>>,
    nodes: Mutex<HashMap<NodeId, NodeEntry>>,
    dispatch: Mutex<DispatchTable>,
    next_node_id: AtomicU64,
    started: Instant,
}

impl BrokerState {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            subtasks: Mutex::new(HashMap::new()),
            nodes: Mutex::new(HashMap::new()),
            dispatch: Mutex::new(DispatchTable::new()),
            next_node_id: AtomicU64::new(1),
            started: Instant::now(),
        }
    }

    // ── Client lifecycle ────────────────────────────────────────────────────

    /// Register a client session once its upload handshake completed.
    pub fn register_client(
        &self,
        task: TaskId,
        addr: SocketAddr,
        source: Bytes,
        algorithm: Option<AlgorithmId>,
    ) {
        let mut clients = self.clients.lock().expect("clients lock poisoned");
        clients.insert(
            task,
            ClientEntry {
                addr,
                algorithm,
                source,
                pending: VecDeque::new(),
                results: VecDeque::new(),
                submitted: 0,
                completed: 0,
            },
        );
    }

    /// Whether a submission should be refused with `NOTENOUGHSPACE`.
    ///
    /// The bound check is a strict greater-than against the current length,
    /// so a queue holding exactly `MAX_PENDING_SUBTASKS` entries still
    /// accepts one more submission before refusing. The handler
    /// checks this before acknowledging the submission; the enqueue itself
    /// is unconditional because the input has already been accepted on the
    /// wire by then.
    pub fn pending_is_full(&self, task: TaskId) -> bool {
        let clients = self.clients.lock().expect("clients lock poisoned");
        clients
            .get(&task)
            .is_some_and(|entry| entry.pending.len() > MAX_PENDING_SUBTASKS)
    }

    /// Enqueue one accepted subtask input, minting its id.
    ///
    /// Returns `None` only when the task is unknown, which cannot happen from
    /// the owning handler; callers treat it as the client having vanished.
    pub fn submit_subtask(&self, task: TaskId, input: Bytes) -> Option<SubtaskId> {
        let mut clients = self.clients.lock().expect("clients lock poisoned");
        let entry = clients.get_mut(&task)?;

        let subtask = Uuid::new_v4();
        entry.pending.push_back(subtask);
        entry.submitted += 1;

        let mut subtasks = self.subtasks.lock().expect("subtasks lock poisoned");
        subtasks.insert(
            subtask,
            SubtaskEntry {
                task,
                input: Some(input),
                output: None,
            },
        );
        Some(subtask)
    }

    /// Pop the oldest completed result for `task`, removing its row.
    ///
    /// Returns `None` when no results are waiting (`NONEWRESULTS`).
    pub fn take_result(&self, task: TaskId) -> Option<(SubtaskId, Bytes)> {
        let mut clients = self.clients.lock().expect("clients lock poisoned");
        let entry = clients.get_mut(&task)?;
        let subtask = entry.results.pop_front()?;

        let mut subtasks = self.subtasks.lock().expect("subtasks lock poisoned");
        let row = subtasks
            .remove(&subtask)
            .expect("result-queue entry must have a subtask row");
        let output = row.output.expect("completed subtask must carry an output");
        Some((subtask, output))
    }

    /// Tear down a departed client: its entry, its queued rows, and its
    /// dispatch registration. In-flight rows stay behind so the nodes running
    /// them can finish into the void (or die and be reclaimed to nowhere).
    pub fn remove_client(&self, task: TaskId) {
        let mut clients = self.clients.lock().expect("clients lock poisoned");
        if let Some(entry) = clients.remove(&task) {
            let mut subtasks = self.subtasks.lock().expect("subtasks lock poisoned");
            for subtask in entry.pending.iter().chain(entry.results.iter()) {
                subtasks.remove(subtask);
            }
        }
        drop(clients);

        let mut dispatch = self.dispatch.lock().expect("dispatch lock poisoned");
        dispatch.remove_task(task);
    }

    // ── Node lifecycle ──────────────────────────────────────────────────────

    /// Register a node connection, minting its id.
    pub fn register_node(&self, addr: SocketAddr) -> NodeId {
        let node = self.next_node_id.fetch_add(1, Ordering::Relaxed);
        let mut nodes = self.nodes.lock().expect("nodes lock poisoned");
        nodes.insert(
            node,
            NodeEntry {
                addr,
                current_task: None,
                in_flight: Vec::new(),
            },
        );
        node
    }

    /// Tear down a departed node, requeueing everything it had in flight.
    ///
    /// Reclamation ignores the pending-queue bound — refusing it would lose
    /// accepted work. Subtasks whose owning client has since disconnected are
    /// dropped instead.
    pub fn remove_node(&self, node: NodeId) {
        let entry = {
            let mut nodes = self.nodes.lock().expect("nodes lock poisoned");
            nodes.remove(&node)
        };
        let Some(entry) = entry else { return };

        let mut clients = self.clients.lock().expect("clients lock poisoned");
        let mut subtasks = self.subtasks.lock().expect("subtasks lock poisoned");
        for subtask in entry.in_flight {
            let Some(owner_task) = subtasks.get(&subtask).map(|row| row.task) else {
                continue;
            };
            match clients.get_mut(&owner_task) {
                Some(owner) => owner.pending.push_back(subtask),
                None => {
                    // Owner is gone; nothing to requeue onto.
                    subtasks.remove(&subtask);
                }
            }
        }
        drop(subtasks);
        drop(clients);

        let mut dispatch = self.dispatch.lock().expect("dispatch lock poisoned");
        dispatch.deregister(node);
    }

    // ── Dispatch and execution ──────────────────────────────────────────────

    /// Pick the task a requesting node should service next and register the
    /// node as one of its servicers.
    ///
    /// Policy: among clients with pending work, the one serviced by the
    /// fewest nodes wins (ties by map iteration order). Switching tasks is
    /// expensive for nodes, so spreading them evenly both balances clients
    /// and minimizes churn. Returns `None` when no client has pending work
    /// (`NONEWTASKS`).
    pub fn select_task(&self, node: NodeId) -> Option<TaskAssignment> {
        let clients = self.clients.lock().expect("clients lock poisoned");
        let candidates: Vec<TaskId> = clients
            .iter()
            .filter(|(_, entry)| !entry.pending.is_empty())
            .map(|(task, _)| *task)
            .collect();

        let mut dispatch = self.dispatch.lock().expect("dispatch lock poisoned");
        let chosen = dispatch.assign(node, &candidates)?;
        let algorithm = clients
            .get(&chosen)
            .expect("candidate came from the clients map")
            .algorithm;
        drop(dispatch);
        drop(clients);

        let mut nodes = self.nodes.lock().expect("nodes lock poisoned");
        if let Some(entry) = nodes.get_mut(&node) {
            entry.current_task = Some(chosen);
        }

        Some(TaskAssignment {
            task: chosen,
            algorithm,
        })
    }

    /// Drop the node's task affinity and dispatch registration — its current
    /// task's queue is drained (`NONEWSUBTASKS`), so the next `GETTASK` should
    /// consider it a free node.
    pub fn clear_node_task(&self, node: NodeId) {
        {
            let mut nodes = self.nodes.lock().expect("nodes lock poisoned");
            if let Some(entry) = nodes.get_mut(&node) {
                entry.current_task = None;
            }
        }
        let mut dispatch = self.dispatch.lock().expect("dispatch lock poisoned");
        dispatch.deregister(node);
    }

    /// Processor source for a task, for nodes that answered
    /// `DOESNOTHAVEFILE`. `None` if the client has meanwhile disconnected.
    pub fn processor_source(&self, task: TaskId) -> Option<Bytes> {
        let clients = self.clients.lock().expect("clients lock poisoned");
        clients.get(&task).map(|entry| entry.source.clone())
    }

    /// Hand the oldest pending subtask of `task` to `node`.
    ///
    /// Returns the subtask id and its input, or `None` when the task is
    /// unknown (client left) or its queue is empty (`NONEWSUBTASKS`).
    pub fn checkout_subtask(&self, task: TaskId, node: NodeId) -> Option<(SubtaskId, Bytes)> {
        let mut clients = self.clients.lock().expect("clients lock poisoned");
        let subtask = clients.get_mut(&task)?.pending.pop_front()?;

        let subtasks = self.subtasks.lock().expect("subtasks lock poisoned");
        let input = subtasks
            .get(&subtask)
            .and_then(|row| row.input.clone())
            .expect("pending subtask must have an input");
        drop(subtasks);
        drop(clients);

        let mut nodes = self.nodes.lock().expect("nodes lock poisoned");
        if let Some(entry) = nodes.get_mut(&node) {
            entry.in_flight.push(subtask);
        }
        Some((subtask, input))
    }

    /// Record a finished subtask, routing the output to its owner's result
    /// queue.
    ///
    /// Returns `false` when the output was discarded: the owning client
    /// disconnected while the subtask was in flight. The node's in-flight
    /// bookkeeping is cleared either way.
    pub fn complete_subtask(&self, node: NodeId, subtask: SubtaskId, output: Bytes) -> bool {
        let mut clients = self.clients.lock().expect("clients lock poisoned");
        let mut subtasks = self.subtasks.lock().expect("subtasks lock poisoned");

        // A missing row means the client was swept while this ran in flight.
        let owner_task = subtasks.get(&subtask).map(|row| row.task);
        let delivered = match owner_task {
            Some(task) => match clients.get_mut(&task) {
                Some(owner) => {
                    let row = subtasks.get_mut(&subtask).expect("row checked above");
                    row.input = None;
                    row.output = Some(output);
                    owner.results.push_back(subtask);
                    owner.completed += 1;
                    true
                }
                None => {
                    subtasks.remove(&subtask);
                    false
                }
            },
            None => false,
        };
        drop(subtasks);
        drop(clients);

        let mut nodes = self.nodes.lock().expect("nodes lock poisoned");
        if let Some(entry) = nodes.get_mut(&node) {
            entry.in_flight.retain(|id| *id != subtask);
        }
        delivered
    }

    // ── Introspection ───────────────────────────────────────────────────────

    /// Point-in-time counters for the status reporter and tests.
    pub fn snapshot(&self) -> StatusSnapshot {
        let clients = self.clients.lock().expect("clients lock poisoned");
        let client_rows = clients
            .values()
            .map(|entry| ClientStatus {
                addr: entry.addr,
                queued: entry.pending.len(),
                results: entry.results.len(),
                submitted: entry.submitted,
                completed: entry.completed,
            })
            .collect();
        drop(clients);

        let nodes = self.nodes.lock().expect("nodes lock poisoned");
        let node_rows = nodes
            .values()
            .map(|entry| NodeStatus {
                addr: entry.addr,
                has_task: entry.current_task.is_some(),
                in_flight: entry.in_flight.len(),
            })
            .collect();
        drop(nodes);

        StatusSnapshot {
            uptime: self.started.elapsed(),
            clients: client_rows,
            nodes: node_rows,
        }
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.lock().expect("clients lock poisoned").len()
    }

    /// Number of connected nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.lock().expect("nodes lock poisoned").len()
    }
}

impl Default for BrokerState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BrokerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerState")
            .field("clients", &self.client_count())
            .field("nodes", &self.node_count())
            .finish_non_exhaustive()
    }
}

// ─── Status types ──────────────────────────────────────────────────────────

/// One client's row in the status summary.
#[derive(Debug, Clone)]
pub struct ClientStatus {
    pub addr: SocketAddr,
    pub queued: usize,
    pub results: usize,
    pub submitted: u64,
    pub completed: u64,
}

/// One node's row in the status summary.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub addr: SocketAddr,
    pub has_task: bool,
    pub in_flight: usize,
}

/// Point-in-time view of the broker for logging.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub uptime: Duration,
    pub clients: Vec<ClientStatus>,
    pub nodes: Vec<NodeStatus>,
}

impl StatusSnapshot {
    /// Total subtasks in flight across all nodes.
    pub fn total_in_flight(&self) -> usize {
        self.nodes.iter().map(|n| n.in_flight).sum()
    }

    /// Total subtasks pending across all clients.
    pub fn total_pending(&self) -> usize {
        self.clients.iter().map(|c| c.queued).sum()
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────
