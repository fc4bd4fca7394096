//! Node connection handler.
//!
//! Nodes pull work in two steps. `GETTASK` asks the fair dispatcher which
//! client to service; the reply carries the task id, the algorithm id if the
//! client supplied one, and — only when the node reports `DOESNOTHAVEFILE` —
//! the processor source. `GETSUBTASK` then pops individual inputs from that
//! task's pending queue until it drains (`NONEWSUBTASKS`), and
//! `SUBMITSUBTASKOUTPUT` returns each output.
//!
//! Everything the node has checked out is tracked in its in-flight set. When
//! the connection dies — EOF, reset, or idle timeout — cleanup pushes those
//! subtasks back onto their owners' pending queues, so an accepted subtask
//! survives any number of node failures (at-least-once execution).

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::state::{BrokerState, NodeId};
use crate::protocol::wire::{Connection, WireError, WireResult};
use crate::protocol::{Command, Response};

/// Drive one node connection to completion, including reclamation.
pub(crate) async fn handle(
    mut conn: Connection,
    state: Arc<BrokerState>,
    shutdown: CancellationToken,
) {
    let peer = conn.peer_addr();
    let node = state.register_node(peer);

    let cleanup_state = Arc::clone(&state);
    let _cleanup = scopeguard::guard((), move |_| {
        cleanup_state.remove_node(node);
        log::info!("[Broker] node {node} cleaned up");
    });

    match command_loop(&mut conn, &state, node, &shutdown).await {
        Ok(()) => log::info!("[Broker] {peer}: node session ended"),
        Err(e) if e.is_violation() => log::warn!("[Broker] {peer}: closing node: {e}"),
        Err(e) => log::info!("[Broker] {peer}: node disconnected: {e}"),
    }
}

/// Serve commands until `EXIT`, disconnect, or shutdown.
async fn command_loop(
    conn: &mut Connection,
    state: &BrokerState,
    node: NodeId,
    shutdown: &CancellationToken,
) -> WireResult<()> {
    let peer = conn.peer_addr();
    loop {
        let command = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            command = conn.expect_command() => command?,
        };

        match command {
            Command::Ping => conn.send_command(Command::Pong).await?,
            Command::Exit => {
                log::info!("[Broker] {peer}: received exit command");
                return Ok(());
            }
            Command::GetTask => get_task(conn, state, node).await?,
            Command::GetSubtask => get_subtask(conn, state, node).await?,
            Command::SubmitSubtaskOutput => submit_output(conn, state, node).await?,
            other => {
                log::warn!("[Broker] {peer}: ignoring unexpected command {other:?}");
            }
        }
    }
}

/// One `GETTASK` exchange: dispatch, announce, and maybe stream the source.
async fn get_task(conn: &mut Connection, state: &BrokerState, node: NodeId) -> WireResult<()> {
    let Some(assignment) = state.select_task(node) else {
        return conn.send_response(Response::NoNewTasks).await;
    };

    conn.send_response(Response::Ok).await?;
    conn.send_data(assignment.task.as_bytes()).await?;
    match assignment.algorithm {
        Some(algorithm) => {
            conn.send_response(Response::SendAlgorithmId).await?;
            conn.send_data(algorithm.as_bytes()).await?;
        }
        None => conn.send_response(Response::NoAlgorithmId).await?,
    }

    match conn.expect_response().await? {
        Response::Ok => {
            log::debug!("[Broker] node {node}: starting task {} (cached)", assignment.task);
        }
        Response::DoesNotHaveFile => {
            let source = state.processor_source(assignment.task).ok_or_else(|| {
                // The client vanished between dispatch and download; nothing
                // useful can be sent, so the exchange cannot be completed.
                WireError::Violation(format!(
                    "processor for task {} is no longer available",
                    assignment.task
                ))
            })?;
            conn.send_data(&source).await?;
            log::debug!(
                "[Broker] node {node}: starting task {} after receiving files",
                assignment.task
            );
        }
        other => {
            return Err(WireError::Violation(format!(
                "unexpected has-file response {other:?}"
            )))
        }
    }
    Ok(())
}

/// One `GETSUBTASK` exchange: pop an input or report the queue drained.
async fn get_subtask(conn: &mut Connection, state: &BrokerState, node: NodeId) -> WireResult<()> {
    let task = expect_uuid(conn, "task id").await?;

    match state.checkout_subtask(task, node) {
        None => {
            conn.send_response(Response::NoNewSubtasks).await?;
            state.clear_node_task(node);
            Ok(())
        }
        Some((subtask, input)) => {
            conn.send_response(Response::Ok).await?;
            conn.send_data(subtask.as_bytes()).await?;
            conn.send_data(&input).await?;
            log::debug!("[Broker] node {node}: starting subtask {subtask}");
            Ok(())
        }
    }
}

/// One `SUBMITSUBTASKOUTPUT` exchange. No reply packet; the next command
/// follows directly.
async fn submit_output(conn: &mut Connection, state: &BrokerState, node: NodeId) -> WireResult<()> {
    let subtask = expect_uuid(conn, "subtask id").await?;
    let output = Bytes::from(conn.expect_data().await?);

    if state.complete_subtask(node, subtask, output) {
        log::debug!("[Broker] node {node}: finished subtask {subtask}");
    } else {
        log::debug!("[Broker] node {node}: discarded output for {subtask} (owner gone)");
    }
    Ok(())
}

/// Receive a data packet that must contain a 16-byte UUID.
async fn expect_uuid(conn: &mut Connection, what: &str) -> WireResult<Uuid> {
    let bytes = conn.expect_data().await?;
    Uuid::from_slice(&bytes)
        .map_err(|_| WireError::Violation(format!("{what} is {} bytes, expected 16", bytes.len())))
}
