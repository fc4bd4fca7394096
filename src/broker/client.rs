//! Client connection handler.
//!
//! A client session has two phases. The upload phase stores the processor
//! source under `serverFiles/<peer>/<task>.src` and optionally records a
//! 16-byte algorithm id; it ends with `DONE`. The steady state then serves
//! commands until exit or disconnect:
//!
//! - `SUBMITSUBTASK`: bound check (`NOTENOUGHSPACE` when the queue is over
//!   [`crate::constants::MAX_PENDING_SUBTASKS`]), then `OK`, input bytes,
//!   and the minted subtask id back.
//! - `ISSUBTASKDONE`: `NONEWRESULTS`, or `OK` + subtask id + output bytes,
//!   consuming the result.
//! - `PING`/`EXIT` as everywhere; unknown commands are logged and ignored.
//!
//! Cleanup on any exit path removes the whole session: queues, counters, and
//! queued subtask rows. Work already in flight on nodes is orphaned — late
//! outputs are discarded by [`BrokerState::complete_subtask`].

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::state::{BrokerState, TaskId};
use crate::protocol::wire::{Connection, WireError, WireResult};
use crate::protocol::{Command, Response};

/// Drive one client connection to completion, including cleanup.
pub(crate) async fn handle(
    mut conn: Connection,
    state: Arc<BrokerState>,
    server_dir: &Path,
    shutdown: CancellationToken,
) {
    let peer = conn.peer_addr();

    let task = match upload_phase(&mut conn, &state, server_dir).await {
        Ok(task) => task,
        Err(e) if e.is_violation() => {
            log::warn!("[Broker] {peer}: closing client during upload: {e}");
            return;
        }
        Err(e) => {
            log::info!("[Broker] {peer}: client lost during upload: {e}");
            return;
        }
    };

    // From here on the session owns broker state; tear it down on every exit
    // path, including cancellation and panics.
    let cleanup_state = Arc::clone(&state);
    let _cleanup = scopeguard::guard((), move |_| {
        cleanup_state.remove_client(task);
        log::info!("[Broker] client session {task} cleaned up");
    });

    match steady_state(&mut conn, &state, task, &shutdown).await {
        Ok(()) => log::info!("[Broker] {peer}: client session ended"),
        Err(e) if e.is_violation() => log::warn!("[Broker] {peer}: closing client: {e}"),
        Err(e) => log::info!("[Broker] {peer}: client disconnected: {e}"),
    }
}

/// Receive the processor upload and the optional algorithm id, register the
/// session, and return its task id.
async fn upload_phase(
    conn: &mut Connection,
    state: &BrokerState,
    server_dir: &Path,
) -> WireResult<TaskId> {
    let peer = conn.peer_addr();
    let source = Bytes::from(conn.expect_data().await?);
    let task = Uuid::new_v4();

    // Keep the upload on disk as well; the address-named directory makes
    // operator inspection straightforward.
    let client_dir = server_dir.join(peer.to_string());
    let path = client_dir.join(format!("{task}.src"));
    let write_result = async {
        tokio::fs::create_dir_all(&client_dir).await?;
        tokio::fs::write(&path, &source).await
    }
    .await;
    if let Err(e) = write_result {
        // Local storage failure is not the peer's fault, but the session
        // cannot continue without its processor persisted.
        return Err(WireError::Violation(format!(
            "could not store processor at {}: {e}",
            path.display()
        )));
    }
    log::info!("[Broker] {peer}: received processor ({} bytes)", source.len());

    let mut algorithm = None;
    loop {
        match conn.expect_response().await? {
            Response::Done => break,
            Response::SendAlgorithmId => {
                let bytes = conn.expect_data().await?;
                let id = Uuid::from_slice(&bytes).map_err(|_| {
                    WireError::Violation(format!(
                        "algorithm id is {} bytes, expected 16",
                        bytes.len()
                    ))
                })?;
                log::info!("[Broker] {peer}: received algorithm id {id}");
                algorithm = Some(id);
            }
            other => {
                return Err(WireError::Violation(format!(
                    "unexpected upload-phase response {other:?}"
                )))
            }
        }
    }

    state.register_client(task, peer, source, algorithm);
    Ok(task)
}

/// Serve commands until `EXIT`, disconnect, or shutdown.
async fn steady_state(
    conn: &mut Connection,
    state: &BrokerState,
    task: TaskId,
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
            Command::SubmitSubtask => submit_subtask(conn, state, task).await?,
            Command::IsSubtaskDone => next_result(conn, state, task).await?,
            other => {
                // Unknown or wrong-role commands do not cost the connection.
                log::warn!("[Broker] {peer}: ignoring unexpected command {other:?}");
            }
        }
    }
}

/// One `SUBMITSUBTASK` exchange.
async fn submit_subtask(
    conn: &mut Connection,
    state: &BrokerState,
    task: TaskId,
) -> WireResult<()> {
    if state.pending_is_full(task) {
        return conn.send_response(Response::NotEnoughSpace).await;
    }

    conn.send_response(Response::Ok).await?;
    let input = Bytes::from(conn.expect_data().await?);
    let subtask = state
        .submit_subtask(task, input)
        .ok_or_else(|| WireError::Violation("session vanished mid-submission".into()))?;
    conn.send_data(subtask.as_bytes()).await?;
    log::debug!("[Broker] task {task}: accepted subtask {subtask}");
    Ok(())
}

/// One `ISSUBTASKDONE` exchange.
async fn next_result(conn: &mut Connection, state: &BrokerState, task: TaskId) -> WireResult<()> {
    match state.take_result(task) {
        None => conn.send_response(Response::NoNewResults).await,
        Some((subtask, output)) => {
            conn.send_response(Response::Ok).await?;
            conn.send_data(subtask.as_bytes()).await?;
            conn.send_data(&output).await?;
            log::debug!("[Broker] task {task}: delivered result {subtask}");
            Ok(())
        }
    }
}
