//! Worker node runtime.
//!
//! A node is a pull-based worker: it asks the broker which task to service
//! (`GETTASK`), makes sure it has the processor locally (downloading the
//! source only when neither the source nor a precompiled binary for the
//! task's algorithm id is cached), then drains the task's subtask queue —
//! `GETSUBTASK`, execute, `SUBMITSUBTASKOUTPUT` — until the broker reports
//! `NONEWSUBTASKS`, and starts over.
//!
//! The connection is shared between the work loop and a background keepalive
//! task behind an async mutex. Whoever holds the lock completes its entire
//! multi-packet exchange before releasing it, so framed messages are never
//! interleaved on the socket. A broker that stops answering ends the node:
//! a closed socket is terminal, while individual surprising replies are
//! logged and the exchange abandoned.

pub mod executor;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::constants::POLL_BACKOFF;
use crate::protocol::wire::{Connection, WireError, WireResult};
use crate::protocol::{Command, Packet, Response};
use executor::{Executor, Processor};

/// A task the broker assigned to this node, with its runnable processor.
#[derive(Debug)]
struct TaskLease {
    task: Uuid,
    processor: Processor,
}

/// Connect to `broker` and work until the connection dies or `shutdown`
/// fires.
pub async fn run(broker: SocketAddr, config: Config, shutdown: CancellationToken) -> Result<()> {
    let mut conn = Connection::connect(broker)
        .await
        .with_context(|| format!("connect to broker {broker}"))?;
    conn.open_as(Response::Node)
        .await
        .context("identify as node")?;
    log::info!("[Node] connected to {broker}");

    let files_dir = config.node_files_dir();
    tokio::fs::create_dir_all(&files_dir)
        .await
        .with_context(|| format!("create {}", files_dir.display()))?;
    let executor = Executor::new(files_dir, config.interpreter.clone());

    // The session token ends the keepalive task when the work loop exits for
    // any reason, not just operator shutdown.
    let session = shutdown.child_token();
    let conn = Arc::new(Mutex::new(conn));
    let pinger = tokio::spawn(keepalive_loop(Arc::clone(&conn), session.clone()));

    let result = work_loop(&conn, &executor, &session).await;
    session.cancel();
    let _ = pinger.await;

    // Best-effort goodbye so the broker logs a clean exit instead of a
    // timeout.
    if let Ok(mut conn) = conn.try_lock() {
        let _ = conn.send_command(Command::Exit).await;
    }
    log::info!("[Node] stopped");
    result
}

/// Ping the broker every [`POLL_BACKOFF`] so an otherwise idle connection
/// survives the broker's idle timeout.
async fn keepalive_loop(conn: Arc<Mutex<Connection>>, session: CancellationToken) {
    loop {
        tokio::select! {
            _ = session.cancelled() => return,
            _ = tokio::time::sleep(POLL_BACKOFF) => {}
        }

        let mut conn = conn.lock().await;
        let result: WireResult<()> = async {
            conn.send_command(Command::Ping).await?;
            match conn.recv().await? {
                Packet::Command(Command::Pong) => Ok(()),
                other => {
                    log::warn!("[Node] broker did not pong (got {other:?})");
                    Ok(())
                }
            }
        }
        .await;

        if let Err(e) = result {
            log::info!("[Node] keepalive failed, stopping: {e}");
            session.cancel();
            return;
        }
    }
}

/// Acquire tasks and drain them until the session ends.
async fn work_loop(
    conn: &Mutex<Connection>,
    executor: &Executor,
    session: &CancellationToken,
) -> Result<()> {
    loop {
        if session.is_cancelled() {
            return Ok(());
        }

        let lease = {
            let mut conn = conn.lock().await;
            acquire_task(&mut conn, executor).await
        };

        let lease = match lease {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                log::debug!("[Node] no new tasks");
                tokio::select! {
                    _ = session.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(POLL_BACKOFF) => continue,
                }
            }
            Err(WireError::Violation(reason)) => {
                // A surprising reply spoils this exchange, not the session.
                log::warn!("[Node] task acquisition went off-script: {reason}");
                continue;
            }
            Err(e) => return Err(e).context("acquire task"),
        };

        log::info!("[Node] servicing task {}", lease.task);
        run_subtasks(conn, executor, &lease, session).await?;
    }
}

/// One `GETTASK` exchange, including the cached-processor negotiation.
async fn acquire_task(
    conn: &mut Connection,
    executor: &Executor,
) -> WireResult<Option<TaskLease>> {
    conn.send_command(Command::GetTask).await?;
    match conn.expect_response().await? {
        Response::NoNewTasks => return Ok(None),
        Response::Ok => {}
        other => {
            return Err(WireError::Violation(format!(
                "unexpected GETTASK response {other:?}"
            )))
        }
    }

    let task = expect_uuid(conn, "task id").await?;
    let algorithm = match conn.expect_response().await? {
        Response::SendAlgorithmId => Some(expect_uuid(conn, "algorithm id").await?),
        Response::NoAlgorithmId => None,
        other => {
            return Err(WireError::Violation(format!(
                "unexpected algorithm-id response {other:?}"
            )))
        }
    };

    let processor = match executor.cached(task, algorithm) {
        Some(processor) => {
            conn.send_response(Response::Ok).await?;
            log::debug!("[Node] processor for {task} already cached");
            processor
        }
        None => {
            conn.send_response(Response::DoesNotHaveFile).await?;
            let source = conn.expect_data().await?;
            log::debug!("[Node] received processor for {task} ({} bytes)", source.len());
            executor
                .store_source(task, &source)
                .await
                .map_err(|e| WireError::Violation(format!("cannot store processor: {e}")))?
        }
    };

    Ok(Some(TaskLease { task, processor }))
}

/// Drain the leased task's queue.
async fn run_subtasks(
    conn: &Mutex<Connection>,
    executor: &Executor,
    lease: &TaskLease,
    session: &CancellationToken,
) -> Result<()> {
    loop {
        if session.is_cancelled() {
            return Ok(());
        }

        let fetched = {
            let mut conn = conn.lock().await;
            fetch_subtask(&mut conn, lease.task).await
        };
        let (subtask, input) = match fetched {
            Ok(Some(work)) => work,
            Ok(None) => {
                log::debug!("[Node] no new subtasks for {}", lease.task);
                return Ok(());
            }
            Err(WireError::Violation(reason)) => {
                log::warn!("[Node] subtask fetch went off-script: {reason}");
                continue;
            }
            Err(e) => return Err(e).context("fetch subtask"),
        };

        log::debug!("[Node] executing subtask {subtask}");
        let output = executor
            .execute(&lease.processor, &input)
            .await
            .with_context(|| format!("execute subtask {subtask}"))?;

        let mut conn = conn.lock().await;
        conn.send_command(Command::SubmitSubtaskOutput).await?;
        conn.send_data(subtask.as_bytes()).await?;
        conn.send_data(&output).await?;
        log::debug!("[Node] finished subtask {subtask}");
    }
}

/// One `GETSUBTASK` exchange.
async fn fetch_subtask(
    conn: &mut Connection,
    task: Uuid,
) -> WireResult<Option<(Uuid, Vec<u8>)>> {
    conn.send_command(Command::GetSubtask).await?;
    conn.send_data(task.as_bytes()).await?;
    match conn.expect_response().await? {
        Response::NoNewSubtasks => Ok(None),
        Response::Ok => {
            let subtask = expect_uuid(conn, "subtask id").await?;
            let input = conn.expect_data().await?;
            Ok(Some((subtask, input)))
        }
        other => Err(WireError::Violation(format!(
            "unexpected GETSUBTASK response {other:?}"
        ))),
    }
}

/// Receive a data packet that must contain a 16-byte UUID.
async fn expect_uuid(conn: &mut Connection, what: &str) -> WireResult<Uuid> {
    let bytes = conn.expect_data().await?;
    Uuid::from_slice(&bytes)
        .map_err(|_| WireError::Violation(format!("{what} is {} bytes, expected 16", bytes.len())))
}
