//! Submitter (client) runtime.
//!
//! A client session uploads one processor, then drives a submit/poll loop:
//! push inputs until the broker reports `NOTENOUGHSPACE` or the input list
//! is exhausted, poll for completed results until `NONEWRESULTS`, and repeat
//! with keepalive pings in between. When every input has been submitted and
//! every result collected, the session sends `EXIT` and returns the result
//! map keyed by input.
//!
//! Results are persisted to `clientFiles/clientOutput.txt`; while the job
//! runs, a checkpoint of the partial map is rewritten to
//! `clientFiles/clientTempCheckpoint.txt` every `checkpoint_frequency` new
//! results, so a crashed client can recover most of a long run.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::protocol::wire::Connection;
use crate::protocol::{Command, Packet, Response};

/// Delay between submit/poll rounds. Short enough to keep small jobs
/// snappy, long enough to not spin against a busy broker.
const ROUND_DELAY: Duration = Duration::from_millis(500);

/// A batch job: one processor applied to many inputs.
#[derive(Debug, Clone)]
pub struct Job {
    /// Path to the processor source to upload.
    pub processor: PathBuf,
    /// Optional algorithm id for nodes holding a precompiled build.
    pub algorithm: Option<Uuid>,
    /// Subtask inputs, submitted in order.
    pub inputs: Vec<String>,
}

/// Run `job` against the broker at `broker` and return input → output.
///
/// Writes the final map to `clientFiles/clientOutput.txt` under the config's
/// data dir, plus periodic checkpoints while running.
pub async fn run_job(
    broker: SocketAddr,
    config: &Config,
    job: Job,
    shutdown: CancellationToken,
) -> Result<HashMap<String, String>> {
    let source = tokio::fs::read(&job.processor)
        .await
        .with_context(|| format!("read processor {}", job.processor.display()))?;

    let files_dir = config.client_files_dir();
    tokio::fs::create_dir_all(&files_dir)
        .await
        .with_context(|| format!("create {}", files_dir.display()))?;

    let mut conn = Connection::connect(broker)
        .await
        .with_context(|| format!("connect to broker {broker}"))?;
    conn.open_as(Response::Client)
        .await
        .context("identify as client")?;
    log::info!("[Client] connected to {broker}");

    // Upload phase: processor, optional algorithm id, DONE.
    conn.send_data(&source).await.context("upload processor")?;
    if let Some(algorithm) = job.algorithm {
        conn.send_response(Response::SendAlgorithmId).await?;
        conn.send_data(algorithm.as_bytes()).await?;
        log::info!("[Client] announced algorithm id {algorithm}");
    }
    conn.send_response(Response::Done).await?;
    log::info!("[Client] uploaded processor ({} bytes)", source.len());

    let mut session = Session {
        conn,
        files_dir,
        checkpoint_frequency: config.checkpoint_frequency.max(1),
        results: HashMap::new(),
        in_flight: HashMap::new(),
        results_since_checkpoint: 0,
    };

    let mut remaining = job.inputs.into_iter();
    let mut next_input = None;
    loop {
        if shutdown.is_cancelled() {
            bail!("interrupted with {} subtask(s) outstanding", session.in_flight.len());
        }

        session.ping().await?;
        session.submit_available(&mut remaining, &mut next_input).await?;
        session.collect_results().await?;

        // submit_available leaves `next_input` empty only once the input
        // list is exhausted, so this means fully submitted and fully
        // collected.
        if next_input.is_none() && session.in_flight.is_empty() {
            break;
        }

        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(ROUND_DELAY) => {}
        }
    }

    session.conn.send_command(Command::Exit).await.ok();
    log::info!("[Client] all {} subtask(s) finished", session.results.len());

    session.write_map("clientOutput.txt").await?;
    Ok(session.results)
}

/// Connection plus job-progress bookkeeping.
struct Session {
    conn: Connection,
    files_dir: PathBuf,
    checkpoint_frequency: usize,
    /// input → output for everything finished.
    results: HashMap<String, String>,
    /// subtask id → input for everything accepted but not yet returned.
    in_flight: HashMap<Uuid, String>,
    results_since_checkpoint: usize,
}

impl Session {
    /// Keepalive. A missing pong is logged, not fatal — the broker may be
    /// mid-shutdown and the next exchange will surface the real error.
    async fn ping(&mut self) -> Result<()> {
        self.conn.send_command(Command::Ping).await?;
        match self.conn.recv().await? {
            Packet::Command(Command::Pong) => {}
            other => log::warn!("[Client] broker did not pong (got {other:?})"),
        }
        Ok(())
    }

    /// Submit inputs until the queue fills or inputs run out.
    async fn submit_available(
        &mut self,
        remaining: &mut std::vec::IntoIter<String>,
        next_input: &mut Option<String>,
    ) -> Result<()> {
        loop {
            if next_input.is_none() {
                *next_input = remaining.next();
            }
            let Some(input) = next_input.as_ref() else {
                return Ok(());
            };

            self.conn.send_command(Command::SubmitSubtask).await?;
            match self.conn.expect_response().await? {
                Response::Ok => {
                    self.conn.send_data(input.as_bytes()).await?;
                    let id_bytes = self.conn.expect_data().await?;
                    let subtask = Uuid::from_slice(&id_bytes)
                        .context("broker sent a malformed subtask id")?;
                    let input = next_input.take().expect("checked above");
                    log::debug!("[Client] submitted subtask {subtask}");
                    self.in_flight.insert(subtask, input);
                }
                Response::NotEnoughSpace => {
                    log::debug!("[Client] queue full, backing off");
                    return Ok(());
                }
                other => {
                    log::warn!("[Client] unexpected submit response {other:?}");
                    return Ok(());
                }
            }
        }
    }

    /// Drain completed results until the broker has none waiting.
    async fn collect_results(&mut self) -> Result<()> {
        loop {
            self.conn.send_command(Command::IsSubtaskDone).await?;
            match self.conn.expect_response().await? {
                Response::Ok => {
                    let id_bytes = self.conn.expect_data().await?;
                    let subtask = Uuid::from_slice(&id_bytes)
                        .context("broker sent a malformed subtask id")?;
                    let output = self.conn.expect_data().await?;

                    match self.in_flight.remove(&subtask) {
                        Some(input) => {
                            log::debug!("[Client] finished subtask {subtask}");
                            self.results
                                .insert(input, String::from_utf8_lossy(&output).into_owned());
                            self.results_since_checkpoint += 1;
                            if self.results_since_checkpoint >= self.checkpoint_frequency {
                                self.results_since_checkpoint = 0;
                                self.write_map("clientTempCheckpoint.txt").await?;
                            }
                        }
                        None => {
                            log::warn!("[Client] result for unknown subtask {subtask}, ignoring");
                        }
                    }
                }
                Response::NoNewResults => return Ok(()),
                other => {
                    log::warn!("[Client] unexpected poll response {other:?}");
                    return Ok(());
                }
            }
        }
    }

    /// Write the current result map as pretty JSON under the client files
    /// dir.
    async fn write_map(&self, file_name: &str) -> Result<()> {
        let path = self.files_dir.join(file_name);
        let json = serde_json::to_string_pretty(&self.results)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }
}

/// Prompt interactively for the broker address when none was given.
pub fn prompt_broker_addr(default_port: u16) -> Result<SocketAddr> {
    use std::io::Write;

    print!("broker address: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    parse_broker_addr(line.trim(), default_port)
}

/// Parse `host`, `host:port`, or a bare IP, filling in the default port.
pub fn parse_broker_addr(input: &str, default_port: u16) -> Result<SocketAddr> {
    use std::net::ToSocketAddrs;

    let candidate = if input.contains(':') {
        input.to_string()
    } else {
        format!("{input}:{default_port}")
    };
    candidate
        .to_socket_addrs()
        .with_context(|| format!("resolve broker address {input:?}"))?
        .next()
        .with_context(|| format!("broker address {input:?} resolved to nothing"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_addr_fills_default_port() {
        let addr = parse_broker_addr("127.0.0.1", 8111).unwrap();
        assert_eq!(addr.port(), 8111);
    }

    #[test]
    fn parse_addr_keeps_explicit_port() {
        let addr = parse_broker_addr("127.0.0.1:9000", 8111).unwrap();
        assert_eq!(addr.port(), 9000);
    }

    #[test]
    fn parse_addr_rejects_garbage() {
        assert!(parse_broker_addr("not an address at all", 8111).is_err());
    }
}
