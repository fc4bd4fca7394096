//! The broker: accepts client and node connections and coordinates work.
//!
//! # Architecture
//!
//! ```text
//! Client ──SUBMITSUBTASK──► per-client pending queue ──┐
//!                                                      │ fair dispatch
//! Node ──GETTASK/GETSUBTASK◄──────────────────────────┘
//!      ──execute──► SUBMITSUBTASKOUTPUT ──► per-client result queue
//! Client ◄──ISSUBTASKDONE─────────────────────────────┘
//! ```
//!
//! One tokio task per accepted connection, plus the accept loop and a status
//! reporter. All handler tasks share one [`state::BrokerState`]; a
//! [`CancellationToken`] fans shutdown out to every loop. Handler failures
//! never cross task boundaries — a misbehaving or vanished peer costs exactly
//! its own connection and the cleanup of its own state.
//!
//! Every connection opens the same way: a `HANDSHAKE` packet carrying the
//! magic bytes, an `OK` from the broker, then a role tag (`CLIENT` or
//! `NODE`) that selects the handler. Anything else closes the connection
//! before any state is touched.

pub mod client;
pub mod dispatch;
pub mod node;
pub mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::constants::STATUS_INTERVAL;
use crate::protocol::wire::{Connection, WireError};
use crate::protocol::{Packet, Response, HANDSHAKE_MAGIC};
use state::BrokerState;

/// Connection role, decided by the post-handshake tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Node,
}

/// A bound broker, ready to run.
///
/// Splitting bind from run lets tests bind port 0 and read the real address
/// before any connection is made.
pub struct Broker {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<BrokerState>,
    server_dir: PathBuf,
    shutdown: CancellationToken,
}

impl Broker {
    /// Bind the listening socket and prepare shared state.
    pub async fn bind(config: &Config, shutdown: CancellationToken) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.port))
            .await
            .with_context(|| format!("bind broker port {}", config.port))?;
        let local_addr = listener.local_addr().context("read bound address")?;

        let server_dir = config.server_files_dir();
        tokio::fs::create_dir_all(&server_dir)
            .await
            .with_context(|| format!("create {}", server_dir.display()))?;

        log::info!("[Broker] listening on {local_addr}");

        Ok(Self {
            listener,
            local_addr,
            state: Arc::new(BrokerState::new()),
            server_dir,
            shutdown,
        })
    }

    /// Address the broker is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared state handle, for the status reporter and tests.
    pub fn state(&self) -> Arc<BrokerState> {
        Arc::clone(&self.state)
    }

    /// Run the accept loop and status reporter until shutdown.
    pub async fn run(self) -> Result<()> {
        let status = tokio::spawn(status_loop(
            Arc::clone(&self.state),
            self.shutdown.clone(),
        ));

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    log::info!("[Broker] {peer}: connected");
                    let state = Arc::clone(&self.state);
                    let server_dir = self.server_dir.clone();
                    let shutdown = self.shutdown.clone();
                    tokio::spawn(handle_connection(stream, state, server_dir, shutdown));
                }
                Err(e) => {
                    // Transient accept failures (EMFILE and friends) must not
                    // kill the broker; pause briefly and keep listening.
                    log::error!("[Broker] accept error: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }

        log::info!("[Broker] shutting down");
        let _ = status.await;
        Ok(())
    }
}

/// Bind and run a broker in one call — the `taskmill broker` entry point.
pub async fn run(config: Config, shutdown: CancellationToken) -> Result<()> {
    Broker::bind(&config, shutdown).await?.run().await
}

/// Drive one accepted connection: handshake, role dispatch, handler, close.
async fn handle_connection(
    stream: TcpStream,
    state: Arc<BrokerState>,
    server_dir: PathBuf,
    shutdown: CancellationToken,
) {
    let mut conn = match Connection::new(stream) {
        Ok(conn) => conn,
        Err(e) => {
            log::warn!("[Broker] could not set up accepted socket: {e}");
            return;
        }
    };
    let peer = conn.peer_addr();

    match establish_role(&mut conn).await {
        Ok(Role::Client) => {
            log::info!("[Broker] {peer}: registered as client");
            client::handle(conn, state, &server_dir, shutdown).await;
        }
        Ok(Role::Node) => {
            log::info!("[Broker] {peer}: registered as node");
            node::handle(conn, state, shutdown).await;
        }
        Err(e) if e.is_violation() => {
            log::warn!("[Broker] {peer}: closing: {e}");
        }
        Err(e) => {
            log::info!("[Broker] {peer}: closing: {e}");
        }
    }
    log::info!("[Broker] {peer}: connection closed");
}

/// Run the opening exchange and classify the connection.
///
/// No broker state is touched until this returns `Ok`, so a rejected
/// connection leaves no trace.
async fn establish_role(conn: &mut Connection) -> Result<Role, WireError> {
    match conn.recv().await? {
        Packet::Handshake(magic) if magic == HANDSHAKE_MAGIC => {}
        Packet::Handshake(_) => {
            return Err(WireError::Violation("bad handshake magic".into()));
        }
        other => return Err(WireError::unexpected("handshake", &other)),
    }
    conn.send_response(Response::Ok).await?;

    match conn.expect_response().await? {
        Response::Client => Ok(Role::Client),
        Response::Node => Ok(Role::Node),
        other => Err(WireError::Violation(format!(
            "expected a role tag, got {other:?}"
        ))),
    }
}

/// Periodically log a one-line summary of broker state.
async fn status_loop(state: Arc<BrokerState>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(STATUS_INTERVAL) => {}
        }

        let snapshot = state.snapshot();
        log::info!(
            "[Broker] up {}s | {} node(s), {} in flight | {} client(s), {} pending",
            snapshot.uptime.as_secs(),
            snapshot.nodes.len(),
            snapshot.total_in_flight(),
            snapshot.clients.len(),
            snapshot.total_pending(),
        );
        for client in &snapshot.clients {
            log::debug!(
                "[Broker]   client {} queue-in {} queue-out {} done {}/{}",
                client.addr,
                client.queued,
                client.results,
                client.completed,
                client.submitted,
            );
        }
    }
}
