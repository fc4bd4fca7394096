//! Framed packet transport over TCP.
//!
//! [`Connection`] wraps a `TcpStream` with the framing of
//! [`crate::protocol`], `TCP_NODELAY`, and the per-socket idle timeout.
//! Every read and write is bounded by the timeout; a peer that goes silent
//! surfaces as [`WireError::TimedOut`] and is handled like any other
//! disconnect.
//!
//! Errors split into two families the handlers treat differently:
//! transport failures (peer closed, reset, timed out) are routine and
//! cleaned up quietly; protocol violations (wrong packet type, malformed
//! code, oversized length) are logged as misbehaving peers. Both terminate
//! the connection.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{Packet, Command, Response, MAX_PAYLOAD_SIZE};
use crate::constants::IDLE_TIMEOUT;

/// Transport and framing errors.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The peer closed the connection (EOF or reset).
    #[error("connection closed by peer")]
    Closed,

    /// No complete packet arrived within the idle timeout.
    #[error("connection idle timeout expired")]
    TimedOut,

    /// Any other socket-level failure.
    #[error("socket error: {0}")]
    Io(std::io::Error),

    /// The peer sent something that is not a well-formed packet, or a packet
    /// that is invalid at this point in the exchange.
    #[error("protocol violation: {0}")]
    Violation(String),
}

impl WireError {
    /// True for the violation family; false for transport failures.
    pub fn is_violation(&self) -> bool {
        matches!(self, Self::Violation(_))
    }

    /// Build a violation for a packet that is valid on the wire but wrong
    /// for the current point in the exchange.
    pub fn unexpected(wanted: &str, got: &Packet) -> Self {
        Self::Violation(format!("expected {wanted}, got {got:?}"))
    }
}

impl From<std::io::Error> for WireError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => Self::Closed,
            _ => Self::Io(err),
        }
    }
}

pub type WireResult<T> = Result<T, WireError>;

// ─── Raw framing ───────────────────────────────────────────────────────────

/// Read exactly one framed packet from `reader`.
///
/// Blocks until the length prefix, type code, and full payload have arrived.
/// Not timeout-bounded — callers that need the idle timeout go through
/// [`Connection::recv`].
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> WireResult<Packet> {
    let mut header = [0u8; 8];
    reader.read_exact(&mut header).await?;

    let length = u32::from_be_bytes(header[0..4].try_into().expect("4-byte slice"));
    let type_code = u32::from_be_bytes(header[4..8].try_into().expect("4-byte slice"));

    if length > MAX_PAYLOAD_SIZE {
        return Err(WireError::Violation(format!(
            "payload length {length} exceeds cap {MAX_PAYLOAD_SIZE}"
        )));
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;

    Packet::decode(type_code, &payload)
}

/// Write one framed packet to `writer`.
pub async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet: &Packet,
) -> WireResult<()> {
    writer.write_all(&packet.encode()).await?;
    writer.flush().await?;
    Ok(())
}

// ─── Connection ────────────────────────────────────────────────────────────

/// A framed TCP connection with idle timeout.
///
/// One `Connection` is owned by exactly one handler task, which performs all
/// reads and writes — packets are never interleaved. Peers that need an
/// auxiliary sender (the node's keepalive pinger) share the connection behind
/// an async mutex held for the full exchange.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    idle_timeout: Duration,
}

impl Connection {
    /// Wrap an accepted stream. Sets `TCP_NODELAY`.
    pub fn new(stream: TcpStream) -> WireResult<Self> {
        Self::with_timeout(stream, IDLE_TIMEOUT)
    }

    /// Wrap a stream with a non-default idle timeout (tests shrink it).
    pub fn with_timeout(stream: TcpStream, idle_timeout: Duration) -> WireResult<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        Ok(Self {
            stream,
            peer,
            idle_timeout,
        })
    }

    /// Connect to a broker and wrap the stream.
    pub async fn connect(addr: SocketAddr) -> WireResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::new(stream)
    }

    /// Peer address, as captured at accept time.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Receive one packet, bounded by the idle timeout.
    pub async fn recv(&mut self) -> WireResult<Packet> {
        match timeout(self.idle_timeout, read_packet(&mut self.stream)).await {
            Ok(result) => result,
            Err(_) => Err(WireError::TimedOut),
        }
    }

    /// Send one packet, bounded by the idle timeout.
    pub async fn send(&mut self, packet: &Packet) -> WireResult<()> {
        match timeout(self.idle_timeout, write_packet(&mut self.stream, packet)).await {
            Ok(result) => result,
            Err(_) => Err(WireError::TimedOut),
        }
    }

    /// Send a bare command.
    pub async fn send_command(&mut self, command: Command) -> WireResult<()> {
        self.send(&Packet::Command(command)).await
    }

    /// Send a bare response.
    pub async fn send_response(&mut self, response: Response) -> WireResult<()> {
        self.send(&Packet::Response(response)).await
    }

    /// Send a data payload.
    pub async fn send_data(&mut self, data: &[u8]) -> WireResult<()> {
        self.send(&Packet::Data(data.to_vec())).await
    }

    /// Receive a packet that must be a command.
    pub async fn expect_command(&mut self) -> WireResult<Command> {
        match self.recv().await? {
            Packet::Command(command) => Ok(command),
            other => Err(WireError::unexpected("command", &other)),
        }
    }

    /// Receive a packet that must be a response.
    pub async fn expect_response(&mut self) -> WireResult<Response> {
        match self.recv().await? {
            Packet::Response(response) => Ok(response),
            other => Err(WireError::unexpected("response", &other)),
        }
    }

    /// Receive a packet that must be a data payload.
    pub async fn expect_data(&mut self) -> WireResult<Vec<u8>> {
        match self.recv().await? {
            Packet::Data(data) => Ok(data),
            other => Err(WireError::unexpected("data", &other)),
        }
    }

    /// Client-side opening sequence: handshake magic, wait for `OK`, then
    /// identify with the given role tag (`Response::Client` or
    /// `Response::Node`).
    pub async fn open_as(&mut self, role: Response) -> WireResult<()> {
        self.send(&Packet::Handshake(super::HANDSHAKE_MAGIC.to_vec()))
            .await?;
        match self.expect_response().await? {
            Response::Ok => {}
            other => {
                return Err(WireError::Violation(format!(
                    "broker rejected handshake with {other:?}"
                )))
            }
        }
        self.send_response(role).await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HANDSHAKE_MAGIC;

    #[tokio::test]
    async fn packet_round_trip_through_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let sent = Packet::Data(b"1\n2".to_vec());
        write_packet(&mut a, &sent).await.unwrap();
        let received = read_packet(&mut b).await.unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn read_handles_byte_at_a_time_arrival() {
        let (mut a, mut b) = tokio::io::duplex(1);

        let sent = Packet::Handshake(HANDSHAKE_MAGIC.to_vec());
        let encoded = sent.encode();
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for byte in encoded {
                a.write_all(&[byte]).await.unwrap();
            }
        });

        let received = read_packet(&mut b).await.unwrap();
        assert_eq!(received, sent);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn eof_mid_payload_reads_as_closed() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        // Header promises 100 payload bytes, then the writer goes away.
        use tokio::io::AsyncWriteExt;
        a.write_all(&100u32.to_be_bytes()).await.unwrap();
        a.write_all(&crate::protocol::packet_type::DATA.to_be_bytes())
            .await
            .unwrap();
        drop(a);

        let err = read_packet(&mut b).await.unwrap_err();
        assert!(matches!(err, WireError::Closed), "got {err:?}");
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_a_violation() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        use tokio::io::AsyncWriteExt;
        a.write_all(&(MAX_PAYLOAD_SIZE + 1).to_be_bytes())
            .await
            .unwrap();
        a.write_all(&crate::protocol::packet_type::DATA.to_be_bytes())
            .await
            .unwrap();

        let err = read_packet(&mut b).await.unwrap_err();
        assert!(err.is_violation(), "got {err:?}");
    }

    #[tokio::test]
    async fn connection_recv_times_out_on_silence() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            // Connect and say nothing.
            let stream = TcpStream::connect(addr).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(stream);
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = Connection::with_timeout(stream, Duration::from_millis(100)).unwrap();
        let err = conn.recv().await.unwrap_err();
        assert!(matches!(err, WireError::TimedOut), "got {err:?}");
        client.abort();
    }

    #[tokio::test]
    async fn expect_helpers_flag_wrong_packet_kind() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut conn = Connection::connect(addr).await.unwrap();
            conn.send_data(b"not a command").await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = Connection::new(stream).unwrap();
        let err = conn.expect_command().await.unwrap_err();
        assert!(err.is_violation(), "got {err:?}");
        client.await.unwrap();
    }
}
