//! Wire protocol types and codec.
//!
//! Every message between broker, client, and node is one framed packet:
//!
//! ```text
//! [u32 BE: payload length] [u32 BE: packet type] [payload bytes]
//! ```
//!
//! Packet types:
//! - `1` `Handshake` — the three magic bytes, sent once per connection
//! - `2` `Command`   — a `u32 BE` command code
//! - `3` `Response`  — a `u32 BE` response code (role tags and status codes)
//! - `4` `Data`      — opaque bytes (UUIDs, inputs, outputs, processor source)
//!
//! Type `0` is reserved for internal read-failure signalling and never
//! appears on the wire.
//!
//! The protocol is strictly request-response: within one connection the
//! broker never sends an unsolicited packet. Multi-packet exchanges (e.g.
//! subtask submission: command, response, data, data) are sequenced by the
//! handler logic in [`crate::broker`]; this module only frames single
//! packets.

pub mod wire;

use wire::WireError;

/// Magic bytes carried by the opening `Handshake` packet.
///
/// Any connection whose first packet is not a handshake with exactly these
/// bytes is closed before any broker state is touched.
pub const HANDSHAKE_MAGIC: [u8; 3] = [32, 51, 70];

/// Maximum accepted payload size (64 MB).
///
/// Caps decoder allocation against absurd length prefixes from broken or
/// hostile peers. Processor sources and subtask payloads are far below this.
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

// ─── Wire code constants ───────────────────────────────────────────────────

/// Packet type codes as they appear on the wire.
pub mod packet_type {
    /// Reserved for internal "read failed" signalling, never sent.
    pub const INVALID: u32 = 0;
    /// Connection-opening magic bytes.
    pub const HANDSHAKE: u32 = 1;
    /// A `u32 BE` command code.
    pub const COMMAND: u32 = 2;
    /// A `u32 BE` response code.
    pub const RESPONSE: u32 = 3;
    /// Opaque payload bytes.
    pub const DATA: u32 = 4;
}

// ─── Commands ──────────────────────────────────────────────────────────────

/// Commands sent in `Command` packets.
///
/// Clients send `Ping`, `Exit`, `SubmitSubtask`, and `IsSubtaskDone`; nodes
/// send `Ping`, `Exit`, `GetTask`, `GetSubtask`, and `SubmitSubtaskOutput`.
/// `Pong` is the broker's reply to `Ping` (a command, not a response, so a
/// pinger can match on packet type alone).
///
/// Codes outside the known set decode to [`Command::Unknown`] rather than
/// failing: an established session logs and ignores unknown commands instead
/// of dropping the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Keepalive request.
    Ping,
    /// Keepalive reply.
    Pong,
    /// Clean session termination.
    Exit,
    /// Node asks which task to service next.
    GetTask,
    /// Node asks for the next subtask of its current task.
    GetSubtask,
    /// Client submits one subtask input.
    SubmitSubtask,
    /// Client polls for one completed result.
    IsSubtaskDone,
    /// Node returns one subtask output.
    SubmitSubtaskOutput,
    /// Any code not listed above; carried for logging.
    Unknown(u32),
}

impl Command {
    /// The `u32` wire code for this command.
    pub fn code(self) -> u32 {
        match self {
            Self::Ping => 0,
            Self::Pong => 1,
            Self::Exit => 5,
            Self::GetTask => 10,
            Self::GetSubtask => 11,
            Self::SubmitSubtask => 12,
            Self::IsSubtaskDone => 13,
            Self::SubmitSubtaskOutput => 14,
            Self::Unknown(code) => code,
        }
    }

    /// Decode a wire code. Unknown codes are preserved, not rejected.
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Ping,
            1 => Self::Pong,
            5 => Self::Exit,
            10 => Self::GetTask,
            11 => Self::GetSubtask,
            12 => Self::SubmitSubtask,
            13 => Self::IsSubtaskDone,
            14 => Self::SubmitSubtaskOutput,
            other => Self::Unknown(other),
        }
    }
}

// ─── Responses ─────────────────────────────────────────────────────────────

/// Responses sent in `Response` packets.
///
/// `Node` and `Client` are the role tags a connection sends right after the
/// handshake; everything else is a status code. The backpressure codes
/// (`NoNewTasks`, `NoNewSubtasks`, `NotEnoughSpace`, `NoNewResults`) are not
/// errors — callers back off and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Role tag: this connection is a worker node.
    Node,
    /// Role tag: this connection is a submitting client.
    Client,
    /// Generic success.
    Ok,
    /// End of a phase (client upload handshake).
    Done,
    /// No client currently has pending work.
    NoNewTasks,
    /// Node does not have the processor cached; broker must send it.
    DoesNotHaveFile,
    /// The queried task has no pending subtasks.
    NoNewSubtasks,
    /// The client's pending queue is full.
    NotEnoughSpace,
    /// No completed results are waiting.
    NoNewResults,
    /// A 16-byte algorithm id follows in a `Data` packet.
    SendAlgorithmId,
    /// The task has no algorithm id.
    NoAlgorithmId,
}

impl Response {
    /// The `u32` wire code for this response.
    pub fn code(self) -> u32 {
        match self {
            Self::Node => 83,
            Self::Client => 98,
            Self::Ok => 0,
            Self::Done => 1,
            Self::NoNewTasks => 11,
            Self::DoesNotHaveFile => 12,
            Self::NoNewSubtasks => 13,
            Self::NotEnoughSpace => 14,
            Self::NoNewResults => 15,
            Self::SendAlgorithmId => 16,
            Self::NoAlgorithmId => 17,
        }
    }

    /// Decode a wire code. Unlike commands, an unknown response code has no
    /// safe interpretation mid-exchange, so it is a decode failure.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            83 => Some(Self::Node),
            98 => Some(Self::Client),
            0 => Some(Self::Ok),
            1 => Some(Self::Done),
            11 => Some(Self::NoNewTasks),
            12 => Some(Self::DoesNotHaveFile),
            13 => Some(Self::NoNewSubtasks),
            14 => Some(Self::NotEnoughSpace),
            15 => Some(Self::NoNewResults),
            16 => Some(Self::SendAlgorithmId),
            17 => Some(Self::NoAlgorithmId),
            _ => None,
        }
    }
}

// ─── Packet ────────────────────────────────────────────────────────────────

/// One framed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Connection-opening magic bytes.
    Handshake(Vec<u8>),
    /// A command code.
    Command(Command),
    /// A response code.
    Response(Response),
    /// Opaque payload bytes.
    Data(Vec<u8>),
}

impl Packet {
    /// The wire type code for this packet.
    pub fn type_code(&self) -> u32 {
        match self {
            Self::Handshake(_) => packet_type::HANDSHAKE,
            Self::Command(_) => packet_type::COMMAND,
            Self::Response(_) => packet_type::RESPONSE,
            Self::Data(_) => packet_type::DATA,
        }
    }

    /// Encode into wire bytes: `[u32 BE length][u32 BE type][payload]`.
    pub fn encode(&self) -> Vec<u8> {
        let payload: &[u8] = match self {
            Self::Handshake(bytes) | Self::Data(bytes) => bytes,
            Self::Command(command) => return encode_coded(packet_type::COMMAND, command.code()),
            Self::Response(response) => {
                return encode_coded(packet_type::RESPONSE, response.code())
            }
        };

        let mut buf = Vec::with_capacity(8 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.type_code().to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    /// Decode a packet from its type code and payload bytes.
    ///
    /// The length prefix has already been consumed by the framing layer;
    /// `payload` is exactly `length` bytes.
    pub fn decode(type_code: u32, payload: &[u8]) -> Result<Self, WireError> {
        match type_code {
            packet_type::HANDSHAKE => Ok(Self::Handshake(payload.to_vec())),
            packet_type::COMMAND => Ok(Self::Command(Command::from_code(decode_code(
                "command", payload,
            )?))),
            packet_type::RESPONSE => {
                let code = decode_code("response", payload)?;
                Response::from_code(code)
                    .map(Self::Response)
                    .ok_or_else(|| WireError::Violation(format!("unknown response code {code}")))
            }
            packet_type::DATA => Ok(Self::Data(payload.to_vec())),
            other => Err(WireError::Violation(format!(
                "unknown packet type {other}"
            ))),
        }
    }
}

/// Encode a fixed 4-byte coded packet (command or response).
fn encode_coded(type_code: u32, code: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    buf.extend_from_slice(&4u32.to_be_bytes());
    buf.extend_from_slice(&type_code.to_be_bytes());
    buf.extend_from_slice(&code.to_be_bytes());
    buf
}

/// Decode the single `u32 BE` code payload of a command or response.
fn decode_code(kind: &str, payload: &[u8]) -> Result<u32, WireError> {
    let bytes: [u8; 4] = payload.try_into().map_err(|_| {
        WireError::Violation(format!("{kind} payload is {} bytes, expected 4", payload.len()))
    })?;
    Ok(u32::from_be_bytes(bytes))
}

// ─── Tests ─────────────────────────────────────────────────────────────────
