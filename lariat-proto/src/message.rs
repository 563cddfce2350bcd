//! The request/response vocabulary spoken over a tunnel.
//!
//! Every frame is `(op, req_id, payload)`. Request ids are a 32-bit
//! monotone counter per tunnel; id 0 is reserved for the `Start`
//! handshake and for unsolicited resource requests from the agent.

use crate::value::Value;

/// Operation codes. The numeric values are the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(clippy::exhaustive_enums)]
pub enum Op {
    /// Controller → agent: run an operation. Payload is raw bytes holding
    /// the pencoding of the tuple `(name, args, kwargs)`.
    Call = 0,
    /// Agent → controller: successful completion, map `{ret}`.
    Ret = 1,
    /// Agent → controller: failed completion, map `{tb}` carrying the
    /// formatted error text verbatim.
    Exc = 2,
    /// Both directions: resource channel. Agent asks `{imp}`; controller
    /// answers `{mod, exists, is_pkg, file, source}`.
    Imp = 3,
    /// Controller → agent: start streaming a remote file, map `{path}`.
    FetchBegin = 4,
    /// Agent → controller: one raw chunk of the fetched file.
    FetchData = 5,
    /// Reserved. Never sent — fetch completion is signalled by `Ret`.
    FetchEnd = 6,
    /// Controller → agent: begin a file upload, map `{path, mode}`.
    PutBegin = 7,
    /// Controller → agent: one raw chunk of the uploaded file.
    PutData = 8,
    /// Controller → agent: upload complete, map `{sha1sum}`.
    PutEnd = 9,
    /// Controller → agent handshake, map `{host, path, depthlimit}`.
    /// The agent answers with `Ret` carrying its protocol version.
    Start = 10,
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(b: u8) -> Result<Self, u8> {
        Ok(match b {
            0 => Self::Call,
            1 => Self::Ret,
            2 => Self::Exc,
            3 => Self::Imp,
            4 => Self::FetchBegin,
            5 => Self::FetchData,
            6 => Self::FetchEnd,
            7 => Self::PutBegin,
            8 => Self::PutData,
            9 => Self::PutEnd,
            10 => Self::Start,
            other => return Err(other),
        })
    }
}

/// A frame payload: raw bytes or a structured value.
#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::exhaustive_enums)]
pub enum Payload {
    /// Uninterpreted bytes (call arguments, file chunks).
    Raw(Vec<u8>),
    /// A codec value, normally a map.
    Map(Value),
}

impl Payload {
    /// An empty raw payload.
    pub const fn empty() -> Self {
        Self::Raw(Vec::new())
    }

    /// Looks up a string key if this is a map payload.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Map(v) => v.get(key),
            Self::Raw(_) => None,
        }
    }

    /// The raw bytes, if this is a raw payload.
    pub fn as_raw(&self) -> Option<&[u8]> {
        match self {
            Self::Raw(b) => Some(b),
            Self::Map(_) => None,
        }
    }
}

/// One framed message.
#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::exhaustive_structs)]
pub struct Message {
    /// Operation code.
    pub op: Op,
    /// Request id this message belongs to.
    pub req_id: u32,
    /// Payload.
    pub payload: Payload,
}

impl Message {
    /// A message with a map payload built from string keys.
    pub fn map<I, V>(op: Op, req_id: u32, entries: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, V)>,
        V: Into<Value>,
    {
        Self {
            op,
            req_id,
            payload: Payload::Map(Value::map(entries)),
        }
    }

    /// A message carrying raw bytes.
    pub const fn raw(op: Op, req_id: u32, bytes: Vec<u8>) -> Self {
        Self {
            op,
            req_id,
            payload: Payload::Raw(bytes),
        }
    }
}

/// The sole failure representation exchanged between hosts.
///
/// Whatever went wrong remotely — a failed op, a refused transfer, a
/// connection that never came up — arrives as one of these; synchronous
/// façades convert it into an error that names the host.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::exhaustive_structs)]
pub struct ErrorResult {
    /// Human-readable description, including any remote traceback.
    pub msg: String,
}

impl ErrorResult {
    /// Creates an error result from any displayable message.
    pub fn new(msg: impl Into<String>) -> Self {
        Self { msg: msg.into() }
    }
}

impl std::fmt::Display for ErrorResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.msg)
    }
}

impl std::error::Error for ErrorResult {}
