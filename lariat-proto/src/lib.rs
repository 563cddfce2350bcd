//! Wire protocol shared by the lariat controller and agent.
//!
//! Three layers, leaves first:
//!
//! 1. [`Value`] + [`pencode`]/[`pdecode`] — a self-describing binary
//!    encoding of primitive values, sequences, maps and sets, with
//!    back-references for shared containers.
//! 2. [`frame`] — a 10-byte `(size, req_id, op, fmt)` header followed by
//!    the payload, sent over any `AsyncRead`/`AsyncWrite` stream.
//! 3. [`Message`]/[`Op`] — the request/response vocabulary spoken between
//!    a controller and the agent at the far end of a tunnel.

mod frame;
mod message;
mod nesting;
mod pencode;
mod value;

pub use frame::{HEADER_LEN, MAX_FRAME, WireFormat, recv, send};
pub use message::{ErrorResult, Message, Op, Payload};
pub use nesting::{AmbientTunnel, ambient, set_ambient};
pub use pencode::{DecodeError, pdecode, pencode};
pub use value::Value;

/// Protocol version offered by this build. Version 1 framed structured
/// payloads as JSON; version 2 frames them with [`pencode`]. Peers settle
/// on the minimum of the versions they each offer.
pub const PROTOCOL_VERSION: u32 = 2;

/// Chunk size for streaming PUT/FETCH transfers (10 KiB).
pub const CHUNK_SIZE: usize = 10 * 1024;

/// Maximum nested-tunnel depth permitted from the root controller outward.
pub const DEPTH_LIMIT: usize = 2;

/// How long the agent waits for the controller to answer a resource
/// request before failing the requesting operation.
pub const RESOURCE_WAIT: std::time::Duration = std::time::Duration::from_secs(5);

/// Capacity of the agent's outbound frame queue.
pub const WRITER_QUEUE: usize = 10;
