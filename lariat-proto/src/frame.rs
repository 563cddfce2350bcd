//! Length-framed messages over any [`AsyncRead`]/[`AsyncWrite`] stream.
//!
//! Each frame is a 10-byte header followed by the payload:
//!
//! ```text
//! [u32 payload size][u32 req_id][i8 op][i8 fmt][payload...]
//! ```
//!
//! All integers are big-endian. `fmt` selects the payload encoding:
//! `0` = JSON (legacy, accepted on receive), `1` = raw bytes, `2` =
//! pencode. Header and body are assembled into one buffer so each frame
//! is a single write; the reader tolerates arbitrary chunking.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{Message, Op, Payload};
use crate::pencode::{pdecode, pencode};
use crate::value::Value;

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 10;

/// Maximum allowed frame payload (16 MiB).
pub const MAX_FRAME: u32 = 16 * 1024 * 1024;

const FMT_JSON: u8 = 0;
const FMT_BYTES: u8 = 1;
const FMT_PENCODE: u8 = 2;

/// Payload encoding for structured (map) payloads, chosen from the
/// negotiated serialization version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum WireFormat {
    /// Version 1 peers: JSON maps. Byte strings are not representable.
    Json,
    /// Version 2 peers: pencode maps.
    Pencode,
}

impl WireFormat {
    /// The format to use for the given negotiated version.
    pub const fn for_version(version: u32) -> Self {
        if version >= 2 { Self::Pencode } else { Self::Json }
    }
}

/// Sends one message as a single contiguous write.
pub async fn send(
    w: &mut (impl AsyncWrite + Unpin),
    msg: &Message,
    fmt: WireFormat,
) -> io::Result<()> {
    let (fmt_byte, payload) = match (&msg.payload, fmt) {
        (Payload::Raw(bytes), _) => (FMT_BYTES, bytes.clone()),
        (Payload::Map(value), WireFormat::Pencode) => (FMT_PENCODE, pencode(value)),
        (Payload::Map(value), WireFormat::Json) => {
            let json = value_to_json(value)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            (FMT_JSON, serde_json::to_vec(&json)?)
        }
    };
    let size = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame exceeds u32::MAX"))?;
    if size > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds 16 MiB limit",
        ));
    }
    // Pre-assemble the frame to minimize syscalls.
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&size.to_be_bytes());
    frame.extend_from_slice(&msg.req_id.to_be_bytes());
    frame.push(msg.op as u8);
    frame.push(fmt_byte);
    frame.extend_from_slice(&payload);
    w.write_all(&frame).await?;
    w.flush().await
}

/// Receives one message, blocking until a whole frame has arrived.
///
/// Returns `Err(UnexpectedEof)` on a clean close at a frame boundary as
/// well as mid-frame; callers distinguish the two by whether any request
/// is outstanding.
pub async fn recv(r: &mut (impl AsyncRead + Unpin)) -> io::Result<Message> {
    let mut hdr = [0u8; HEADER_LEN];
    r.read_exact(&mut hdr).await?;
    let size = u32::from_be_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
    let req_id = u32::from_be_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
    let op = Op::try_from(hdr[8])
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "unknown opcode"))?;
    let fmt_byte = hdr[9];
    if size > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds 16 MiB limit",
        ));
    }
    let mut payload = vec![0u8; size as usize];
    r.read_exact(&mut payload).await?;

    let payload = match fmt_byte {
        FMT_BYTES => Payload::Raw(payload),
        FMT_PENCODE => Payload::Map(
            pdecode(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
        ),
        FMT_JSON => {
            let json: serde_json::Value = serde_json::from_slice(&payload)?;
            Payload::Map(json_to_value(json))
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown payload format {other}"),
            ));
        }
    };
    Ok(Message { op, req_id, payload })
}

/// Converts a codec value to JSON for version-1 peers.
///
/// Byte strings and sets have no JSON form (they are the reason the
/// pencode format exists); encoding them here is an error.
fn value_to_json(v: &Value) -> Result<serde_json::Value, &'static str> {
    use serde_json::Value as Json;
    Ok(match v {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::from(*i),
        Value::Float(f) => {
            serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number)
        }
        Value::Str(s) => Json::String(s.clone()),
        Value::Bytes(_) => return Err("byte strings are not representable in JSON frames"),
        Value::List(items) | Value::Tuple(items) => Json::Array(
            items
                .iter()
                .map(value_to_json)
                .collect::<Result<_, _>>()?,
        ),
        Value::Set(_) | Value::FrozenSet(_) => {
            return Err("sets are not representable in JSON frames");
        }
        Value::Map(entries) => {
            let mut obj = serde_json::Map::with_capacity(entries.len());
            for (k, val) in entries {
                let Value::Str(key) = k else {
                    return Err("JSON frames require string map keys");
                };
                obj.insert(key.clone(), value_to_json(val)?);
            }
            Json::Object(obj)
        }
    })
}

fn json_to_value(json: serde_json::Value) -> Value {
    use serde_json::Value as Json;
    match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(b),
        Json::Number(n) => n.as_i64().map_or_else(
            || Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            Value::Int,
        ),
        Json::String(s) => Value::Str(s),
        Json::Array(items) => Value::List(items.into_iter().map(json_to_value).collect()),
        Json::Object(obj) => Value::Map(
            obj.into_iter()
                .map(|(k, v)| (Value::Str(k), json_to_value(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn roundtrip_map_payload() {
        let (mut c, mut s) = tokio::io::duplex(4096);
        let msg = Message {
            op: Op::Ret,
            req_id: 3,
            payload: Payload::Map(Value::map([("ret", 42i64)])),
        };
        send(&mut c, &msg, WireFormat::Pencode).await.unwrap();
        let got = recv(&mut s).await.unwrap();
        assert_eq!(got.op, Op::Ret);
        assert_eq!(got.req_id, 3);
        assert_eq!(got.payload.get("ret"), Some(&Value::Int(42)));
    }

    #[tokio::test]
    async fn roundtrip_raw_payload() {
        let (mut c, mut s) = tokio::io::duplex(4096);
        let msg = Message {
            op: Op::PutData,
            req_id: 9,
            payload: Payload::Raw(vec![0, 1, 254, 255]),
        };
        send(&mut c, &msg, WireFormat::Pencode).await.unwrap();
        let got = recv(&mut s).await.unwrap();
        assert!(matches!(got.payload, Payload::Raw(ref b) if b == &[0, 1, 254, 255]));
    }

    #[tokio::test]
    async fn empty_payload_is_valid() {
        let (mut c, mut s) = tokio::io::duplex(64);
        let msg = Message {
            op: Op::FetchData,
            req_id: 1,
            payload: Payload::Raw(Vec::new()),
        };
        send(&mut c, &msg, WireFormat::Pencode).await.unwrap();
        let got = recv(&mut s).await.unwrap();
        assert!(matches!(got.payload, Payload::Raw(ref b) if b.is_empty()));
    }

    #[tokio::test]
    async fn reader_accepts_arbitrary_chunking() {
        let mut wire = Vec::new();
        for req_id in 1..=3u32 {
            let msg = Message {
                op: Op::Ret,
                req_id,
                payload: Payload::Map(Value::map([("ret", req_id)])),
            };
            send(&mut wire, &msg, WireFormat::Pencode).await.unwrap();
        }

        // Dribble the stream one byte at a time.
        let (mut c, mut s) = tokio::io::duplex(1);
        let writer = tokio::spawn(async move {
            for b in wire {
                c.write_all(&[b]).await.unwrap();
            }
        });
        for req_id in 1..=3u32 {
            let got = recv(&mut s).await.unwrap();
            assert_eq!(got.req_id, req_id);
            assert_eq!(
                got.payload.get("ret"),
                Some(&Value::Int(i64::from(req_id)))
            );
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn legacy_json_frames_decode() {
        let body = br#"{"ret": 7, "ok": true}"#;
        let mut wire = Vec::new();
        wire.extend_from_slice(&u32::try_from(body.len()).unwrap().to_be_bytes());
        wire.extend_from_slice(&5u32.to_be_bytes());
        wire.push(Op::Ret as u8);
        wire.push(FMT_JSON);
        wire.extend_from_slice(body);

        let mut cursor = std::io::Cursor::new(wire);
        let got = recv(&mut cursor).await.unwrap();
        assert_eq!(got.payload.get("ret"), Some(&Value::Int(7)));
        assert_eq!(got.payload.get("ok"), Some(&Value::Bool(true)));
    }

    #[tokio::test]
    async fn bytes_in_json_mode_error() {
        let (mut c, _s) = tokio::io::duplex(64);
        let msg = Message {
            op: Op::Ret,
            req_id: 1,
            payload: Payload::Map(Value::map([("ret", vec![1u8, 2])])),
        };
        assert!(send(&mut c, &msg, WireFormat::Json).await.is_err());
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(32u32 * 1024 * 1024).to_be_bytes());
        wire.extend_from_slice(&1u32.to_be_bytes());
        wire.push(Op::Ret as u8);
        wire.push(FMT_PENCODE);
        let mut cursor = std::io::Cursor::new(wire);
        assert!(recv(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let mut wire = Vec::new();
        let msg = Message {
            op: Op::Ret,
            req_id: 1,
            payload: Payload::Map(Value::map([("ret", 1i64)])),
        };
        send(&mut wire, &msg, WireFormat::Pencode).await.unwrap();
        wire.truncate(wire.len() - 2);
        let mut cursor = std::io::Cursor::new(wire);
        assert!(recv(&mut cursor).await.is_err());
    }
}
