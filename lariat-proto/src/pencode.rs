//! Self-describing binary encoding with back-references.
//!
//! Used in preference to JSON because it distinguishes byte strings from
//! text and can deduplicate shared containers. The grammar is a one-byte
//! tag, an optional big-endian `u32` length, then the body:
//!
//! ```text
//! n        null            1 t|f    bool
//! i <len>  ascii int       f <len>  ascii float
//! b <len>  bytes           s <len>  utf-8 text
//! l <len>  list            t <len>  tuple
//! q <len>  set             Q <len>  frozen set
//! d <len>  map (k v pairs) R <id>   back-reference
//! k <len>  legacy text key (accepted, never emitted)
//! ```
//!
//! Every container is assigned a back-reference id in the order it is
//! emitted, starting at 0. When the encoder meets a container equal to
//! one it has already emitted, it writes `R <id>` instead. The decoder
//! assigns ids in the same order, reserving each container's slot before
//! descending into its children.

use crate::value::Value;

/// Failure while decoding a pencoded buffer.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// The buffer ended before the value did.
    #[error("unexpected end of pencoded data")]
    Eof,

    /// A tag byte outside the grammar.
    #[error("unknown pack opcode {0:#04x}")]
    UnknownTag(u8),

    /// A text string or legacy key that was not valid UTF-8.
    #[error("invalid UTF-8 in string")]
    Utf8,

    /// An integer body that did not parse, or overflowed `i64`.
    #[error("unparseable integer {0:?}")]
    Int(String),

    /// A float body that did not parse.
    #[error("unparseable float {0:?}")]
    Float(String),

    /// A back-reference to an id that was never assigned.
    #[error("back-reference to unknown id {0}")]
    BadBackref(u32),

    /// A back-reference into a container still being decoded. An owned
    /// value tree cannot represent the resulting cycle.
    #[error("back-reference {0} forms a cycle")]
    Cycle(u32),
}

/// Encodes a value, returning the byte string.
pub fn pencode(value: &Value) -> Vec<u8> {
    let mut enc = Encoder {
        out: Vec::new(),
        seen: Vec::new(),
    };
    enc.emit(value);
    enc.out
}

/// Decodes a pencoded byte string back into a value.
pub fn pdecode(buf: &[u8]) -> Result<Value, DecodeError> {
    let mut dec = Decoder {
        buf,
        pos: 0,
        slots: Vec::new(),
    };
    dec.next()
}

const fn is_container(v: &Value) -> bool {
    matches!(
        v,
        Value::List(_) | Value::Tuple(_) | Value::Set(_) | Value::FrozenSet(_) | Value::Map(_)
    )
}

struct Encoder<'a> {
    out: Vec<u8>,
    /// Containers already emitted, indexed by back-reference id.
    seen: Vec<&'a Value>,
}

impl<'a> Encoder<'a> {
    fn emit(&mut self, v: &'a Value) {
        if is_container(v) {
            if let Some(id) = self.seen.iter().position(|prev| *prev == v) {
                self.out.push(b'R');
                self.put_len(id);
                return;
            }
            self.seen.push(v);
        }
        match v {
            Value::Null => self.out.push(b'n'),
            Value::Bool(b) => {
                self.out.push(b'1');
                self.out.push(if *b { b't' } else { b'f' });
            }
            Value::Int(i) => self.put_ascii(b'i', &i.to_string()),
            Value::Float(f) => self.put_ascii(b'f', &format_float(*f)),
            Value::Bytes(b) => {
                self.out.push(b'b');
                self.put_len(b.len());
                self.out.extend_from_slice(b);
            }
            Value::Str(s) => {
                self.out.push(b's');
                self.put_len(s.len());
                self.out.extend_from_slice(s.as_bytes());
            }
            Value::List(items) => self.put_seq(b'l', items),
            Value::Tuple(items) => self.put_seq(b't', items),
            Value::Set(items) => self.put_seq(b'q', items),
            Value::FrozenSet(items) => self.put_seq(b'Q', items),
            Value::Map(entries) => {
                self.out.push(b'd');
                self.put_len(entries.len());
                for (k, val) in entries {
                    self.emit(k);
                    self.emit(val);
                }
            }
        }
    }

    fn put_seq(&mut self, tag: u8, items: &'a [Value]) {
        self.out.push(tag);
        self.put_len(items.len());
        for item in items {
            self.emit(item);
        }
    }

    fn put_ascii(&mut self, tag: u8, body: &str) {
        self.out.push(tag);
        self.put_len(body.len());
        self.out.extend_from_slice(body.as_bytes());
    }

    #[allow(clippy::cast_possible_truncation)]
    fn put_len(&mut self, len: usize) {
        self.out.extend_from_slice(&(len as u32).to_be_bytes());
    }
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_owned()
    } else if f == f64::INFINITY {
        "inf".to_owned()
    } else if f == f64::NEG_INFINITY {
        "-inf".to_owned()
    } else {
        format!("{f}")
    }
}

struct Decoder<'b> {
    buf: &'b [u8],
    pos: usize,
    /// One slot per container, in assignment order. `None` while the
    /// container's children are still being decoded.
    slots: Vec<Option<Value>>,
}

impl Decoder<'_> {
    fn next(&mut self) -> Result<Value, DecodeError> {
        let tag = self.take(1)?[0];
        match tag {
            b'n' => Ok(Value::Null),
            b'1' => Ok(Value::Bool(self.take(1)?[0] == b't')),
            b'i' => {
                let body = self.take_sized()?;
                let text = std::str::from_utf8(body).map_err(|_| DecodeError::Utf8)?;
                text.parse()
                    .map(Value::Int)
                    .map_err(|_| DecodeError::Int(text.to_owned()))
            }
            b'f' => {
                let body = self.take_sized()?;
                let text = std::str::from_utf8(body).map_err(|_| DecodeError::Utf8)?;
                text.parse()
                    .map(Value::Float)
                    .map_err(|_| DecodeError::Float(text.to_owned()))
            }
            b'b' => Ok(Value::Bytes(self.take_sized()?.to_vec())),
            b's' | b'k' => {
                let body = self.take_sized()?;
                let text = std::str::from_utf8(body).map_err(|_| DecodeError::Utf8)?;
                Ok(Value::Str(text.to_owned()))
            }
            b'l' => self.take_container(Value::List),
            b't' => self.take_container(Value::Tuple),
            b'q' => self.take_container(Value::Set),
            b'Q' => self.take_container(Value::FrozenSet),
            b'd' => {
                let slot = self.reserve();
                let len = self.take_len()?;
                let mut entries = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    let k = self.next()?;
                    let v = self.next()?;
                    entries.push((k, v));
                }
                Ok(self.fill(slot, Value::Map(entries)))
            }
            b'R' => {
                let id = self.take_len()?;
                match self.slots.get(id) {
                    Some(Some(v)) => Ok(v.clone()),
                    #[allow(clippy::cast_possible_truncation)]
                    Some(None) => Err(DecodeError::Cycle(id as u32)),
                    #[allow(clippy::cast_possible_truncation)]
                    None => Err(DecodeError::BadBackref(id as u32)),
                }
            }
            other => Err(DecodeError::UnknownTag(other)),
        }
    }

    fn take_container(
        &mut self,
        build: fn(Vec<Value>) -> Value,
    ) -> Result<Value, DecodeError> {
        let slot = self.reserve();
        let len = self.take_len()?;
        let mut items = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            items.push(self.next()?);
        }
        Ok(self.fill(slot, build(items)))
    }

    fn reserve(&mut self) -> usize {
        self.slots.push(None);
        self.slots.len() - 1
    }

    fn fill(&mut self, slot: usize, v: Value) -> Value {
        self.slots[slot] = Some(v.clone());
        v
    }

    fn take(&mut self, n: usize) -> Result<&[u8], DecodeError> {
        if self.buf.len() - self.pos < n {
            return Err(DecodeError::Eof);
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.buf[start..self.pos])
    }

    fn take_len(&mut self) -> Result<usize, DecodeError> {
        let raw = self.take(4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(raw);
        Ok(u32::from_be_bytes(bytes) as usize)
    }

    fn take_sized(&mut self) -> Result<&[u8], DecodeError> {
        let len = self.take_len()?;
        self.take(len)
    }
}
