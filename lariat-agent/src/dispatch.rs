//! The agent's request loop.
//!
//! One dispatcher reads frames off the transport and routes them; one
//! writer drains a bounded outbound queue so a slow controller applies
//! back-pressure instead of ballooning memory; each call gets its own
//! worker so an operation stuck in user code never stops resource
//! answers or file transfers from flowing.

use std::io;
use std::sync::{Arc, Mutex};

use lariat_proto::{
    DEPTH_LIMIT, Message, Op, PROTOCOL_VERSION, Payload, Value, WRITER_QUEUE, WireFormat, pdecode,
    set_ambient,
};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;

use crate::loader::Loader;
use crate::registry::{CallArgs, OpCtx, Registry};
use crate::transfer::{PutSink, PutTable, stream_fetch};

/// Who this agent is, learned from the `Start` handshake.
#[derive(Debug, Clone)]
struct Identity {
    host: String,
    path: Vec<String>,
    depth_limit: usize,
}

struct Session {
    out: mpsc::Sender<Message>,
    registry: Arc<Registry>,
    loader: Loader,
    puts: Mutex<PutTable>,
    identity: Mutex<Option<Identity>>,
}

impl Session {
    async fn send(&self, msg: Message) -> io::Result<()> {
        self.out
            .send(msg)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "outbound queue closed"))
    }

    async fn reply(&self, req_id: u32, outcome: Result<Value, String>) -> io::Result<()> {
        let msg = match outcome {
            Ok(ret) => Message::map(Op::Ret, req_id, [("ret", ret)]),
            Err(tb) => Message::map(Op::Exc, req_id, [("tb", Value::Str(tb))]),
        };
        self.send(msg).await
    }

    fn identity(&self) -> Option<Identity> {
        self.identity.lock().ok().and_then(|i| i.clone())
    }

    fn op_ctx(&self) -> Result<OpCtx, String> {
        let id = self
            .identity()
            .ok_or_else(|| "call received before the start handshake".to_owned())?;
        Ok(OpCtx::new(
            id.host,
            id.path,
            id.depth_limit,
            self.loader.clone(),
        ))
    }
}

/// Serves one controller over the given streams until it closes the
/// connection. EOF at a frame boundary is a clean shutdown.
pub async fn serve<R, W>(input: R, output: W, registry: Arc<Registry>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(WRITER_QUEUE);
    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(msg) = out_rx.recv().await {
            if lariat_proto::send(&mut output, &msg, WireFormat::Pencode)
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let session = Arc::new(Session {
        out: out_tx.clone(),
        registry,
        loader: Loader::new(out_tx),
        puts: Mutex::new(PutTable::new()),
        identity: Mutex::new(None),
    });

    let mut input = BufReader::new(input);
    let served = loop {
        let msg = match lariat_proto::recv(&mut input).await {
            Ok(msg) => msg,
            // Controller closed its end: exit quietly.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break Ok(()),
            Err(e) => break Err(e),
        };
        if let Err(e) = handle(&session, msg).await {
            break Err(e);
        }
    };

    // Dropping our sender lets the writer drain whatever in-flight
    // workers still produce, then exit.
    drop(session);
    let _ = writer.await;
    served
}

async fn handle(session: &Arc<Session>, msg: Message) -> io::Result<()> {
    match msg.op {
        Op::Start => handle_start(session, &msg).await,
        Op::Call => {
            handle_call(session, msg);
            Ok(())
        }
        Op::Imp => {
            session.loader.fulfill(&msg.payload);
            Ok(())
        }
        Op::FetchBegin => {
            let Some(path) = msg.payload.get("path").and_then(Value::as_str) else {
                return session
                    .reply(msg.req_id, Err("fetch request names no path".to_owned()))
                    .await;
            };
            let session = Arc::clone(session);
            let path = path.to_owned();
            tokio::spawn(async move {
                let outcome = stream_fetch(&session.out, msg.req_id, &path).await;
                let _ = session.reply(msg.req_id, outcome).await;
            });
            Ok(())
        }
        Op::PutBegin => {
            let path = msg
                .payload
                .get("path")
                .and_then(Value::as_str)
                .map(str::to_owned);
            let mode = msg
                .payload
                .get("mode")
                .and_then(Value::as_int)
                .and_then(|m| u32::try_from(m).ok())
                .unwrap_or(0o644);
            let sink = PutSink::begin(path, mode).await;
            if let Ok(mut puts) = session.puts.lock() {
                puts.insert(msg.req_id, sink);
            }
            Ok(())
        }
        Op::PutData => {
            let chunk = match msg.payload {
                Payload::Raw(bytes) => bytes,
                Payload::Map(_) => Vec::new(),
            };
            let sink = session
                .puts
                .lock()
                .ok()
                .and_then(|mut puts| puts.remove(&msg.req_id));
            if let Some(mut sink) = sink {
                sink.data(&chunk).await;
                if let Ok(mut puts) = session.puts.lock() {
                    puts.insert(msg.req_id, sink);
                }
            }
            Ok(())
        }
        Op::PutEnd => {
            let claimed = msg
                .payload
                .get("sha1sum")
                .and_then(Value::as_str)
                .map(str::to_owned);
            let sink = session
                .puts
                .lock()
                .ok()
                .and_then(|mut puts| puts.remove(&msg.req_id));
            let outcome = match sink {
                Some(sink) => sink.finish(claimed.as_deref()).await,
                None => Err("upload end without an active upload".to_owned()),
            };
            session.reply(msg.req_id, outcome).await
        }
        Op::Ret | Op::Exc | Op::FetchData | Op::FetchEnd => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected opcode {:?} from controller", msg.op),
        )),
    }
}

async fn handle_start(session: &Arc<Session>, msg: &Message) -> io::Result<()> {
    let host = msg
        .payload
        .get("host")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_owned();
    let path: Vec<String> = match msg.payload.get("path") {
        Some(Value::List(items) | Value::Tuple(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        _ => vec![host.clone()],
    };
    let depth_limit = msg
        .payload
        .get("depthlimit")
        .and_then(Value::as_int)
        .and_then(|d| usize::try_from(d).ok())
        .unwrap_or(DEPTH_LIMIT);

    // Nested controllers in this process pick the chain up from here.
    set_ambient(path.clone(), depth_limit);
    if let Ok(mut identity) = session.identity.lock() {
        *identity = Some(Identity {
            host,
            path,
            depth_limit,
        });
    }
    session
        .send(Message::map(Op::Ret, 0, [("ret", PROTOCOL_VERSION)]))
        .await
}

/// Decodes a call and spawns its worker. Every call runs concurrently;
/// replies carry the call's request id, so completion order is free.
fn handle_call(session: &Arc<Session>, msg: Message) {
    let session = Arc::clone(session);
    tokio::spawn(async move {
        let outcome = match decode_call(&msg.payload) {
            Ok((name, args)) => match session.op_ctx() {
                Ok(ctx) => session.registry.run(ctx, &name, args).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        let _ = session.reply(msg.req_id, outcome).await;
    });
}

/// A call payload is the pencoding of `(name, args, kwargs)`.
fn decode_call(payload: &Payload) -> Result<(String, CallArgs), String> {
    let bytes = payload
        .as_raw()
        .ok_or_else(|| "call payload must be raw bytes".to_owned())?;
    let value = pdecode(bytes).map_err(|e| format!("undecodable call payload: {e}"))?;
    let Value::Tuple(mut parts) = value else {
        return Err("call payload must be a (name, args, kwargs) tuple".to_owned());
    };
    if parts.len() != 3 {
        return Err("call payload must have exactly three elements".to_owned());
    }
    let kwargs_value = parts.pop().unwrap_or(Value::Null);
    let args_value = parts.pop().unwrap_or(Value::Null);
    let name_value = parts.pop().unwrap_or(Value::Null);

    let name = name_value
        .as_str()
        .ok_or_else(|| "operation name must be a string".to_owned())?
        .to_owned();
    let args = match args_value {
        Value::List(items) | Value::Tuple(items) => items,
        Value::Null => Vec::new(),
        _ => return Err("positional arguments must be a sequence".to_owned()),
    };
    let kwargs = match kwargs_value {
        Value::Map(entries) => entries
            .into_iter()
            .filter_map(|(k, v)| match k {
                Value::Str(k) => Some((k, v)),
                _ => None,
            })
            .collect(),
        Value::Null => Vec::new(),
        _ => return Err("keyword arguments must be a map".to_owned()),
    };
    Ok((name, CallArgs::new(args, kwargs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lariat_proto::pencode;

    fn call_payload(name: &str, args: Vec<Value>) -> Payload {
        Payload::Raw(pencode(&Value::Tuple(vec![
            Value::Str(name.to_owned()),
            Value::List(args),
            Value::Map(vec![]),
        ])))
    }

    #[test]
    fn decode_call_accepts_the_wire_shape() {
        let (name, args) = decode_call(&call_payload("echo", vec![Value::Int(1)])).unwrap();
        assert_eq!(name, "echo");
        assert_eq!(args.args, vec![Value::Int(1)]);
        assert!(args.kwargs.is_empty());
    }

    #[test]
    fn decode_call_rejects_other_shapes() {
        assert!(decode_call(&Payload::Map(Value::Null)).is_err());
        assert!(decode_call(&Payload::Raw(pencode(&Value::Int(3)))).is_err());
        let short = Payload::Raw(pencode(&Value::Tuple(vec![Value::Str("x".into())])));
        assert!(decode_call(&short).is_err());
    }
}
