//! A duplex session to one agent.
//!
//! `connect` spawns the transport child, performs the `Start` handshake
//! and starts two background tasks: a reader that demultiplexes inbound
//! frames by request id, and a forwarder that copies the child's stderr
//! to ours with the host name prefixed. Writes go straight to the
//! child's stdin under a lock, one contiguous frame at a time.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use lariat_proto::{
    CHUNK_SIZE, DEPTH_LIMIT, ErrorResult, Message, Op, PROTOCOL_VERSION, Value, WireFormat,
    ambient, pencode,
};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::launch::Launch;
use crate::resources::Exporter;

/// How long `connect` waits for the agent's handshake reply.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period after closing the write pipe before escalating.
const CLOSE_WAIT: Duration = Duration::from_secs(1);

/// Grace period after `SIGTERM` before `SIGKILL`.
const TERM_WAIT: Duration = Duration::from_secs(5);

/// Result of one remote operation: the unwrapped value, or the failure
/// representation exchanged on the wire.
pub type OpOutcome = std::result::Result<Value, ErrorResult>;

/// Tunnel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum State {
    /// Created, never connected.
    New,
    /// Handshake in flight.
    Connecting,
    /// Ready for operations.
    Connected,
    /// Tearing down.
    Closing,
    /// Torn down; may be connected again.
    Closed,
}

/// Outcome of a successful [`Tunnel::fetch`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct FetchResult {
    /// Where the file was written locally.
    pub local_path: PathBuf,
    /// The path that was read on the remote host.
    pub remote_path: String,
    /// Hex SHA-1 of the transferred bytes.
    pub sha1sum: String,
    /// Number of bytes transferred.
    pub size: u64,
}

/// Outcome of a successful [`Tunnel::put`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct PutResult {
    /// Where the file landed on the remote host.
    pub remote_path: String,
    /// Hex SHA-1 of the transferred bytes.
    pub sha1sum: String,
    /// Number of bytes transferred.
    pub size: u64,
}

impl FetchResult {
    /// The result as the codec map exchanged by group and queue layers.
    pub fn to_value(&self) -> Value {
        Value::map([
            ("local_path", Value::Str(self.local_path.display().to_string())),
            ("remote_path", Value::Str(self.remote_path.clone())),
            ("sha1sum", Value::Str(self.sha1sum.clone())),
            ("size", Value::Int(i64::try_from(self.size).unwrap_or(i64::MAX))),
        ])
    }
}

impl PutResult {
    /// The result as the codec map exchanged by group and queue layers.
    pub fn to_value(&self) -> Value {
        Value::map([
            ("remote_path", Value::Str(self.remote_path.clone())),
            ("sha1sum", Value::Str(self.sha1sum.clone())),
            ("size", Value::Int(i64::try_from(self.size).unwrap_or(i64::MAX))),
        ])
    }
}

/// A duplex session to the agent on one host.
///
/// Two tunnels are the same set element when their `host` strings are
/// equal, whatever their transports.
pub struct Tunnel {
    host: String,
    launch: Launch,
    depth_limit: usize,
    exporter: Arc<Exporter>,
    state: StdMutex<State>,
    conn: Mutex<Option<Arc<Connection>>>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("host", &self.host)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Tunnel {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host
    }
}

impl Eq for Tunnel {}

impl std::hash::Hash for Tunnel {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.host.hash(state);
    }
}

impl Tunnel {
    /// A tunnel with an explicit transport.
    pub fn new(host: impl Into<String>, launch: Launch) -> Self {
        Self {
            host: host.into(),
            launch,
            depth_limit: ambient().map_or(DEPTH_LIMIT, |a| a.depth_limit),
            exporter: Arc::new(Exporter::new()),
            state: StdMutex::new(State::New),
            conn: Mutex::new(None),
        }
    }

    /// A tunnel to an agent spawned directly on this machine.
    pub fn local() -> Self {
        Self::new("localhost", Launch::local())
    }

    /// A tunnel over ssh.
    pub fn ssh(host: impl Into<String>) -> Self {
        let host = host.into();
        let launch = Launch::ssh(&host, None);
        Self::new(host, launch)
    }

    /// Overrides the nested-tunnel depth limit.
    #[must_use]
    pub fn depth_limit(mut self, limit: usize) -> Self {
        self.depth_limit = limit;
        self
    }

    /// Replaces the resource exporter serving this tunnel's requests.
    #[must_use]
    pub fn exporter(mut self, exporter: Arc<Exporter>) -> Self {
        self.exporter = exporter;
        self
    }

    /// The host identity of this tunnel.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Access to the resource exporter, for registering roots and entries.
    pub fn resources(&self) -> &Exporter {
        &self.exporter
    }

    /// The current lifecycle state.
    pub fn state(&self) -> State {
        self.state.lock().map_or(State::Closed, |s| *s)
    }

    /// Whether the tunnel is connected.
    pub fn is_connected(&self) -> bool {
        self.state() == State::Connected
    }

    fn set_state(&self, next: State) {
        if let Ok(mut s) = self.state.lock() {
            *s = next;
        }
    }

    /// Connects if not already connected: spawns the child, starts the
    /// reader and stderr-forwarder tasks, and completes the `Start`
    /// handshake. Idempotent.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        self.set_state(State::Connecting);
        match self.connect_inner().await {
            Ok(conn) => {
                *guard = Some(conn);
                self.set_state(State::Connected);
                Ok(())
            }
            Err(e) => {
                self.set_state(State::Closed);
                Err(e)
            }
        }
    }

    async fn connect_inner(&self) -> Result<Arc<Connection>> {
        // Depth check before anything is spawned: the accumulated path
        // must still have room for this hop.
        let base = base_path();
        if base.len() >= self.depth_limit {
            let chain = base
                .iter()
                .map(String::as_str)
                .chain([self.host.as_str()])
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(Error::DepthLimit(format!(
                "Depth limit of {} exceeded at {chain}",
                self.depth_limit
            )));
        }
        let mut path = base;
        path.push(self.host.clone());

        let mut cmd = self.launch.command();
        cmd.kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|e| Error::Connect {
            host: self.host.clone(),
            msg: e.to_string(),
        })?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            return Err(Error::Connect {
                host: self.host.clone(),
                msg: "child process streams were not piped".to_owned(),
            });
        };

        let conn = Arc::new(Connection {
            host: self.host.clone(),
            writer: Mutex::new(Some(stdin)),
            pending: StdMutex::new(HashMap::new()),
            next_req: AtomicU32::new(1),
            version: AtomicU32::new(PROTOCOL_VERSION),
            child: Mutex::new(child),
            tasks: StdMutex::new(Vec::new()),
        });

        conn.add_task(tokio::spawn(forward_stderr(self.host.clone(), stderr)));
        conn.add_task(tokio::spawn(read_loop(
            Arc::clone(&conn),
            stdout,
            Arc::clone(&self.exporter),
        )));

        // Handshake on the reserved request id 0.
        let rx = conn.register_reply(0);
        let start = Message::map(
            Op::Start,
            0,
            [
                ("host", Value::Str(self.host.clone())),
                (
                    "path",
                    Value::List(path.into_iter().map(Value::Str).collect()),
                ),
                ("depthlimit", Value::from(self.depth_limit)),
            ],
        );
        let handshake = async {
            conn.send(&start).await.map_err(|e| Error::Connect {
                host: self.host.clone(),
                msg: e.to_string(),
            })?;
            match rx.await {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(Error::Connect {
                    host: self.host.clone(),
                    msg: e.msg,
                }),
                Err(_) => Err(Error::Connect {
                    host: self.host.clone(),
                    msg: "agent closed the stream during handshake".to_owned(),
                }),
            }
        };
        let agent_version = match tokio::time::timeout(CONNECT_TIMEOUT, handshake).await {
            Ok(Ok(v)) => v.as_int().unwrap_or(1),
            Ok(Err(e)) => {
                conn.teardown(self.launch.can_signal()).await;
                return Err(e);
            }
            Err(_) => {
                conn.teardown(self.launch.can_signal()).await;
                return Err(Error::Connect {
                    host: self.host.clone(),
                    msg: "handshake timed out".to_owned(),
                });
            }
        };

        let negotiated = u32::try_from(agent_version)
            .unwrap_or(1)
            .min(PROTOCOL_VERSION);
        conn.version.store(negotiated, Ordering::SeqCst);
        debug!(host = %self.host, version = negotiated, "tunnel connected");
        Ok(conn)
    }

    async fn connection(&self) -> Result<Arc<Connection>> {
        self.conn
            .lock()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| Error::NotConnected {
                host: self.host.clone(),
            })
    }

    /// Runs a named operation on the remote host and returns its value.
    pub async fn call(&self, op: &str, args: Vec<Value>) -> Result<Value> {
        self.call_with(op, args, Vec::new()).await
    }

    /// Like [`call`](Self::call), with keyword arguments.
    pub async fn call_with(
        &self,
        op: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value> {
        let conn = self.connection().await?;
        let req_id = conn.next_id();
        let rx = conn.register_reply(req_id);
        let spec = Value::Tuple(vec![
            Value::Str(op.to_owned()),
            Value::List(args),
            Value::Map(
                kwargs
                    .into_iter()
                    .map(|(k, v)| (Value::Str(k), v))
                    .collect(),
            ),
        ]);
        conn.send(&Message::raw(Op::Call, req_id, pencode(&spec)))
            .await
            .map_err(|e| self.transport(&conn, e))?;
        match rx.await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(Error::Remote {
                host: self.host.clone(),
                tb: e.msg,
            }),
            Err(_) => Err(Error::Transport {
                host: self.host.clone(),
                msg: "connection closed before the reply arrived".to_owned(),
            }),
        }
    }

    /// Downloads a remote file. With no `local_path`, the file lands in
    /// a fresh temp file whose path is reported in the result. The
    /// transfer is discarded entirely on a checksum mismatch.
    pub async fn fetch(
        &self,
        remote_path: &str,
        local_path: Option<PathBuf>,
    ) -> Result<FetchResult> {
        let conn = self.connection().await?;
        let req_id = conn.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        conn.insert_pending(req_id, Pending::Fetch(tx));
        conn.send(&Message::map(
            Op::FetchBegin,
            req_id,
            [("path", remote_path)],
        ))
        .await
        .map_err(|e| self.transport(&conn, e))?;

        let dest = match local_path {
            Some(p) => p,
            None => {
                let (_, p) =
                    tempfile::NamedTempFile::new().and_then(|t| t.keep().map_err(|e| e.error))?;
                p
            }
        };
        let outcome = self.fetch_into(&dest, remote_path, rx).await;
        if outcome.is_err() {
            let _ = tokio::fs::remove_file(&dest).await;
        }
        outcome
    }

    async fn fetch_into(
        &self,
        dest: &Path,
        remote_path: &str,
        mut rx: mpsc::UnboundedReceiver<FetchEvent>,
    ) -> Result<FetchResult> {
        let mut file = tokio::fs::File::create(dest).await?;
        let mut hasher = Sha1::new();
        let mut size = 0u64;
        loop {
            match rx.recv().await {
                Some(FetchEvent::Chunk(data)) => {
                    hasher.update(&data);
                    size += data.len() as u64;
                    file.write_all(&data).await?;
                }
                Some(FetchEvent::Done(Ok(ret))) => {
                    file.flush().await?;
                    let local_sha = hex_digest(&hasher.finalize());
                    let remote_sha = ret.get("sha1sum").and_then(Value::as_str);
                    if remote_sha != Some(local_sha.as_str()) {
                        return Err(Error::Checksum {
                            host: self.host.clone(),
                            path: remote_path.to_owned(),
                        });
                    }
                    return Ok(FetchResult {
                        local_path: dest.to_path_buf(),
                        remote_path: ret
                            .get("remote_path")
                            .and_then(Value::as_str)
                            .unwrap_or(remote_path)
                            .to_owned(),
                        sha1sum: local_sha,
                        size,
                    });
                }
                Some(FetchEvent::Done(Err(e))) => {
                    return Err(Error::Remote {
                        host: self.host.clone(),
                        tb: e.msg,
                    });
                }
                None => {
                    return Err(Error::Transport {
                        host: self.host.clone(),
                        msg: "connection closed mid-fetch".to_owned(),
                    });
                }
            }
        }
    }

    /// Uploads a local file to the remote host with mode `0o644`.
    pub async fn put(
        &self,
        local_path: impl AsRef<Path>,
        remote_path: Option<String>,
    ) -> Result<PutResult> {
        self.put_with_mode(local_path, remote_path, 0o644).await
    }

    /// Uploads a local file, streamed in 10 KiB chunks. The agent writes
    /// to a sibling temp path and renames into place only after the
    /// checksum matches; with no `remote_path` it creates a private temp
    /// file and reports where it landed.
    pub async fn put_with_mode(
        &self,
        local_path: impl AsRef<Path>,
        remote_path: Option<String>,
        mode: u32,
    ) -> Result<PutResult> {
        let conn = self.connection().await?;
        // Open before PUT_BEGIN so a missing local file costs nothing remote.
        let mut file = tokio::fs::File::open(local_path.as_ref()).await?;

        let req_id = conn.next_id();
        let rx = conn.register_reply(req_id);
        conn.send(&Message::map(
            Op::PutBegin,
            req_id,
            [
                ("path", Value::from(remote_path)),
                ("mode", Value::from(mode)),
            ],
        ))
        .await
        .map_err(|e| self.transport(&conn, e))?;

        let mut hasher = Sha1::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
            conn.send(&Message::raw(Op::PutData, req_id, buf[..n].to_vec()))
                .await
                .map_err(|e| self.transport(&conn, e))?;
        }
        let sha1sum = hex_digest(&hasher.finalize());
        conn.send(&Message::map(Op::PutEnd, req_id, [("sha1sum", sha1sum)]))
            .await
            .map_err(|e| self.transport(&conn, e))?;

        match rx.await {
            Ok(Ok(ret)) => Ok(PutResult {
                remote_path: ret
                    .get("remote_path")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                sha1sum: ret
                    .get("sha1sum")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                size: ret
                    .get("size")
                    .and_then(Value::as_int)
                    .and_then(|n| u64::try_from(n).ok())
                    .unwrap_or(size),
            }),
            Ok(Err(e)) => Err(Error::Remote {
                host: self.host.clone(),
                tb: e.msg,
            }),
            Err(_) => Err(Error::Transport {
                host: self.host.clone(),
                msg: "connection closed before the reply arrived".to_owned(),
            }),
        }
    }

    /// Closes the tunnel: EOF on the write pipe, then an escalating
    /// shutdown — 1 s of grace, `SIGTERM`, 5 s more, `SIGKILL`. A
    /// transport that cannot signal its child (sudo) only waits.
    /// Outstanding operations fail with an error result.
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let Some(conn) = guard.take() else {
            self.set_state(State::Closed);
            return Ok(());
        };
        self.set_state(State::Closing);
        conn.teardown(self.launch.can_signal()).await;
        self.set_state(State::Closed);
        Ok(())
    }

    fn transport(&self, conn: &Connection, e: io::Error) -> Error {
        conn.fail_all(&format!("{}: {e}", self.host));
        Error::Transport {
            host: self.host.clone(),
            msg: e.to_string(),
        }
    }
}

/// Host names from the root controller to this process. Inside an agent
/// this is the path received at `Start`; in a root controller it is just
/// the local host name.
fn base_path() -> Vec<String> {
    ambient().map_or_else(|| vec![local_hostname()], |a| a.path.clone())
}

fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_owned())
}

fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut out, b| {
        use std::fmt::Write as _;
        let _ = write!(out, "{b:02x}");
        out
    })
}

enum Pending {
    Reply(oneshot::Sender<OpOutcome>),
    Fetch(mpsc::UnboundedSender<FetchEvent>),
}

enum FetchEvent {
    Chunk(Vec<u8>),
    Done(OpOutcome),
}

struct Connection {
    host: String,
    writer: Mutex<Option<ChildStdin>>,
    pending: StdMutex<HashMap<u32, Pending>>,
    next_req: AtomicU32,
    version: AtomicU32,
    child: Mutex<Child>,
    tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Connection {
    fn fmt(&self) -> WireFormat {
        WireFormat::for_version(self.version.load(Ordering::SeqCst))
    }

    fn next_id(&self) -> u32 {
        self.next_req.fetch_add(1, Ordering::SeqCst)
    }

    fn add_task(&self, task: tokio::task::JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
    }

    fn register_reply(&self, req_id: u32) -> oneshot::Receiver<OpOutcome> {
        let (tx, rx) = oneshot::channel();
        self.insert_pending(req_id, Pending::Reply(tx));
        rx
    }

    fn insert_pending(&self, req_id: u32, entry: Pending) {
        if let Ok(mut pending) = self.pending.lock() {
            // Request ids are never reused, so this cannot displace a
            // live entry.
            pending.insert(req_id, entry);
        }
    }

    fn take_pending(&self, req_id: u32) -> Option<Pending> {
        self.pending.lock().ok().and_then(|mut p| p.remove(&req_id))
    }

    async fn send(&self, msg: &Message) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(w) => lariat_proto::send(w, msg, self.fmt()).await,
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write pipe is closed",
            )),
        }
    }

    /// Fails every outstanding operation with the given message.
    fn fail_all(&self, msg: &str) {
        let drained: Vec<Pending> = self
            .pending
            .lock()
            .map(|mut p| p.drain().map(|(_, v)| v).collect())
            .unwrap_or_default();
        for entry in drained {
            let err = ErrorResult::new(msg);
            match entry {
                Pending::Reply(tx) => {
                    let _ = tx.send(Err(err));
                }
                Pending::Fetch(tx) => {
                    let _ = tx.send(FetchEvent::Done(Err(err)));
                }
            }
        }
    }

    /// Closes the write pipe and reaps the child, escalating from EOF
    /// through `SIGTERM` to `SIGKILL`.
    async fn teardown(&self, can_signal: bool) {
        self.writer.lock().await.take();

        let mut child = self.child.lock().await;
        let exited = tokio::time::timeout(CLOSE_WAIT, child.wait()).await.is_ok();
        if !exited {
            if can_signal {
                signal_child(&child, nix::sys::signal::Signal::SIGTERM);
                let termed = tokio::time::timeout(TERM_WAIT, child.wait()).await.is_ok();
                if !termed {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            } else {
                // The child runs as another user; EOF is the only lever.
                let _ = child.wait().await;
            }
        }
        drop(child);

        self.fail_all(&format!("{}: tunnel closed", self.host));
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .map(|mut t| t.drain(..).collect())
            .unwrap_or_default();
        for task in tasks {
            task.abort();
        }
    }
}

fn signal_child(child: &Child, signal: nix::sys::signal::Signal) {
    if let Some(pid) = child.id() {
        let pid = nix::unistd::Pid::from_raw(pid.cast_signed());
        if let Err(e) = nix::sys::signal::kill(pid, signal) {
            warn!(?signal, %pid, "failed to signal child: {e}");
        }
    }
}

/// Copies the child's stderr to ours a line at a time, prefixed with the
/// host name so interleaved output stays attributable.
#[allow(clippy::print_stderr)]
async fn forward_stderr(host: String, stderr: ChildStderr) {
    use tokio::io::AsyncBufReadExt;

    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        eprintln!("[{host}] {line}");
    }
}

/// Demultiplexes inbound frames until the stream errors or closes.
async fn read_loop(conn: Arc<Connection>, stdout: ChildStdout, exporter: Arc<Exporter>) {
    let mut reader = BufReader::new(stdout);
    loop {
        let msg = match lariat_proto::recv(&mut reader).await {
            Ok(msg) => msg,
            Err(e) => {
                conn.fail_all(&format!("{}: connection lost: {e}", conn.host));
                return;
            }
        };
        match msg.op {
            Op::Ret => {
                let ret = msg.payload.get("ret").cloned().unwrap_or(Value::Null);
                deliver(&conn, msg.req_id, Ok(ret));
            }
            Op::Exc => {
                let tb = msg
                    .payload
                    .get("tb")
                    .and_then(Value::as_str)
                    .unwrap_or("remote error with no traceback")
                    .to_owned();
                deliver(&conn, msg.req_id, Err(ErrorResult::new(tb)));
            }
            Op::FetchData => {
                // Looked up without popping: more chunks follow until
                // the terminating Ret.
                let chunk = msg.payload.as_raw().unwrap_or_default().to_vec();
                let pending = conn.pending.lock().ok();
                if let Some(p) = pending
                    && let Some(Pending::Fetch(tx)) = p.get(&msg.req_id)
                {
                    let _ = tx.send(FetchEvent::Chunk(chunk));
                } else {
                    warn!(host = %conn.host, req_id = msg.req_id, "fetch data for unknown request");
                }
            }
            Op::Imp => {
                // Unsolicited resource request; answered before the next
                // frame is read so responses stay ordered.
                if let Err(e) = answer_resource(&conn, &exporter, &msg).await {
                    conn.fail_all(&format!("{}: connection lost: {e}", conn.host));
                    return;
                }
            }
            other => {
                conn.fail_all(&format!("{}: unexpected opcode {other:?}", conn.host));
                return;
            }
        }
    }
}

fn deliver(conn: &Connection, req_id: u32, outcome: OpOutcome) {
    match conn.take_pending(req_id) {
        Some(Pending::Reply(tx)) => {
            let _ = tx.send(outcome);
        }
        Some(Pending::Fetch(tx)) => {
            let _ = tx.send(FetchEvent::Done(outcome));
        }
        None => warn!(host = %conn.host, req_id, "reply for unknown request"),
    }
}

async fn answer_resource(conn: &Connection, exporter: &Exporter, msg: &Message) -> io::Result<()> {
    let Some(requested) = msg.payload.get("imp").cloned() else {
        return Ok(());
    };
    // Plain keys arrive as strings; package-relative lookups as
    // (pkg, relpath) tuples joined into one key.
    let key = match &requested {
        Value::Str(s) => Some(s.clone()),
        Value::Tuple(parts) | Value::List(parts) => {
            let segs: Vec<&str> = parts.iter().filter_map(Value::as_str).collect();
            (segs.len() == parts.len()).then(|| segs.join("/"))
        }
        _ => None,
    };
    let reply = key.map_or_else(crate::resources::ResourceReply::missing, |k| {
        exporter.resolve(&k)
    });
    let response = Message::map(
        Op::Imp,
        0,
        [
            ("mod", requested),
            ("exists", Value::Bool(reply.exists)),
            ("is_pkg", Value::Bool(reply.is_pkg)),
            ("file", Value::from(reply.file)),
            ("source", Value::Bytes(reply.source)),
        ],
    );
    conn.send(&response).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunnels_compare_by_host() {
        let a = Tunnel::new("h1", Launch::local());
        let b = Tunnel::ssh("h1");
        let c = Tunnel::ssh("h2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn new_tunnel_state() {
        let t = Tunnel::local();
        assert_eq!(t.state(), State::New);
        assert!(!t.is_connected());
    }

    #[test]
    fn result_maps_carry_the_wire_fields() {
        let fetched = FetchResult {
            local_path: PathBuf::from("/tmp/x"),
            remote_path: "/etc/hosts".into(),
            sha1sum: "da39a3ee".into(),
            size: 6,
        };
        let v = fetched.to_value();
        assert_eq!(v.get("remote_path"), Some(&Value::Str("/etc/hosts".into())));
        assert_eq!(v.get("size"), Some(&Value::Int(6)));
    }

    #[test]
    fn hex_digest_formats() {
        assert_eq!(hex_digest(&[0x00, 0xff, 0x0a]), "00ff0a");
    }
}
