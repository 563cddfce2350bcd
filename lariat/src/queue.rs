//! Per-tunnel FIFO scheduling of asynchronous operations.
//!
//! A queue feeds operations to every target host as fast as that host
//! can take them: each tunnel gets a FIFO drained strictly in order, one
//! operation at a time, while distinct tunnels proceed in parallel.
//! Every enqueued operation hands back an [`AsyncResult`] that fills in
//! when the operation completes.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use lariat_proto::Value;
use tokio::sync::Notify;

use crate::group::{Group, GroupResult};
use crate::tunnel::{OpOutcome, Tunnel};

/// Error returned when reading an [`AsyncResult`] that has no value yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::exhaustive_structs)]
pub struct NotCompleted;

impl std::fmt::Display for NotCompleted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("the operation has not completed")
    }
}

impl std::error::Error for NotCompleted {}

type Callback<T> = Box<dyn FnOnce(&T) + Send>;

enum CellState<T> {
    Pending(Option<Callback<T>>),
    Done(T),
}

/// The deferred result of a queued operation.
///
/// A single-assignment cell: the value is set exactly once, invoking the
/// attached continuation if there is one. Setting twice is a bug in the
/// caller and panics.
pub struct AsyncResult<T> {
    inner: Arc<AsyncInner<T>>,
}

struct AsyncInner<T> {
    state: StdMutex<CellState<T>>,
    notify: Notify,
}

impl<T> Clone for AsyncResult<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for AsyncResult<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.inner.state.lock() {
            Ok(guard) => match &*guard {
                CellState::Pending(_) => "pending",
                CellState::Done(_) => "done",
            },
            Err(_) => "poisoned",
        };
        f.debug_struct("AsyncResult").field("state", &state).finish()
    }
}

impl<T> Default for AsyncResult<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AsyncResult<T> {
    /// An empty cell.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AsyncInner {
                state: StdMutex::new(CellState::Pending(None)),
                notify: Notify::new(),
            }),
        }
    }
}

impl<T: Clone + Send + 'static> AsyncResult<T> {
    /// Attaches a continuation to run when the value is set. Must be
    /// called before the value arrives, and at most once.
    #[must_use]
    pub fn with_callback(self, callback: impl FnOnce(&T) + Send + 'static) -> Self {
        if let Ok(mut state) = self.inner.state.lock() {
            match &mut *state {
                CellState::Pending(slot) => {
                    assert!(slot.is_none(), "callback already set");
                    *slot = Some(Box::new(callback));
                }
                CellState::Done(_) => panic!("value already set"),
            }
        }
        self
    }

    /// Sets the value, invoking any attached continuation exactly once.
    pub fn set(&self, value: T) {
        let callback = {
            let Ok(mut state) = self.inner.state.lock() else {
                return;
            };
            match std::mem::replace(&mut *state, CellState::Done(value.clone())) {
                CellState::Pending(callback) => callback,
                CellState::Done(_) => panic!("value already set"),
            }
        };
        if let Some(callback) = callback {
            callback(&value);
        }
        self.inner.notify.notify_waiters();
    }

    /// The value, or [`NotCompleted`] if the operation has not run yet.
    pub fn value(&self) -> Result<T, NotCompleted> {
        match self.inner.state.lock() {
            Ok(guard) => match &*guard {
                CellState::Done(v) => Ok(v.clone()),
                CellState::Pending(_) => Err(NotCompleted),
            },
            Err(_) => Err(NotCompleted),
        }
    }

    /// Waits for the value to be set.
    pub async fn wait(&self) -> T {
        loop {
            let notified = self.inner.notify.notified();
            if let Ok(v) = self.value() {
                return v;
            }
            notified.await;
        }
    }
}

/// One bound operation waiting in a tunnel's FIFO.
#[derive(Debug, Clone)]
#[doc(hidden)]
#[non_exhaustive]
pub enum OpSpec {
    /// Connect the tunnel.
    Connect,
    /// Run a named operation.
    Call {
        /// Operation name.
        op: String,
        /// Positional arguments.
        args: Vec<Value>,
    },
    /// Download a remote file.
    Fetch {
        /// Remote path to read.
        remote: String,
        /// Local destination, or a temp file.
        local: Option<PathBuf>,
    },
    /// Upload a local file.
    Put {
        /// Local file to send.
        local: PathBuf,
        /// Remote destination, or a private temp file.
        remote: Option<String>,
        /// Unix permission mode.
        mode: u32,
    },
}

async fn run_spec(spec: OpSpec, tunnel: Arc<Tunnel>) -> OpOutcome {
    match spec {
        OpSpec::Connect => tunnel
            .connect()
            .await
            .map(|()| Value::Null)
            .map_err(|e| e.to_error_result()),
        OpSpec::Call { op, args } => tunnel
            .call(&op, args)
            .await
            .map_err(|e| e.to_error_result()),
        OpSpec::Fetch { remote, local } => tunnel
            .fetch(&remote, local)
            .await
            .map(|r| r.to_value())
            .map_err(|e| e.to_error_result()),
        OpSpec::Put {
            local,
            remote,
            mode,
        } => tunnel
            .put_with_mode(local, remote, mode)
            .await
            .map(|r| r.to_value())
            .map_err(|e| e.to_error_result()),
    }
}

/// Something a queue can address: a single tunnel or a whole group.
pub trait QueueTarget: sealed::Sealed {
    /// What the returned handle resolves to.
    type Output: Clone + Send + 'static;

    #[doc(hidden)]
    fn enqueue(&self, queue: &Queue, spec: OpSpec) -> AsyncResult<Self::Output>;
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for std::sync::Arc<crate::tunnel::Tunnel> {}
    impl Sealed for crate::group::Group {}
}

impl QueueTarget for Arc<Tunnel> {
    type Output = OpOutcome;

    fn enqueue(&self, queue: &Queue, spec: OpSpec) -> AsyncResult<OpOutcome> {
        queue.enqueue_tunnel(self, spec, None)
    }
}

impl QueueTarget for Group {
    type Output = GroupResult;

    fn enqueue(&self, queue: &Queue, spec: OpSpec) -> AsyncResult<GroupResult> {
        let result = AsyncResult::new();
        if self.is_empty() {
            result.set(GroupResult::new(HashMap::new()));
            return result;
        }
        let join = Arc::new(JoinOp {
            remaining: StdMutex::new(self.len()),
            results: StdMutex::new(HashMap::new()),
            target: result.clone(),
        });
        for tunnel in self.tunnels() {
            // Group fetches write one file per host.
            let spec = match &spec {
                OpSpec::Fetch {
                    remote,
                    local: Some(base),
                } => OpSpec::Fetch {
                    remote: remote.clone(),
                    local: Some(crate::group::per_host_path(base, tunnel.host())),
                },
                other => other.clone(),
            };
            let host = tunnel.host().to_owned();
            let join = Arc::clone(&join);
            let _ = queue.enqueue_tunnel(
                tunnel,
                spec,
                Some(Box::new(move |outcome: &OpOutcome| {
                    join.complete(host, outcome.clone());
                })),
            );
        }
        result
    }
}

/// Join operation assembling per-host outcomes into one group result.
struct JoinOp {
    remaining: StdMutex<usize>,
    results: StdMutex<HashMap<String, OpOutcome>>,
    target: AsyncResult<GroupResult>,
}

impl JoinOp {
    fn complete(&self, host: String, outcome: OpOutcome) {
        if let Ok(mut results) = self.results.lock() {
            results.insert(host, outcome);
        }
        let finished = self
            .remaining
            .lock()
            .map(|mut r| {
                *r -= 1;
                *r == 0
            })
            .unwrap_or(false);
        if finished {
            let assembled = self
                .results
                .lock()
                .map(|mut r| std::mem::take(&mut *r))
                .unwrap_or_default();
            self.target.set(GroupResult::new(assembled));
        }
    }
}

type QueuedOp = (OpSpec, AsyncResult<OpOutcome>);

struct QueueState {
    fifos: HashMap<String, VecDeque<QueuedOp>>,
    tunnels: HashMap<String, Arc<Tunnel>>,
    running: bool,
}

struct QueueInner {
    state: StdMutex<QueueState>,
    drained: Notify,
}

/// A queue of operations fed to tunnels and groups as fast as each host
/// allows.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (fifos, running) = self
            .inner
            .state
            .lock()
            .map(|s| (s.fifos.len(), s.running))
            .unwrap_or((0, false));
        f.debug_struct("Queue")
            .field("fifos", &fifos)
            .field("running", &running)
            .finish()
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

impl Queue {
    /// An empty queue.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: StdMutex::new(QueueState {
                    fifos: HashMap::new(),
                    tunnels: HashMap::new(),
                    running: false,
                }),
                drained: Notify::new(),
            }),
        }
    }

    /// Queues a connect on the target.
    pub fn connect<T: QueueTarget>(&self, target: &T) -> AsyncResult<T::Output> {
        target.enqueue(self, OpSpec::Connect)
    }

    /// Queues a named operation on the target.
    pub fn call<T: QueueTarget>(
        &self,
        target: &T,
        op: &str,
        args: Vec<Value>,
    ) -> AsyncResult<T::Output> {
        target.enqueue(
            self,
            OpSpec::Call {
                op: op.to_owned(),
                args,
            },
        )
    }

    /// Queues a fetch on the target. For group targets a supplied local
    /// path is varied per host.
    pub fn fetch<T: QueueTarget>(
        &self,
        target: &T,
        remote: &str,
        local: Option<PathBuf>,
    ) -> AsyncResult<T::Output> {
        target.enqueue(
            self,
            OpSpec::Fetch {
                remote: remote.to_owned(),
                local,
            },
        )
    }

    /// Queues an upload on the target.
    pub fn put<T: QueueTarget>(
        &self,
        target: &T,
        local: PathBuf,
        remote: Option<String>,
        mode: u32,
    ) -> AsyncResult<T::Output> {
        target.enqueue(
            self,
            OpSpec::Put {
                local,
                remote,
                mode,
            },
        )
    }

    /// Appends an operation to a tunnel's FIFO, creating the FIFO (with
    /// a leading connect) on first use. If the queue is already running
    /// and the FIFO is new, its head is started immediately.
    fn enqueue_tunnel(
        &self,
        tunnel: &Arc<Tunnel>,
        spec: OpSpec,
        callback: Option<Callback<OpOutcome>>,
    ) -> AsyncResult<OpOutcome> {
        let result = AsyncResult::new();
        // Attach before the op becomes reachable by a dispatch, so a
        // fast completion cannot race the continuation.
        let result = match callback {
            Some(cb) => result.with_callback(cb),
            None => result,
        };

        let start = {
            let Ok(mut st) = self.inner.state.lock() else {
                result.set(Err(lariat_proto::ErrorResult::new(
                    "queue state is poisoned",
                )));
                return result;
            };
            let host = tunnel.host().to_owned();
            let fresh = !st.fifos.contains_key(&host);
            if fresh {
                st.tunnels.insert(host.clone(), Arc::clone(tunnel));
                let fifo = st.fifos.entry(host.clone()).or_default();
                fifo.push_back((OpSpec::Connect, AsyncResult::new()));
            }
            if let Some(fifo) = st.fifos.get_mut(&host) {
                fifo.push_back((spec, result.clone()));
            }
            (fresh && st.running).then_some(host)
        };
        if let Some(host) = start {
            dispatch(&self.inner, &host);
        }
        result
    }

    /// Runs the queue until every FIFO drains, then returns. Operations
    /// enqueued while running are picked up.
    pub async fn run(&self) {
        let hosts: Vec<String> = {
            let Ok(mut st) = self.inner.state.lock() else {
                return;
            };
            st.running = true;
            st.fifos.keys().cloned().collect()
        };
        for host in &hosts {
            dispatch(&self.inner, host);
        }
        loop {
            let notified = self.inner.drained.notified();
            let empty = self
                .inner
                .state
                .lock()
                .map_or(true, |s| s.fifos.is_empty());
            if empty {
                break;
            }
            notified.await;
        }
        if let Ok(mut st) = self.inner.state.lock() {
            st.running = false;
        }
    }
}

/// Starts the head operation of one FIFO. Completion sets the handle,
/// pops the head, and either starts the next operation or retires the
/// FIFO; retiring the last FIFO wakes `run`.
fn dispatch(inner: &Arc<QueueInner>, host: &str) {
    let dispatched = {
        let Ok(st) = inner.state.lock() else { return };
        let head = st.fifos.get(host).and_then(|f| f.front().cloned());
        let tunnel = st.tunnels.get(host).map(Arc::clone);
        match (head, tunnel) {
            (Some((spec, result)), Some(tunnel)) => Some((spec, result, tunnel)),
            _ => None,
        }
    };
    let Some((spec, result, tunnel)) = dispatched else {
        return;
    };

    let inner = Arc::clone(inner);
    let host = host.to_owned();
    tokio::spawn(async move {
        let outcome = run_spec(spec, tunnel).await;
        result.set(outcome);

        let (more, all_drained) = {
            let Ok(mut st) = inner.state.lock() else {
                return;
            };
            if let Some(fifo) = st.fifos.get_mut(&host) {
                fifo.pop_front();
                if fifo.is_empty() {
                    st.fifos.remove(&host);
                    st.tunnels.remove(&host);
                }
            }
            (st.fifos.contains_key(&host), st.fifos.is_empty())
        };
        if more {
            dispatch(&inner, &host);
        } else if all_drained {
            inner.drained.notify_waiters();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn async_result_single_assignment() {
        let cell: AsyncResult<i32> = AsyncResult::new();
        assert_eq!(cell.value(), Err(NotCompleted));
        cell.set(5);
        assert_eq!(cell.value(), Ok(5));
    }

    #[test]
    #[should_panic(expected = "value already set")]
    fn async_result_rejects_double_set() {
        let cell: AsyncResult<i32> = AsyncResult::new();
        cell.set(1);
        cell.set(2);
    }

    #[test]
    fn async_result_invokes_callback_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let cell: AsyncResult<i32> = AsyncResult::new().with_callback(move |v| {
            assert_eq!(*v, 9);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        cell.set(9);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn async_result_wait_sees_prior_set() {
        let cell: AsyncResult<&'static str> = AsyncResult::new();
        cell.set("done");
        assert_eq!(cell.wait().await, "done");
    }

    #[tokio::test]
    async fn run_returns_immediately_when_empty() {
        let queue = Queue::new();
        queue.run().await;
    }
}
