//! Parallel fan-out of tunnel operations across a set of hosts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use lariat_proto::{ErrorResult, Value};
use tokio::task::JoinSet;

use crate::error::{Error, Result};
use crate::tunnel::{OpOutcome, Tunnel};

/// A set of tunnels addressed as one unit.
///
/// Hosts that fail to connect are remembered in `connection_errors` so
/// later operations and set algebra keep reporting the diagnostic
/// instead of silently shrinking the group.
#[derive(Debug, Default)]
pub struct Group {
    tunnels: Vec<Arc<Tunnel>>,
    connection_errors: StdMutex<HashMap<String, ErrorResult>>,
}

impl Group {
    /// A group over existing tunnels. Tunnels sharing a host collapse to
    /// the first occurrence.
    pub fn new(tunnels: impl IntoIterator<Item = Arc<Tunnel>>) -> Self {
        let mut seen = Vec::new();
        for tunnel in tunnels {
            if !seen
                .iter()
                .any(|t: &Arc<Tunnel>| t.host() == tunnel.host())
            {
                seen.push(tunnel);
            }
        }
        Self {
            tunnels: seen,
            connection_errors: StdMutex::new(HashMap::new()),
        }
    }

    /// A group of ssh tunnels to the named hosts.
    pub fn from_hosts<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            hosts
                .into_iter()
                .map(|h| Arc::new(Tunnel::ssh(h.into()))),
        )
    }

    /// The member tunnels.
    pub fn tunnels(&self) -> &[Arc<Tunnel>] {
        &self.tunnels
    }

    /// The member host names, in group order.
    pub fn hosts(&self) -> Vec<&str> {
        self.tunnels.iter().map(|t| t.host()).collect()
    }

    /// Number of member hosts.
    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    /// Whether the group has no members.
    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Hosts that failed to connect, with their diagnostics.
    pub fn connection_errors(&self) -> HashMap<String, ErrorResult> {
        self.connection_errors
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub(crate) fn set_connection_errors(&self, errors: HashMap<String, ErrorResult>) {
        if let Ok(mut slot) = self.connection_errors.lock() {
            *slot = errors;
        }
    }

    fn record_connect(&self, host: &str, result: &Result<()>) {
        if let Ok(mut errors) = self.connection_errors.lock() {
            match result {
                Ok(()) => {
                    errors.remove(host);
                }
                Err(e) => {
                    errors.insert(host.to_owned(), e.to_error_result());
                }
            }
        }
    }

    /// Connects every disconnected member in parallel. With `force`,
    /// connected members are closed and connected afresh.
    pub async fn connect(&self, force: bool) {
        let mut set = JoinSet::new();
        for tunnel in &self.tunnels {
            if tunnel.is_connected() && !force {
                continue;
            }
            let tunnel = Arc::clone(tunnel);
            set.spawn(async move {
                if force {
                    let _ = tunnel.close().await;
                }
                let result = tunnel.connect().await;
                (tunnel.host().to_owned(), result)
            });
        }
        while let Some(joined) = set.join_next().await {
            if let Ok((host, result)) = joined {
                self.record_connect(&host, &result);
            }
        }
    }

    /// Calls the same operation on every host in parallel.
    ///
    /// Hosts that cannot connect appear in the result as error results;
    /// they never abort the rest of the fan-out.
    pub async fn call(&self, op: &str, args: Vec<Value>) -> GroupResult {
        self.connect(false).await;
        self.fan_out(|tunnel| {
            let op = op.to_owned();
            let args = args.clone();
            async move { tunnel.call(&op, args).await.map_err(|e| e.to_error_result()) }
        })
        .await
    }

    /// Fetches the same remote path from every host in parallel. A
    /// supplied local path is varied per host (`report.txt` becomes
    /// `report-h1.txt`) so downloads cannot clobber each other.
    pub async fn fetch(&self, remote_path: &str, local_path: Option<&Path>) -> GroupResult {
        self.connect(false).await;
        let locals: HashMap<String, Option<PathBuf>> = self
            .tunnels
            .iter()
            .map(|t| (t.host().to_owned(), local_path.map(|p| per_host_path(p, t.host()))))
            .collect();
        self.fan_out(move |tunnel| {
            let remote = remote_path.to_owned();
            let local = locals.get(tunnel.host()).cloned().flatten();
            async move {
                tunnel
                    .fetch(&remote, local)
                    .await
                    .map(|r| r.to_value())
                    .map_err(|e| e.to_error_result())
            }
        })
        .await
    }

    /// Uploads the same local file to every host in parallel.
    pub async fn put(&self, local_path: &Path, remote_path: Option<String>) -> GroupResult {
        self.connect(false).await;
        self.fan_out(|tunnel| {
            let local = local_path.to_path_buf();
            let remote = remote_path.clone();
            async move {
                tunnel
                    .put(local, remote)
                    .await
                    .map(|r| r.to_value())
                    .map_err(|e| e.to_error_result())
            }
        })
        .await
    }

    /// Calls `op` on every host and keeps only the hosts whose return
    /// value is truthy (falsy with `exclude`). Any failure aborts the
    /// filter, since a missing answer is neither in nor out.
    pub async fn filter(&self, op: &str, args: Vec<Value>, exclude: bool) -> Result<Self> {
        let results = self.call(op, args).await;
        results.raise_failures()?;
        let keep: Vec<Arc<Tunnel>> = self
            .tunnels
            .iter()
            .filter(|t| {
                results
                    .get(t.host())
                    .and_then(|r| r.as_ref().ok())
                    .is_some_and(Value::is_truthy)
                    != exclude
            })
            .map(Arc::clone)
            .collect();
        Ok(Self::new(keep))
    }

    /// Closes every member tunnel.
    pub async fn close(&self) {
        let mut set = JoinSet::new();
        for tunnel in &self.tunnels {
            let tunnel = Arc::clone(tunnel);
            set.spawn(async move {
                let _ = tunnel.close().await;
            });
        }
        while set.join_next().await.is_some() {}
    }

    /// Runs one async operation per connected member, assembling a
    /// result map keyed by host. Unconnected members report their
    /// remembered connection error.
    async fn fan_out<F, Fut>(&self, make: F) -> GroupResult
    where
        F: Fn(Arc<Tunnel>) -> Fut,
        Fut: Future<Output = OpOutcome> + Send + 'static,
    {
        let errors = self.connection_errors();
        let mut results: HashMap<String, OpOutcome> = HashMap::new();
        let mut set = JoinSet::new();
        for tunnel in &self.tunnels {
            let host = tunnel.host().to_owned();
            if !tunnel.is_connected() {
                let err = errors.get(&host).cloned().unwrap_or_else(|| {
                    ErrorResult::new(format!("{host}: tunnel is not connected"))
                });
                results.insert(host, Err(err));
                continue;
            }
            let fut = make(Arc::clone(tunnel));
            set.spawn(async move { (host, fut.await) });
        }
        while let Some(joined) = set.join_next().await {
            if let Ok((host, outcome)) = joined {
                results.insert(host, outcome);
            }
        }
        GroupResult::new(results)
    }
}

impl Clone for Group {
    fn clone(&self) -> Self {
        Self {
            tunnels: self.tunnels.clone(),
            connection_errors: StdMutex::new(self.connection_errors()),
        }
    }
}

/// Varies a local path per host: the host name is appended to the file
/// stem, ahead of any extension.
pub(crate) fn per_host_path(base: &Path, host: &str) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match base.extension() {
        Some(ext) => format!("{stem}-{host}.{}", ext.to_string_lossy()),
        None => format!("{stem}-{host}"),
    };
    base.with_file_name(name)
}

/// Per-host outcomes of one group operation.
#[derive(Debug, Clone)]
pub struct GroupResult {
    results: HashMap<String, OpOutcome>,
}

impl GroupResult {
    /// Wraps an assembled result map.
    pub fn new(results: HashMap<String, OpOutcome>) -> Self {
        Self { results }
    }

    /// The outcome for one host.
    pub fn get(&self, host: &str) -> Option<&OpOutcome> {
        self.results.get(host)
    }

    /// Iterates over every host and outcome.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &OpOutcome)> {
        self.results.iter().map(|(h, o)| (h.as_str(), o))
    }

    /// Iterates over the hosts that succeeded, with their values.
    pub fn successful(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.results
            .iter()
            .filter_map(|(h, o)| o.as_ref().ok().map(|v| (h.as_str(), v)))
    }

    /// Iterates over the hosts that failed, with their errors.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &ErrorResult)> {
        self.results
            .iter()
            .filter_map(|(h, o)| o.as_ref().err().map(|e| (h.as_str(), e)))
    }

    /// Number of hosts in the result.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Whether the result is empty.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Converts any accumulated failures into a single error naming
    /// every failed host. Ok when nothing failed.
    pub fn raise_failures(&self) -> Result<()> {
        let mut failed: Vec<(&str, &ErrorResult)> = self.failures().collect();
        if failed.is_empty() {
            return Ok(());
        }
        failed.sort_by_key(|(h, _)| *h);
        let detail = failed
            .iter()
            .map(|(h, e)| format!("{h}: {e}"))
            .collect::<Vec<_>>()
            .join("\n");
        Err(Error::Failures {
            failed: failed.len(),
            total: self.results.len(),
            detail,
        })
    }

    /// Consumes the result, returning the underlying map.
    pub fn into_inner(self) -> HashMap<String, OpOutcome> {
        self.results
    }
}

impl<'a> IntoIterator for &'a GroupResult {
    type Item = (&'a str, &'a OpOutcome);
    type IntoIter = Box<dyn Iterator<Item = (&'a str, &'a OpOutcome)> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}
