//! Resource client: request-by-key over the tunnel, with a cache.
//!
//! Operations may need files the agent's host has never seen. The
//! loader sends an unsolicited request up the tunnel (request id 0) and
//! parks the asking worker on a condition variable until the dispatcher
//! feeds the answer back in. Every key crosses the wire at most once; a
//! bounded wait keeps a hung controller from deadlocking the agent.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use lariat_proto::{Message, Op, RESOURCE_WAIT, Value};
use tokio::sync::mpsc;

/// One answered resource request.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ResourceEntry {
    /// Whether the controller could resolve the key.
    pub exists: bool,
    /// Whether the key named a directory.
    pub is_pkg: bool,
    /// The path the key resolved to on the controller.
    pub file: Option<String>,
    /// The resource bytes; empty for directories and misses.
    pub source: Vec<u8>,
}

enum Slot {
    /// Request sent, answer not yet arrived.
    Requested,
    Ready(ResourceEntry),
}

struct LoaderInner {
    out: Option<mpsc::Sender<Message>>,
    cache: Mutex<HashMap<String, Slot>>,
    ready: Condvar,
}

/// Cloneable handle to the per-session resource cache.
#[derive(Clone)]
pub struct Loader {
    inner: Arc<LoaderInner>,
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cached = self.inner.cache.lock().map(|c| c.len()).unwrap_or(0);
        f.debug_struct("Loader").field("cached", &cached).finish()
    }
}

impl Loader {
    /// A loader that sends requests on the session's outbound queue.
    pub(crate) fn new(out: mpsc::Sender<Message>) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                out: Some(out),
                cache: Mutex::new(HashMap::new()),
                ready: Condvar::new(),
            }),
        }
    }

    /// A loader with no controller behind it; every request misses.
    /// Used by tests and by operations run outside a session.
    pub fn disconnected() -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                out: None,
                cache: Mutex::new(HashMap::new()),
                ready: Condvar::new(),
            }),
        }
    }

    /// Resolves a key, blocking the calling worker until the controller
    /// answers or the resource wait expires. Intended for synchronous
    /// operations; it must not be called from the async dispatcher.
    pub fn get(&self, key: &str) -> Result<ResourceEntry, String> {
        let deadline = Instant::now() + RESOURCE_WAIT;
        let mut cache = self
            .inner
            .cache
            .lock()
            .map_err(|_| "resource cache is poisoned".to_owned())?;

        if !cache.contains_key(key) {
            cache.insert(key.to_owned(), Slot::Requested);
            // Release the cache while the send can block on the bounded
            // outbound queue, or the dispatcher could never answer.
            drop(cache);
            let out = self
                .inner
                .out
                .as_ref()
                .ok_or_else(|| "no controller attached".to_owned())?;
            out.blocking_send(Message::map(Op::Imp, 0, [("imp", key)]))
                .map_err(|_| "controller stream closed".to_owned())?;
            cache = self
                .inner
                .cache
                .lock()
                .map_err(|_| "resource cache is poisoned".to_owned())?;
        }

        loop {
            if let Some(Slot::Ready(entry)) = cache.get(key) {
                return Ok(entry.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(format!(
                    "timed out after {}s waiting for resource {key:?}",
                    RESOURCE_WAIT.as_secs()
                ));
            }
            let (guard, _timeout) = self
                .inner
                .ready
                .wait_timeout(cache, deadline - now)
                .map_err(|_| "resource cache is poisoned".to_owned())?;
            cache = guard;
        }
    }

    /// Feeds a controller answer into the cache, waking any parked
    /// workers. Called by the dispatcher for inbound resource frames.
    pub(crate) fn fulfill(&self, payload: &lariat_proto::Payload) {
        let Some(key) = payload.get("mod").and_then(Value::as_str) else {
            return;
        };
        let entry = ResourceEntry {
            exists: payload
                .get("exists")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            is_pkg: payload
                .get("is_pkg")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            file: payload
                .get("file")
                .and_then(Value::as_str)
                .map(str::to_owned),
            source: payload
                .get("source")
                .and_then(Value::as_bytes)
                .map(<[u8]>::to_vec)
                .unwrap_or_default(),
        };
        if let Ok(mut cache) = self.inner.cache.lock() {
            cache.insert(key.to_owned(), Slot::Ready(entry));
        }
        self.inner.ready.notify_all();
    }

    /// Whether a key is already cached, without requesting it.
    pub fn cached(&self, key: &str) -> bool {
        self.inner
            .cache
            .lock()
            .map(|c| matches!(c.get(key), Some(Slot::Ready(_))))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnected_loader_misses() {
        let loader = Loader::disconnected();
        assert!(loader.get("anything").is_err());
        assert!(!loader.cached("anything"));
    }

    #[test]
    fn fulfilled_entries_are_served_from_cache() {
        let loader = Loader::disconnected();
        let payload = lariat_proto::Payload::Map(Value::map([
            ("mod", Value::Str("conf/app.toml".into())),
            ("exists", Value::Bool(true)),
            ("is_pkg", Value::Bool(false)),
            ("file", Value::Str("conf/app.toml".into())),
            ("source", Value::Bytes(b"x = 1".to_vec())),
        ]));
        loader.fulfill(&payload);
        assert!(loader.cached("conf/app.toml"));
        let entry = loader.get("conf/app.toml").unwrap();
        assert!(entry.exists);
        assert_eq!(entry.source, b"x = 1");
    }
}
