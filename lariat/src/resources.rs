//! Controller-side resource exporter.
//!
//! The agent never needs anything pre-installed: when an operation asks
//! for a resource the agent does not hold, it sends a request up the
//! tunnel and the controller answers from the roots and in-memory
//! entries registered here. Missing keys answer `exists = false`; they
//! are an error only inside the remote operation that needed them.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

/// Answer to one resource request.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ResourceReply {
    /// Whether the key resolved.
    pub exists: bool,
    /// Whether the key resolved to a directory rather than a file.
    pub is_pkg: bool,
    /// Path the key resolved to, relative to its root.
    pub file: Option<String>,
    /// File contents; empty for directories and misses.
    pub source: Vec<u8>,
}

impl ResourceReply {
    /// The reply for a key that did not resolve.
    pub fn missing() -> Self {
        Self {
            exists: false,
            is_pkg: false,
            file: None,
            source: Vec::new(),
        }
    }
}

/// Registry of resources a controller is willing to serve.
#[derive(Debug, Default)]
pub struct Exporter {
    roots: Mutex<Vec<PathBuf>>,
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl Exporter {
    /// An exporter with nothing registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a directory whose files become addressable by relative key.
    pub fn add_root(&self, root: impl Into<PathBuf>) {
        if let Ok(mut roots) = self.roots.lock() {
            roots.push(root.into());
        }
    }

    /// Registers an in-memory entry. Entries shadow root files.
    pub fn add_entry(&self, key: impl Into<String>, bytes: Vec<u8>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.into(), bytes);
        }
    }

    /// Resolves a key. Keys are relative paths; absolute keys and keys
    /// that climb out of a root resolve to a miss rather than an error.
    pub fn resolve(&self, key: &str) -> ResourceReply {
        if let Ok(entries) = self.entries.lock()
            && let Some(bytes) = entries.get(key)
        {
            return ResourceReply {
                exists: true,
                is_pkg: false,
                file: Some(key.to_owned()),
                source: bytes.clone(),
            };
        }

        if !key_is_safe(key) {
            return ResourceReply::missing();
        }

        let roots = match self.roots.lock() {
            Ok(roots) => roots.clone(),
            Err(_) => return ResourceReply::missing(),
        };
        for root in roots {
            let candidate = root.join(key);
            if candidate.is_file() {
                match std::fs::read(&candidate) {
                    Ok(source) => {
                        return ResourceReply {
                            exists: true,
                            is_pkg: false,
                            file: Some(key.to_owned()),
                            source,
                        };
                    }
                    Err(_) => continue,
                }
            }
            if candidate.is_dir() {
                return ResourceReply {
                    exists: true,
                    is_pkg: true,
                    file: Some(key.to_owned()),
                    source: Vec::new(),
                };
            }
        }
        ResourceReply::missing()
    }
}

/// Rejects keys that could escape a registered root.
fn key_is_safe(key: &str) -> bool {
    let path = Path::new(key);
    !path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_resolution() {
        let exporter = Exporter::new();
        exporter.add_entry("conf/app.toml", b"x = 1".to_vec());
        let reply = exporter.resolve("conf/app.toml");
        assert!(reply.exists);
        assert!(!reply.is_pkg);
        assert_eq!(reply.source, b"x = 1");
    }

    #[test]
    fn root_resolution_and_miss() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("payload.bin"), [1u8, 2, 3]).unwrap();
        std::fs::create_dir(dir.path().join("bundle")).unwrap();

        let exporter = Exporter::new();
        exporter.add_root(dir.path());

        let reply = exporter.resolve("payload.bin");
        assert!(reply.exists);
        assert_eq!(reply.source, [1, 2, 3]);

        let pkg = exporter.resolve("bundle");
        assert!(pkg.exists);
        assert!(pkg.is_pkg);

        assert!(!exporter.resolve("absent").exists);
    }

    #[test]
    fn traversal_keys_miss() {
        let exporter = Exporter::new();
        exporter.add_root("/etc");
        assert!(!exporter.resolve("../etc/passwd").exists);
        assert!(!exporter.resolve("/etc/passwd").exists);
    }
}
