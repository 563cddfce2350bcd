//! Streaming file transfer: uploads into temp files, downloads in
//! fixed-size chunks, both sides checksummed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use lariat_proto::{CHUNK_SIZE, Message, Op, Value};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

/// Suffix of the sibling temp path uploads are written to before the
/// rename into place.
pub const TEMP_SUFFIX: &str = "~lariat-tmp";

/// Monotonic counter for unique private temp names.
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut out, b| {
        use std::fmt::Write as _;
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// One upload in progress, keyed by request id in the session's active
/// table. Errors are recorded rather than raised so the remaining
/// chunks of a doomed upload can be drained quietly; the verdict is
/// delivered at [`finish`](Self::finish).
#[derive(Debug)]
pub struct PutSink {
    temp_path: PathBuf,
    /// Where the file must land; equals `temp_path` for private temps.
    final_path: PathBuf,
    mode: u32,
    /// Whether `final_path` was named by the controller (needs a rename).
    named: bool,
    file: Option<tokio::fs::File>,
    hasher: Sha1,
    size: u64,
    failed: Option<String>,
}

impl PutSink {
    /// Opens the sink. A refused destination (an existing directory, an
    /// unwritable parent) is recorded, not returned: the chunks that
    /// follow are drained and the failure reported at the end.
    pub async fn begin(path: Option<String>, mode: u32) -> Self {
        match Self::open(path, mode).await {
            Ok(sink) => sink,
            Err(msg) => Self {
                temp_path: PathBuf::new(),
                final_path: PathBuf::new(),
                mode,
                named: false,
                file: None,
                hasher: Sha1::new(),
                size: 0,
                failed: Some(msg),
            },
        }
    }

    async fn open(path: Option<String>, mode: u32) -> Result<Self, String> {
        let (temp_path, final_path, named) = match path {
            Some(path) => {
                let final_path = PathBuf::from(&path);
                if final_path.is_dir() {
                    return Err(format!("will not overwrite directory {path:?}"));
                }
                (PathBuf::from(format!("{path}{TEMP_SUFFIX}")), final_path, true)
            }
            None => {
                let temp = private_temp_path();
                (temp.clone(), temp, false)
            }
        };

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            // Private while incomplete; the requested mode is applied
            // only once the checksum holds.
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options
            .open(&temp_path)
            .await
            .map_err(|e| format!("cannot open {}: {e}", temp_path.display()))?;

        Ok(Self {
            temp_path,
            final_path,
            mode,
            named,
            file: Some(file),
            hasher: Sha1::new(),
            size: 0,
            failed: None,
        })
    }

    /// Appends one chunk.
    pub async fn data(&mut self, chunk: &[u8]) {
        if self.failed.is_some() {
            return;
        }
        self.hasher.update(chunk);
        self.size += chunk.len() as u64;
        if let Some(file) = self.file.as_mut()
            && let Err(e) = file.write_all(chunk).await
        {
            self.failed = Some(format!("write failed: {e}"));
        }
    }

    /// Verifies the checksum, applies the mode and renames into place.
    /// Any failure removes the partial file and reports the cause.
    pub async fn finish(mut self, claimed_sha1: Option<&str>) -> Result<Value, String> {
        let result = self.try_finish(claimed_sha1).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&self.temp_path).await;
        }
        result
    }

    async fn try_finish(&mut self, claimed_sha1: Option<&str>) -> Result<Value, String> {
        if let Some(msg) = self.failed.take() {
            return Err(msg);
        }
        let mut file = self
            .file
            .take()
            .ok_or_else(|| "upload has no open file".to_owned())?;
        file.flush().await.map_err(|e| format!("flush failed: {e}"))?;
        drop(file);

        let sha1sum = hex_digest(&self.hasher.clone().finalize());
        if claimed_sha1 != Some(sha1sum.as_str()) {
            return Err(format!(
                "checksum mismatch writing {}: expected {}, received {sha1sum}",
                self.final_path.display(),
                claimed_sha1.unwrap_or("nothing"),
            ));
        }

        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.temp_path, Permissions::from_mode(self.mode))
                .await
                .map_err(|e| format!("chmod failed: {e}"))?;
        }
        if self.named {
            tokio::fs::rename(&self.temp_path, &self.final_path)
                .await
                .map_err(|e| format!("rename into place failed: {e}"))?;
        }

        Ok(Value::map([
            (
                "remote_path",
                Value::Str(self.final_path.display().to_string()),
            ),
            ("sha1sum", Value::Str(sha1sum)),
            (
                "size",
                Value::Int(i64::try_from(self.size).unwrap_or(i64::MAX)),
            ),
        ]))
    }
}

/// Active uploads for one session, keyed by request id.
pub type PutTable = HashMap<u32, PutSink>;

fn private_temp_path() -> PathBuf {
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("lariat-put-{}-{seq}", std::process::id()))
}

/// Streams a file back as fetch-data chunks, then reports the path and
/// digest. The error string, if any, becomes the remote traceback.
pub async fn stream_fetch(
    out: &mpsc::Sender<Message>,
    req_id: u32,
    path: &str,
) -> Result<Value, String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| format!("cannot open {path:?}: {e}"))?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| format!("read failed: {e}"))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        out.send(Message::raw(Op::FetchData, req_id, buf[..n].to_vec()))
            .await
            .map_err(|_| "session closed mid-fetch".to_owned())?;
    }
    Ok(Value::map([
        ("remote_path", Value::Str(path.to_owned())),
        ("sha1sum", Value::Str(hex_digest(&hasher.finalize()))),
    ]))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn sha1_hex(data: &[u8]) -> String {
        hex_digest(&Sha1::digest(data))
    }

    #[tokio::test]
    async fn put_roundtrip_renames_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let dest_str = dest.display().to_string();

        let mut sink = PutSink::begin(Some(dest_str.clone()), 0o640).await;
        sink.data(b"hello ").await;
        sink.data(b"world").await;
        let reply = sink.finish(Some(&sha1_hex(b"hello world"))).await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
        assert_eq!(reply.get("size"), Some(&Value::Int(11)));
        assert_eq!(
            reply.get("remote_path"),
            Some(&Value::Str(dest_str.clone()))
        );
        // No temp sibling left behind.
        assert!(!Path::new(&format!("{dest_str}{TEMP_SUFFIX}")).exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o640);
        }
    }

    #[tokio::test]
    async fn put_checksum_mismatch_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let dest_str = dest.display().to_string();

        let mut sink = PutSink::begin(Some(dest_str.clone()), 0o644).await;
        sink.data(b"corrupted").await;
        let err = sink.finish(Some(&sha1_hex(b"original"))).await.unwrap_err();
        assert!(err.contains("checksum mismatch"));

        assert!(!dest.exists());
        assert!(!Path::new(&format!("{dest_str}{TEMP_SUFFIX}")).exists());
    }

    #[tokio::test]
    async fn put_refuses_directories() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().display().to_string();

        let mut sink = PutSink::begin(Some(dest), 0o644).await;
        sink.data(b"chunk").await;
        let err = sink.finish(Some(&sha1_hex(b"chunk"))).await.unwrap_err();
        assert!(err.contains("directory"));
        assert!(dir.path().is_dir());
    }

    #[tokio::test]
    async fn put_without_path_creates_private_temp() {
        let mut sink = PutSink::begin(None, 0o644).await;
        sink.data(b"data").await;
        let reply = sink.finish(Some(&sha1_hex(b"data"))).await.unwrap();
        let path = reply
            .get("remote_path")
            .and_then(Value::as_str)
            .unwrap()
            .to_owned();
        assert_eq!(std::fs::read(&path).unwrap(), b"data");
        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn fetch_streams_chunks_and_digest() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let body = vec![7u8; CHUNK_SIZE + 123];
        std::fs::write(&src, &body).unwrap();

        let (tx, mut rx) = mpsc::channel(32);
        let reply = stream_fetch(&tx, 4, &src.display().to_string())
            .await
            .unwrap();
        drop(tx);

        let mut received = Vec::new();
        while let Some(msg) = rx.recv().await {
            assert_eq!(msg.op, Op::FetchData);
            assert_eq!(msg.req_id, 4);
            received.extend_from_slice(msg.payload.as_raw().unwrap());
        }
        assert_eq!(received, body);
        assert_eq!(
            reply.get("sha1sum"),
            Some(&Value::Str(sha1_hex(&body)))
        );
    }

    #[tokio::test]
    async fn fetch_missing_file_errors() {
        let (tx, _rx) = mpsc::channel(4);
        assert!(stream_fetch(&tx, 1, "/no/such/file").await.is_err());
    }
}
