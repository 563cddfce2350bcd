//! Error types for controller-side operations.

use lariat_proto::ErrorResult;

/// Alias for `Result<T, lariat::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by tunnel, group and queue operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The child process could not be spawned or the handshake failed.
    #[error("{host}: connection failed: {msg}")]
    Connect {
        /// Host the tunnel was connecting to.
        host: String,
        /// What went wrong.
        msg: String,
    },

    /// An operation was attempted on a tunnel that is not connected.
    #[error("{host}: tunnel is not connected")]
    NotConnected {
        /// Host of the unconnected tunnel.
        host: String,
    },

    /// The stream to the agent broke mid-operation: EOF, a decode
    /// failure, or an opcode that makes no sense in the current state.
    #[error("{host}: transport error: {msg}")]
    Transport {
        /// Host whose stream failed.
        host: String,
        /// What went wrong.
        msg: String,
    },

    /// The remote operation failed; carries the remote error text
    /// verbatim, prefixed with the host identity.
    #[error("{host}: remote error:\n{tb}")]
    Remote {
        /// Host the error came from.
        host: String,
        /// Formatted remote error text.
        tb: String,
    },

    /// A transfer completed but the digests disagreed. No file is left
    /// behind on the receiving side.
    #[error("{host}: checksum mismatch transferring {path}")]
    Checksum {
        /// Host of the far side of the transfer.
        host: String,
        /// The path whose transfer was discarded.
        path: String,
    },

    /// Connecting would exceed the nested-tunnel depth limit. The message
    /// names every host along the chain.
    #[error("{0}")]
    DepthLimit(String),

    /// Aggregate failure raised on demand from a group result.
    #[error("operation failed on {failed} of {total} hosts:\n{detail}")]
    Failures {
        /// Number of hosts that failed.
        failed: usize,
        /// Number of hosts addressed.
        total: usize,
        /// Per-host failure lines.
        detail: String,
    },

    /// Local I/O failure (spawning, reading or writing files or pipes).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Collapses this error into the wire failure representation.
    pub fn to_error_result(&self) -> ErrorResult {
        ErrorResult::new(self.to_string())
    }
}
