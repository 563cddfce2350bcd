//! Ambient tunnel identity for nested controllers.
//!
//! A tunnel may itself be a controller in the remote process. The agent
//! records the host path it received in its `Start` handshake here; a
//! controller library running in the same process reads it back when
//! building its own handshakes, so the chain of host names accumulates
//! and the depth limit can be enforced end to end.

use std::sync::OnceLock;

/// Identity handed to the agent at `Start`.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct AmbientTunnel {
    /// Host names from the root controller to this process, inclusive.
    pub path: Vec<String>,
    /// Maximum permitted chain length.
    pub depth_limit: usize,
}

static AMBIENT: OnceLock<AmbientTunnel> = OnceLock::new();

/// Records this process's tunnel identity. Called once by the agent when
/// it receives `Start`; later calls are ignored.
pub fn set_ambient(path: Vec<String>, depth_limit: usize) {
    let _ = AMBIENT.set(AmbientTunnel { path, depth_limit });
}

/// The identity recorded by [`set_ambient`], if this process is an agent.
pub fn ambient() -> Option<&'static AmbientTunnel> {
    AMBIENT.get()
}
