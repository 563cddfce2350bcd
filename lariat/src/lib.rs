//! Run operations on remote hosts over agents tunneled through
//! child-process stdio.
//!
//! `lariat` starts a child process per host (`ssh`, `docker run`,
//! `sudo`, or a plain local spawn), speaks a length-framed binary
//! protocol to the small agent at the far end, and gives you:
//!
//! * [`Tunnel`] — call named operations, stream files up and down with
//!   SHA-1 verification, and feed the agent resources it asks for;
//! * [`Group`] — the same operations fanned out across many hosts in
//!   parallel, with per-host results;
//! * [`Queue`] — per-host FIFOs of deferred operations drained as fast
//!   as each host allows.
//!
//! # Quick start
//!
//! ```no_run
//! use lariat::{Group, Tunnel, Value};
//!
//! # async fn demo() -> lariat::Result<()> {
//! let tunnel = Tunnel::local();
//! tunnel.connect().await?;
//! let answer = tunnel.call("echo", vec![Value::Int(42)]).await?;
//! assert_eq!(answer, Value::Int(42));
//!
//! let web = Group::from_hosts(["web1", "web2", "web3"]);
//! for (host, time) in web.call("time", vec![]).await.successful() {
//!     println!("{host}: {time:?}");
//! }
//! # Ok(())
//! # }
//! ```

mod error;
mod group;
mod launch;
mod queue;
mod resources;
mod setops;
mod tunnel;

pub use error::{Error, Result};
pub use group::{Group, GroupResult};
pub use lariat_proto::{ErrorResult, Value};
pub use launch::{DEFAULT_AGENT, Launch};
pub use queue::{AsyncResult, NotCompleted, Queue, QueueTarget};
#[doc(hidden)]
pub use queue::OpSpec;
pub use resources::{Exporter, ResourceReply};
pub use setops::SetOps;
pub use tunnel::{FetchResult, OpOutcome, PutResult, State, Tunnel};
