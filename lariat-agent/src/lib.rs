//! The lariat agent: the program at the far end of a tunnel.
//!
//! A controller spawns this (directly, or through `ssh`/`docker`/`sudo`)
//! with the frame protocol on stdin/stdout. The agent rewires its stdio
//! so stray prints cannot corrupt the transport, then serves requests:
//! named operations from its [`Registry`], streamed file transfers, and
//! resource lookups answered by the controller.
//!
//! Embedders build their own agent binary by registering operations and
//! handing the transport to [`serve`]:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use lariat_agent::{Registry, claim_stdio, serve};
//! use lariat_proto::Value;
//!
//! fn main() -> std::io::Result<()> {
//!     let transport = claim_stdio()?;
//!     let mut registry = Registry::new();
//!     registry.register("greet", |_ctx, _args| Ok(Value::Str("hi".into())));
//!
//!     tokio::runtime::Runtime::new()?.block_on(serve(
//!         tokio::fs::File::from_std(transport.input),
//!         tokio::fs::File::from_std(transport.output),
//!         Arc::new(registry),
//!     ))
//! }
//! ```

mod dispatch;
mod loader;
mod registry;
#[cfg(unix)]
mod stdio;
mod transfer;

pub use dispatch::serve;
pub use loader::{Loader, ResourceEntry};
pub use registry::{CallArgs, OpCtx, OpResult, Registry};
#[cfg(unix)]
pub use stdio::{Transport, claim_stdio};
pub use transfer::TEMP_SUFFIX;
