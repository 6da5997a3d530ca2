//! Worker side of a zero-downtime listener handover.
//!
//! A worker owns listening sockets recorded in a [`SocketRegistry`]. On
//! `RELOAD` it spawns a fresh copy of itself that inherits every live
//! socket in slots `3..`, then sends that copy a `START` message carrying
//! the renumbered registry. A heartbeat [`watchdog`] makes the worker exit
//! when its supervisor goes quiet, or when nobody ever supervised it.
//!
//! # Quick start
//!
//! ```no_run
//! # #[cfg(unix)]
//! # async fn demo() -> handover::Result<()> {
//! use std::sync::Arc;
//!
//! use handover::{Inbox, MemoryRegistry, TcpListeners, Timing, UnixChannel, Worker, config};
//!
//! let dir = config::runtime_dir();
//! let pid = std::process::id();
//! let registry = Arc::new(MemoryRegistry::default());
//! let listeners = TcpListeners::new(Arc::clone(&registry));
//! listeners.serve("web", std::net::TcpListener::bind("127.0.0.1:8080")?, |_stream, _peer| async {})?;
//!
//! let worker = Arc::new(
//!     Worker::builder(UnixChannel::new(&dir, pid), listeners)
//!         .registry(registry)
//!         .build(),
//! );
//! worker.spawn_watchdog(Timing::from_env());
//!
//! let inbox = Inbox::bind(&dir, pid)?;
//! let w = Arc::clone(&worker);
//! inbox.run(move |envelope| w.dispatch(envelope)).await?;
//! # Ok(())
//! # }
//! ```

mod channel;
pub mod config;
mod error;
mod listener;
mod liveness;
pub mod payload;
mod registry;
mod spawn;
#[cfg(test)]
mod testing;
pub mod watchdog;
mod worker;

pub use channel::Channel;
#[cfg(unix)]
pub use channel::{Inbox, UnixChannel, socket_path};
pub use config::{Capability, Timing};
pub use error::{Error, Result};
pub use handover_proto::{Command, Envelope};
pub use listener::{Exit, Listeners, ProcessExit};
#[cfg(unix)]
pub use listener::{Inherited, TcpListeners, adopt};
pub use liveness::{Liveness, Terminal};
pub use payload::Handoff;
pub use registry::{
    Descriptor, DescriptorList, MemoryRegistry, RawHandle, SocketMap, SocketRegistry,
};
pub use spawn::{CommandSpawner, SpawnRequest, Spawner};
pub use worker::{Worker, WorkerBuilder};
