//! Worker-side command handlers and dispatch.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use handover_proto::{Command, Envelope};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::Channel;
use crate::config::{self, Capability, Timing};
use crate::listener::{Exit, Listeners, ProcessExit};
use crate::liveness::Liveness;
use crate::payload::{self, Handoff};
use crate::registry::{MemoryRegistry, SocketMap, SocketRegistry};
use crate::spawn::{CommandSpawner, SpawnRequest, Spawner};
use crate::watchdog;

/// A worker process's side of the handover protocol.
///
/// Owns the collaborators every handler needs and the liveness state shared
/// with the watchdog. Wrap it in an [`Arc`] to [`dispatch`](Self::dispatch)
/// commands and run the watchdog.
pub struct Worker<C, L> {
    /// This process.
    pid: u32,
    /// Process that receives heartbeats and restart requests.
    supervisor: u32,
    /// Resolved once; selects the reload and shutdown branches.
    capability: Capability,
    /// Outbound messages.
    channel: C,
    /// Serving layer's listeners.
    listeners: L,
    /// Listening-socket registry.
    registry: Arc<dyn SocketRegistry>,
    /// Process creation.
    spawner: Arc<dyn Spawner>,
    /// Process termination.
    exit: Arc<dyn Exit>,
    /// Supervision flag and last contact.
    liveness: Arc<Liveness>,
    /// Set while a reload is in flight.
    reloading: AtomicBool,
    /// Registry received through `START`, once it arrives.
    started: watch::Sender<Option<SocketMap>>,
}

impl<C, L> fmt::Debug for Worker<C, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("pid", &self.pid)
            .field("supervisor", &self.supervisor)
            .field("capability", &self.capability)
            .field("liveness", &self.liveness)
            .field("reloading", &self.reloading)
            .finish_non_exhaustive()
    }
}

impl<C: Channel, L: Listeners> Worker<C, L> {
    /// Starts building a worker around `channel` and `listeners`.
    pub fn builder(channel: C, listeners: L) -> WorkerBuilder<C, L> {
        WorkerBuilder {
            channel,
            listeners,
            pid: None,
            supervisor: None,
            capability: None,
            registry: None,
            spawner: None,
            exit: None,
            liveness: None,
        }
    }

    /// This process's pid.
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Supervisor pid.
    pub const fn supervisor(&self) -> u32 {
        self.supervisor
    }

    /// Shared liveness state.
    pub const fn liveness(&self) -> &Arc<Liveness> {
        &self.liveness
    }

    /// The serving layer's listeners.
    pub const fn listeners(&self) -> &L {
        &self.listeners
    }

    /// The socket registry.
    pub fn registry(&self) -> &dyn SocketRegistry {
        &*self.registry
    }

    /// Routes one inbound command.
    ///
    /// `HEARTBEAT` is recorded inline as supervisor contact and `START` is
    /// applied inline; every other command runs on its own task.
    pub fn dispatch(self: &Arc<Self>, envelope: Envelope)
    where
        C: 'static,
        L: 'static,
    {
        let from = envelope.from;
        debug!(from, command = %envelope.command, "control message");
        match envelope.command {
            Command::Heartbeat => self.liveness.acknowledge(),
            Command::Start(payload) => self.on_start(from, &payload),
            Command::Reload => {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.on_reload().await });
            }
            Command::Restart => {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.on_restart().await });
            }
            Command::Shutdown => {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.on_shutdown().await });
            }
            Command::Close => self.on_close(),
            other => warn!(from, command = %other, "unhandled control message"),
        }
    }

    /// `RELOAD`: hand every live listener to a freshly spawned copy of this
    /// process.
    ///
    /// Without handle inheritance this degrades to [`on_close`](Self::on_close).
    /// A reload arriving while another is in flight is ignored.
    pub async fn on_reload(&self) {
        match self.capability {
            Capability::StopStart => {
                info!(pid = self.pid, "no handle inheritance on this platform, closing instead");
                self.on_close();
                return;
            }
            Capability::Inherit => {}
        }

        if self.reloading.swap(true, Ordering::AcqRel) {
            warn!(pid = self.pid, "reload already in progress, ignoring");
            return;
        }
        self.reload().await;
        self.reloading.store(false, Ordering::Release);
    }

    /// Snapshot, renumber, spawn, then send `START` to the new process.
    async fn reload(&self) {
        let handoff = Handoff::prepare(&self.registry.snapshot());
        let payload = match handoff.payload() {
            Ok(p) => p,
            Err(e) => {
                error!(pid = self.pid, error = %e, "cannot encode handoff payload");
                return;
            }
        };
        let handles = handoff.handles.len();

        let spawned = match SpawnRequest::current(handoff.handles, self.supervisor) {
            Ok(mut req) => {
                req.origin = self.pid;
                let spawner = Arc::clone(&self.spawner);
                tokio::task::spawn_blocking(move || spawner.spawn(req))
                    .await
                    .map_err(io::Error::other)
                    .and_then(|r| r)
            }
            Err(e) => Err(e),
        };

        match spawned {
            Ok(new_pid) => {
                info!(pid = self.pid, new_pid, handles, "spawned replacement");
                if let Err(e) = self.channel.send(new_pid, Command::Start(payload)).await {
                    error!(pid = self.pid, new_pid, error = %e, "failed to send START to replacement");
                }
            }
            Err(e) => error!(
                pid = self.pid,
                error = %e,
                payload = %String::from_utf8_lossy(&payload),
                "fork process failed"
            ),
        }
    }

    /// `RESTART`: ask the supervisor for a full stop/start.
    pub async fn on_restart(&self) {
        if let Err(e) = self.channel.send(self.supervisor, Command::Restart).await {
            warn!(supervisor = self.supervisor, error = %e, "failed to forward RESTART");
        }
    }

    /// `SHUTDOWN`: drain listeners (when the platform supports it), then exit.
    pub async fn on_shutdown(&self) {
        match self.capability {
            Capability::Inherit => self.listeners.drain_and_close_all().await,
            Capability::StopStart => {}
        }
        info!(pid = self.pid, "shutdown complete, exit");
        self.exit.exit(0);
    }

    /// `CLOSE`: force-close listeners and exit without draining.
    pub fn on_close(&self) {
        self.listeners.force_close_all();
        info!(pid = self.pid, "listeners closed, exit");
        self.exit.exit(0);
    }

    /// `START`: adopt the registry described by the payload and publish it to
    /// [`started`](Self::started).
    pub fn on_start(&self, from: u32, payload: &[u8]) {
        match payload::decode(payload) {
            Ok(map) => {
                info!(from, listeners = map.iter().count(), "received handoff");
                self.registry.replace(map.clone());
                self.started.send_replace(Some(map));
            }
            Err(e) => error!(
                from,
                error = %e,
                payload = %String::from_utf8_lossy(payload),
                "invalid handoff payload"
            ),
        }
    }

    /// Waits for the `START` payload and returns it.
    pub async fn started(&self) -> SocketMap {
        let mut rx = self.started.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(map) => map.clone().unwrap_or_default(),
            // The sender lives in `self`.
            Err(_) => SocketMap::new(),
        }
    }

    /// Starts the heartbeat watchdog. The task ends only by exiting the
    /// process.
    pub fn spawn_watchdog(self: &Arc<Self>, timing: Timing) -> JoinHandle<()>
    where
        C: 'static,
        L: 'static,
    {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let terminal =
                watchdog::run(&this.channel, this.pid, this.supervisor, &this.liveness, &timing)
                    .await;
            debug!(%terminal, "watchdog reached terminal state");
            this.exit.exit(0);
        })
    }
}

/// Builder for [`Worker`].
///
/// Defaults: this process's pid, [`config::supervisor_pid`],
/// [`Capability::detect`], an empty [`MemoryRegistry`], [`CommandSpawner`],
/// [`ProcessExit`], fresh [`Liveness`].
#[must_use = "a WorkerBuilder does nothing until .build() is called"]
pub struct WorkerBuilder<C, L> {
    /// Outbound messages.
    channel: C,
    /// Serving layer's listeners.
    listeners: L,
    /// Override for this process's pid.
    pid: Option<u32>,
    /// Override for the supervisor pid.
    supervisor: Option<u32>,
    /// Override for the platform capability.
    capability: Option<Capability>,
    /// Socket registry.
    registry: Option<Arc<dyn SocketRegistry>>,
    /// Process creation.
    spawner: Option<Arc<dyn Spawner>>,
    /// Process termination.
    exit: Option<Arc<dyn Exit>>,
    /// Shared liveness state.
    liveness: Option<Arc<Liveness>>,
}

impl<C, L> fmt::Debug for WorkerBuilder<C, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerBuilder")
            .field("pid", &self.pid)
            .field("supervisor", &self.supervisor)
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}

impl<C: Channel, L: Listeners> WorkerBuilder<C, L> {
    /// Sets the pid stamped in logs and spawn requests.
    pub const fn pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Sets the supervisor pid.
    pub const fn supervisor(mut self, pid: u32) -> Self {
        self.supervisor = Some(pid);
        self
    }

    /// Overrides the detected platform capability.
    pub const fn capability(mut self, capability: Capability) -> Self {
        self.capability = Some(capability);
        self
    }

    /// Sets the socket registry.
    pub fn registry(mut self, registry: Arc<dyn SocketRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the process spawner.
    pub fn spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Sets the process-exit hook.
    pub fn exit(mut self, exit: Arc<dyn Exit>) -> Self {
        self.exit = Some(exit);
        self
    }

    /// Shares an existing liveness state.
    pub fn liveness(mut self, liveness: Arc<Liveness>) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Builds the worker.
    pub fn build(self) -> Worker<C, L> {
        Worker {
            pid: self.pid.unwrap_or_else(std::process::id),
            supervisor: self.supervisor.unwrap_or_else(config::supervisor_pid),
            capability: self.capability.unwrap_or_else(Capability::detect),
            channel: self.channel,
            listeners: self.listeners,
            registry: self
                .registry
                .unwrap_or_else(|| Arc::new(MemoryRegistry::default())),
            spawner: self.spawner.unwrap_or_else(|| Arc::new(CommandSpawner)),
            exit: self.exit.unwrap_or_else(|| Arc::new(ProcessExit)),
            liveness: self.liveness.unwrap_or_default(),
            reloading: AtomicBool::new(false),
            started: watch::Sender::new(None),
        }
    }
}
