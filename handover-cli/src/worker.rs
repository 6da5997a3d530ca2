//! `handover worker`: serve TCP listeners under supervisor control.
//!
//! A fresh worker binds every `--listen NAME=ADDR`. A replacement (spawned by
//! a reloading worker) ignores `--listen`, waits for `START`, and serves the
//! sockets it inherited instead.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use handover::Timing;

/// Arguments for `handover worker`.
///
/// Usage: `handover worker --listen NAME=ADDR [--listen NAME=ADDR...]`
#[derive(clap::Args)]
pub struct WorkerArgs {
    /// Listener to serve (format: name=host:port). Repeatable.
    #[arg(short = 'l', long = "listen", value_parser = parse_listen, required = true)]
    listen: Vec<(String, String)>,

    /// Directory holding the control sockets.
    #[arg(long)]
    runtime_dir: Option<PathBuf>,

    /// Heartbeat interval in milliseconds.
    #[arg(long)]
    heartbeat_interval_ms: Option<u64>,

    /// Supervisor silence tolerated before exiting, in milliseconds.
    #[arg(long)]
    heartbeat_timeout_ms: Option<u64>,

    /// Uptime without ever being supervised before exiting, in milliseconds.
    #[arg(long)]
    idle_timeout_ms: Option<u64>,
}

/// Parses `name=host:port`.
fn parse_listen(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, addr)) if !name.is_empty() && !addr.is_empty() => {
            Ok((name.to_owned(), addr.to_owned()))
        }
        _ => Err(format!("expected NAME=ADDR, got '{s}'")),
    }
}

impl WorkerArgs {
    /// Environment timing with command-line overrides applied.
    fn timing(&self) -> Timing {
        let mut t = Timing::from_env();
        if let Some(ms) = self.heartbeat_interval_ms.filter(|&ms| ms > 0) {
            t = t.with_heartbeat_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = self.heartbeat_timeout_ms.filter(|&ms| ms > 0) {
            t = t.with_heartbeat_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.idle_timeout_ms.filter(|&ms| ms > 0) {
            t = t.with_idle_timeout(Duration::from_millis(ms));
        }
        t
    }
}

#[cfg(unix)]
mod unix {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use anyhow::{Context, Result};
    use handover::{
        Inbox, MemoryRegistry, SocketMap, SocketRegistry, TcpListeners, UnixChannel, Worker, adopt,
        config,
    };
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::signal::unix::{SignalKind, signal};
    use tracing::{debug, info, warn};

    use super::WorkerArgs;

    type CliWorker = Worker<UnixChannel, TcpListeners>;

    impl WorkerArgs {
        pub async fn run(self) -> Result<()> {
            let timing = self.timing();
            let dir = self.runtime_dir.clone().unwrap_or_else(config::runtime_dir);
            let pid = std::process::id();

            let registry = Arc::new(MemoryRegistry::default());
            let worker = Arc::new(
                Worker::builder(
                    UnixChannel::new(&dir, pid),
                    TcpListeners::new(Arc::clone(&registry)),
                )
                .pid(pid)
                .registry(registry as Arc<dyn SocketRegistry>)
                .build(),
            );
            info!(pid, supervisor = worker.supervisor(), dir = %dir.display(), "worker starting");

            let inbox = Inbox::bind(&dir, pid)
                .with_context(|| format!("failed to bind control socket in {}", dir.display()))?;
            let mut inbox = tokio::spawn({
                let worker = Arc::clone(&worker);
                async move { inbox.run(move |envelope| worker.dispatch(envelope)).await }
            });
            worker.spawn_watchdog(timing);

            if let Some(origin) = config::origin_pid() {
                let adopted = tokio::time::timeout(timing.idle_timeout, worker.started())
                    .await
                    .with_context(|| format!("no handoff from process {origin}"))?;
                serve_inherited(&worker, &adopted)?;
            } else {
                for (name, addr) in &self.listen {
                    let listener = std::net::TcpListener::bind(addr)
                        .with_context(|| format!("failed to bind {name}={addr}"))?;
                    worker.listeners().serve(name, listener, greet)?;
                }
            }

            let mut terminate = signal(SignalKind::terminate()).context("SIGTERM handler")?;
            tokio::select! {
                res = &mut inbox => {
                    res.context("control socket task panicked")?
                        .context("control socket failed")?;
                }
                _ = terminate.recv() => {
                    info!(pid, "SIGTERM received");
                    worker.on_shutdown().await;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!(pid, "interrupted");
                    worker.on_close();
                }
            }
            Ok(())
        }
    }

    /// Serves every TCP listener named in a `START` payload.
    ///
    /// The registry is rebuilt from what is actually served, so a skipped
    /// entry (whose socket is closed here) is never handed over again.
    fn serve_inherited(worker: &CliWorker, map: &SocketMap) -> Result<()> {
        let adopted = adopt(map).context("invalid handoff")?;
        worker.registry().replace(SocketMap::new());
        for inherited in adopted {
            if inherited.proto != "tcp" {
                warn!(server = %inherited.server, key = %inherited.key, proto = %inherited.proto, "closing non-tcp listener");
                continue;
            }
            let listener = std::net::TcpListener::from(inherited.fd);
            worker.listeners().serve(&inherited.server, listener, greet)?;
        }
        Ok(())
    }

    /// Writes one line naming the serving process, then closes.
    async fn greet(mut stream: TcpStream, peer: SocketAddr) {
        let line = format!("handover worker {}\n", std::process::id());
        if let Err(e) = stream.write_all(line.as_bytes()).await {
            debug!(%peer, error = %e, "greeting not delivered");
        }
    }

}

#[cfg(not(unix))]
impl WorkerArgs {
    pub async fn run(self) -> Result<()> {
        let _ = self.timing();
        anyhow::bail!("handle inheritance requires Linux or macOS")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_arg_splits_on_first_equals() {
        assert_eq!(
            parse_listen("web=0.0.0.0:80"),
            Ok(("web".to_owned(), "0.0.0.0:80".to_owned()))
        );
        assert!(parse_listen("0.0.0.0:80").is_err());
        assert!(parse_listen("=0.0.0.0:80").is_err());
    }
}
