//! Heartbeat watchdog: pings the supervisor and decides when to give up.
//!
//! A worker that lost its supervisor cannot coordinate a clean handover, and
//! a worker that was spawned but never supervised is an orphan of a failed
//! handover. Both cases end in [`Terminal`], which the caller turns into an
//! immediate exit without draining.

use handover_proto::Command;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::config::Timing;
use crate::liveness::{Liveness, Terminal};

/// Runs until a terminal condition is detected.
///
/// Every `heartbeat_interval`: send `HEARTBEAT` to `supervisor` (bounded by
/// one interval), then consult `liveness`. Returns on the first tick that
/// finds a terminal condition; never otherwise. `pid` identifies this
/// process in logs.
pub async fn run<C: Channel>(
    channel: &C,
    pid: u32,
    supervisor: u32,
    liveness: &Liveness,
    timing: &Timing,
) -> Terminal {
    loop {
        tokio::time::sleep(timing.heartbeat_interval).await;

        match tokio::time::timeout(
            timing.heartbeat_interval,
            channel.send(supervisor, Command::Heartbeat),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(pid, supervisor, error = %e, "heartbeat not delivered"),
            Err(_) => debug!(supervisor, "heartbeat send timed out"),
        }

        if let Some(terminal) = liveness.verdict(timing) {
            warn!(
                pid,
                supervisor,
                uptime_ms = liveness.uptime().as_millis(),
                since_contact_ms = liveness.since_contact().as_millis(),
                "{terminal}, exit"
            );
            return terminal;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;

    /// Counts heartbeats; optionally never completes a send.
    #[derive(Default)]
    struct Counting {
        sent: AtomicUsize,
        targets: Mutex<Vec<u32>>,
        hang: bool,
    }

    impl Channel for Counting {
        async fn send(&self, pid: u32, command: Command) -> io::Result<()> {
            assert_eq!(command, Command::Heartbeat);
            self.sent.fetch_add(1, Ordering::SeqCst);
            self.targets.lock().unwrap().push(pid);
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    fn timing() -> Timing {
        Timing::default()
            .with_heartbeat_interval(Duration::from_secs(1))
            .with_heartbeat_timeout(Duration::from_secs(3))
            .with_idle_timeout(Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn unsupervised_worker_exits_on_first_tick_past_idle() {
        let channel = Counting::default();
        let live = Liveness::new();
        let start = Instant::now();

        let terminal = run(&channel, 7, 1, &live, &timing()).await;

        assert!(matches!(terminal, Terminal::Idle { .. }));
        // Ticks at 1s..=10s are not past the idle timeout; 11s is.
        assert_eq!(start.elapsed(), Duration::from_secs(11));
        assert_eq!(channel.sent.load(Ordering::SeqCst), 11);
        assert!(channel.targets.lock().unwrap().iter().all(|&p| p == 1));
    }

    /// Supervisor stand-in that answers every heartbeat.
    struct Acking {
        live: Arc<Liveness>,
        sent: AtomicUsize,
    }

    impl Channel for Acking {
        async fn send(&self, _pid: u32, _command: Command) -> io::Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            self.live.acknowledge();
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn supervised_worker_survives_while_acknowledged() {
        let live = Arc::new(Liveness::new());
        live.acknowledge();
        let channel = Acking {
            live: Arc::clone(&live),
            sent: AtomicUsize::new(0),
        };

        let outcome =
            tokio::time::timeout(Duration::from_millis(60_500), run(&channel, 7, 1, &live, &timing())).await;

        assert!(outcome.is_err(), "watchdog ended: {outcome:?}");
        assert_eq!(channel.sent.load(Ordering::SeqCst), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_supervisor_detected_once_on_next_tick() {
        let channel = Counting::default();
        let live = Liveness::new();
        live.acknowledge();
        let start = Instant::now();

        let terminal = run(&channel, 7, 1, &live, &timing()).await;

        assert_eq!(
            terminal,
            Terminal::HeartbeatTimeout {
                silent: Duration::from_secs(4)
            }
        );
        assert_eq!(start.elapsed(), Duration::from_secs(4));
        assert_eq!(channel.sent.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_log_names_the_given_pid() {
        let (events, _guard) = crate::testing::capture();
        let channel = Counting::default();
        let live = Liveness::new();

        run(&channel, 4242, 1, &live, &timing()).await;

        let warnings = events.at(tracing::Level::WARN);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].fields["pid"], "4242");
        assert_eq!(warnings[0].fields["supervisor"], "1");
    }

    #[tokio::test(start_paused = true)]
    async fn hung_send_does_not_stall_liveness_check() {
        let channel = Counting {
            hang: true,
            ..Counting::default()
        };
        let live = Liveness::new();
        live.acknowledge();
        let start = Instant::now();

        let terminal = run(&channel, 7, 1, &live, &timing()).await;

        assert!(matches!(terminal, Terminal::HeartbeatTimeout { .. }));
        // Each tick: 1s sleep plus 1s bounded send; 3s timeout passes at tick 2.
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }
}
