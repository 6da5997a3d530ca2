//! Shared liveness state between the command dispatcher and the watchdog.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::Timing;

/// Why the watchdog ended the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Terminal {
    /// Supervised, but the supervisor has been silent for `silent`.
    HeartbeatTimeout {
        /// Time since the last acknowledgment.
        silent: Duration,
    },
    /// Never supervised, and up for `uptime`.
    Idle {
        /// Time since the liveness state was created.
        uptime: Duration,
    },
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeartbeatTimeout { silent } => {
                write!(f, "heartbeat timeout ({}ms without contact)", silent.as_millis())
            }
            Self::Idle { uptime } => {
                write!(f, "idle timeout ({}ms unsupervised)", uptime.as_millis())
            }
        }
    }
}

/// Supervision flag plus the time of the last supervisor contact.
///
/// Created once at process start, then shared by `Arc` between the dispatcher
/// (writer) and the watchdog (reader). Times are stored as milliseconds since
/// creation so both fields fit in atomics.
#[derive(Debug)]
pub struct Liveness {
    /// Creation instant; the uptime origin.
    origin: Instant,
    /// Set once the supervisor has acknowledged us.
    supervised: AtomicBool,
    /// Milliseconds after `origin` of the last acknowledgment.
    last_contact_ms: AtomicU64,
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness {
    /// Fresh, unsupervised state.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            supervised: AtomicBool::new(false),
            last_contact_ms: AtomicU64::new(0),
        }
    }

    /// Records a supervisor acknowledgment and enables supervision.
    pub fn acknowledge(&self) {
        // Timestamp first: a reader that sees the flag also sees the contact.
        self.last_contact_ms.store(self.now_ms(), Ordering::Release);
        self.supervised.store(true, Ordering::Release);
    }

    /// Returns `true` once the supervisor has acknowledged us.
    pub fn is_supervised(&self) -> bool {
        self.supervised.load(Ordering::Acquire)
    }

    /// Time since the last acknowledgment (or since creation, if none).
    pub fn since_contact(&self) -> Duration {
        let last = self.last_contact_ms.load(Ordering::Acquire);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    /// Time since creation.
    pub fn uptime(&self) -> Duration {
        self.origin.elapsed()
    }

    /// Terminal condition reached under `timing`, if any.
    pub fn verdict(&self, timing: &Timing) -> Option<Terminal> {
        if self.is_supervised() {
            let silent = self.since_contact();
            (silent > timing.heartbeat_timeout).then_some(Terminal::HeartbeatTimeout { silent })
        } else {
            let uptime = self.uptime();
            (uptime > timing.idle_timeout).then_some(Terminal::Idle { uptime })
        }
    }

    /// Milliseconds since `origin`.
    #[allow(clippy::cast_possible_truncation)]
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn timing() -> Timing {
        Timing::default()
            .with_heartbeat_timeout(Duration::from_secs(3))
            .with_idle_timeout(Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn unsupervised_exits_only_past_idle_timeout() {
        let live = Liveness::new();
        advance(Duration::from_millis(9_999)).await;
        assert_eq!(live.verdict(&timing()), None);
        advance(Duration::from_millis(2)).await;
        assert!(matches!(live.verdict(&timing()), Some(Terminal::Idle { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledgment_switches_to_heartbeat_timeout() {
        let live = Liveness::new();
        advance(Duration::from_secs(20)).await;
        live.acknowledge();
        assert!(live.is_supervised());
        assert_eq!(live.verdict(&timing()), None);

        advance(Duration::from_millis(2_999)).await;
        assert_eq!(live.verdict(&timing()), None);
        advance(Duration::from_millis(2)).await;
        assert_eq!(
            live.verdict(&timing()),
            Some(Terminal::HeartbeatTimeout {
                silent: Duration::from_millis(3_001)
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn each_acknowledgment_resets_the_clock() {
        let live = Liveness::new();
        live.acknowledge();
        for _ in 0..5 {
            advance(Duration::from_secs(2)).await;
            live.acknowledge();
            assert_eq!(live.verdict(&timing()), None);
        }
        assert_eq!(live.since_contact(), Duration::ZERO);
    }
}
