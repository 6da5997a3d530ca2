//! Timing constants, platform capability, and environment conventions.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Supervisor pid handed to a spawned worker.
pub const ENV_PARENT_PID: &str = "HANDOVER_PARENT_PID";

/// Pid of the worker that spawned a replacement; its presence marks the
/// process as a replacement that must wait for `START`.
pub const ENV_ORIGIN_PID: &str = "HANDOVER_ORIGIN_PID";

/// Directory holding the per-pid control sockets.
pub const ENV_RUNTIME_DIR: &str = "HANDOVER_RUNTIME_DIR";

/// Override for [`Timing::heartbeat_interval`], in milliseconds.
pub const ENV_HEARTBEAT_INTERVAL: &str = "HANDOVER_HEARTBEAT_INTERVAL_MS";

/// Override for [`Timing::heartbeat_timeout`], in milliseconds.
pub const ENV_HEARTBEAT_TIMEOUT: &str = "HANDOVER_HEARTBEAT_TIMEOUT_MS";

/// Override for [`Timing::idle_timeout`], in milliseconds.
pub const ENV_IDLE_TIMEOUT: &str = "HANDOVER_IDLE_TIMEOUT_MS";

/// Watchdog timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Timing {
    /// Pause between two heartbeats sent to the supervisor.
    pub heartbeat_interval: Duration,
    /// Silence from a supervising parent after which the worker exits.
    pub heartbeat_timeout: Duration,
    /// Uptime after which a worker that was never supervised exits.
    pub idle_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(1000),
            heartbeat_timeout: Duration::from_millis(3000),
            idle_timeout: Duration::from_millis(10_000),
        }
    }
}

impl Timing {
    /// Defaults, overridden by the `HANDOVER_*_MS` environment variables.
    ///
    /// Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut t = Self::default();
        for (var, slot) in [
            (ENV_HEARTBEAT_INTERVAL, &mut t.heartbeat_interval),
            (ENV_HEARTBEAT_TIMEOUT, &mut t.heartbeat_timeout),
            (ENV_IDLE_TIMEOUT, &mut t.idle_timeout),
        ] {
            let Some(raw) = lookup(var) else { continue };
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => *slot = Duration::from_millis(ms),
                _ => warn!(var, value = %raw, "ignoring invalid timing override"),
            }
        }
        t
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub const fn with_heartbeat_interval(mut self, d: Duration) -> Self {
        self.heartbeat_interval = d;
        self
    }

    /// Sets the heartbeat timeout.
    #[must_use]
    pub const fn with_heartbeat_timeout(mut self, d: Duration) -> Self {
        self.heartbeat_timeout = d;
        self
    }

    /// Sets the idle timeout.
    #[must_use]
    pub const fn with_idle_timeout(mut self, d: Duration) -> Self {
        self.idle_timeout = d;
        self
    }
}

/// Whether open sockets survive process creation on this platform.
///
/// Resolved once at startup and matched inside the reload and shutdown
/// handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Capability {
    /// Sockets can be handed to a spawned process.
    Inherit,
    /// No inheritance: reload degrades to close-and-exit, and shutdown skips
    /// the drain.
    StopStart,
}

impl Capability {
    /// Capability of the running platform.
    pub const fn detect() -> Self {
        if cfg!(unix) {
            Self::Inherit
        } else {
            Self::StopStart
        }
    }
}

/// Supervisor pid: `HANDOVER_PARENT_PID` when set, else the OS parent.
///
/// A replacement's OS parent is the worker that spawned it, so the variable
/// is what keeps it reporting to the real supervisor.
pub fn supervisor_pid() -> u32 {
    pid_var(ENV_PARENT_PID).unwrap_or_else(os_parent_pid)
}

/// Pid of the worker that spawned this process, if it is a replacement.
pub fn origin_pid() -> Option<u32> {
    pid_var(ENV_ORIGIN_PID)
}

/// Parses a pid from an environment variable.
fn pid_var(var: &str) -> Option<u32> {
    std::env::var(var).ok()?.trim().parse().ok()
}

/// Parent pid as reported by the OS.
#[cfg(unix)]
#[allow(clippy::cast_sign_loss)]
fn os_parent_pid() -> u32 {
    nix::unistd::getppid().as_raw() as u32
}

/// Parent pid as reported by the OS.
#[cfg(not(unix))]
const fn os_parent_pid() -> u32 {
    0
}

/// Control socket directory: `HANDOVER_RUNTIME_DIR`, else
/// `$XDG_RUNTIME_DIR/handover`, else `<tmp>/handover`.
pub fn runtime_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(ENV_RUNTIME_DIR) {
        return PathBuf::from(dir);
    }
    #[cfg(unix)]
    {
        if let Some(dir) = dirs::runtime_dir() {
            return dir.join("handover");
        }
    }
    std::env::temp_dir().join("handover")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_in_milliseconds() {
        let t = Timing::from_lookup(|k| match k {
            ENV_HEARTBEAT_INTERVAL => Some("250".into()),
            ENV_IDLE_TIMEOUT => Some(" 60000 ".into()),
            _ => None,
        });
        assert_eq!(t.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(t.heartbeat_timeout, Timing::default().heartbeat_timeout);
        assert_eq!(t.idle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn invalid_overrides_keep_defaults() {
        let t = Timing::from_lookup(|k| match k {
            ENV_HEARTBEAT_TIMEOUT => Some("soon".into()),
            ENV_IDLE_TIMEOUT => Some("0".into()),
            _ => None,
        });
        assert_eq!(t, Timing::default());
    }

    #[cfg(unix)]
    #[test]
    fn unix_inherits() {
        assert_eq!(Capability::detect(), Capability::Inherit);
    }
}
