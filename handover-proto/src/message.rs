//! Control commands exchanged between a supervisor and its workers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A control command.
///
/// Supervisors send [`Heartbeat`](Self::Heartbeat), [`Reload`](Self::Reload),
/// [`Restart`](Self::Restart), [`Shutdown`](Self::Shutdown) and
/// [`Close`](Self::Close) to workers. Workers send `Heartbeat` and `Restart`
/// back to their supervisor, and `Start` to the replacement they spawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Command {
    /// Liveness ping (either direction).
    Heartbeat,
    /// Hand listening sockets over to a freshly spawned replacement.
    Reload,
    /// Ask the supervisor for a full stop/start of the worker.
    Restart,
    /// Drain listeners, then exit.
    Shutdown,
    /// Force-close listeners and exit immediately.
    Close,
    /// Sent to a replacement process: the JSON handoff payload naming which
    /// inherited descriptor belongs to which listener.
    Start(Vec<u8>),
}

impl Command {
    /// Upper-case command name, as used in logs.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Heartbeat => "HEARTBEAT",
            Self::Reload => "RELOAD",
            Self::Restart => "RESTART",
            Self::Shutdown => "SHUTDOWN",
            Self::Close => "CLOSE",
            Self::Start(_) => "START",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Command {
    type Err = String;

    /// Parses the payload-free commands. `START` needs a payload and is not
    /// accepted here.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "heartbeat" => Ok(Self::Heartbeat),
            "reload" => Ok(Self::Reload),
            "restart" => Ok(Self::Restart),
            "shutdown" => Ok(Self::Shutdown),
            "close" => Ok(Self::Close),
            _ => Err(format!("unknown command: {s}")),
        }
    }
}

/// A command together with the pid of the process that sent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Envelope {
    /// Sender process ID.
    pub from: u32,
    /// The command.
    pub command: Command,
}

impl Envelope {
    /// Wraps `command` as sent by `from`.
    pub const fn new(from: u32, command: Command) -> Self {
        Self { from, command }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_command_names_case_insensitively() {
        assert_eq!("RELOAD".parse::<Command>(), Ok(Command::Reload));
        assert_eq!("close".parse::<Command>(), Ok(Command::Close));
        assert!("start".parse::<Command>().is_err());
    }

    #[test]
    fn display_matches_name() {
        assert_eq!(Command::Start(Vec::new()).to_string(), "START");
        assert_eq!(Command::Heartbeat.to_string(), "HEARTBEAT");
    }
}
