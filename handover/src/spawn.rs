//! Spawning a replacement process with inherited listening sockets.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;

use crate::registry::RawHandle;

/// Description of the process to create.
///
/// `handles[i]` must appear as descriptor `3 + i` in the new process.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct SpawnRequest {
    /// Executable path.
    pub program: PathBuf,
    /// Arguments, excluding argv\[0\].
    pub args: Vec<OsString>,
    /// Complete environment of the new process.
    pub env: Vec<(OsString, OsString)>,
    /// Handles to inherit, in slot order.
    pub handles: Vec<RawHandle>,
    /// Supervisor the new process reports to.
    pub parent: u32,
    /// Process doing the spawning; it sends the `START` command.
    pub origin: u32,
}

impl SpawnRequest {
    /// Re-executes the running binary with its own arguments and environment.
    pub fn current(handles: Vec<RawHandle>, parent: u32) -> io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: std::env::args_os().skip(1).collect(),
            env: std::env::vars_os().collect(),
            handles,
            parent,
            origin: std::process::id(),
        })
    }
}

/// Process-creation primitive.
pub trait Spawner: Send + Sync {
    /// Starts the process described by `req` and returns its pid.
    fn spawn(&self, req: SpawnRequest) -> io::Result<u32>;
}

#[cfg(unix)]
mod unix {
    #![allow(unsafe_code)]

    use std::fs::File;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    use super::{SpawnRequest, Spawner};
    use crate::config::{ENV_ORIGIN_PID, ENV_PARENT_PID};
    use crate::payload::FIRST_SLOT;
    use crate::registry::RawHandle;

    /// [`Spawner`] on top of [`std::process::Command`].
    ///
    /// The requested handles are remapped into slots `3..` in a pre-exec hook.
    /// The child is not waited on; it outlives this handle.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct CommandSpawner;

    impl Spawner for CommandSpawner {
        fn spawn(&self, req: SpawnRequest) -> io::Result<u32> {
            let mut cmd = Command::new(&req.program);
            cmd.args(&req.args)
                .env_clear()
                .envs(req.env.iter().map(|(k, v)| (k, v)))
                .env(ENV_PARENT_PID, req.parent.to_string())
                .env(ENV_ORIGIN_PID, req.origin.to_string());

            let handles = req.handles;
            let handles_len = handles.len();
            let mut scratch = vec![0; handles_len];
            // SAFETY: the hook only calls async-signal-safe fcntl/dup2/close
            // and does not allocate.
            unsafe {
                cmd.pre_exec(move || remap(&handles, &mut scratch));
            }

            // std reports exec failure through a pipe created at spawn time;
            // it must not land in a slot the hook overwrites.
            let held = fill_slot_holes(handles_len)?;
            let child = cmd.spawn();
            drop(held);
            Ok(child?.id())
        }
    }

    /// Occupies every free descriptor in `3..3 + n` until the returned
    /// handles are dropped. The placeholders are close-on-exec.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn fill_slot_holes(n: usize) -> io::Result<Vec<OwnedFd>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let null = OwnedFd::from(File::open("/dev/null")?);
        let mut held = Vec::new();
        for slot in FIRST_SLOT..FIRST_SLOT + n as RawHandle {
            // SAFETY: F_GETFD only queries the descriptor table.
            if unsafe { libc::fcntl(slot, libc::F_GETFD) } >= 0 {
                continue;
            }
            // SAFETY: null is open; the duplicate lands at the lowest free
            // descriptor >= slot and is owned below.
            let fd = unsafe { libc::fcntl(null.as_raw_fd(), libc::F_DUPFD_CLOEXEC, slot) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            held.push(unsafe { OwnedFd::from_raw_fd(fd) });
        }
        held.push(null);
        Ok(held)
    }

    /// Moves `handles[i]` to descriptor `3 + i` without `FD_CLOEXEC`.
    ///
    /// All handles are first duplicated above the target range (into
    /// `scratch`), so a source sitting inside `3..3 + n` cannot be clobbered
    /// before it has been moved.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn remap(handles: &[RawHandle], scratch: &mut [RawHandle]) -> io::Result<()> {
        let floor = FIRST_SLOT + handles.len() as RawHandle;
        for (high, &fd) in scratch.iter_mut().zip(handles) {
            // SAFETY: fd is an open descriptor owned by the registry.
            *high = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, floor) };
            if *high < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        for (i, &high) in scratch.iter().enumerate() {
            let slot = FIRST_SLOT + i as RawHandle;
            // SAFETY: high is the duplicate made above; dup2 clears
            // FD_CLOEXEC on the target.
            if unsafe { libc::dup2(high, slot) } < 0 {
                return Err(io::Error::last_os_error());
            }
            unsafe { libc::close(high) };
        }
        Ok(())
    }

}

#[cfg(unix)]
pub use unix::CommandSpawner;

/// Placeholder spawner for platforms without handle inheritance; the reload
/// handler never reaches it there.
#[cfg(not(unix))]
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandSpawner;

#[cfg(not(unix))]
impl Spawner for CommandSpawner {
    fn spawn(&self, _req: SpawnRequest) -> io::Result<u32> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "handle inheritance requires Unix",
        ))
    }
}
