//! Process-to-process control messages over per-pid Unix sockets.
//!
//! Every process listens on `<runtime-dir>/<pid>.sock` through an [`Inbox`].
//! A [`UnixChannel`] delivers one [`Envelope`] per connection to the socket
//! of the target pid.

use std::future::Future;
use std::io;

use handover_proto::Command;

/// Outbound message transport.
///
/// Delivery is not guaranteed: `Ok` means the command was handed to the
/// transport, not that the target acted on it.
pub trait Channel: Send + Sync {
    /// Sends `command` to process `pid`.
    fn send(&self, pid: u32, command: Command) -> impl Future<Output = io::Result<()>> + Send;
}

#[cfg(unix)]
mod unix {
    use std::io;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use handover_proto::{Command, Envelope};
    use tokio::io::AsyncWriteExt;
    use tokio::net::{UnixListener, UnixStream};
    use tokio::time::Instant;
    use tracing::{debug, warn};

    use super::Channel;

    /// Pause between two connection attempts to a socket that is not up yet.
    const RETRY_DELAY: Duration = Duration::from_millis(50);

    /// Path of the control socket of `pid` inside `dir`.
    pub fn socket_path(dir: &Path, pid: u32) -> PathBuf {
        dir.join(format!("{pid}.sock"))
    }

    /// [`Channel`] that connects to the target's socket in a shared directory.
    #[derive(Debug, Clone)]
    pub struct UnixChannel {
        /// Directory containing `{pid}.sock` sockets.
        dir: PathBuf,
        /// Sender pid stamped on every envelope.
        pid: u32,
        /// How long to keep retrying a socket that does not accept yet.
        connect_timeout: Duration,
    }

    impl UnixChannel {
        /// Channel sending as `pid` through sockets in `dir`.
        pub fn new(dir: impl Into<PathBuf>, pid: u32) -> Self {
            Self {
                dir: dir.into(),
                pid,
                connect_timeout: Duration::from_secs(2),
            }
        }

        /// Sets how long a missing or refusing socket is retried
        /// (default: 2 s). A freshly spawned replacement binds its socket
        /// some time after the spawn returns.
        #[must_use]
        pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
            self.connect_timeout = timeout;
            self
        }

        /// Connects to `path`, retrying until the connect timeout elapses.
        async fn connect(&self, path: &Path) -> io::Result<UnixStream> {
            let deadline = Instant::now() + self.connect_timeout;
            loop {
                match UnixStream::connect(path).await {
                    Ok(stream) => return Ok(stream),
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                        ) && Instant::now() < deadline =>
                    {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    impl Channel for UnixChannel {
        async fn send(&self, pid: u32, command: Command) -> io::Result<()> {
            let path = socket_path(&self.dir, pid);
            let mut stream = self.connect(&path).await?;
            handover_proto::send(&mut stream, &Envelope::new(self.pid, command)).await?;
            let _ = stream.shutdown().await;
            Ok(())
        }
    }

    /// Listening end of this process's control socket.
    ///
    /// The socket file is removed when the inbox is dropped.
    #[derive(Debug)]
    pub struct Inbox {
        /// Bound listener.
        listener: UnixListener,
        /// Socket file path.
        path: PathBuf,
    }

    impl Inbox {
        /// Binds `<dir>/<pid>.sock`, creating `dir` and replacing a stale
        /// socket left by a previous process with the same pid.
        pub fn bind(dir: &Path, pid: u32) -> io::Result<Self> {
            std::fs::create_dir_all(dir)?;
            let path = socket_path(dir, pid);
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed stale control socket"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            let listener = UnixListener::bind(&path)?;
            Ok(Self { listener, path })
        }

        /// Socket file path.
        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Accepts connections forever, reading one envelope from each and
        /// passing it to `on_envelope`. Each connection is read on its own
        /// task.
        pub async fn run<F>(&self, on_envelope: F) -> io::Result<()>
        where
            F: Fn(Envelope) + Clone + Send + 'static,
        {
            loop {
                let (mut stream, _addr) = self.listener.accept().await?;
                let on_envelope = on_envelope.clone();
                tokio::spawn(async move {
                    match handover_proto::recv::<Envelope>(&mut stream).await {
                        Ok(envelope) => on_envelope(envelope),
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {}
                        Err(e) => warn!(error = %e, "dropping malformed control message"),
                    }
                });
            }
        }
    }

    impl Drop for Inbox {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use tokio::sync::mpsc;

        #[tokio::test]
        async fn delivers_envelope_with_sender_pid() {
            let dir = tempfile::tempdir().unwrap();
            let inbox = Inbox::bind(dir.path(), 200).unwrap();
            let (tx, mut rx) = mpsc::unbounded_channel();
            let server = tokio::spawn(async move {
                inbox
                    .run(move |env| {
                        let _ = tx.send(env);
                    })
                    .await
            });

            let channel = UnixChannel::new(dir.path(), 100);
            channel.send(200, Command::Reload).await.unwrap();
            channel
                .send(200, Command::Start(b"{}".to_vec()))
                .await
                .unwrap();

            let mut got = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
            got.sort_by_key(|e| e.command.name());
            assert_eq!(got[0], Envelope::new(100, Command::Reload));
            assert_eq!(got[1], Envelope::new(100, Command::Start(b"{}".to_vec())));
            server.abort();
        }

        #[tokio::test]
        async fn waits_for_late_binding_socket() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().to_path_buf();
            let (tx, mut rx) = mpsc::unbounded_channel();
            let server = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let inbox = Inbox::bind(&path, 7).unwrap();
                inbox
                    .run(move |env| {
                        let _ = tx.send(env);
                    })
                    .await
            });

            UnixChannel::new(dir.path(), 1)
                .send(7, Command::Heartbeat)
                .await
                .unwrap();
            assert_eq!(rx.recv().await.unwrap().command, Command::Heartbeat);
            server.abort();
        }

        #[tokio::test]
        async fn gives_up_after_connect_timeout() {
            let dir = tempfile::tempdir().unwrap();
            let err = UnixChannel::new(dir.path(), 1)
                .connect_timeout(Duration::from_millis(100))
                .send(404, Command::Heartbeat)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::NotFound);
        }

        #[tokio::test]
        async fn socket_file_removed_on_drop() {
            let dir = tempfile::tempdir().unwrap();
            let inbox = Inbox::bind(dir.path(), 5).unwrap();
            let path = inbox.path().to_path_buf();
            assert!(path.exists());
            drop(inbox);
            assert!(!path.exists());
        }
    }
}

#[cfg(unix)]
pub use unix::{Inbox, UnixChannel, socket_path};
