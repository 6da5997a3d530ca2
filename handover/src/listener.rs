//! Listener lifecycle: draining, force-closing, and adopting inherited
//! sockets in a replacement process.

use std::future::Future;

/// Lifecycle of the serving layer's listening sockets.
pub trait Listeners: Send + Sync {
    /// Stops accepting, lets in-flight connections finish, closes everything.
    fn drain_and_close_all(&self) -> impl Future<Output = ()> + Send;

    /// Closes every listener and connection immediately.
    fn force_close_all(&self);
}

/// Process termination.
pub trait Exit: Send + Sync {
    /// Ends the process with `code`. Real implementations do not return.
    fn exit(&self, code: i32);
}

/// [`Exit`] through [`std::process::exit`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExit;

impl Exit for ProcessExit {
    fn exit(&self, code: i32) {
        std::process::exit(code);
    }
}

#[cfg(unix)]
mod unix {
    #![allow(unsafe_code)]

    use std::collections::HashSet;
    use std::future::Future;
    use std::io;
    use std::net::SocketAddr;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::sync::{Arc, Mutex, PoisonError};

    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::watch;
    use tokio::task::{JoinHandle, JoinSet};
    use tracing::{debug, info, warn};

    use super::Listeners;
    use crate::error::{Error, Result};
    use crate::registry::{Descriptor, DescriptorList, MemoryRegistry, RawHandle, SocketMap};

    /// A listening socket handed over by the previous process.
    #[derive(Debug)]
    #[non_exhaustive]
    pub struct Inherited {
        /// Server identity.
        pub server: String,
        /// Listener key.
        pub key: String,
        /// Protocol name from the descriptor entry.
        pub proto: String,
        /// The inherited socket.
        pub fd: OwnedFd,
    }

    /// Takes ownership of every live slot named by a decoded `START` payload.
    ///
    /// Fails without adopting anything if a slot is not an open socket or is
    /// named twice: a half-inherited state is a bug in the old process.
    pub fn adopt(map: &SocketMap) -> Result<Vec<Inherited>> {
        let mut seen = HashSet::new();
        let mut slots = Vec::new();
        for (server, key, list) in map.iter() {
            for d in list.entries().iter().filter(|d| d.is_live()) {
                if !seen.insert(d.handle) || !is_socket(d.handle) {
                    return Err(Error::InvalidSlot {
                        server: server.to_owned(),
                        key: key.to_owned(),
                        slot: d.handle,
                    });
                }
                slots.push((server, key, d));
            }
        }
        Ok(slots
            .into_iter()
            .map(|(server, key, d)| {
                debug!(server, key, slot = d.handle, proto = %d.proto, "adopting inherited socket");
                Inherited {
                    server: server.to_owned(),
                    key: key.to_owned(),
                    proto: d.proto.clone(),
                    // SAFETY: validated as an open socket above and named once.
                    fd: unsafe { OwnedFd::from_raw_fd(d.handle) },
                }
            })
            .collect())
    }

    /// Returns `true` if `fd` is an open socket.
    fn is_socket(fd: RawHandle) -> bool {
        // SAFETY: fstat writes into a zeroed stat struct; invalid fds fail.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &raw mut stat) } != 0 {
            return false;
        }
        (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
    }

    /// One accept loop and its registry position.
    #[derive(Debug)]
    struct Served {
        /// Server identity.
        server: String,
        /// Listener key (the local address).
        key: String,
        /// Accept loop task.
        task: JoinHandle<()>,
    }

    /// TCP listeners served on tokio, registered in a [`MemoryRegistry`].
    #[derive(Debug)]
    pub struct TcpListeners {
        /// Registry that lists the live listeners.
        registry: Arc<MemoryRegistry>,
        /// Flipped to `true` to start a drain.
        draining: watch::Sender<bool>,
        /// Running accept loops.
        served: Mutex<Vec<Served>>,
    }

    impl TcpListeners {
        /// Empty set that records its listeners in `registry`.
        pub fn new(registry: Arc<MemoryRegistry>) -> Self {
            Self {
                registry,
                draining: watch::Sender::new(false),
                served: Mutex::new(Vec::new()),
            }
        }

        /// Serves `listener` under `server`, passing each accepted connection
        /// to `handler` on its own task. Returns the bound address, which is
        /// also the registry key.
        pub fn serve<H, F>(
            &self,
            server: &str,
            listener: std::net::TcpListener,
            handler: H,
        ) -> io::Result<SocketAddr>
        where
            H: Fn(TcpStream, SocketAddr) -> F + Send + 'static,
            F: Future<Output = ()> + Send + 'static,
        {
            listener.set_nonblocking(true)?;
            let listener = TcpListener::from_std(listener)?;
            let addr = listener.local_addr()?;
            let key = addr.to_string();
            self.registry.register(
                server,
                &key,
                DescriptorList::new(vec![Descriptor::new("tcp", listener.as_raw_fd())]),
            );
            info!(server, %addr, fd = listener.as_raw_fd(), "serving listener");

            let task = tokio::spawn(accept_loop(listener, self.draining.subscribe(), handler));
            self.served
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Served {
                    server: server.to_owned(),
                    key,
                    task,
                });
            Ok(addr)
        }

        /// Removes every accept loop from the set and the registry.
        fn take_all(&self) -> Vec<Served> {
            let served = std::mem::take(
                &mut *self.served.lock().unwrap_or_else(PoisonError::into_inner),
            );
            for s in &served {
                self.registry.unregister(&s.server, &s.key);
            }
            served
        }
    }

    impl Listeners for TcpListeners {
        async fn drain_and_close_all(&self) {
            self.draining.send_replace(true);
            for s in self.take_all() {
                if let Err(e) = s.task.await {
                    warn!(server = %s.server, key = %s.key, error = %e, "accept loop ended abnormally");
                }
            }
        }

        fn force_close_all(&self) {
            for s in self.take_all() {
                s.task.abort();
            }
        }
    }

    /// Accepts until a drain starts, then waits for in-flight connections.
    ///
    /// Aborting the task drops the listener and aborts every connection.
    async fn accept_loop<H, F>(listener: TcpListener, mut draining: watch::Receiver<bool>, handler: H)
    where
        H: Fn(TcpStream, SocketAddr) -> F,
        F: Future<Output = ()> + Send + 'static,
    {
        let mut conns = JoinSet::new();
        loop {
            if *draining.borrow_and_update() {
                break;
            }
            tokio::select! {
                res = listener.accept() => match res {
                    Ok((stream, peer)) => {
                        conns.spawn(handler(stream, peer));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                res = draining.changed() => if res.is_err() { break },
                Some(_) = conns.join_next(), if !conns.is_empty() => {}
            }
        }
        drop(listener);
        while conns.join_next().await.is_some() {}
    }

}

#[cfg(unix)]
pub use unix::{Inherited, TcpListeners, adopt};
