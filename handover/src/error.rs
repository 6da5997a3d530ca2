//! Error types for handover operations.

/// Alias for `Result<T, handover::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by handover operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A descriptor entry was not of the form `proto#handle`.
    #[error("malformed descriptor entry {0:?}")]
    Descriptor(String),

    /// A handoff payload could not be encoded or decoded.
    #[error("handoff payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// A slot named by the handoff payload is not an open socket.
    #[error("inherited slot {slot} ({server}/{key}) is not a valid socket")]
    InvalidSlot {
        /// Server identity the slot was registered under.
        server: String,
        /// Listener key the slot was registered under.
        key: String,
        /// Descriptor number in this process.
        slot: i32,
    },

    /// An I/O error from spawning, messaging, or descriptor operations.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
