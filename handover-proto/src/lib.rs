//! Wire protocol for handover supervisor↔worker control messages.
//!
//! Every message is an [`Envelope`] naming the sending process and carrying
//! one [`Command`]. Envelopes are serialized with [`postcard`] and framed with
//! a 4-byte big-endian length prefix, suitable for any reliable byte stream
//! (Unix socket, TCP, pipe).

mod codec;
mod message;

pub use codec::{MAX_FRAME, decode, encode, recv, send};
pub use message::{Command, Envelope};
