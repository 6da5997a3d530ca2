//! Handoff payload: the socket registry renumbered for a replacement process.
//!
//! Descriptors 0, 1 and 2 of every spawned process are stdin, stdout and
//! stderr, so the first handed-over socket lands in slot 3 and each further
//! live handle takes the next slot, in [`SocketMap`] iteration order. The
//! slot order and the order of [`Handoff::handles`] are produced by the same
//! pass and therefore always agree.

use crate::error::Result;
use crate::registry::{RawHandle, SocketMap};

/// First descriptor slot available to inherited sockets.
pub const FIRST_SLOT: RawHandle = 3;

/// A renumbered registry plus the handles to attach, in slot order.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Handoff {
    /// Registry as the replacement will see it.
    pub map: SocketMap,
    /// Handles in this process; `handles[i]` ends up in slot `3 + i`.
    pub handles: Vec<RawHandle>,
}

impl Handoff {
    /// Renumbers every live handle of `map` to its inherited slot.
    ///
    /// Placeholder entries (handle `0`) are kept with slot `0` and attach no
    /// handle.
    pub fn prepare(map: &SocketMap) -> Self {
        let mut map = map.clone();
        let mut handles = Vec::with_capacity(map.live_handles());
        for (_, _, list) in map.iter_mut() {
            for d in list.entries_mut() {
                if d.is_live() {
                    handles.push(d.handle);
                    d.handle = slot_for(handles.len() - 1);
                } else {
                    d.handle = 0;
                }
            }
        }
        Self { map, handles }
    }

    /// JSON payload carried by the `START` command.
    pub fn payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.map)?)
    }
}

/// Decodes a `START` payload back into a registry.
pub fn decode(payload: &[u8]) -> Result<SocketMap> {
    Ok(serde_json::from_slice(payload)?)
}

/// Slot of the `index`-th attached handle.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
const fn slot_for(index: usize) -> RawHandle {
    FIRST_SLOT + index as RawHandle
}
