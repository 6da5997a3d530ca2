//! Listening-socket registry: server → listener key → descriptor list.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Raw OS handle number. Only meaningful inside the owning process.
pub type RawHandle = i32;

/// One `(protocol, handle)` entry of a descriptor list.
///
/// A handle of `0` marks a listener that is not currently bound; it is kept
/// as a placeholder so listener keys stay aligned across a handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Descriptor {
    /// Protocol name, e.g. `tcp`.
    pub proto: String,
    /// Raw handle, or `0` for none.
    pub handle: RawHandle,
}

impl Descriptor {
    /// Creates an entry.
    pub fn new(proto: impl Into<String>, handle: RawHandle) -> Self {
        Self {
            proto: proto.into(),
            handle,
        }
    }

    /// Returns `true` if the entry refers to an open handle.
    pub const fn is_live(&self) -> bool {
        self.handle > 0
    }
}

/// Ordered descriptor list, written as `proto#handle[,proto#handle...]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DescriptorList(Vec<Descriptor>);

impl DescriptorList {
    /// Creates a list from entries.
    pub const fn new(entries: Vec<Descriptor>) -> Self {
        Self(entries)
    }

    /// Entries in order.
    pub fn entries(&self) -> &[Descriptor] {
        &self.0
    }

    /// Mutable entries in order.
    pub fn entries_mut(&mut self) -> &mut [Descriptor] {
        &mut self.0
    }

    /// Returns `true` if the list has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DescriptorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}#{}", d.proto, d.handle)?;
        }
        Ok(())
    }
}

impl FromStr for DescriptorList {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::default());
        }
        s.split(',')
            .map(|item| {
                let (proto, handle) = item
                    .split_once('#')
                    .ok_or_else(|| Error::Descriptor(item.to_owned()))?;
                let handle = handle
                    .trim()
                    .parse()
                    .map_err(|_| Error::Descriptor(item.to_owned()))?;
                Ok(Descriptor::new(proto.trim(), handle))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

impl TryFrom<String> for DescriptorList {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DescriptorList> for String {
    fn from(list: DescriptorList) -> Self {
        list.to_string()
    }
}

/// Snapshot of every registered listening socket.
///
/// Iteration order is sorted by server then listener key, which makes the
/// order handles are encountered deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SocketMap(BTreeMap<String, BTreeMap<String, DescriptorList>>);

impl SocketMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts (or replaces) the descriptor list of `server`/`key`.
    pub fn insert(&mut self, server: impl Into<String>, key: impl Into<String>, list: DescriptorList) {
        self.0
            .entry(server.into())
            .or_default()
            .insert(key.into(), list);
    }

    /// Removes `server`/`key`, dropping the server once it has no listeners.
    pub fn remove(&mut self, server: &str, key: &str) -> Option<DescriptorList> {
        let listeners = self.0.get_mut(server)?;
        let list = listeners.remove(key);
        if listeners.is_empty() {
            self.0.remove(server);
        }
        list
    }

    /// Looks up the descriptor list of `server`/`key`.
    pub fn get(&self, server: &str, key: &str) -> Option<&DescriptorList> {
        self.0.get(server)?.get(key)
    }

    /// Iterates `(server, key, list)` in encounter order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &DescriptorList)> {
        self.0.iter().flat_map(|(server, listeners)| {
            listeners
                .iter()
                .map(move |(key, list)| (server.as_str(), key.as_str(), list))
        })
    }

    /// Mutable counterpart of [`iter`](Self::iter), same order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &str, &mut DescriptorList)> {
        self.0.iter_mut().flat_map(|(server, listeners)| {
            listeners
                .iter_mut()
                .map(move |(key, list)| (server.as_str(), key.as_str(), list))
        })
    }

    /// Number of live handles across all lists.
    pub fn live_handles(&self) -> usize {
        self.iter()
            .flat_map(|(_, _, list)| list.entries())
            .filter(|d| d.is_live())
            .count()
    }

    /// Returns `true` if no server is registered.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Access to the process-wide listening-socket registry.
pub trait SocketRegistry: Send + Sync {
    /// Point-in-time copy of the registry.
    fn snapshot(&self) -> SocketMap;

    /// Replaces the registry contents.
    fn replace(&self, map: SocketMap);
}

/// [`SocketRegistry`] backed by a mutex-guarded [`SocketMap`].
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    /// Current contents.
    map: Mutex<SocketMap>,
}

impl MemoryRegistry {
    /// Creates a registry holding `map`.
    pub const fn new(map: SocketMap) -> Self {
        Self {
            map: Mutex::new(map),
        }
    }

    /// Registers (or replaces) one listener.
    pub fn register(&self, server: &str, key: &str, list: DescriptorList) {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(server, key, list);
    }

    /// Unregisters one listener.
    pub fn unregister(&self, server: &str, key: &str) {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(server, key);
    }
}

impl SocketRegistry for MemoryRegistry {
    fn snapshot(&self) -> SocketMap {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(&self, map: SocketMap) {
        *self.map.lock().unwrap_or_else(PoisonError::into_inner) = map;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_descriptor_text() {
        let list: DescriptorList = "tcp#17,udp#0".parse().unwrap();
        assert_eq!(
            list.entries(),
            &[Descriptor::new("tcp", 17), Descriptor::new("udp", 0)]
        );
        assert_eq!(list.to_string(), "tcp#17,udp#0");
    }

    #[test]
    fn empty_text_is_empty_list() {
        let list: DescriptorList = "".parse().unwrap();
        assert!(list.is_empty());
        assert_eq!(list.to_string(), "");
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(matches!(
            "tcp17".parse::<DescriptorList>(),
            Err(Error::Descriptor(item)) if item == "tcp17"
        ));
        assert!("tcp#x".parse::<DescriptorList>().is_err());
    }

    #[test]
    fn map_serializes_as_nested_strings() {
        let mut map = SocketMap::new();
        map.insert("web", "0.0.0.0:80", "tcp#17".parse().unwrap());
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"web":{"0.0.0.0:80":"tcp#17"}}"#);
        assert_eq!(serde_json::from_str::<SocketMap>(&json).unwrap(), map);
    }

    #[test]
    fn iteration_is_sorted_by_server_then_key() {
        let mut map = SocketMap::new();
        map.insert("b", "2", DescriptorList::default());
        map.insert("a", "9", DescriptorList::default());
        map.insert("b", "1", DescriptorList::default());
        let order: Vec<_> = map.iter().map(|(s, k, _)| (s, k)).collect();
        assert_eq!(order, [("a", "9"), ("b", "1"), ("b", "2")]);
    }

    #[test]
    fn memory_registry_snapshot_is_detached() {
        let reg = MemoryRegistry::default();
        reg.register("web", ":80", "tcp#5".parse().unwrap());
        let mut snap = reg.snapshot();
        snap.remove("web", ":80");
        assert!(snap.is_empty());
        assert_eq!(reg.snapshot().live_handles(), 1);

        reg.unregister("web", ":80");
        assert!(reg.snapshot().is_empty());
    }
}
