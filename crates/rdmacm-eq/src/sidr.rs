//! SIDR connection map.
//!
//! Connectionless (SIDR) bootstrap requests are retransmitted by the peer when
//! the shared accept response is lost. Accepted connections are recorded here
//! keyed by peer interface address, the peer's listener port and the
//! reciprocal flag, which together identify one connection to a peer.

use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::endpoint::EndpointId;
use crate::error::{EqError, EqResult};

/// Identity of an accepted SIDR connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SidrKey {
    /// Peer interface address. The peer's ephemeral port is not part of the key.
    pub addr: IpAddr,
    /// Peer listener port advertised in the XRC header.
    pub pep_port: u16,
    /// True for the reciprocal leg.
    pub recip: bool,
}

impl SidrKey {
    /// Builds a key.
    pub fn new(addr: IpAddr, pep_port: u16, recip: bool) -> Self {
        Self {
            addr,
            pep_port,
            recip,
        }
    }
}

/// Ordered map of accepted SIDR connections. Entries are weak.
#[derive(Debug, Default)]
pub struct SidrMap {
    entries: BTreeMap<SidrKey, EndpointId>,
}

impl SidrMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an accepted connection. A key may only be live once.
    pub fn insert(&mut self, key: SidrKey, ep: EndpointId) -> EqResult<()> {
        if self.entries.contains_key(&key) {
            return Err(EqError::InvalidArgument(format!(
                "SIDR connection {:?} already recorded",
                key
            )));
        }
        self.entries.insert(key, ep);
        Ok(())
    }

    /// Looks up a previously accepted connection.
    pub fn get(&self, key: &SidrKey) -> Option<EndpointId> {
        self.entries.get(key).copied()
    }

    /// Removes `key` if it still belongs to `ep`.
    pub fn remove(&mut self, key: &SidrKey, ep: EndpointId) -> bool {
        if self.entries.get(key) == Some(&ep) {
            self.entries.remove(key);
            true
        } else {
            false
        }
    }

    /// Number of recorded connections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
