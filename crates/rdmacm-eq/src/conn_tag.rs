//! Connection tag allocator.
//!
//! An active XRC endpoint registers a tag before it connects and sends it in
//! the handshake. The peer echoes the tag in its reciprocal connect request,
//! which is how the request is correlated back to the endpoint. A tag packs a
//! table index in the low bits and the slot's reuse counter in the high bits,
//! so a tag from a released registration never resolves to a newer one.

use serde::{Deserialize, Serialize};

use crate::endpoint::EndpointId;
use crate::error::{EqError, EqResult};

/// Correlation tag for an in-flight original connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnTag(pub u32);

impl std::fmt::Display for ConnTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct TagSlot {
    seq: u32,
    ep: Option<EndpointId>,
}

/// Tag to endpoint table. Entries are weak: they hold endpoint handles only.
#[derive(Debug)]
pub struct TagTable {
    index_bits: u8,
    slots: Vec<TagSlot>,
    free: Vec<u32>,
    len: usize,
}

impl TagTable {
    /// Creates a table whose tags use `index_bits` bits for the slot index.
    pub fn new(index_bits: u8) -> Self {
        Self {
            index_bits: index_bits.clamp(1, 24),
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    fn capacity(&self) -> usize {
        1usize << self.index_bits
    }

    fn seq_mask(&self) -> u32 {
        u32::MAX >> self.index_bits
    }

    fn encode(&self, index: u32, seq: u32) -> ConnTag {
        ConnTag((seq << self.index_bits) | index)
    }

    fn decode(&self, tag: ConnTag) -> (u32, u32) {
        let index = tag.0 & ((1u32 << self.index_bits) - 1);
        (index, tag.0 >> self.index_bits)
    }

    /// Registers `ep` and returns its tag.
    pub fn insert(&mut self, ep: EndpointId) -> EqResult<ConnTag> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() >= self.capacity() {
                    return Err(EqError::NoMemory("connection tag table full"));
                }
                self.slots.push(TagSlot { seq: 1, ep: None });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.ep = Some(ep);
        let seq = slot.seq;
        self.len += 1;
        Ok(self.encode(index, seq))
    }

    /// Returns the endpoint registered under `tag`, if the tag is current.
    pub fn get(&self, tag: ConnTag) -> Option<EndpointId> {
        let (index, seq) = self.decode(tag);
        self.slots
            .get(index as usize)
            .filter(|slot| slot.seq == seq)
            .and_then(|slot| slot.ep)
    }

    /// Removes the registration for `tag`. Stale tags are ignored.
    pub fn remove(&mut self, tag: ConnTag) -> Option<EndpointId> {
        let (index, seq) = self.decode(tag);
        let mask = self.seq_mask();
        let slot = self.slots.get_mut(index as usize)?;
        if slot.seq != seq {
            return None;
        }
        let ep = slot.ep.take()?;
        slot.seq = match (slot.seq + 1) & mask {
            0 => 1,
            next => next,
        };
        self.free.push(index);
        self.len -= 1;
        Some(ep)
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drops every registration.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.len = 0;
    }
}
