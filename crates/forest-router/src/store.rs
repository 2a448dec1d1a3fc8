//! # Packet store
//!
//! A capacity-bounded pool of packet descriptors. Every packet inside the
//! router is referenced by its descriptor index (`Pktx`); descriptors hold
//! the parsed packet plus transit metadata. `clone` produces a new
//! descriptor sharing the same payload buffer (the `Bytes` refcount carries
//! the sharing), which is what multicast fan-out relies on: headers are
//! per-copy, payload bytes are not duplicated.
//!
//! The store itself has no lock; the router wraps it in a mutex, which is
//! taken last in the global lock order.

use std::net::SocketAddr;

use forest_wire::Packet;
use slab::Slab;

use crate::Pktx;

/// A pooled packet descriptor.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub pkt: Packet,
    /// Link the packet arrived on (0 = locally originated).
    pub in_link: usize,
    /// Link the packet must leave on (0 = let the forwarder decide).
    pub out_link: usize,
    /// Transport source of the datagram, if received from a socket.
    pub tun: Option<SocketAddr>,
    /// Router-wide receive sequence number, used for worker release
    /// watermarks.
    pub rcv_seq: u64,
}

impl Descriptor {
    fn new(pkt: Packet) -> Self {
        Descriptor {
            pkt,
            in_link: 0,
            out_link: 0,
            tun: None,
            rcv_seq: 0,
        }
    }
}

/// Fixed-capacity descriptor pool.
pub struct PacketStore {
    descs: Slab<Descriptor>,
    capacity: usize,
}

impl PacketStore {
    pub fn new(capacity: usize) -> Self {
        PacketStore {
            descs: Slab::with_capacity(capacity),
            capacity,
        }
    }

    /// Allocate a descriptor for a packet. `None` when the pool is
    /// exhausted; the caller drops the packet and counts the discard.
    pub fn alloc(&mut self, pkt: Packet) -> Option<Pktx> {
        if self.descs.len() >= self.capacity {
            return None;
        }
        Some(self.descs.insert(Descriptor::new(pkt)) + 1)
    }

    /// New descriptor sharing the payload buffer of `px`. The header and
    /// transit metadata are copied so each clone can be retargeted.
    pub fn clone_pkt(&mut self, px: Pktx) -> Option<Pktx> {
        if self.descs.len() >= self.capacity {
            return None;
        }
        let d = self.descs.get(px.wrapping_sub(1))?.clone();
        Some(self.descs.insert(d) + 1)
    }

    /// New descriptor with its own copy of the payload bytes.
    pub fn full_copy(&mut self, px: Pktx) -> Option<Pktx> {
        if self.descs.len() >= self.capacity {
            return None;
        }
        let mut d = self.descs.get(px.wrapping_sub(1))?.clone();
        d.pkt.payload = bytes::Bytes::copy_from_slice(&d.pkt.payload);
        Some(self.descs.insert(d) + 1)
    }

    /// Release a descriptor. The payload buffer is freed once its last
    /// clone goes.
    pub fn free(&mut self, px: Pktx) -> Option<Descriptor> {
        let key = px.wrapping_sub(1);
        if self.descs.contains(key) {
            Some(self.descs.remove(key))
        } else {
            None
        }
    }

    pub fn get(&self, px: Pktx) -> Option<&Descriptor> {
        self.descs.get(px.wrapping_sub(1))
    }

    pub fn get_mut(&mut self, px: Pktx) -> Option<&mut Descriptor> {
        self.descs.get_mut(px.wrapping_sub(1))
    }

    pub fn contains(&self, px: Pktx) -> bool {
        self.descs.contains(px.wrapping_sub(1))
    }

    pub fn len(&self) -> usize {
        self.descs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use forest_wire::{Fadr, PacketType};

    fn pkt(payload: &'static [u8]) -> Packet {
        Packet::new(
            PacketType::ClientData,
            100,
            Fadr::unicast(1, 1),
            Fadr::unicast(1, 2),
            Bytes::from_static(payload),
        )
    }

    #[test]
    fn alloc_get_free() {
        let mut ps = PacketStore::new(4);
        let px = ps.alloc(pkt(b"abc")).unwrap();
        assert_ne!(px, 0);
        assert_eq!(ps.get(px).unwrap().pkt.payload, &b"abc"[..]);
        assert!(ps.free(px).is_some());
        assert!(ps.free(px).is_none());
        assert!(ps.is_empty());
    }

    #[test]
    fn capacity_exhaustion() {
        let mut ps = PacketStore::new(2);
        let a = ps.alloc(pkt(b"a"));
        let b = ps.alloc(pkt(b"b"));
        assert!(a.is_some() && b.is_some());
        assert!(ps.alloc(pkt(b"c")).is_none());
        ps.free(a.unwrap());
        assert!(ps.alloc(pkt(b"c")).is_some());
    }

    #[test]
    fn clone_shares_payload_buffer() {
        let mut ps = PacketStore::new(4);
        let px = ps.alloc(pkt(b"shared")).unwrap();
        let cx = ps.clone_pkt(px).unwrap();
        assert_ne!(px, cx);

        let a = ps.get(px).unwrap().pkt.payload.as_ptr();
        let b = ps.get(cx).unwrap().pkt.payload.as_ptr();
        assert_eq!(a, b, "clone must not copy the payload");

        // freeing one copy leaves the other intact
        ps.free(px);
        assert_eq!(ps.get(cx).unwrap().pkt.payload, &b"shared"[..]);
    }

    #[test]
    fn clone_headers_are_independent() {
        let mut ps = PacketStore::new(4);
        let px = ps.alloc(pkt(b"x")).unwrap();
        let cx = ps.clone_pkt(px).unwrap();
        ps.get_mut(cx).unwrap().pkt.header.dst = Fadr::unicast(9, 9);
        assert_eq!(ps.get(px).unwrap().pkt.header.dst, Fadr::unicast(1, 2));
    }

    #[test]
    fn full_copy_duplicates_payload() {
        let mut ps = PacketStore::new(4);
        let px = ps.alloc(pkt(b"dup")).unwrap();
        let cx = ps.full_copy(px).unwrap();
        let a = ps.get(px).unwrap().pkt.payload.as_ptr();
        let b = ps.get(cx).unwrap().pkt.payload.as_ptr();
        assert_ne!(a, b);
    }

    #[test]
    fn zero_index_is_never_valid() {
        let mut ps = PacketStore::new(2);
        assert!(ps.get(0).is_none());
        assert!(ps.free(0).is_none());
        let px = ps.alloc(pkt(b"x")).unwrap();
        assert!(px > 0);
    }
}
