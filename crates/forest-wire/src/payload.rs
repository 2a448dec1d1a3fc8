//! Per-type packet payloads.
//!
//! All words are 32-bit big-endian. Each body decodes from a payload slice
//! and returns `None` on any framing violation; malformed payloads are
//! dropped by the caller, never repaired.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::addr::Fadr;

/// Combined add+drop cap for one SUB_UNSUB packet.
pub const MAX_SUB_LIST: usize = 350;

// ─── SubUnsub ────────────────────────────────────────────────────────────────

/// SUB_UNSUB payload: the sender's sequence number (for propagation
/// accounting), the multicast addresses being subscribed, and the ones
/// being dropped.
///
/// Layout: seq (2 words) · addCount · addCount × address · dropCount ·
/// dropCount × address.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubUnsub {
    pub seq: u64,
    pub adds: Vec<Fadr>,
    pub drops: Vec<Fadr>,
}

impl SubUnsub {
    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(16 + 4 * (self.adds.len() + self.drops.len()));
        buf.put_u64(self.seq);
        buf.put_u32(self.adds.len() as u32);
        for a in &self.adds {
            buf.put_u32(a.raw());
        }
        buf.put_u32(self.drops.len() as u32);
        for d in &self.drops {
            buf.put_u32(d.raw());
        }
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < 12 {
            return None;
        }
        let seq = buf.get_u64();
        let add_count = buf.get_u32() as usize;
        if add_count > MAX_SUB_LIST || buf.len() < 4 * add_count + 4 {
            return None;
        }
        let mut adds = Vec::with_capacity(add_count);
        for _ in 0..add_count {
            adds.push(Fadr(buf.get_u32()));
        }
        let drop_count = buf.get_u32() as usize;
        if add_count + drop_count > MAX_SUB_LIST || buf.len() < 4 * drop_count {
            return None;
        }
        let mut drops = Vec::with_capacity(drop_count);
        for _ in 0..drop_count {
            drops.push(Fadr(buf.get_u32()));
        }
        // every listed address must be multicast
        if adds.iter().chain(drops.iter()).any(|a| !a.is_mcast()) {
            return None;
        }
        Some(SubUnsub { seq, adds, drops })
    }

    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.drops.is_empty()
    }
}

// ─── ConnectBody ─────────────────────────────────────────────────────────────

/// CONNECT / DISCONNECT payload: the 64-bit nonce provisioned for the link.
/// The payload is exactly 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectBody {
    pub nonce: u64,
}

impl ConnectBody {
    pub const LEN: usize = 8;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u64(self.nonce);
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::LEN {
            return None;
        }
        Some(ConnectBody {
            nonce: buf.get_u64(),
        })
    }
}

// ─── RteReply ────────────────────────────────────────────────────────────────

/// RTE_REPLY payload: the destination the sender has a route for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RteReply {
    pub dest: Fadr,
}

impl RteReply {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(self.dest.raw());
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < 4 {
            return None;
        }
        Some(RteReply {
            dest: Fadr(buf.get_u32()),
        })
    }
}

// ─── UnknownDest ─────────────────────────────────────────────────────────────

/// UNKNOWN_DEST payload: the destination that failed to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownDest {
    pub dest: Fadr,
}

impl UnknownDest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(self.dest.raw());
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < 4 {
            return None;
        }
        Some(UnknownDest {
            dest: Fadr(buf.get_u32()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(n: u32) -> Fadr {
        Fadr(0x8000_0000 | n)
    }

    #[test]
    fn sub_unsub_roundtrip() {
        let s = SubUnsub {
            seq: 0xDEAD_BEEF_0042,
            adds: vec![m(1), m(2)],
            drops: vec![m(9)],
        };
        let wire = s.encode();
        assert_eq!(SubUnsub::decode(&wire).unwrap(), s);
    }

    #[test]
    fn sub_unsub_empty_lists() {
        let s = SubUnsub {
            seq: 7,
            adds: vec![],
            drops: vec![],
        };
        let wire = s.encode();
        let d = SubUnsub::decode(&wire).unwrap();
        assert!(d.is_empty());
        assert_eq!(d.seq, 7);
    }

    #[test]
    fn sub_unsub_rejects_oversized_list() {
        let s = SubUnsub {
            seq: 1,
            adds: (0..200).map(m).collect(),
            drops: (200..400).map(m).collect(),
        };
        // 400 combined exceeds the cap
        assert!(SubUnsub::decode(&s.encode()).is_none());
    }

    #[test]
    fn sub_unsub_rejects_unicast_address() {
        let s = SubUnsub {
            seq: 1,
            adds: vec![Fadr::unicast(1, 2)],
            drops: vec![],
        };
        assert!(SubUnsub::decode(&s.encode()).is_none());
    }

    #[test]
    fn sub_unsub_rejects_truncation() {
        let s = SubUnsub {
            seq: 1,
            adds: vec![m(1), m(2), m(3)],
            drops: vec![],
        };
        let wire = s.encode();
        assert!(SubUnsub::decode(&wire[..wire.len() - 2]).is_none());
        assert!(SubUnsub::decode(&wire[..8]).is_none());
    }

    #[test]
    fn connect_body_exact_length() {
        let c = ConnectBody {
            nonce: 0x0123_4567_89AB_CDEF,
        };
        let wire = c.encode();
        assert_eq!(wire.len(), ConnectBody::LEN);
        assert_eq!(ConnectBody::decode(&wire).unwrap(), c);
        assert!(ConnectBody::decode(&wire[..7]).is_none());
        let long = [0u8; 9];
        assert!(ConnectBody::decode(&long).is_none());
    }

    #[test]
    fn rte_reply_roundtrip() {
        let r = RteReply {
            dest: Fadr::unicast(5, 6),
        };
        assert_eq!(RteReply::decode(&r.encode()).unwrap(), r);
    }

    #[test]
    fn unknown_dest_roundtrip() {
        let u = UnknownDest {
            dest: Fadr::unicast(7, 8),
        };
        assert_eq!(UnknownDest::decode(&u.encode()).unwrap(), u);
    }
}
