//! # Signalling payloads
//!
//! NET_SIG and CLIENT_SIG packets carry a self-describing control payload:
//! an operation type, a request/reply mode, a 64-bit sequence number, and a
//! list of (attribute, value) pairs drawn from a closed attribute set.
//! Negative replies additionally carry a free-form error string.
//!
//! Layout (words are 32-bit big-endian):
//!
//! ```text
//! type · mode · seq(2 words) · attrCount · attrCount × (code · value…)
//! [NEG_REPLY only: errLen(u16) · errLen bytes of UTF-8]
//! ```
//!
//! Attribute values are one word, except `Nonce` which is two; the closed
//! enum fixes each code's width so the stream stays self-describing.

use std::collections::BTreeMap;
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::addr::Fadr;
use crate::rates::RateSpec;

// ─── SigType ─────────────────────────────────────────────────────────────────

/// Closed set of signalling operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SigType {
    // boot handshake
    BootRouter = 0x10,
    BootConfig = 0x11,
    BootComplete = 0x12,
    BootAbort = 0x13,
    // interface table
    AddIface = 0x20,
    DropIface = 0x21,
    GetIface = 0x22,
    ModIface = 0x23,
    // link table
    AddLink = 0x30,
    DropLink = 0x31,
    GetLink = 0x32,
    ModLink = 0x33,
    // comtree table
    AddComtree = 0x40,
    DropComtree = 0x41,
    GetComtree = 0x42,
    ModComtree = 0x43,
    AddComtreeLink = 0x44,
    DropComtreeLink = 0x45,
    ModComtreeLink = 0x46,
    // route table
    AddRoute = 0x50,
    DropRoute = 0x51,
    GetRoute = 0x52,
    ModRoute = 0x53,
}

impl SigType {
    pub fn from_word(w: u32) -> Option<Self> {
        use SigType::*;
        Some(match w {
            0x10 => BootRouter,
            0x11 => BootConfig,
            0x12 => BootComplete,
            0x13 => BootAbort,
            0x20 => AddIface,
            0x21 => DropIface,
            0x22 => GetIface,
            0x23 => ModIface,
            0x30 => AddLink,
            0x31 => DropLink,
            0x32 => GetLink,
            0x33 => ModLink,
            0x40 => AddComtree,
            0x41 => DropComtree,
            0x42 => GetComtree,
            0x43 => ModComtree,
            0x44 => AddComtreeLink,
            0x45 => DropComtreeLink,
            0x46 => ModComtreeLink,
            0x50 => AddRoute,
            0x51 => DropRoute,
            0x52 => GetRoute,
            0x53 => ModRoute,
            _ => return None,
        })
    }

    /// Comtree-control operations serialise onto one worker per comtree.
    pub fn is_comtree_ctl(self) -> bool {
        use SigType::*;
        matches!(
            self,
            AddComtree
                | DropComtree
                | ModComtree
                | AddComtreeLink
                | DropComtreeLink
                | ModComtreeLink
        )
    }
}

// ─── SigMode ─────────────────────────────────────────────────────────────────

/// Request/reply mode of a signalling packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SigMode {
    Request = 1,
    PosReply = 2,
    NegReply = 3,
    /// Delivered locally to a worker whose request went unanswered; never
    /// sent on the wire by the originator.
    NoReply = 4,
}

impl SigMode {
    pub fn from_word(w: u32) -> Option<Self> {
        match w {
            1 => Some(SigMode::Request),
            2 => Some(SigMode::PosReply),
            3 => Some(SigMode::NegReply),
            4 => Some(SigMode::NoReply),
            _ => None,
        }
    }
}

// ─── SigAttr ─────────────────────────────────────────────────────────────────

/// Closed attribute set. All values are 32-bit except `Nonce` (64-bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum SigAttr {
    Iface = 1,
    Link = 2,
    Comtree = 3,
    PeerIp = 4,
    PeerPort = 5,
    PeerAdr = 6,
    PeerType = 7,
    BitRateUp = 8,
    BitRateDown = 9,
    PktRateUp = 10,
    PktRateDown = 11,
    DestAdr = 12,
    ParentLink = 13,
    CoreFlag = 14,
    RtrIp = 15,
    RtrPort = 16,
    RtrAdr = 17,
    NetMgrAdr = 18,
    FirstLeafAdr = 19,
    LastLeafAdr = 20,
    Nonce = 21,
}

impl SigAttr {
    pub fn from_word(w: u32) -> Option<Self> {
        use SigAttr::*;
        Some(match w {
            1 => Iface,
            2 => Link,
            3 => Comtree,
            4 => PeerIp,
            5 => PeerPort,
            6 => PeerAdr,
            7 => PeerType,
            8 => BitRateUp,
            9 => BitRateDown,
            10 => PktRateUp,
            11 => PktRateDown,
            12 => DestAdr,
            13 => ParentLink,
            14 => CoreFlag,
            15 => RtrIp,
            16 => RtrPort,
            17 => RtrAdr,
            18 => NetMgrAdr,
            19 => FirstLeafAdr,
            20 => LastLeafAdr,
            21 => Nonce,
            _ => return None,
        })
    }

    /// Encoded width in 32-bit words.
    fn width(self) -> usize {
        match self {
            SigAttr::Nonce => 2,
            _ => 1,
        }
    }
}

// ─── SigPacket ───────────────────────────────────────────────────────────────

/// A decoded signalling payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigPacket {
    pub typ: SigType,
    pub mode: SigMode,
    pub seq: u64,
    attrs: BTreeMap<SigAttr, u64>,
    err_msg: Option<String>,
}

/// Cap on the error string carried by a negative reply.
const MAX_ERR_LEN: usize = 500;

impl SigPacket {
    pub fn new(typ: SigType, mode: SigMode, seq: u64) -> Self {
        SigPacket {
            typ,
            mode,
            seq,
            attrs: BTreeMap::new(),
            err_msg: None,
        }
    }

    /// Build a negative reply to this request, carrying a reason.
    pub fn neg_reply(&self, msg: &str) -> Self {
        let mut rep = SigPacket::new(self.typ, SigMode::NegReply, self.seq);
        rep.err_msg = Some(msg.chars().take(MAX_ERR_LEN).collect());
        rep
    }

    /// Build a positive reply to this request.
    pub fn pos_reply(&self) -> Self {
        SigPacket::new(self.typ, SigMode::PosReply, self.seq)
    }

    // ─── attribute accessors ─────────────────────────────────────────────

    pub fn set(&mut self, attr: SigAttr, val: u64) -> &mut Self {
        self.attrs.insert(attr, val);
        self
    }

    pub fn get(&self, attr: SigAttr) -> Option<u64> {
        self.attrs.get(&attr).copied()
    }

    pub fn is_set(&self, attr: SigAttr) -> bool {
        self.attrs.contains_key(&attr)
    }

    pub fn get_adr(&self, attr: SigAttr) -> Option<Fadr> {
        self.get(attr).map(|v| Fadr(v as u32))
    }

    pub fn set_adr(&mut self, attr: SigAttr, adr: Fadr) -> &mut Self {
        self.set(attr, adr.raw() as u64)
    }

    /// Read the four rate attributes as one spec, if all are present.
    pub fn get_rates(&self) -> Option<RateSpec> {
        Some(RateSpec::new(
            self.get(SigAttr::BitRateUp)? as i32,
            self.get(SigAttr::BitRateDown)? as i32,
            self.get(SigAttr::PktRateUp)? as i32,
            self.get(SigAttr::PktRateDown)? as i32,
        ))
    }

    pub fn set_rates(&mut self, rs: &RateSpec) -> &mut Self {
        self.set(SigAttr::BitRateUp, rs.bit_rate_up as u64);
        self.set(SigAttr::BitRateDown, rs.bit_rate_down as u64);
        self.set(SigAttr::PktRateUp, rs.pkt_rate_up as u64);
        self.set(SigAttr::PktRateDown, rs.pkt_rate_down as u64)
    }

    pub fn err_msg(&self) -> Option<&str> {
        self.err_msg.as_deref()
    }

    pub fn set_err_msg(&mut self, msg: &str) {
        self.err_msg = Some(msg.chars().take(MAX_ERR_LEN).collect());
    }

    // ─── codec ───────────────────────────────────────────────────────────

    pub fn encode(&self) -> Bytes {
        let words: usize = self.attrs.keys().map(|a| 1 + a.width()).sum();
        let mut buf = BytesMut::with_capacity(20 + 4 * words + 128);
        buf.put_u32(self.typ as u32);
        buf.put_u32(self.mode as u32);
        buf.put_u64(self.seq);
        buf.put_u32(self.attrs.len() as u32);
        for (attr, val) in &self.attrs {
            buf.put_u32(*attr as u32);
            match attr.width() {
                2 => buf.put_u64(*val),
                _ => buf.put_u32(*val as u32),
            }
        }
        if self.mode == SigMode::NegReply {
            let msg = self.err_msg.as_deref().unwrap_or("");
            buf.put_u16(msg.len() as u16);
            buf.put_slice(msg.as_bytes());
        }
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < 20 {
            return None;
        }
        let typ = SigType::from_word(buf.get_u32())?;
        let mode = SigMode::from_word(buf.get_u32())?;
        let seq = buf.get_u64();
        let count = buf.get_u32() as usize;
        if count > 64 {
            return None;
        }
        let mut attrs = BTreeMap::new();
        for _ in 0..count {
            if buf.len() < 4 {
                return None;
            }
            let attr = SigAttr::from_word(buf.get_u32())?;
            let val = match attr.width() {
                2 => {
                    if buf.len() < 8 {
                        return None;
                    }
                    buf.get_u64()
                }
                _ => {
                    if buf.len() < 4 {
                        return None;
                    }
                    buf.get_u32() as u64
                }
            };
            attrs.insert(attr, val);
        }
        let err_msg = if mode == SigMode::NegReply {
            if buf.len() < 2 {
                return None;
            }
            let n = buf.get_u16() as usize;
            if n > MAX_ERR_LEN || buf.len() < n {
                return None;
            }
            let msg = std::str::from_utf8(&buf[..n]).ok()?.to_string();
            Some(msg)
        } else {
            None
        };
        Some(SigPacket {
            typ,
            mode,
            seq,
            attrs,
            err_msg,
        })
    }
}

impl fmt::Display for SigPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?} seq={}", self.typ, self.mode, self.seq)?;
        for (attr, val) in &self.attrs {
            write!(f, " {attr:?}={val}")?;
        }
        if let Some(msg) = &self.err_msg {
            write!(f, " err={msg:?}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let mut sp = SigPacket::new(SigType::AddLink, SigMode::Request, 42);
        sp.set(SigAttr::Link, 3)
            .set(SigAttr::PeerIp, 0x0A00_0005)
            .set(SigAttr::PeerPort, 30000)
            .set_adr(SigAttr::PeerAdr, Fadr::unicast(2, 1));
        let wire = sp.encode();
        let d = SigPacket::decode(&wire).unwrap();
        assert_eq!(d, sp);
        assert_eq!(d.get(SigAttr::Link), Some(3));
        assert_eq!(d.get_adr(SigAttr::PeerAdr), Some(Fadr::unicast(2, 1)));
        assert_eq!(d.get(SigAttr::Comtree), None);
    }

    #[test]
    fn nonce_is_64_bit() {
        let mut sp = SigPacket::new(SigType::BootConfig, SigMode::Request, 1);
        sp.set(SigAttr::Nonce, 0xDEAD_BEEF_CAFE_F00D);
        let d = SigPacket::decode(&sp.encode()).unwrap();
        assert_eq!(d.get(SigAttr::Nonce), Some(0xDEAD_BEEF_CAFE_F00D));
    }

    #[test]
    fn neg_reply_carries_error_string() {
        let req = SigPacket::new(SigType::AddComtree, SigMode::Request, 9);
        let rep = req.neg_reply("comtree already exists");
        assert_eq!(rep.mode, SigMode::NegReply);
        assert_eq!(rep.seq, 9);
        let d = SigPacket::decode(&rep.encode()).unwrap();
        assert_eq!(d.err_msg(), Some("comtree already exists"));
    }

    #[test]
    fn pos_reply_echoes_type_and_seq() {
        let req = SigPacket::new(SigType::GetLink, SigMode::Request, 77);
        let rep = req.pos_reply();
        assert_eq!(rep.typ, SigType::GetLink);
        assert_eq!(rep.mode, SigMode::PosReply);
        assert_eq!(rep.seq, 77);
    }

    #[test]
    fn rates_pack_as_four_attrs() {
        let rs = RateSpec::new(100, 200, 10, 20);
        let mut sp = SigPacket::new(SigType::ModLink, SigMode::Request, 5);
        sp.set_rates(&rs);
        let d = SigPacket::decode(&sp.encode()).unwrap();
        assert_eq!(d.get_rates(), Some(rs));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(SigPacket::decode(&[]).is_none());
        assert!(SigPacket::decode(&[0u8; 8]).is_none());
        let mut sp = SigPacket::new(SigType::AddLink, SigMode::Request, 1);
        sp.set(SigAttr::Link, 1);
        let wire = sp.encode();
        // truncating inside the attribute list must fail
        assert!(SigPacket::decode(&wire[..wire.len() - 2]).is_none());
        // unknown type word must fail
        let mut bad = wire.to_vec();
        bad[3] = 0xFF;
        assert!(SigPacket::decode(&bad).is_none());
    }

    #[test]
    fn comtree_ctl_classification() {
        assert!(SigType::AddComtreeLink.is_comtree_ctl());
        assert!(SigType::DropComtree.is_comtree_ctl());
        assert!(!SigType::AddLink.is_comtree_ctl());
        assert!(!SigType::BootRouter.is_comtree_ctl());
    }
}
