//! # Forest packet header
//!
//! Fixed-layout datagram framing. All multi-byte fields are big-endian.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=1|  Length (12)  |   Type (8)    |   Flags (8)   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Comtree (32)                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Source Address (32)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Destination Address (32)                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      Header Checksum (32)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      Payload Checksum (32)                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The length field counts the whole datagram (header, payload checksum and
//! payload) and must equal the UDP payload size. The header checksum covers
//! the first 20 bytes with its own field zeroed; the payload checksum
//! covers only the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::addr::Fadr;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Protocol version.
pub const FOREST_VERSION: u8 = 1;

/// Checked header size: flags word + comtree + src + dst + header checksum.
pub const HDR_LEN: usize = 20;

/// Fixed per-packet overhead: header plus the payload checksum word.
pub const OVERHEAD: usize = 24;

/// Largest datagram the router will carry.
pub const MAX_PKT_LEN: usize = 1500;

/// Largest payload that fits.
pub const MAX_PAYLOAD_LEN: usize = MAX_PKT_LEN - OVERHEAD;

// ─── Packet Type ─────────────────────────────────────────────────────────────

/// Closed set of packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Opaque end-to-end data.
    ClientData = 1,
    /// Multicast subscription change, propagated up the comtree.
    SubUnsub = 2,
    /// Client signalling (self-describing control payload).
    ClientSig = 10,
    /// Link connect handshake; payload is the provisioning nonce.
    Connect = 11,
    /// Link teardown; payload is the provisioning nonce.
    Disconnect = 12,
    /// Route learned in response to a route request.
    RteReply = 20,
    /// Sent back to a source whose destination could not be resolved.
    UnknownDest = 21,
    /// Network signalling (self-describing control payload).
    NetSig = 30,
}

impl PacketType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(PacketType::ClientData),
            2 => Some(PacketType::SubUnsub),
            10 => Some(PacketType::ClientSig),
            11 => Some(PacketType::Connect),
            12 => Some(PacketType::Disconnect),
            20 => Some(PacketType::RteReply),
            21 => Some(PacketType::UnknownDest),
            30 => Some(PacketType::NetSig),
            _ => None,
        }
    }

    /// Signalling packets carry a [`crate::signal::SigPacket`] payload.
    pub fn is_sig(self) -> bool {
        matches!(self, PacketType::ClientSig | PacketType::NetSig)
    }
}

// ─── Flags ───────────────────────────────────────────────────────────────────

/// Header flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(pub u8);

impl Flags {
    /// Request route discovery for the destination.
    pub const RTE_REQ: u8 = 0x01;
    /// This packet acknowledges an earlier packet with the same payload.
    pub const ACK: u8 = 0x02;

    #[inline]
    pub fn rte_req(self) -> bool {
        self.0 & Self::RTE_REQ != 0
    }

    #[inline]
    pub fn ack(self) -> bool {
        self.0 & Self::ACK != 0
    }

    #[inline]
    pub fn set_rte_req(&mut self, on: bool) {
        if on {
            self.0 |= Self::RTE_REQ;
        } else {
            self.0 &= !Self::RTE_REQ;
        }
    }

    #[inline]
    pub fn set_ack(&mut self, on: bool) {
        if on {
            self.0 |= Self::ACK;
        } else {
            self.0 &= !Self::ACK;
        }
    }
}

// ─── Checksum ────────────────────────────────────────────────────────────────

/// Inverted 32-bit wrapping sum over big-endian words. Trailing bytes are
/// zero-padded to a word boundary.
pub fn checksum(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(4);
    for w in &mut chunks {
        sum = sum.wrapping_add(u32::from_be_bytes([w[0], w[1], w[2], w[3]]));
    }
    let rem = chunks.remainder();
    if !rem.is_empty() {
        let mut last = [0u8; 4];
        last[..rem.len()].copy_from_slice(rem);
        sum = sum.wrapping_add(u32::from_be_bytes(last));
    }
    !sum
}

// ─── Header ──────────────────────────────────────────────────────────────────

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version (must be 1).
    pub version: u8,
    /// Total datagram length: overhead + payload.
    pub length: u16,
    /// Packet type.
    pub ptype: PacketType,
    /// Flag bits.
    pub flags: Flags,
    /// Comtree the packet travels on.
    pub comtree: u32,
    /// Source forest address.
    pub src: Fadr,
    /// Destination forest address.
    pub dst: Fadr,
}

impl Header {
    /// Build a header for a payload of the given length.
    pub fn new(ptype: PacketType, comtree: u32, src: Fadr, dst: Fadr, payload_len: usize) -> Self {
        Header {
            version: FOREST_VERSION,
            length: (OVERHEAD + payload_len) as u16,
            ptype,
            flags: Flags::default(),
            comtree,
            src,
            dst,
        }
    }

    /// Payload length implied by the length field.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.length as usize - OVERHEAD
    }

    /// Encode the checked header (20 bytes) with its checksum computed,
    /// followed by the payload checksum word.
    pub fn encode(&self, payload: &[u8], buf: &mut BytesMut) {
        let word0: u32 = ((self.version as u32 & 0x0F) << 28)
            | ((self.length as u32 & 0x0FFF) << 16)
            | ((self.ptype as u8 as u32) << 8)
            | self.flags.0 as u32;

        let mut hdr = [0u8; HDR_LEN];
        hdr[0..4].copy_from_slice(&word0.to_be_bytes());
        hdr[4..8].copy_from_slice(&self.comtree.to_be_bytes());
        hdr[8..12].copy_from_slice(&self.src.raw().to_be_bytes());
        hdr[12..16].copy_from_slice(&self.dst.raw().to_be_bytes());
        // bytes 16..20 are the checksum field, zero while summing
        let hsum = checksum(&hdr);
        hdr[16..20].copy_from_slice(&hsum.to_be_bytes());

        buf.put_slice(&hdr);
        buf.put_u32(checksum(payload));
    }

    /// Decode and verify a header from the start of a datagram. Returns
    /// `None` on version mismatch, bad type, short input, or header
    /// checksum failure. Length-vs-datagram and payload checks are the
    /// caller's job (it knows the actual datagram size).
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < OVERHEAD {
            return None;
        }
        let mut buf = &data[..HDR_LEN];
        let word0 = buf.get_u32();
        let version = (word0 >> 28) as u8;
        if version != FOREST_VERSION {
            return None;
        }
        let length = ((word0 >> 16) & 0x0FFF) as u16;
        if (length as usize) < OVERHEAD {
            return None;
        }
        let ptype = PacketType::from_byte((word0 >> 8) as u8)?;
        let flags = Flags(word0 as u8);
        let comtree = buf.get_u32();
        let src = Fadr(buf.get_u32());
        let dst = Fadr(buf.get_u32());

        // verify the header checksum with the field zeroed
        let mut hdr = [0u8; HDR_LEN];
        hdr[..16].copy_from_slice(&data[..16]);
        let stored = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);
        if checksum(&hdr) != stored {
            return None;
        }

        Some(Header {
            version,
            length,
            ptype,
            flags,
            comtree,
            src,
            dst,
        })
    }
}

// ─── Packet ──────────────────────────────────────────────────────────────────

/// A full Forest packet: header plus payload. The payload is a refcounted
/// `Bytes`, so multicast clones share one buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
}

impl Packet {
    /// Build a packet, setting the header length from the payload.
    pub fn new(ptype: PacketType, comtree: u32, src: Fadr, dst: Fadr, payload: Bytes) -> Self {
        Packet {
            header: Header::new(ptype, comtree, src, dst, payload.len()),
            payload,
        }
    }

    /// Serialize to wire form, recomputing both checksums and the length.
    pub fn encode(&self) -> BytesMut {
        let mut hdr = self.header;
        hdr.length = (OVERHEAD + self.payload.len()) as u16;
        let mut buf = BytesMut::with_capacity(OVERHEAD + self.payload.len());
        hdr.encode(&self.payload, &mut buf);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a datagram. Fails on any header error, on a length field
    /// that disagrees with the datagram size, or on a payload checksum
    /// mismatch.
    pub fn decode(data: &[u8]) -> Option<Self> {
        let header = Header::decode(data)?;
        if header.length as usize != data.len() || data.len() > MAX_PKT_LEN {
            return None;
        }
        let stored = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);
        let payload = &data[OVERHEAD..];
        if checksum(payload) != stored {
            return None;
        }
        Some(Packet {
            header,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Total wire length.
    pub fn wire_len(&self) -> usize {
        OVERHEAD + self.payload.len()
    }
}
