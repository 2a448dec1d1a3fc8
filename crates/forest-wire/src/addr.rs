//! Forest addresses and node types.
//!
//! A forest address is a 32-bit value split into a 16-bit zip code (high
//! half) and a 16-bit local number (low half). Zip codes partition the
//! network for hierarchical routing. Multicast addresses are marked by the
//! top bit; they have no zip/local structure.

use std::fmt;
use std::str::FromStr;

// ─── Fadr ────────────────────────────────────────────────────────────────────

/// A forest address. Zero is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Fadr(pub u32);

impl Fadr {
    /// Build a unicast address from zip code and local number.
    pub fn unicast(zip: u16, local: u16) -> Self {
        Fadr(((zip as u32) << 16) | local as u32)
    }

    /// The raw 32-bit value.
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Zip code (high 16 bits). Only meaningful for unicast addresses.
    #[inline]
    pub fn zip(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Local number (low 16 bits). Only meaningful for unicast addresses.
    #[inline]
    pub fn local(self) -> u16 {
        self.0 as u16
    }

    /// Multicast addresses carry the top bit.
    #[inline]
    pub fn is_mcast(self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    /// A valid unicast address has a non-zero zip and local part and a
    /// clear multicast bit.
    #[inline]
    pub fn is_valid_ucast(self) -> bool {
        !self.is_mcast() && self.zip() != 0 && self.local() != 0
    }

    /// Either a valid unicast or a multicast address.
    #[inline]
    pub fn is_valid(self) -> bool {
        self.is_mcast() || self.is_valid_ucast()
    }
}

impl fmt::Display for Fadr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_mcast() {
            // multicast addresses print as the signed raw value
            write!(f, "{}", self.0 as i32)
        } else {
            write!(f, "{}.{}", self.zip(), self.local())
        }
    }
}

impl FromStr for Fadr {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((z, l)) = s.split_once('.') {
            let zip: u16 = z.parse().map_err(|_| "bad zip code")?;
            let local: u16 = l.parse().map_err(|_| "bad local number")?;
            Ok(Fadr::unicast(zip, local))
        } else {
            // bare numbers are raw (multicast) addresses
            let raw: i64 = s.parse().map_err(|_| "bad address")?;
            Ok(Fadr(raw as u32))
        }
    }
}

// ─── NodeType ────────────────────────────────────────────────────────────────

/// Node types, in ascending order of trust. Controllers and routers are
/// trusted; clients and servers are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum NodeType {
    Client = 1,
    Server = 2,
    Controller = 3,
    Router = 4,
}

impl NodeType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(NodeType::Client),
            2 => Some(NodeType::Server),
            3 => Some(NodeType::Controller),
            4 => Some(NodeType::Router),
            _ => None,
        }
    }

    /// Trusted peers may send any packet type and spoofing checks are
    /// skipped for them.
    pub fn is_trusted(self) -> bool {
        self >= NodeType::Controller
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeType::Client => "client",
            NodeType::Server => "server",
            NodeType::Controller => "controller",
            NodeType::Router => "router",
        };
        f.write_str(s)
    }
}

impl FromStr for NodeType {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(NodeType::Client),
            "server" => Ok(NodeType::Server),
            "controller" => Ok(NodeType::Controller),
            "router" => Ok(NodeType::Router),
            _ => Err("unknown node type"),
        }
    }
}
