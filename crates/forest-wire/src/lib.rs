//! # forest-wire
//!
//! Wire format for the Forest overlay network.
//!
//! Every Forest datagram is a fixed 20-byte header, a 4-byte payload
//! checksum, and a type-specific payload, carried inside a single UDP
//! datagram. This crate is pure codec logic — no sockets, no state.
//!
//! ## Crate structure
//!
//! - [`addr`] — forest addresses (zip / local split) and node trust classes
//! - [`header`] — the fixed packet header, checksums, full-packet codec
//! - [`payload`] — per-type payloads: SUB_UNSUB, CONNECT, RTE_REPLY, …
//! - [`signal`] — self-describing signalling payload for NET_SIG/CLIENT_SIG
//! - [`rates`] — rate specifications shared by tables and schedulers

pub mod addr;
pub mod header;
pub mod payload;
pub mod rates;
pub mod signal;

pub use addr::{Fadr, NodeType};
pub use header::{Flags, Header, Packet, PacketType};
pub use rates::RateSpec;

/// Comtree reserved for connect/disconnect traffic.
pub const CONNECT_COMT: u32 = 1;
/// Comtree reserved for client signalling.
pub const CLIENT_SIG_COMT: u32 = 2;
/// Comtree reserved for network signalling.
pub const NET_SIG_COMT: u32 = 100;

/// Signalling comtrees carry in-band control between leaves, routers and
/// controllers. Anything outside this range that carries NET_SIG traffic
/// is a comtree-control request for that comtree.
pub fn is_sig_comt(comt: u32) -> bool {
    (1..=NET_SIG_COMT).contains(&comt)
}

/// UDP port the network manager listens on.
pub const NM_PORT: u16 = 30120;
