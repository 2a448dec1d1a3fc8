//! # forest-router
//!
//! A multi-threaded software router for the Forest overlay network.
//!
//! The router terminates a set of UDP interfaces, maintains virtual links to
//! peers, forwards datagrams along comtrees (multicast distribution trees),
//! paces every link through a per-link WDRR scheduler with virtual-time
//! ordering, and processes in-band signalling through a pool of worker
//! threads.
//!
//! ## Crate structure
//!
//! - [`store`] — reference-counted packet descriptor pool
//! - [`listpair`] — in-use/free index partition (leaf addresses, workers)
//! - [`tables`] — interface, link, comtree and route tables
//! - [`qmgr`] — per-link WDRR scheduler with virtual time
//! - [`repeat`] — reliable request/reply substrate (retry + duplicate cache)
//! - [`stats`] — counters, stat file, packet log
//! - [`config`] — command-line and table-file configuration
//! - [`router`] — shared router state, setup, thread lifecycle
//! - [`input`] — input thread: receive, validate, dispatch
//! - [`output`] — output thread: forward, fan out, schedule, send
//! - [`control`] — worker threads for signalling transactions
//! - [`boot`] — remote boot handshake with the network manager
//!
//! Lock order everywhere: iface → link → comtree → route → packet store.

pub mod boot;
pub mod config;
pub mod control;
pub mod input;
pub mod listpair;
pub mod output;
pub mod qmgr;
pub mod repeat;
pub mod router;
pub mod stats;
pub mod store;
pub mod tables;

pub use config::RouterConfig;
pub use router::Router;

/// Packet descriptor index. Zero is never a valid index.
pub type Pktx = usize;
