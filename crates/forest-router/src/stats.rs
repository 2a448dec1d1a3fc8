//! # Statistics and packet logging
//!
//! Per-link packet/byte counters split by peer class (router vs leaf),
//! discard counters by cause, a periodic JSON-lines stat file, and a
//! bounded in-memory packet trace dumped at shutdown.

use std::collections::BTreeMap;
use std::io::Write;

use forest_wire::{Fadr, PacketType};
use serde::Serialize;

/// Packet and byte totals for one direction/class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatCounts {
    pub pkts_in: u64,
    pub bytes_in: u64,
    pub pkts_out: u64,
    pub bytes_out: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LinkCounts {
    pub pkts_in: u64,
    pub bytes_in: u64,
    pub pkts_out: u64,
    pub bytes_out: u64,
    pub from_router: bool,
}

/// Why a packet was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropCause {
    Malformed,
    Untrusted,
    NoResources,
    NoRoute,
    QueueFull,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DropCounts {
    pub malformed: u64,
    pub untrusted: u64,
    pub no_resources: u64,
    pub no_route: u64,
    pub queue_full: u64,
}

/// Snapshot written to the stat file every recording interval.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub now_ns: u64,
    pub rtr: StatCounts,
    pub leaf: StatCounts,
    pub drops: DropCounts,
    pub links: BTreeMap<usize, LinkCounts>,
}

/// Counter module shared by the input and output threads (behind the
/// router's stats mutex).
#[derive(Debug, Default)]
pub struct StatsModule {
    rtr: StatCounts,
    leaf: StatCounts,
    drops: DropCounts,
    links: BTreeMap<usize, LinkCounts>,
}

impl StatsModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_in(&mut self, lnk: usize, bytes: usize, from_router: bool) {
        let agg = if from_router { &mut self.rtr } else { &mut self.leaf };
        agg.pkts_in += 1;
        agg.bytes_in += bytes as u64;
        let lc = self.links.entry(lnk).or_default();
        lc.pkts_in += 1;
        lc.bytes_in += bytes as u64;
        lc.from_router = from_router;
    }

    pub fn count_out(&mut self, lnk: usize, bytes: usize, to_router: bool) {
        let agg = if to_router { &mut self.rtr } else { &mut self.leaf };
        agg.pkts_out += 1;
        agg.bytes_out += bytes as u64;
        let lc = self.links.entry(lnk).or_default();
        lc.pkts_out += 1;
        lc.bytes_out += bytes as u64;
    }

    pub fn drop(&mut self, cause: DropCause) {
        match cause {
            DropCause::Malformed => self.drops.malformed += 1,
            DropCause::Untrusted => self.drops.untrusted += 1,
            DropCause::NoResources => self.drops.no_resources += 1,
            DropCause::NoRoute => self.drops.no_route += 1,
            DropCause::QueueFull => self.drops.queue_full += 1,
        }
    }

    pub fn link(&self, lnk: usize) -> LinkCounts {
        self.links.get(&lnk).copied().unwrap_or_default()
    }

    pub fn totals(&self) -> (StatCounts, StatCounts) {
        (self.rtr, self.leaf)
    }

    pub fn drops(&self) -> DropCounts {
        self.drops
    }

    pub fn snapshot(&self, now_ns: u64) -> StatsSnapshot {
        StatsSnapshot {
            now_ns,
            rtr: self.rtr,
            leaf: self.leaf,
            drops: self.drops,
            links: self.links.clone(),
        }
    }

    /// Append a JSON line for this instant to the stat sink.
    pub fn record(&self, now_ns: u64, sink: &mut impl Write) -> std::io::Result<()> {
        let snap = self.snapshot(now_ns);
        let line = serde_json::to_string(&snap).expect("counters always serialize");
        writeln!(sink, "{line}")
    }
}

// ─── PacketLog ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct LogEvent {
    pub now_ns: u64,
    pub lnk: usize,
    pub outbound: bool,
    pub ptype: PacketType,
    pub comtree: u32,
    pub src: Fadr,
    pub dst: Fadr,
    pub len: usize,
}

/// Bounded in-memory packet trace. Once full, later events are counted
/// but not stored.
#[derive(Debug)]
pub struct PacketLog {
    events: Vec<LogEvent>,
    cap: usize,
    overflow: u64,
}

impl PacketLog {
    pub fn new(cap: usize) -> Self {
        PacketLog {
            events: Vec::with_capacity(cap.min(4096)),
            cap,
            overflow: 0,
        }
    }

    pub fn log(&mut self, ev: LogEvent) {
        if self.events.len() < self.cap {
            self.events.push(ev);
        } else {
            self.overflow += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Dump the trace in arrival order.
    pub fn write(&self, out: &mut impl Write) -> std::io::Result<()> {
        for ev in &self.events {
            writeln!(
                out,
                "{:>12} {} lnk={} {:?} comt={} {}->{} len={}",
                ev.now_ns,
                if ev.outbound { "out" } else { "in " },
                ev.lnk,
                ev.ptype,
                ev.comtree,
                ev.src,
                ev.dst,
                ev.len
            )?;
        }
        if self.overflow > 0 {
            writeln!(out, "({} further events not recorded)", self.overflow)?;
        }
        Ok(())
    }
}
