//! # Reliable request/reply substrate
//!
//! Two halves. [`Repeater`] tracks the router's own outgoing requests: it
//! keeps a copy of each request keyed by sequence number, re-emits it on a
//! one-second timer, and gives up after three retries. [`RepeatHandler`]
//! caches incoming requests and their eventual replies keyed by (peer
//! address, sequence number), so a retransmitted request can be answered
//! from the cache instead of being executed twice.
//!
//! Both use a deadline heap with lazy deletion: the maps are authoritative
//! and stale heap entries are skipped when popped.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use forest_wire::Fadr;

use crate::Pktx;

/// Retries before an outgoing request is abandoned.
pub const MAX_RETRIES: u8 = 3;
/// Spacing between retransmissions.
pub const RETRY_NS: u64 = 1_000_000_000;
/// How long an incoming request (or its reply) stays cached.
pub const CACHE_NS: u64 = 20_000_000_000;

// ─── Repeater ────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct PendingReq {
    px: Pktx,
    /// Worker that originated the request (0 for router-internal traffic
    /// like sub/unsub propagation).
    thx: usize,
    retries_left: u8,
    deadline: u64,
}

/// What [`Repeater::overdue`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overdue {
    /// Retransmit a copy of this saved request.
    Retry(Pktx),
    /// Retry budget exhausted; the saved request is handed back along
    /// with the worker that originated it.
    GiveUp(Pktx, usize),
}

/// Outgoing-request tracker.
#[derive(Debug, Default)]
pub struct Repeater {
    reqs: HashMap<u64, PendingReq>,
    deadlines: BinaryHeap<Reverse<(u64, u64)>>,
}

impl Repeater {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save a copy of an outgoing request. Replaces any stale entry with
    /// the same sequence number.
    pub fn save_req(&mut self, px: Pktx, seq: u64, now: u64, thx: usize) {
        let deadline = now + RETRY_NS;
        self.reqs.insert(
            seq,
            PendingReq {
                px,
                thx,
                retries_left: MAX_RETRIES,
                deadline,
            },
        );
        self.deadlines.push(Reverse((deadline, seq)));
    }

    /// Match a reply to a saved request, removing it. Returns the saved
    /// packet and the originating worker.
    pub fn delete_match(&mut self, seq: u64) -> Option<(Pktx, usize)> {
        self.reqs.remove(&seq).map(|p| (p.px, p.thx))
    }

    /// Check the earliest deadline against `now`.
    pub fn overdue(&mut self, now: u64) -> Option<Overdue> {
        loop {
            let &Reverse((deadline, seq)) = self.deadlines.peek()?;
            if deadline > now {
                return None;
            }
            self.deadlines.pop();
            let Some(p) = self.reqs.get_mut(&seq) else {
                continue; // stale heap entry
            };
            if p.deadline != deadline {
                continue; // rescheduled since
            }
            if p.retries_left == 0 {
                let p = self.reqs.remove(&seq).expect("present above");
                return Some(Overdue::GiveUp(p.px, p.thx));
            }
            p.retries_left -= 1;
            p.deadline = now + RETRY_NS;
            let deadline = p.deadline;
            self.deadlines.push(Reverse((deadline, seq)));
            return Some(Overdue::Retry(p.px));
        }
    }

    pub fn len(&self) -> usize {
        self.reqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }
}

// ─── RepeatHandler ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct Cached {
    px: Pktx,
    /// True once the reply replaced the request.
    is_reply: bool,
    deadline: u64,
}

/// Incoming-request cache.
#[derive(Debug)]
pub struct RepeatHandler {
    cap: usize,
    map: HashMap<(Fadr, u64), Cached>,
    deadlines: BinaryHeap<Reverse<(u64, u32, u64)>>,
}

impl RepeatHandler {
    pub fn new(cap: usize) -> Self {
        RepeatHandler {
            cap,
            map: HashMap::new(),
            deadlines: BinaryHeap::new(),
        }
    }

    /// Look up a cached packet. Returns (packet, is_reply).
    pub fn find(&self, peer: Fadr, seq: u64) -> Option<(Pktx, bool)> {
        self.map.get(&(peer, seq)).map(|c| (c.px, c.is_reply))
    }

    /// Cache a copy of a freshly received request. When the cache is full
    /// the oldest entry is evicted and its packet returned for the caller
    /// to free.
    pub fn save_req(&mut self, cx: Pktx, peer: Fadr, seq: u64, now: u64) -> Option<Pktx> {
        let mut evicted = None;
        if self.map.len() >= self.cap {
            evicted = self.evict_oldest();
        }
        let deadline = now + CACHE_NS;
        self.map.insert(
            (peer, seq),
            Cached {
                px: cx,
                is_reply: false,
                deadline,
            },
        );
        self.deadlines.push(Reverse((deadline, peer.raw(), seq)));
        evicted
    }

    /// Replace a cached request with its reply, keeping the original
    /// expiry. Returns the request packet for the caller to free, or
    /// `None` if the request is no longer cached.
    pub fn save_rep(&mut self, cx: Pktx, peer: Fadr, seq: u64) -> Option<Pktx> {
        let c = self.map.get_mut(&(peer, seq))?;
        let old = c.px;
        c.px = cx;
        c.is_reply = true;
        Some(old)
    }

    /// Pop one expired entry, handing its packet back for the caller to
    /// free. Call repeatedly until it returns `None`.
    pub fn expired(&mut self, now: u64) -> Option<Pktx> {
        loop {
            let &Reverse((deadline, peer_raw, seq)) = self.deadlines.peek()?;
            if deadline > now {
                return None;
            }
            self.deadlines.pop();
            let key = (Fadr(peer_raw), seq);
            match self.map.get(&key) {
                Some(c) if c.deadline == deadline => {
                    let c = self.map.remove(&key).expect("present above");
                    return Some(c.px);
                }
                _ => continue, // stale heap entry
            }
        }
    }

    fn evict_oldest(&mut self) -> Option<Pktx> {
        loop {
            let Reverse((deadline, peer_raw, seq)) = self.deadlines.pop()?;
            let key = (Fadr(peer_raw), seq);
            match self.map.get(&key) {
                Some(c) if c.deadline == deadline => {
                    let c = self.map.remove(&key).expect("present above");
                    return Some(c.px);
                }
                _ => continue,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: u64 = 1_000_000_000;

    // ─── Repeater ────────────────────────────────────────────────────────

    #[test]
    fn retransmits_then_gives_up() {
        let mut r = Repeater::new();
        r.save_req(42, 7, 0, 3);

        // not due before one second
        assert_eq!(r.overdue(S - 1), None);

        // three retries at one-second spacing
        assert_eq!(r.overdue(S), Some(Overdue::Retry(42)));
        assert_eq!(r.overdue(S), None, "rescheduled, not due again yet");
        assert_eq!(r.overdue(2 * S), Some(Overdue::Retry(42)));
        assert_eq!(r.overdue(3 * S), Some(Overdue::Retry(42)));

        // fourth expiry surrenders the packet with its worker
        assert_eq!(r.overdue(4 * S), Some(Overdue::GiveUp(42, 3)));
        assert!(r.is_empty());
        assert_eq!(r.overdue(100 * S), None);
    }

    #[test]
    fn reply_cancels_retransmission() {
        let mut r = Repeater::new();
        r.save_req(42, 7, 0, 1);
        r.save_req(43, 8, 0, 2);

        assert_eq!(r.delete_match(7), Some((42, 1)));
        assert_eq!(r.delete_match(7), None, "already matched");

        // only the unmatched request still times out
        assert_eq!(r.overdue(10 * S), Some(Overdue::Retry(43)));
    }

    #[test]
    fn each_packet_under_one_seq() {
        let mut r = Repeater::new();
        r.save_req(10, 1, 0, 0);
        r.save_req(11, 2, 0, 0);
        r.save_req(12, 3, 0, 0);
        assert_eq!(r.len(), 3);
        // retransmit each once; all three distinct
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..3 {
            match r.overdue(S) {
                Some(Overdue::Retry(px)) => {
                    seen.insert(px);
                }
                other => panic!("expected retry, got {other:?}"),
            }
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(r.overdue(S), None);
    }

    // ─── RepeatHandler ───────────────────────────────────────────────────

    fn peer(n: u16) -> Fadr {
        Fadr::unicast(1, n)
    }

    #[test]
    fn caches_and_finds_requests() {
        let mut h = RepeatHandler::new(8);
        assert!(h.save_req(5, peer(1), 100, 0).is_none());
        assert_eq!(h.find(peer(1), 100), Some((5, false)));
        assert_eq!(h.find(peer(1), 101), None);
        assert_eq!(h.find(peer(2), 100), None);
    }

    #[test]
    fn reply_replaces_request() {
        let mut h = RepeatHandler::new(8);
        h.save_req(5, peer(1), 100, 0);
        assert_eq!(h.save_rep(9, peer(1), 100), Some(5));
        assert_eq!(h.find(peer(1), 100), Some((9, true)));
        // replying to something never cached is a no-op
        assert_eq!(h.save_rep(9, peer(1), 999), None);
    }

    #[test]
    fn entries_expire_after_twenty_seconds() {
        let mut h = RepeatHandler::new(8);
        h.save_req(5, peer(1), 100, 0);
        h.save_req(6, peer(2), 200, 5 * S);

        assert_eq!(h.expired(19 * S), None);
        assert_eq!(h.expired(20 * S), Some(5));
        assert_eq!(h.find(peer(1), 100), None, "expired entries are gone");
        assert_eq!(h.expired(20 * S), None);
        assert_eq!(h.expired(25 * S), Some(6));
        assert!(h.is_empty());
    }

    #[test]
    fn full_cache_evicts_oldest() {
        let mut h = RepeatHandler::new(2);
        h.save_req(1, peer(1), 100, 0);
        h.save_req(2, peer(2), 200, S);
        let evicted = h.save_req(3, peer(3), 300, 2 * S);
        assert_eq!(evicted, Some(1), "oldest entry makes room");
        assert_eq!(h.len(), 2);
        assert!(h.find(peer(1), 100).is_none());
        assert!(h.find(peer(2), 200).is_some());
        assert!(h.find(peer(3), 300).is_some());
    }

    #[test]
    fn reply_keeps_original_expiry() {
        let mut h = RepeatHandler::new(8);
        h.save_req(5, peer(1), 100, 0);
        h.save_rep(9, peer(1), 100);
        // the reply expires when the request would have
        assert_eq!(h.expired(20 * S), Some(9));
    }
}
