//! # Input processor
//!
//! One thread owning the receive side of every interface socket. Each
//! datagram is decoded, attributed to a link, screened by trust class,
//! and dispatched: data and in-band control to the output thread through
//! the transfer queue, signalling requests to the worker pool, signalling
//! replies back to the worker that asked. The same loop drives the
//! repeater's retransmissions, the duplicate cache's expiry, and the
//! periodic statistics tick.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use forest_wire::signal::{SigMode, SigPacket};
use forest_wire::{
    is_sig_comt, Fadr, Header, Packet, PacketType, CLIENT_SIG_COMT, CONNECT_COMT,
};
use tracing::{debug, info, warn};

use crate::boot::{BootEvent, BootLink};
use crate::control::{spawn_workers, WorkerHandle, WorkerOut};
use crate::repeat::{Overdue, RepeatHandler};
use crate::router::Router;
use crate::stats::{DropCause, LogEvent};
use crate::Pktx;

/// Remembered-reply capacity of the duplicate cache.
pub const MAX_REPLIES: usize = 10_000;
/// Statistics cadence.
const STATS_TICK_NS: u64 = 300_000_000;
/// Idle sleep when a pass through the loop found nothing to do.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

pub struct InputProc {
    rtr: Arc<Router>,
    workers: Vec<WorkerHandle>,
    free_workers: Vec<usize>,
    comt_workers: HashMap<u32, usize>,
    ret_rx: Receiver<WorkerOut>,
    /// Handed to late-joining request originators (kept so the channel
    /// stays open while any worker is alive).
    _ret_tx: Sender<WorkerOut>,
    reph: RepeatHandler,
    sockets: Vec<(usize, Arc<UdpSocket>)>,
    sockets_gen: u64,
    next_sock: usize,
    buf: Box<[u8; 2048]>,
}

impl InputProc {
    pub fn new(rtr: Arc<Router>) -> Self {
        let (ret_tx, ret_rx) = unbounded();
        let workers = spawn_workers(&rtr, ret_tx.clone());
        let free_workers = (1..workers.len()).rev().collect();
        InputProc {
            rtr,
            workers,
            free_workers,
            comt_workers: HashMap::new(),
            ret_rx,
            _ret_tx: ret_tx,
            reph: RepeatHandler::new(MAX_REPLIES),
            sockets: Vec::new(),
            sockets_gen: u64::MAX,
            next_sock: 0,
            buf: Box::new([0u8; 2048]),
        }
    }

    /// Main input loop. Runs the boot handshake first in remote mode.
    pub fn run(mut self, run_ns: u64) -> Result<()> {
        let boot = if self.rtr.booting() {
            let boot = BootLink::open(&self.rtr)?;
            boot.start(&self.rtr)?;
            Some(boot)
        } else {
            None
        };

        let mut stats_time = 0u64;
        loop {
            let now = self.rtr.now_ns();
            if self.rtr.stopped() || (run_ns != 0 && now >= run_ns) {
                break;
            }

            let mut did_nothing = true;

            if self.rtr.booting() {
                match boot.as_ref().expect("booting implies a boot link").poll(&self.rtr)? {
                    BootEvent::Idle => {}
                    _ => did_nothing = false,
                }
            } else {
                if self.inbound(now) {
                    did_nothing = false;
                }
            }
            if self.outbound(now) {
                did_nothing = false;
            }

            if did_nothing {
                // quiet moment: give the repeater and the cache a turn
                let overdue = self.rtr.rptr.lock().unwrap().overdue(now);
                match overdue {
                    Some(Overdue::Retry(px)) => {
                        let cx = self.rtr.ps.lock().unwrap().clone_pkt(px);
                        if let Some(cx) = cx {
                            debug!("retransmitting request");
                            self.rtr.xfer_enq(cx);
                        }
                        did_nothing = false;
                    }
                    Some(Overdue::GiveUp(px, thx)) => {
                        self.give_up(px, thx);
                        did_nothing = false;
                    }
                    None => {}
                }
            }
            if did_nothing {
                if let Some(px) = self.reph.expired(now) {
                    self.rtr.ps.lock().unwrap().free(px);
                    did_nothing = false;
                }
            }

            if now - stats_time > STATS_TICK_NS {
                self.rtr.record_stats(now);
                stats_time = now;
                did_nothing = false;
            }

            if did_nothing {
                std::thread::sleep(IDLE_SLEEP);
            }
        }

        self.rtr.request_stop();
        info!("input thread stopping");
        // dropping the worker senders shuts the pool down
        for w in &mut self.workers {
            if let Some(h) = w.join.take() {
                let (tx, _) = crossbeam_channel::bounded(1);
                w.tx = tx;
                let _ = h.join();
            }
        }
        Ok(())
    }

    // ─── receive path ────────────────────────────────────────────────────

    /// Read and dispatch at most one datagram. Returns true if any
    /// datagram was consumed (even one that was dropped).
    fn inbound(&mut self, now: u64) -> bool {
        let gen = self.rtr.socket_generation();
        if gen != self.sockets_gen {
            self.sockets = self.rtr.sockets_snapshot();
            self.sockets_gen = gen;
            self.next_sock = 0;
        }
        let n_socks = self.sockets.len();
        if n_socks == 0 {
            return false;
        }
        for i in 0..n_socks {
            let idx = (self.next_sock + i) % n_socks;
            let (iface, sock) = &self.sockets[idx];
            let iface = *iface;
            match sock.recv_from(&mut self.buf[..]) {
                Ok((n, src)) => {
                    self.next_sock = (idx + 1) % n_socks;
                    self.handle_datagram(iface, n, src, now);
                    return true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    warn!(iface, error = %e, "socket receive failed");
                    continue;
                }
            }
        }
        false
    }

    fn handle_datagram(&mut self, iface: usize, n: usize, src: SocketAddr, now: u64) {
        let SocketAddr::V4(src) = src else { return };
        let Some(pkt) = Packet::decode(&self.buf[..n]) else {
            (*self.rtr.sm.lock().unwrap()).drop(DropCause::Malformed);
            return;
        };

        // attribute the datagram to a link
        let (lnk, from_router) = {
            let lt = self.rtr.lt.lock().unwrap();
            let mut lnk = lt.lookup(*src.ip(), src.port());
            if lnk.is_none() && pkt.header.ptype == PacketType::Connect {
                if let Some(body) = forest_wire::payload::ConnectBody::decode(&pkt.payload) {
                    lnk = lt.lookup_nonce(body.nonce);
                }
            }
            match lnk {
                Some(l) if lt.get(l).map(|e| e.iface) == Some(iface) => (
                    l,
                    lt.get(l).map(|e| e.peer_type == forest_wire::NodeType::Router)
                        == Some(true),
                ),
                _ => {
                    drop(lt);
                    debug!(%src, "datagram from unknown peer");
                    (*self.rtr.sm.lock().unwrap()).drop(DropCause::Untrusted);
                    return;
                }
            }
        };

        {
            let mut sm = self.rtr.sm.lock().unwrap();
            sm.count_in(lnk, n, from_router);
        }
        self.rtr.pkt_log.lock().unwrap().log(LogEvent {
            now_ns: now,
            lnk,
            outbound: false,
            ptype: pkt.header.ptype,
            comtree: pkt.header.comtree,
            src: pkt.header.src,
            dst: pkt.header.dst,
            len: n,
        });

        if !self.pkt_check(&pkt.header, &pkt.payload, lnk) {
            (*self.rtr.sm.lock().unwrap()).drop(DropCause::Untrusted);
            return;
        }

        let header = pkt.header;
        let px = {
            let mut ps = self.rtr.ps.lock().unwrap();
            match ps.alloc(pkt) {
                Some(px) => {
                    let d = ps.get_mut(px).expect("just allocated");
                    d.in_link = lnk;
                    d.tun = Some(SocketAddr::V4(src));
                    d.rcv_seq = self.rtr.next_rcv_seq();
                    px
                }
                None => {
                    drop(ps);
                    (*self.rtr.sm.lock().unwrap()).drop(DropCause::NoResources);
                    return;
                }
            }
        };
        self.dispatch(px, &header, now);
    }

    /// Validation beyond the checksums: per-type framing, comtree
    /// membership, and the trust-class rules for untrusted peers.
    fn pkt_check(&self, h: &Header, payload: &[u8], lnk: usize) -> bool {
        use PacketType::*;

        // connect traffic authenticates by nonce, not by header fields
        if h.ptype == Connect || h.ptype == Disconnect {
            return payload.len() == forest_wire::payload::ConnectBody::LEN
                && h.comtree == CONNECT_COMT;
        }
        if !h.dst.is_valid() {
            return false;
        }

        let lt = self.rtr.lt.lock().unwrap();
        let ctt = self.rtr.ctt.lock().unwrap();
        let Some(entry) = lt.get(lnk) else { return false };

        let ctx = ctt.get_comt_index(h.comtree);
        let cl = match ctx {
            Some(_) => {
                let Some(cl) = ctt.get_comt_link(h.comtree, lnk) else {
                    return false; // comtree exists but not on this link
                };
                Some(cl)
            }
            None => None,
        };

        if !entry.peer_type.is_trusted() {
            if !matches!(h.ptype, ClientData | SubUnsub | ClientSig) {
                return false;
            }
            if entry.peer_adr != h.src {
                return false; // spoofed source
            }
            match cl {
                None => return h.ptype == ClientSig && h.comtree == CLIENT_SIG_COMT,
                Some(cl) => {
                    let dest = ctt.clink(cl).map(|c| c.dest).unwrap_or(Fadr(0));
                    if dest.raw() != 0 && h.dst != dest && h.dst != self.rtr.my_adr() {
                        return false;
                    }
                    if h.ptype == ClientSig && h.comtree != CLIENT_SIG_COMT {
                        return false;
                    }
                }
            }
        } else if ctx.is_none() {
            // trusted peers may only signal outside configured comtrees
            return h.ptype == NetSig || h.ptype == ClientSig;
        }
        true
    }

    // ─── dispatch ────────────────────────────────────────────────────────

    fn dispatch(&mut self, px: Pktx, h: &Header, now: u64) {
        use PacketType::*;
        let my_adr = self.rtr.my_adr();
        match h.ptype {
            // in-band control is processed by the output thread under the
            // forwarding locks
            Connect | Disconnect | SubUnsub | RteReply => {
                self.rtr.xfer_enq(px);
            }
            NetSig | ClientSig if h.dst == my_adr => {
                self.signalling(px, h, now);
            }
            _ => {
                if h.dst == my_adr && !h.dst.is_mcast() {
                    // data addressed to the router itself has nowhere to go
                    self.rtr.ps.lock().unwrap().free(px);
                    (*self.rtr.sm.lock().unwrap()).drop(DropCause::NoRoute);
                } else {
                    self.rtr.xfer_enq(px);
                }
            }
        }
    }

    /// A signalling packet addressed to this router.
    fn signalling(&mut self, px: Pktx, h: &Header, now: u64) {
        let sig = {
            let ps = self.rtr.ps.lock().unwrap();
            ps.get(px).and_then(|d| SigPacket::decode(&d.pkt.payload))
        };
        let Some(sig) = sig else {
            self.rtr.ps.lock().unwrap().free(px);
            (*self.rtr.sm.lock().unwrap()).drop(DropCause::Malformed);
            return;
        };

        if sig.mode != SigMode::Request {
            // a reply to something we sent earlier
            let deleted = self.rtr.rptr.lock().unwrap().delete_match(sig.seq);
            match deleted {
                Some((saved, thx)) => {
                    self.rtr.ps.lock().unwrap().free(saved);
                    let rcv_seq = self
                        .rtr
                        .ps
                        .lock()
                        .unwrap()
                        .get(px)
                        .map(|d| d.rcv_seq)
                        .unwrap_or(0);
                    self.enqueue_to_worker(thx, px, rcv_seq);
                }
                None => {
                    debug!(seq = sig.seq, "reply with no matching request");
                    self.rtr.ps.lock().unwrap().free(px);
                }
            }
            return;
        }

        // duplicate suppression
        if let Some((saved, is_reply)) = self.reph.find(h.src, sig.seq) {
            if is_reply {
                // answered before: repeat the cached reply verbatim
                let cx = self.rtr.ps.lock().unwrap().clone_pkt(saved);
                if let Some(cx) = cx {
                    self.rtr.xfer_enq(cx);
                }
            }
            // else: a worker is still on it; the reply will come
            self.rtr.ps.lock().unwrap().free(px);
            return;
        }

        // fresh request: remember it, then find it a worker
        let (cx, rcv_seq) = {
            let mut ps = self.rtr.ps.lock().unwrap();
            let rcv_seq = ps.get(px).map(|d| d.rcv_seq).unwrap_or(0);
            (ps.clone_pkt(px), rcv_seq)
        };
        if let Some(cx) = cx {
            if let Some(evicted) = self.reph.save_req(cx, h.src, sig.seq, now) {
                self.rtr.ps.lock().unwrap().free(evicted);
            }
        }

        let thx = if is_sig_comt(h.comtree) {
            self.free_workers.pop()
        } else {
            // comtree control: all operations on one comtree share a worker
            match self.comt_workers.get(&h.comtree) {
                Some(&thx) => Some(thx),
                None => match self.free_workers.pop() {
                    Some(thx) => {
                        self.comt_workers.insert(h.comtree, thx);
                        self.workers[thx].bound_comt = Some(h.comtree);
                        Some(thx)
                    }
                    None => None,
                },
            }
        };
        match thx {
            Some(thx) => self.enqueue_to_worker(thx, px, rcv_seq),
            None => self.too_busy(px, &sig, h),
        }
    }

    fn enqueue_to_worker(&mut self, thx: usize, px: Pktx, rcv_seq: u64) {
        self.workers[thx].rcv_seq = rcv_seq;
        if self.workers[thx].tx.send(px).is_err() {
            warn!(thx, "worker queue closed");
            self.rtr.ps.lock().unwrap().free(px);
        }
    }

    /// All workers busy: answer with a negative reply right away.
    fn too_busy(&mut self, px: Pktx, sig: &SigPacket, h: &Header) {
        let mut ps = self.rtr.ps.lock().unwrap();
        if let Some(d) = ps.get_mut(px) {
            d.pkt.payload = sig.neg_reply("too busy to handle request, retry later").encode();
            d.pkt.header.dst = h.src;
            d.pkt.header.src = self.rtr.my_adr();
            d.out_link = d.in_link;
        }
        drop(ps);
        (*self.rtr.sm.lock().unwrap()).drop(DropCause::NoResources);
        self.rtr.xfer_enq(px);
    }

    // ─── worker return path ──────────────────────────────────────────────

    /// Process at most one message from the worker pool.
    fn outbound(&mut self, now: u64) -> bool {
        let Ok(msg) = self.ret_rx.try_recv() else {
            return false;
        };
        match msg {
            WorkerOut::Release { thx, rcv_seq } => {
                // only release once nothing later is queued for the worker
                if self.workers[thx].rcv_seq == rcv_seq {
                    if let Some(comt) = self.workers[thx].bound_comt.take() {
                        self.comt_workers.remove(&comt);
                    }
                    if !self.free_workers.contains(&thx) {
                        self.free_workers.push(thx);
                    }
                }
            }
            WorkerOut::Packet { thx, px } => self.worker_packet(thx, px, now),
        }
        true
    }

    fn worker_packet(&mut self, thx: usize, px: Pktx, now: u64) {
        let sig = {
            let ps = self.rtr.ps.lock().unwrap();
            ps.get(px).and_then(|d| SigPacket::decode(&d.pkt.payload))
        };
        let Some(mut sig) = sig else {
            // not signalling; send it as-is
            self.rtr.xfer_enq(px);
            return;
        };
        match sig.mode {
            SigMode::Request => {
                // worker-originated request: stamp a sequence number,
                // send a copy, keep the original for retransmission
                sig.seq = self.rtr.next_seq();
                let cx = {
                    let mut ps = self.rtr.ps.lock().unwrap();
                    if let Some(d) = ps.get_mut(px) {
                        d.pkt.payload = sig.encode();
                    }
                    ps.clone_pkt(px)
                };
                if let Some(cx) = cx {
                    self.rtr.xfer_enq(cx);
                }
                self.rtr.rptr.lock().unwrap().save_req(px, sig.seq, now, thx);
            }
            _ => {
                // a reply: send a copy, cache the original against repeats
                let (cx, dst) = {
                    let mut ps = self.rtr.ps.lock().unwrap();
                    let dst = ps.get(px).map(|d| d.pkt.header.dst).unwrap_or(Fadr(0));
                    (ps.clone_pkt(px), dst)
                };
                if let Some(cx) = cx {
                    self.rtr.xfer_enq(cx);
                }
                match self.reph.save_rep(px, dst, sig.seq) {
                    Some(old_req) => {
                        self.rtr.ps.lock().unwrap().free(old_req);
                    }
                    None => {
                        // request fell out of the cache; nothing to pin
                        self.rtr.ps.lock().unwrap().free(px);
                    }
                }
            }
        }
    }

    /// The repeater ran out of retries for a worker-originated request:
    /// hand the saved request back to its worker as a NO_REPLY notice.
    fn give_up(&mut self, px: Pktx, thx: usize) {
        if thx == 0 {
            // router-internal traffic (subscription propagation): let go
            self.rtr.ps.lock().unwrap().free(px);
            return;
        }
        warn!(thx, "request went unanswered, notifying worker");
        let rcv_seq = self.rtr.next_rcv_seq();
        {
            let mut ps = self.rtr.ps.lock().unwrap();
            let Some(d) = ps.get_mut(px) else { return };
            if let Some(mut sig) = SigPacket::decode(&d.pkt.payload) {
                sig.mode = SigMode::NoReply;
                d.pkt.payload = sig.encode();
            }
            d.rcv_seq = rcv_seq;
        }
        self.enqueue_to_worker(thx, px, rcv_seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;
    use bytes::Bytes;
    use forest_wire::{NodeType, RateSpec};
    use std::net::Ipv4Addr;

    fn test_router() -> Arc<Router> {
        let cfg = RouterConfig {
            my_adr: Fadr::unicast(1, 1),
            first_leaf_adr: Fadr::unicast(1, 16),
            last_leaf_adr: Fadr::unicast(1, 31),
            ..RouterConfig::default()
        };
        let rtr = Arc::new(Router::new(cfg));
        {
            let mut ift = rtr.ift.lock().unwrap();
            ift.add_entry(1, Ipv4Addr::LOCALHOST, 0, RateSpec::symmetric(100_000, 50_000))
                .unwrap();
            let mut lt = rtr.lt.lock().unwrap();
            lt.add_entry(
                3,
                1,
                Ipv4Addr::LOCALHOST,
                42001,
                NodeType::Client,
                Fadr::unicast(1, 16),
                RateSpec::symmetric(1_000, 500),
                33,
            )
            .unwrap();
            lt.add_entry(
                4,
                1,
                Ipv4Addr::LOCALHOST,
                42002,
                NodeType::Router,
                Fadr::unicast(2, 1),
                RateSpec::symmetric(10_000, 5_000),
                44,
            )
            .unwrap();
            let mut ctt = rtr.ctt.lock().unwrap();
            let ctx = ctt.add_entry(100).unwrap();
            ctt.add_link(ctx, 3, false, false, &mut lt).unwrap();
            ctt.add_link(ctx, 4, true, false, &mut lt).unwrap();
        }
        rtr
    }

    fn data_header(comtree: u32, src: Fadr, dst: Fadr) -> Header {
        Header::new(PacketType::ClientData, comtree, src, dst, 0)
    }

    #[test]
    fn pkt_check_accepts_well_formed_client_data() {
        let rtr = test_router();
        let inp = InputProc::new(rtr);
        let h = data_header(100, Fadr::unicast(1, 16), Fadr::unicast(2, 5));
        assert!(inp.pkt_check(&h, &[], 3));
    }

    #[test]
    fn pkt_check_rejects_spoofed_source() {
        let rtr = test_router();
        let inp = InputProc::new(rtr);
        // client on link 3 claims someone else's address
        let h = data_header(100, Fadr::unicast(1, 17), Fadr::unicast(2, 5));
        assert!(!inp.pkt_check(&h, &[], 3));
    }

    #[test]
    fn pkt_check_rejects_foreign_comtree() {
        let rtr = test_router();
        let inp = InputProc::new(rtr);
        let h = data_header(200, Fadr::unicast(1, 16), Fadr::unicast(2, 5));
        assert!(!inp.pkt_check(&h, &[], 3));
    }

    #[test]
    fn pkt_check_rejects_untrusted_net_sig() {
        let rtr = test_router();
        let inp = InputProc::new(rtr);
        let h = Header::new(
            PacketType::NetSig,
            100,
            Fadr::unicast(1, 16),
            Fadr::unicast(1, 1),
            0,
        );
        assert!(!inp.pkt_check(&h, &[], 3));
        // but the router peer may signal
        let h = Header::new(
            PacketType::NetSig,
            100,
            Fadr::unicast(2, 1),
            Fadr::unicast(1, 1),
            0,
        );
        assert!(inp.pkt_check(&h, &[], 4));
    }

    #[test]
    fn pkt_check_connect_framing() {
        let rtr = test_router();
        let inp = InputProc::new(rtr);
        let h = Header::new(
            PacketType::Connect,
            CONNECT_COMT,
            Fadr::unicast(1, 16),
            Fadr::unicast(1, 1),
            8,
        );
        assert!(inp.pkt_check(&h, &[0u8; 8], 3));
        assert!(!inp.pkt_check(&h, &[0u8; 7], 3), "short nonce");
        let h2 = Header::new(
            PacketType::Connect,
            100,
            Fadr::unicast(1, 16),
            Fadr::unicast(1, 1),
            8,
        );
        assert!(!inp.pkt_check(&h2, &[0u8; 8], 3), "wrong comtree");
    }

    #[test]
    fn duplicate_request_with_cached_reply_is_replayed() {
        let rtr = test_router();
        let mut inp = InputProc::new(Arc::clone(&rtr));
        let peer = Fadr::unicast(2, 1);

        // cache a request and its reply, as the normal path would
        let (req_px, rep_px) = {
            let mut ps = rtr.ps.lock().unwrap();
            let req = ps
                .alloc(Packet::new(
                    PacketType::NetSig,
                    100,
                    peer,
                    Fadr::unicast(1, 1),
                    Bytes::new(),
                ))
                .unwrap();
            let rep = ps
                .alloc(Packet::new(
                    PacketType::NetSig,
                    100,
                    Fadr::unicast(1, 1),
                    peer,
                    Bytes::from_static(b"reply"),
                ))
                .unwrap();
            (req, rep)
        };
        inp.reph.save_req(req_px, peer, 7, 0);
        let old = inp.reph.save_rep(rep_px, peer, 7).unwrap();
        assert_eq!(old, req_px);
        rtr.ps.lock().unwrap().free(old);

        // the repeated request is answered from the cache
        let dup = {
            let mut ps = rtr.ps.lock().unwrap();
            let mut sig = SigPacket::new(
                forest_wire::signal::SigType::GetLink,
                SigMode::Request,
                7,
            );
            sig.set(forest_wire::signal::SigAttr::Link, 3);
            ps.alloc(Packet::new(
                PacketType::NetSig,
                100,
                peer,
                Fadr::unicast(1, 1),
                sig.encode(),
            ))
            .unwrap()
        };
        let h = Header::new(
            PacketType::NetSig,
            100,
            peer,
            Fadr::unicast(1, 1),
            0,
        );
        inp.signalling(dup, &h, 1_000);

        // a clone of the cached reply is on the transfer queue
        let out = rtr.xfer_try_deq().expect("cached reply resent");
        let ps = rtr.ps.lock().unwrap();
        assert_eq!(ps.get(out).unwrap().pkt.payload, &b"reply"[..]);
        // and no worker was consumed
        assert_eq!(inp.free_workers.len(), crate::control::NUM_WORKERS);
    }

    #[test]
    fn busy_pool_returns_negative_reply() {
        let rtr = test_router();
        let mut inp = InputProc::new(Arc::clone(&rtr));
        inp.free_workers.clear(); // simulate exhaustion

        let peer = Fadr::unicast(2, 1);
        let sig = SigPacket::new(
            forest_wire::signal::SigType::GetLink,
            SigMode::Request,
            42,
        );
        let px = {
            let mut ps = rtr.ps.lock().unwrap();
            let px = ps
                .alloc(Packet::new(
                    PacketType::NetSig,
                    100,
                    peer,
                    Fadr::unicast(1, 1),
                    sig.encode(),
                ))
                .unwrap();
            ps.get_mut(px).unwrap().in_link = 4;
            px
        };
        let h = Header::new(PacketType::NetSig, 100, peer, Fadr::unicast(1, 1), 0);
        inp.signalling(px, &h, 0);

        let out = rtr.xfer_try_deq().expect("negative reply queued");
        let ps = rtr.ps.lock().unwrap();
        let d = ps.get(out).unwrap();
        assert_eq!(d.pkt.header.dst, peer);
        assert_eq!(d.out_link, 4);
        let rep = SigPacket::decode(&d.pkt.payload).unwrap();
        assert_eq!(rep.mode, SigMode::NegReply);
        assert_eq!(rep.seq, 42);
        assert!(rep.err_msg().unwrap().contains("busy"));
    }

    #[test]
    fn comtree_requests_bind_to_one_worker() {
        let rtr = test_router();
        let mut inp = InputProc::new(Arc::clone(&rtr));

        let mk = |seq: u64| {
            let sig = SigPacket::new(
                forest_wire::signal::SigType::AddComtreeLink,
                SigMode::Request,
                seq,
            );
            let mut ps = rtr.ps.lock().unwrap();
            let px = ps
                .alloc(Packet::new(
                    PacketType::NetSig,
                    500, // not a signalling comtree → comtree control
                    Fadr::unicast(2, 1),
                    Fadr::unicast(1, 1),
                    sig.encode(),
                ))
                .unwrap();
            ps.get_mut(px).unwrap().rcv_seq = seq;
            px
        };
        let h = Header::new(
            PacketType::NetSig,
            500,
            Fadr::unicast(2, 1),
            Fadr::unicast(1, 1),
            0,
        );
        inp.signalling(mk(1), &h, 0);
        let bound = *inp.comt_workers.get(&500).expect("worker bound");
        inp.signalling(mk(2), &h, 0);
        assert_eq!(*inp.comt_workers.get(&500).unwrap(), bound);
        // a release with a stale watermark must not free the worker
        inp.workers[bound].rcv_seq = 2;
        let was_free = inp.free_workers.contains(&bound);
        assert!(!was_free);
    }

    #[test]
    fn give_up_rewrites_mode_for_worker() {
        let rtr = test_router();
        let mut inp = InputProc::new(Arc::clone(&rtr));
        let sig = SigPacket::new(
            forest_wire::signal::SigType::ModComtree,
            SigMode::Request,
            9,
        );
        let px = {
            let mut ps = rtr.ps.lock().unwrap();
            ps.alloc(Packet::new(
                PacketType::NetSig,
                500,
                Fadr::unicast(1, 1),
                Fadr::unicast(2, 1),
                sig.encode(),
            ))
            .unwrap()
        };
        // intercept worker 1's queue so the live thread cannot race us
        let (tx, rx) = crossbeam_channel::bounded(4);
        inp.workers[1].tx = tx;

        inp.give_up(px, 1);
        let got = rx.try_recv().expect("worker got the notice");
        assert_eq!(got, px);
        let ps = rtr.ps.lock().unwrap();
        let d = ps.get(px).unwrap();
        let s = SigPacket::decode(&d.pkt.payload).unwrap();
        assert_eq!(s.mode, SigMode::NoReply);
    }
}
