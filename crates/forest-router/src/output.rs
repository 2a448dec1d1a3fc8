//! # Output processor
//!
//! One thread draining the transfer queue and the scheduler. Packets from
//! the transfer queue are either enqueued straight onto their chosen link
//! or run through the forwarder, which resolves routes, performs
//! multicast fan-out (sharing payload buffers), and handles the in-band
//! control types — subscriptions, connects, route replies — under the
//! link/comtree/route locks. Scheduled packets are then sent on the
//! interface socket of their link.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use forest_wire::payload::{ConnectBody, RteReply, SubUnsub, UnknownDest};
use forest_wire::{Fadr, NodeType, Packet, PacketType};
use tracing::{debug, error, info, warn};

use crate::router::Router;
use crate::stats::{DropCause, LogEvent};
use crate::tables::route::RouteLinks;
use crate::tables::{ComtreeTable, LinkTable, RouteTable};
use crate::Pktx;

/// Retries tolerated when the socket send buffer is momentarily full.
const SEND_RETRIES: usize = 10;
/// Idle sleep when neither the transfer queue nor the scheduler had work.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

pub struct OutputProc {
    rtr: Arc<Router>,
}

impl OutputProc {
    pub fn new(rtr: Arc<Router>) -> Self {
        OutputProc { rtr }
    }

    /// Main output loop.
    pub fn run(self, run_ns: u64) {
        loop {
            let now = self.rtr.now_ns();
            if self.rtr.stopped() || (run_ns != 0 && now >= run_ns) {
                break;
            }
            let mut did_nothing = true;

            if let Some(px) = self.rtr.xfer_try_deq() {
                self.process(px, now);
                did_nothing = false;
            }
            while let Some((px, lnk)) = self.rtr.qm.deq(now) {
                self.send(px, lnk, now);
                did_nothing = false;
            }

            if did_nothing {
                std::thread::sleep(IDLE_SLEEP);
            }
        }
        self.rtr.request_stop();
        info!("output thread stopping");
    }

    /// One packet off the transfer queue.
    fn process(&self, px: Pktx, now: u64) {
        let (ptype, out_link) = {
            let ps = self.rtr.ps.lock().unwrap();
            let Some(d) = ps.get(px) else { return };
            (d.pkt.header.ptype, d.out_link)
        };

        if out_link != 0 {
            // the sender already chose the link (worker replies, acks)
            self.enq_direct(px, out_link, now);
            return;
        }
        match ptype {
            PacketType::SubUnsub => self.sub_unsub(px, now),
            PacketType::Connect | PacketType::Disconnect => self.conn_disc(px, now),
            PacketType::RteReply => self.rte_reply(px, now),
            _ => self.forward(px, now),
        }
    }

    // ─── plain forwarding ────────────────────────────────────────────────

    fn forward(&self, px: Pktx, now: u64) {
        let lt = self.rtr.lt.lock().unwrap();
        let ctt = self.rtr.ctt.lock().unwrap();
        let rt = self.rtr.rt.lock().unwrap();

        let (header, in_link, wire_len) = {
            let ps = self.rtr.ps.lock().unwrap();
            let Some(d) = ps.get(px) else { return };
            (d.pkt.header, d.in_link, d.pkt.wire_len())
        };
        let comt = header.comtree;
        let Some(ctx) = ctt.get_comt_index(comt) else {
            self.drop_pkt(px, DropCause::NoRoute);
            return;
        };

        if header.dst.is_mcast() {
            self.multicast(&lt, &ctt, &rt, px, ctx, &header, in_link, wire_len, now);
            return;
        }

        match rt.lookup(comt, header.dst) {
            Some(RouteLinks::Unicast(cl)) => {
                let cle = ctt.clink(*cl).expect("route checked at insert");
                if cle.lnk == in_link {
                    // would go straight back where it came from
                    self.drop_pkt(px, DropCause::NoRoute);
                    return;
                }
                if header.flags.rte_req() {
                    self.send_rte_reply(&lt, &ctt, &header, in_link, now);
                    let mut ps = self.rtr.ps.lock().unwrap();
                    if let Some(d) = ps.get_mut(px) {
                        d.pkt.header.flags.set_rte_req(false);
                    }
                }
                self.enq(px, cle.qid, wire_len, now);
            }
            Some(RouteLinks::Multicast(_)) => {
                // unicast destination with a multicast route cannot happen;
                // the tables refuse it at insert
                self.drop_pkt(px, DropCause::NoRoute);
            }
            None => {
                let my_adr = self.rtr.my_adr();
                let local_leaf = header.dst.zip() == my_adr.zip()
                    && self
                        .rtr
                        .leaf_adr
                        .lock()
                        .unwrap()
                        .as_ref()
                        .map(|p| p.in_range(header.dst))
                        .unwrap_or(false);
                if local_leaf {
                    // one of ours, but nobody by that name is attached
                    self.send_unknown_dest(&lt, &ctt, &header, in_link, now);
                    self.drop_pkt(px, DropCause::NoRoute);
                } else {
                    self.flood_route_request(&lt, &ctt, px, ctx, &header, in_link, wire_len, now);
                }
            }
        }
    }

    /// Multicast fan-out: core neighbours (except the inbound link and
    /// the parent), the parent, and every subscribed downstream link.
    #[allow(clippy::too_many_arguments)]
    fn multicast(
        &self,
        _lt: &LinkTable,
        ctt: &ComtreeTable,
        rt: &RouteTable,
        px: Pktx,
        ctx: usize,
        header: &forest_wire::Header,
        in_link: usize,
        wire_len: usize,
        now: u64,
    ) {
        let e = ctt.entry(ctx).expect("resolved by caller");
        let plnk = e.plnk;
        let parent_cl = if plnk != 0 {
            ctt.get_comt_link(header.comtree, plnk)
        } else {
            None
        };

        let mut targets: Vec<usize> = Vec::new();
        for &cl in &e.core_links {
            if Some(cl) == parent_cl || ctt.link(cl) == in_link {
                continue;
            }
            targets.push(cl);
        }
        if let Some(pcl) = parent_cl {
            if plnk != in_link {
                targets.push(pcl);
            }
        }
        if let Some(RouteLinks::Multicast(subs)) = rt.lookup(header.comtree, header.dst) {
            for &cl in subs {
                if ctt.link(cl) != in_link && !targets.contains(&cl) {
                    targets.push(cl);
                }
            }
        }

        if targets.is_empty() {
            self.drop_pkt(px, DropCause::NoRoute);
            return;
        }
        // clones share the payload buffer; the original goes out last
        let (last, rest) = targets.split_last().expect("non-empty");
        for &cl in rest {
            let cx = self.rtr.ps.lock().unwrap().clone_pkt(px);
            match cx {
                Some(cx) => self.enq(cx, ctt.clink(cl).expect("target").qid, wire_len, now),
                None => {
                    (*self.rtr.sm.lock().unwrap()).drop(DropCause::NoResources);
                }
            }
        }
        self.enq(px, ctt.clink(*last).expect("target").qid, wire_len, now);
    }

    /// No route: mark the packet as a route request and flood it to
    /// router neighbours. A destination in our own zip can only be
    /// reached through neighbours in that zip.
    #[allow(clippy::too_many_arguments)]
    fn flood_route_request(
        &self,
        lt: &LinkTable,
        ctt: &ComtreeTable,
        px: Pktx,
        ctx: usize,
        header: &forest_wire::Header,
        in_link: usize,
        wire_len: usize,
        now: u64,
    ) {
        let my_adr = self.rtr.my_adr();
        let same_zip_only = header.dst.zip() == my_adr.zip();
        let e = ctt.entry(ctx).expect("resolved by caller");

        let mut targets: Vec<usize> = Vec::new();
        for &cl in &e.rtr_links {
            let lnk = ctt.link(cl);
            if lnk == in_link {
                continue;
            }
            if same_zip_only {
                let peer_zip = lt.get(lnk).map(|p| p.peer_adr.zip()).unwrap_or(0);
                if peer_zip != my_adr.zip() {
                    continue;
                }
            }
            targets.push(cl);
        }
        if targets.is_empty() {
            self.drop_pkt(px, DropCause::NoRoute);
            return;
        }

        {
            let mut ps = self.rtr.ps.lock().unwrap();
            if let Some(d) = ps.get_mut(px) {
                d.pkt.header.flags.set_rte_req(true);
            }
        }
        let (last, rest) = targets.split_last().expect("non-empty");
        for &cl in rest {
            let cx = self.rtr.ps.lock().unwrap().clone_pkt(px);
            match cx {
                Some(cx) => self.enq(cx, ctt.clink(cl).expect("target").qid, wire_len, now),
                None => {
                    (*self.rtr.sm.lock().unwrap()).drop(DropCause::NoResources);
                }
            }
        }
        self.enq(px, ctt.clink(*last).expect("target").qid, wire_len, now);
    }

    /// Answer a route request we can satisfy: tell the source where the
    /// destination lives, back along the inbound link.
    fn send_rte_reply(
        &self,
        lt: &LinkTable,
        ctt: &ComtreeTable,
        header: &forest_wire::Header,
        in_link: usize,
        now: u64,
    ) {
        let body = RteReply { dest: header.dst };
        let pkt = Packet::new(
            PacketType::RteReply,
            header.comtree,
            self.rtr.my_adr(),
            header.src,
            body.encode(),
        );
        let wire_len = pkt.wire_len();
        let px = match self.rtr.ps.lock().unwrap().alloc(pkt) {
            Some(px) => px,
            None => {
                (*self.rtr.sm.lock().unwrap()).drop(DropCause::NoResources);
                return;
            }
        };
        let qid = self.qid_toward(lt, ctt, header.comtree, in_link);
        self.enq(px, qid, wire_len, now);
    }

    fn send_unknown_dest(
        &self,
        lt: &LinkTable,
        ctt: &ComtreeTable,
        header: &forest_wire::Header,
        in_link: usize,
        now: u64,
    ) {
        let body = UnknownDest { dest: header.dst };
        let pkt = Packet::new(
            PacketType::UnknownDest,
            header.comtree,
            self.rtr.my_adr(),
            header.src,
            body.encode(),
        );
        let wire_len = pkt.wire_len();
        let px = match self.rtr.ps.lock().unwrap().alloc(pkt) {
            Some(px) => px,
            None => return,
        };
        let qid = self.qid_toward(lt, ctt, header.comtree, in_link);
        self.enq(px, qid, wire_len, now);
    }

    // ─── subscriptions ───────────────────────────────────────────────────

    /// SUB_UNSUB: update multicast routes for the inbound link, answer
    /// with an ack, and propagate genuine changes toward the comtree root.
    fn sub_unsub(&self, px: Pktx, now: u64) {
        let (header, in_link, body) = {
            let ps = self.rtr.ps.lock().unwrap();
            let Some(d) = ps.get(px) else { return };
            (d.pkt.header, d.in_link, SubUnsub::decode(&d.pkt.payload))
        };
        let Some(body) = body else {
            self.drop_pkt(px, DropCause::Malformed);
            return;
        };

        // an ack settles our own earlier upward subscription
        if header.flags.ack() {
            if let Some((saved, _)) = self.rtr.rptr.lock().unwrap().delete_match(body.seq) {
                self.rtr.ps.lock().unwrap().free(saved);
            }
            self.rtr.ps.lock().unwrap().free(px);
            return;
        }

        let lt = self.rtr.lt.lock().unwrap();
        let mut ctt = self.rtr.ctt.lock().unwrap();
        let mut rt = self.rtr.rt.lock().unwrap();

        let comt = header.comtree;
        let (Some(ctx), Some(cl)) = (
            ctt.get_comt_index(comt),
            ctt.get_comt_link(comt, in_link),
        ) else {
            drop(rt);
            drop(ctt);
            drop(lt);
            self.drop_pkt(px, DropCause::Untrusted);
            return;
        };

        let e = ctt.entry(ctx).expect("resolved above");
        let from_parent = e.plnk == in_link;
        let from_core = e.core_links.contains(&cl);
        let in_core = e.in_core;
        let plnk = e.plnk;

        let mut new_adds: Vec<Fadr> = Vec::new();
        let mut gone_drops: Vec<Fadr> = Vec::new();

        if !(from_parent || from_core) {
            for &a in &body.adds {
                match rt.lookup(comt, a) {
                    None => {
                        if rt.add_route(comt, a, cl).is_ok() {
                            ctt.register_rte(cl, a);
                            new_adds.push(a);
                        }
                    }
                    Some(_) => {
                        if rt.add_link(comt, a, cl).unwrap_or(false) {
                            ctt.register_rte(cl, a);
                        }
                    }
                }
            }
            for &d in &body.drops {
                match rt.remove_link(comt, d, cl) {
                    Ok(route_gone) => {
                        ctt.deregister_rte(cl, d);
                        if route_gone {
                            gone_drops.push(d);
                        }
                    }
                    Err(_) => {} // double unsubscribe is a no-op
                }
            }
        } else {
            debug!(comt, in_link, "subscription from parent or core ignored");
        }

        // ack the sender with a copy of what we processed
        let ack_qid = self.qid_toward(&lt, &ctt, comt, in_link);
        let ack = {
            let mut ps = self.rtr.ps.lock().unwrap();
            match ps.clone_pkt(px) {
                Some(ack) => {
                    let d = ps.get_mut(ack).expect("just cloned");
                    d.pkt.header.flags.set_ack(true);
                    d.pkt.header.dst = d.pkt.header.src;
                    d.pkt.header.src = self.rtr.my_adr();
                    Some((ack, d.pkt.wire_len()))
                }
                None => None,
            }
        };
        if let Some((ack, len)) = ack {
            self.enq(ack, ack_qid, len, now);
        }

        // pass real changes up toward the root
        let propagate = !in_core && plnk != 0 && !(new_adds.is_empty() && gone_drops.is_empty());
        if propagate {
            let parent_adr = lt.get(plnk).map(|p| p.peer_adr).unwrap_or(Fadr(0));
            let up_qid = ctt
                .get_comt_link(comt, plnk)
                .and_then(|pcl| ctt.clink(pcl))
                .map(|c| c.qid)
                .unwrap_or(0);
            let seq = self.rtr.next_seq();
            let up = SubUnsub {
                seq,
                adds: new_adds,
                drops: gone_drops,
            };
            let pkt = Packet::new(
                PacketType::SubUnsub,
                comt,
                self.rtr.my_adr(),
                parent_adr,
                up.encode(),
            );
            let wire_len = pkt.wire_len();
            let saved = {
                let mut ps = self.rtr.ps.lock().unwrap();
                match ps.alloc(pkt) {
                    Some(upx) => {
                        // retransmit clones must skip the forwarder
                        ps.get_mut(upx).expect("just allocated").out_link = plnk;
                        ps.clone_pkt(upx).map(|cx| (upx, cx))
                    }
                    None => None,
                }
            };
            if let Some((upx, cx)) = saved {
                self.enq(cx, up_qid, wire_len, now);
                self.rtr.rptr.lock().unwrap().save_req(upx, seq, now, 0);
            }
        }

        drop(rt);
        drop(ctt);
        drop(lt);
        self.rtr.ps.lock().unwrap().free(px);
    }

    // ─── connect / disconnect ────────────────────────────────────────────

    fn conn_disc(&self, px: Pktx, now: u64) {
        let (header, in_link, tun, body) = {
            let ps = self.rtr.ps.lock().unwrap();
            let Some(d) = ps.get(px) else { return };
            (
                d.pkt.header,
                d.in_link,
                d.tun,
                ConnectBody::decode(&d.pkt.payload),
            )
        };
        let Some(body) = body else {
            self.drop_pkt(px, DropCause::Malformed);
            return;
        };

        let mut lt = self.rtr.lt.lock().unwrap();
        let Some(entry) = lt.get(in_link) else {
            drop(lt);
            self.drop_pkt(px, DropCause::Untrusted);
            return;
        };
        if entry.nonce != body.nonce {
            debug!(in_link, "connect nonce mismatch");
            drop(lt);
            self.drop_pkt(px, DropCause::Untrusted);
            return;
        }
        let peer_adr = entry.peer_adr;
        let ctl_qid = entry.ctl_qid;
        let iface = entry.iface;

        if header.ptype == PacketType::Connect {
            if !entry.connected {
                if let Some(std::net::SocketAddr::V4(tun)) = tun {
                    if let Err(e) = lt.set_peer_addr(in_link, *tun.ip(), tun.port()) {
                        warn!(in_link, error = %e, "cannot adopt peer address");
                        drop(lt);
                        self.drop_pkt(px, DropCause::Untrusted);
                        return;
                    }
                }
                lt.get_mut(in_link).expect("resolved above").connected = true;
                info!(in_link, peer = %peer_adr, "link connected");
            }
            drop(lt);
            // ack with the peer's own nonce packet
            let ack = {
                let mut ps = self.rtr.ps.lock().unwrap();
                if let Some(d) = ps.get_mut(px) {
                    d.pkt.header.flags.set_ack(true);
                    d.pkt.header.dst = peer_adr;
                    d.pkt.header.src = self.rtr.my_adr();
                    Some(d.pkt.wire_len())
                } else {
                    None
                }
            };
            if let Some(len) = ack {
                self.enq(px, ctl_qid, len, now);
            }
        } else {
            // Disconnect: the ack cannot ride the link's queue (the purge
            // tears it down), so it goes straight out the socket
            let mut ack_pkt = {
                let ps = self.rtr.ps.lock().unwrap();
                ps.get(px).map(|d| d.pkt.clone())
            };
            drop(lt);
            if let (Some(pkt), Some(std::net::SocketAddr::V4(tun))) = (ack_pkt.as_mut(), tun) {
                pkt.header.flags.set_ack(true);
                pkt.header.dst = peer_adr;
                pkt.header.src = self.rtr.my_adr();
                if let Some(sock) = self.rtr.socket_for(iface) {
                    let _ = sock.send_to(&pkt.encode(), std::net::SocketAddr::V4(tun));
                }
            }
            self.rtr.ps.lock().unwrap().free(px);
            if let Err(e) = self.rtr.purge_link(in_link) {
                warn!(in_link, error = %e, "disconnect purge failed");
            }
            return;
        }
    }

    // ─── route replies ───────────────────────────────────────────────────

    /// Learn the route a reply teaches, then pass the reply along toward
    /// the original requester.
    fn rte_reply(&self, px: Pktx, now: u64) {
        let (header, in_link, body) = {
            let ps = self.rtr.ps.lock().unwrap();
            let Some(d) = ps.get(px) else { return };
            (d.pkt.header, d.in_link, RteReply::decode(&d.pkt.payload))
        };
        let Some(body) = body else {
            self.drop_pkt(px, DropCause::Malformed);
            return;
        };

        let mut next: Option<(usize, usize)> = None; // (qid, lnk)
        {
            let mut ctt = self.rtr.ctt.lock().unwrap();
            let mut rt = self.rtr.rt.lock().unwrap();
            let comt = header.comtree;
            if let Some(cl) = ctt.get_comt_link(comt, in_link) {
                if body.dest.is_valid_ucast() && !rt.contains(comt, body.dest) {
                    if rt.add_route(comt, body.dest, cl).is_ok() {
                        ctt.register_rte(cl, body.dest);
                        debug!(comt, dest = %body.dest, "route learned from reply");
                    }
                }
            }
            if header.dst != self.rtr.my_adr() {
                if let Some(RouteLinks::Unicast(cl)) = rt.lookup(comt, header.dst) {
                    let cle = ctt.clink(*cl).expect("route checked at insert");
                    if cle.lnk != in_link {
                        next = Some((cle.qid, cle.lnk));
                    }
                }
            }
        }
        match next {
            Some((qid, _lnk)) => {
                let wire_len = {
                    let ps = self.rtr.ps.lock().unwrap();
                    ps.get(px).map(|d| d.pkt.wire_len()).unwrap_or(0)
                };
                self.enq(px, qid, wire_len, now);
            }
            None => {
                self.rtr.ps.lock().unwrap().free(px);
            }
        }
    }

    // ─── queueing & sending ──────────────────────────────────────────────

    /// Queue for traffic leaving on `lnk` within `comt`: the comtree-link
    /// queue when there is one, the link's control queue otherwise.
    fn qid_toward(&self, lt: &LinkTable, ctt: &ComtreeTable, comt: u32, lnk: usize) -> usize {
        ctt.get_comt_link(comt, lnk)
            .and_then(|cl| ctt.clink(cl))
            .map(|c| c.qid)
            .filter(|&q| q != 0)
            .unwrap_or_else(|| lt.get(lnk).map(|e| e.ctl_qid).unwrap_or(0))
    }

    /// Enqueue a packet whose link was chosen by the sender.
    fn enq_direct(&self, px: Pktx, lnk: usize, now: u64) {
        let (comt, wire_len) = {
            let ps = self.rtr.ps.lock().unwrap();
            let Some(d) = ps.get(px) else { return };
            (d.pkt.header.comtree, d.pkt.wire_len())
        };
        let qid = {
            let lt = self.rtr.lt.lock().unwrap();
            let ctt = self.rtr.ctt.lock().unwrap();
            self.qid_toward(&lt, &ctt, comt, lnk)
        };
        self.enq(px, qid, wire_len, now);
    }

    fn enq(&self, px: Pktx, qid: usize, wire_len: usize, now: u64) {
        if qid == 0 || !self.rtr.qm.enq(px, qid, wire_len, now) {
            self.drop_pkt(px, DropCause::QueueFull);
        }
    }

    fn drop_pkt(&self, px: Pktx, cause: DropCause) {
        self.rtr.ps.lock().unwrap().free(px);
        (*self.rtr.sm.lock().unwrap()).drop(cause);
    }

    /// Send one scheduled packet on its link's interface socket.
    fn send(&self, px: Pktx, lnk: usize, now: u64) {
        let (peer, iface, to_router, connectedish) = {
            let lt = self.rtr.lt.lock().unwrap();
            match lt.get(lnk) {
                Some(e) => (
                    std::net::SocketAddrV4::new(e.peer_ip, e.peer_port),
                    e.iface,
                    e.peer_type == NodeType::Router,
                    e.peer_port != 0,
                ),
                None => {
                    self.rtr.ps.lock().unwrap().free(px);
                    return;
                }
            }
        };
        if !connectedish {
            // provisioned link whose peer never connected
            self.drop_pkt(px, DropCause::NoRoute);
            return;
        }
        let Some(sock) = self.rtr.socket_for(iface) else {
            self.drop_pkt(px, DropCause::NoResources);
            return;
        };

        let (wire, header): (Bytes, forest_wire::Header) = {
            let ps = self.rtr.ps.lock().unwrap();
            let Some(d) = ps.get(px) else { return };
            (d.pkt.encode().freeze(), d.pkt.header)
        };

        let mut tries = 0;
        loop {
            match sock.send_to(&wire, std::net::SocketAddr::V4(peer)) {
                Ok(_) => break,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock && tries < SEND_RETRIES => {
                    tries += 1;
                    std::thread::sleep(Duration::from_micros(100));
                }
                Err(e) => {
                    error!(lnk, error = %e, "send failed, stopping router");
                    self.rtr.ps.lock().unwrap().free(px);
                    self.rtr.request_stop();
                    return;
                }
            }
        }

        self.rtr.pkt_log.lock().unwrap().log(LogEvent {
            now_ns: now,
            lnk,
            outbound: true,
            ptype: header.ptype,
            comtree: header.comtree,
            src: header.src,
            dst: header.dst,
            len: wire.len(),
        });
        self.rtr.sm.lock().unwrap().count_out(lnk, wire.len(), to_router);
        self.rtr.ps.lock().unwrap().free(px);
    }
}
