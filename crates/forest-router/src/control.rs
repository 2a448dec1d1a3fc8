//! # Control workers
//!
//! A fixed pool of threads, each handling one signalling transaction at a
//! time. The input thread assigns a request to a worker (comtree-control
//! requests stick to the worker bound to their comtree), the worker
//! executes the operation against the tables under their locks and sends
//! the reply back through the shared return queue. A worker may itself
//! originate a request mid-transaction; the input thread gives it a
//! sequence number, registers it with the repeater and eventually feeds
//! the reply (or a NO_REPLY notice) back to the same worker.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use forest_wire::rates::{MIN_BIT_RATE, MIN_PKT_RATE};
use forest_wire::signal::{SigAttr, SigMode, SigPacket, SigType};
use forest_wire::{Fadr, NodeType, Packet, PacketType, RateSpec};
use tracing::{debug, warn};

use crate::router::Router;
use crate::Pktx;

/// Worker threads in the pool.
pub const NUM_WORKERS: usize = 8;
/// Depth of each worker's input queue.
pub const WORKER_Q_CAP: usize = 100;

/// Messages from workers back to the input thread.
#[derive(Debug)]
pub enum WorkerOut {
    /// A packet to go out: a reply, or a request needing a sequence number.
    Packet { thx: usize, px: Pktx },
    /// The worker finished its transaction; release it once no later
    /// packet (by receive sequence number) is still queued for it.
    Release { thx: usize, rcv_seq: u64 },
}

/// Input-thread-side handle to one worker.
pub struct WorkerHandle {
    pub tx: Sender<Pktx>,
    /// Receive sequence number of the last packet enqueued to this worker.
    pub rcv_seq: u64,
    /// Comtree this worker is currently bound to, if any.
    pub bound_comt: Option<u32>,
    pub join: Option<JoinHandle<()>>,
}

/// Spawn the worker pool. Index 0 is unused so worker indices can double
/// as free-list entries.
pub fn spawn_workers(rtr: &Arc<Router>, ret_tx: Sender<WorkerOut>) -> Vec<WorkerHandle> {
    let mut pool = Vec::with_capacity(NUM_WORKERS + 1);
    pool.push(WorkerHandle {
        tx: bounded(1).0,
        rcv_seq: 0,
        bound_comt: None,
        join: None,
    });
    for thx in 1..=NUM_WORKERS {
        let (tx, rx) = bounded(WORKER_Q_CAP);
        let rtr = Arc::clone(rtr);
        let ret = ret_tx.clone();
        let join = std::thread::Builder::new()
            .name(format!("forest-ctl-{thx}"))
            .spawn(move || Worker::new(rtr, thx, rx, ret).run())
            .expect("spawning control worker");
        pool.push(WorkerHandle {
            tx,
            rcv_seq: 0,
            bound_comt: None,
            join: Some(join),
        });
    }
    pool
}

/// What a worker's own outgoing request came back with.
enum Await {
    Reply(SigPacket),
    NoReply,
}

struct Worker {
    rtr: Arc<Router>,
    thx: usize,
    rx: Receiver<Pktx>,
    ret: Sender<WorkerOut>,
    /// Requests that arrived while this worker was awaiting a reply.
    pending: VecDeque<Pktx>,
    /// Highest receive sequence number seen on this worker's queue; a
    /// release only takes effect when it matches the input thread's
    /// watermark, proving nothing later is still queued here.
    last_rcv: u64,
}

impl Worker {
    fn new(rtr: Arc<Router>, thx: usize, rx: Receiver<Pktx>, ret: Sender<WorkerOut>) -> Self {
        Worker {
            rtr,
            thx,
            rx,
            ret,
            pending: VecDeque::new(),
            last_rcv: 0,
        }
    }

    fn run(mut self) {
        loop {
            let px = match self.pending.pop_front() {
                Some(px) => px,
                None => match self.rx.recv() {
                    Ok(px) => self.note_rcv(px),
                    Err(_) => return, // router shut down
                },
            };
            self.transaction(px);
            if self.pending.is_empty() {
                let _ = self.ret.send(WorkerOut::Release {
                    thx: self.thx,
                    rcv_seq: self.last_rcv,
                });
            }
        }
    }

    fn note_rcv(&mut self, px: Pktx) -> Pktx {
        if let Some(d) = self.rtr.ps.lock().unwrap().get(px) {
            self.last_rcv = self.last_rcv.max(d.rcv_seq);
        }
        px
    }

    /// Handle one incoming request from start to reply.
    fn transaction(&mut self, px: Pktx) {
        let (sig, in_link) = {
            let ps = self.rtr.ps.lock().unwrap();
            let Some(d) = ps.get(px) else { return };
            (SigPacket::decode(&d.pkt.payload), d.in_link)
        };
        let Some(sig) = sig else {
            self.free(px);
            return;
        };
        if sig.mode != SigMode::Request {
            // stale reply with no open transaction
            debug!(seq = sig.seq, "discarding unmatched signalling packet");
            self.free(px);
            return;
        }

        let reply = match self.execute(&sig) {
            Ok(rep) => rep,
            Err(msg) => {
                debug!(typ = ?sig.typ, seq = sig.seq, %msg, "request refused");
                sig.neg_reply(&msg)
            }
        };

        // rewrite the request descriptor into the reply, headed back out
        // the link it came in on
        {
            let mut ps = self.rtr.ps.lock().unwrap();
            if let Some(d) = ps.get_mut(px) {
                let my_adr = self.rtr.my_adr();
                d.pkt.header.dst = d.pkt.header.src;
                d.pkt.header.src = my_adr;
                d.pkt.payload = reply.encode();
                d.out_link = in_link;
            }
        }
        let _ = self.ret.send(WorkerOut::Packet { thx: self.thx, px });
    }

    fn free(&self, px: Pktx) {
        self.rtr.ps.lock().unwrap().free(px);
    }

    /// Send a request of our own and block until its reply (or a NO_REPLY
    /// notice after the repeater gives up). Requests arriving meanwhile
    /// are deferred, preserving per-comtree ordering.
    fn send_request_await(&mut self, req: SigPacket, dst: Fadr, comtree: u32) -> Await {
        let pkt = Packet::new(PacketType::NetSig, comtree, self.rtr.my_adr(), dst, req.encode());
        let px = match self.rtr.ps.lock().unwrap().alloc(pkt) {
            Some(px) => px,
            None => return Await::NoReply,
        };
        let _ = self.ret.send(WorkerOut::Packet { thx: self.thx, px });

        loop {
            let Ok(px) = self.rx.recv() else {
                return Await::NoReply;
            };
            let px = self.note_rcv(px);
            let sig = {
                let ps = self.rtr.ps.lock().unwrap();
                ps.get(px).and_then(|d| SigPacket::decode(&d.pkt.payload))
            };
            match sig {
                Some(s) if s.mode == SigMode::Request => self.pending.push_back(px),
                Some(s) => {
                    self.free(px);
                    if s.mode == SigMode::NoReply {
                        return Await::NoReply;
                    }
                    return Await::Reply(s);
                }
                None => self.free(px),
            }
        }
    }

    // ─── operations ──────────────────────────────────────────────────────

    fn execute(&mut self, sig: &SigPacket) -> Result<SigPacket, String> {
        use SigType::*;
        match sig.typ {
            AddIface => self.add_iface(sig),
            DropIface => self.drop_iface(sig),
            GetIface => self.get_iface(sig),
            ModIface => self.mod_iface(sig),
            AddLink => self.add_link(sig),
            DropLink => self.drop_link(sig),
            GetLink => self.get_link(sig),
            ModLink => self.mod_link(sig),
            AddComtree => self.add_comtree(sig),
            DropComtree => self.drop_comtree(sig),
            GetComtree => self.get_comtree(sig),
            ModComtree => self.mod_comtree(sig),
            AddComtreeLink => self.add_comtree_link(sig),
            DropComtreeLink => self.drop_comtree_link(sig),
            ModComtreeLink => self.mod_comtree_link(sig),
            AddRoute => self.add_route(sig),
            DropRoute => self.drop_route(sig),
            GetRoute => self.get_route(sig),
            ModRoute => self.mod_route(sig),
            BootRouter | BootConfig | BootComplete | BootAbort => {
                Err("boot signalling outside the boot handshake".into())
            }
        }
    }

    fn need(sig: &SigPacket, attr: SigAttr) -> Result<u64, String> {
        sig.get(attr).ok_or_else(|| format!("missing {attr:?}"))
    }

    // ─── interface ops ───────────────────────────────────────────────────

    fn add_iface(&mut self, sig: &SigPacket) -> Result<SigPacket, String> {
        let iface = Self::need(sig, SigAttr::Iface)? as usize;
        let ip = Ipv4Addr::from(Self::need(sig, SigAttr::RtrIp)? as u32);
        let port = Self::need(sig, SigAttr::RtrPort)? as u16;
        let rates = sig.get_rates().ok_or("missing interface rates")?;
        self.rtr
            .ift
            .lock()
            .unwrap()
            .add_entry(iface, ip, port, rates)
            .map_err(|e| e.to_string())?;
        if let Err(e) = self.rtr.setup_iface(iface) {
            let _ = self.rtr.ift.lock().unwrap().remove_entry(iface);
            return Err(format!("could not open interface socket: {e}"));
        }
        Ok(sig.pos_reply())
    }

    fn drop_iface(&mut self, sig: &SigPacket) -> Result<SigPacket, String> {
        let iface = Self::need(sig, SigAttr::Iface)? as usize;
        let mut ift = self.rtr.ift.lock().unwrap();
        let lt = self.rtr.lt.lock().unwrap();
        if lt.iter().any(|(_, e)| e.iface == iface) {
            return Err("interface still has links".into());
        }
        ift.remove_entry(iface).map_err(|e| e.to_string())?;
        drop(lt);
        drop(ift);
        self.rtr.drop_iface_socket(iface);
        Ok(sig.pos_reply())
    }

    fn get_iface(&mut self, sig: &SigPacket) -> Result<SigPacket, String> {
        let iface = Self::need(sig, SigAttr::Iface)? as usize;
        let ift = self.rtr.ift.lock().unwrap();
        let e = ift.get(iface).ok_or("no such interface")?;
        let mut rep = sig.pos_reply();
        rep.set(SigAttr::Iface, iface as u64)
            .set(SigAttr::RtrIp, u32::from(e.ip) as u64)
            .set(SigAttr::RtrPort, e.port as u64)
            .set_rates(&e.rates);
        Ok(rep)
    }

    fn mod_iface(&mut self, sig: &SigPacket) -> Result<SigPacket, String> {
        let iface = Self::need(sig, SigAttr::Iface)? as usize;
        let rates = sig.get_rates().ok_or("missing interface rates")?;
        let mut ift = self.rtr.ift.lock().unwrap();
        let e = ift.get_mut(iface).ok_or("no such interface")?;
        let mut committed = e.rates;
        committed.subtract(&e.avail);
        if !committed.leq(&rates) {
            return Err("new rates below committed link rates".into());
        }
        e.rates = rates;
        e.avail = rates;
        e.avail.subtract(&committed);
        Ok(sig.pos_reply())
    }

    // ─── link ops ────────────────────────────────────────────────────────

    fn add_link(&mut self, sig: &SigPacket) -> Result<SigPacket, String> {
        let peer_type = NodeType::from_byte(Self::need(sig, SigAttr::PeerType)? as u8)
            .ok_or("bad peer type")?;
        let lnk = sig.get(SigAttr::Link).unwrap_or(0) as usize;
        let peer_ip = Ipv4Addr::from(sig.get(SigAttr::PeerIp).unwrap_or(0) as u32);
        let peer_port = sig.get(SigAttr::PeerPort).unwrap_or(0) as u16;
        let rates = sig
            .get_rates()
            .unwrap_or(RateSpec::symmetric(MIN_BIT_RATE, MIN_PKT_RATE));
        let nonce = sig
            .get(SigAttr::Nonce)
            .unwrap_or_else(|| rand::random::<u64>());

        let mut ift = self.rtr.ift.lock().unwrap();
        let mut lt = self.rtr.lt.lock().unwrap();
        let iface = match sig.get(SigAttr::Iface) {
            Some(i) => i as usize,
            None => ift.default_iface(),
        };
        if !ift.valid(iface) {
            return Err("no such interface".into());
        }

        // clients without a given address get one from the leaf pool
        let mut leaf_guard = self.rtr.leaf_adr.lock().unwrap();
        let peer_adr = match sig.get_adr(SigAttr::PeerAdr) {
            Some(adr) => {
                if peer_type == NodeType::Client {
                    let pool = leaf_guard.as_mut().ok_or("no leaf address range")?;
                    if !pool.alloc(adr) {
                        return Err("requested leaf address unavailable".into());
                    }
                }
                adr
            }
            None => {
                if peer_type != NodeType::Client {
                    return Err("missing peer address".into());
                }
                let pool = leaf_guard.as_mut().ok_or("no leaf address range")?;
                pool.alloc_any().ok_or("leaf addresses exhausted")?
            }
        };

        ift.reserve(iface, &rates).map_err(|e| {
            if peer_type == NodeType::Client {
                if let Some(pool) = leaf_guard.as_mut() {
                    pool.free(peer_adr);
                }
            }
            e.to_string()
        })?;
        let lnk = match lt.add_entry(lnk, iface, peer_ip, peer_port, peer_type, peer_adr, rates, nonce)
        {
            Ok(lnk) => lnk,
            Err(e) => {
                let _ = ift.release(iface, &rates);
                if peer_type == NodeType::Client {
                    if let Some(pool) = leaf_guard.as_mut() {
                        pool.free(peer_adr);
                    }
                }
                return Err(e.to_string());
            }
        };
        self.rtr.qm.add_link(lnk, &rates);
        let qid = self.rtr.qm.alloc_queue(lnk);
        self.rtr.qm.set_queue_rates(qid, &rates);
        lt.get_mut(lnk).expect("just added").ctl_qid = qid;
        let (rtr_ip, rtr_port) = {
            let e = ift.get(iface).expect("validated above");
            (e.ip, e.port)
        };

        let mut rep = sig.pos_reply();
        rep.set(SigAttr::Link, lnk as u64)
            .set_adr(SigAttr::PeerAdr, peer_adr)
            .set(SigAttr::Nonce, nonce)
            .set(SigAttr::RtrIp, u32::from(rtr_ip) as u64)
            .set(SigAttr::RtrPort, rtr_port as u64);
        Ok(rep)
    }

    fn drop_link(&mut self, sig: &SigPacket) -> Result<SigPacket, String> {
        let lnk = Self::need(sig, SigAttr::Link)? as usize;
        self.rtr.purge_link(lnk).map_err(|e| e.to_string())?;
        Ok(sig.pos_reply())
    }

    fn get_link(&mut self, sig: &SigPacket) -> Result<SigPacket, String> {
        let lnk = Self::need(sig, SigAttr::Link)? as usize;
        let lt = self.rtr.lt.lock().unwrap();
        let e = lt.get(lnk).ok_or("no such link")?;
        let mut rep = sig.pos_reply();
        rep.set(SigAttr::Link, lnk as u64)
            .set(SigAttr::Iface, e.iface as u64)
            .set(SigAttr::PeerIp, u32::from(e.peer_ip) as u64)
            .set(SigAttr::PeerPort, e.peer_port as u64)
            .set(SigAttr::PeerType, e.peer_type as u8 as u64)
            .set_adr(SigAttr::PeerAdr, e.peer_adr)
            .set_rates(&e.rates);
        Ok(rep)
    }

    fn mod_link(&mut self, sig: &SigPacket) -> Result<SigPacket, String> {
        let lnk = Self::need(sig, SigAttr::Link)? as usize;
        let rates = sig.get_rates().ok_or("missing link rates")?;
        let mut ift = self.rtr.ift.lock().unwrap();
        let mut lt = self.rtr.lt.lock().unwrap();
        let (iface, old, avail) = {
            let e = lt.get(lnk).ok_or("no such link")?;
            (e.iface, e.rates, e.avail)
        };
        let mut committed = old;
        committed.subtract(&avail);
        if !committed.leq(&rates) {
            return Err("new rates below committed comtree rates".into());
        }
        ift.release(iface, &old).map_err(|e| e.to_string())?;
        if let Err(e) = ift.reserve(iface, &rates) {
            let _ = ift.reserve(iface, &old);
            return Err(e.to_string());
        }
        let e = lt.get_mut(lnk).expect("checked above");
        e.rates = rates;
        e.avail = rates;
        e.avail.subtract(&committed);
        self.rtr.qm.set_link_rates(lnk, &rates);
        Ok(sig.pos_reply())
    }

    // ─── comtree ops ─────────────────────────────────────────────────────

    fn add_comtree(&mut self, sig: &SigPacket) -> Result<SigPacket, String> {
        let comt = Self::need(sig, SigAttr::Comtree)? as u32;
        let core = sig.get(SigAttr::CoreFlag).unwrap_or(0) != 0;
        let mut ctt = self.rtr.ctt.lock().unwrap();
        let ctx = ctt.add_entry(comt).map_err(|e| e.to_string())?;
        ctt.set_core_flag(ctx, core).expect("fresh entry");
        Ok(sig.pos_reply())
    }

    fn drop_comtree(&mut self, sig: &SigPacket) -> Result<SigPacket, String> {
        let comt = Self::need(sig, SigAttr::Comtree)? as u32;
        let mut lt = self.rtr.lt.lock().unwrap();
        let mut ctt = self.rtr.ctt.lock().unwrap();
        let ctx = ctt.get_comt_index(comt).ok_or("no such comtree")?;
        let e = ctt.entry(ctx).expect("index just resolved");
        if e
            .comt_links
            .iter()
            .any(|&cl| ctt.clink(cl).map(|c| !c.routes.is_empty()).unwrap_or(false))
        {
            return Err("comtree still has subscribed routes".into());
        }
        // release queues and rate reservations before the links go
        let clinks: Vec<usize> = e.comt_links.iter().copied().collect();
        let mut stranded = Vec::new();
        for cl in clinks {
            let c = ctt.clink(cl).expect("set member");
            let (lnk, qid, rates) = (c.lnk, c.qid, c.rates);
            if qid != 0 {
                stranded.extend(self.rtr.qm.free_queue(qid));
            }
            let _ = lt.release(lnk, &rates);
        }
        ctt.remove_entry(ctx, &mut lt).map_err(|e| e.to_string())?;
        drop(ctt);
        drop(lt);
        if !stranded.is_empty() {
            let mut ps = self.rtr.ps.lock().unwrap();
            for px in stranded {
                ps.free(px);
            }
        }
        Ok(sig.pos_reply())
    }

    fn get_comtree(&mut self, sig: &SigPacket) -> Result<SigPacket, String> {
        let comt = Self::need(sig, SigAttr::Comtree)? as u32;
        let ctt = self.rtr.ctt.lock().unwrap();
        let ctx = ctt.get_comt_index(comt).ok_or("no such comtree")?;
        let mut rep = sig.pos_reply();
        rep.set(SigAttr::Comtree, comt as u64)
            .set(SigAttr::CoreFlag, ctt.in_core(ctx) as u64)
            .set(SigAttr::ParentLink, ctt.plnk(ctx) as u64);
        Ok(rep)
    }

    /// Change the rates provisioned for this router's side of a comtree.
    /// The new rates are applied to the parent comtree-link, then the
    /// parent router is asked to mirror the change; if it never answers,
    /// the local change is rolled back.
    fn mod_comtree(&mut self, sig: &SigPacket) -> Result<SigPacket, String> {
        let comt = Self::need(sig, SigAttr::Comtree)? as u32;
        let rates = sig.get_rates().ok_or("missing comtree rates")?;

        let (cl, old, parent_adr) = {
            let lt = self.rtr.lt.lock().unwrap();
            let ctt = self.rtr.ctt.lock().unwrap();
            let ctx = ctt.get_comt_index(comt).ok_or("no such comtree")?;
            let plnk = ctt.plnk(ctx);
            if plnk == 0 {
                return Err("comtree has no parent here".into());
            }
            let cl = ctt.get_comt_link(comt, plnk).expect("parent is a comtree link");
            let old = ctt.clink(cl).expect("parent link").rates;
            let parent_adr = lt.get(plnk).ok_or("dangling parent link")?.peer_adr;
            (cl, old, parent_adr)
        };

        self.apply_clink_rates(comt, cl, &rates, &old)?;

        // ask the parent to mirror the change before confirming
        let mut req = SigPacket::new(SigType::ModComtreeLink, SigMode::Request, 0);
        req.set(SigAttr::Comtree, comt as u64).set_rates(&rates);
        match self.send_request_await(req, parent_adr, comt) {
            Await::Reply(rep) if rep.mode == SigMode::PosReply => Ok(sig.pos_reply()),
            Await::Reply(rep) => {
                let msg = rep.err_msg().unwrap_or("parent refused").to_string();
                let _ = self.apply_clink_rates(comt, cl, &old, &rates);
                Err(msg)
            }
            Await::NoReply => {
                warn!(comt, "no response from parent router, rolling back");
                let _ = self.apply_clink_rates(comt, cl, &old, &rates);
                Err("no response from parent router".into())
            }
        }
    }

    /// Swap a comtree-link's reservation from `old` to `new`.
    fn apply_clink_rates(
        &self,
        comt: u32,
        cl: usize,
        new: &RateSpec,
        old: &RateSpec,
    ) -> Result<(), String> {
        let mut lt = self.rtr.lt.lock().unwrap();
        let mut ctt = self.rtr.ctt.lock().unwrap();
        let c = ctt.clink(cl).ok_or("comtree link vanished")?;
        let (lnk, qid) = (c.lnk, c.qid);
        lt.release(lnk, old).map_err(|e| e.to_string())?;
        if let Err(e) = lt.reserve(lnk, new) {
            let _ = lt.reserve(lnk, old);
            return Err(e.to_string());
        }
        ctt.clink_mut(cl).expect("checked above").rates = *new;
        if qid != 0 {
            self.rtr.qm.set_queue_rates(qid, new);
        }
        debug!(comt, cl, "comtree link rates changed");
        Ok(())
    }

    fn add_comtree_link(&mut self, sig: &SigPacket) -> Result<SigPacket, String> {
        let comt = Self::need(sig, SigAttr::Comtree)? as u32;
        let lnk = Self::need(sig, SigAttr::Link)? as usize;
        let core = sig.get(SigAttr::CoreFlag).unwrap_or(0) != 0;
        let rates = sig
            .get_rates()
            .unwrap_or(RateSpec::symmetric(MIN_BIT_RATE, MIN_PKT_RATE));

        let mut lt = self.rtr.lt.lock().unwrap();
        let mut ctt = self.rtr.ctt.lock().unwrap();
        let ctx = ctt.get_comt_index(comt).ok_or("no such comtree")?;
        let rtr_peer = lt.get(lnk).ok_or("no such link")?.peer_type == NodeType::Router;
        if core && !rtr_peer {
            return Err("core neighbour must be a router".into());
        }
        lt.reserve(lnk, &rates).map_err(|e| e.to_string())?;
        let cl = match ctt.add_link(ctx, lnk, rtr_peer, core, &mut lt) {
            Ok(cl) => cl,
            Err(e) => {
                let _ = lt.release(lnk, &rates);
                return Err(e.to_string());
            }
        };
        let qid = self.rtr.qm.alloc_queue(lnk);
        self.rtr.qm.set_queue_rates(qid, &rates);
        let c = ctt.clink_mut(cl).expect("just added");
        c.rates = rates;
        c.qid = qid;

        let mut rep = sig.pos_reply();
        rep.set(SigAttr::Comtree, comt as u64).set(SigAttr::Link, lnk as u64);
        Ok(rep)
    }

    fn drop_comtree_link(&mut self, sig: &SigPacket) -> Result<SigPacket, String> {
        let comt = Self::need(sig, SigAttr::Comtree)? as u32;
        let lnk = Self::need(sig, SigAttr::Link)? as usize;
        let mut lt = self.rtr.lt.lock().unwrap();
        let mut ctt = self.rtr.ctt.lock().unwrap();
        let ctx = ctt.get_comt_index(comt).ok_or("no such comtree")?;
        let cl = ctt.get_comt_link(comt, lnk).ok_or("link not in comtree")?;
        let c = ctt.clink(cl).expect("resolved above");
        if !c.routes.is_empty() {
            return Err("comtree link still has routes".into());
        }
        let (qid, rates) = (c.qid, c.rates);
        ctt.remove_link(ctx, cl, &mut lt).map_err(|e| e.to_string())?;
        let _ = lt.release(lnk, &rates);
        let stranded = if qid != 0 {
            self.rtr.qm.free_queue(qid)
        } else {
            Vec::new()
        };
        drop(ctt);
        drop(lt);
        if !stranded.is_empty() {
            let mut ps = self.rtr.ps.lock().unwrap();
            for px in stranded {
                ps.free(px);
            }
        }
        Ok(sig.pos_reply())
    }

    fn mod_comtree_link(&mut self, sig: &SigPacket) -> Result<SigPacket, String> {
        let comt = Self::need(sig, SigAttr::Comtree)? as u32;
        let rates = sig.get_rates().ok_or("missing rates")?;
        let (cl, old) = {
            let ctt = self.rtr.ctt.lock().unwrap();
            // the link attribute is optional: a request from a child
            // router names only the comtree, meaning "your link to me"
            let cl = match sig.get(SigAttr::Link) {
                Some(lnk) => ctt
                    .get_comt_link(comt, lnk as usize)
                    .ok_or("link not in comtree")?,
                None => {
                    let ctx = ctt.get_comt_index(comt).ok_or("no such comtree")?;
                    let plnk = ctt.plnk(ctx);
                    if plnk == 0 {
                        return Err("no link named and no parent".into());
                    }
                    ctt.get_comt_link(comt, plnk).expect("parent is a comtree link")
                }
            };
            (cl, ctt.clink(cl).expect("resolved").rates)
        };
        self.apply_clink_rates(comt, cl, &rates, &old)?;
        Ok(sig.pos_reply())
    }

    // ─── route ops ───────────────────────────────────────────────────────

    fn add_route(&mut self, sig: &SigPacket) -> Result<SigPacket, String> {
        let comt = Self::need(sig, SigAttr::Comtree)? as u32;
        let dest = sig.get_adr(SigAttr::DestAdr).ok_or("missing destination")?;
        let lnk = Self::need(sig, SigAttr::Link)? as usize;
        let mut ctt = self.rtr.ctt.lock().unwrap();
        let mut rt = self.rtr.rt.lock().unwrap();
        let cl = ctt.get_comt_link(comt, lnk).ok_or("link not in comtree")?;
        if rt.contains(comt, dest) {
            if !dest.is_mcast() {
                return Err("route already exists".into());
            }
            rt.add_link(comt, dest, cl).map_err(|e| e.to_string())?;
        } else {
            rt.add_route(comt, dest, cl).map_err(|e| e.to_string())?;
        }
        ctt.register_rte(cl, dest);
        Ok(sig.pos_reply())
    }

    fn drop_route(&mut self, sig: &SigPacket) -> Result<SigPacket, String> {
        let comt = Self::need(sig, SigAttr::Comtree)? as u32;
        let dest = sig.get_adr(SigAttr::DestAdr).ok_or("missing destination")?;
        let mut ctt = self.rtr.ctt.lock().unwrap();
        let mut rt = self.rtr.rt.lock().unwrap();
        let links = rt.remove_route(comt, dest).map_err(|e| e.to_string())?;
        let cls: Vec<usize> = match links {
            crate::tables::route::RouteLinks::Unicast(cl) => vec![cl],
            crate::tables::route::RouteLinks::Multicast(set) => set.into_iter().collect(),
        };
        for cl in cls {
            ctt.deregister_rte(cl, dest);
        }
        Ok(sig.pos_reply())
    }

    fn get_route(&mut self, sig: &SigPacket) -> Result<SigPacket, String> {
        let comt = Self::need(sig, SigAttr::Comtree)? as u32;
        let dest = sig.get_adr(SigAttr::DestAdr).ok_or("missing destination")?;
        let ctt = self.rtr.ctt.lock().unwrap();
        let rt = self.rtr.rt.lock().unwrap();
        let links = rt.lookup(comt, dest).ok_or("no such route")?;
        let cl = match links {
            crate::tables::route::RouteLinks::Unicast(cl) => *cl,
            crate::tables::route::RouteLinks::Multicast(set) => {
                *set.iter().next().ok_or("empty route")?
            }
        };
        let mut rep = sig.pos_reply();
        rep.set(SigAttr::Comtree, comt as u64)
            .set_adr(SigAttr::DestAdr, dest)
            .set(SigAttr::Link, ctt.link(cl) as u64);
        Ok(rep)
    }

    fn mod_route(&mut self, sig: &SigPacket) -> Result<SigPacket, String> {
        let comt = Self::need(sig, SigAttr::Comtree)? as u32;
        let dest = sig.get_adr(SigAttr::DestAdr).ok_or("missing destination")?;
        let lnk = Self::need(sig, SigAttr::Link)? as usize;
        if dest.is_mcast() {
            return Err("multicast routes change through subscriptions".into());
        }
        let mut ctt = self.rtr.ctt.lock().unwrap();
        let mut rt = self.rtr.rt.lock().unwrap();
        let new_cl = ctt.get_comt_link(comt, lnk).ok_or("link not in comtree")?;
        let old = rt.remove_route(comt, dest).map_err(|e| e.to_string())?;
        if let crate::tables::route::RouteLinks::Unicast(old_cl) = old {
            ctt.deregister_rte(old_cl, dest);
        }
        rt.add_route(comt, dest, new_cl).map_err(|e| e.to_string())?;
        ctt.register_rte(new_cl, dest);
        Ok(sig.pos_reply())
    }
}
