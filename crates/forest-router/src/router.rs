//! # Router core
//!
//! Owns every shared structure — the four tables, the packet store, the
//! scheduler, counters, sockets and the transfer queue — and the thread
//! lifecycle around them. The input thread, output thread and workers all
//! hold an `Arc<Router>`.
//!
//! Lock order: iface → link → comtree → route → packet store. The
//! scheduler and the stats module have their own locks outside that chain.

use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use forest_wire::{Fadr, NodeType, RateSpec};
use quanta::Clock;
use tracing::{info, warn};

use crate::config::{Mode, RouterConfig};
use crate::input::InputProc;
use crate::listpair::ListPair;
use crate::output::OutputProc;
use crate::qmgr::QuManager;
use crate::repeat::Repeater;
use crate::stats::{PacketLog, StatsModule};
use crate::store::PacketStore;
use crate::tables::route::RouteLinks;
use crate::tables::{ComtreeTable, IfaceTable, LinkTable, RouteTable};
use crate::Pktx;

/// Descriptor pool size.
pub const PACKET_STORE_CAP: usize = 10_000;
/// Transfer-queue depth between the input and output threads.
pub const XFER_CAP: usize = 4096;
/// Largest link number in remote mode (local mode sizes from the file).
pub const MAX_LINKS: usize = 64;
/// Packet-log size.
pub const PKT_LOG_CAP: usize = 4096;

// ─── Leaf address pool ───────────────────────────────────────────────────────

/// Allocation state for the router's assignable leaf addresses.
#[derive(Debug)]
pub struct LeafPool {
    first: Fadr,
    last: Fadr,
    pool: ListPair,
}

impl LeafPool {
    pub fn new(first: Fadr, last: Fadr) -> Self {
        let n = (last.raw() - first.raw() + 1) as usize;
        LeafPool {
            first,
            last,
            pool: ListPair::new(n),
        }
    }

    fn offset(&self, adr: Fadr) -> Option<usize> {
        if adr.raw() < self.first.raw() || adr.raw() > self.last.raw() {
            return None;
        }
        Some((adr.raw() - self.first.raw()) as usize + 1)
    }

    /// Any address in the assignable range, allocated or not.
    pub fn in_range(&self, adr: Fadr) -> bool {
        self.offset(adr).is_some()
    }

    pub fn alloc_any(&mut self) -> Option<Fadr> {
        match self.pool.claim_any() {
            0 => None,
            off => Some(Fadr(self.first.raw() + off as u32 - 1)),
        }
    }

    pub fn alloc(&mut self, adr: Fadr) -> bool {
        self.offset(adr).map(|o| self.pool.claim(o)).unwrap_or(false)
    }

    pub fn free(&mut self, adr: Fadr) {
        if let Some(o) = self.offset(adr) {
            self.pool.release(o);
        }
    }

    pub fn is_allocated(&self, adr: Fadr) -> bool {
        self.offset(adr).map(|o| self.pool.is_in(o)).unwrap_or(false)
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub struct Router {
    pub cfg: RouterConfig,

    my_adr: AtomicU32,
    nm_adr: AtomicU32,
    booting: AtomicBool,
    stop: AtomicBool,
    seq: AtomicU64,
    rcv_seq: AtomicU64,

    clock: Clock,
    t0: u64,

    pub ift: Mutex<IfaceTable>,
    pub lt: Mutex<LinkTable>,
    pub ctt: Mutex<ComtreeTable>,
    pub rt: Mutex<RouteTable>,
    pub ps: Mutex<PacketStore>,
    pub qm: QuManager,
    pub sm: Mutex<StatsModule>,
    pub pkt_log: Mutex<PacketLog>,
    pub leaf_adr: Mutex<Option<LeafPool>>,
    /// Outgoing-request tracker, shared because the output thread saves
    /// upward subscription requests while the input thread drives the
    /// retransmission timer.
    pub rptr: Mutex<Repeater>,

    sockets: Mutex<HashMap<usize, Arc<UdpSocket>>>,
    socket_gen: AtomicU64,

    xfer_tx: Sender<Pktx>,
    xfer_rx: Receiver<Pktx>,

    stat_sink: Mutex<Option<fs::File>>,
}

impl Router {
    pub fn new(cfg: RouterConfig) -> Self {
        let clock = Clock::new();
        let t0 = clock.raw();
        let (xfer_tx, xfer_rx) = bounded(XFER_CAP);
        let leaf = if cfg.first_leaf_adr.raw() != 0 {
            Some(LeafPool::new(cfg.first_leaf_adr, cfg.last_leaf_adr))
        } else {
            None
        };
        Router {
            my_adr: AtomicU32::new(cfg.my_adr.raw()),
            nm_adr: AtomicU32::new(cfg.nm_adr.raw()),
            booting: AtomicBool::new(cfg.mode == Mode::Remote),
            stop: AtomicBool::new(false),
            seq: AtomicU64::new(1),
            rcv_seq: AtomicU64::new(0),
            clock,
            t0,
            ift: Mutex::new(IfaceTable::new()),
            lt: Mutex::new(LinkTable::new(MAX_LINKS)),
            ctt: Mutex::new(ComtreeTable::new()),
            rt: Mutex::new(RouteTable::new()),
            ps: Mutex::new(PacketStore::new(PACKET_STORE_CAP)),
            qm: QuManager::new(),
            sm: Mutex::new(StatsModule::new()),
            pkt_log: Mutex::new(PacketLog::new(PKT_LOG_CAP)),
            leaf_adr: Mutex::new(leaf),
            rptr: Mutex::new(Repeater::new()),
            sockets: Mutex::new(HashMap::new()),
            socket_gen: AtomicU64::new(0),
            xfer_tx,
            xfer_rx,
            stat_sink: Mutex::new(None),
            cfg,
        }
    }

    // ─── identity & time ─────────────────────────────────────────────────

    pub fn my_adr(&self) -> Fadr {
        Fadr(self.my_adr.load(Ordering::Acquire))
    }

    pub fn set_my_adr(&self, adr: Fadr) {
        self.my_adr.store(adr.raw(), Ordering::Release);
    }

    pub fn nm_adr(&self) -> Fadr {
        Fadr(self.nm_adr.load(Ordering::Acquire))
    }

    pub fn set_nm_adr(&self, adr: Fadr) {
        self.nm_adr.store(adr.raw(), Ordering::Release);
    }

    pub fn booting(&self) -> bool {
        self.booting.load(Ordering::Acquire)
    }

    pub fn set_booting(&self, on: bool) {
        self.booting.store(on, Ordering::Release);
    }

    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Nanoseconds since the router started.
    pub fn now_ns(&self) -> u64 {
        self.clock.delta(self.t0, self.clock.raw()).as_nanos() as u64
    }

    /// Monotonic sequence number for outgoing control traffic.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Router-wide receive sequence number, stamped on every inbound
    /// packet for worker release watermarks.
    pub fn next_rcv_seq(&self) -> u64 {
        self.rcv_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    // ─── transfer queue ──────────────────────────────────────────────────

    /// Hand a packet to the output thread. On overflow the packet is freed
    /// and counted; the data plane never blocks on the transfer queue.
    pub fn xfer_enq(&self, px: Pktx) -> bool {
        if self.xfer_tx.try_send(px).is_err() {
            let mut ps = self.ps.lock().unwrap();
            ps.free(px);
            (*self.sm
                .lock()
                .unwrap())
                .drop(crate::stats::DropCause::NoResources);
            false
        } else {
            true
        }
    }

    pub fn xfer_try_deq(&self) -> Option<Pktx> {
        self.xfer_rx.try_recv().ok()
    }

    // ─── sockets ─────────────────────────────────────────────────────────

    /// Open the non-blocking UDP socket for one interface.
    pub fn setup_iface(&self, iface: usize) -> Result<()> {
        let (ip, mut port) = {
            let ift = self.ift.lock().unwrap();
            let e = ift
                .get(iface)
                .ok_or_else(|| anyhow!("setup_iface: no interface {iface}"))?;
            (e.ip, e.port)
        };
        if self.cfg.port_num != 0 {
            port = self.cfg.port_num;
        }
        let sock = UdpSocket::bind(SocketAddrV4::new(ip, port))
            .with_context(|| format!("binding interface {iface} to {ip}:{port}"))?;
        sock.set_nonblocking(true)?;
        let local = sock.local_addr()?;
        info!(iface, %local, "interface up");
        // record the actual port (matters when the table said 0)
        if let Some(e) = self.ift.lock().unwrap().get_mut(iface) {
            e.port = local.port();
        }
        self.sockets.lock().unwrap().insert(iface, Arc::new(sock));
        self.socket_gen.fetch_add(1, Ordering::Release);
        Ok(())
    }

    pub fn drop_iface_socket(&self, iface: usize) {
        self.sockets.lock().unwrap().remove(&iface);
        self.socket_gen.fetch_add(1, Ordering::Release);
    }

    pub fn socket_for(&self, iface: usize) -> Option<Arc<UdpSocket>> {
        self.sockets.lock().unwrap().get(&iface).cloned()
    }

    /// Generation counter for the socket set; the input thread refreshes
    /// its snapshot when this changes.
    pub fn socket_generation(&self) -> u64 {
        self.socket_gen.load(Ordering::Acquire)
    }

    pub fn sockets_snapshot(&self) -> Vec<(usize, Arc<UdpSocket>)> {
        let mut v: Vec<_> = self
            .sockets
            .lock()
            .unwrap()
            .iter()
            .map(|(k, s)| (*k, s.clone()))
            .collect();
        v.sort_by_key(|(k, _)| *k);
        v
    }

    // ─── setup ───────────────────────────────────────────────────────────

    /// Load the four table files (local mode).
    pub fn read_tables(&self) -> Result<()> {
        let read = |name: &Option<String>| -> Result<String> {
            let name = name.as_ref().expect("validated by config");
            fs::read_to_string(name).with_context(|| format!("reading {name}"))
        };
        let ift = IfaceTable::parse(&read(&self.cfg.if_tbl)?)?;
        let mut lt = LinkTable::parse(&read(&self.cfg.lnk_tbl)?)?;
        let ctt = ComtreeTable::parse(&read(&self.cfg.comt_tbl)?, &mut lt)?;
        let rt = RouteTable::parse(&read(&self.cfg.rte_tbl)?)?;
        *self.ift.lock().unwrap() = ift;
        *self.lt.lock().unwrap() = lt;
        *self.ctt.lock().unwrap() = ctt;
        *self.rt.lock().unwrap() = rt;
        if let Some(path) = &self.cfg.stat_spec {
            let f = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening stat file {path}"))?;
            *self.stat_sink.lock().unwrap() = Some(f);
        }
        Ok(())
    }

    /// Bring the loaded tables to life: open sockets, build scheduler
    /// state, verify invariants, compute available rates, seed routes for
    /// directly attached leaves.
    pub fn setup(&self) -> Result<()> {
        let ifaces: Vec<usize> = self.ift.lock().unwrap().iter().map(|(i, _)| i).collect();
        for iface in ifaces {
            self.setup_iface(iface)?;
        }
        self.setup_queues()?;
        self.check_tables()?;
        self.set_avail_rates()?;
        self.add_local_routes();
        Ok(())
    }

    /// Register every link with the scheduler, give each link its control
    /// queue, and give each comtree-link its data queue.
    pub fn setup_queues(&self) -> Result<()> {
        let mut lt = self.lt.lock().unwrap();
        let mut ctt = self.ctt.lock().unwrap();
        let links: Vec<usize> = lt.iter().map(|(l, _)| l).collect();
        for lnk in links {
            let e = lt.get_mut(lnk).expect("listed above");
            self.qm.add_link(lnk, &e.rates);
            if e.ctl_qid == 0 {
                let qid = self.qm.alloc_queue(lnk);
                if qid == 0 {
                    bail!("could not allocate control queue for link {lnk}");
                }
                self.qm.set_queue_rates(qid, &e.rates);
                e.ctl_qid = qid;
            }
        }
        let clinks: Vec<usize> = ctt
            .iter()
            .flat_map(|(_, e)| e.comt_links.iter().copied())
            .collect();
        for cl in clinks {
            let (lnk, rates, qid) = {
                let c = ctt.clink(cl).expect("listed above");
                (c.lnk, c.rates, c.qid)
            };
            if qid != 0 {
                continue;
            }
            let qid = self.qm.alloc_queue(lnk);
            if qid == 0 {
                bail!("could not allocate queue for comtree link {cl}");
            }
            self.qm.set_queue_rates(qid, &rates);
            ctt.clink_mut(cl).expect("listed above").qid = qid;
        }
        Ok(())
    }

    /// Verify the cross-table invariants on the loaded configuration.
    pub fn check_tables(&self) -> Result<()> {
        let ift = self.ift.lock().unwrap();
        let lt = self.lt.lock().unwrap();
        let ctt = self.ctt.lock().unwrap();
        let rt = self.rt.lock().unwrap();
        let leaf = self.leaf_adr.lock().unwrap();

        for (lnk, e) in lt.iter() {
            if !ift.valid(e.iface) {
                bail!("link {lnk} references missing interface {}", e.iface);
            }
        }
        for (ctx, e) in ctt.iter() {
            ctt.check_entry(ctx, &lt)
                .map_err(|err| anyhow!("comtree {}: {err}", e.comt))?;
        }
        for ((comt, dest), links) in rt.iter() {
            let ctx = ctt
                .get_comt_index(*comt)
                .ok_or_else(|| anyhow!("route for unknown comtree {comt}"))?;
            match links {
                RouteLinks::Unicast(cl) => {
                    let cle = ctt
                        .clink(*cl)
                        .filter(|c| c.ctx == ctx)
                        .ok_or_else(|| anyhow!("route ({comt},{dest}) uses a bad link"))?;
                    let peer = lt
                        .get(cle.lnk)
                        .ok_or_else(|| anyhow!("route ({comt},{dest}) uses a dead link"))?;
                    let local_leaf = leaf.as_ref().map(|p| p.in_range(*dest)).unwrap_or(false);
                    if peer.peer_adr.zip() != dest.zip() && !local_leaf {
                        bail!("route ({comt},{dest}) points away from the destination zip");
                    }
                }
                RouteLinks::Multicast(set) => {
                    for cl in set {
                        if ctt.clink(*cl).filter(|c| c.ctx == ctx).is_none() {
                            bail!("route ({comt},{dest}) uses a bad link");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Recompute available rates bottom-up and fail on oversubscription.
    pub fn set_avail_rates(&self) -> Result<()> {
        let mut ift = self.ift.lock().unwrap();
        let mut lt = self.lt.lock().unwrap();
        let ctt = self.ctt.lock().unwrap();

        let ifaces: Vec<usize> = ift.iter().map(|(i, _)| i).collect();
        for iface in ifaces {
            let e = ift.get_mut(iface).expect("listed above");
            e.avail = e.rates;
        }
        let links: Vec<usize> = lt.iter().map(|(l, _)| l).collect();
        for lnk in links {
            let (iface, rates) = {
                let e = lt.get(lnk).expect("listed above");
                (e.iface, e.rates)
            };
            ift.reserve(iface, &rates)
                .map_err(|_| anyhow!("interface {iface} oversubscribed by link {lnk}"))?;
            lt.get_mut(lnk).expect("listed above").avail = rates;
        }
        for (_, e) in ctt.iter() {
            for &cl in &e.comt_links {
                let c = ctt.clink(cl).expect("set member");
                lt.reserve(c.lnk, &c.rates).map_err(|_| {
                    anyhow!("link {} oversubscribed by comtree {}", c.lnk, e.comt)
                })?;
            }
        }
        Ok(())
    }

    /// Seed unicast routes for every directly attached leaf, so traffic to
    /// a local client never floods.
    pub fn add_local_routes(&self) {
        let lt = self.lt.lock().unwrap();
        let mut ctt = self.ctt.lock().unwrap();
        let mut rt = self.rt.lock().unwrap();
        let mut seeds = Vec::new();
        for (_, e) in ctt.iter() {
            for &cl in &e.comt_links {
                let c = ctt.clink(cl).expect("set member");
                let Some(peer) = lt.get(c.lnk) else { continue };
                if peer.peer_type == NodeType::Router {
                    continue;
                }
                if !rt.contains(e.comt, peer.peer_adr) {
                    seeds.push((e.comt, peer.peer_adr, cl));
                }
            }
        }
        for (comt, dest, cl) in seeds {
            if rt.add_route(comt, dest, cl).is_ok() {
                ctt.register_rte(cl, dest);
            }
        }
    }

    // ─── link teardown ───────────────────────────────────────────────────

    /// Remove a link and everything hanging off it: routes, comtree
    /// membership, queues, rate reservations, leaf address. Takes the
    /// table locks itself; the caller must hold none of them.
    pub fn purge_link(&self, lnk: usize) -> Result<()> {
        let mut ift = self.ift.lock().unwrap();
        let mut lt = self.lt.lock().unwrap();
        let mut ctt = self.ctt.lock().unwrap();
        let mut rt = self.rt.lock().unwrap();

        let (iface, rates, peer_type, peer_adr) = {
            let e = lt.get(lnk).ok_or_else(|| anyhow!("purge_link: no link {lnk}"))?;
            (e.iface, e.rates, e.peer_type, e.peer_adr)
        };

        // phase one: snapshot what the link participates in
        let comts: Vec<u32> = lt.get(lnk).expect("checked").comtrees.iter().copied().collect();

        // phase two: drop it all
        let mut stranded: Vec<Pktx> = Vec::new();
        for comt in comts {
            let Some(ctx) = ctt.get_comt_index(comt) else { continue };
            let Some(cl) = ctt.get_comt_link(comt, lnk) else { continue };
            let routed: Vec<Fadr> = ctt
                .clink(cl)
                .map(|c| c.routes.iter().copied().collect())
                .unwrap_or_default();
            for dest in routed {
                if dest.is_mcast() {
                    let _ = rt.remove_link(comt, dest, cl);
                } else {
                    let _ = rt.remove_route(comt, dest);
                }
                ctt.deregister_rte(cl, dest);
            }
            let qid = ctt.clink(cl).map(|c| c.qid).unwrap_or(0);
            if qid != 0 {
                stranded.extend(self.qm.free_queue(qid));
            }
            let clink_rates = ctt.clink(cl).map(|c| c.rates).unwrap_or_default();
            ctt.remove_link(ctx, cl, &mut lt)
                .map_err(|e| anyhow!("purge_link: {e}"))?;
            let _ = lt.release(lnk, &clink_rates);
            // a comtree with no remaining links disappears
            if ctt.entry(ctx).map(|e| e.comt_links.is_empty()).unwrap_or(false) {
                let _ = ctt.remove_entry(ctx, &mut lt);
            }
        }
        stranded.extend(self.qm.remove_link(lnk));
        lt.remove_entry(lnk).map_err(|e| anyhow!("purge_link: {e}"))?;
        let _ = ift.release(iface, &rates);
        if peer_type == NodeType::Client {
            if let Some(pool) = self.leaf_adr.lock().unwrap().as_mut() {
                pool.free(peer_adr);
            }
        }
        drop(rt);
        drop(ctt);
        drop(lt);
        drop(ift);

        if !stranded.is_empty() {
            let mut ps = self.ps.lock().unwrap();
            for px in stranded {
                ps.free(px);
            }
        }
        info!(lnk, "link purged");
        Ok(())
    }

    // ─── run ─────────────────────────────────────────────────────────────

    /// Spawn the input and output threads and block until the configured
    /// run length elapses (or forever when it is zero).
    pub fn run(self: &Arc<Self>) -> Result<()> {
        let run_ns = self.cfg.fin_time.saturating_mul(1_000_000_000);

        let out_rtr = Arc::clone(self);
        let out = thread::Builder::new()
            .name("forest-out".into())
            .spawn(move || OutputProc::new(out_rtr).run(run_ns))
            .context("spawning output thread")?;

        let in_rtr = Arc::clone(self);
        let inp = thread::Builder::new()
            .name("forest-in".into())
            .spawn(move || InputProc::new(in_rtr).run(run_ns))
            .context("spawning input thread")?;

        let in_res = inp.join().map_err(|_| anyhow!("input thread panicked"))?;
        self.request_stop();
        out.join().map_err(|_| anyhow!("output thread panicked"))?;
        in_res?;

        self.final_dump();
        Ok(())
    }

    /// Append a stats snapshot to the stat file, if one is configured.
    pub fn record_stats(&self, now: u64) {
        let sm = self.sm.lock().unwrap();
        let mut sink = self.stat_sink.lock().unwrap();
        if let Some(f) = sink.as_mut() {
            if let Err(e) = sm.record(now, f) {
                warn!(error = %e, "stat file write failed");
            }
        }
    }

    fn final_dump(&self) {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let _ = self.pkt_log.lock().unwrap().write(&mut out);
        let (rtr, leaf) = self.sm.lock().unwrap().totals();
        let _ = writeln!(
            out,
            "\n{} packets received, {} packets sent",
            rtr.pkts_in + leaf.pkts_in,
            rtr.pkts_out + leaf.pkts_out
        );
        let _ = writeln!(out, "{} from routers, {} to routers", rtr.pkts_in, rtr.pkts_out);
        let _ = writeln!(out, "{} from clients, {} to clients", leaf.pkts_in, leaf.pkts_out);
    }
}
