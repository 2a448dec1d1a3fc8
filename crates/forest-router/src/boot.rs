//! # Remote boot handshake
//!
//! In remote mode the router starts with almost nothing: a boot IP and the
//! network manager's address. It announces itself with a BOOT_ROUTER
//! request, then follows the manager's lead: a BOOT_CONFIG request carries
//! the router's forest address, its leaf-address range and its first
//! router peer (with the connect nonce); BOOT_COMPLETE ends the boot
//! phase; BOOT_ABORT kills the router. Everything rides a dedicated boot
//! socket that never mixes with data-plane traffic.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use forest_wire::signal::{SigAttr, SigMode, SigPacket, SigType};
use forest_wire::{Fadr, NodeType, Packet, PacketType, RateSpec, NM_PORT};
use tracing::{debug, info, warn};

use crate::router::{LeafPool, Router};

/// Outer retry rounds for the initial announcement.
const BOOT_TRIES: usize = 4;
/// Receive polls per round.
const POLLS_PER_TRY: usize = 10;
/// Pacing between polls.
const POLL_MS: u64 = 100;

/// What one poll of the boot socket produced.
#[derive(Debug, PartialEq, Eq)]
pub enum BootEvent {
    /// Nothing waiting.
    Idle,
    /// A boot request was handled and answered.
    Handled,
    /// BOOT_COMPLETE processed; the router is live.
    Complete,
}

pub struct BootLink {
    sock: UdpSocket,
    nm: SocketAddrV4,
    nm_adr: Fadr,
}

impl BootLink {
    /// Bind the boot socket to the configured boot IP.
    pub fn open(rtr: &Router) -> Result<Self> {
        let boot_ip = rtr.cfg.boot_ip.ok_or_else(|| anyhow!("no boot IP"))?;
        let nm_ip = rtr.cfg.nm_ip.ok_or_else(|| anyhow!("no net manager IP"))?;
        let sock = UdpSocket::bind(SocketAddrV4::new(boot_ip, 0))
            .with_context(|| format!("binding boot socket to {boot_ip}"))?;
        sock.set_nonblocking(true)?;
        Ok(BootLink {
            sock,
            nm: SocketAddrV4::new(nm_ip, NM_PORT),
            nm_adr: rtr.cfg.nm_adr,
        })
    }

    /// Announce ourselves and wait for the manager's positive reply.
    pub fn start(&self, rtr: &Router) -> Result<()> {
        for round in 0..BOOT_TRIES {
            let req = SigPacket::new(SigType::BootRouter, SigMode::Request, rtr.next_seq());
            self.send_sig(rtr, &req)?;
            debug!(round, "boot announcement sent");
            for _ in 0..POLLS_PER_TRY {
                std::thread::sleep(Duration::from_millis(POLL_MS));
                let Some(sig) = self.recv_sig(rtr)? else { continue };
                if sig.typ == SigType::BootRouter && sig.mode == SigMode::PosReply {
                    info!("network manager acknowledged boot");
                    return Ok(());
                }
                // anything else is early; the manager will repeat it
            }
        }
        bail!("could not reach the network manager");
    }

    /// Handle at most one waiting boot packet.
    pub fn poll(&self, rtr: &Router) -> Result<BootEvent> {
        let Some(sig) = self.recv_sig(rtr)? else {
            return Ok(BootEvent::Idle);
        };
        if sig.mode != SigMode::Request {
            return Ok(BootEvent::Idle);
        }
        match sig.typ {
            SigType::BootConfig => {
                match self.apply_config(rtr, &sig) {
                    Ok(()) => self.send_sig(rtr, &sig.pos_reply())?,
                    Err(e) => {
                        warn!(error = %e, "bad boot configuration");
                        self.send_sig(rtr, &sig.neg_reply(&e.to_string()))?;
                    }
                }
                Ok(BootEvent::Handled)
            }
            SigType::BootComplete => {
                self.send_sig(rtr, &sig.pos_reply())?;
                rtr.set_booting(false);
                info!(my_adr = %rtr.my_adr(), "boot complete");
                Ok(BootEvent::Complete)
            }
            SigType::BootAbort => {
                self.send_sig(rtr, &sig.pos_reply())?;
                bail!("remote boot aborted by the network manager");
            }
            _ => Ok(BootEvent::Idle),
        }
    }

    /// Apply a BOOT_CONFIG: adopt our identity, the leaf range, and the
    /// first router peer (reachable through the given nonce).
    fn apply_config(&self, rtr: &Router, sig: &SigPacket) -> Result<()> {
        let my_adr = sig
            .get_adr(SigAttr::RtrAdr)
            .filter(|a| a.is_valid_ucast())
            .ok_or_else(|| anyhow!("config without a router address"))?;
        rtr.set_my_adr(my_adr);
        if let Some(adr) = sig.get_adr(SigAttr::NetMgrAdr) {
            rtr.set_nm_adr(adr);
        }

        if let (Some(first), Some(last)) = (
            sig.get_adr(SigAttr::FirstLeafAdr),
            sig.get_adr(SigAttr::LastLeafAdr),
        ) {
            if !first.is_valid_ucast() || last.raw() < first.raw() {
                bail!("bad leaf address range");
            }
            *rtr.leaf_adr.lock().unwrap() = Some(LeafPool::new(first, last));
        }

        // the data-plane interface comes up on the boot IP
        let iface = 1;
        {
            let mut ift = rtr.ift.lock().unwrap();
            if !ift.valid(iface) {
                ift.add_entry(
                    iface,
                    rtr.cfg.boot_ip.expect("remote mode"),
                    rtr.cfg.port_num,
                    RateSpec::symmetric(500_000, 250_000),
                )
                .map_err(|e| anyhow!("interface setup: {e}"))?;
            }
        }
        if rtr.socket_for(iface).is_none() {
            rtr.setup_iface(iface)?;
        }

        // provision the link to our first router peer
        let peer_ip = Ipv4Addr::from(
            sig.get(SigAttr::PeerIp)
                .ok_or_else(|| anyhow!("config without a peer IP"))? as u32,
        );
        let peer_port = sig
            .get(SigAttr::PeerPort)
            .ok_or_else(|| anyhow!("config without a peer port"))? as u16;
        let peer_adr = sig
            .get_adr(SigAttr::PeerAdr)
            .filter(|a| a.is_valid_ucast())
            .ok_or_else(|| anyhow!("config without a peer address"))?;
        let nonce = sig
            .get(SigAttr::Nonce)
            .ok_or_else(|| anyhow!("config without a nonce"))?;
        let rates = sig
            .get_rates()
            .unwrap_or(RateSpec::symmetric(100_000, 50_000));

        let mut ift = rtr.ift.lock().unwrap();
        let mut lt = rtr.lt.lock().unwrap();
        if lt.lookup_nonce(nonce).is_some() {
            // the manager repeated a config we already applied
            return Ok(());
        }
        ift.reserve(iface, &rates)
            .map_err(|e| anyhow!("interface capacity: {e}"))?;
        let lnk = lt
            .add_entry(0, iface, peer_ip, peer_port, NodeType::Router, peer_adr, rates, nonce)
            .map_err(|e| anyhow!("peer link: {e}"))?;
        rtr.qm.add_link(lnk, &rates);
        let qid = rtr.qm.alloc_queue(lnk);
        rtr.qm.set_queue_rates(qid, &rates);
        lt.get_mut(lnk).expect("just added").ctl_qid = qid;
        info!(lnk, peer = %peer_adr, "router peer provisioned");
        Ok(())
    }

    // ─── boot-socket I/O ─────────────────────────────────────────────────

    fn send_sig(&self, rtr: &Router, sig: &SigPacket) -> Result<()> {
        let pkt = Packet::new(
            PacketType::NetSig,
            0, // boot traffic rides outside any comtree
            rtr.my_adr(),
            self.nm_adr,
            sig.encode(),
        );
        let wire = pkt.encode();
        let mut tries = 0;
        loop {
            match self.sock.send_to(&wire, self.nm) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock && tries < 10 => {
                    tries += 1;
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e).context("boot send"),
            }
        }
    }

    /// Read one datagram from the boot socket, keeping only signalling
    /// from the network manager.
    fn recv_sig(&self, _rtr: &Router) -> Result<Option<SigPacket>> {
        let mut buf = [0u8; 1600];
        let (n, src) = match self.sock.recv_from(&mut buf) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e).context("boot receive"),
        };
        let std::net::SocketAddr::V4(src) = src else {
            return Ok(None);
        };
        if src.ip() != self.nm.ip() {
            return Ok(None);
        }
        let Some(pkt) = Packet::decode(&buf[..n]) else {
            return Ok(None);
        };
        if pkt.header.ptype != PacketType::NetSig || pkt.header.src != self.nm_adr {
            return Ok(None);
        }
        Ok(SigPacket::decode(&pkt.payload))
    }
}
