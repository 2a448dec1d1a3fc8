//! Link table.
//!
//! A link is the router's end of a virtual connection to one peer: the
//! interface it rides on, the peer's transport address and forest address,
//! its provisioned rates, and the connect nonce. The (peerIp, peerPort)
//! pair and the nonce are both unique lookup keys — the nonce resolves the
//! very first CONNECT from a peer whose transport address is not yet known.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::net::Ipv4Addr;

use forest_wire::{Fadr, NodeType, RateSpec};

use super::{parse_count, parse_err, significant_lines, TableError};
use crate::listpair::ListPair;

#[derive(Debug, Clone)]
pub struct LinkEntry {
    pub iface: usize,
    pub peer_ip: Ipv4Addr,
    pub peer_port: u16,
    pub peer_type: NodeType,
    pub peer_adr: Fadr,
    /// Provisioned rates for the link.
    pub rates: RateSpec,
    /// Rate not yet committed to comtree-links.
    pub avail: RateSpec,
    pub nonce: u64,
    pub connected: bool,
    /// Queue used for traffic with no comtree queue (signalling, acks).
    pub ctl_qid: usize,
    /// Comtrees this link participates in.
    pub comtrees: BTreeSet<u32>,
}

/// The link table. Link numbers come from a fixed range `1..=max_links`.
#[derive(Debug)]
pub struct LinkTable {
    entries: BTreeMap<usize, LinkEntry>,
    numbers: ListPair,
    by_addr: HashMap<(Ipv4Addr, u16), usize>,
    by_nonce: HashMap<u64, usize>,
}

impl LinkTable {
    pub fn new(max_links: usize) -> Self {
        LinkTable {
            entries: BTreeMap::new(),
            numbers: ListPair::new(max_links),
            by_addr: HashMap::new(),
            by_nonce: HashMap::new(),
        }
    }

    /// Add a link. `lnk` of 0 means "pick any free number". The peer port
    /// may be 0 for a provisioned-but-unconnected link; such links are
    /// reachable only through their nonce until CONNECT fills the port in.
    #[allow(clippy::too_many_arguments)]
    pub fn add_entry(
        &mut self,
        lnk: usize,
        iface: usize,
        peer_ip: Ipv4Addr,
        peer_port: u16,
        peer_type: NodeType,
        peer_adr: Fadr,
        rates: RateSpec,
        nonce: u64,
    ) -> Result<usize, TableError> {
        if !peer_adr.is_valid_ucast() {
            return Err(TableError::Invalid("peer address must be valid unicast"));
        }
        if iface == 0 {
            return Err(TableError::Invalid("link needs an interface"));
        }
        if peer_port != 0 && self.by_addr.contains_key(&(peer_ip, peer_port)) {
            return Err(TableError::Exists);
        }
        if self.by_nonce.contains_key(&nonce) {
            return Err(TableError::Exists);
        }
        let lnk = if lnk == 0 {
            let n = self.numbers.claim_any();
            if n == 0 {
                return Err(TableError::InUse("no free link numbers"));
            }
            n
        } else {
            if !self.numbers.claim(lnk) {
                return Err(TableError::Exists);
            }
            lnk
        };
        if peer_port != 0 {
            self.by_addr.insert((peer_ip, peer_port), lnk);
        }
        self.by_nonce.insert(nonce, lnk);
        self.entries.insert(
            lnk,
            LinkEntry {
                iface,
                peer_ip,
                peer_port,
                peer_type,
                peer_adr,
                rates,
                avail: rates,
                nonce,
                connected: false,
                ctl_qid: 0,
                comtrees: BTreeSet::new(),
            },
        );
        Ok(lnk)
    }

    /// Remove a link. Refused while the link still participates in any
    /// comtree; `purge_link` at the router level clears those first.
    pub fn remove_entry(&mut self, lnk: usize) -> Result<LinkEntry, TableError> {
        let e = self.entries.get(&lnk).ok_or(TableError::NotFound)?;
        if !e.comtrees.is_empty() {
            return Err(TableError::InUse("link still registered in comtrees"));
        }
        let e = self.entries.remove(&lnk).expect("checked above");
        self.by_addr.remove(&(e.peer_ip, e.peer_port));
        self.by_nonce.remove(&e.nonce);
        self.numbers.release(lnk);
        Ok(e)
    }

    pub fn valid(&self, lnk: usize) -> bool {
        self.entries.contains_key(&lnk)
    }

    pub fn get(&self, lnk: usize) -> Option<&LinkEntry> {
        self.entries.get(&lnk)
    }

    pub fn get_mut(&mut self, lnk: usize) -> Option<&mut LinkEntry> {
        self.entries.get_mut(&lnk)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &LinkEntry)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve the link a datagram arrived on.
    pub fn lookup(&self, ip: Ipv4Addr, port: u16) -> Option<usize> {
        self.by_addr.get(&(ip, port)).copied()
    }

    /// Resolve a "startup" link by its connect nonce.
    pub fn lookup_nonce(&self, nonce: u64) -> Option<usize> {
        self.by_nonce.get(&nonce).copied()
    }

    /// Fill in (or change) the peer transport address, re-keying the
    /// lookup map. Used when the first CONNECT resolves a nonce entry.
    pub fn set_peer_addr(
        &mut self,
        lnk: usize,
        ip: Ipv4Addr,
        port: u16,
    ) -> Result<(), TableError> {
        if port != 0 {
            if let Some(&other) = self.by_addr.get(&(ip, port)) {
                if other != lnk {
                    return Err(TableError::Exists);
                }
            }
        }
        let e = self.entries.get_mut(&lnk).ok_or(TableError::NotFound)?;
        self.by_addr.remove(&(e.peer_ip, e.peer_port));
        e.peer_ip = ip;
        e.peer_port = port;
        if port != 0 {
            self.by_addr.insert((ip, port), lnk);
        }
        Ok(())
    }

    pub fn register_comt(&mut self, lnk: usize, comt: u32) -> bool {
        match self.entries.get_mut(&lnk) {
            Some(e) => {
                e.comtrees.insert(comt);
                true
            }
            None => false,
        }
    }

    pub fn deregister_comt(&mut self, lnk: usize, comt: u32) -> bool {
        match self.entries.get_mut(&lnk) {
            Some(e) => e.comtrees.remove(&comt),
            None => false,
        }
    }

    /// Commit a slice of the link's available rate to a comtree-link.
    pub fn reserve(&mut self, lnk: usize, rs: &RateSpec) -> Result<(), TableError> {
        let e = self.entries.get_mut(&lnk).ok_or(TableError::NotFound)?;
        if !rs.leq(&e.avail) {
            return Err(TableError::RateOverflow);
        }
        e.avail.subtract(rs);
        Ok(())
    }

    pub fn release(&mut self, lnk: usize, rs: &RateSpec) -> Result<(), TableError> {
        let e = self.entries.get_mut(&lnk).ok_or(TableError::NotFound)?;
        e.avail.add(rs);
        Ok(())
    }

    // ─── file format ─────────────────────────────────────────────────────
    //
    //   <count>
    //   lnum peerIp:peerPort peerType peerAdr iface rates nonce

    pub fn parse(input: &str) -> Result<Self, TableError> {
        let mut lines = significant_lines(input);
        let count = parse_count(lines.next().ok_or(parse_err(0, "empty link table"))?)?;
        let mut tbl = LinkTable::new((count + 1).max(32));
        for _ in 0..count {
            let (ln, text) = lines
                .next()
                .ok_or(parse_err(0, "fewer entries than the count line promises"))?;
            tbl.parse_entry(ln, text)?;
        }
        Ok(tbl)
    }

    fn parse_entry(&mut self, ln: usize, text: &str) -> Result<(), TableError> {
        let mut tok = text.split_whitespace();
        let mut next = |what: &str| {
            tok.next()
                .ok_or_else(|| parse_err(ln, format!("missing {what}")))
        };
        let lnk: usize = next("link number")?
            .parse()
            .map_err(|_| parse_err(ln, "bad link number"))?;
        let (ip_s, port_s) = next("peerIp:peerPort")?
            .split_once(':')
            .ok_or_else(|| parse_err(ln, "expected peerIp:peerPort"))?;
        let peer_ip: Ipv4Addr = ip_s.parse().map_err(|_| parse_err(ln, "bad peer IP"))?;
        let peer_port: u16 = port_s.parse().map_err(|_| parse_err(ln, "bad peer port"))?;
        let peer_type: NodeType = next("peer type")?
            .parse()
            .map_err(|e| parse_err(ln, e))?;
        let peer_adr: Fadr = next("peer address")?
            .parse()
            .map_err(|e| parse_err(ln, e))?;
        let iface: usize = next("interface")?
            .parse()
            .map_err(|_| parse_err(ln, "bad interface number"))?;
        let rates: RateSpec = next("rates")?.parse().map_err(|e| parse_err(ln, e))?;
        let nonce: u64 = next("nonce")?
            .parse()
            .map_err(|_| parse_err(ln, "bad nonce"))?;
        self.add_entry(lnk, iface, peer_ip, peer_port, peer_type, peer_adr, rates, nonce)
            .map(|_| ())
            .map_err(|e| parse_err(ln, e.to_string()))
    }

    pub fn to_file_string(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "{}", self.entries.len());
        let _ = writeln!(s, "# lnum  peerIp:port  type  peerAdr  iface  rates  nonce");
        for (lnk, e) in &self.entries {
            let _ = writeln!(
                s,
                "{} {}:{} {} {} {} {} {}",
                lnk, e.peer_ip, e.peer_port, e.peer_type, e.peer_adr, e.iface, e.rates, e.nonce
            );
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn add(t: &mut LinkTable, lnk: usize, port: u16, nonce: u64) -> usize {
        t.add_entry(
            lnk,
            1,
            ip("10.0.0.2"),
            port,
            NodeType::Client,
            Fadr::unicast(1, lnk as u16 + 10),
            RateSpec::symmetric(1000, 500),
            nonce,
        )
        .unwrap()
    }

    #[test]
    fn lookup_by_addr_and_nonce() {
        let mut t = LinkTable::new(8);
        let a = add(&mut t, 3, 5001, 111);
        let b = add(&mut t, 0, 5002, 222);
        assert_eq!(a, 3);
        assert_ne!(b, 0);
        assert_eq!(t.lookup(ip("10.0.0.2"), 5001), Some(3));
        assert_eq!(t.lookup(ip("10.0.0.2"), 9999), None);
        assert_eq!(t.lookup_nonce(222), Some(b));
        assert_eq!(t.lookup_nonce(333), None);
    }

    #[test]
    fn duplicate_keys_rejected() {
        let mut t = LinkTable::new(8);
        add(&mut t, 1, 5001, 111);
        // same transport address
        assert!(t
            .add_entry(
                2,
                1,
                ip("10.0.0.2"),
                5001,
                NodeType::Client,
                Fadr::unicast(1, 99),
                RateSpec::default(),
                999,
            )
            .is_err());
        // same nonce
        assert!(t
            .add_entry(
                2,
                1,
                ip("10.0.0.3"),
                5009,
                NodeType::Client,
                Fadr::unicast(1, 99),
                RateSpec::default(),
                111,
            )
            .is_err());
        // same link number
        assert!(t
            .add_entry(
                1,
                1,
                ip("10.0.0.4"),
                5010,
                NodeType::Client,
                Fadr::unicast(1, 98),
                RateSpec::default(),
                555,
            )
            .is_err());
    }

    #[test]
    fn startup_entry_gets_address_on_connect() {
        let mut t = LinkTable::new(8);
        let lnk = t
            .add_entry(
                0,
                1,
                ip("0.0.0.0"),
                0,
                NodeType::Client,
                Fadr::unicast(1, 20),
                RateSpec::default(),
                777,
            )
            .unwrap();
        // not reachable by address yet
        assert_eq!(t.lookup(ip("10.9.9.9"), 4000), None);
        assert_eq!(t.lookup_nonce(777), Some(lnk));

        t.set_peer_addr(lnk, ip("10.9.9.9"), 4000).unwrap();
        assert_eq!(t.lookup(ip("10.9.9.9"), 4000), Some(lnk));
    }

    #[test]
    fn remove_refused_while_in_comtree() {
        let mut t = LinkTable::new(8);
        let lnk = add(&mut t, 1, 5001, 111);
        t.register_comt(lnk, 100);
        assert!(matches!(t.remove_entry(lnk), Err(TableError::InUse(_))));
        t.deregister_comt(lnk, 100);
        assert!(t.remove_entry(lnk).is_ok());
        // number and keys are reusable afterwards
        assert_eq!(t.lookup_nonce(111), None);
        add(&mut t, 1, 5001, 111);
    }

    #[test]
    fn rate_reservation() {
        let mut t = LinkTable::new(4);
        let lnk = add(&mut t, 1, 5001, 1);
        let slice = RateSpec::symmetric(800, 400);
        t.reserve(lnk, &slice).unwrap();
        assert_eq!(t.reserve(lnk, &slice), Err(TableError::RateOverflow));
        t.release(lnk, &slice).unwrap();
        assert_eq!(t.get(lnk).unwrap().avail, RateSpec::symmetric(1000, 500));
    }

    #[test]
    fn invalid_peer_address_rejected() {
        let mut t = LinkTable::new(4);
        assert!(t
            .add_entry(
                1,
                1,
                ip("10.0.0.2"),
                5001,
                NodeType::Client,
                Fadr(0),
                RateSpec::default(),
                1,
            )
            .is_err());
    }

    #[test]
    fn file_roundtrip() {
        let text = "\
2
# lnum peerIp:port type peerAdr iface rates nonce
1 10.0.0.5:30000 router 2.1 1 (40000,40000,20000,20000) 12345
2 10.0.0.6:0 client 1.5 1 (1000,1000,500,500) 67890
";
        let t = LinkTable::parse(text).unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(1).unwrap().peer_type, NodeType::Router);
        assert_eq!(t.get(1).unwrap().peer_adr, Fadr::unicast(2, 1));
        assert_eq!(t.get(2).unwrap().peer_port, 0);
        assert_eq!(t.lookup_nonce(67890), Some(2));

        let again = LinkTable::parse(&t.to_file_string()).unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(again.get(1).unwrap().nonce, 12345);
        assert_eq!(
            again.get(1).unwrap().rates,
            RateSpec::symmetric(40000, 20000)
        );
    }
}
