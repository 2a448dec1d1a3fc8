//! Interface table.
//!
//! One entry per UDP interface the router terminates. Each interface has a
//! maximum rate and an available rate; links provisioned on the interface
//! draw from the available rate.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::Ipv4Addr;

use forest_wire::RateSpec;

use super::{parse_count, parse_err, significant_lines, TableError};

#[derive(Debug, Clone)]
pub struct IfaceEntry {
    pub ip: Ipv4Addr,
    pub port: u16,
    /// Maximum rate the interface can carry.
    pub rates: RateSpec,
    /// Rate not yet committed to links.
    pub avail: RateSpec,
}

#[derive(Debug, Default)]
pub struct IfaceTable {
    entries: BTreeMap<usize, IfaceEntry>,
    default_iface: usize,
}

impl IfaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(
        &mut self,
        iface: usize,
        ip: Ipv4Addr,
        port: u16,
        rates: RateSpec,
    ) -> Result<(), TableError> {
        if iface == 0 {
            return Err(TableError::Invalid("interface number must be positive"));
        }
        if self.entries.contains_key(&iface) {
            return Err(TableError::Exists);
        }
        if self.default_iface == 0 {
            self.default_iface = iface;
        }
        self.entries.insert(
            iface,
            IfaceEntry {
                ip,
                port,
                rates,
                avail: rates,
            },
        );
        Ok(())
    }

    pub fn remove_entry(&mut self, iface: usize) -> Result<(), TableError> {
        self.entries
            .remove(&iface)
            .ok_or(TableError::NotFound)?;
        if self.default_iface == iface {
            self.default_iface = self.entries.keys().next().copied().unwrap_or(0);
        }
        Ok(())
    }

    pub fn valid(&self, iface: usize) -> bool {
        self.entries.contains_key(&iface)
    }

    pub fn get(&self, iface: usize) -> Option<&IfaceEntry> {
        self.entries.get(&iface)
    }

    pub fn get_mut(&mut self, iface: usize) -> Option<&mut IfaceEntry> {
        self.entries.get_mut(&iface)
    }

    pub fn default_iface(&self) -> usize {
        self.default_iface
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &IfaceEntry)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Commit a slice of an interface's available rate to a link.
    pub fn reserve(&mut self, iface: usize, rs: &RateSpec) -> Result<(), TableError> {
        let e = self.entries.get_mut(&iface).ok_or(TableError::NotFound)?;
        if !rs.leq(&e.avail) {
            return Err(TableError::RateOverflow);
        }
        e.avail.subtract(rs);
        Ok(())
    }

    /// Return a previously reserved rate slice.
    pub fn release(&mut self, iface: usize, rs: &RateSpec) -> Result<(), TableError> {
        let e = self.entries.get_mut(&iface).ok_or(TableError::NotFound)?;
        e.avail.add(rs);
        Ok(())
    }

    // ─── file format ─────────────────────────────────────────────────────
    //
    //   <count>
    //   ifnum ip:port bitRate pktRate

    pub fn parse(input: &str) -> Result<Self, TableError> {
        let mut lines = significant_lines(input);
        let count = parse_count(lines.next().ok_or(parse_err(0, "empty interface table"))?)?;
        let mut tbl = IfaceTable::new();
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
        let iface: usize = next("interface number")?
            .parse()
            .map_err(|_| parse_err(ln, "bad interface number"))?;
        let (ip_s, port_s) = next("ip:port")?
            .split_once(':')
            .ok_or_else(|| parse_err(ln, "expected ip:port"))?;
        let ip: Ipv4Addr = ip_s.parse().map_err(|_| parse_err(ln, "bad IP address"))?;
        let port: u16 = port_s.parse().map_err(|_| parse_err(ln, "bad port"))?;
        let brate: i32 = next("bit rate")?
            .parse()
            .map_err(|_| parse_err(ln, "bad bit rate"))?;
        let prate: i32 = next("packet rate")?
            .parse()
            .map_err(|_| parse_err(ln, "bad packet rate"))?;
        self.add_entry(iface, ip, port, RateSpec::symmetric(brate, prate))
            .map_err(|e| parse_err(ln, e.to_string()))
    }

    pub fn to_file_string(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "{}", self.entries.len());
        let _ = writeln!(s, "# ifnum  ip:port  bitRate  pktRate");
        for (iface, e) in &self.entries {
            let _ = writeln!(
                s,
                "{} {}:{} {} {}",
                iface, e.ip, e.port, e.rates.bit_rate_down, e.rates.pkt_rate_down
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

    #[test]
    fn add_remove_default() {
        let mut t = IfaceTable::new();
        t.add_entry(1, ip("10.0.0.1"), 30123, RateSpec::symmetric(50000, 25000))
            .unwrap();
        t.add_entry(2, ip("10.0.0.2"), 30124, RateSpec::symmetric(50000, 25000))
            .unwrap();
        assert_eq!(t.default_iface(), 1);
        assert_eq!(t.add_entry(1, ip("10.0.0.9"), 1, RateSpec::default()),
                   Err(TableError::Exists));

        t.remove_entry(1).unwrap();
        assert_eq!(t.default_iface(), 2);
        assert_eq!(t.remove_entry(1), Err(TableError::NotFound));
    }

    #[test]
    fn reserve_release_accounting() {
        let mut t = IfaceTable::new();
        t.add_entry(1, ip("10.0.0.1"), 0, RateSpec::symmetric(1000, 100))
            .unwrap();
        let slice = RateSpec::symmetric(600, 60);
        t.reserve(1, &slice).unwrap();
        assert_eq!(t.get(1).unwrap().avail, RateSpec::symmetric(400, 40));
        // a second identical reservation exceeds what is left
        assert_eq!(t.reserve(1, &slice), Err(TableError::RateOverflow));
        t.release(1, &slice).unwrap();
        assert_eq!(t.get(1).unwrap().avail, RateSpec::symmetric(1000, 100));
    }

    #[test]
    fn file_roundtrip() {
        let text = "\
2
# ifnum ip:port bitRate pktRate
1 192.168.1.1:30123 50000 25000
2 192.168.1.2:30124 40000 20000
";
        let t = IfaceTable::parse(text).unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(2).unwrap().port, 30124);

        let again = IfaceTable::parse(&t.to_file_string()).unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(again.get(1).unwrap().ip, ip("192.168.1.1"));
        assert_eq!(again.get(1).unwrap().rates, RateSpec::symmetric(50000, 25000));
    }

    #[test]
    fn parse_rejects_short_file() {
        assert!(IfaceTable::parse("3\n1 10.0.0.1:1 1 1\n").is_err());
        assert!(IfaceTable::parse("").is_err());
        assert!(IfaceTable::parse("1\n1 nonsense 1 1\n").is_err());
    }
}
