//! Route table.
//!
//! Maps (comtree, destination) to where the packet should go next: a
//! single comtree-link for unicast destinations, a set of comtree-links
//! for multicast ones. Multicast routes grow and shrink with SUB_UNSUB
//! traffic; unicast routes are configured or learned from route replies.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;

use forest_wire::Fadr;

use super::{parse_count, parse_err, significant_lines, TableError};
use crate::tables::comtree::CLnk;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteLinks {
    Unicast(CLnk),
    Multicast(BTreeSet<CLnk>),
}

#[derive(Debug, Default)]
pub struct RouteTable {
    routes: HashMap<(u32, Fadr), RouteLinks>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a route. For multicast destinations the link seeds the set.
    pub fn add_route(&mut self, comt: u32, dest: Fadr, cl: CLnk) -> Result<(), TableError> {
        if !dest.is_valid() {
            return Err(TableError::Invalid("bad destination address"));
        }
        if self.routes.contains_key(&(comt, dest)) {
            return Err(TableError::Exists);
        }
        let links = if dest.is_mcast() {
            RouteLinks::Multicast(BTreeSet::from([cl]))
        } else {
            RouteLinks::Unicast(cl)
        };
        self.routes.insert((comt, dest), links);
        Ok(())
    }

    pub fn remove_route(&mut self, comt: u32, dest: Fadr) -> Result<RouteLinks, TableError> {
        self.routes.remove(&(comt, dest)).ok_or(TableError::NotFound)
    }

    pub fn lookup(&self, comt: u32, dest: Fadr) -> Option<&RouteLinks> {
        self.routes.get(&(comt, dest))
    }

    pub fn contains(&self, comt: u32, dest: Fadr) -> bool {
        self.routes.contains_key(&(comt, dest))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(u32, Fadr), &RouteLinks)> {
        self.routes.iter()
    }

    /// Add a comtree-link to a multicast route. Returns true if the set
    /// changed (false for duplicates — R4 idempotence).
    pub fn add_link(&mut self, comt: u32, dest: Fadr, cl: CLnk) -> Result<bool, TableError> {
        match self.routes.get_mut(&(comt, dest)) {
            Some(RouteLinks::Multicast(set)) => Ok(set.insert(cl)),
            Some(RouteLinks::Unicast(_)) => {
                Err(TableError::Invalid("cannot add links to a unicast route"))
            }
            None => Err(TableError::NotFound),
        }
    }

    /// Remove a comtree-link from a multicast route. Returns true when the
    /// route became empty and was dropped.
    pub fn remove_link(&mut self, comt: u32, dest: Fadr, cl: CLnk) -> Result<bool, TableError> {
        match self.routes.get_mut(&(comt, dest)) {
            Some(RouteLinks::Multicast(set)) => {
                set.remove(&cl);
                if set.is_empty() {
                    self.routes.remove(&(comt, dest));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Some(RouteLinks::Unicast(_)) => {
                Err(TableError::Invalid("cannot remove links from a unicast route"))
            }
            None => Err(TableError::NotFound),
        }
    }

    /// Drop every route that passes through the given comtree-link.
    /// Returns the (comtree, dest) pairs whose route disappeared.
    pub fn purge_clink(&mut self, cl: CLnk) -> Vec<(u32, Fadr)> {
        let mut dropped = Vec::new();
        self.routes.retain(|key, links| match links {
            RouteLinks::Unicast(c) => {
                if *c == cl {
                    dropped.push(*key);
                    false
                } else {
                    true
                }
            }
            RouteLinks::Multicast(set) => {
                set.remove(&cl);
                if set.is_empty() {
                    dropped.push(*key);
                    false
                } else {
                    true
                }
            }
        });
        dropped
    }

    // ─── file format ─────────────────────────────────────────────────────
    //
    //   <count>
    //   comtree destination link-or-comma-separated-links

    pub fn parse(input: &str) -> Result<Self, TableError> {
        let mut lines = significant_lines(input);
        let count = parse_count(lines.next().ok_or(parse_err(0, "empty route table"))?)?;
        let mut tbl = RouteTable::new();
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
        let comt: u32 = next("comtree")?
            .parse()
            .map_err(|_| parse_err(ln, "bad comtree number"))?;
        let dest: Fadr = next("destination")?.parse().map_err(|e| parse_err(ln, e))?;
        let links = next("links")?;
        let mut parsed = links.split(',').map(|p| {
            p.trim()
                .parse::<CLnk>()
                .map_err(|_| parse_err(ln, "bad link in route"))
        });
        let first = parsed.next().ok_or_else(|| parse_err(ln, "empty link list"))??;
        self.add_route(comt, dest, first)
            .map_err(|e| parse_err(ln, e.to_string()))?;
        for p in parsed {
            self.add_link(comt, dest, p?)
                .map_err(|e| parse_err(ln, e.to_string()))?;
        }
        Ok(())
    }

    pub fn to_file_string(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "{}", self.routes.len());
        let _ = writeln!(s, "# comtree  destination  links");
        let mut keys: Vec<_> = self.routes.keys().collect();
        keys.sort();
        for key in keys {
            let (comt, dest) = key;
            let _ = write!(s, "{comt} {dest} ");
            match &self.routes[key] {
                RouteLinks::Unicast(cl) => {
                    let _ = writeln!(s, "{cl}");
                }
                RouteLinks::Multicast(set) => {
                    let list: Vec<String> = set.iter().map(|c| c.to_string()).collect();
                    let _ = writeln!(s, "{}", list.join(","));
                }
            }
        }
        s
    }
}
