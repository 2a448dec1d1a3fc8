//! Comtree table.
//!
//! Per-comtree forwarding state: the parent link, the core flag, and the
//! set of comtree-links. A comtree-link is one (comtree, link) slot with
//! its own allowed destination, rates, queue and registered routes.
//!
//! Invariants, checked on load and after every mutation:
//! - every link in `rtr_links` is a comtree link whose peer is a router;
//! - `core_links ⊆ rtr_links`;
//! - the parent link, if set, is in `rtr_links`;
//! - in core with a parent: the parent is a core link;
//! - not in core: at most one core link, and that link is the parent.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;

use forest_wire::{Fadr, NodeType, RateSpec};
use forest_wire::rates::{MIN_BIT_RATE, MIN_PKT_RATE};
use slab::Slab;

use super::{parse_count, parse_err, significant_lines, LinkTable, TableError};

/// Comtree index, 1-based. Zero is invalid.
pub type Ctx = usize;
/// Comtree-link index, 1-based. Zero is invalid.
pub type CLnk = usize;

#[derive(Debug, Clone)]
pub struct ComtreeEntry {
    pub comt: u32,
    /// Link toward the comtree parent; 0 at the root.
    pub plnk: usize,
    /// True if this router is in the comtree's core.
    pub in_core: bool,
    pub comt_links: BTreeSet<CLnk>,
    pub rtr_links: BTreeSet<CLnk>,
    pub core_links: BTreeSet<CLnk>,
}

#[derive(Debug, Clone)]
pub struct ComtLinkEntry {
    pub ctx: Ctx,
    pub lnk: usize,
    /// If non-zero, the only unicast destination allowed in from this link.
    pub dest: Fadr,
    pub rates: RateSpec,
    /// Scheduler queue for this comtree-link.
    pub qid: usize,
    /// Multicast destinations routed through this comtree-link.
    pub routes: BTreeSet<Fadr>,
}

#[derive(Debug, Default)]
pub struct ComtreeTable {
    entries: Slab<ComtreeEntry>,
    clinks: Slab<ComtLinkEntry>,
    by_comt: HashMap<u32, Ctx>,
    by_comt_link: HashMap<(u32, usize), CLnk>,
}

impl ComtreeTable {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── lookups ─────────────────────────────────────────────────────────

    pub fn get_comt_index(&self, comt: u32) -> Option<Ctx> {
        self.by_comt.get(&comt).copied()
    }

    pub fn get_comt_link(&self, comt: u32, lnk: usize) -> Option<CLnk> {
        self.by_comt_link.get(&(comt, lnk)).copied()
    }

    pub fn entry(&self, ctx: Ctx) -> Option<&ComtreeEntry> {
        self.entries.get(ctx.wrapping_sub(1))
    }

    pub fn clink(&self, cl: CLnk) -> Option<&ComtLinkEntry> {
        self.clinks.get(cl.wrapping_sub(1))
    }

    pub fn clink_mut(&mut self, cl: CLnk) -> Option<&mut ComtLinkEntry> {
        self.clinks.get_mut(cl.wrapping_sub(1))
    }

    pub fn comtree(&self, ctx: Ctx) -> u32 {
        self.entry(ctx).map(|e| e.comt).unwrap_or(0)
    }

    /// Link number behind a comtree-link.
    pub fn link(&self, cl: CLnk) -> usize {
        self.clink(cl).map(|e| e.lnk).unwrap_or(0)
    }

    pub fn plnk(&self, ctx: Ctx) -> usize {
        self.entry(ctx).map(|e| e.plnk).unwrap_or(0)
    }

    pub fn in_core(&self, ctx: Ctx) -> bool {
        self.entry(ctx).map(|e| e.in_core).unwrap_or(false)
    }

    pub fn is_link(&self, ctx: Ctx, lnk: usize) -> bool {
        self.get_comt_link(self.comtree(ctx), lnk)
            .map(|cl| self.entry(ctx).is_some_and(|e| e.comt_links.contains(&cl)))
            .unwrap_or(false)
    }

    pub fn is_rtr_link(&self, ctx: Ctx, lnk: usize) -> bool {
        self.get_comt_link(self.comtree(ctx), lnk)
            .map(|cl| self.entry(ctx).is_some_and(|e| e.rtr_links.contains(&cl)))
            .unwrap_or(false)
    }

    pub fn is_core_link(&self, ctx: Ctx, lnk: usize) -> bool {
        self.get_comt_link(self.comtree(ctx), lnk)
            .map(|cl| self.entry(ctx).is_some_and(|e| e.core_links.contains(&cl)))
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Ctx, &ComtreeEntry)> {
        self.entries.iter().map(|(k, v)| (k + 1, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ─── mutations ───────────────────────────────────────────────────────

    pub fn add_entry(&mut self, comt: u32) -> Result<Ctx, TableError> {
        if comt == 0 {
            return Err(TableError::Invalid("comtree number must be positive"));
        }
        if self.by_comt.contains_key(&comt) {
            return Err(TableError::Exists);
        }
        let ctx = self.entries.insert(ComtreeEntry {
            comt,
            plnk: 0,
            in_core: false,
            comt_links: BTreeSet::new(),
            rtr_links: BTreeSet::new(),
            core_links: BTreeSet::new(),
        }) + 1;
        self.by_comt.insert(comt, ctx);
        Ok(ctx)
    }

    /// Remove a comtree entry and all its comtree-links. Refused while any
    /// comtree-link still has registered routes.
    pub fn remove_entry(&mut self, ctx: Ctx, lt: &mut LinkTable) -> Result<(), TableError> {
        let e = self.entry(ctx).ok_or(TableError::NotFound)?;
        if e
            .comt_links
            .iter()
            .any(|&cl| self.clink(cl).map(|c| !c.routes.is_empty()).unwrap_or(false))
        {
            return Err(TableError::InUse("comtree still has subscribed routes"));
        }
        // snapshot, then drop — the sets are mutated as links go
        let snapshot: Vec<CLnk> = e.comt_links.iter().copied().collect();
        let comt = e.comt;
        for cl in snapshot {
            self.remove_link(ctx, cl, lt)?;
        }
        self.entries.remove(ctx - 1);
        self.by_comt.remove(&comt);
        Ok(())
    }

    /// Add a link to a comtree. `rtr` marks a router neighbour, `core` a
    /// core neighbour (which must also be a router).
    pub fn add_link(
        &mut self,
        ctx: Ctx,
        lnk: usize,
        rtr: bool,
        core: bool,
        lt: &mut LinkTable,
    ) -> Result<CLnk, TableError> {
        if core && !rtr {
            return Err(TableError::Invalid("a core neighbour must be a router"));
        }
        let comt = self.entry(ctx).ok_or(TableError::NotFound)?.comt;
        if !lt.valid(lnk) {
            return Err(TableError::Invalid("no such link"));
        }
        if self.by_comt_link.contains_key(&(comt, lnk)) {
            return Err(TableError::Exists);
        }
        let cl = self.clinks.insert(ComtLinkEntry {
            ctx,
            lnk,
            dest: Fadr(0),
            rates: RateSpec::symmetric(MIN_BIT_RATE, MIN_PKT_RATE),
            qid: 0,
            routes: BTreeSet::new(),
        }) + 1;
        self.by_comt_link.insert((comt, lnk), cl);
        let e = self.entries.get_mut(ctx - 1).expect("checked above");
        e.comt_links.insert(cl);
        if rtr {
            e.rtr_links.insert(cl);
        }
        if core {
            e.core_links.insert(cl);
        }
        lt.register_comt(lnk, comt);
        Ok(cl)
    }

    /// Remove one comtree-link. Refused while it has registered routes.
    /// Removing the parent link clears the parent.
    pub fn remove_link(
        &mut self,
        ctx: Ctx,
        cl: CLnk,
        lt: &mut LinkTable,
    ) -> Result<(), TableError> {
        let comt = self.entry(ctx).ok_or(TableError::NotFound)?.comt;
        let cle = self.clink(cl).ok_or(TableError::NotFound)?;
        if cle.ctx != ctx {
            return Err(TableError::NotFound);
        }
        if !cle.routes.is_empty() {
            return Err(TableError::InUse("comtree-link still has routes"));
        }
        let lnk = cle.lnk;
        let e = self.entries.get_mut(ctx - 1).expect("checked above");
        e.comt_links.remove(&cl);
        e.rtr_links.remove(&cl);
        e.core_links.remove(&cl);
        if e.plnk == lnk {
            e.plnk = 0;
        }
        self.clinks.remove(cl - 1);
        self.by_comt_link.remove(&(comt, lnk));
        lt.deregister_comt(lnk, comt);
        Ok(())
    }

    pub fn set_core_flag(&mut self, ctx: Ctx, on: bool) -> Result<(), TableError> {
        self.entries
            .get_mut(ctx - 1)
            .ok_or(TableError::NotFound)?
            .in_core = on;
        Ok(())
    }

    /// Set the parent link. Must already be a router link of the comtree
    /// (or 0 to clear).
    pub fn set_plnk(&mut self, ctx: Ctx, plnk: usize) -> Result<(), TableError> {
        if plnk != 0 && !self.is_rtr_link(ctx, plnk) {
            return Err(TableError::Invalid("parent must be a router link"));
        }
        self.entries
            .get_mut(ctx - 1)
            .ok_or(TableError::NotFound)?
            .plnk = plnk;
        Ok(())
    }

    pub fn register_rte(&mut self, cl: CLnk, dest: Fadr) -> bool {
        match self.clink_mut(cl) {
            Some(c) => c.routes.insert(dest),
            None => false,
        }
    }

    pub fn deregister_rte(&mut self, cl: CLnk, dest: Fadr) -> bool {
        match self.clink_mut(cl) {
            Some(c) => c.routes.remove(&dest),
            None => false,
        }
    }

    // ─── consistency ─────────────────────────────────────────────────────

    /// Check one entry against the comtree invariants.
    pub fn check_entry(&self, ctx: Ctx, lt: &LinkTable) -> Result<(), TableError> {
        let e = self.entry(ctx).ok_or(TableError::NotFound)?;

        for &cl in &e.rtr_links {
            if !e.comt_links.contains(&cl) {
                return Err(TableError::Invalid("router link not a comtree link"));
            }
            let lnk = self.link(cl);
            let peer = lt.get(lnk).ok_or(TableError::Invalid("dangling link"))?;
            if peer.peer_type != NodeType::Router {
                return Err(TableError::Invalid("router link peer is not a router"));
            }
        }
        for &cl in &e.core_links {
            if !e.rtr_links.contains(&cl) {
                return Err(TableError::Invalid("core link not a router link"));
            }
        }
        if e.plnk != 0 {
            if !self.is_rtr_link(ctx, e.plnk) {
                return Err(TableError::Invalid("parent link not a router link"));
            }
            if e.in_core && !self.is_core_link(ctx, e.plnk) {
                return Err(TableError::Invalid(
                    "core router's parent must be a core neighbour",
                ));
            }
        }
        if !e.in_core {
            if e.core_links.len() > 1 {
                return Err(TableError::Invalid(
                    "non-core router with multiple core links",
                ));
            }
            if let Some(&cl) = e.core_links.iter().next() {
                if self.link(cl) != e.plnk {
                    return Err(TableError::Invalid(
                        "non-core router's core link must be its parent",
                    ));
                }
            }
        }
        Ok(())
    }

    // ─── file format ─────────────────────────────────────────────────────
    //
    //   <count>
    //   comt [*] parentLink defaultDest defaultRates
    //       { link[+|*][(overrideDest)][(overrideRates)] ... }
    //
    // `*` after the comtree number marks this router as core; `+` after a
    // link marks a router neighbour, `*` a core neighbour.

    pub fn parse(input: &str, lt: &mut LinkTable) -> Result<Self, TableError> {
        let mut lines = significant_lines(input);
        let count = parse_count(lines.next().ok_or(parse_err(0, "empty comtree table"))?)?;
        let mut tbl = ComtreeTable::new();
        for _ in 0..count {
            let (ln, text) = lines
                .next()
                .ok_or(parse_err(0, "fewer entries than the count line promises"))?;
            tbl.parse_entry(ln, text, lt)?;
        }
        Ok(tbl)
    }

    fn parse_entry(&mut self, ln: usize, text: &str, lt: &mut LinkTable) -> Result<(), TableError> {
        let (head, rest) = text
            .split_once('{')
            .ok_or_else(|| parse_err(ln, "expected '{' before link list"))?;
        let links_part = rest
            .strip_suffix('}')
            .map(str::trim)
            .ok_or_else(|| parse_err(ln, "expected closing '}'"))?;

        let mut tok = head.split_whitespace();
        let mut next = |what: &str| {
            tok.next()
                .ok_or_else(|| parse_err(ln, format!("missing {what}")))
        };
        let mut comt_s = next("comtree number")?;
        let in_core = if let Some(stripped) = comt_s.strip_suffix('*') {
            comt_s = stripped;
            true
        } else {
            false
        };
        let comt: u32 = comt_s
            .parse()
            .map_err(|_| parse_err(ln, "bad comtree number"))?;
        let plnk: usize = next("parent link")?
            .parse()
            .map_err(|_| parse_err(ln, "bad parent link"))?;
        let default_dest: Fadr = next("default dest")?
            .parse()
            .map_err(|e| parse_err(ln, e))?;
        let default_rates: RateSpec = next("default rates")?
            .parse()
            .map_err(|e| parse_err(ln, e))?;

        let ctx = self
            .add_entry(comt)
            .map_err(|e| parse_err(ln, e.to_string()))?;
        self.set_core_flag(ctx, in_core).expect("fresh entry");

        for spec in links_part.split_whitespace() {
            self.parse_link_spec(ln, ctx, spec, default_dest, default_rates, lt)?;
        }
        if plnk != 0 {
            self.set_plnk(ctx, plnk)
                .map_err(|e| parse_err(ln, e.to_string()))?;
        }
        self.check_entry(ctx, lt)
            .map_err(|e| parse_err(ln, e.to_string()))
    }

    fn parse_link_spec(
        &mut self,
        ln: usize,
        ctx: Ctx,
        spec: &str,
        default_dest: Fadr,
        default_rates: RateSpec,
        lt: &mut LinkTable,
    ) -> Result<(), TableError> {
        // split off parenthesised overrides first: a group with three
        // commas is a rate spec, anything else is a destination
        let (link_part, overrides) = match spec.find('(') {
            Some(p) => (&spec[..p], &spec[p..]),
            None => (spec, ""),
        };
        let mut dest = default_dest;
        let mut rates = default_rates;
        let mut rest = overrides;
        while let Some(open) = rest.find('(') {
            let close = rest[open..]
                .find(')')
                .ok_or_else(|| parse_err(ln, "unterminated override"))?
                + open;
            let group = &rest[open..=close];
            if group.matches(',').count() == 3 {
                rates = group.parse().map_err(|e| parse_err(ln, e))?;
            } else {
                dest = group[1..group.len() - 1]
                    .parse()
                    .map_err(|e| parse_err(ln, e))?;
            }
            rest = &rest[close + 1..];
        }

        let (lnk_s, rtr, core) = if let Some(s) = link_part.strip_suffix('*') {
            (s, true, true)
        } else if let Some(s) = link_part.strip_suffix('+') {
            (s, true, false)
        } else {
            (link_part, false, false)
        };
        let lnk: usize = lnk_s
            .parse()
            .map_err(|_| parse_err(ln, "bad link number in comtree"))?;

        let cl = self
            .add_link(ctx, lnk, rtr, core, lt)
            .map_err(|e| parse_err(ln, e.to_string()))?;
        let cle = self.clink_mut(cl).expect("fresh comtree link");
        cle.dest = dest;
        cle.rates = rates;
        Ok(())
    }

    pub fn to_file_string(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "{}", self.entries.len());
        let _ = writeln!(s, "# comt  pLink  dest  rates  {{ links }}");
        for (_ctx, e) in self.iter() {
            let _ = write!(
                s,
                "{}{} {} 0 {} {{",
                e.comt,
                if e.in_core { "*" } else { "" },
                e.plnk,
                RateSpec::symmetric(MIN_BIT_RATE, MIN_PKT_RATE),
            );
            for &cl in &e.comt_links {
                let cle = self.clink(cl).expect("set member");
                let mark = if e.core_links.contains(&cl) {
                    "*"
                } else if e.rtr_links.contains(&cl) {
                    "+"
                } else {
                    ""
                };
                let _ = write!(s, " {}{}", cle.lnk, mark);
                if cle.dest.raw() != 0 {
                    let _ = write!(s, "({})", cle.dest);
                }
                let _ = write!(s, "({})", cle.rates);
            }
            let _ = writeln!(s, " }}");
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link_table() -> LinkTable {
        let mut lt = LinkTable::new(16);
        // links 1,2: routers; links 3,4: clients
        for (lnk, t) in [
            (1, NodeType::Router),
            (2, NodeType::Router),
            (3, NodeType::Client),
            (4, NodeType::Client),
        ] {
            lt.add_entry(
                lnk,
                1,
                "10.0.0.1".parse().unwrap(),
                30000 + lnk as u16,
                t,
                Fadr::unicast(if t == NodeType::Router { 2 } else { 1 }, lnk as u16),
                RateSpec::symmetric(10000, 5000),
                lnk as u64 * 1000,
            )
            .unwrap();
        }
        lt
    }

    #[test]
    fn add_links_and_check() {
        let mut lt = link_table();
        let mut ct = ComtreeTable::new();
        let ctx = ct.add_entry(100).unwrap();
        ct.add_link(ctx, 1, true, false, &mut lt).unwrap();
        ct.add_link(ctx, 3, false, false, &mut lt).unwrap();
        ct.set_plnk(ctx, 1).unwrap();
        assert!(ct.check_entry(ctx, &lt).is_ok());
        assert!(ct.is_link(ctx, 3));
        assert!(ct.is_rtr_link(ctx, 1));
        assert!(!ct.is_rtr_link(ctx, 3));
        assert!(lt.get(1).unwrap().comtrees.contains(&100));
    }

    #[test]
    fn core_link_must_be_router() {
        let mut lt = link_table();
        let mut ct = ComtreeTable::new();
        let ctx = ct.add_entry(100).unwrap();
        assert!(ct.add_link(ctx, 3, false, true, &mut lt).is_err());
    }

    #[test]
    fn parent_must_be_router_link() {
        let mut lt = link_table();
        let mut ct = ComtreeTable::new();
        let ctx = ct.add_entry(100).unwrap();
        ct.add_link(ctx, 3, false, false, &mut lt).unwrap();
        assert!(ct.set_plnk(ctx, 3).is_err());
        assert!(ct.set_plnk(ctx, 9).is_err());
    }

    #[test]
    fn non_core_single_core_link_must_be_parent() {
        let mut lt = link_table();
        let mut ct = ComtreeTable::new();
        let ctx = ct.add_entry(100).unwrap();
        ct.add_link(ctx, 1, true, true, &mut lt).unwrap();
        ct.add_link(ctx, 2, true, false, &mut lt).unwrap();
        // parent is link 2 but the core link is 1 → rejected
        ct.set_plnk(ctx, 2).unwrap();
        assert!(ct.check_entry(ctx, &lt).is_err());
        // parent = the core link → fine
        ct.set_plnk(ctx, 1).unwrap();
        assert!(ct.check_entry(ctx, &lt).is_ok());
    }

    #[test]
    fn core_router_parent_must_be_core_link() {
        let mut lt = link_table();
        let mut ct = ComtreeTable::new();
        let ctx = ct.add_entry(100).unwrap();
        ct.set_core_flag(ctx, true).unwrap();
        ct.add_link(ctx, 1, true, false, &mut lt).unwrap();
        ct.set_plnk(ctx, 1).unwrap();
        assert!(ct.check_entry(ctx, &lt).is_err());
    }

    #[test]
    fn remove_refused_with_routes() {
        let mut lt = link_table();
        let mut ct = ComtreeTable::new();
        let ctx = ct.add_entry(100).unwrap();
        let cl = ct.add_link(ctx, 3, false, false, &mut lt).unwrap();
        let mcast = Fadr(0x8000_0001);
        ct.register_rte(cl, mcast);

        assert!(matches!(
            ct.remove_link(ctx, cl, &mut lt),
            Err(TableError::InUse(_))
        ));
        assert!(matches!(
            ct.remove_entry(ctx, &mut lt),
            Err(TableError::InUse(_))
        ));

        ct.deregister_rte(cl, mcast);
        ct.remove_entry(ctx, &mut lt).unwrap();
        assert_eq!(ct.get_comt_index(100), None);
        assert!(!lt.get(3).unwrap().comtrees.contains(&100));
    }

    #[test]
    fn removing_parent_link_clears_plnk() {
        let mut lt = link_table();
        let mut ct = ComtreeTable::new();
        let ctx = ct.add_entry(100).unwrap();
        let cl = ct.add_link(ctx, 1, true, false, &mut lt).unwrap();
        ct.set_plnk(ctx, 1).unwrap();
        ct.remove_link(ctx, cl, &mut lt).unwrap();
        assert_eq!(ct.plnk(ctx), 0);
    }

    #[test]
    fn file_roundtrip() {
        let mut lt = link_table();
        let text = "\
2
# comt pLink dest rates { links }
100* 1 0 (1000,1000,500,500) { 1* 2+ 3 4(1.9)(2000,2000,900,900) }
200 1 0 (1000,1000,500,500) { 1* 3 }
";
        let ct = ComtreeTable::parse(text, &mut lt).unwrap();
        let ctx = ct.get_comt_index(100).unwrap();
        assert!(ct.in_core(ctx));
        assert_eq!(ct.plnk(ctx), 1);
        assert!(ct.is_core_link(ctx, 1));
        assert!(ct.is_rtr_link(ctx, 2));
        assert!(!ct.is_rtr_link(ctx, 3));
        let cl4 = ct.get_comt_link(100, 4).unwrap();
        assert_eq!(ct.clink(cl4).unwrap().dest, Fadr::unicast(1, 9));
        assert_eq!(
            ct.clink(cl4).unwrap().rates,
            RateSpec::new(2000, 2000, 900, 900)
        );

        let ctx2 = ct.get_comt_index(200).unwrap();
        assert!(!ct.in_core(ctx2));
        // non-core with its single core link as parent passes the check
        assert!(ct.check_entry(ctx2, &lt).is_ok());

        // serialise and re-read with a fresh link table
        let mut lt2 = link_table();
        let again = ComtreeTable::parse(&ct.to_file_string(), &mut lt2).unwrap();
        assert_eq!(again.len(), 2);
        let actx = again.get_comt_index(100).unwrap();
        assert!(again.in_core(actx));
        assert_eq!(again.plnk(actx), 1);
        assert_eq!(
            again.clink(again.get_comt_link(100, 4).unwrap()).unwrap().dest,
            Fadr::unicast(1, 9)
        );
    }

    #[test]
    fn parse_rejects_inconsistent_entry() {
        let mut lt = link_table();
        // core neighbour 3 is a client
        let text = "1\n100 0 0 (1,1,1,1) { 3* }\n";
        assert!(ComtreeTable::parse(text, &mut lt).is_err());
    }
}
