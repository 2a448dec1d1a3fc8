//! # Router configuration
//!
//! The router is configured with `key=value` arguments:
//!
//! ```text
//! forest-router mode=local myAdr=1.1 firstLeafAdr=1.16 lastLeafAdr=1.48 \
//!     ifTbl=ift lnkTbl=lt comtTbl=ctt rteTbl=rt statSpec=stats finTime=60
//! forest-router mode=remote bootIp=10.0.0.7 nmIp=10.0.0.1 nmAdr=65535.1
//! ```
//!
//! Local mode loads the four table files at startup and requires the leaf
//! address range; remote mode learns its tables from the network manager
//! after the boot handshake and requires the boot/NM addresses. Any
//! unrecognised key or inconsistent mode is an error.

use std::net::Ipv4Addr;

use anyhow::{anyhow, bail, Context, Result};
use forest_wire::Fadr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Local,
    Remote,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub mode: Mode,
    pub my_adr: Fadr,
    pub boot_ip: Option<Ipv4Addr>,
    pub nm_ip: Option<Ipv4Addr>,
    pub nm_adr: Fadr,
    pub cc_adr: Fadr,
    pub first_leaf_adr: Fadr,
    pub last_leaf_adr: Fadr,
    pub if_tbl: Option<String>,
    pub lnk_tbl: Option<String>,
    pub comt_tbl: Option<String>,
    pub rte_tbl: Option<String>,
    pub stat_spec: Option<String>,
    /// Port override applied to every interface (0 = use the table's).
    pub port_num: u16,
    /// Seconds to run; 0 means run until killed.
    pub fin_time: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            mode: Mode::Local,
            my_adr: Fadr(0),
            boot_ip: None,
            nm_ip: None,
            nm_adr: Fadr(0),
            cc_adr: Fadr(0),
            first_leaf_adr: Fadr(0),
            last_leaf_adr: Fadr(0),
            if_tbl: None,
            lnk_tbl: None,
            comt_tbl: None,
            rte_tbl: None,
            stat_spec: None,
            port_num: 0,
            fin_time: 0,
        }
    }
}

impl RouterConfig {
    /// Parse `key=value` arguments (without the program name).
    pub fn parse_args<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut cfg = RouterConfig::default();
        let mut mode_seen = false;
        for arg in args {
            let arg = arg.as_ref();
            let (key, val) = arg
                .split_once('=')
                .ok_or_else(|| anyhow!("unrecognised argument: {arg}"))?;
            match key {
                "mode" => {
                    cfg.mode = match val {
                        "local" => Mode::Local,
                        "remote" => Mode::Remote,
                        _ => bail!("mode must be local or remote, got {val}"),
                    };
                    mode_seen = true;
                }
                "myAdr" => cfg.my_adr = parse_fadr(key, val)?,
                "bootIp" => cfg.boot_ip = Some(parse_ip(key, val)?),
                "nmIp" => cfg.nm_ip = Some(parse_ip(key, val)?),
                "nmAdr" => cfg.nm_adr = parse_fadr(key, val)?,
                "ccAdr" => cfg.cc_adr = parse_fadr(key, val)?,
                "firstLeafAdr" => cfg.first_leaf_adr = parse_fadr(key, val)?,
                "lastLeafAdr" => cfg.last_leaf_adr = parse_fadr(key, val)?,
                "ifTbl" => cfg.if_tbl = Some(val.to_string()),
                "lnkTbl" => cfg.lnk_tbl = Some(val.to_string()),
                "comtTbl" => cfg.comt_tbl = Some(val.to_string()),
                "rteTbl" => cfg.rte_tbl = Some(val.to_string()),
                "statSpec" => cfg.stat_spec = Some(val.to_string()),
                "portNum" => {
                    cfg.port_num = val.parse().with_context(|| format!("bad {key}"))?
                }
                "finTime" => {
                    cfg.fin_time = val.parse().with_context(|| format!("bad {key}"))?
                }
                _ => bail!("unrecognised argument: {arg}"),
            }
        }
        if !mode_seen {
            bail!("mode=local|remote is required");
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Cross-field checks for the chosen mode.
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            Mode::Local => {
                if !self.my_adr.is_valid_ucast() {
                    bail!("local mode requires a valid myAdr");
                }
                if !self.first_leaf_adr.is_valid_ucast()
                    || !self.last_leaf_adr.is_valid_ucast()
                    || self.last_leaf_adr.raw() < self.first_leaf_adr.raw()
                    || self.first_leaf_adr.zip() != self.my_adr.zip()
                {
                    bail!("local mode requires a leaf address range in the router's zip");
                }
                for (name, f) in [
                    ("ifTbl", &self.if_tbl),
                    ("lnkTbl", &self.lnk_tbl),
                    ("comtTbl", &self.comt_tbl),
                    ("rteTbl", &self.rte_tbl),
                ] {
                    if f.is_none() {
                        bail!("local mode requires {name}");
                    }
                }
            }
            Mode::Remote => {
                if self.boot_ip.is_none() || self.nm_ip.is_none() {
                    bail!("remote mode requires bootIp and nmIp");
                }
                if !self.nm_adr.is_valid_ucast() {
                    bail!("remote mode requires a valid nmAdr");
                }
            }
        }
        Ok(())
    }
}

fn parse_fadr(key: &str, val: &str) -> Result<Fadr> {
    val.parse::<Fadr>()
        .map_err(|e| anyhow!("bad {key}: {e}"))
}

fn parse_ip(key: &str, val: &str) -> Result<Ipv4Addr> {
    val.parse::<Ipv4Addr>()
        .map_err(|_| anyhow!("bad {key}: expected an IPv4 address"))
}
