//! Rate specifications.
//!
//! Links, interfaces, comtree-links and queues all carry a pair of
//! (bit rate, packet rate) limits in each direction. "Up" is input at the
//! router, "down" is output.

use std::fmt;
use std::str::FromStr;

/// Bit rates in Kb/s, packet rates in packets/s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateSpec {
    pub bit_rate_up: i32,
    pub bit_rate_down: i32,
    pub pkt_rate_up: i32,
    pub pkt_rate_down: i32,
}

/// Highest bit rate the scheduler can pace (Kb/s).
pub const MAX_BIT_RATE: i32 = 8_000_000;
/// Highest packet rate the scheduler can pace (packets/s).
pub const MAX_PKT_RATE: i32 = 1_000_000_000;
/// Floor used when seeding a new comtree-link.
pub const MIN_BIT_RATE: i32 = 20;
/// Floor used when seeding a new comtree-link.
pub const MIN_PKT_RATE: i32 = 25;

impl RateSpec {
    pub fn new(bru: i32, brd: i32, pru: i32, prd: i32) -> Self {
        RateSpec {
            bit_rate_up: bru,
            bit_rate_down: brd,
            pkt_rate_up: pru,
            pkt_rate_down: prd,
        }
    }

    /// Same rate in both directions.
    pub fn symmetric(bit_rate: i32, pkt_rate: i32) -> Self {
        Self::new(bit_rate, bit_rate, pkt_rate, pkt_rate)
    }

    /// All four components zero or positive.
    pub fn is_valid(&self) -> bool {
        self.bit_rate_up >= 0
            && self.bit_rate_down >= 0
            && self.pkt_rate_up >= 0
            && self.pkt_rate_down >= 0
    }

    /// Componentwise `self <= other`.
    pub fn leq(&self, other: &RateSpec) -> bool {
        self.bit_rate_up <= other.bit_rate_up
            && self.bit_rate_down <= other.bit_rate_down
            && self.pkt_rate_up <= other.pkt_rate_up
            && self.pkt_rate_down <= other.pkt_rate_down
    }

    pub fn add(&mut self, other: &RateSpec) {
        self.bit_rate_up += other.bit_rate_up;
        self.bit_rate_down += other.bit_rate_down;
        self.pkt_rate_up += other.pkt_rate_up;
        self.pkt_rate_down += other.pkt_rate_down;
    }

    pub fn subtract(&mut self, other: &RateSpec) {
        self.bit_rate_up -= other.bit_rate_up;
        self.bit_rate_down -= other.bit_rate_down;
        self.pkt_rate_up -= other.pkt_rate_up;
        self.pkt_rate_down -= other.pkt_rate_down;
    }

    /// Swap the up and down directions — used when a rate provisioned at
    /// one end of a link is applied at the other.
    pub fn flip(&mut self) {
        std::mem::swap(&mut self.bit_rate_up, &mut self.bit_rate_down);
        std::mem::swap(&mut self.pkt_rate_up, &mut self.pkt_rate_down);
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({},{},{},{})",
            self.bit_rate_up, self.bit_rate_down, self.pkt_rate_up, self.pkt_rate_down
        )
    }
}

impl FromStr for RateSpec {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s
            .trim()
            .strip_prefix('(')
            .and_then(|t| t.strip_suffix(')'))
            .ok_or("rate spec must be parenthesised")?;
        let mut parts = inner.split(',').map(|p| p.trim().parse::<i32>());
        let mut next = || {
            parts
                .next()
                .ok_or("rate spec needs four components")?
                .map_err(|_| "bad rate component")
        };
        let rs = RateSpec::new(next()?, next()?, next()?, next()?);
        Ok(rs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_subtract_inverse() {
        let mut a = RateSpec::new(100, 200, 10, 20);
        let b = RateSpec::new(30, 40, 5, 6);
        a.add(&b);
        assert_eq!(a, RateSpec::new(130, 240, 15, 26));
        a.subtract(&b);
        assert_eq!(a, RateSpec::new(100, 200, 10, 20));
    }

    #[test]
    fn leq_componentwise() {
        let a = RateSpec::new(1, 2, 3, 4);
        let b = RateSpec::new(2, 2, 3, 4);
        assert!(a.leq(&b));
        assert!(!b.leq(&a));
    }

    #[test]
    fn flip_swaps_directions() {
        let mut a = RateSpec::new(1, 2, 3, 4);
        a.flip();
        assert_eq!(a, RateSpec::new(2, 1, 4, 3));
    }

    #[test]
    fn text_roundtrip() {
        let a = RateSpec::new(1000, 2000, 100, 200);
        assert_eq!(a.to_string(), "(1000,2000,100,200)");
        assert_eq!(a.to_string().parse::<RateSpec>().unwrap(), a);
        assert!("(1,2,3)".parse::<RateSpec>().is_err());
        assert!("1,2,3,4".parse::<RateSpec>().is_err());
    }
}
