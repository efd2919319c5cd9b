//! Trusted-subnet admission check.
//!
//! A `TrustedSubnet` is a CIDR range; requests whose declared client IP
//! (`X-Real-IP`) falls outside it are rejected by the admission middleware.

use std::net::IpAddr;
use std::str::FromStr;

use crate::error::{HarvestError, Result};

/// A parsed CIDR range, IPv4 or IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustedSubnet {
    network: u128,
    prefix: u8,
    v4: bool,
}

impl TrustedSubnet {
    /// Whether `ip` lies inside the range. An IPv6 address never matches an
    /// IPv4 range and vice versa.
    pub fn contains(&self, ip: IpAddr) -> bool {
        let (bits, v4) = match ip {
            IpAddr::V4(a) => (u32::from(a) as u128, true),
            IpAddr::V6(a) => (u128::from(a), false),
        };
        if v4 != self.v4 {
            return false;
        }
        bits & self.mask() == self.network & self.mask()
    }

    fn mask(&self) -> u128 {
        let width: u8 = if self.v4 { 32 } else { 128 };
        if self.prefix == 0 {
            0
        } else {
            // Bits above `width` are zero on both compared addresses, so the
            // extra high mask bits never disagree.
            u128::MAX << (width - self.prefix)
        }
    }
}

impl FromStr for TrustedSubnet {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || HarvestError::InvalidConfig { reason: format!("bad CIDR: {s}") };

        let (addr, prefix) = s.split_once('/').ok_or_else(bad)?;
        let addr: IpAddr = addr.parse().map_err(|_| bad())?;
        let prefix: u8 = prefix.parse().map_err(|_| bad())?;

        let (network, v4, width) = match addr {
            IpAddr::V4(a) => (u32::from(a) as u128, true, 32),
            IpAddr::V6(a) => (u128::from(a), false, 128),
        };
        if prefix > width {
            return Err(bad());
        }

        Ok(Self { network, prefix, v4 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_inside_and_outside() {
        let net: TrustedSubnet = "10.0.0.0/8".parse().unwrap();
        assert!(net.contains("10.1.2.3".parse().unwrap()));
        assert!(!net.contains("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn narrow_prefix() {
        let net: TrustedSubnet = "192.168.1.0/30".parse().unwrap();
        assert!(net.contains("192.168.1.2".parse().unwrap()));
        assert!(!net.contains("192.168.1.4".parse().unwrap()));
    }

    #[test]
    fn zero_prefix_matches_everything_v4() {
        let net: TrustedSubnet = "0.0.0.0/0".parse().unwrap();
        assert!(net.contains("8.8.8.8".parse().unwrap()));
        assert!(!net.contains("::1".parse().unwrap()));
    }

    #[test]
    fn v6_range() {
        let net: TrustedSubnet = "fd00::/8".parse().unwrap();
        assert!(net.contains("fd12::1".parse().unwrap()));
        assert!(!net.contains("fe80::1".parse().unwrap()));
        assert!(!net.contains("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn rejects_malformed() {
        assert!("10.0.0.0".parse::<TrustedSubnet>().is_err());
        assert!("10.0.0.0/33".parse::<TrustedSubnet>().is_err());
        assert!("nope/8".parse::<TrustedSubnet>().is_err());
    }
}
