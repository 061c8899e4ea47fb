/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::fmt::{self, Display};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Parses an IP address into its canonical form. IPv4-mapped IPv6
/// addresses collapse to plain IPv4 so that a peer always accumulates
/// reputation under a single key.
pub fn normalize_ip(value: &str) -> Option<IpAddr> {
    let ip = IpAddr::from_str(value.trim()).ok()?;
    Some(canonical(ip))
}

pub fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// True for addresses that can never be a routable SMTP peer: loopback,
/// RFC 1918 / ULA space, link-local, unspecified.
pub fn is_local(ip: IpAddr) -> bool {
    match canonical(ip) {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xFE00) == 0xFC00 // fc00::/7 unique local
                || (v6.segments()[0] & 0xFFC0) == 0xFE80 // fe80::/10 link local
        }
    }
}

/// True for any IANA-reserved address, including the routable-but-special
/// ranges (documentation, benchmarking, multicast, class E).
pub fn is_reserved(ip: IpAddr) -> bool {
    match canonical(ip) {
        IpAddr::V4(v4) => {
            is_local(IpAddr::V4(v4))
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_multicast()
                || RESERVED_V4
                    .iter()
                    .any(|cidr| cidr.contains(IpAddr::V4(v4)))
        }
        IpAddr::V6(v6) => is_local(IpAddr::V6(v6)) || v6.is_multicast(),
    }
}

/// Reserved IPv4 space that an SPF `ip4:` mechanism must never authorise.
pub static RESERVED_V4: &[Cidr] = &[
    Cidr::v4(Ipv4Addr::new(0, 0, 0, 0), 8),          // current network
    Cidr::v4(Ipv4Addr::new(10, 0, 0, 0), 8),         // private
    Cidr::v4(Ipv4Addr::new(14, 0, 0, 0), 8),         // public data networks
    Cidr::v4(Ipv4Addr::new(39, 0, 0, 0), 8),         // reserved
    Cidr::v4(Ipv4Addr::new(127, 0, 0, 0), 8),        // loopback
    Cidr::v4(Ipv4Addr::new(128, 0, 0, 0), 16),       // reserved (IANA)
    Cidr::v4(Ipv4Addr::new(169, 254, 0, 0), 16),     // link local
    Cidr::v4(Ipv4Addr::new(172, 16, 0, 0), 12),      // private
    Cidr::v4(Ipv4Addr::new(191, 255, 0, 0), 16),     // reserved (IANA)
    Cidr::v4(Ipv4Addr::new(192, 0, 2, 0), 24),       // documentation
    Cidr::v4(Ipv4Addr::new(192, 88, 99, 0), 24),     // 6to4 relay
    Cidr::v4(Ipv4Addr::new(192, 168, 0, 0), 16),     // private
    Cidr::v4(Ipv4Addr::new(198, 18, 0, 0), 15),      // benchmarking
    Cidr::v4(Ipv4Addr::new(223, 255, 255, 0), 24),   // reserved
    Cidr::v4(Ipv4Addr::new(224, 0, 0, 0), 4),        // multicast
    Cidr::v4(Ipv4Addr::new(240, 0, 0, 0), 4),        // class E
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub const fn v4(addr: Ipv4Addr, prefix: u8) -> Self {
        Cidr {
            addr: IpAddr::V4(addr),
            prefix,
        }
    }

    pub fn new(addr: IpAddr, prefix: u8) -> Option<Self> {
        let addr = canonical(addr);
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix <= max {
            Some(Cidr { addr, prefix }.masked())
        } else {
            None
        }
    }

    pub fn host(addr: IpAddr) -> Self {
        let addr = canonical(addr);
        let prefix = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Cidr { addr, prefix }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Normalises the address to its network base so equal prefixes
    /// compare equal regardless of the host bits used to spell them.
    fn masked(self) -> Self {
        let addr = match self.addr {
            IpAddr::V4(v4) => {
                let bits = u32::from(v4) & mask_v4(self.prefix);
                IpAddr::V4(Ipv4Addr::from(bits))
            }
            IpAddr::V6(v6) => {
                let bits = u128::from(v6) & mask_v6(self.prefix);
                IpAddr::V6(Ipv6Addr::from(bits))
            }
        };
        Cidr {
            addr,
            prefix: self.prefix,
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, canonical(ip)) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = mask_v4(self.prefix);
                u32::from(ip) & mask == u32::from(net) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = mask_v6(self.prefix);
                u128::from(ip) & mask == u128::from(net) & mask
            }
            _ => false,
        }
    }

    /// Two blocks overlap when the shorter prefix contains the other's
    /// network address.
    pub fn overlaps(&self, other: &Cidr) -> bool {
        if self.prefix <= other.prefix {
            self.contains(other.addr)
        } else {
            other.contains(self.addr)
        }
    }
}

const fn mask_v4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    }
}

const fn mask_v6(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix)
    }
}

impl FromStr for Cidr {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match value.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid CIDR {value:?}"))?;
                let prefix: u8 = prefix
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid CIDR prefix {value:?}"))?;
                (addr, prefix)
            }
            None => {
                let addr: IpAddr = value
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid CIDR {value:?}"))?;
                return Ok(Cidr::host(addr));
            }
        };
        Cidr::new(addr, prefix).ok_or_else(|| format!("prefix out of range in {value:?}"))
    }
}

impl Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Reversed dotted-quad form used by the DNS list zones, `1.2.0.192` for
/// `192.0.2.1`.
pub fn reverse_v4(addr: Ipv4Addr) -> String {
    let o = addr.octets();
    format!("{}.{}.{}.{}", o[3], o[2], o[1], o[0])
}

pub fn parse_reverse_v4(reversed: &str) -> Option<Ipv4Addr> {
    let mut octets = [0u8; 4];
    let mut count = 0;
    for part in reversed.split('.') {
        if count == 4 {
            return None;
        }
        // Reject forms like "01" that a stray zone query could produce.
        if part.len() > 1 && part.starts_with('0') {
            return None;
        }
        octets[3 - count] = part.parse().ok()?;
        count += 1;
    }
    if count == 4 {
        Some(Ipv4Addr::from(octets))
    } else {
        None
    }
}

/// Reversed nibble form, `1.0.0.0.…ip6.arpa`-style without the suffix.
pub fn reverse_nibbles_v6(addr: Ipv6Addr) -> String {
    let mut out = String::with_capacity(63);
    for byte in addr.octets().iter().rev() {
        out.push(char::from_digit((byte & 0x0F) as u32, 16).unwrap_or('0'));
        out.push('.');
        out.push(char::from_digit((byte >> 4) as u32, 16).unwrap_or('0'));
        out.push('.');
    }
    out.pop();
    out
}

pub fn parse_reverse_v6(reversed: &str) -> Option<Ipv6Addr> {
    let mut bits: u128 = 0;
    let mut count = 0;
    for part in reversed.split('.') {
        if count == 32 || part.len() != 1 {
            return None;
        }
        let nibble = part.chars().next().and_then(|ch| ch.to_digit(16))?;
        bits |= (nibble as u128) << (count * 4);
        count += 1;
    }
    if count == 32 {
        Some(Ipv6Addr::from(bits))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use super::*;

    #[test]
    fn canonical_collapses_mapped() {
        assert_eq!(
            normalize_ip("::ffff:192.0.2.5"),
            Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5)))
        );
        assert_eq!(
            normalize_ip("2001:db8::1"),
            Some("2001:db8::1".parse().unwrap())
        );
        assert_eq!(normalize_ip("not an ip"), None);
    }

    #[test]
    fn local_and_reserved() {
        for local in ["127.0.0.1", "10.1.2.3", "192.168.0.1", "fe80::1", "fd00::1"] {
            let ip: IpAddr = local.parse().unwrap();
            assert!(is_local(ip), "{local}");
        }
        for public in ["192.0.2.5", "8.8.8.8", "2001:db8::1"] {
            let ip: IpAddr = public.parse().unwrap();
            assert!(!is_local(ip), "{public}");
        }
        assert!(is_reserved("224.0.0.1".parse().unwrap()));
        assert!(is_reserved("240.0.0.1".parse().unwrap()));
    }

    #[test]
    fn cidr_contains_and_overlaps() {
        let net: Cidr = "192.0.2.0/24".parse().unwrap();
        assert!(net.contains("192.0.2.200".parse().unwrap()));
        assert!(!net.contains("192.0.3.1".parse().unwrap()));

        let wide: Cidr = "10.0.0.0/8".parse().unwrap();
        let narrow: Cidr = "10.20.0.0/16".parse().unwrap();
        assert!(wide.overlaps(&narrow));
        assert!(narrow.overlaps(&wide));
        assert!(!net.overlaps(&wide));

        // Host bits are masked away at parse time.
        let sloppy: Cidr = "192.0.2.77/24".parse().unwrap();
        assert_eq!(sloppy, net);
    }

    #[test]
    fn reverse_forms() {
        let v4 = Ipv4Addr::new(192, 0, 2, 5);
        assert_eq!(reverse_v4(v4), "5.2.0.192");
        assert_eq!(parse_reverse_v4("5.2.0.192"), Some(v4));
        assert_eq!(parse_reverse_v4("5.2.0"), None);
        assert_eq!(parse_reverse_v4("5.2.0.192.7"), None);

        let v6: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let reversed = reverse_nibbles_v6(v6);
        assert!(reversed.starts_with("1.0.0.0."));
        assert_eq!(parse_reverse_v6(&reversed), Some(v6));
    }
}
