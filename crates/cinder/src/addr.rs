//! Address types shared by the peer engine and the tracker.
//!
//! IPv4 and IPv6 are unified into a single 128-bit integer space where an
//! IPv4 address lives at its IPv4-mapped position (`::ffff:a.b.c.d`). Ranges,
//! CIDR blocks and the allow/ban lists all work in that space, so an IPv4
//! rule also matches the same host seen over a dual-stack socket.
use std::{
    fs,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    path::Path,
    str::FromStr,
};

use tracing::warn;

use crate::error::Error;

const V4_MAPPED: u128 = 0xffff_0000_0000;

/// Position of an address in the unified space.
pub fn to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => V4_MAPPED | u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Inverse of [`to_u128`], IPv4-mapped positions come back as IPv4.
pub fn from_u128(n: u128) -> IpAddr {
    if n >> 32 == V4_MAPPED >> 32 {
        IpAddr::V4(Ipv4Addr::from(n as u32))
    } else {
        IpAddr::V6(Ipv6Addr::from(n))
    }
}

/// Collapse IPv4-mapped IPv6 addresses to plain IPv4.
pub fn normalize(ip: IpAddr) -> IpAddr {
    from_u128(to_u128(ip))
}

/// Loopback, private, link-local and unspecified addresses.
pub fn is_local(ip: IpAddr) -> bool {
    match normalize(ip) {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link local
                || first & 0xfe00 == 0xfc00
                || first & 0xffc0 == 0xfe80
        }
    }
}

/// An inclusive range of addresses in the unified space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IpRange {
    pub start: u128,
    pub end: u128,
}

impl IpRange {
    pub fn single(ip: IpAddr) -> Self {
        let n = to_u128(ip);
        Self { start: n, end: n }
    }

    /// A CIDR block. IPv4 prefixes are counted within the 32 bit space.
    pub fn cidr(ip: IpAddr, prefix: u8) -> Result<Self, Error> {
        let (base, width) = match ip {
            IpAddr::V4(_) => (to_u128(ip), 32u32),
            IpAddr::V6(_) => (to_u128(ip), 128u32),
        };
        let prefix = prefix as u32;
        if prefix > width {
            return Err(Error::InvalidAddress(format!("{ip}/{prefix}")));
        }
        let host_bits = width - prefix;
        let host_mask = if host_bits == 128 { u128::MAX } else { (1u128 << host_bits) - 1 };
        let start = base & !host_mask;
        Ok(Self { start, end: start | host_mask })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let n = to_u128(ip);
        self.start <= n && n <= self.end
    }
}

impl FromStr for IpRange {
    type Err = Error;

    /// Accepts `addr`, `start-end` and `addr/prefix`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let bad = || Error::InvalidAddress(s.to_owned());

        if let Some((ip, prefix)) = s.split_once('/') {
            let ip: IpAddr = ip.trim().parse().map_err(|_| bad())?;
            let prefix: u8 = prefix.trim().parse().map_err(|_| bad())?;
            return Self::cidr(ip, prefix);
        }

        if let Some((a, b)) = s.split_once('-') {
            let a: IpAddr = a.trim().parse().map_err(|_| bad())?;
            let b: IpAddr = b.trim().parse().map_err(|_| bad())?;
            let (start, end) = (to_u128(a), to_u128(b));
            if start > end {
                return Err(bad());
            }
            return Ok(Self { start, end });
        }

        let ip: IpAddr = s.parse().map_err(|_| bad())?;
        Ok(Self::single(ip))
    }
}

/// A set of address ranges, kept sorted and merged for binary search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpList {
    ranges: Vec<IpRange>,
}

impl IpList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn add(&mut self, range: IpRange) {
        let at = self.ranges.partition_point(|r| r.start < range.start);
        self.ranges.insert(at, range);
        self.merge();
    }

    pub fn add_ip(&mut self, ip: IpAddr) {
        self.add(IpRange::single(ip));
    }

    pub fn includes(&self, ip: IpAddr) -> bool {
        let n = to_u128(ip);
        let at = self.ranges.partition_point(|r| r.end < n);
        self.ranges.get(at).is_some_and(|r| r.start <= n)
    }

    fn merge(&mut self) {
        let mut merged: Vec<IpRange> = Vec::with_capacity(self.ranges.len());
        for r in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if r.start <= last.end.saturating_add(1) => {
                    last.end = last.end.max(r.end);
                }
                _ => merged.push(r),
            }
        }
        self.ranges = merged;
    }

    /// Parse a list file. Each line holds one entry, in any of the
    /// [`IpRange`] forms, optionally prefixed by a `description:` label.
    /// Blank lines and `#` comments are skipped, malformed lines are logged
    /// and skipped.
    pub fn parse(text: &str) -> Self {
        let mut list = Self::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            // `label:1.2.3.4-1.2.3.9`; bare IPv6 entries also contain colons
            let entry = match line.rsplit_once(':') {
                Some((label, rest)) if line.parse::<IpRange>().is_err() && !label.is_empty() => {
                    rest
                }
                _ => line,
            };
            match entry.parse::<IpRange>() {
                Ok(r) => list.add(r),
                Err(_) => warn!("ignoring bad address on line {}: {line}", n + 1),
            }
        }
        list
    }

    pub fn read_file(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("cannot read {}: {e}", path.display())))?;
        Ok(Self::parse(&text))
    }
}

/// Compact peer form: 4 or 16 address bytes followed by a big endian port.
pub fn compact(addr: SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(18);
    match addr {
        SocketAddr::V4(a) => out.extend_from_slice(&a.ip().octets()),
        SocketAddr::V6(a) => match a.ip().to_ipv4_mapped() {
            Some(v4) => out.extend_from_slice(&v4.octets()),
            None => out.extend_from_slice(&a.ip().octets()),
        },
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

/// Parse a run of 6 byte IPv4 compact peers. A trailing partial entry is an
/// error.
pub fn parse_compact_v4(buf: &[u8]) -> Result<Vec<SocketAddr>, Error> {
    if buf.len() % 6 != 0 {
        return Err(Error::CompactPeerList);
    }
    Ok(buf
        .chunks_exact(6)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            let port = u16::from_be_bytes([c[4], c[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect())
}

/// Parse a run of 18 byte IPv6 compact peers.
pub fn parse_compact_v6(buf: &[u8]) -> Result<Vec<SocketAddr>, Error> {
    if buf.len() % 18 != 0 {
        return Err(Error::CompactPeerList);
    }
    Ok(buf
        .chunks_exact(18)
        .map(|c| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&c[..16]);
            let port = u16::from_be_bytes([c[16], c[17]]);
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn v4_maps_into_v6_space() {
        let a = ip("10.1.2.3");
        assert_eq!(from_u128(to_u128(a)), a);
        assert_eq!(normalize(ip("::ffff:10.1.2.3")), a);
        let v6 = ip("2001:db8::1");
        assert_eq!(from_u128(to_u128(v6)), v6);
    }

    #[test]
    fn cidr_ranges() {
        let r: IpRange = "192.168.0.0/16".parse().unwrap();
        assert!(r.contains(ip("192.168.4.5")));
        assert!(r.contains(ip("::ffff:192.168.255.255")));
        assert!(!r.contains(ip("192.169.0.0")));

        let r: IpRange = "2001:db8::/32".parse().unwrap();
        assert!(r.contains(ip("2001:db8:ffff::1")));
        assert!(!r.contains(ip("2001:db9::")));

        assert!("10.0.0.0/33".parse::<IpRange>().is_err());
        let all: IpRange = "::/0".parse().unwrap();
        assert!(all.contains(ip("1.1.1.1")));
    }

    #[test]
    fn explicit_ranges() {
        let r: IpRange = "10.0.0.5 - 10.0.0.9".parse().unwrap();
        assert!(r.contains(ip("10.0.0.7")));
        assert!(!r.contains(ip("10.0.0.10")));
        assert!("10.0.0.9-10.0.0.5".parse::<IpRange>().is_err());
    }

    #[test]
    fn list_merges_and_searches() {
        let mut list = IpList::new();
        list.add("10.0.0.0-10.0.0.10".parse().unwrap());
        list.add("10.0.0.11-10.0.0.20".parse().unwrap());
        list.add("10.0.0.5-10.0.0.6".parse().unwrap());
        list.add_ip(ip("1.2.3.4"));

        assert_eq!(list.len(), 2);
        assert!(list.includes(ip("10.0.0.15")));
        assert!(list.includes(ip("1.2.3.4")));
        assert!(!list.includes(ip("1.2.3.5")));
        assert!(!list.includes(ip("10.0.0.21")));
    }

    #[test]
    fn parse_list_file() {
        let text = "\
# banned
Some Corp:10.0.0.0-10.0.0.255
192.168.1.0/24   # lan
not an address
2001:db8::1
";
        let list = IpList::parse(text);
        assert!(list.includes(ip("10.0.0.77")));
        assert!(list.includes(ip("192.168.1.9")));
        assert!(list.includes(ip("2001:db8::1")));
        assert!(!list.includes(ip("8.8.8.8")));
    }

    #[test]
    fn locality() {
        assert!(is_local(ip("127.0.0.1")));
        assert!(is_local(ip("10.4.4.4")));
        assert!(is_local(ip("::1")));
        assert!(is_local(ip("fe80::1")));
        assert!(!is_local(ip("8.8.8.8")));
        assert!(!is_local(ip("2001:db8::1")));
    }

    #[test]
    fn compact_peers() {
        let a: SocketAddr = "1.2.3.4:6881".parse().unwrap();
        let bytes = compact(a);
        assert_eq!(bytes, vec![1, 2, 3, 4, 0x1a, 0xe1]);
        assert_eq!(parse_compact_v4(&bytes).unwrap(), vec![a]);
        assert!(parse_compact_v4(&bytes[..5]).is_err());

        let b: SocketAddr = "[2001:db8::1]:51413".parse().unwrap();
        let bytes = compact(b);
        assert_eq!(bytes.len(), 18);
        assert_eq!(parse_compact_v6(&bytes).unwrap(), vec![b]);
    }
}
