use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use byteorder::{NetworkEndian, ReadBytesExt};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

const FLAG_IPV6: u8 = 0x80;

/// BMP Per-Peer Header, present on every message type except
/// Initiation & Termination
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerHeader {
    pub peer_type: u8,
    pub flags: u8,
    pub distinguisher: u64,
    pub address: IpAddr,
    pub asn: u32,
    pub bgp_id: Ipv4Addr,
    pub timestamp: Option<DateTime<Utc>>,
}

impl PeerHeader {
    pub const LENGTH: usize = 42;

    /// Decode from the bytes directly following the Common Header
    pub fn parse(mut buf: &[u8]) -> io::Result<Self> {
        let peer_type = buf.read_u8()?;
        let flags = buf.read_u8()?;
        let distinguisher = buf.read_u64::<NetworkEndian>()?;
        let mut raw_addr = [0u8; 16];
        buf.read_exact(&mut raw_addr)?;
        let address = if flags & FLAG_IPV6 != 0 {
            IpAddr::from(Ipv6Addr::from(raw_addr))
        } else {
            IpAddr::from([raw_addr[12], raw_addr[13], raw_addr[14], raw_addr[15]])
        };
        let asn = buf.read_u32::<NetworkEndian>()?;
        let bgp_id = Ipv4Addr::from(buf.read_u32::<NetworkEndian>()?);
        let seconds = buf.read_u32::<NetworkEndian>()?;
        let micros = buf.read_u32::<NetworkEndian>()?;
        // Routers that don't track time send zero
        let timestamp = match (seconds, micros) {
            (0, 0) => None,
            _ => Utc
                .timestamp_opt(i64::from(seconds), micros.saturating_mul(1000))
                .single(),
        };
        Ok(Self {
            peer_type,
            flags,
            distinguisher,
            address,
            asn,
            bgp_id,
            timestamp,
        })
    }

    pub fn is_ipv6(&self) -> bool {
        self.flags & FLAG_IPV6 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_header(flags: u8, addr: [u8; 16]) -> Vec<u8> {
        let mut buf = vec![0, flags];
        buf.extend_from_slice(&[0; 8]);
        buf.extend_from_slice(&addr);
        buf.extend_from_slice(&65000u32.to_be_bytes());
        buf.extend_from_slice(&[10, 0, 0, 1]);
        buf.extend_from_slice(&1_600_000_000u32.to_be_bytes());
        buf.extend_from_slice(&500u32.to_be_bytes());
        buf
    }

    #[test]
    fn test_parse_ipv4_peer() {
        let mut addr = [0u8; 16];
        addr[12..].copy_from_slice(&[192, 0, 2, 1]);
        let header = PeerHeader::parse(&peer_header(0, addr)).unwrap();
        assert!(!header.is_ipv6());
        assert_eq!(header.address, IpAddr::from([192, 0, 2, 1]));
        assert_eq!(header.asn, 65000);
        assert_eq!(header.bgp_id, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(header.timestamp.unwrap().timestamp(), 1_600_000_000);
    }

    #[test]
    fn test_parse_ipv6_peer() {
        let addr: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let header = PeerHeader::parse(&peer_header(0x80, addr.octets())).unwrap();
        assert!(header.is_ipv6());
        assert_eq!(header.address, IpAddr::from(addr));
    }

    #[test]
    fn test_parse_truncated() {
        let buf = peer_header(0, [0; 16]);
        assert!(PeerHeader::parse(&buf[..30]).is_err());
    }
}
