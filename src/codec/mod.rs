//! Stateless IPv4/IPv6 + TCP/UDP header parsing and in-place header rewrites.
//!
//! `parse` never panics on malformed or truncated input; it returns `None`,
//! which every caller treats as "forward unchanged". Checksums are never
//! computed here: after a rewrite the caller hands the buffer to the packet
//! I/O checksum helper.

pub mod tls;

#[cfg(test)]
pub(crate) mod fixtures;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;
const TCP_MIN_HEADER: usize = 20;
const UDP_HEADER: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

/// Header view of one raw packet. Addresses are kept as integers
/// (IPv4 in the low 32 bits) so hot-path comparisons never allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedPacket {
    pub version: IpVersion,
    pub ip_header_len: usize,
    pub transport: Transport,
    pub src_addr: u128,
    pub dst_addr: u128,
    pub src_port: u16,
    pub dst_port: u16,
    /// IPv4 TTL or IPv6 hop limit.
    pub ttl: u8,
    /// Zero for UDP.
    pub tcp_flags: u8,
    /// TCP data offset in bytes, or 8 for UDP.
    pub transport_header_len: usize,
    pub payload_offset: usize,
    pub payload_len: usize,
    /// Zero for UDP.
    pub seq: u32,
}

impl ParsedPacket {
    pub fn is_tcp(&self) -> bool {
        self.transport == Transport::Tcp
    }

    pub fn is_udp(&self) -> bool {
        self.transport == Transport::Udp
    }

    pub fn is_rst(&self) -> bool {
        self.is_tcp() && self.tcp_flags & TCP_RST != 0
    }

    pub fn is_ipv4(&self) -> bool {
        self.version == IpVersion::V4
    }

    /// Length of everything before the payload.
    pub fn header_len(&self) -> usize {
        self.payload_offset
    }

    /// Payload bytes of `data`, which must be the buffer this view was parsed from.
    pub fn payload<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        data.get(self.payload_offset..self.payload_offset + self.payload_len)
            .unwrap_or(&[])
    }

    pub fn src_ip(&self) -> IpAddr {
        addr_to_ip(self.version, self.src_addr)
    }

    pub fn dst_ip(&self) -> IpAddr {
        addr_to_ip(self.version, self.dst_addr)
    }

    pub fn dst_ipv4(&self) -> Option<Ipv4Addr> {
        match self.version {
            IpVersion::V4 => Some(Ipv4Addr::from(self.dst_addr as u32)),
            IpVersion::V6 => None,
        }
    }
}

/// Convert an integer address back to an `IpAddr`.
pub fn addr_to_ip(version: IpVersion, addr: u128) -> IpAddr {
    match version {
        IpVersion::V4 => IpAddr::V4(Ipv4Addr::from(addr as u32)),
        IpVersion::V6 => IpAddr::V6(Ipv6Addr::from(addr)),
    }
}

/// Integer form of an `IpAddr`, matching `ParsedPacket` addresses.
pub fn ip_to_addr(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Parse an IP packet. Returns `None` for anything that is not a complete,
/// unfragmented IPv4/IPv6 TCP or UDP packet.
pub fn parse(data: &[u8]) -> Option<ParsedPacket> {
    let first = *data.first()?;
    let (version, ip_header_len, end, protocol, ttl, src_addr, dst_addr) = match first >> 4 {
        4 => {
            if data.len() < IPV4_MIN_HEADER {
                return None;
            }
            let ihl = ((first & 0x0F) as usize) * 4;
            let total = be16(data, 2)? as usize;
            if ihl < IPV4_MIN_HEADER || total < ihl || total > data.len() {
                return None;
            }
            // Any IP-level fragment (MF set or non-zero offset) carries a partial segment.
            let frag = be16(data, 6)?;
            if frag & 0x3FFF != 0 {
                return None;
            }
            (
                IpVersion::V4,
                ihl,
                total,
                data[9],
                data[8],
                be32(data, 12)? as u128,
                be32(data, 16)? as u128,
            )
        }
        6 => {
            if data.len() < IPV6_HEADER {
                return None;
            }
            let end = IPV6_HEADER + be16(data, 4)? as usize;
            if end > data.len() {
                return None;
            }
            (
                IpVersion::V6,
                IPV6_HEADER,
                end,
                data[6],
                data[7],
                be128(data, 8)?,
                be128(data, 24)?,
            )
        }
        _ => return None,
    };

    let t = ip_header_len;
    match protocol {
        6 => {
            if t + TCP_MIN_HEADER > end {
                return None;
            }
            let data_offset = ((data[t + 12] >> 4) as usize) * 4;
            if data_offset < TCP_MIN_HEADER || t + data_offset > end {
                return None;
            }
            Some(ParsedPacket {
                version,
                ip_header_len,
                transport: Transport::Tcp,
                src_addr,
                dst_addr,
                src_port: be16(data, t)?,
                dst_port: be16(data, t + 2)?,
                ttl,
                tcp_flags: data[t + 13],
                transport_header_len: data_offset,
                payload_offset: t + data_offset,
                payload_len: end - t - data_offset,
                seq: be32(data, t + 4)?,
            })
        }
        17 => {
            if t + UDP_HEADER > end {
                return None;
            }
            Some(ParsedPacket {
                version,
                ip_header_len,
                transport: Transport::Udp,
                src_addr,
                dst_addr,
                src_port: be16(data, t)?,
                dst_port: be16(data, t + 2)?,
                ttl,
                tcp_flags: 0,
                transport_header_len: UDP_HEADER,
                payload_offset: t + UDP_HEADER,
                payload_len: end - t - UDP_HEADER,
                seq: 0,
            })
        }
        _ => None,
    }
}

/// Rewrite the IP length field so it matches `buf.len()`.
/// IPv4 carries a total length, IPv6 a payload length (everything after the fixed header).
pub fn set_ip_length(buf: &mut [u8], version: IpVersion) -> bool {
    let value = match version {
        IpVersion::V4 => buf.len(),
        IpVersion::V6 => buf.len().saturating_sub(IPV6_HEADER),
    };
    let Ok(value) = u16::try_from(value) else {
        return false;
    };
    match version {
        IpVersion::V4 => put_be16(buf, 2, value),
        IpVersion::V6 => put_be16(buf, 4, value),
    }
}

/// Add `delta` to the TCP sequence number (mod 2^32).
pub fn add_tcp_seq(buf: &mut [u8], ip_header_len: usize, delta: u32) -> bool {
    match be32(buf, ip_header_len + 4) {
        Some(seq) => put_be32(buf, ip_header_len + 4, seq.wrapping_add(delta)),
        None => false,
    }
}

/// Subtract `delta` from the TCP sequence number (mod 2^32).
pub fn sub_tcp_seq(buf: &mut [u8], ip_header_len: usize, delta: u32) -> bool {
    match be32(buf, ip_header_len + 4) {
        Some(seq) => put_be32(buf, ip_header_len + 4, seq.wrapping_sub(delta)),
        None => false,
    }
}

pub fn tcp_seq(buf: &[u8], ip_header_len: usize) -> Option<u32> {
    be32(buf, ip_header_len + 4)
}

/// Set IPv4 TTL / IPv6 hop limit.
pub fn set_ttl(buf: &mut [u8], version: IpVersion, ttl: u8) -> bool {
    let offset = match version {
        IpVersion::V4 => 8,
        IpVersion::V6 => 7,
    };
    match buf.get_mut(offset) {
        Some(b) => {
            *b = ttl;
            true
        }
        None => false,
    }
}

/// Invert the TCP checksum. Deterministic: 0x0000 becomes 0xFFFF.
pub fn invert_tcp_checksum(buf: &mut [u8], ip_header_len: usize) -> bool {
    match be16(buf, ip_header_len + 16) {
        Some(sum) => put_be16(buf, ip_header_len + 16, !sum),
        None => false,
    }
}

/// Build one TCP segment carrying `payload[start..start + len]` of the original
/// packet: headers copied verbatim, IP length rewritten, sequence advanced by `start`.
/// Checksums are left stale for the caller to recompute.
pub fn build_segment(
    original: &[u8],
    parsed: &ParsedPacket,
    start: usize,
    len: usize,
) -> Option<Vec<u8>> {
    if start + len > parsed.payload_len {
        return None;
    }
    let header = original.get(..parsed.header_len())?;
    let from = parsed.payload_offset + start;
    let chunk = original.get(from..from + len)?;

    let mut seg = Vec::with_capacity(header.len() + len);
    seg.extend_from_slice(header);
    seg.extend_from_slice(chunk);
    if !set_ip_length(&mut seg, parsed.version) {
        return None;
    }
    if start > 0 && !add_tcp_seq(&mut seg, parsed.ip_header_len, start as u32) {
        return None;
    }
    Some(seg)
}

/// Rewrite destination address and port. Fails on address-family mismatch.
pub fn set_destination(buf: &mut [u8], parsed: &ParsedPacket, ip: IpAddr, port: u16) -> bool {
    let addr_ok = match (parsed.version, ip) {
        (IpVersion::V4, IpAddr::V4(v4)) => put_bytes(buf, 16, &v4.octets()),
        (IpVersion::V6, IpAddr::V6(v6)) => put_bytes(buf, 24, &v6.octets()),
        _ => return false,
    };
    addr_ok && put_be16(buf, parsed.ip_header_len + 2, port)
}

fn be16(data: &[u8], at: usize) -> Option<u16> {
    let b = data.get(at..at + 2)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

fn be32(data: &[u8], at: usize) -> Option<u32> {
    let b = data.get(at..at + 4)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn be128(data: &[u8], at: usize) -> Option<u128> {
    let b: [u8; 16] = data.get(at..at + 16)?.try_into().ok()?;
    Some(u128::from_be_bytes(b))
}

fn put_be16(buf: &mut [u8], at: usize, v: u16) -> bool {
    put_bytes(buf, at, &v.to_be_bytes())
}

fn put_be32(buf: &mut [u8], at: usize, v: u32) -> bool {
    put_bytes(buf, at, &v.to_be_bytes())
}

fn put_bytes(buf: &mut [u8], at: usize, bytes: &[u8]) -> bool {
    match buf.get_mut(at..at + bytes.len()) {
        Some(dst) => {
            dst.copy_from_slice(bytes);
            true
        }
        None => false,
    }
}
