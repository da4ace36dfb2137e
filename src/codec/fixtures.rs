//! Raw packet builders shared by unit tests across the crate.

pub const CLIENT: [u8; 4] = [192, 168, 1, 10];
pub const SERVER: [u8; 4] = [93, 184, 216, 34];

/// IPv4 + TCP packet with a 20-byte IP header and 20-byte TCP header.
#[allow(clippy::too_many_arguments)]
pub fn ipv4_tcp(
    src: [u8; 4],
    dst: [u8; 4],
    src_port: u16,
    dst_port: u16,
    ttl: u8,
    seq: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let total = 40 + payload.len();
    let mut pkt = vec![0u8; total];
    // Byte 0: version 4, IHL 5.
    pkt[0] = 0x45;
    // Bytes 2-3: total length.
    pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    // Bytes 4-5: identification.
    pkt[4..6].copy_from_slice(&0x1234u16.to_be_bytes());
    pkt[8] = ttl;
    pkt[9] = 6;
    pkt[12..16].copy_from_slice(&src);
    pkt[16..20].copy_from_slice(&dst);
    // TCP header starts at 20.
    pkt[20..22].copy_from_slice(&src_port.to_be_bytes());
    pkt[22..24].copy_from_slice(&dst_port.to_be_bytes());
    pkt[24..28].copy_from_slice(&seq.to_be_bytes());
    // Byte 32: data offset 5 words.
    pkt[32] = 0x50;
    pkt[33] = flags;
    // Bytes 34-35: window.
    pkt[34..36].copy_from_slice(&0xFAF0u16.to_be_bytes());
    pkt[40..].copy_from_slice(payload);
    pkt
}

/// IPv6 + TCP packet (no extension headers), loopback-ish addresses.
pub fn ipv6_tcp(src_port: u16, dst_port: u16, hop_limit: u8, seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0u8; 60 + payload.len()];
    // Byte 0: version 6.
    pkt[0] = 0x60;
    // Bytes 4-5: payload length (TCP header + data).
    pkt[4..6].copy_from_slice(&((20 + payload.len()) as u16).to_be_bytes());
    pkt[6] = 6;
    pkt[7] = hop_limit;
    // Source 2001:db8::1, destination 2001:db8::2.
    pkt[8] = 0x20;
    pkt[9] = 0x01;
    pkt[10] = 0x0d;
    pkt[11] = 0xb8;
    pkt[23] = 1;
    pkt[24] = 0x20;
    pkt[25] = 0x01;
    pkt[26] = 0x0d;
    pkt[27] = 0xb8;
    pkt[39] = 2;
    pkt[40..42].copy_from_slice(&src_port.to_be_bytes());
    pkt[42..44].copy_from_slice(&dst_port.to_be_bytes());
    pkt[44..48].copy_from_slice(&seq.to_be_bytes());
    pkt[52] = 0x50;
    pkt[53] = super::TCP_ACK | super::TCP_PSH;
    pkt[60..].copy_from_slice(payload);
    pkt
}

/// IPv4 + UDP packet.
pub fn ipv4_udp(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let total = 28 + payload.len();
    let mut pkt = vec![0u8; total];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    pkt[8] = 64;
    pkt[9] = 17;
    pkt[12..16].copy_from_slice(&src);
    pkt[16..20].copy_from_slice(&dst);
    pkt[20..22].copy_from_slice(&src_port.to_be_bytes());
    pkt[22..24].copy_from_slice(&dst_port.to_be_bytes());
    // Bytes 24-25: UDP length.
    pkt[24..26].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    pkt[28..].copy_from_slice(payload);
    pkt
}

/// TLS 1.2-framed ClientHello with an SNI extension for `host`, padded with a
/// padding extension (0x0015) to exactly `target_len` bytes when possible.
pub fn client_hello(host: &str, target_len: usize) -> Vec<u8> {
    let mut body = Vec::new();
    // client_version + random
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0x11; 32]);
    // session_id: empty
    body.push(0);
    // cipher_suites: 2 suites
    body.extend_from_slice(&[0x00, 0x04, 0x13, 0x01, 0x13, 0x02]);
    // compression_methods: null
    body.extend_from_slice(&[0x01, 0x00]);

    let h = host.as_bytes();
    let list_len = 3 + h.len();
    let mut exts = Vec::new();
    exts.extend_from_slice(&0x0000u16.to_be_bytes());
    exts.extend_from_slice(&((list_len + 2) as u16).to_be_bytes());
    exts.extend_from_slice(&(list_len as u16).to_be_bytes());
    exts.push(0); // host_name
    exts.extend_from_slice(&(h.len() as u16).to_be_bytes());
    exts.extend_from_slice(h);

    let fixed = 5 + 4 + body.len() + 2 + exts.len() + 4;
    let pad = target_len.saturating_sub(fixed);
    exts.extend_from_slice(&0x0015u16.to_be_bytes());
    exts.extend_from_slice(&(pad as u16).to_be_bytes());
    exts.extend(std::iter::repeat(0u8).take(pad));

    body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
    body.extend_from_slice(&exts);

    let mut hs = vec![0x01];
    hs.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    hs.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(hs.len() as u16).to_be_bytes());
    record.extend_from_slice(&hs);
    record
}

/// ClientHello framing with no extensions at all.
pub fn client_hello_without_sni(target_len: usize) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0x22; 32]);
    body.push(0);
    let fixed = 5 + 4 + body.len() + 2 + 2;
    let ciphers = target_len.saturating_sub(fixed) & !1;
    body.extend_from_slice(&(ciphers as u16).to_be_bytes());
    body.extend(std::iter::repeat(0x13u8).take(ciphers));
    body.extend_from_slice(&[0x01, 0x00]);

    let mut hs = vec![0x01];
    hs.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    hs.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(hs.len() as u16).to_be_bytes());
    record.extend_from_slice(&hs);
    record
}
