use std::net::Ipv4Addr;

use anyhow::Result;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

pub const PROTO_UDP: u8 = 17;

pub const HEADER_LEN: usize = 20;

/// Borrowed view of an IPv4 datagram. Options are tolerated but not decoded.
pub struct Ipv4Packet<'a> {
    buf: &'a [u8],
}

impl<'a> Ipv4Packet<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        anyhow::ensure!(buf.len() >= HEADER_LEN, "ipv4 packet too short: {}", buf.len());
        anyhow::ensure!(buf[0] >> 4 == 4, "not an ipv4 packet (version {})", buf[0] >> 4);
        let ihl = ((buf[0] & 0x0F) as usize) * 4;
        anyhow::ensure!(
            ihl >= HEADER_LEN && ihl <= buf.len(),
            "ipv4 header length {} out of range",
            ihl
        );
        Ok(Self { buf })
    }

    fn header_len(&self) -> usize {
        ((self.buf[0] & 0x0F) as usize) * 4
    }

    pub fn ttl(&self) -> u8 {
        self.buf[8]
    }

    pub fn protocol(&self) -> u8 {
        self.buf[9]
    }

    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.buf[12], self.buf[13], self.buf[14], self.buf[15])
    }

    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.buf[16], self.buf[17], self.buf[18], self.buf[19])
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.buf[self.header_len()..]
    }
}

/// One-line packet description for debug logs.
pub fn summary(pkt: &[u8]) -> String {
    match Ipv4Packet::parse(pkt) {
        Ok(ip) => format!(
            "{} -> {} proto {} ({} bytes)",
            ip.src(),
            ip.dst(),
            ip.protocol(),
            pkt.len()
        ),
        Err(_) => format!("non-IPv4 ({} bytes)", pkt.len()),
    }
}

/// Extract just the destination address, the only field the server's tunnel
/// reader needs per packet.
pub fn dst_addr(pkt: &[u8]) -> Option<Ipv4Addr> {
    if pkt.len() < HEADER_LEN || pkt[0] >> 4 != 4 {
        return None;
    }
    Some(Ipv4Addr::new(pkt[16], pkt[17], pkt[18], pkt[19]))
}

/// Serialize a 20-byte IPv4 header (no options) with a computed checksum.
pub fn build_header(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    ttl: u8,
    payload_len: usize,
) -> Bytes {
    let total_len = (HEADER_LEN + payload_len) as u16;
    let mut hdr = BytesMut::with_capacity(HEADER_LEN);
    hdr.put_u8(0x45); // version 4, IHL 5
    hdr.put_u8(0x00); // DSCP/ECN
    hdr.put_u16(total_len);
    hdr.put_u32(0x0000_0000); // identification, flags, fragment offset
    hdr.put_u8(ttl);
    hdr.put_u8(protocol);
    hdr.put_u16(0x0000); // checksum placeholder
    hdr.put_slice(&src.octets());
    hdr.put_slice(&dst.octets());

    let sum = checksum(&hdr);
    hdr[10] = (sum >> 8) as u8;
    hdr[11] = sum as u8;
    hdr.freeze()
}

/// Internet checksum (RFC 1071) over `data`, odd lengths zero-padded.
pub fn checksum(data: &[u8]) -> u16 {
    checksum_with(0, data)
}

/// Internet checksum continuing from an initial partial `sum`. The UDP
/// encoder seeds this with the pseudo-header sum.
pub fn checksum_with(mut sum: u32, data: &[u8]) -> u16 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let hdr = build_header(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(255, 255, 255, 255),
            PROTO_UDP,
            64,
            100,
        );
        let pkt = Ipv4Packet::parse(&hdr).unwrap();
        assert_eq!(pkt.src(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(pkt.dst(), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(pkt.protocol(), PROTO_UDP);
        assert_eq!(pkt.ttl(), 64);
        assert_eq!(u16::from_be_bytes([hdr[2], hdr[3]]), 120);
        // A correct header checksums to zero.
        assert_eq!(checksum(&hdr), 0);
    }

    #[test]
    fn known_checksum_vector() {
        // Example header from RFC 1071 discussions.
        let hdr: [u8; 20] = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xC0, 0xA8,
            0x00, 0x01, 0xC0, 0xA8, 0x00, 0xC7,
        ];
        assert_eq!(checksum(&hdr), 0xB861);
    }

    #[test]
    fn dst_addr_fast_path() {
        let hdr = build_header(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 3),
            PROTO_UDP,
            64,
            0,
        );
        assert_eq!(dst_addr(&hdr), Some(Ipv4Addr::new(10, 0, 0, 3)));
        assert_eq!(dst_addr(&[0x60, 0x00]), None);
        assert_eq!(dst_addr(&[]), None);
    }

    #[test]
    fn parse_rejects_non_v4() {
        let mut hdr = build_header(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 3),
            PROTO_UDP,
            64,
            0,
        )
        .to_vec();
        hdr[0] = 0x65;
        assert!(Ipv4Packet::parse(&hdr).is_err());
    }
}
