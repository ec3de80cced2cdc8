use std::net::Ipv4Addr;

use anyhow::Result;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use super::ipv4;

pub const HEADER_LEN: usize = 8;

/// Borrowed view of a UDP datagram.
pub struct UdpDatagram<'a> {
    buf: &'a [u8],
}

impl<'a> UdpDatagram<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        anyhow::ensure!(buf.len() >= HEADER_LEN, "udp datagram too short: {}", buf.len());
        Ok(Self { buf })
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.buf[0], self.buf[1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.buf[2], self.buf[3]])
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.buf[HEADER_LEN..]
    }
}

/// Serialize a UDP datagram with the checksum computed over the IPv4
/// pseudo-header. A computed checksum of zero is transmitted as 0xFFFF.
pub fn build(
    src_port: u16,
    dst_port: u16,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    payload: &[u8],
) -> Bytes {
    let udp_len = (HEADER_LEN + payload.len()) as u16;

    let mut dgram = BytesMut::with_capacity(udp_len as usize);
    dgram.put_u16(src_port);
    dgram.put_u16(dst_port);
    dgram.put_u16(udp_len);
    dgram.put_u16(0x0000); // checksum placeholder
    dgram.put_slice(payload);

    let mut pseudo = BytesMut::with_capacity(12);
    pseudo.put_slice(&src_ip.octets());
    pseudo.put_slice(&dst_ip.octets());
    pseudo.put_u8(0);
    pseudo.put_u8(ipv4::PROTO_UDP);
    pseudo.put_u16(udp_len);

    let partial = !ipv4::checksum(&pseudo) as u32;
    let mut sum = ipv4::checksum_with(partial, &dgram);
    if sum == 0 {
        sum = 0xFFFF;
    }
    dgram[6] = (sum >> 8) as u8;
    dgram[7] = sum as u8;
    dgram.freeze()
}
