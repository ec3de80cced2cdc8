use std::net::Ipv4Addr;

use anyhow::Result;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use super::ether::MacAddr;

pub const OP_REQUEST: u16 = 1;
pub const OP_REPLY: u16 = 2;

pub const HW_TYPE_ETHERNET: u16 = 1;
pub const PROTO_TYPE_IPV4: u16 = 0x0800;

pub const PACKET_LEN: usize = 28;

/// An Ethernet/IPv4 ARP packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArpPacket {
    pub hw_type: u16,
    pub proto_type: u16,
    pub hw_len: u8,
    pub proto_len: u8,
    pub operation: u16,
    pub sender_hw: MacAddr,
    pub sender_proto: Ipv4Addr,
    pub target_hw: MacAddr,
    pub target_proto: Ipv4Addr,
}

impl ArpPacket {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        anyhow::ensure!(buf.len() >= PACKET_LEN, "arp packet too short: {}", buf.len());
        let hw_len = buf[4];
        let proto_len = buf[5];
        // The typed fields below only make sense for Ethernet/IPv4 ARPs.
        anyhow::ensure!(
            hw_len == 6 && proto_len == 4,
            "unsupported arp address sizes hw={} proto={}",
            hw_len,
            proto_len
        );
        Ok(Self {
            hw_type: u16::from_be_bytes([buf[0], buf[1]]),
            proto_type: u16::from_be_bytes([buf[2], buf[3]]),
            hw_len,
            proto_len,
            operation: u16::from_be_bytes([buf[6], buf[7]]),
            sender_hw: buf[8..14].try_into().unwrap(),
            sender_proto: Ipv4Addr::new(buf[14], buf[15], buf[16], buf[17]),
            target_hw: buf[18..24].try_into().unwrap(),
            target_proto: Ipv4Addr::new(buf[24], buf[25], buf[26], buf[27]),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut pkt = BytesMut::with_capacity(PACKET_LEN);
        pkt.put_u16(self.hw_type);
        pkt.put_u16(self.proto_type);
        pkt.put_u8(self.hw_len);
        pkt.put_u8(self.proto_len);
        pkt.put_u16(self.operation);
        pkt.put_slice(&self.sender_hw);
        pkt.put_slice(&self.sender_proto.octets());
        pkt.put_slice(&self.target_hw);
        pkt.put_slice(&self.target_proto.octets());
        pkt.freeze()
    }

    pub fn is_request(&self) -> bool {
        self.operation == OP_REQUEST
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ArpPacket {
        ArpPacket {
            hw_type: HW_TYPE_ETHERNET,
            proto_type: PROTO_TYPE_IPV4,
            hw_len: 6,
            proto_len: 4,
            operation: OP_REQUEST,
            sender_hw: [0x02, 0x00, 0x00, 0x00, 0x00, 0x01],
            sender_proto: Ipv4Addr::new(10, 0, 0, 2),
            target_hw: [0; 6],
            target_proto: Ipv4Addr::new(10, 0, 0, 5),
        }
    }

    #[test]
    fn encode_parse_round_trip() {
        let req = request();
        let bytes = req.encode();
        assert_eq!(bytes.len(), PACKET_LEN);
        assert_eq!(ArpPacket::parse(&bytes).unwrap(), req);
    }

    #[test]
    fn rejects_short_and_non_ethernet() {
        assert!(ArpPacket::parse(&[0u8; 27]).is_err());
        let mut bytes = request().encode().to_vec();
        bytes[4] = 8; // bogus hardware address size
        assert!(ArpPacket::parse(&bytes).is_err());
    }
}
