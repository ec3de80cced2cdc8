use std::net::Ipv4Addr;

use anyhow::Result;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::net::Cidr;

pub const OP_REQUEST: u8 = 1;
pub const OP_REPLY: u8 = 2;

pub const HW_TYPE_ETHERNET: u8 = 1;

pub const PORT_SERVER: u16 = 67;
pub const PORT_CLIENT: u16 = 68;

const MAGIC_COOKIE: u32 = 0x6382_5363;

/// Fixed BOOTP header plus the magic cookie.
const FIXED_LEN: usize = 240;

/// Replies are padded so the whole frame reaches the historical BOOTP
/// minimum of 300 bytes (Ethernet 14 + IPv4 20 + UDP 8 + payload 258).
const MIN_PAYLOAD_LEN: usize = 258;

pub mod opt {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const DNS: u8 = 6;
    pub const LEASE_TIME: u8 = 51;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_ID: u8 = 54;
    pub const CLASSLESS_STATIC_ROUTE: u8 = 121;
    pub const END: u8 = 255;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            _ => Err(()),
        }
    }
}

/// A single DHCP option in wire order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhcpOption {
    pub code: u8,
    pub data: Vec<u8>,
}

impl DhcpOption {
    pub fn new(code: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            data: data.into(),
        }
    }
}

/// A DHCPv4 message (the UDP payload, starting at the BOOTP `op` field).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhcpMessage {
    pub op: u8,
    pub hw_type: u8,
    pub hw_len: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    /// Raw 16-byte client hardware address field; the first `hw_len` bytes
    /// are significant.
    pub chaddr: [u8; 16],
    pub options: Vec<DhcpOption>,
}

impl DhcpMessage {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        anyhow::ensure!(buf.len() >= FIXED_LEN, "dhcp message too short: {}", buf.len());
        let magic = u32::from_be_bytes([buf[236], buf[237], buf[238], buf[239]]);
        anyhow::ensure!(magic == MAGIC_COOKIE, "bad dhcp magic cookie {:#010x}", magic);

        let mut options = Vec::new();
        let mut at = FIXED_LEN;
        while at < buf.len() {
            let code = buf[at];
            if code == opt::END {
                break;
            }
            if code == opt::PAD {
                at += 1;
                continue;
            }
            if at + 1 >= buf.len() {
                break;
            }
            let len = buf[at + 1] as usize;
            if at + 2 + len > buf.len() {
                break;
            }
            options.push(DhcpOption::new(code, &buf[at + 2..at + 2 + len]));
            at += 2 + len;
        }

        Ok(Self {
            op: buf[0],
            hw_type: buf[1],
            hw_len: buf[2],
            hops: buf[3],
            xid: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            secs: u16::from_be_bytes([buf[8], buf[9]]),
            flags: u16::from_be_bytes([buf[10], buf[11]]),
            ciaddr: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
            yiaddr: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
            siaddr: Ipv4Addr::new(buf[20], buf[21], buf[22], buf[23]),
            giaddr: Ipv4Addr::new(buf[24], buf[25], buf[26], buf[27]),
            chaddr: buf[28..44].try_into().unwrap(),
            options,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(MIN_PAYLOAD_LEN);
        payload.put_u8(self.op);
        payload.put_u8(self.hw_type);
        payload.put_u8(self.hw_len);
        payload.put_u8(self.hops);
        payload.put_u32(self.xid);
        payload.put_u16(self.secs);
        payload.put_u16(self.flags);
        payload.put_slice(&self.ciaddr.octets());
        payload.put_slice(&self.yiaddr.octets());
        payload.put_slice(&self.siaddr.octets());
        payload.put_slice(&self.giaddr.octets());
        payload.put_slice(&self.chaddr);
        payload.put_slice(&[0u8; 192]); // sname + file
        payload.put_u32(MAGIC_COOKIE);
        for option in &self.options {
            payload.put_u8(option.code);
            payload.put_u8(option.data.len() as u8);
            payload.put_slice(&option.data);
        }
        payload.put_u8(opt::END);
        while payload.len() < MIN_PAYLOAD_LEN {
            payload.put_u8(opt::PAD);
        }
        payload.freeze()
    }

    pub fn find_option(&self, code: u8) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|o| o.code == code)
            .map(|o| o.data.as_slice())
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.find_option(opt::MESSAGE_TYPE)
            .and_then(|data| data.first().copied())
            .and_then(|b| MessageType::try_from(b).ok())
    }

    /// Significant bytes of the client hardware address.
    pub fn client_hw(&self) -> &[u8] {
        let len = (self.hw_len as usize).min(self.chaddr.len());
        &self.chaddr[..len]
    }
}

/// Encode the classless static route option (RFC 3442): for each prefix,
/// `{prefix_len, significant network octets, gateway}`. A /24 contributes
/// three network octets, a /25 four.
pub fn encode_routes(routes: &[Cidr], gateway: Ipv4Addr) -> Vec<u8> {
    let mut out = Vec::new();
    for route in routes {
        let len = route.prefix_len();
        let significant = (len as usize).div_ceil(8);
        out.push(len);
        out.extend_from_slice(&route.network().octets()[..significant]);
        out.extend_from_slice(&gateway.octets());
    }
    out
}
