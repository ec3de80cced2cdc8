use anyhow::Result;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

pub type MacAddr = [u8; 6];

pub const MAC_BROADCAST: MacAddr = [0xFF; 6];

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

pub const HEADER_LEN: usize = 14;

/// Borrowed view of an Ethernet frame.
pub struct EtherFrame<'a> {
    buf: &'a [u8],
}

impl<'a> EtherFrame<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        anyhow::ensure!(buf.len() >= HEADER_LEN, "ethernet frame too short: {}", buf.len());
        Ok(Self { buf })
    }

    pub fn dst(&self) -> MacAddr {
        self.buf[0..6].try_into().unwrap()
    }

    pub fn src(&self) -> MacAddr {
        self.buf[6..12].try_into().unwrap()
    }

    pub fn ethertype(&self) -> u16 {
        u16::from_be_bytes([self.buf[12], self.buf[13]])
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.buf[HEADER_LEN..]
    }
}

/// Serialize an Ethernet frame around `payload`.
pub fn build_frame(dst: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_slice(&dst);
    frame.put_slice(&src);
    frame.put_u16(ethertype);
    frame.put_slice(payload);
    frame.freeze()
}

/// Generate a random unicast MAC with the locally-administered bit set.
/// Used as the synthetic gateway hardware address.
pub fn random_private_mac() -> MacAddr {
    let mut mac = rand::random::<MacAddr>();
    mac[0] = (mac[0] | 0x02) & 0xFE;
    mac
}

pub fn format_mac(mac: &MacAddr) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accessors() {
        let frame = build_frame(
            [0xAA; 6],
            [0x02, 0x00, 0x00, 0x00, 0x00, 0x01],
            ETHERTYPE_IPV4,
            &[0x45, 0x00],
        );
        let eth = EtherFrame::parse(&frame).unwrap();
        assert_eq!(eth.dst(), [0xAA; 6]);
        assert_eq!(eth.src(), [0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(eth.ethertype(), ETHERTYPE_IPV4);
        assert_eq!(eth.payload(), &[0x45, 0x00]);
    }

    #[test]
    fn parse_rejects_runt() {
        assert!(EtherFrame::parse(&[0u8; 13]).is_err());
    }

    #[test]
    fn private_mac_is_local_unicast() {
        for _ in 0..32 {
            let mac = random_private_mac();
            assert_eq!(mac[0] & 0x02, 0x02, "locally administered bit");
            assert_eq!(mac[0] & 0x01, 0x00, "unicast bit");
        }
    }
}
