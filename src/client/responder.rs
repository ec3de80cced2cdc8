use std::net::Ipv4Addr;
use std::sync::Arc;

use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::packet::arp;
use crate::packet::arp::ArpPacket;
use crate::packet::dhcp;
use crate::packet::dhcp::DhcpMessage;
use crate::packet::dhcp::DhcpOption;
use crate::packet::dhcp::MessageType;
use crate::packet::ether;
use crate::packet::ether::EtherFrame;
use crate::packet::ipv4;
use crate::packet::ipv4::Ipv4Packet;
use crate::packet::udp;
use crate::packet::udp::UdpDatagram;

use super::ClientInterface;

/// Answers the host kernel's ARP and DHCP traffic on tap devices so the
/// interface comes up against a fictional gateway. Replies go back to the
/// device, never into the tunnel.
pub(crate) struct Responder {
    ifce: Arc<ClientInterface>,
}

impl Responder {
    pub fn new(ifce: Arc<ClientInterface>) -> Self {
        Self { ifce }
    }

    /// Reply to an ARP request with the synthetic gateway MAC, whatever
    /// address is being resolved. Non-requests and malformed packets are
    /// dropped.
    pub fn handle_arp(&self, frame: &[u8]) -> Option<Bytes> {
        let (eth, request) = match EtherFrame::parse(frame)
            .and_then(|eth| ArpPacket::parse(eth.payload()).map(|arp| (eth, arp)))
        {
            Ok(parsed) => parsed,
            Err(err) => {
                log::debug!("dropping malformed ARP: {}", err);
                return None;
            }
        };
        if !request.is_request() {
            return None;
        }

        let gw_hw = self.ifce.gw_hw;
        let reply = ArpPacket {
            hw_type: request.hw_type,
            proto_type: request.proto_type,
            hw_len: request.hw_len,
            proto_len: request.proto_len,
            operation: arp::OP_REPLY,
            // The address being resolved is ours now.
            sender_hw: gw_hw,
            sender_proto: request.target_proto,
            target_hw: request.sender_hw,
            target_proto: request.sender_proto,
        };
        log::debug!(
            "ARP reply: {} is-at {}",
            request.target_proto,
            ether::format_mac(&gw_hw)
        );
        Some(ether::build_frame(
            eth.src(),
            gw_hw,
            ether::ETHERTYPE_ARP,
            &reply.encode(),
        ))
    }

    /// Serve the DISCOVER/REQUEST half of DHCP with the lease from the
    /// server configuration.
    pub fn handle_dhcp(&self, frame: &[u8]) -> Option<Bytes> {
        let parsed = EtherFrame::parse(frame).and_then(|eth| {
            let ip = Ipv4Packet::parse(eth.payload())?;
            let dgram = UdpDatagram::parse(ip.payload())?;
            let msg = DhcpMessage::parse(dgram.payload())?;
            Ok((eth, ip.ttl(), dgram.src_port(), dgram.dst_port(), msg))
        });
        let (eth, ttl, src_port, dst_port, request) = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                log::debug!("dropping malformed DHCP: {}", err);
                return None;
            }
        };

        let reply_type = match request.message_type() {
            Some(MessageType::Discover) => MessageType::Offer,
            Some(MessageType::Request) => MessageType::Ack,
            Some(MessageType::Release) => {
                log::warn!("Got an IP release request. Unexpected.");
                return None;
            }
            other => {
                log::debug!("ignoring DHCP message type {:?}", other);
                return None;
            }
        };
        log::debug!("DHCP {:?} -> {:?}", request.message_type(), reply_type);
        Some(self.build_reply(eth.src(), ttl, src_port, dst_port, &request, reply_type))
    }

    fn build_reply(
        &self,
        client_hw: ether::MacAddr,
        ttl: u8,
        req_src_port: u16,
        req_dst_port: u16,
        request: &DhcpMessage,
        reply_type: MessageType,
    ) -> Bytes {
        let ifce = &self.ifce;
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&client_hw);

        let reply = DhcpMessage {
            op: dhcp::OP_REPLY,
            hw_type: dhcp::HW_TYPE_ETHERNET,
            hw_len: request.hw_len,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: ifce.ip,
            siaddr: ifce.gw_ip,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            options: self.reply_options(reply_type),
        };
        let payload = reply.encode();

        // Ports mirrored back; checksum over the IPv4 pseudo-header.
        let dgram = udp::build(
            req_dst_port,
            req_src_port,
            ifce.gw_ip,
            Ipv4Addr::BROADCAST,
            &payload,
        );
        let header = ipv4::build_header(
            ifce.gw_ip,
            Ipv4Addr::BROADCAST,
            ipv4::PROTO_UDP,
            ttl,
            dgram.len(),
        );

        let mut ip_pkt = BytesMut::with_capacity(header.len() + dgram.len());
        ip_pkt.put_slice(&header);
        ip_pkt.put_slice(&dgram);
        ether::build_frame(
            ether::MAC_BROADCAST,
            ifce.gw_hw,
            ether::ETHERTYPE_IPV4,
            &ip_pkt,
        )
    }

    fn reply_options(&self, reply_type: MessageType) -> Vec<DhcpOption> {
        let ifce = &self.ifce;
        let mut options = Vec::new();
        for dns in &ifce.dns {
            options.push(DhcpOption::new(dhcp::opt::DNS, dns.octets().to_vec()));
        }
        options.push(DhcpOption::new(
            dhcp::opt::SUBNET_MASK,
            ifce.netmask.octets().to_vec(),
        ));
        options.push(DhcpOption::new(
            dhcp::opt::LEASE_TIME,
            ifce.lease_time.to_be_bytes().to_vec(),
        ));
        options.push(DhcpOption::new(
            dhcp::opt::MESSAGE_TYPE,
            vec![reply_type as u8],
        ));
        options.push(DhcpOption::new(
            dhcp::opt::SERVER_ID,
            ifce.gw_ip.octets().to_vec(),
        ));
        options.push(DhcpOption::new(
            dhcp::opt::CLASSLESS_STATIC_ROUTE,
            dhcp::encode_routes(&ifce.route_prefix, ifce.gw_ip),
        ));
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Cidr;
    use std::sync::OnceLock;

    const CLIENT_MAC: ether::MacAddr = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

    fn test_interface() -> Arc<ClientInterface> {
        Arc::new(ClientInterface {
            ip: "10.0.0.2".parse().unwrap(),
            gw_ip: "10.0.0.1".parse().unwrap(),
            netmask: "255.255.255.0".parse().unwrap(),
            dns: vec!["8.8.8.8".parse().unwrap()],
            route_prefix: vec![Cidr::parse("172.16.0.1/32").unwrap()],
            gw_hw: [0x06, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE],
            local_hw: OnceLock::new(),
            lease_time: 300,
        })
    }

    fn arp_request(target: &str) -> Bytes {
        let request = ArpPacket {
            hw_type: arp::HW_TYPE_ETHERNET,
            proto_type: arp::PROTO_TYPE_IPV4,
            hw_len: 6,
            proto_len: 4,
            operation: arp::OP_REQUEST,
            sender_hw: CLIENT_MAC,
            sender_proto: "10.0.0.2".parse().unwrap(),
            target_hw: [0; 6],
            target_proto: target.parse().unwrap(),
        };
        ether::build_frame(
            ether::MAC_BROADCAST,
            CLIENT_MAC,
            ether::ETHERTYPE_ARP,
            &request.encode(),
        )
    }

    fn dhcp_request(kind: MessageType, xid: u32) -> Bytes {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&CLIENT_MAC);
        let msg = DhcpMessage {
            op: dhcp::OP_REQUEST,
            hw_type: dhcp::HW_TYPE_ETHERNET,
            hw_len: 6,
            hops: 0,
            xid,
            secs: 0,
            flags: 0x8000,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            options: vec![DhcpOption::new(dhcp::opt::MESSAGE_TYPE, vec![kind as u8])],
        };
        let payload = msg.encode();
        let dgram = udp::build(
            dhcp::PORT_CLIENT,
            dhcp::PORT_SERVER,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::BROADCAST,
            &payload,
        );
        let header = ipv4::build_header(
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::BROADCAST,
            ipv4::PROTO_UDP,
            64,
            dgram.len(),
        );
        let mut ip_pkt = header.to_vec();
        ip_pkt.extend_from_slice(&dgram);
        ether::build_frame(
            ether::MAC_BROADCAST,
            CLIENT_MAC,
            ether::ETHERTYPE_IPV4,
            &ip_pkt,
        )
    }

    #[test]
    fn arp_reply_claims_every_address() {
        let responder = Responder::new(test_interface());
        let reply = responder.handle_arp(&arp_request("10.0.0.5")).unwrap();

        let eth = EtherFrame::parse(&reply).unwrap();
        assert_eq!(eth.dst(), CLIENT_MAC);
        assert_eq!(eth.src(), [0x06, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE]);
        assert_eq!(eth.ethertype(), ether::ETHERTYPE_ARP);

        let arp_reply = ArpPacket::parse(eth.payload()).unwrap();
        assert_eq!(arp_reply.operation, arp::OP_REPLY);
        assert_eq!(arp_reply.sender_hw, [0x06, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE]);
        assert_eq!(arp_reply.sender_proto, "10.0.0.5".parse::<Ipv4Addr>().unwrap());
        assert_eq!(arp_reply.target_hw, CLIENT_MAC);
        assert_eq!(arp_reply.target_proto, "10.0.0.2".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn arp_ignores_replies_and_garbage() {
        let responder = Responder::new(test_interface());

        let mut reply_frame = arp_request("10.0.0.5").to_vec();
        // Flip the operation to reply.
        reply_frame[ether::HEADER_LEN + 7] = 2;
        assert!(responder.handle_arp(&reply_frame).is_none());
        assert!(responder.handle_arp(&[0u8; 10]).is_none());
    }

    #[test]
    fn dhcp_discover_yields_offer_bytes() {
        let responder = Responder::new(test_interface());
        let reply = responder
            .handle_dhcp(&dhcp_request(MessageType::Discover, 0xAABB_CCDD))
            .unwrap();

        let eth = EtherFrame::parse(&reply).unwrap();
        assert_eq!(eth.dst(), ether::MAC_BROADCAST);
        assert_eq!(eth.src(), [0x06, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE]);

        let ip = Ipv4Packet::parse(eth.payload()).unwrap();
        assert_eq!(ip.src(), "10.0.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(ip.dst(), Ipv4Addr::BROADCAST);
        assert_eq!(ip.protocol(), ipv4::PROTO_UDP);
        assert_eq!(ipv4::checksum(&eth.payload()[..20]), 0);

        let dgram = UdpDatagram::parse(ip.payload()).unwrap();
        assert_eq!(dgram.src_port(), dhcp::PORT_SERVER);
        assert_eq!(dgram.dst_port(), dhcp::PORT_CLIENT);

        let offer = DhcpMessage::parse(dgram.payload()).unwrap();
        assert_eq!(offer.op, dhcp::OP_REPLY);
        assert_eq!(offer.xid, 0xAABB_CCDD);
        assert_eq!(offer.yiaddr, "10.0.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(offer.siaddr, "10.0.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(offer.client_hw(), &CLIENT_MAC);
        assert_eq!(offer.message_type(), Some(MessageType::Offer));
        assert_eq!(
            offer.find_option(dhcp::opt::LEASE_TIME),
            Some(&[0x00, 0x00, 0x01, 0x2C][..])
        );
        assert_eq!(
            offer.find_option(dhcp::opt::CLASSLESS_STATIC_ROUTE),
            Some(&[0x20, 0xAC, 0x10, 0x00, 0x01, 0x0A, 0x00, 0x00, 0x01][..])
        );
    }

    #[test]
    fn dhcp_ack_carries_options_in_order() {
        let responder = Responder::new(test_interface());
        let reply = responder
            .handle_dhcp(&dhcp_request(MessageType::Request, 0x01020304))
            .unwrap();

        let eth = EtherFrame::parse(&reply).unwrap();
        let ip = Ipv4Packet::parse(eth.payload()).unwrap();
        let dgram = UdpDatagram::parse(ip.payload()).unwrap();
        let ack = DhcpMessage::parse(dgram.payload()).unwrap();

        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(
            ack.find_option(dhcp::opt::SUBNET_MASK),
            Some(&[255, 255, 255, 0][..])
        );
        assert_eq!(
            ack.find_option(dhcp::opt::SERVER_ID),
            Some(&[10, 0, 0, 1][..])
        );
        let codes: Vec<u8> = ack.options.iter().map(|o| o.code).collect();
        assert_eq!(
            codes,
            vec![
                dhcp::opt::DNS,
                dhcp::opt::SUBNET_MASK,
                dhcp::opt::LEASE_TIME,
                dhcp::opt::MESSAGE_TYPE,
                dhcp::opt::SERVER_ID,
                dhcp::opt::CLASSLESS_STATIC_ROUTE,
            ]
        );
        assert_eq!(ack.find_option(dhcp::opt::DNS), Some(&[8, 8, 8, 8][..]));
    }

    #[test]
    fn dhcp_release_is_dropped() {
        let responder = Responder::new(test_interface());
        assert!(responder
            .handle_dhcp(&dhcp_request(MessageType::Release, 1))
            .is_none());
    }
}
