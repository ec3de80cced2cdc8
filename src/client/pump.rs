use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::Message;

use crate::device;
use crate::device::Device;
use crate::packet::dhcp;
use crate::packet::ether;
use crate::packet::ether::EtherFrame;
use crate::packet::ether::MacAddr;
use crate::packet::ipv4::Ipv4Packet;
use crate::packet::ipv4::PROTO_UDP;
use crate::packet::udp::UdpDatagram;

use super::osconfig;
use super::osconfig::OsConfigurator;
use super::responder::Responder;
use super::ClientInterface;
use super::WsSink;
use super::WsSource;

/// How long to keep the socket open after sending the closing handshake so
/// the server observes an orderly close.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// What to do with a frame read from the tap device.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum EgressAction {
    /// Send this IPv4 payload through the tunnel, Ethernet header stripped.
    Forward(Bytes),
    /// Hand the frame to the ARP responder.
    Arp,
    /// Hand the frame to the DHCP responder.
    Dhcp,
    /// Not tunnel traffic (multicast, broadcast, unknown EtherType).
    Drop,
}

pub(crate) fn classify_tap_frame(frame: &[u8]) -> EgressAction {
    let Ok(eth) = EtherFrame::parse(frame) else {
        return EgressAction::Drop;
    };
    match eth.ethertype() {
        ether::ETHERTYPE_ARP => EgressAction::Arp,
        ether::ETHERTYPE_IPV4 => {
            let Ok(ip) = Ipv4Packet::parse(eth.payload()) else {
                return EgressAction::Drop;
            };
            // DHCP first: DISCOVER/REQUEST go to the broadcast address and
            // must not fall into the non-unicast filter below.
            if ip.protocol() == PROTO_UDP {
                if let Ok(dgram) = UdpDatagram::parse(ip.payload()) {
                    if dgram.dst_port() == dhcp::PORT_SERVER {
                        return EgressAction::Dhcp;
                    }
                }
            }
            let dst = ip.dst();
            if dst.is_multicast() || dst.is_broadcast() {
                // Keeps chatty hosts (Windows especially) off the tunnel.
                EgressAction::Drop
            } else {
                EgressAction::Forward(Bytes::copy_from_slice(eth.payload()))
            }
        }
        _ => EgressAction::Drop,
    }
}

/// Wrap a tunneled IPv4 datagram in the Ethernet header the tap device
/// expects: from the fictional gateway to the host interface.
pub(crate) fn wrap_ingress(pkt: &[u8], gw_hw: MacAddr, local_hw: MacAddr) -> anyhow::Result<Bytes> {
    Ipv4Packet::parse(pkt).context("bad packet from tunnel")?;
    Ok(ether::build_frame(local_hw, gw_hw, ether::ETHERTYPE_IPV4, pkt))
}

fn is_normal_close(err: &tungstenite::Error) -> bool {
    matches!(
        err,
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed
    )
}

/// Device -> WebSocket. On tap devices ARP and DHCP are intercepted and
/// answered locally, multicast is suppressed, and the Ethernet header is
/// stripped from everything that goes into the tunnel.
pub(crate) fn spawn_egress(
    device: Arc<dyn Device>,
    ifce: Arc<ClientInterface>,
    mut sink: WsSink,
    device_tx: mpsc::Sender<Bytes>,
    errors: mpsc::UnboundedSender<anyhow::Error>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut frames = device::spawn_reader(device.clone(), errors.clone());
    let responder = Responder::new(ifce);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    // Orderly shutdown: let the server see a normal close
                    // before the connection goes away.
                    let _ = sink.send(Message::Close(None)).await;
                    tokio::time::sleep(CLOSE_GRACE).await;
                    return;
                }
                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        // Device reader ended; its error is already on the
                        // error channel.
                        return;
                    };
                    let out = if device.is_tap() {
                        match classify_tap_frame(&frame) {
                            EgressAction::Forward(pkt) => Some(pkt),
                            EgressAction::Arp => {
                                if let Some(reply) = responder.handle_arp(&frame) {
                                    if device_tx.send(reply).await.is_err() {
                                        return;
                                    }
                                }
                                None
                            }
                            EgressAction::Dhcp => {
                                if let Some(reply) = responder.handle_dhcp(&frame) {
                                    if device_tx.send(reply).await.is_err() {
                                        return;
                                    }
                                }
                                None
                            }
                            EgressAction::Drop => None,
                        }
                    } else {
                        Some(frame)
                    };
                    if let Some(pkt) = out {
                        log::debug!("Client -> WebSocket: {}", crate::packet::ipv4::summary(&pkt));
                        if let Err(err) = sink.send(Message::Binary(pkt)).await {
                            if !is_normal_close(&err) {
                                let _ = errors.send(
                                    anyhow::Error::new(err).context("error writing to websocket"),
                                );
                            }
                            return;
                        }
                    }
                }
            }
        }
    })
}

/// WebSocket -> device. Holds off until the OS has configured the
/// interface, then wraps tunneled datagrams in Ethernet on tap devices.
pub(crate) fn spawn_ingress(
    device: Arc<dyn Device>,
    ifce: Arc<ClientInterface>,
    os: Arc<dyn OsConfigurator>,
    mut source: WsSource,
    device_tx: mpsc::Sender<Bytes>,
    errors: mpsc::UnboundedSender<anyhow::Error>,
    ready_timeout: Option<Duration>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) =
            osconfig::wait_ready(os.as_ref(), device.name(), ifce.ip, ready_timeout).await
        {
            let _ = errors.send(err);
            return;
        }
        // The MAC is only meaningful once the OS brought the link up.
        let local_hw = match os.local_mac(device.name()) {
            Some(mac) => mac,
            None => {
                let _ = errors.send(anyhow::format_err!(
                    "could not read MAC of interface {}",
                    device.name()
                ));
                return;
            }
        };
        let _ = ifce.local_hw.set(local_hw);
        log::info!("Interface {} ready", device.name());

        while let Some(msg) = source.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(err) if is_normal_close(&err) => return,
                Err(err) => {
                    let _ = errors
                        .send(anyhow::Error::new(err).context("error reading from websocket"));
                    return;
                }
            };
            match msg {
                Message::Binary(pkt) => {
                    if pkt.len() > device::MTU {
                        log::warn!("discarding oversized frame ({} bytes)", pkt.len());
                        continue;
                    }
                    log::debug!("Client <- WebSocket: {}", crate::packet::ipv4::summary(&pkt));
                    let unit = if device.is_tap() {
                        match wrap_ingress(&pkt, ifce.gw_hw, local_hw) {
                            Ok(frame) => frame,
                            Err(err) => {
                                log::warn!("dropping packet from server: {}", err);
                                continue;
                            }
                        }
                    } else {
                        pkt
                    };
                    if device_tx.send(unit).await.is_err() {
                        return;
                    }
                }
                Message::Close(_) => return,
                Message::Ping(_) | Message::Pong(_) => {}
                other => {
                    log::warn!("ignoring non-binary frame from server: {:?}", other);
                }
            }
        }
    })
}
