use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::device;
use crate::device::Device;
use crate::ipam::Ipam;
use crate::packet::ipv4;

use super::PacketSender;
use super::ServerContext;

/// Read IPv4 datagrams from the tunnel device and hand each to the
/// WebSocket of the lease owning its destination address.
pub(super) fn spawn_tunnel_reader(
    device: Arc<dyn Device>,
    ctx: Arc<ServerContext>,
    errors: mpsc::UnboundedSender<anyhow::Error>,
) -> JoinHandle<()> {
    let mut packets = device::spawn_reader(device, errors);
    tokio::spawn(async move {
        while let Some(pkt) = packets.recv().await {
            dispatch_packet(&ctx.ipam, pkt).await;
        }
    })
}

pub(super) async fn dispatch_packet(ipam: &Ipam<PacketSender>, pkt: Bytes) {
    log::debug!("Server <- Tunnel: {}", ipv4::summary(&pkt));
    let Some(dst) = ipv4::dst_addr(&pkt) else {
        log::debug!("dropping non-IPv4 packet from tunnel device");
        return;
    };
    let carrier = match ipam.get_carrier(dst).await {
        Ok(carrier) => carrier,
        Err(_) => {
            log::warn!("unsolicited packet for IP {}", dst);
            return;
        }
    };
    // A slow or dead client loses packets, never the whole server.
    if let Err(err) = carrier.try_send(Message::Binary(pkt)) {
        log::warn!("error delivering packet for {}: {}", dst, err);
    }
}
