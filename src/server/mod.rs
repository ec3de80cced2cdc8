mod listener;
mod session;
mod tunnel;

use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;

use crate::device;
use crate::device::Device;
use crate::ipam::Ipam;
use crate::net::Cidr;
use crate::settings::ServerSettings;

/// Carrier handle stored per lease: the bounded channel feeding a client's
/// WebSocket writer task.
pub(crate) type PacketSender = mpsc::Sender<Message>;

/// State shared by the accept loop, the per-client sessions and the tunnel
/// reader.
pub(crate) struct ServerContext {
    pub gateway_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub dns: Vec<Ipv4Addr>,
    pub route_prefix: Vec<String>,
    pub ipam: Ipam<PacketSender>,
    /// All writes to the tunnel device funnel through this channel.
    pub device_tx: mpsc::Sender<Bytes>,
}

pub struct WebTunnelServer {
    ctx: Arc<ServerContext>,
    device: Arc<dyn Device>,
    bind_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    errors_tx: mpsc::UnboundedSender<anyhow::Error>,
    errors_rx: Option<mpsc::UnboundedReceiver<anyhow::Error>>,
}

impl WebTunnelServer {
    pub async fn new(settings: &ServerSettings, device: Arc<dyn Device>) -> anyhow::Result<Self> {
        for prefix in &settings.route_prefix {
            Cidr::parse(prefix).context("route_prefix")?;
        }

        let ipam = Ipam::new(&settings.client_prefix)?;
        ipam.acquire_specific(settings.gateway_ip, None)
            .await
            .context("reserving gateway IP")?;

        let tls = if settings.tls_enabled() {
            let identity = settings.tls_identity()?;
            let config = rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(identity.chain, identity.key)?;
            Some(TlsAcceptor::from(Arc::new(config)))
        } else {
            None
        };

        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let device_tx = device::spawn_writer(device.clone(), errors_tx.clone());

        Ok(Self {
            ctx: Arc::new(ServerContext {
                gateway_ip: settings.gateway_ip,
                netmask: settings.netmask,
                dns: settings.dns.clone(),
                route_prefix: settings.route_prefix.clone(),
                ipam,
                device_tx,
            }),
            device,
            bind_addr: settings.bind_address,
            tls,
            errors_tx,
            errors_rx: Some(errors_rx),
        })
    }

    /// Channel carrying unrecoverable errors from background tasks. The
    /// supervisor decides whether to exit or keep serving.
    pub fn take_errors(&mut self) -> mpsc::UnboundedReceiver<anyhow::Error> {
        self.errors_rx.take().expect("error channel already taken")
    }

    /// Snapshot of leases with a recorded identity.
    pub async fn active_clients(&self) -> std::collections::HashMap<Ipv4Addr, crate::ipam::Identity> {
        self.ctx.ipam.dump_active().await
    }

    pub async fn start(&self) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("WebSocket server started (bind addr {})", local_addr);

        tunnel::spawn_tunnel_reader(self.device.clone(), self.ctx.clone(), self.errors_tx.clone());
        let join = listener::spawn_accept_loop(listener, self.ctx.clone(), self.tls.clone());
        Ok((local_addr, join))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::mock_device;
    use crate::packet::ipv4;
    use futures::SinkExt;
    use futures::StreamExt;
    use std::time::Duration;

    fn test_settings(bind: SocketAddr) -> ServerSettings {
        ServerSettings {
            bind_address: bind,
            gateway_ip: "10.0.0.1".parse().unwrap(),
            netmask: "255.255.255.0".parse().unwrap(),
            client_prefix: "10.0.0.0/24".to_string(),
            route_prefix: vec!["172.16.0.1/32".to_string(), "172.16.0.2/32".to_string()],
            dns: vec!["8.8.8.8".parse().unwrap()],
            device_name: None,
            tls_cert: None,
            tls_key: None,
            tls_self: None,
        }
    }

    fn ipv4_packet(src: &str, dst: &str, payload: &[u8]) -> Vec<u8> {
        let hdr = ipv4::build_header(
            src.parse().unwrap(),
            dst.parse().unwrap(),
            ipv4::PROTO_UDP,
            64,
            payload.len(),
        );
        let mut pkt = hdr.to_vec();
        pkt.extend_from_slice(payload);
        pkt
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn end_to_end_session() {
        let (device, inject, written) = mock_device(false);
        let server = WebTunnelServer::new(
            &test_settings("127.0.0.1:0".parse().unwrap()),
            device.clone(),
        )
        .await
        .unwrap();
        let (addr, _join) = server.start().await.unwrap();

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();

        // Configuration bootstrap: first lease after the reserved gateway.
        ws.send(Message::Text("getConfig".into())).await.unwrap();
        let reply = ws.next().await.unwrap().unwrap();
        let Message::Text(raw) = reply else {
            panic!("expected text config reply, got {:?}", reply)
        };
        let cfg: crate::wire::ClientConfig = serde_json::from_str(raw.as_str()).unwrap();
        assert_eq!(cfg.ip, "10.0.0.2");
        assert_eq!(cfg.gw_ip, "10.0.0.1");
        assert_eq!(cfg.netmask, "255.255.255.0");
        assert_eq!(cfg.dns, vec!["8.8.8.8".to_string()]);
        assert_eq!(
            cfg.route_prefix,
            vec!["172.16.0.1/32".to_string(), "172.16.0.2/32".to_string()]
        );

        // Oversized frames are discarded; frames within the MTU land on
        // the tunnel device verbatim.
        ws.send(Message::Binary(vec![0u8; 2000].into())).await.unwrap();
        let upstream = ipv4_packet("10.0.0.2", "192.168.1.1", b"up");
        ws.send(Message::Binary(upstream.clone().into()))
            .await
            .unwrap();
        let got = tokio::task::spawn_blocking(move || {
            written.recv_timeout(Duration::from_secs(5)).unwrap()
        })
        .await
        .unwrap();
        assert_eq!(got, upstream);

        // Downstream: a tunnel packet for the leased address arrives as a
        // binary frame; one for an unleased address is dropped.
        inject
            .send(ipv4_packet("192.168.1.1", "10.0.0.9", b"lost"))
            .unwrap();
        let downstream = ipv4_packet("192.168.1.1", "10.0.0.2", b"down");
        inject.send(downstream.clone()).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got, Message::Binary(downstream.into()));

        // Normal closure releases the lease for the next client.
        ws.close(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        let (mut ws2, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();
        ws2.send(Message::Text("getConfig".into())).await.unwrap();
        let Message::Text(raw) = ws2.next().await.unwrap().unwrap() else {
            panic!("expected text config reply")
        };
        let cfg: crate::wire::ClientConfig = serde_json::from_str(raw.as_str()).unwrap();
        assert_eq!(cfg.ip, "10.0.0.2", "released lease is handed out again");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejects_unknown_upgrade_path() {
        let (device, _inject, _written) = mock_device(false);
        let server = WebTunnelServer::new(
            &test_settings("127.0.0.1:0".parse().unwrap()),
            device.clone(),
        )
        .await
        .unwrap();
        let (addr, _join) = server.start().await.unwrap();

        let err = tokio_tungstenite::connect_async(format!("ws://{}/other", addr)).await;
        assert!(err.is_err());
    }
}
