mod osconfig;
mod pump;
mod responder;

pub use osconfig::InterfaceView;
pub use osconfig::OsConfigurator;
#[cfg(target_os = "linux")]
pub use osconfig::LinuxConfigurator;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use futures::stream::SplitSink;
use futures::stream::SplitStream;
use futures::SinkExt;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::Connector;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;

use crate::device;
use crate::device::Device;
use crate::net::Cidr;
use crate::packet::ether;
use crate::packet::ether::MacAddr;
use crate::settings::ClientSettings;
use crate::wire;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsSink = SplitSink<WsStream, Message>;
pub(crate) type WsSource = SplitStream<WsStream>;

/// The negotiated interface: lease plus the synthetic gateway identity the
/// responder answers with.
pub struct ClientInterface {
    pub ip: Ipv4Addr,
    pub gw_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub dns: Vec<Ipv4Addr>,
    pub route_prefix: Vec<Cidr>,
    /// Fictional gateway MAC, generated once per process.
    pub gw_hw: MacAddr,
    /// Host-side MAC; empty until the OS has configured the device.
    pub local_hw: OnceLock<MacAddr>,
    pub lease_time: u32,
}

#[derive(Debug)]
pub struct WebTunnelClient {
    errors: mpsc::UnboundedReceiver<anyhow::Error>,
    stop: watch::Sender<bool>,
    egress: JoinHandle<()>,
}

impl WebTunnelClient {
    /// Dial the server, fetch the lease, hand it to the OS layer and start
    /// both pump tasks.
    pub async fn start(
        settings: &ClientSettings,
        device: Arc<dyn Device>,
        os: Arc<dyn OsConfigurator>,
    ) -> anyhow::Result<Self> {
        let mut ws = dial(settings).await?;

        ws.send(Message::Text("getConfig".into()))
            .await
            .context("error requesting configuration")?;
        let cfg = read_config(&mut ws).await?;
        log::info!(
            "Retrieved config from server: ip={} gw={} routes={:?}",
            cfg.ip,
            cfg.gw_ip,
            cfg.route_prefix
        );
        let ifce = Arc::new(build_interface(&cfg, settings.lease_time)?);

        // OS-level bring-up: link up, addressing (tun) or DHCP (tap),
        // routes. Any failure here is fatal.
        os.configure(&InterfaceView {
            device_name: device.name(),
            is_tap: device.is_tap(),
            ip: ifce.ip,
            gw_ip: ifce.gw_ip,
            netmask: ifce.netmask,
            dns: &ifce.dns,
            routes: &ifce.route_prefix,
        })
        .context("OS interface configuration failed")?;

        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let device_tx = device::spawn_writer(device.clone(), errors_tx.clone());
        let (sink, source) = ws.split();

        let egress = pump::spawn_egress(
            device.clone(),
            ifce.clone(),
            sink,
            device_tx.clone(),
            errors_tx.clone(),
            stop_rx,
        );
        pump::spawn_ingress(
            device,
            ifce,
            os,
            source,
            device_tx,
            errors_tx,
            settings.ready_timeout.map(Duration::from_secs),
        );

        Ok(Self {
            errors: errors_rx,
            stop: stop_tx,
            egress,
        })
    }

    /// Next unrecoverable error from the pump tasks, if any.
    pub async fn error(&mut self) -> Option<anyhow::Error> {
        self.errors.recv().await
    }

    /// Close the tunnel with a normal WebSocket closure and give the
    /// server a moment to observe it.
    pub async fn stop(self) -> anyhow::Result<()> {
        let _ = self.stop.send(true);
        let _ = self.egress.await;
        Ok(())
    }
}

async fn dial(settings: &ClientSettings) -> anyhow::Result<WsStream> {
    let scheme = if settings.tls { "wss" } else { "ws" };
    let url = format!("{}://{}/ws", scheme, settings.server_address);
    log::info!("Connecting to {}", url);

    let (ws, _) = if settings.tls && settings.insecure {
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();
        tokio_tungstenite::connect_async_tls_with_config(
            url,
            None,
            false,
            Some(Connector::Rustls(Arc::new(config))),
        )
        .await
        .context("websocket dial failed")?
    } else {
        tokio_tungstenite::connect_async(url)
            .await
            .context("websocket dial failed")?
    };
    Ok(ws)
}

async fn read_config(ws: &mut WsStream) -> anyhow::Result<wire::ClientConfig> {
    while let Some(msg) = ws.next().await {
        match msg.context("error reading configuration")? {
            Message::Text(raw) => {
                return serde_json::from_str(raw.as_str())
                    .context("malformed configuration from server");
            }
            Message::Ping(_) | Message::Pong(_) => {}
            other => log::debug!("ignoring frame while waiting for config: {:?}", other),
        }
    }
    anyhow::bail!("websocket closed before configuration was received")
}

fn build_interface(cfg: &wire::ClientConfig, lease_time: u32) -> anyhow::Result<ClientInterface> {
    let ip: Ipv4Addr = cfg.ip.parse().context("bad Ip in configuration")?;
    let gw_ip: Ipv4Addr = cfg.gw_ip.parse().context("bad GWIp in configuration")?;
    let netmask: Ipv4Addr = if cfg.netmask.is_empty() {
        // Older servers do not send a netmask.
        Ipv4Addr::new(255, 255, 255, 0)
    } else {
        cfg.netmask.parse().context("bad Netmask in configuration")?
    };
    let dns = cfg
        .dns
        .iter()
        .map(|d| d.parse().context("bad DNS entry in configuration"))
        .collect::<anyhow::Result<Vec<Ipv4Addr>>>()?;
    let route_prefix = cfg
        .route_prefix
        .iter()
        .map(|p| Cidr::parse(p))
        .collect::<anyhow::Result<Vec<Cidr>>>()?;

    Ok(ClientInterface {
        ip,
        gw_ip,
        netmask,
        dns,
        route_prefix,
        gw_hw: ether::random_private_mac(),
        local_hw: OnceLock::new(),
        lease_time,
    })
}

#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
