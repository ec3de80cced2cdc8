use std::net::SocketAddr;
use std::sync::Arc;

use futures::SinkExt;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::ErrorResponse;
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::handshake::server::Response;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::device;
use crate::wire::ClientConfig;

use super::ServerContext;

/// One WebSocket client: leases an address on upgrade, serves the
/// configuration request, copies binary frames to the tunnel device and
/// releases the lease when the connection ends.
pub(super) struct ServerSession {
    ctx: Arc<ServerContext>,
    tls: Option<TlsAcceptor>,
    peer: SocketAddr,
}

impl ServerSession {
    pub fn new(ctx: Arc<ServerContext>, tls: Option<TlsAcceptor>, peer: SocketAddr) -> Self {
        Self { ctx, tls, peer }
    }

    pub fn run(self, stream: TcpStream) {
        tokio::spawn(async move {
            if let Err(err) = self.run_inner(stream).await {
                log::error!("WebSocket error: {}", err);
            }
        });
    }

    async fn run_inner(mut self, stream: TcpStream) -> anyhow::Result<()> {
        // Do TLS handshake if needed
        if self.tls.is_some() {
            let tls = self.tls.take().unwrap();
            let stream = tls.accept(stream).await?;
            self.accept_ws(stream).await
        } else {
            self.accept_ws(stream).await
        }
    }

    async fn accept_ws<S>(&self, stream: S) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // Only the tunnel endpoint upgrades; anything else is not found.
        let check_path = |req: &Request, resp: Response| {
            if req.uri().path() == "/ws" {
                Ok(resp)
            } else {
                let mut not_found = ErrorResponse::new(None);
                *not_found.status_mut() = tungstenite::http::StatusCode::NOT_FOUND;
                Err(not_found)
            }
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, check_path).await?;
        self.serve(ws).await
    }

    async fn serve<S>(&self, ws: WebSocketStream<S>) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();

        let (carrier_tx, mut carrier_rx) = mpsc::channel::<Message>(device::CHANNEL_DEPTH);
        let ip = match self.ctx.ipam.acquire(carrier_tx.clone()).await {
            Ok(ip) => ip,
            Err(err) => {
                log::error!("Error acquiring IP: {}", err);
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }
        };
        log::info!(
            "New connection from {} leased {} ({} allocated, capacity {})",
            self.peer,
            ip,
            self.ctx.ipam.allocated_count().await,
            self.ctx.ipam.capacity()
        );

        // Single writer for the sink: config replies and tunnel packets
        // both travel through the carrier channel.
        let writer = tokio::spawn(async move {
            while let Some(msg) = carrier_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        while let Some(msg) = stream.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                    break;
                }
                Err(err) => {
                    log::warn!("error reading from websocket for {}: {}", ip, err);
                    break;
                }
            };
            match msg {
                Message::Text(raw) => {
                    if raw.as_str() == "getConfig" {
                        if self.send_config(ip, &carrier_tx).await.is_err() {
                            break;
                        }
                    } else {
                        log::debug!("ignoring text frame from {}: {:?}", ip, raw);
                    }
                }
                Message::Binary(pkt) => {
                    if pkt.len() > device::MTU {
                        log::warn!("discarding oversized frame from {} ({} bytes)", ip, pkt.len());
                        continue;
                    }
                    log::debug!("Server <- WebSocket: {}", crate::packet::ipv4::summary(&pkt));
                    if self.ctx.device_tx.send(pkt).await.is_err() {
                        // Device writer is gone; its error is already on
                        // the server error channel.
                        break;
                    }
                }
                Message::Ping(data) => {
                    if carrier_tx.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => {
                    log::info!("connection closed for {}", ip);
                    break;
                }
                _ => {}
            }
        }

        if let Ok(Some(identity)) = self.ctx.ipam.identity(ip).await {
            log::info!(
                "disconnecting {} ({}@{})",
                ip,
                identity.username,
                identity.hostname
            );
        }
        if let Err(err) = self.ctx.ipam.release(ip).await {
            log::warn!("releasing {}: {}", ip, err);
        }
        drop(carrier_tx);
        let _ = writer.await;
        Ok(())
    }

    async fn send_config(
        &self,
        ip: std::net::Ipv4Addr,
        carrier_tx: &mpsc::Sender<Message>,
    ) -> anyhow::Result<()> {
        let cfg = ClientConfig {
            ip: ip.to_string(),
            gw_ip: self.ctx.gateway_ip.to_string(),
            netmask: self.ctx.netmask.to_string(),
            dns: self.ctx.dns.iter().map(|d| d.to_string()).collect(),
            route_prefix: self.ctx.route_prefix.clone(),
        };
        let json = serde_json::to_string(&cfg)?;
        // The client is configured and reachable from here on: make the
        // lease visible to the tunnel reader.
        self.ctx.ipam.activate(ip).await?;
        carrier_tx.send(Message::Text(json.into())).await?;
        Ok(())
    }
}
