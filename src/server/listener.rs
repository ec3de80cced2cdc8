use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use super::session::ServerSession;
use super::ServerContext;

/// Accept connections for the lifetime of the process; each one gets its
/// own session task.
pub(super) fn spawn_accept_loop(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    tls: Option<TlsAcceptor>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok((stream, peer)) = listener.accept().await {
            ServerSession::new(ctx.clone(), tls.clone(), peer).run(stream);
        }
    })
}
