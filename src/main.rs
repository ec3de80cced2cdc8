use std::path;

use clap::Parser;

mod client;
mod device;
mod ipam;
mod net;
mod packet;
mod server;
mod settings;
mod wire;

use crate::settings::Settings;

#[derive(Parser, Debug)]
#[command(version, about = "IP-over-WebSocket layer-3 tunnel")]
struct Cli {
    /// Path to the TOML settings file.
    #[arg(short, long, default_value = "webtun.toml")]
    config: path::PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Either side may build a rustls config (wss listener, insecure
    // dialer); the process-wide provider has to be in place first.
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::format_err!("a rustls crypto provider was already installed"))?;

    let cli = Cli::parse();
    Settings::load(cli.config)?;

    let settings = Settings::get();
    match (&settings.server, &settings.client) {
        (Some(server), None) => run_server(server).await,
        (None, Some(client)) => run_client(client).await,
        (Some(_), Some(_)) => {
            anyhow::bail!("Configure either [server] or [client], not both")
        }
        (None, None) => {
            anyhow::bail!("No [server] or [client] section configured. Is config file missing?")
        }
    }
}

#[cfg(target_os = "linux")]
async fn run_server(settings: &settings::ServerSettings) -> anyhow::Result<()> {
    let device = device::open(device::DeviceType::Tun, settings.device_name.as_deref())?;
    init_tunnel(device.name(), settings.gateway_ip, settings.netmask)?;

    let mut server = server::WebTunnelServer::new(settings, device).await?;
    let mut errors = server.take_errors();
    let _ = server.start().await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!(
                "Shutting down webtun server ({} identified clients)",
                server.active_clients().await.len()
            );
            Ok(())
        }
        err = errors.recv() => match err {
            Some(err) => Err(err),
            None => Ok(()),
        },
    }
}

#[cfg(target_os = "linux")]
async fn run_client(settings: &settings::ClientSettings) -> anyhow::Result<()> {
    let dev_type = device::DeviceType::parse(&settings.device_type)?;
    let device = device::open(dev_type, settings.device_name.as_deref())?;
    let os = std::sync::Arc::new(client::LinuxConfigurator);

    let mut client = client::WebTunnelClient::start(settings, device, os).await?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down webtun client");
        }
        err = client.error() => {
            if let Some(err) = err {
                return Err(err);
            }
        }
    }
    client.stop().await
}

/// Assign the gateway address to the server's tunnel interface and bring
/// the link up.
#[cfg(target_os = "linux")]
fn init_tunnel(
    name: &str,
    gateway_ip: std::net::Ipv4Addr,
    netmask: std::net::Ipv4Addr,
) -> anyhow::Result<()> {
    use std::process::Command;

    let addr = format!("{}/{}", gateway_ip, net::netmask_prefix_len(netmask));
    let status = Command::new("ip")
        .args(["addr", "add", &addr, "dev", name])
        .status()?;
    anyhow::ensure!(status.success(), "ip addr add {} failed: {}", addr, status);
    let status = Command::new("ip").args(["link", "set", name, "up"]).status()?;
    anyhow::ensure!(status.success(), "ip link set {} up failed: {}", name, status);
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run_server(_settings: &settings::ServerSettings) -> anyhow::Result<()> {
    anyhow::bail!("server mode requires a Linux tun device")
}

#[cfg(not(target_os = "linux"))]
async fn run_client(_settings: &settings::ClientSettings) -> anyhow::Result<()> {
    anyhow::bail!("client mode requires a Linux tun/tap device")
}
