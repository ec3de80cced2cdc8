use anyhow::Context;
use config::Config;
use rustls::pki_types::CertificateDer;
use rustls::pki_types::PrivateKeyDer;
use rustls::pki_types::PrivatePkcs8KeyDer;
use serde::Deserialize;
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::path;
use std::sync::Arc;
use std::sync::OnceLock;

pub static SETTINGS: OnceLock<Arc<Settings>> = OnceLock::new();

fn default_lease_time() -> u32 {
    300
}

fn default_device_type() -> String {
    "tun".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct ServerSettings {
    pub bind_address: SocketAddr,
    /// Tunnel IP of the gateway; reserved out of the client pool.
    pub gateway_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// CIDR the client leases are drawn from.
    pub client_prefix: String,
    /// Additional destinations clients should route through the tunnel.
    #[serde(default)]
    pub route_prefix: Vec<String>,
    #[serde(default)]
    pub dns: Vec<Ipv4Addr>,
    pub device_name: Option<String>,
    pub tls_cert: Option<path::PathBuf>,
    pub tls_key: Option<path::PathBuf>,
    pub tls_self: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ClientSettings {
    /// host:port of the tunnel server.
    pub server_address: String,
    #[serde(default = "default_device_type")]
    pub device_type: String,
    pub device_name: Option<String>,
    #[serde(default = "default_true")]
    pub tls: bool,
    /// Skip TLS certificate verification.
    #[serde(default)]
    pub insecure: bool,
    /// Seconds, echoed in DHCP replies on tap devices.
    #[serde(default = "default_lease_time")]
    pub lease_time: u32,
    /// Upper bound in seconds for the interface readiness poll.
    pub ready_timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server: Option<ServerSettings>,
    pub client: Option<ClientSettings>,
}

impl Settings {
    pub fn load(path: path::PathBuf) -> anyhow::Result<()> {
        let settings = Config::builder()
            .add_source(config::File::from(path))
            .build()?;
        let settings: Settings = settings.try_deserialize()?;
        SETTINGS.get_or_init(|| Arc::new(settings));
        Ok(())
    }

    pub fn get() -> Arc<Settings> {
        match SETTINGS.get() {
            Some(settings) => settings.clone(),
            None => panic!("settings accessed before load"),
        }
    }
}

/// Certificate chain and private key the listener presents.
#[derive(Debug)]
pub struct TlsIdentity {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl ServerSettings {
    /// Whether the listener terminates TLS (wss) or serves plain ws.
    pub fn tls_enabled(&self) -> bool {
        self.tls_self.is_some_and(|b| b) || self.tls_cert.is_some() || self.tls_key.is_some()
    }

    /// The listener's TLS identity: PEM files from disk, or a throwaway
    /// self-signed certificate when `tls_self` is set.
    pub fn tls_identity(&self) -> anyhow::Result<TlsIdentity> {
        if self.tls_self.is_some_and(|b| b) {
            return self_signed_identity();
        }
        let (cert_path, key_path) = match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => (cert, key),
            _ => anyhow::bail!("TLS needs both tls_cert and tls_key (or tls_self = true)"),
        };

        let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem_reader(cert_path)?)
            .collect::<Result<_, _>>()
            .with_context(|| format!("reading certificate chain {}", cert_path.display()))?;
        anyhow::ensure!(!chain.is_empty(), "no certificates in {}", cert_path.display());

        let key = rustls_pemfile::private_key(&mut pem_reader(key_path)?)
            .with_context(|| format!("reading private key {}", key_path.display()))?
            .ok_or_else(|| anyhow::format_err!("no private key in {}", key_path.display()))?;

        Ok(TlsIdentity { chain, key })
    }
}

fn pem_reader(path: &path::Path) -> anyhow::Result<io::BufReader<fs::File>> {
    let file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(io::BufReader::new(file))
}

fn self_signed_identity() -> anyhow::Result<TlsIdentity> {
    log::info!("using a generated self-signed certificate");
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .context("generating self-signed certificate")?;
    let key = PrivatePkcs8KeyDer::from(generated.signing_key.serialize_der());
    Ok(TlsIdentity {
        chain: vec![generated.cert.into()],
        key: key.into(),
    })
}
