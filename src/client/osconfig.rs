use std::net::Ipv4Addr;
use std::time::Duration;

use crate::net::Cidr;
use crate::packet::ether::MacAddr;

/// Snapshot of the negotiated interface configuration handed to the OS
/// layer.
pub struct InterfaceView<'a> {
    pub device_name: &'a str,
    pub is_tap: bool,
    pub ip: Ipv4Addr,
    pub gw_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub dns: &'a [Ipv4Addr],
    pub routes: &'a [Cidr],
}

/// Capability interface for everything OS-specific about the virtual
/// interface. The tunnel core never touches an OS primitive directly.
pub trait OsConfigurator: Send + Sync {
    /// Bring the link up and program addresses/routes. On tap devices the
    /// platform DHCP client does the addressing; the implementation only
    /// needs the link up. Any error is fatal to the client.
    fn configure(&self, ifce: &InterfaceView<'_>) -> anyhow::Result<()>;

    /// Whether the interface exists and carries the expected address yet.
    fn is_ready(&self, device_name: &str, ip: Ipv4Addr) -> bool;

    /// MAC of the host-side interface, available once it is up.
    fn local_mac(&self, device_name: &str) -> Option<MacAddr>;
}

pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Poll until the OS has finished configuring the interface. Writing to
/// the device before that fails.
pub async fn wait_ready(
    os: &dyn OsConfigurator,
    device_name: &str,
    ip: Ipv4Addr,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
    while !os.is_ready(device_name, ip) {
        if let Some(deadline) = deadline {
            anyhow::ensure!(
                tokio::time::Instant::now() < deadline,
                "interface {} did not become ready in time",
                device_name
            );
        }
        log::debug!("Waiting for interface {} to be ready...", device_name);
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
pub use linux::LinuxConfigurator;

#[cfg(target_os = "linux")]
mod linux {
    use std::net::Ipv4Addr;
    use std::process::Command;

    use crate::net;
    use crate::packet::ether::MacAddr;

    use super::InterfaceView;
    use super::OsConfigurator;

    /// Configures the interface with ip(8).
    pub struct LinuxConfigurator;

    fn run(program: &str, args: &[&str]) -> anyhow::Result<()> {
        let status = Command::new(program).args(args).status()?;
        anyhow::ensure!(status.success(), "{} {:?} failed: {}", program, args, status);
        Ok(())
    }

    impl OsConfigurator for LinuxConfigurator {
        fn configure(&self, ifce: &InterfaceView<'_>) -> anyhow::Result<()> {
            if !ifce.is_tap {
                let addr = format!("{}/{}", ifce.ip, net::netmask_prefix_len(ifce.netmask));
                run("ip", &["addr", "add", &addr, "dev", ifce.device_name])?;
            }
            run("ip", &["link", "set", ifce.device_name, "up"])?;
            if !ifce.is_tap {
                let gw = ifce.gw_ip.to_string();
                for route in ifce.routes {
                    run("ip", &["route", "add", &route.to_string(), "via", &gw])?;
                }
            }
            Ok(())
        }

        fn is_ready(&self, device_name: &str, ip: Ipv4Addr) -> bool {
            let output = match Command::new("ip")
                .args(["-4", "-o", "addr", "show", "dev", device_name])
                .output()
            {
                Ok(output) => output,
                Err(_) => return false,
            };
            let text = String::from_utf8_lossy(&output.stdout);
            text.contains(&format!("inet {}", ip))
        }

        fn local_mac(&self, device_name: &str) -> Option<MacAddr> {
            let raw = std::fs::read_to_string(format!("/sys/class/net/{}/address", device_name)).ok()?;
            let mut mac = [0u8; 6];
            let mut parts = raw.trim().split(':');
            for byte in mac.iter_mut() {
                *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
            }
            Some(mac)
        }
    }
}
