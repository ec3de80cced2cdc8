use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

/// Largest tunneled payload; larger WebSocket frames are discarded.
pub const MTU: usize = 1500;

/// Read buffer for whole L2/L3 units; comfortably above the 1500-byte MTU.
pub const READ_BUF_LEN: usize = 2048;

/// Depth of the bounded channels bridging the blocking device to the async
/// tasks.
pub const CHANNEL_DEPTH: usize = 64;

/// A kernel virtual network device. Reads and writes move whole units: L3
/// datagrams for TUN, L2 frames for TAP.
///
/// Implementations must support concurrent `recv` and `send` from different
/// threads; concurrent `send` calls are serialized by the writer task below
/// and never issued in parallel.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;
    fn is_tap(&self) -> bool;
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn send(&self, buf: &[u8]) -> io::Result<usize>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceType {
    Tun,
    Tap,
}

impl DeviceType {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "tun" => Ok(Self::Tun),
            "tap" => Ok(Self::Tap),
            other => anyhow::bail!("unknown device type {:?} (expected tun or tap)", other),
        }
    }
}

/// Bridge the blocking device into the async world: a dedicated blocking
/// task reads units into a bounded channel. A read error is fatal to the
/// reader and is surfaced on the error channel.
pub fn spawn_reader(
    device: Arc<dyn Device>,
    errors: mpsc::UnboundedSender<anyhow::Error>,
) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; READ_BUF_LEN];
        loop {
            match device.recv(&mut buf) {
                Ok(n) => {
                    if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        return; // consumer gone, shutting down
                    }
                }
                Err(err) => {
                    let _ = errors
                        .send(anyhow::Error::new(err).context("error reading from tunnel device"));
                    return;
                }
            }
        }
    });
    rx
}

/// Dedicated writer task: all writes to the device funnel through one
/// bounded channel, serializing the competing writers. A write error is
/// fatal to the writer and is surfaced on the error channel.
pub fn spawn_writer(
    device: Arc<dyn Device>,
    errors: mpsc::UnboundedSender<anyhow::Error>,
) -> mpsc::Sender<Bytes> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
    tokio::task::spawn_blocking(move || {
        while let Some(pkt) = rx.blocking_recv() {
            if let Err(err) = device.send(&pkt) {
                let _ = errors
                    .send(anyhow::Error::new(err).context("error writing to tunnel device"));
                return;
            }
        }
    });
    tx
}

#[cfg(target_os = "linux")]
pub use linux::open;

#[cfg(target_os = "linux")]
mod linux {
    use std::os::fd::AsRawFd;
    use std::os::fd::RawFd;
    use std::sync::Arc;

    use anyhow::Context;

    use super::Device;
    use super::DeviceType;

    /// Linux TUN/TAP device. The `tun` crate handle owns the fd; I/O goes
    /// through `libc` directly so a blocked read never serializes against a
    /// write.
    pub struct TunTapDevice {
        _handle: tun::platform::Device,
        fd: RawFd,
        name: String,
        tap: bool,
    }

    pub fn open(dev_type: DeviceType, name: Option<&str>) -> anyhow::Result<Arc<dyn Device>> {
        let mut config = tun::Configuration::default();
        if let Some(name) = name {
            config.name(name);
        }
        if dev_type == DeviceType::Tap {
            config.layer(tun::Layer::L2);
        }
        // Reads and writes must carry bare packets, no PI header.
        config.platform(|config| {
            config.packet_information(false);
        });
        let handle = tun::create(&config).context("error creating tun/tap device")?;
        let name = tun::Device::name(&handle).context("error reading tun/tap device name")?;
        let fd = handle.as_raw_fd();
        log::info!("opened {} device {}", if dev_type == DeviceType::Tap { "tap" } else { "tun" }, name);
        Ok(Arc::new(TunTapDevice {
            _handle: handle,
            fd,
            name,
            tap: dev_type == DeviceType::Tap,
        }))
    }

    impl Device for TunTapDevice {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_tap(&self) -> bool {
            self.tap
        }

        fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(n as usize)
        }

        fn send(&self, buf: &[u8]) -> std::io::Result<usize> {
            let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
            if n < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(n as usize)
        }
    }
}
