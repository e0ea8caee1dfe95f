//! Linux tun device
//!
//! The device fd is created through `/dev/net/tun` (TUNSETIFF, no packet
//! info header) and driven non-blocking under tokio's `AsyncFd`. Address,
//! MTU and link state go through the `ip` command, like the route
//! installer.

use crate::netdev::{InterfaceProvider, NetdevError, VirtualInterface};
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::unix::AsyncFd;
use tracing::{debug, info};

const TUN_DEVICE: &str = "/dev/net/tun";
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// Tun device handle
pub struct TunInterface {
    fd: AsyncFd<File>,
    name: String,
    closed: AtomicBool,
}

impl TunInterface {
    /// Open `/dev/net/tun` and attach a tun interface with the given name.
    pub fn create(name: &str) -> Result<Self, NetdevError> {
        if name.len() >= libc::IFNAMSIZ {
            return Err(NetdevError::Unsupported(format!(
                "interface name '{}' too long",
                name
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(TUN_DEVICE)?;

        let mut req = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 22],
        };
        for (dst, src) in req.ifr_name.iter_mut().zip(name.as_bytes()) {
            *dst = *src as libc::c_char;
        }

        // Safety: TUNSETIFF reads a properly initialized ifreq from our
        // stack and the fd is owned by `file` for the lifetime of the call.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req) };
        if rc < 0 {
            return Err(NetdevError::Io(std::io::Error::last_os_error()));
        }

        info!(interface = name, "Created tun device");

        Ok(Self {
            fd: AsyncFd::new(file)?,
            name: name.to_string(),
            closed: AtomicBool::new(false),
        })
    }

    async fn run_ip(args: &[&str]) -> Result<(), NetdevError> {
        let output = tokio::process::Command::new("ip")
            .args(args)
            .output()
            .await?;

        if !output.status.success() {
            return Err(NetdevError::CommandFailed {
                command: format!("ip {}", args.join(" ")),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        debug!(command = %format!("ip {}", args.join(" ")), "Interface command succeeded");
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), NetdevError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetdevError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl VirtualInterface for TunInterface {
    async fn set_ip(&self, ip: Ipv4Addr, prefix: u8) -> Result<(), NetdevError> {
        self.ensure_open()?;
        let addr = format!("{}/{}", ip, prefix);
        Self::run_ip(&["addr", "add", &addr, "dev", &self.name]).await
    }

    async fn set_mtu(&self, mtu: u16) -> Result<(), NetdevError> {
        self.ensure_open()?;
        let mtu = mtu.to_string();
        Self::run_ip(&["link", "set", "dev", &self.name, "mtu", &mtu]).await
    }

    async fn up(&self) -> Result<(), NetdevError> {
        self.ensure_open()?;
        Self::run_ip(&["link", "set", "dev", &self.name, "up"]).await
    }

    async fn down(&self) -> Result<(), NetdevError> {
        Self::run_ip(&["link", "set", "dev", &self.name, "down"]).await
    }

    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize, NetdevError> {
        loop {
            self.ensure_open()?;
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| (&*inner.get_ref()).read(buf)) {
                Ok(Ok(n)) => return Ok(n),
                Ok(Err(e)) => return Err(NetdevError::Io(e)),
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_packet(&self, buf: &[u8]) -> Result<usize, NetdevError> {
        loop {
            self.ensure_open()?;
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| (&*inner.get_ref()).write(buf)) {
                Ok(Ok(n)) => return Ok(n),
                Ok(Err(e)) => return Err(NetdevError::Io(e)),
                Err(_would_block) => continue,
            }
        }
    }

    async fn close(&self) -> Result<(), NetdevError> {
        // The fd itself is reclaimed when the interface is dropped
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Provider creating real tun devices.
#[derive(Debug, Default, Clone)]
pub struct TunProvider;

#[async_trait]
impl InterfaceProvider for TunProvider {
    type Iface = TunInterface;

    async fn open(&self, name: &str, _mtu: u16) -> Result<Self::Iface, NetdevError> {
        TunInterface::create(name)
    }
}
