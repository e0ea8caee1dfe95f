//! Platform abstraction for the virtual interface and host routes
//!
//! The runtime only ever talks to [`VirtualInterface`] and
//! [`RouteInstaller`]; the Linux tun device lives in `tun_linux`, tests use
//! the [`mem`] devices. Host routes are mutated by shelling out to `ip`,
//! which keeps the platform surface to a single well-known binary.

use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum NetdevError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command `{command}` failed: {detail}")]
    CommandFailed { command: String, detail: String },

    #[error("Device closed")]
    Closed,

    #[error("Unsupported platform: {0}")]
    Unsupported(String),
}

/// A host-OS virtual layer-3 interface.
///
/// Reads deliver host-transmitted IP datagrams to user space; writes are
/// delivered to the host as received packets.
#[async_trait]
pub trait VirtualInterface: Send + Sync {
    async fn set_ip(&self, ip: Ipv4Addr, prefix: u8) -> Result<(), NetdevError>;
    async fn set_mtu(&self, mtu: u16) -> Result<(), NetdevError>;
    async fn up(&self) -> Result<(), NetdevError>;
    async fn down(&self) -> Result<(), NetdevError>;

    /// Read one IP datagram into `buf`, returning its length.
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize, NetdevError>;

    /// Write one IP datagram, returning the number of bytes accepted.
    async fn write_packet(&self, buf: &[u8]) -> Result<usize, NetdevError>;

    async fn close(&self) -> Result<(), NetdevError>;

    fn name(&self) -> &str;
}

/// Opens virtual interfaces once the runtime knows the negotiated MTU.
#[async_trait]
pub trait InterfaceProvider: Send + Sync {
    type Iface: VirtualInterface + 'static;

    async fn open(&self, name: &str, mtu: u16) -> Result<Self::Iface, NetdevError>;
}

/// Mutates the host routing table, remembering what it installed so
/// teardown can undo it in reverse order.
#[async_trait]
pub trait RouteInstaller: Send + Sync {
    async fn add_route(
        &self,
        destination: &str,
        gateway: Option<Ipv4Addr>,
        interface: Option<&str>,
    ) -> Result<(), NetdevError>;

    async fn del_route(&self, destination: &str) -> Result<(), NetdevError>;

    async fn add_default(
        &self,
        gateway: Option<Ipv4Addr>,
        interface: Option<&str>,
    ) -> Result<(), NetdevError>;

    async fn del_default(&self) -> Result<(), NetdevError>;

    /// Remove every route installed through this installer, newest first.
    async fn cleanup_all(&self) -> Result<(), NetdevError>;

    fn installed(&self) -> Vec<String>;
}

#[async_trait]
impl<T: RouteInstaller + ?Sized> RouteInstaller for std::sync::Arc<T> {
    async fn add_route(
        &self,
        destination: &str,
        gateway: Option<Ipv4Addr>,
        interface: Option<&str>,
    ) -> Result<(), NetdevError> {
        (**self).add_route(destination, gateway, interface).await
    }

    async fn del_route(&self, destination: &str) -> Result<(), NetdevError> {
        (**self).del_route(destination).await
    }

    async fn add_default(
        &self,
        gateway: Option<Ipv4Addr>,
        interface: Option<&str>,
    ) -> Result<(), NetdevError> {
        (**self).add_default(gateway, interface).await
    }

    async fn del_default(&self) -> Result<(), NetdevError> {
        (**self).del_default().await
    }

    async fn cleanup_all(&self) -> Result<(), NetdevError> {
        (**self).cleanup_all().await
    }

    fn installed(&self) -> Vec<String> {
        (**self).installed()
    }
}

/// Route installer backed by the `ip route` command.
#[derive(Debug, Default)]
pub struct IpRouteInstaller {
    installed: Mutex<Vec<String>>,
}

impl IpRouteInstaller {
    pub fn new() -> Self {
        Self::default()
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

        debug!(command = %format!("ip {}", args.join(" ")), "Route command succeeded");
        Ok(())
    }

    async fn add(&self, destination: &str, gateway: Option<Ipv4Addr>, interface: Option<&str>) -> Result<(), NetdevError> {
        let gateway_str = gateway.map(|g| g.to_string());

        let mut args = vec!["route", "add", destination];
        if let Some(ref gw) = gateway_str {
            args.push("via");
            args.push(gw.as_str());
        }
        if let Some(dev) = interface {
            args.push("dev");
            args.push(dev);
        }

        Self::run_ip(&args).await?;
        self.installed.lock().unwrap().push(destination.to_string());
        Ok(())
    }

    async fn del(&self, destination: &str) -> Result<(), NetdevError> {
        Self::run_ip(&["route", "del", destination]).await?;
        self.installed
            .lock()
            .unwrap()
            .retain(|d| d != destination);
        Ok(())
    }
}

#[async_trait]
impl RouteInstaller for IpRouteInstaller {
    async fn add_route(
        &self,
        destination: &str,
        gateway: Option<Ipv4Addr>,
        interface: Option<&str>,
    ) -> Result<(), NetdevError> {
        self.add(destination, gateway, interface).await
    }

    async fn del_route(&self, destination: &str) -> Result<(), NetdevError> {
        self.del(destination).await
    }

    async fn add_default(
        &self,
        gateway: Option<Ipv4Addr>,
        interface: Option<&str>,
    ) -> Result<(), NetdevError> {
        self.add("default", gateway, interface).await
    }

    async fn del_default(&self) -> Result<(), NetdevError> {
        self.del("default").await
    }

    async fn cleanup_all(&self) -> Result<(), NetdevError> {
        let destinations: Vec<String> = {
            let mut installed = self.installed.lock().unwrap();
            installed.drain(..).rev().collect()
        };

        let mut first_error = None;
        for destination in destinations {
            if let Err(e) = Self::run_ip(&["route", "del", &destination]).await {
                warn!(destination = %destination, error = %e, "Failed to remove route");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn installed(&self) -> Vec<String> {
        self.installed.lock().unwrap().clone()
    }
}

pub mod mem {
    //! In-memory devices for tests
    //!
    //! `MemInterface` exposes the packets the runtime wrote and lets tests
    //! inject inbound packets, per-device state shared with the provider.

    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[derive(Debug, Default)]
    struct DevState {
        ip: Option<(Ipv4Addr, u8)>,
        mtu: u16,
        up: bool,
    }

    #[derive(Debug)]
    pub struct MemDevice {
        name: Mutex<String>,
        state: Mutex<DevState>,
        written: Mutex<Vec<Vec<u8>>>,
        inbound_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
        inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
        closed: AtomicBool,
    }

    impl MemDevice {
        pub fn new() -> Arc<Self> {
            let (tx, rx) = mpsc::channel(1024);
            Arc::new(Self {
                name: Mutex::new(String::new()),
                state: Mutex::new(DevState::default()),
                written: Mutex::new(Vec::new()),
                inbound_tx: Mutex::new(Some(tx)),
                inbound_rx: tokio::sync::Mutex::new(rx),
                closed: AtomicBool::new(false),
            })
        }

        /// Queue a packet for the runtime to read from the interface.
        pub async fn inject(&self, packet: Vec<u8>) -> bool {
            let tx = self.inbound_tx.lock().unwrap().clone();
            match tx {
                Some(tx) => tx.send(packet).await.is_ok(),
                None => false,
            }
        }

        /// Packets the runtime wrote toward the host.
        pub fn written_packets(&self) -> Vec<Vec<u8>> {
            self.written.lock().unwrap().clone()
        }

        pub fn name(&self) -> String {
            self.name.lock().unwrap().clone()
        }

        pub fn is_up(&self) -> bool {
            self.state.lock().unwrap().up
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        pub fn ip(&self) -> Option<(Ipv4Addr, u8)> {
            self.state.lock().unwrap().ip
        }

        pub fn mtu(&self) -> u16 {
            self.state.lock().unwrap().mtu
        }
    }

    /// Interface handle over a shared [`MemDevice`].
    #[derive(Debug, Clone)]
    pub struct MemInterface {
        device: Arc<MemDevice>,
        name: String,
    }

    #[async_trait]
    impl VirtualInterface for MemInterface {
        async fn set_ip(&self, ip: Ipv4Addr, prefix: u8) -> Result<(), NetdevError> {
            self.device.state.lock().unwrap().ip = Some((ip, prefix));
            Ok(())
        }

        async fn set_mtu(&self, mtu: u16) -> Result<(), NetdevError> {
            self.device.state.lock().unwrap().mtu = mtu;
            Ok(())
        }

        async fn up(&self) -> Result<(), NetdevError> {
            self.device.state.lock().unwrap().up = true;
            Ok(())
        }

        async fn down(&self) -> Result<(), NetdevError> {
            self.device.state.lock().unwrap().up = false;
            Ok(())
        }

        async fn read_packet(&self, buf: &mut [u8]) -> Result<usize, NetdevError> {
            let mut rx = self.device.inbound_rx.lock().await;
            match rx.recv().await {
                Some(packet) => {
                    let n = packet.len().min(buf.len());
                    buf[..n].copy_from_slice(&packet[..n]);
                    Ok(n)
                }
                None => Err(NetdevError::Closed),
            }
        }

        async fn write_packet(&self, buf: &[u8]) -> Result<usize, NetdevError> {
            if self.device.is_closed() {
                return Err(NetdevError::Closed);
            }
            self.device.written.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        }

        async fn close(&self) -> Result<(), NetdevError> {
            self.device.closed.store(true, Ordering::SeqCst);
            self.device.inbound_tx.lock().unwrap().take();
            Ok(())
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    /// Provider handing out handles to a single shared device.
    #[derive(Debug, Clone)]
    pub struct MemProvider {
        device: Arc<MemDevice>,
    }

    impl MemProvider {
        pub fn new() -> Self {
            Self {
                device: MemDevice::new(),
            }
        }

        pub fn device(&self) -> Arc<MemDevice> {
            self.device.clone()
        }
    }

    impl Default for MemProvider {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl InterfaceProvider for MemProvider {
        type Iface = MemInterface;

        async fn open(&self, name: &str, mtu: u16) -> Result<Self::Iface, NetdevError> {
            *self.device.name.lock().unwrap() = name.to_string();
            self.device.state.lock().unwrap().mtu = mtu;
            Ok(MemInterface {
                device: self.device.clone(),
                name: name.to_string(),
            })
        }
    }

    /// Route installer that records calls instead of touching the host.
    #[derive(Debug, Default)]
    pub struct MemRouteInstaller {
        installed: Mutex<Vec<String>>,
        removed: Mutex<Vec<String>>,
    }

    impl MemRouteInstaller {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn removed(&self) -> Vec<String> {
            self.removed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RouteInstaller for MemRouteInstaller {
        async fn add_route(
            &self,
            destination: &str,
            _gateway: Option<Ipv4Addr>,
            _interface: Option<&str>,
        ) -> Result<(), NetdevError> {
            self.installed.lock().unwrap().push(destination.to_string());
            Ok(())
        }

        async fn del_route(&self, destination: &str) -> Result<(), NetdevError> {
            self.installed.lock().unwrap().retain(|d| d != destination);
            self.removed.lock().unwrap().push(destination.to_string());
            Ok(())
        }

        async fn add_default(
            &self,
            gateway: Option<Ipv4Addr>,
            interface: Option<&str>,
        ) -> Result<(), NetdevError> {
            self.add_route("default", gateway, interface).await
        }

        async fn del_default(&self) -> Result<(), NetdevError> {
            self.del_route("default").await
        }

        async fn cleanup_all(&self) -> Result<(), NetdevError> {
            let drained: Vec<String> = {
                let mut installed = self.installed.lock().unwrap();
                installed.drain(..).rev().collect()
            };
            self.removed.lock().unwrap().extend(drained);
            Ok(())
        }

        fn installed(&self) -> Vec<String> {
            self.installed.lock().unwrap().clone()
        }
    }
}
