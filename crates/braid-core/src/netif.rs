//! The seam between the engine and the host's view of its networks.
//!
//! The engine never enumerates interfaces itself; it asks an
//! [`InterfaceProvider`] for handles and for sockets bound to them, and
//! learns about topology changes through [`NetworkEvent`]s.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::str::FromStr;

/// Transport class of a bonded path. Drives the scheduler's priority
/// weighting and breaks score ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Wifi,
    Ethernet,
    Cellular,
    Unknown,
}

impl TransportKind {
    /// Scheduler weight applied when network priority is enabled.
    pub fn priority_weight(self) -> f64 {
        match self {
            TransportKind::Wifi => 2.0,
            TransportKind::Ethernet => 1.8,
            TransportKind::Cellular => 1.5,
            TransportKind::Unknown => 1.0,
        }
    }

    /// Tie-break rank; lower is preferred.
    pub fn rank(self) -> u8 {
        match self {
            TransportKind::Wifi => 0,
            TransportKind::Ethernet => 1,
            TransportKind::Cellular => 2,
            TransportKind::Unknown => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Wifi => "wifi",
            TransportKind::Ethernet => "ethernet",
            TransportKind::Cellular => "cellular",
            TransportKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wifi" | "wi-fi" | "wlan" => Ok(TransportKind::Wifi),
            "ethernet" | "eth" | "wired" => Ok(TransportKind::Ethernet),
            "cellular" | "mobile" | "lte" => Ok(TransportKind::Cellular),
            "unknown" => Ok(TransportKind::Unknown),
            other => Err(format!("unknown transport kind '{}'", other)),
        }
    }
}

/// Identity of one underlying network path. The name is stable across the
/// path disappearing and coming back, which is what backoff bookkeeping
/// keys on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkHandle {
    pub name: String,
    pub local_addr: IpAddr,
    pub kind: TransportKind,
}

/// Topology change delivered to the session.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    Added(NetworkHandle),
    Removed(String),
}

/// Host-side view of the available networks.
///
/// `open_socket` must return the socket non-blocking, bound to the handle's
/// address and already connected to the server.
pub trait InterfaceProvider: Send + Sync {
    fn interfaces(&self) -> Vec<NetworkHandle>;

    fn open_socket(&self, handle: &NetworkHandle, server: SocketAddr) -> io::Result<UdpSocket>;
}

/// Provider backed by a fixed, configured interface list.
pub struct StaticProvider {
    handles: Vec<NetworkHandle>,
}

impl StaticProvider {
    pub fn new(handles: Vec<NetworkHandle>) -> Self {
        Self { handles }
    }
}

impl InterfaceProvider for StaticProvider {
    fn interfaces(&self) -> Vec<NetworkHandle> {
        self.handles.clone()
    }

    fn open_socket(&self, handle: &NetworkHandle, server: SocketAddr) -> io::Result<UdpSocket> {
        let socket = UdpSocket::bind(SocketAddr::new(handle.local_addr, 0))?;
        socket.connect(server)?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }
}
