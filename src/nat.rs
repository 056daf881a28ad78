use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::time::Instant;

pub mod classify;
pub mod holepunch;
pub mod stun;

#[derive(Debug, thiserror::Error)]
pub enum NatError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out: {0}")]
    Timeout(&'static str),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("no reflector answered")]
    NoReflector,
}

pub type NatResult<T> = Result<T, NatError>;

/// The classic NAT taxonomy. `Restricted` is part of the vocabulary but the
/// two-reflector probe cannot distinguish it from `PortRestricted`; a full
/// RFC 3489 classifier would need CHANGE-REQUEST support on the reflector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NatType {
    #[default]
    Unknown,
    Open,
    FullCone,
    Restricted,
    PortRestricted,
    Symmetric,
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NatType::Unknown => "Unknown",
            NatType::Open => "Open (No NAT)",
            NatType::FullCone => "Full Cone NAT",
            NatType::Restricted => "Restricted NAT",
            NatType::PortRestricted => "Port Restricted NAT",
            NatType::Symmetric => "Symmetric NAT",
        };
        f.write_str(name)
    }
}

/// What we currently believe about our own reachability. Written only by
/// the STUN client and the classifier; read by the hole-punch engine.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub public_ip: Option<Ipv4Addr>,
    pub public_port: u16,
    pub local_ip: Option<IpAddr>,
    pub local_port: u16,
    pub nat_type: NatType,
    pub observed_at: Option<Instant>,
}

pub type SharedConnectionInfo = Arc<Mutex<ConnectionInfo>>;

pub fn shared_connection_info() -> SharedConnectionInfo {
    Arc::new(Mutex::new(ConnectionInfo::default()))
}

/// Outcome of one hole-punch request. Each request resolves to exactly one
/// of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchOutcome {
    Connected { ip: IpAddr, port: u16 },
    Failed,
}

impl PunchOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(self, PunchOutcome::Connected { .. })
    }
}

/// Discover the outbound-facing local address by "connecting" a datagram
/// socket to a public endpoint and reading the chosen source address. No
/// traffic is sent.
pub async fn detect_local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect("8.8.8.8:53").await.ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

pub(crate) fn socket_addr(ip: IpAddr, port: u16) -> SocketAddr {
    SocketAddr::new(ip, port)
}
