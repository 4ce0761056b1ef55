use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    str::FromStr,
};

/// Network address of a service instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(SocketAddr),
}

impl Address {
    pub const fn ip_addr(&self) -> &SocketAddr {
        match self {
            Self::Ip(ip) => ip,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::Ip(addr)
    }
}

impl FromStr for Address {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::Ip(s.parse()?))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{addr}"),
        }
    }
}

/// Best-effort detection of the local outbound IP.
///
/// Connecting a UDP socket selects a route without sending a packet; the
/// socket's local address is the IP other hosts can reach us on. Falls back
/// to `127.0.0.1` when no route is available.
pub fn outbound_ip() -> IpAddr {
    fn detect() -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip())
    }
    detect().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
