use crate::Result;
use eyre::eyre;
use nix::ifaddrs::getifaddrs;
use nix::sys::socket::{setsockopt, sockopt::ReuseAddr};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::{debug, warn};

/// Interfaces probed for the local address, in order (Linux, macOS).
const LOCAL_INTERFACES: [&str; 2] = ["eth0", "en0"];

/// A TCP port bound to an OS-assigned number and held until released.
///
/// Holding the socket keeps other processes from grabbing the port between
/// allocation and the moment the mock service binds it.
#[derive(Debug)]
pub struct PortReservation {
    addr: SocketAddr,
    socket: Option<Socket>,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether the socket is still held.
    pub fn is_held(&self) -> bool {
        self.socket.is_some()
    }

    /// Closes the reserving socket so another process can bind the port.
    pub fn release(&mut self) {
        if self.socket.take().is_some() {
            debug!("Released reserved port {}", self.addr);
        }
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        self.release();
    }
}

/// Binds an OS-assigned TCP port on `ip` and keeps the socket open.
pub fn reserve_port(ip: IpAddr) -> Result<PortReservation> {
    let socket = match ip {
        IpAddr::V4(_) => Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?,
        IpAddr::V6(_) => Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?,
    };
    setsockopt(&socket, ReuseAddr, &true)?;
    socket.bind(&SocketAddr::new(ip, 0).into())?;

    let addr = socket
        .local_addr()?
        .as_socket()
        .ok_or_else(|| eyre!("Reserved socket on {} has no inet address", ip))?;

    debug!("Reserved port {}", addr);
    Ok(PortReservation {
        addr,
        socket: Some(socket),
    })
}

/// Returns a free TCP port on `ip`, releasing the socket immediately.
pub fn free_tcp_port(ip: IpAddr) -> Result<u16> {
    let mut reservation = reserve_port(ip)?;
    reservation.release();
    Ok(reservation.port())
}

/// IPv4 address of the first known local interface.
pub fn local_ip_address() -> Result<IpAddr> {
    let addrs: Vec<_> = getifaddrs()?.collect();

    for iface in LOCAL_INTERFACES {
        let found = addrs
            .iter()
            .filter(|ifaddr| ifaddr.interface_name == iface)
            .find_map(|ifaddr| ifaddr.address.as_ref()?.as_sockaddr_in().map(|sin| sin.ip()));
        if let Some(ip) = found {
            return Ok(IpAddr::V4(Ipv4Addr::from(ip)));
        }
    }

    Err(eyre!(
        "No IPv4 address found on interfaces {:?}",
        LOCAL_INTERFACES
    ))
}

/// Address to bind a mock service to: `configured` if set, otherwise the
/// local interface address, falling back to loopback.
pub fn resolve_bind_address(configured: Option<IpAddr>) -> IpAddr {
    if let Some(ip) = configured {
        return ip;
    }
    match local_ip_address() {
        Ok(ip) => ip,
        Err(e) => {
            warn!("{}, binding to loopback", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}
