//! UDP socket creation
//!
//! Sockets are built with socket2 so the receive port can be bound without
//! address reuse and with an enlarged receive buffer before tokio takes over.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::NetworkError;

/// Kernel receive buffer requested for the audio socket
const RECV_BUFFER_SIZE: usize = 256 * 1024;

fn unspecified_for(server: SocketAddr) -> IpAddr {
    match server {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

fn new_udp_socket(server: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(server), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn bind_error(port: u16, err: io::Error) -> NetworkError {
    if err.kind() == io::ErrorKind::AddrInUse {
        NetworkError::AddressInUse(port)
    } else {
        NetworkError::BindFailed(err.to_string())
    }
}

/// Bind the socket the server streams to.
///
/// The port is bound exclusively: if another socket holds it, the result is
/// [`NetworkError::AddressInUse`]. Port 0 picks an ephemeral port.
pub fn bind_receive_socket(server: SocketAddr, port: u16) -> Result<UdpSocket, NetworkError> {
    let local = SocketAddr::new(unspecified_for(server), port);

    let socket = new_udp_socket(server).map_err(|e| bind_error(port, e))?;
    socket
        .set_reuse_address(false)
        .map_err(|e| bind_error(port, e))?;

    if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
        tracing::debug!("Could not enlarge receive buffer: {}", e);
    }

    socket.bind(&local.into()).map_err(|e| bind_error(port, e))?;

    UdpSocket::from_std(socket.into()).map_err(|e| bind_error(port, e))
}

/// Create the socket used for every outbound datagram.
pub fn bind_send_socket(server: SocketAddr) -> Result<UdpSocket, NetworkError> {
    let local = SocketAddr::new(unspecified_for(server), 0);

    let socket = new_udp_socket(server).map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .bind(&local.into())
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    UdpSocket::from_std(socket.into()).map_err(|e| NetworkError::BindFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 5000))
    }

    #[tokio::test]
    async fn test_bind_ephemeral() {
        let socket = bind_receive_socket(server(), 0).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let holder = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        match bind_receive_socket(server(), port) {
            Err(NetworkError::AddressInUse(p)) => assert_eq!(p, port),
            other => panic!("expected AddressInUse, got {:?}", other.map(|_| ())),
        }
    }
}
