//! Listening-socket setup.
//!
//! Both families bind with SO_REUSEADDR so a tenant's ports can be reopened
//! immediately after a conversation ends. TCP_NODELAY is per-connection and
//! is applied by callers to each accepted stream.

use std::{io, net::SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};

/// Accept queue depth for tenant TCP listeners.
pub const LISTEN_BACKLOG: u32 = 8;

/// Bind a UDP socket with SO_REUSEADDR. Must be called within a tokio
/// runtime.
pub fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Bind a TCP listener with SO_REUSEADDR and the relay's accept backlog.
pub fn bind_tcp(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Wait until a stream turns readable and report whether the peer is still
/// there. A zero-length peek is an orderly shutdown; no payload bytes are
/// consumed either way.
pub async fn peer_alive(stream: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    match stream.peek(&mut probe).await {
        Ok(0) | Err(_) => false,
        Ok(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn any_port() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn udp_bind_and_reuse() {
        let sock = bind_udp(any_port()).unwrap();
        let addr = sock.local_addr().unwrap();
        drop(sock);
        // rebinding the same port must succeed straight away
        let again = bind_udp(addr).unwrap();
        assert_eq!(again.local_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn tcp_bind_accepts() {
        let listener = bind_tcp(any_port()).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        stream.set_nodelay(true).unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn peer_alive_detects_data_and_shutdown() {
        let listener = bind_tcp(any_port()).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        client.write_all(b"x").await.unwrap();
        assert!(peer_alive(&stream).await);

        drop(client);
        // the probe does not consume, so drain the byte first
        let mut drain = [0u8; 4];
        use tokio::io::AsyncReadExt;
        let mut stream = stream;
        let _ = stream.read(&mut drain).await.unwrap();
        assert!(!peer_alive(&stream).await);
    }
}
