//! TCP transport for canvas sessions.

use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: SocketAddr) -> tokio::io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    // Frames are small and latency matters more than batching
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn test_tcp_listen_connect() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = listen_tcp(addr).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let stream = connect_tcp(bound_addr).await.unwrap();
        assert!(stream.peer_addr().is_ok());
        assert!(stream.nodelay().unwrap());
    }
}
