//! Datagram transport under the control and data paths

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;

/// Unreliable datagram link
///
/// Abstracts the UDP sockets so the register channel, receiver and
/// simulated devices in tests can share one code path. Both methods take
/// `&self` so one task can receive while others send.
#[async_trait::async_trait]
pub trait DatagramLink: Send + Sync + 'static {
    /// Send one datagram to the peer
    async fn send(&self, datagram: &[u8]) -> io::Result<()>;

    /// Receive one datagram into `buf`, returning its length
    ///
    /// Datagrams longer than `buf` are truncated.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

#[async_trait::async_trait]
impl DatagramLink for UdpSocket {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        let sent = UdpSocket::send(self, datagram).await?;
        if sent != datagram.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("sent {sent} of {} bytes", datagram.len()),
            ));
        }
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        // The data socket is never connected, so take datagrams from any sender
        let (len, _) = UdpSocket::recv_from(self, buf).await?;
        Ok(len)
    }
}

/// Local IPv4 address the OS routes toward `camera`.
///
/// Connecting a UDP socket sends nothing; it only selects the interface.
pub async fn host_address_toward(camera: SocketAddrV4) -> io::Result<Ipv4Addr> {
    let probe = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
    probe.connect(SocketAddr::V4(camera)).await?;
    match probe.local_addr()? {
        SocketAddr::V4(local) if !local.ip().is_unspecified() => Ok(*local.ip()),
        other => Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no IPv4 interface routes to {camera} (got {other})"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_sockets_exchange_datagrams() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(b.local_addr().unwrap()).await.unwrap();

        DatagramLink::send(&a, &[1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 16];
        let len = DatagramLink::recv(&b, &mut buf).await.unwrap();
        assert_eq!(&buf[..len], &[1, 2, 3]);
    }

    #[tokio::test]
    async fn loopback_routes_from_loopback() {
        let host = host_address_toward(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 3956)).await.unwrap();
        assert!(host.is_loopback());
    }
}
