//! Datagram endpoint
//!
//! A thin abstraction over a UDP socket used by the listener and by every
//! session: bind (ephemeral when port 0), send-to, blocking receive, and
//! receive-with-deadline filtered on an expected peer.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};

/// The peer a receive is expected from. `None` fields are wildcards, the
/// moral equivalent of address/port 0: the first DATA or ACK of a transfer
/// arrives from an ephemeral port the peer picked, which is only learned
/// from that datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerFilter {
    pub addr: Option<IpAddr>,
    pub port: Option<u16>,
}

impl PeerFilter {
    /// Match exactly one peer endpoint.
    pub fn exact(peer: SocketAddr) -> Self {
        Self {
            addr: Some(peer.ip()),
            port: Some(peer.port()),
        }
    }

    /// Match any peer.
    pub fn any() -> Self {
        Self { addr: None, port: None }
    }

    pub fn matches(&self, peer: SocketAddr) -> bool {
        self.addr.is_none_or(|a| a == peer.ip()) && self.port.is_none_or(|p| p == peer.port())
    }
}

/// One UDP socket, bound to `0.0.0.0`.
pub struct Endpoint {
    socket: UdpSocket,
}

impl Endpoint {
    /// Bind to `0.0.0.0:port`. Port 0 asks the kernel for an ephemeral
    /// port, readable afterwards via [`Endpoint::local_port`].
    pub async fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .with_context(|| format!("failed to bind UDP endpoint on port {port}"))?;

        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    pub async fn send_to(&self, peer: SocketAddr, bytes: &[u8]) -> io::Result<usize> {
        self.socket.send_to(bytes, peer).await
    }

    /// Blocking receive, used by the listener on the well-known port.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    /// Receive with a deadline. Datagrams from peers the filter rejects are
    /// discarded and the wait continues until `wait` has elapsed. Returns
    /// `Ok(None)` on deadline expiry, distinguishable from a socket error.
    pub async fn recv_from_expected(
        &self,
        buf: &mut [u8],
        filter: PeerFilter,
        wait: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        let deadline = Instant::now() + wait;

        loop {
            match timeout_at(deadline, self.socket.recv_from(buf)).await {
                Err(_) => return Ok(None),
                Ok(Err(e)) => return Err(e),
                Ok(Ok((len, peer))) => {
                    if filter.matches(peer) {
                        return Ok(Some((len, peer)));
                    }
                    tracing::debug!("discarding datagram from unexpected peer {}", peer);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(addr: [u8; 4], port: u16) -> SocketAddr {
        SocketAddr::from((addr, port))
    }

    #[test]
    fn filter_wildcards() {
        let p = peer([127, 0, 0, 1], 3456);

        assert!(PeerFilter::any().matches(p));
        assert!(PeerFilter::exact(p).matches(p));
        assert!(!PeerFilter::exact(p).matches(peer([127, 0, 0, 1], 3457)));
        assert!(!PeerFilter::exact(p).matches(peer([127, 0, 0, 2], 3456)));

        // Address-only filter leaves the port as a wildcard.
        let addr_only = PeerFilter {
            addr: Some(p.ip()),
            port: None,
        };
        assert!(addr_only.matches(peer([127, 0, 0, 1], 9999)));
        assert!(!addr_only.matches(peer([127, 0, 0, 2], 3456)));
    }

    #[tokio::test]
    async fn bind_ephemeral_port() {
        let ep = Endpoint::bind(0).await.unwrap();
        assert_ne!(ep.local_port().unwrap(), 0);
    }

    #[tokio::test]
    async fn timeout_is_not_an_error() {
        let ep = Endpoint::bind(0).await.unwrap();
        let mut buf = [0u8; 16];
        let got = ep
            .recv_from_expected(&mut buf, PeerFilter::any(), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn filter_discards_unexpected_peer() {
        let ep = Endpoint::bind(0).await.unwrap();
        let dst = SocketAddr::from(([127, 0, 0, 1], ep.local_port().unwrap()));

        let wanted = Endpoint::bind(0).await.unwrap();
        let stranger = Endpoint::bind(0).await.unwrap();
        let wanted_addr = SocketAddr::from(([127, 0, 0, 1], wanted.local_port().unwrap()));

        stranger.send_to(dst, b"noise").await.unwrap();
        wanted.send_to(dst, b"signal").await.unwrap();

        let mut buf = [0u8; 16];
        let (len, src) = ep
            .recv_from_expected(&mut buf, PeerFilter::exact(wanted_addr), Duration::from_secs(1))
            .await
            .unwrap()
            .expect("expected datagram before deadline");

        assert_eq!(&buf[..len], b"signal");
        assert_eq!(src, wanted_addr);
    }

    #[tokio::test]
    async fn port_wildcard_learns_peer() {
        let ep = Endpoint::bind(0).await.unwrap();
        let dst = SocketAddr::from(([127, 0, 0, 1], ep.local_port().unwrap()));

        let sender = Endpoint::bind(0).await.unwrap();
        sender.send_to(dst, b"hello").await.unwrap();

        let filter = PeerFilter {
            addr: Some(IpAddr::from([127, 0, 0, 1])),
            port: None,
        };
        let mut buf = [0u8; 16];
        let (_, src) = ep
            .recv_from_expected(&mut buf, filter, Duration::from_secs(1))
            .await
            .unwrap()
            .expect("expected datagram before deadline");

        assert_eq!(src.port(), sender.local_port().unwrap());
    }
}
