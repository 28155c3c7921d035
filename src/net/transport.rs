//! Transport seam between the protocol engine and the operating system.
//!
//! The engine only ever sees [`Packet`]s, dialed streams, and accepted
//! streams; swapping the implementation (for tests, tunnels, etc.) swaps
//! nothing else. [`NetTransport`] is the production UDP + TCP pair sharing
//! one port.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Datagram receive buffer; generous so oversized packets surface as decode
/// errors rather than silent truncation.
const UDP_RECV_BUF: usize = 65_536;

const PACKET_CHANNEL_DEPTH: usize = 1024;
const STREAM_CHANNEL_DEPTH: usize = 64;

/// One inbound datagram with its receive timestamp (taken at ingest, so RTT
/// math excludes queueing in the engine).
pub struct Packet {
    pub buf: Vec<u8>,
    pub from: SocketAddr,
    pub timestamp: Instant,
}

pub trait Transport: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Resolve the address/port this node advertises to the cluster.
    fn final_advertise_addr(
        &self,
        ip: Option<IpAddr>,
        port: Option<u16>,
    ) -> io::Result<(IpAddr, u16)>;

    /// Best-effort datagram send; returns the egress instant for RTT math.
    fn write_to(
        &self,
        buf: &[u8],
        addr: SocketAddr,
    ) -> impl Future<Output = io::Result<Instant>> + Send;

    /// Open a reliable stream to a peer.
    fn dial_timeout(
        &self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Take the inbound datagram channel. Yields `Some` exactly once.
    fn packet_rx(&self) -> Option<mpsc::Receiver<Packet>>;

    /// Take the inbound stream channel. Yields `Some` exactly once.
    fn stream_rx(&self) -> Option<mpsc::Receiver<(Self::Stream, SocketAddr)>>;

    /// Release sockets and stop reader tasks.
    fn shutdown(&self) -> impl Future<Output = io::Result<()>> + Send;
}

// =============================================================================
// PRODUCTION TRANSPORT
// =============================================================================

pub struct NetTransport {
    udp: Arc<UdpSocket>,
    bound: SocketAddr,
    packets: Mutex<Option<mpsc::Receiver<Packet>>>,
    streams: Mutex<Option<mpsc::Receiver<(TcpStream, SocketAddr)>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NetTransport {
    /// Bind the UDP socket and TCP listener on the same port. With an
    /// ephemeral request (port 0) the pair is retried until both protocols
    /// land on one port number.
    pub async fn bind(addr: IpAddr, port: u16) -> io::Result<Self> {
        let mut last_err = None;
        for _ in 0..10 {
            let tcp = TcpListener::bind((addr, port)).await?;
            let bound = tcp.local_addr()?;
            match UdpSocket::bind((addr, bound.port())).await {
                Ok(udp) => return Ok(Self::start(tcp, udp, bound)),
                Err(e) if port == 0 => {
                    debug!("udp bind collided on ephemeral port {}: {}", bound.port(), e);
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::other("failed to bind udp/tcp pair")))
    }

    fn start(tcp: TcpListener, udp: UdpSocket, bound: SocketAddr) -> Self {
        let udp = Arc::new(udp);
        let (shutdown_tx, _) = watch::channel(false);
        let (packet_tx, packet_rx) = mpsc::channel(PACKET_CHANNEL_DEPTH);
        let (stream_tx, stream_rx) = mpsc::channel(STREAM_CHANNEL_DEPTH);

        let mut tasks = Vec::with_capacity(2);

        let udp_reader = Arc::clone(&udp);
        let mut udp_shutdown = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut buf = vec![0u8; UDP_RECV_BUF];
            loop {
                tokio::select! {
                    _ = udp_shutdown.changed() => break,
                    recv = udp_reader.recv_from(&mut buf) => {
                        let (n, from) = match recv {
                            Ok(v) => v,
                            Err(e) => {
                                warn!("udp receive failed: {}", e);
                                continue;
                            }
                        };
                        if n == 0 {
                            continue;
                        }
                        let packet = Packet {
                            buf: buf[..n].to_vec(),
                            from,
                            timestamp: Instant::now(),
                        };
                        if packet_tx.try_send(packet).is_err() {
                            warn!("inbound packet queue full, dropping datagram from {}", from);
                        }
                    }
                }
            }
        }));

        let mut tcp_shutdown = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tcp_shutdown.changed() => break,
                    accepted = tcp.accept() => {
                        match accepted {
                            Ok((stream, from)) => {
                                if stream_tx.try_send((stream, from)).is_err() {
                                    warn!("inbound stream queue full, dropping connection from {}", from);
                                }
                            }
                            Err(e) => warn!("tcp accept failed: {}", e),
                        }
                    }
                }
            }
        }));

        Self {
            udp,
            bound,
            packets: Mutex::new(Some(packet_rx)),
            streams: Mutex::new(Some(stream_rx)),
            shutdown_tx,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.bound
    }
}

impl Transport for NetTransport {
    type Stream = TcpStream;

    fn final_advertise_addr(
        &self,
        ip: Option<IpAddr>,
        port: Option<u16>,
    ) -> io::Result<(IpAddr, u16)> {
        let port = port.unwrap_or(self.bound.port());
        if let Some(ip) = ip {
            return Ok((ip, port));
        }
        let bound_ip = self.bound.ip();
        if bound_ip.is_unspecified() {
            return Err(io::Error::other(
                "bound to a wildcard address; set an explicit advertise address",
            ));
        }
        Ok((bound_ip, port))
    }

    async fn write_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<Instant> {
        self.udp.send_to(buf, addr).await?;
        Ok(Instant::now())
    }

    async fn dial_timeout(&self, addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
        tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))?
    }

    fn packet_rx(&self) -> Option<mpsc::Receiver<Packet>> {
        self.packets.lock().unwrap().take()
    }

    fn stream_rx(&self) -> Option<mpsc::Receiver<(TcpStream, SocketAddr)>> {
        self.streams.lock().unwrap().take()
    }

    async fn shutdown(&self) -> io::Result<()> {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn loopback() -> NetTransport {
        NetTransport::bind("127.0.0.1".parse().unwrap(), 0)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_udp_round_trip() {
        let a = loopback().await;
        let b = loopback().await;
        let mut packets = b.packet_rx().unwrap();

        a.write_to(b"hello", b.local_addr()).await.unwrap();

        let packet = packets.recv().await.unwrap();
        assert_eq!(packet.buf, b"hello");
        assert_eq!(packet.from.port(), a.local_addr().port());

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_reaches_accept_loop() {
        let a = loopback().await;
        let b = loopback().await;
        let mut streams = b.stream_rx().unwrap();

        let _client = a
            .dial_timeout(b.local_addr(), Duration::from_secs(1))
            .await
            .unwrap();
        let (_server, from) = streams.recv().await.unwrap();
        assert_eq!(from.ip(), a.local_addr().ip());

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_advertise_resolution() {
        let t = loopback().await;
        let (ip, port) = t.final_advertise_addr(None, None).unwrap();
        assert_eq!(ip, t.local_addr().ip());
        assert_eq!(port, t.local_addr().port());

        let (ip, port) = t
            .final_advertise_addr(Some("10.1.2.3".parse().unwrap()), Some(9999))
            .unwrap();
        assert_eq!(ip, "10.1.2.3".parse::<IpAddr>().unwrap());
        assert_eq!(port, 9999);

        t.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_channels_yield_once() {
        let t = loopback().await;
        assert!(t.packet_rx().is_some());
        assert!(t.packet_rx().is_none());
        assert!(t.stream_rx().is_some());
        assert!(t.stream_rx().is_none());
        t.shutdown().await.unwrap();
    }
}
