//! Raw-socket transport
//!
//! Owns exactly one ICMP socket per session. Opening tries an unprivileged
//! DGRAM ICMP socket first (available on Linux when `ping_group_range`
//! permits) and falls back to a RAW socket. Inbound datagrams are
//! timestamped on arrival and pushed through an mpsc channel to the
//! session; the receive worker runs either as a task on the caller's
//! runtime or on a dedicated OS thread with its own single-threaded
//! runtime.

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Largest datagram the receive loop will accept (IP header included)
const MAX_DATAGRAM_LEN: usize = 2048;

/// Transport-layer failures.
///
/// Send failures are per-probe data for the session, not session-fatal;
/// open and socket-option failures abort the open.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to open ICMP socket: {0}")]
    Open(#[source] io::Error),

    #[error("socket option {option} failed: {source}")]
    SocketOption {
        option: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("send failed: {0}")]
    Send(#[source] io::Error),

    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),

    #[error("transport is closed")]
    Closed,
}

impl TransportError {
    /// The underlying OS error code, when one exists
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Self::Open(source) | Self::SocketOption { source, .. } | Self::Send(source) => {
                source.raw_os_error()
            }
            Self::SendTimeout(_) | Self::Closed => None,
        }
    }
}

/// One inbound datagram, stamped at the moment the socket handed it over
#[derive(Debug, Clone)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub received_at: Instant,
}

/// Where the receive worker runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkerMode {
    /// A task on the runtime that opened the transport
    #[default]
    Shared,
    /// A dedicated OS thread with its own single-threaded runtime, keeping
    /// socket latency away from the caller's executor
    Dedicated,
}

/// Transport tuning shared by every probe of a session
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub ttl: Option<u32>,
    pub send_timeout: Duration,
    pub worker: WorkerMode,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ttl: None,
            send_timeout: Duration::from_secs(1),
            worker: WorkerMode::Shared,
        }
    }
}

/// An open, sendable ping transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transmit one datagram to the destination, bounded by the configured
    /// send timeout.
    async fn send(&self, packet: &[u8]) -> Result<(), TransportError>;

    /// True when the transport layer already demultiplexes conversations
    /// by ICMP identifier (DGRAM ICMP sockets, where the kernel rewrites
    /// the field and only delivers matching replies).
    fn filters_identifier(&self) -> bool {
        false
    }

    /// Tear the transport down. Idempotent and callable from any context;
    /// the socket is released exactly once.
    fn close(&self);
}

/// Opens transports; lets tests substitute an in-memory implementation.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a transport whose inbound datagrams flow into `inbound`.
    async fn open(
        &self,
        inbound: mpsc::Sender<Datagram>,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

/// Factory for the real ICMP socket transport
pub struct RawTransportFactory {
    destination: Ipv4Addr,
    config: TransportConfig,
}

impl RawTransportFactory {
    pub fn new(destination: Ipv4Addr, config: TransportConfig) -> Self {
        Self {
            destination,
            config,
        }
    }
}

#[async_trait]
impl TransportFactory for RawTransportFactory {
    async fn open(
        &self,
        inbound: mpsc::Sender<Datagram>,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let (socket, is_dgram) = open_icmp_socket()?;

        // Raw sockets must never bring the process down with SIGPIPE
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        socket
            .set_nosigpipe(true)
            .map_err(|source| TransportError::SocketOption {
                option: "SO_NOSIGPIPE",
                source,
            })?;

        if let Some(ttl) = self.config.ttl {
            socket
                .set_ttl(ttl)
                .map_err(|source| TransportError::SocketOption {
                    option: "IP_TTL",
                    source,
                })?;
        }

        let recv_socket = socket.try_clone().map_err(TransportError::Open)?;
        let cancel = CancellationToken::new();

        match self.config.worker {
            WorkerMode::Shared => {
                let fd = AsyncFd::new(recv_socket).map_err(TransportError::Open)?;
                tokio::spawn(recv_loop(fd, inbound, cancel.clone()));
            }
            WorkerMode::Dedicated => {
                let cancel_worker = cancel.clone();
                // Detached on purpose; the worker exits when the token fires
                let _worker = std::thread::Builder::new()
                    .name("sonda-transport".to_string())
                    .spawn(move || {
                        let runtime = match tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                        {
                            Ok(runtime) => runtime,
                            Err(e) => {
                                warn!("transport worker runtime failed: {}", e);
                                return;
                            }
                        };
                        runtime.block_on(async move {
                            match AsyncFd::new(recv_socket) {
                                Ok(fd) => recv_loop(fd, inbound, cancel_worker).await,
                                Err(e) => warn!("transport worker registration failed: {}", e),
                            }
                        });
                    })
                    .map_err(TransportError::Open)?;
            }
        }

        let sender = AsyncFd::new(socket).map_err(TransportError::Open)?;
        debug!(
            destination = %self.destination,
            dgram = is_dgram,
            worker = ?self.config.worker,
            "transport open"
        );

        Ok(Box::new(RawTransport {
            sender,
            destination: SocketAddr::new(IpAddr::V4(self.destination), 0),
            send_timeout: self.config.send_timeout,
            is_dgram,
            closed: AtomicBool::new(false),
            cancel,
        }))
    }
}

/// The real ICMP socket transport
pub struct RawTransport {
    sender: AsyncFd<Socket>,
    destination: SocketAddr,
    send_timeout: Duration,
    is_dgram: bool,
    closed: AtomicBool,
    cancel: CancellationToken,
}

#[async_trait]
impl Transport for RawTransport {
    async fn send(&self, packet: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let dest = self.destination.into();
        let attempt = async {
            loop {
                let mut guard = self.sender.writable().await?;
                match guard.try_io(|inner| inner.get_ref().send_to(packet, &dest)) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        };

        match tokio::time::timeout(self.send_timeout, attempt).await {
            Ok(Ok(n)) => {
                trace!(bytes = n, "echo request sent");
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::Send(e)),
            Err(_) => Err(TransportError::SendTimeout(self.send_timeout)),
        }
    }

    fn filters_identifier(&self) -> bool {
        self.is_dgram
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
            debug!("transport closed");
        }
    }
}

impl Drop for RawTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Create an ICMP socket, preferring the unprivileged DGRAM flavor
fn open_icmp_socket() -> Result<(Socket, bool), TransportError> {
    if let Ok(socket) = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)) {
        set_nonblocking(&socket)?;
        trace!("created unprivileged DGRAM ICMP socket");
        return Ok((socket, true));
    }

    let socket =
        Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).map_err(TransportError::Open)?;
    set_nonblocking(&socket)?;
    trace!("created privileged RAW ICMP socket");
    Ok((socket, false))
}

fn set_nonblocking(socket: &Socket) -> Result<(), TransportError> {
    socket
        .set_nonblocking(true)
        .map_err(|source| TransportError::SocketOption {
            option: "O_NONBLOCK",
            source,
        })
}

/// Receive worker: read datagrams off the socket, drop exact-duplicate
/// redeliveries, push the rest to the session.
async fn recv_loop(fd: AsyncFd<Socket>, inbound: mpsc::Sender<Datagram>, cancel: CancellationToken) {
    let mut buf = [0u8; MAX_DATAGRAM_LEN];
    let mut last_delivered: Option<Vec<u8>> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            guard = fd.readable() => {
                let mut guard = match guard {
                    Ok(guard) => guard,
                    Err(e) => {
                        warn!("socket readiness wait failed: {}", e);
                        break;
                    }
                };

                match guard.try_io(|inner| {
                    // socket2's recv_from requires an uninit buffer
                    let maybe_uninit_buf = unsafe {
                        std::mem::transmute::<&mut [u8], &mut [std::mem::MaybeUninit<u8>]>(
                            &mut buf[..],
                        )
                    };
                    inner.get_ref().recv_from(maybe_uninit_buf)
                }) {
                    Ok(Ok((len, _from))) => {
                        let bytes = buf[..len].to_vec();
                        if is_duplicate(&last_delivered, &bytes) {
                            trace!(len, "dropping redelivered duplicate datagram");
                            continue;
                        }
                        last_delivered = Some(bytes.clone());

                        let datagram = Datagram {
                            bytes,
                            received_at: Instant::now(),
                        };
                        if inbound.send(datagram).await.is_err() {
                            // Session side hung up
                            break;
                        }
                    }
                    Ok(Err(e)) => match e.kind() {
                        io::ErrorKind::PermissionDenied
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::NotConnected => {
                            warn!("receive loop stopping: {}", e);
                            break;
                        }
                        _ => {
                            debug!("transient receive error: {}", e);
                            continue;
                        }
                    },
                    Err(_would_block) => continue,
                }
            }
        }
    }

    trace!("receive loop finished");
}

fn is_duplicate(last: &Option<Vec<u8>>, bytes: &[u8]) -> bool {
    last.as_deref().is_some_and(|previous| previous == bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_detection_is_consecutive_only() {
        let mut last = None;
        assert!(!is_duplicate(&last, b"aa"));
        last = Some(b"aa".to_vec());

        assert!(is_duplicate(&last, b"aa"));
        assert!(!is_duplicate(&last, b"ab"));

        last = Some(b"ab".to_vec());
        assert!(!is_duplicate(&last, b"aa"));
    }

    #[test]
    fn test_socket_creation() {
        // Needs either ping_group_range or CAP_NET_RAW; skip where the
        // environment grants neither.
        match open_icmp_socket() {
            Ok((_, dgram)) => {
                println!("created {} ICMP socket", if dgram { "DGRAM" } else { "RAW" });
            }
            Err(e) if is_permission(&e) => {
                println!("skipping test: permission denied");
            }
            Err(e) => panic!("failed to create socket: {}", e),
        }
    }

    fn is_permission(e: &TransportError) -> bool {
        matches!(e, TransportError::Open(source)
            if source.kind() == io::ErrorKind::PermissionDenied)
    }
}
