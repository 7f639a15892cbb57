//! Network primitives for the sonda ping engine
//!
//! The codec in [`icmp`] is pure byte-slice work; the [`transport`] module
//! owns the ICMP socket and its receive worker; [`resolve`] turns host
//! strings into IPv4 destinations.

pub mod icmp;
pub mod resolve;
pub mod transport;

pub use icmp::{EchoHeader, IcmpError, Ipv4Header, Verdict};
pub use resolve::resolve_ipv4;
pub use transport::{
    Datagram, RawTransportFactory, Transport, TransportConfig, TransportError, TransportFactory,
    WorkerMode,
};
