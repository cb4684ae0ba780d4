//! Datagram transport for encoded voice frames

pub mod udp;

pub use udp::{decode_wire, encode_wire, TransportStats, UdpTransport};
