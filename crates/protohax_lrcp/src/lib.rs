#![doc = include_str!("../README.md")]

use std::net::SocketAddr;

pub mod endpoint;
pub mod escape;
pub mod reverse;
pub mod server;
pub mod session;
pub mod wire;

/// A datagram ready to be handed to the transport for sending.
///
/// The protocol core never touches a socket; it expresses everything it
/// wants to send as a sequence of these, pushed into a caller-provided
/// queue. Sends are best-effort - if the transport drops one, the peer's
/// retransmission (or ours) recovers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    /// Address to send `datagram` to.
    pub peer: SocketAddr,
    /// Full encoded LRCP packet.
    pub datagram: Vec<u8>,
}
