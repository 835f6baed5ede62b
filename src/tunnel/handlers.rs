//! Role-specific reactions to the three forwarding events.
//!
//! Exactly one handler variant is active per process: the client, which
//! originates echo requests towards a configured relay, or the server,
//! which answers the last validated client with echo replies. The variant
//! is chosen at startup and never changes.

use std::net::Ipv4Addr;

use async_trait::async_trait;

use super::device::PacketIo;
use super::error::TunnelError;
use super::peer::Peer;
use super::socket::EchoTransport;

pub mod client;
pub mod server;

pub use self::client::ClientHandler;
pub use self::server::ServerHandler;

/// The capability set the forwarding engine dispatches on.
///
/// Handlers run to completion before the engine waits again; fatal I/O
/// errors propagate, anything recoverable is dropped inside the handler.
#[async_trait]
pub trait RoleHandler<D: PacketIo, T: EchoTransport>: Send {
    /// Invoked once before the first wait.
    async fn on_startup(&mut self, _peer: &mut Peer<D, T>) -> Result<(), TunnelError> {
        Ok(())
    }

    /// One IP packet was read from the tunnel device.
    async fn on_tunnel_readable(
        &mut self,
        peer: &mut Peer<D, T>,
        packet: &[u8],
    ) -> Result<(), TunnelError>;

    /// One ICMP datagram was received on the echo socket.
    async fn on_socket_readable(
        &mut self,
        peer: &mut Peer<D, T>,
        datagram: &[u8],
        source: Ipv4Addr,
    ) -> Result<(), TunnelError>;

    /// The punch-through interval elapsed with no I/O readiness.
    async fn on_timeout(&mut self, peer: &mut Peer<D, T>) -> Result<(), TunnelError>;
}
