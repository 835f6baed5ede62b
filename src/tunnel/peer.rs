//! The peer aggregate: the two I/O handles a tunnel endpoint owns.

use super::device::PacketIo;
use super::socket::EchoTransport;

/// The tunnel device and echo socket of the running endpoint.
///
/// Created once at startup, exclusively owned by the single execution
/// context for the life of the process, and destroyed at shutdown. Generic
/// over the collaborator seams so tests can substitute in-memory fakes.
pub struct Peer<D, T> {
    pub device: D,
    pub socket: T,
}

impl<D: PacketIo, T: EchoTransport> Peer<D, T> {
    pub fn new(device: D, socket: T) -> Self {
        Self { device, socket }
    }
}
