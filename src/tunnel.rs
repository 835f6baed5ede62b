//! The tunnel core: encapsulation codec, role handlers and the
//! forwarding engine, plus the two I/O collaborators they drive.

pub mod codec;
pub mod device;
pub mod error;
pub mod forwarder;
pub mod handlers;
pub mod peer;
pub mod socket;

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use self::codec::EchoKind;
use self::device::TunDevice;
use self::error::TunnelError;
use self::forwarder::forward;
use self::handlers::{ClientHandler, ServerHandler};
use self::peer::Peer;
use self::socket::EchoSocket;

/// Overhead of one encapsulated packet on the wire: the outer IPv4 header
/// plus the ICMP echo header.
pub const ENCAPSULATION_OVERHEAD: usize = 20 + codec::ICMP_HEADER_LEN;

/// Which side of the tunnel this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelRole {
    /// Originates echo requests towards the relay at this address.
    Client { server: Ipv4Addr },
    /// Answers the last validated client with echo replies.
    Server,
}

/// Everything the tunnel core needs to run; assembled by the CLI.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub role: TunnelRole,
    /// Tunnel interface name; the platform picks one if absent.
    pub tun_name: Option<String>,
    /// MTU of the underlying link the echo datagrams traverse.
    pub link_mtu: usize,
    /// Echo identifier for client-originated envelopes.
    pub ident: u16,
    /// Punch-through interval: the keepalive cadence and the engine's
    /// wait timeout.
    pub interval: Duration,
    /// TTL security: drop datagrams that travelled more than this many
    /// hops. Disabled if absent.
    pub ttl_guard: Option<u8>,
}

impl TunnelConfig {
    /// Largest IP packet that fits in one envelope on this link.
    pub fn max_payload(&self) -> usize {
        self.link_mtu.saturating_sub(ENCAPSULATION_OVERHEAD)
    }
}

/// Opens the collaborators and runs the forwarding loop until a fatal
/// error or until `shutdown` is cancelled.
pub async fn run_tunnel(
    config: TunnelConfig,
    shutdown: CancellationToken,
) -> Result<(), TunnelError> {
    let expected = match config.role {
        TunnelRole::Client { .. } => EchoKind::Reply,
        TunnelRole::Server => EchoKind::Request,
    };

    let device = TunDevice::open(config.tun_name.as_deref(), config.max_payload())?;
    let socket = EchoSocket::open(expected, config.max_payload(), config.ttl_guard)?;
    let mtu = device.mtu();
    let mut peer = Peer::new(device, socket);

    match config.role {
        TunnelRole::Client { server } => {
            info!(%server, mtu, "starting tunnel client");
            let mut handler = ClientHandler::new(config.ident, server, config.interval);
            forward(&mut peer, &mut handler, config.interval, mtu, &shutdown).await
        }
        TunnelRole::Server => {
            info!(mtu, "starting tunnel server");
            let mut handler = ServerHandler::new();
            forward(&mut peer, &mut handler, config.interval, mtu, &shutdown).await
        }
    }
}
