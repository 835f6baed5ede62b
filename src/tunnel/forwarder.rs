//! The forwarding engine: one readiness wait per iteration, dispatching
//! to the active role handler.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::device::PacketIo;
use super::error::TunnelError;
use super::handlers::RoleHandler;
use super::peer::Peer;
use super::socket::EchoTransport;

/// Largest datagram a raw socket can deliver; foreign ICMP traffic may be
/// arbitrarily sized, so the receive buffer does not assume our MTU.
const MAX_DATAGRAM: usize = 64 * 1024;

/// What a single readiness wait resolved to.
enum Event {
    Shutdown,
    Socket(usize, Ipv4Addr),
    Tunnel(usize),
    Timeout,
}

/// Pushes packets between the tunnel device and the echo socket until a
/// fatal I/O error or a shutdown request.
///
/// Strictly single-threaded and cooperative: each iteration blocks on one
/// `select!` over the cancellation token, the socket, the device and the
/// punch-through timer, in that priority order, then runs exactly one
/// handler to completion. The two I/O sources are fixed for the lifetime
/// of the loop; the readiness set is never rebuilt from dynamic state.
///
/// Shutdown is not an error: a cancelled token ends the loop with
/// `Ok(())` without processing further packets.
pub async fn forward<D, T, H>(
    peer: &mut Peer<D, T>,
    handler: &mut H,
    interval: Duration,
    mtu: usize,
    shutdown: &CancellationToken,
) -> Result<(), TunnelError>
where
    D: PacketIo,
    T: EchoTransport,
    H: RoleHandler<D, T>,
{
    handler.on_startup(peer).await?;

    let mut datagram_buf = vec![0u8; MAX_DATAGRAM];
    let mut packet_buf = vec![0u8; mtu];

    let mut ticks = time::interval_at(Instant::now() + interval, interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!("forwarding loop running");
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Event::Shutdown,
            received = peer.socket.recv(&mut datagram_buf) => {
                let (len, source) = received?;
                Event::Socket(len, source)
            }
            read = peer.device.recv_packet(&mut packet_buf) => Event::Tunnel(read?),
            _ = ticks.tick() => Event::Timeout,
        };

        match event {
            Event::Shutdown => {
                info!("shutdown requested, stopping the forwarding loop");
                return Ok(());
            }
            Event::Socket(len, source) => {
                handler
                    .on_socket_readable(peer, &datagram_buf[..len], source)
                    .await?;
            }
            Event::Tunnel(len) => {
                handler.on_tunnel_readable(peer, &packet_buf[..len]).await?;
            }
            Event::Timeout => {
                handler.on_timeout(peer).await?;
            }
        }
    }
}
