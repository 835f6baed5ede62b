//! The client role: wraps device traffic in echo requests and keeps the
//! NAT/firewall path to the relay alive while the tunnel is idle.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::tunnel::codec::{self, EchoCodec, EchoKind};
use crate::tunnel::device::PacketIo;
use crate::tunnel::error::TunnelError;
use crate::tunnel::peer::Peer;
use crate::tunnel::socket::EchoTransport;

use super::RoleHandler;

/// Number of keepalive probes sent on startup to open NAT/firewall state.
pub const PUNCHTHRU_WINDOW: usize = 10;

pub struct ClientHandler {
    codec: EchoCodec,
    /// The relay every request is addressed to.
    server: Ipv4Addr,
    interval: Duration,
    /// Refreshed by data sends and validated replies, not by probes.
    last_activity: Instant,
}

impl ClientHandler {
    pub fn new(ident: u16, server: Ipv4Addr, interval: Duration) -> Self {
        Self {
            codec: EchoCodec::new(ident),
            server,
            interval,
            last_activity: Instant::now(),
        }
    }

    async fn send_probe<T: EchoTransport>(&mut self, socket: &mut T) -> Result<(), TunnelError> {
        let probe = self.codec.encode(EchoKind::Request, &[]);
        socket.send_to(&probe, self.server).await?;
        Ok(())
    }
}

#[async_trait]
impl<D: PacketIo, T: EchoTransport> RoleHandler<D, T> for ClientHandler {
    async fn on_startup(&mut self, peer: &mut Peer<D, T>) -> Result<(), TunnelError> {
        info!(server = %self.server, "opening punch-through window");
        for _ in 0..PUNCHTHRU_WINDOW {
            self.send_probe(&mut peer.socket).await?;
        }
        Ok(())
    }

    async fn on_tunnel_readable(
        &mut self,
        peer: &mut Peer<D, T>,
        packet: &[u8],
    ) -> Result<(), TunnelError> {
        let datagram = self.codec.encode(EchoKind::Request, packet);
        peer.socket.send_to(&datagram, self.server).await?;
        self.last_activity = Instant::now();
        Ok(())
    }

    async fn on_socket_readable(
        &mut self,
        peer: &mut Peer<D, T>,
        datagram: &[u8],
        source: Ipv4Addr,
    ) -> Result<(), TunnelError> {
        let echo = match codec::decode(datagram, EchoKind::Reply) {
            Ok(echo) => echo,
            Err(error) => {
                debug!(%source, %error, "dropping datagram");
                return Ok(());
            }
        };
        if echo.ident != self.codec.ident() {
            debug!(%source, ident = echo.ident, "dropping reply for another session");
            return Ok(());
        }
        if source != self.server {
            debug!(%source, "dropping reply from an unexpected sender");
            return Ok(());
        }

        self.last_activity = Instant::now();
        if !echo.payload.is_empty() {
            peer.device.send_packet(echo.payload).await?;
        }
        Ok(())
    }

    async fn on_timeout(&mut self, peer: &mut Peer<D, T>) -> Result<(), TunnelError> {
        if self.last_activity.elapsed() >= self.interval {
            debug!("tunnel idle, sending keepalive probe");
            self.send_probe(&mut peer.socket).await?;
        }
        Ok(())
    }
}
