//! The relay role: unwraps echo requests onto the tunnel device and
//! answers device traffic with echo replies to the last validated client.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::tunnel::codec::{self, EchoCodec, EchoKind};
use crate::tunnel::device::PacketIo;
use crate::tunnel::error::TunnelError;
use crate::tunnel::peer::Peer;
use crate::tunnel::socket::EchoTransport;

use super::RoleHandler;

pub struct ServerHandler {
    codec: EchoCodec,
    /// Last validated sender; replies go here. Last valid writer wins.
    client: Option<Ipv4Addr>,
}

impl ServerHandler {
    pub fn new() -> Self {
        Self {
            // The identifier is taken from the client on first contact.
            codec: EchoCodec::new(0),
            client: None,
        }
    }
}

impl Default for ServerHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<D: PacketIo, T: EchoTransport> RoleHandler<D, T> for ServerHandler {
    async fn on_tunnel_readable(
        &mut self,
        peer: &mut Peer<D, T>,
        packet: &[u8],
    ) -> Result<(), TunnelError> {
        let Some(client) = self.client else {
            debug!("no client established yet, dropping device packet");
            return Ok(());
        };
        let datagram = self.codec.encode(EchoKind::Reply, packet);
        peer.socket.send_to(&datagram, client).await?;
        Ok(())
    }

    async fn on_socket_readable(
        &mut self,
        peer: &mut Peer<D, T>,
        datagram: &[u8],
        source: Ipv4Addr,
    ) -> Result<(), TunnelError> {
        let echo = match codec::decode(datagram, EchoKind::Request) {
            Ok(echo) => echo,
            Err(error) => {
                debug!(%source, %error, "dropping datagram");
                return Ok(());
            }
        };

        // Any fully validated request captures the reply path, so the
        // relay follows a client whose address or identifier changed
        // mid-session.
        if self.client != Some(source) || self.codec.ident() != echo.ident {
            info!(client = %source, ident = echo.ident, "tunnelling for client");
            self.client = Some(source);
            self.codec.set_ident(echo.ident);
        }

        if !echo.payload.is_empty() {
            peer.device.send_packet(echo.payload).await?;
        }
        Ok(())
    }

    /// The relay is purely reactive; it never initiates probes.
    async fn on_timeout(&mut self, _peer: &mut Peer<D, T>) -> Result<(), TunnelError> {
        Ok(())
    }
}
