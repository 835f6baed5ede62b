//! The virtual tunnel device collaborator.
//!
//! The device presents whole IP packets: one packet per read, at most the
//! device MTU, and one packet per write. Everything about interface
//! addressing and routing beyond bringing the interface up is left to the
//! operator.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tun::AsyncDevice;

use super::error::TunnelError;

/// Packet-at-a-time I/O on a tunnel device.
///
/// A seam over the real TUN interface so the role handlers and the engine
/// can run against in-memory fakes in tests.
#[async_trait]
pub trait PacketIo: Send {
    /// Reads one IP packet into `buf`, returning its length.
    async fn recv_packet(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes one IP packet, returning the number of bytes written.
    async fn send_packet(&mut self, packet: &[u8]) -> io::Result<usize>;
}

/// A TUN interface carrying the tunnelled traffic.
pub struct TunDevice {
    device: AsyncDevice,
    mtu: usize,
}

impl TunDevice {
    /// Creates the interface and brings it up.
    ///
    /// `mtu` is the device MTU, i.e. the largest IP packet the tunnel can
    /// carry (link MTU minus the IP and ICMP header overhead). Packet
    /// information is disabled so reads and writes are raw IP packets.
    pub fn open(name: Option<&str>, mtu: usize) -> Result<Self, TunnelError> {
        let mut config = tun::configure();
        if let Some(name) = name {
            config.name(name);
        }
        config.mtu(mtu as i32).up();
        #[cfg(target_os = "linux")]
        config.platform(|platform| {
            platform.packet_information(false);
        });

        let device = tun::create_as_async(&config)?;
        Ok(Self { device, mtu })
    }

    /// The largest IP packet this device will hand out in one read.
    pub fn mtu(&self) -> usize {
        self.mtu
    }
}

#[async_trait]
impl PacketIo for TunDevice {
    async fn recv_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.device.read(buf).await
    }

    async fn send_packet(&mut self, packet: &[u8]) -> io::Result<usize> {
        self.device.write(packet).await
    }
}
