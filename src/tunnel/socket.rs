//! The raw ICMP socket collaborator.
//!
//! A raw ICMPv4 socket delivers every ICMP datagram the host receives,
//! prefixed with the IPv4 header. This module hides both facts: `recv`
//! hands out bare ICMP datagrams with their source address, after applying
//! the TTL guard and dropping anything too large to be one of ours.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::Range;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use super::codec::{EchoKind, ICMP_HEADER_LEN};

// Matching the kernel headers; not exported by libc on every target.
const SOL_RAW: libc::c_int = 255;
const ICMP_FILTER: libc::c_int = 1;

/// Minimum length of an IPv4 header.
const IPV4_HEADER_MIN: usize = 20;

/// Datagram-at-a-time I/O on the ICMP transport.
///
/// Implemented by the real raw socket and by in-memory fakes in tests.
#[async_trait]
pub trait EchoTransport: Send {
    /// Receives one ICMP datagram into the front of `buf`, returning its
    /// length and the sender's address. The IP header is not included.
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<(usize, Ipv4Addr)>;

    /// Sends one ICMP datagram to `dst`.
    async fn send_to(&mut self, datagram: &[u8], dst: Ipv4Addr) -> io::Result<usize>;
}

/// A raw ICMPv4 socket speaking the echo encapsulation.
pub struct EchoSocket {
    socket: UdpSocket,
    max_payload: usize,
    /// Incoming datagrams with an IP TTL below this are dropped.
    min_ttl: u8,
}

impl EchoSocket {
    /// Opens the raw socket and applies the role's receive filters.
    ///
    /// `expected` is the echo type this role accepts; on Linux it is also
    /// installed as a kernel-side `ICMP_FILTER` so unrelated ICMP traffic
    /// never reaches userspace. `ttl_guard` enables the TTL security
    /// mechanism: outgoing datagrams leave with TTL 255 and incoming ones
    /// must arrive within the given number of hops.
    pub fn open(
        expected: EchoKind,
        max_payload: usize,
        ttl_guard: Option<u8>,
    ) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
        socket.set_nonblocking(true)?;

        if let Err(error) = set_kernel_icmp_filter(&socket, expected) {
            // Decode rejects unexpected types anyway; the kernel filter
            // only saves wakeups.
            warn!(%error, "kernel ICMP type filter unavailable, filtering in userspace");
        }

        let mut min_ttl = 0;
        if let Some(hops) = ttl_guard {
            socket.set_ttl(255)?;
            min_ttl = 255u8.saturating_sub(hops);
        }

        let socket = UdpSocket::from_std(std::net::UdpSocket::from(socket))?;
        Ok(Self {
            socket,
            max_payload,
            min_ttl,
        })
    }
}

#[async_trait]
impl EchoTransport for EchoSocket {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<(usize, Ipv4Addr)> {
        loop {
            let (len, addr) = self.socket.recv_from(buf).await?;
            let source = match addr {
                SocketAddr::V4(v4) => *v4.ip(),
                SocketAddr::V6(_) => continue,
            };

            let Some(datagram) = filter_datagram(&buf[..len], self.min_ttl, self.max_payload)
            else {
                continue;
            };

            let datagram_len = datagram.len();
            buf.copy_within(datagram, 0);
            return Ok((datagram_len, source));
        }
    }

    async fn send_to(&mut self, datagram: &[u8], dst: Ipv4Addr) -> io::Result<usize> {
        self.socket
            .send_to(datagram, SocketAddr::new(IpAddr::V4(dst), 0))
            .await
    }
}

/// Receive filter applied to every raw datagram before decode.
///
/// The raw socket prepends the IPv4 header, so this locates the ICMP
/// datagram inside `raw` and returns its range, or `None` for anything to
/// drop: a truncated or malformed IP header, a sender outside the TTL
/// guard, or a datagram whose payload could not fit one tunnelled packet.
fn filter_datagram(raw: &[u8], min_ttl: u8, max_payload: usize) -> Option<Range<usize>> {
    if raw.len() < IPV4_HEADER_MIN {
        debug!(len = raw.len(), "dropping truncated IP datagram");
        return None;
    }
    let header_len = usize::from(raw[0] & 0x0f) * 4;
    if header_len < IPV4_HEADER_MIN || raw.len() < header_len {
        debug!(len = raw.len(), header_len, "dropping malformed IP datagram");
        return None;
    }

    let ttl = raw[8];
    if ttl < min_ttl {
        debug!(ttl, min_ttl, "dropping datagram outside the TTL guard");
        return None;
    }

    let datagram_len = raw.len() - header_len;
    if datagram_len > ICMP_HEADER_LEN + max_payload {
        debug!(datagram_len, "dropping oversized datagram");
        return None;
    }

    Some(header_len..raw.len())
}

/// Asks the kernel to queue only the echo type this role expects.
fn set_kernel_icmp_filter(socket: &Socket, expected: EchoKind) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    // A set bit filters the corresponding ICMP type out.
    let mask: u32 = !(1u32 << expected.wire_type());
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            SOL_RAW,
            ICMP_FILTER,
            &mask as *const u32 as *const libc::c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A raw datagram as the socket delivers it: IPv4 header of the given
    /// length, then `icmp_len` bytes of ICMP.
    fn raw_datagram(header_len: usize, ttl: u8, icmp_len: usize) -> Vec<u8> {
        let mut raw = vec![0u8; header_len + icmp_len];
        raw[0] = 0x40 | (header_len / 4) as u8;
        raw[8] = ttl;
        raw
    }

    const MAX_PAYLOAD: usize = 1472;

    #[test]
    fn valid_datagram_is_stripped_to_the_icmp_part() {
        let raw = raw_datagram(IPV4_HEADER_MIN, 64, ICMP_HEADER_LEN + 4);
        let range = filter_datagram(&raw, 0, MAX_PAYLOAD).unwrap();
        assert_eq!(range, IPV4_HEADER_MIN..raw.len());
    }

    #[test]
    fn header_options_are_stripped_too() {
        let raw = raw_datagram(24, 64, ICMP_HEADER_LEN);
        let range = filter_datagram(&raw, 0, MAX_PAYLOAD).unwrap();
        assert_eq!(range, 24..raw.len());
    }

    #[test]
    fn keepalive_sized_datagram_passes() {
        let raw = raw_datagram(IPV4_HEADER_MIN, 64, ICMP_HEADER_LEN);
        assert!(filter_datagram(&raw, 0, MAX_PAYLOAD).is_some());
    }

    #[test]
    fn truncated_ip_header_is_dropped() {
        let raw = raw_datagram(IPV4_HEADER_MIN, 64, 0);
        assert_eq!(filter_datagram(&raw[..12], 0, MAX_PAYLOAD), None);
        assert_eq!(filter_datagram(&[], 0, MAX_PAYLOAD), None);
    }

    #[test]
    fn malformed_ihl_is_dropped() {
        // IHL of 3 words claims a 12-byte header, below the IPv4 minimum.
        let mut raw = raw_datagram(IPV4_HEADER_MIN, 64, ICMP_HEADER_LEN);
        raw[0] = 0x43;
        assert_eq!(filter_datagram(&raw, 0, MAX_PAYLOAD), None);

        // IHL pointing past the end of the datagram.
        let mut raw = raw_datagram(IPV4_HEADER_MIN, 64, 0);
        raw[0] = 0x4f;
        assert_eq!(filter_datagram(&raw, 0, MAX_PAYLOAD), None);
    }

    #[test]
    fn ttl_guard_drops_distant_senders() {
        let min_ttl = 250;
        let raw = raw_datagram(IPV4_HEADER_MIN, 249, ICMP_HEADER_LEN);
        assert_eq!(filter_datagram(&raw, min_ttl, MAX_PAYLOAD), None);

        // A sender within the allowed hop count passes.
        let raw = raw_datagram(IPV4_HEADER_MIN, 250, ICMP_HEADER_LEN);
        assert!(filter_datagram(&raw, min_ttl, MAX_PAYLOAD).is_some());
    }

    #[test]
    fn oversized_datagram_is_dropped_before_decode() {
        let raw = raw_datagram(IPV4_HEADER_MIN, 64, ICMP_HEADER_LEN + MAX_PAYLOAD + 1);
        assert_eq!(filter_datagram(&raw, 0, MAX_PAYLOAD), None);

        // The largest envelope the link can carry still passes.
        let raw = raw_datagram(IPV4_HEADER_MIN, 64, ICMP_HEADER_LEN + MAX_PAYLOAD);
        assert!(filter_datagram(&raw, 0, MAX_PAYLOAD).is_some());
    }
}
