//! # icmptun: IP over ICMP echo
//!
//! **icmptun** tunnels arbitrary IP traffic between two hosts by disguising
//! it as ordinary ping traffic. A client wraps the packets read from a
//! virtual tunnel interface into ICMP echo requests and sends them to a
//! relay; the relay unwraps them onto its own tunnel interface and answers
//! with echo replies. Networks that permit ping but block everything else
//! will carry the tunnel.
//!
//! ## How it works
//!
//! 1. **Encapsulation**: each IP packet becomes the payload of an ICMP echo
//!    datagram (requests from the client, replies from the relay) with a
//!    per-session identifier and an increasing sequence number.
//! 2. **Forwarding**: a single-threaded loop multiplexes the tunnel device
//!    and a raw ICMP socket, tolerating the foreign ping traffic and the
//!    corruption a raw socket inevitably sees.
//! 3. **Punch-through**: while the tunnel is idle the client keeps probing
//!    the relay with empty echo requests so NAT and firewall state along
//!    the path never expires.
//!
//! Both ends need a virtual tunnel interface (created on startup) and a
//! raw ICMP socket, so they must run with the privileges for both.
//!
//! ## Warning
//!
//! The tunnel carries traffic in the clear: it hides *that* you are
//! tunnelling, not *what* you are tunnelling. Run something encrypted
//! inside it. The relay serves whichever correctly checksummed client
//! wrote last; it is meant for single-client deployments.

pub mod tunnel;
