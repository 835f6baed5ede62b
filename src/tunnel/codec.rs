//! Encapsulation of IP packets inside ICMP echo datagrams.
//!
//! The codec is pure: it only transforms bytes and keeps the per-session
//! identifier and sequence counter. All I/O happens elsewhere.

use thiserror::Error;

/// Size of the ICMP echo header: type, code, checksum, identifier, sequence.
pub const ICMP_HEADER_LEN: usize = 8;

/// ICMP message type of an echo request (sent by the client role).
pub const ICMP_ECHO_REQUEST: u8 = 8;

/// ICMP message type of an echo reply (sent by the relay role).
pub const ICMP_ECHO_REPLY: u8 = 0;

/// Which side of the tunnel an envelope belongs to.
///
/// The client only ever emits requests and the relay only ever emits
/// replies, so the kind doubles as the expected type when decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoKind {
    Request,
    Reply,
}

impl EchoKind {
    /// The ICMP type byte carried on the wire for this kind.
    pub fn wire_type(self) -> u8 {
        match self {
            EchoKind::Request => ICMP_ECHO_REQUEST,
            EchoKind::Reply => ICMP_ECHO_REPLY,
        }
    }
}

/// Reasons a received datagram is not attributable to the tunnel.
///
/// None of these are fatal: the raw socket sees every ICMP datagram the
/// host receives, so truncated, corrupted and unrelated traffic is
/// expected and simply dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("datagram shorter than the ICMP echo header")]
    TruncatedPacket,
    #[error("ICMP checksum mismatch")]
    ChecksumMismatch,
    #[error("unexpected ICMP type or code")]
    UnexpectedIcmpType,
}

/// A successfully decoded echo datagram.
///
/// An empty payload is a keepalive probe: valid, but carrying nothing to
/// forward to the tunnel device.
#[derive(Debug, PartialEq, Eq)]
pub struct Echo<'a> {
    pub ident: u16,
    pub seq: u16,
    pub payload: &'a [u8],
}

/// Builds echo datagrams for one session.
pub struct EchoCodec {
    ident: u16,
    seq: u16,
}

impl EchoCodec {
    pub fn new(ident: u16) -> Self {
        Self { ident, seq: 0 }
    }

    /// The session identifier stamped on every envelope.
    pub fn ident(&self) -> u16 {
        self.ident
    }

    /// Adopts a new session identifier.
    ///
    /// The relay stamps replies with the identifier of the client it is
    /// currently serving.
    pub fn set_ident(&mut self, ident: u16) {
        self.ident = ident;
    }

    /// Wraps `payload` in an ICMP echo header of the given kind.
    ///
    /// The sequence number increments (wrapping) on every call, keepalive
    /// probes included. An empty payload produces a keepalive probe.
    pub fn encode(&mut self, kind: EchoKind, payload: &[u8]) -> Vec<u8> {
        self.seq = self.seq.wrapping_add(1);

        let mut datagram = Vec::with_capacity(ICMP_HEADER_LEN + payload.len());
        datagram.push(kind.wire_type());
        datagram.push(0); // code
        datagram.extend_from_slice(&[0, 0]); // checksum placeholder
        datagram.extend_from_slice(&self.ident.to_be_bytes());
        datagram.extend_from_slice(&self.seq.to_be_bytes());
        datagram.extend_from_slice(payload);

        let sum = checksum(&datagram);
        datagram[2..4].copy_from_slice(&sum.to_be_bytes());
        datagram
    }
}

/// Parses and validates an echo datagram of the expected kind.
///
/// Validation order: length, checksum, then type/code. A datagram failing
/// the checksum is foreign or corrupted; a well-formed datagram of the
/// wrong type is ordinary ping traffic meant for someone else.
pub fn decode(datagram: &[u8], expected: EchoKind) -> Result<Echo<'_>, CodecError> {
    if datagram.len() < ICMP_HEADER_LEN {
        return Err(CodecError::TruncatedPacket);
    }

    let stored = u16::from_be_bytes([datagram[2], datagram[3]]);
    if checksum(datagram) != stored {
        return Err(CodecError::ChecksumMismatch);
    }

    if datagram[0] != expected.wire_type() || datagram[1] != 0 {
        return Err(CodecError::UnexpectedIcmpType);
    }

    Ok(Echo {
        ident: u16::from_be_bytes([datagram[4], datagram[5]]),
        seq: u16::from_be_bytes([datagram[6], datagram[7]]),
        payload: &datagram[ICMP_HEADER_LEN..],
    })
}

/// Standard 16-bit one's-complement internet checksum over `data`, with
/// the checksum field itself (bytes 2..4) treated as zero.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    for (i, chunk) in data.chunks(2).enumerate() {
        if i == 1 {
            // The checksum field is zero during computation.
            continue;
        }
        let word = match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from_be_bytes([*hi, 0]),
            _ => unreachable!(),
        };
        sum += u32::from(word);
    }
    while sum > 0xffff {
        sum = (sum >> 16) + (sum & 0xffff);
    }
    !(sum as u16)
}
