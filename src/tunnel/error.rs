use std::io;

/// Fatal conditions that stop the forwarding loop.
///
/// The tunnel device and the raw socket are essential resources; once
/// either fails the tunnel can no longer function and the error is
/// propagated to the caller. Recoverable conditions (foreign or corrupted
/// datagrams) never surface here, they are dropped inside the handlers.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("tunnel device error: {0}")]
    Device(#[from] tun::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
