//! End-to-end scenarios driving the forwarding engine for both roles
//! through in-memory collaborators.

use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use icmptun::tunnel::codec::{decode, EchoKind};
use icmptun::tunnel::device::PacketIo;
use icmptun::tunnel::error::TunnelError;
use icmptun::tunnel::forwarder::forward;
use icmptun::tunnel::handlers::client::PUNCHTHRU_WINDOW;
use icmptun::tunnel::handlers::{ClientHandler, ServerHandler};
use icmptun::tunnel::peer::Peer;
use icmptun::tunnel::socket::EchoTransport;

const CLIENT_ADDR: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 7);
const SERVER_ADDR: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
const IDENT: u16 = 0x4242;
const MTU: usize = 1472;

/// A tunnel device backed by channels: packets pushed into `feed` come
/// out of reads, written packets appear on the paired receiver.
struct ChannelDevice {
    feed: mpsc::UnboundedReceiver<Vec<u8>>,
    written: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl PacketIo for ChannelDevice {
    async fn recv_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.feed.recv().await {
            Some(packet) => {
                buf[..packet.len()].copy_from_slice(&packet);
                Ok(packet.len())
            }
            // A closed feed means the test is done with this side.
            None => std::future::pending().await,
        }
    }

    async fn send_packet(&mut self, packet: &[u8]) -> io::Result<usize> {
        let _ = self.written.send(packet.to_vec());
        Ok(packet.len())
    }
}

/// An echo transport backed by channels, capturing everything sent.
struct ChannelTransport {
    feed: mpsc::UnboundedReceiver<(Vec<u8>, Ipv4Addr)>,
    sent: mpsc::UnboundedSender<(Vec<u8>, Ipv4Addr)>,
}

#[async_trait]
impl EchoTransport for ChannelTransport {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<(usize, Ipv4Addr)> {
        match self.feed.recv().await {
            Some((datagram, source)) => {
                buf[..datagram.len()].copy_from_slice(&datagram);
                Ok((datagram.len(), source))
            }
            None => std::future::pending().await,
        }
    }

    async fn send_to(&mut self, datagram: &[u8], dst: Ipv4Addr) -> io::Result<usize> {
        let _ = self.sent.send((datagram.to_vec(), dst));
        Ok(datagram.len())
    }
}

/// One running endpoint plus the test's handles onto its I/O.
struct Endpoint {
    device_feed: mpsc::UnboundedSender<Vec<u8>>,
    device_written: mpsc::UnboundedReceiver<Vec<u8>>,
    wire_feed: mpsc::UnboundedSender<(Vec<u8>, Ipv4Addr)>,
    wire_sent: mpsc::UnboundedReceiver<(Vec<u8>, Ipv4Addr)>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), TunnelError>>,
}

fn spawn_client(interval: Duration) -> Endpoint {
    let (device_feed, feed_rx) = mpsc::unbounded_channel();
    let (written_tx, device_written) = mpsc::unbounded_channel();
    let (wire_feed, wire_rx) = mpsc::unbounded_channel();
    let (sent_tx, wire_sent) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();

    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        let mut peer = Peer::new(
            ChannelDevice {
                feed: feed_rx,
                written: written_tx,
            },
            ChannelTransport {
                feed: wire_rx,
                sent: sent_tx,
            },
        );
        let mut handler = ClientHandler::new(IDENT, SERVER_ADDR, interval);
        forward(&mut peer, &mut handler, interval, MTU, &token).await
    });

    Endpoint {
        device_feed,
        device_written,
        wire_feed,
        wire_sent,
        shutdown,
        task,
    }
}

fn spawn_server(interval: Duration) -> Endpoint {
    let (device_feed, feed_rx) = mpsc::unbounded_channel();
    let (written_tx, device_written) = mpsc::unbounded_channel();
    let (wire_feed, wire_rx) = mpsc::unbounded_channel();
    let (sent_tx, wire_sent) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();

    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        let mut peer = Peer::new(
            ChannelDevice {
                feed: feed_rx,
                written: written_tx,
            },
            ChannelTransport {
                feed: wire_rx,
                sent: sent_tx,
            },
        );
        let mut handler = ServerHandler::new();
        forward(&mut peer, &mut handler, interval, MTU, &token).await
    });

    Endpoint {
        device_feed,
        device_written,
        wire_feed,
        wire_sent,
        shutdown,
        task,
    }
}

async fn next_sent(endpoint: &mut Endpoint) -> (Vec<u8>, Ipv4Addr) {
    timeout(Duration::from_secs(5), endpoint.wire_sent.recv())
        .await
        .expect("timed out waiting for a datagram")
        .expect("wire channel closed")
}

/// Skips the initial punch-through burst the client emits on startup.
async fn drain_punchthru(client: &mut Endpoint) {
    for _ in 0..PUNCHTHRU_WINDOW {
        let (probe, dst) = next_sent(client).await;
        assert_eq!(dst, SERVER_ADDR);
        let echo = decode(&probe, EchoKind::Request).expect("probe must validate");
        assert!(echo.payload.is_empty());
    }
}

#[tokio::test]
async fn end_to_end_forward() {
    // Long interval so no keepalive interferes with the scenario.
    let interval = Duration::from_secs(3600);
    let mut client = spawn_client(interval);
    let mut server = spawn_server(interval);
    drain_punchthru(&mut client).await;

    // Client device produces a packet; it must leave as an echo request.
    client.device_feed.send(b"\xde\xad\xbe\xef".to_vec()).unwrap();
    let (request, dst) = next_sent(&mut client).await;
    assert_eq!(dst, SERVER_ADDR);
    let echo = decode(&request, EchoKind::Request).unwrap();
    assert_eq!(echo.ident, IDENT);
    assert_eq!(echo.payload, b"\xde\xad\xbe\xef");

    // Deliver it to the relay: payload hits the relay's device.
    server.wire_feed.send((request, CLIENT_ADDR)).unwrap();
    let written = timeout(Duration::from_secs(5), server.device_written.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(written, b"\xde\xad\xbe\xef");

    // Relay device answers; the reply goes to the remembered client with
    // the client's identifier.
    server.device_feed.send(b"\xca\xfe\xba\xbe".to_vec()).unwrap();
    let (reply, dst) = next_sent(&mut server).await;
    assert_eq!(dst, CLIENT_ADDR);
    let echo = decode(&reply, EchoKind::Reply).unwrap();
    assert_eq!(echo.ident, IDENT);
    assert_eq!(echo.payload, b"\xca\xfe\xba\xbe");

    // Deliver the reply back: the client writes it to its own device.
    client.wire_feed.send((reply, SERVER_ADDR)).unwrap();
    let written = timeout(Duration::from_secs(5), client.device_written.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(written, b"\xca\xfe\xba\xbe");

    client.shutdown.cancel();
    server.shutdown.cancel();
    client.task.await.unwrap().unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn idle_client_emits_one_probe_per_interval() {
    let interval = Duration::from_secs(1);
    let mut client = spawn_client(interval);
    drain_punchthru(&mut client).await;

    let start = tokio::time::Instant::now();
    for tick in 1..=2u32 {
        let (probe, dst) = next_sent(&mut client).await;
        assert_eq!(dst, SERVER_ADDR);
        let echo = decode(&probe, EchoKind::Request).unwrap();
        assert!(echo.payload.is_empty());
        // Exactly one probe per elapsed interval, no bunching.
        assert_eq!(start.elapsed(), interval * tick);
    }

    client.shutdown.cancel();
    client.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_returns_promptly_while_blocked() {
    let mut server = spawn_server(Duration::from_secs(3600));

    server.shutdown.cancel();
    let result = timeout(Duration::from_secs(1), server.task)
        .await
        .expect("engine did not stop after cancellation")
        .unwrap();
    assert!(result.is_ok());

    // No packets were processed or emitted on the way out.
    assert!(server.wire_sent.try_recv().is_err());
    assert!(server.device_written.try_recv().is_err());
}

#[tokio::test]
async fn device_failure_is_fatal() {
    struct BrokenDevice;

    #[async_trait]
    impl PacketIo for BrokenDevice {
        async fn recv_packet(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "device gone"))
        }

        async fn send_packet(&mut self, _packet: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "device gone"))
        }
    }

    let (_wire_feed, wire_rx) = mpsc::unbounded_channel();
    let (sent_tx, _wire_sent) = mpsc::unbounded_channel();
    let mut peer = Peer::new(
        BrokenDevice,
        ChannelTransport {
            feed: wire_rx,
            sent: sent_tx,
        },
    );
    let mut handler = ServerHandler::new();
    let shutdown = CancellationToken::new();

    let result = forward(
        &mut peer,
        &mut handler,
        Duration::from_secs(3600),
        MTU,
        &shutdown,
    )
    .await;
    assert!(matches!(result, Err(TunnelError::Io(_))));
}
