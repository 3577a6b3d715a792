//! Framed TCP transport
//!
//! Reliable, in-order byte streams with `u32` big-endian length-prefixed
//! frames. Connections open with a tiny identification preamble (the
//! sender's node id, length-prefixed); peer identity is not hidden from
//! trusted peers. Malformed or oversized frames close the connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lib_trust::PeerId;

use crate::error::NetworkError;
use crate::Result;

/// Cap on a single wire frame.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Per-connection outbound mailbox depth; senders feel backpressure
/// once a slow peer fills it.
const MAILBOX_DEPTH: usize = 64;

const MAX_PREAMBLE_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected { peer_id: PeerId, addr: SocketAddr },
    Frame { peer_id: PeerId, bytes: Vec<u8> },
    Disconnected { peer_id: PeerId, reason: String },
}

type PeerMap = Arc<RwLock<HashMap<PeerId, mpsc::Sender<Vec<u8>>>>>;

pub struct Transport {
    local_id: PeerId,
    peers: PeerMap,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl Transport {
    pub fn new(local_id: PeerId, event_buffer: usize) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::channel(event_buffer);
        (
            Self {
                local_id,
                peers: Arc::new(RwLock::new(HashMap::new())),
                events_tx,
            },
            events_rx,
        )
    }

    /// Bind and start accepting inbound connections.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        info!(%bound, "transport listening");

        let local_id = self.local_id.clone();
        let peers = self.peers.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let local_id = local_id.clone();
                        let peers = peers.clone();
                        let events_tx = events_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                handshake(stream, remote, local_id, peers, events_tx).await
                            {
                                debug!(%remote, "inbound handshake failed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                        break;
                    }
                }
            }
        });
        Ok(bound)
    }

    /// Dial a peer and exchange preambles. Returns the peer's announced id.
    pub async fn connect(&self, addr: SocketAddr) -> Result<PeerId> {
        let stream = TcpStream::connect(addr).await?;
        let remote = stream.peer_addr()?;
        let peer_id = handshake(
            stream,
            remote,
            self.local_id.clone(),
            self.peers.clone(),
            self.events_tx.clone(),
        )
        .await?;
        Ok(peer_id)
    }

    /// Queue a frame to a connected peer.
    pub async fn send(&self, peer_id: &str, frame: Vec<u8>) -> Result<()> {
        if frame.len() > MAX_FRAME_BYTES {
            return Err(NetworkError::SizeLimit {
                limit: MAX_FRAME_BYTES,
                actual: frame.len(),
            });
        }
        let sender = self
            .peers
            .read()
            .get(peer_id)
            .cloned()
            .ok_or_else(|| NetworkError::NotConnected(peer_id.to_string()))?;
        sender
            .send(frame)
            .await
            .map_err(|_| NetworkError::NotConnected(peer_id.to_string()))
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.read().keys().cloned().collect()
    }

    /// Drop the peer's mailbox; its writer task ends and the socket closes.
    pub fn disconnect(&self, peer_id: &str) {
        self.peers.write().remove(peer_id);
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("local_id", &self.local_id)
            .field("peers", &self.peers.read().len())
            .finish()
    }
}

/// Exchange id preambles, register the peer and spawn the IO tasks.
async fn handshake(
    mut stream: TcpStream,
    remote: SocketAddr,
    local_id: PeerId,
    peers: PeerMap,
    events_tx: mpsc::Sender<TransportEvent>,
) -> Result<PeerId> {
    write_preamble(&mut stream, &local_id).await?;
    let peer_id = read_preamble(&mut stream).await?;

    let (read_half, write_half) = stream.into_split();
    let (mailbox_tx, mailbox_rx) = mpsc::channel(MAILBOX_DEPTH);
    peers.write().insert(peer_id.clone(), mailbox_tx);

    let _ = events_tx
        .send(TransportEvent::Connected {
            peer_id: peer_id.clone(),
            addr: remote,
        })
        .await;

    tokio::spawn(writer_task(write_half, mailbox_rx));
    tokio::spawn(reader_task(
        read_half,
        peer_id.clone(),
        peers,
        events_tx,
    ));

    debug!(peer = %peer_id, %remote, "transport connection established");
    Ok(peer_id)
}

async fn write_preamble(stream: &mut TcpStream, id: &str) -> Result<()> {
    stream.write_all(&(id.len() as u16).to_be_bytes()).await?;
    stream.write_all(id.as_bytes()).await?;
    Ok(())
}

async fn read_preamble(stream: &mut TcpStream) -> Result<PeerId> {
    let mut len_bytes = [0u8; 2];
    stream.read_exact(&mut len_bytes).await?;
    let len = u16::from_be_bytes(len_bytes) as usize;
    if len == 0 || len > MAX_PREAMBLE_LEN {
        return Err(NetworkError::Malformed("bad preamble length".into()));
    }
    let mut id = vec![0u8; len];
    stream.read_exact(&mut id).await?;
    String::from_utf8(id).map_err(|_| NetworkError::Malformed("preamble not utf-8".into()))
}

/// Drains the mailbox onto the socket; ends when the mailbox closes.
async fn writer_task(mut write_half: OwnedWriteHalf, mut mailbox_rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = mailbox_rx.recv().await {
        let len = (frame.len() as u32).to_be_bytes();
        if write_half.write_all(&len).await.is_err() {
            break;
        }
        if write_half.write_all(&frame).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Reads length-prefixed frames until EOF or a malformed frame.
async fn reader_task(
    mut read_half: OwnedReadHalf,
    peer_id: PeerId,
    peers: PeerMap,
    events_tx: mpsc::Sender<TransportEvent>,
) {
    let reason = loop {
        let mut len_bytes = [0u8; 4];
        if read_half.read_exact(&mut len_bytes).await.is_err() {
            break "connection closed".to_string();
        }
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_BYTES {
            break format!("oversized frame ({len} bytes)");
        }
        let mut frame = vec![0u8; len];
        if read_half.read_exact(&mut frame).await.is_err() {
            break "truncated frame".to_string();
        }
        if events_tx
            .send(TransportEvent::Frame {
                peer_id: peer_id.clone(),
                bytes: frame,
            })
            .await
            .is_err()
        {
            break "event channel closed".to_string();
        }
    };

    peers.write().remove(&peer_id);
    let _ = events_tx
        .send(TransportEvent::Disconnected {
            peer_id,
            reason,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair() -> (
        Transport,
        mpsc::Receiver<TransportEvent>,
        Transport,
        mpsc::Receiver<TransportEvent>,
    ) {
        let (a, a_events) = Transport::new("node-a".into(), 64);
        let (b, mut b_events) = Transport::new("node-b".into(), 64);
        let addr = a.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let peer = b.connect(addr).await.unwrap();
        assert_eq!(peer, "node-a");

        // Wait for b's Connected event so registration is visible.
        match b_events.recv().await.unwrap() {
            TransportEvent::Connected { peer_id, .. } => assert_eq!(peer_id, "node-a"),
            other => panic!("unexpected event: {other:?}"),
        }
        (a, a_events, b, b_events)
    }

    #[tokio::test]
    async fn frames_flow_both_ways_in_order() {
        let (a, mut a_events, b, mut b_events) = pair().await;

        // a's Connected event first.
        match a_events.recv().await.unwrap() {
            TransportEvent::Connected { peer_id, .. } => assert_eq!(peer_id, "node-b"),
            other => panic!("unexpected event: {other:?}"),
        }

        b.send("node-a", b"one".to_vec()).await.unwrap();
        b.send("node-a", b"two".to_vec()).await.unwrap();

        for expected in [b"one".to_vec(), b"two".to_vec()] {
            match a_events.recv().await.unwrap() {
                TransportEvent::Frame { peer_id, bytes } => {
                    assert_eq!(peer_id, "node-b");
                    assert_eq!(bytes, expected);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }

        a.send("node-b", b"reply".to_vec()).await.unwrap();
        match b_events.recv().await.unwrap() {
            TransportEvent::Frame { peer_id, bytes } => {
                assert_eq!(peer_id, "node-a");
                assert_eq!(bytes, b"reply");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_outbound_frame_is_rejected() {
        let (_a, _a_events, b, _b_events) = pair().await;
        let err = b
            .send("node-a", vec![0u8; MAX_FRAME_BYTES + 1])
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::SizeLimit { .. }));
    }

    #[tokio::test]
    async fn send_to_unknown_peer_fails() {
        let (_a, _ev, b, _bev) = pair().await;
        assert!(matches!(
            b.send("node-z", b"x".to_vec()).await.unwrap_err(),
            NetworkError::NotConnected(_)
        ));
    }

    #[tokio::test]
    async fn disconnect_surfaces_event() {
        let (a, mut a_events, b, _b_events) = pair().await;
        match a_events.recv().await.unwrap() {
            TransportEvent::Connected { .. } => {}
            other => panic!("unexpected event: {other:?}"),
        }

        b.disconnect("node-a");
        match a_events.recv().await.unwrap() {
            TransportEvent::Disconnected { peer_id, .. } => assert_eq!(peer_id, "node-b"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(!a.is_connected("node-b"));
    }
}
