//! Transport abstraction for sync packets.
//!
//! Implementations may use any stream or datagram carrier. They must
//! deliver packets from one peer in order.

use async_trait::async_trait;
use std::time::Duration;

use weft_core::PeerId;

use crate::error::Result;
use crate::messages::Packet;

/// Sends and receives packets addressed by [`PeerId`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a packet to a specific peer.
    async fn send(&self, peer: &PeerId, packet: Packet) -> Result<()>;

    /// Receive the next packet from any peer. `None` when nothing arrived
    /// within `timeout`.
    async fn recv_timeout(&self, timeout: Duration) -> Result<Option<(PeerId, Packet)>>;
}

/// An in-memory transport for tests and single-process setups.
///
/// Packets go through `to_bytes`/`from_bytes` so the wire encoding is
/// exercised the same way a socket transport would.
pub mod memory {
    use super::*;
    use crate::error::SyncError;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::{mpsc, Mutex, RwLock};

    const QUEUE_DEPTH: usize = 1024;

    #[derive(Debug)]
    struct Frame {
        from: PeerId,
        bytes: Vec<u8>,
    }

    /// Routing table shared by every transport on the network.
    #[derive(Default)]
    pub struct MemoryNetwork {
        senders: RwLock<HashMap<PeerId, mpsc::Sender<Frame>>>,
    }

    impl MemoryNetwork {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Attach a peer to the network.
        pub async fn create_transport(self: &Arc<Self>, peer_id: PeerId) -> MemoryTransport {
            let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
            self.senders.write().await.insert(peer_id, tx);

            MemoryTransport {
                peer_id,
                network: Arc::clone(self),
                receiver: Mutex::new(rx),
            }
        }
    }

    pub struct MemoryTransport {
        peer_id: PeerId,
        network: Arc<MemoryNetwork>,
        receiver: Mutex<mpsc::Receiver<Frame>>,
    }

    impl MemoryTransport {
        fn decode(frame: Frame) -> Result<(PeerId, Packet)> {
            Ok((frame.from, Packet::from_bytes(&frame.bytes)?))
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&self, peer: &PeerId, packet: Packet) -> Result<()> {
            let bytes = packet.to_bytes()?;
            let sender = self
                .network
                .senders
                .read()
                .await
                .get(peer)
                .cloned()
                .ok_or(SyncError::PeerNotConnected(*peer))?;
            sender
                .send(Frame {
                    from: self.peer_id,
                    bytes,
                })
                .await
                .map_err(|_| SyncError::TransportError("peer disconnected".into()))
        }

        async fn recv_timeout(&self, timeout: Duration) -> Result<Option<(PeerId, Packet)>> {
            let mut rx = self.receiver.lock().await;
            match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Some(frame)) => Self::decode(frame).map(Some),
                Ok(None) => Err(SyncError::TransportError("channel closed".into())),
                Err(_) => Ok(None),
            }
        }
    }
}
