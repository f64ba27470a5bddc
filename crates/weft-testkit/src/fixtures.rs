//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};
use weft::{Node, NodeConfig, NodeError, Outgoing};
use weft_channel::Channel;
use weft_core::{now, Body, ChannelId, Keypair, MessageHash, PeerId, Timestamp};
use weft_identity::Identity;
use weft_store::MemoryStore;
use weft_sync::{verify_convergence, ChannelDigest, SyncAction, SyncConfig, SyncDriver, SyncReport};

/// A node backed by its own in-memory store.
pub type TestNode = Node<Arc<MemoryStore>>;

/// Identity with a deterministic key.
pub fn identity_from_seed(name: &str, seed: u8) -> Identity {
    Identity::from_keypair(name, Keypair::from_seed(&[seed; 32]))
}

/// Distinct deterministic identities for multi-party tests.
pub fn multi_party_identities(count: usize) -> Vec<Identity> {
    (0..count)
        .map(|i| identity_from_seed(&format!("party-{i}"), i as u8))
        .collect()
}

/// A channel owned by a fixed identity, with a clock that starts a day in
/// the past and ticks one second per post.
pub struct ChannelFixture {
    pub owner: Identity,
    pub channel: Channel,
    clock: Timestamp,
}

impl ChannelFixture {
    pub fn new(seed: u8) -> Self {
        let owner = identity_from_seed("owner", seed);
        let clock = now() - 86_400.0;
        let channel = Channel::create_at(&owner, "fixture", clock).expect("root message is valid");
        Self {
            owner,
            channel,
            clock,
        }
    }

    /// A linear history of `count` posts on top of the root.
    pub fn with_messages(seed: u8, count: usize) -> Self {
        let mut fixture = Self::new(seed);
        for i in 0..count {
            fixture.post(&format!("message {i}"));
        }
        fixture
    }

    /// Post as the owner one tick after the previous post.
    pub fn post(&mut self, text: &str) -> MessageHash {
        self.clock += 1.0;
        self.channel
            .post_at(Body::Text(text.into()), &self.owner, self.clock)
            .expect("owner can post")
            .hash()
    }

    /// A replica holding only the root.
    pub fn empty_replica(&self) -> Channel {
        Channel::new(
            *self.channel.public_key(),
            self.channel.name(),
            self.channel.root().envelope.clone(),
        )
        .expect("root is valid")
    }

    /// A replica holding everything stored so far.
    pub fn full_replica(&self) -> Channel {
        Channel::import(self.channel.export()).expect("snapshot is valid")
    }
}

/// Pull `remote` into `local` without any transport.
pub fn sync_channels(local: &mut Channel, remote: &Channel) -> weft_sync::Result<SyncReport> {
    let mut driver = SyncDriver::new(
        *local.channel_id(),
        PeerId::from_bytes([0xFF; 32]),
        SyncConfig::default(),
    );
    let mut action = driver.start(local);
    loop {
        action = match action {
            SyncAction::Query(request) => {
                let response = remote.query(&request)?;
                driver.on_query_response(local, response)?
            }
            SyncAction::Bulk(request) => {
                let response = remote.bulk(&request);
                driver.on_bulk_response(local, response)?
            }
            SyncAction::Done(report) => return Ok(report),
        };
    }
}

/// What a call to [`Cluster::deliver`] did.
#[derive(Debug, Default)]
pub struct Delivery {
    pub packets: usize,
    pub failures: Vec<(PeerId, NodeError)>,
}

/// Nodes that exchange packets through an in-process queue.
///
/// Packets are handled one at a time in send order, so runs are
/// reproducible.
pub struct Cluster {
    nodes: Vec<TestNode>,
    channel_id: ChannelId,
}

impl Cluster {
    /// Node 0 creates a channel and invites every other node.
    ///
    /// Guests only know the owner; call [`Cluster::connect_all`] for a mesh.
    pub async fn invited(count: usize) -> weft::Result<Self> {
        Self::invited_with(count, NodeConfig::default()).await
    }

    pub async fn invited_with(count: usize, config: NodeConfig) -> weft::Result<Self> {
        let mut nodes = Vec::with_capacity(count.max(1));
        for i in 0..count.max(1) {
            let store = Arc::new(MemoryStore::new());
            nodes.push(Node::create(format!("node-{i}"), store, config.clone()).await?);
        }
        let channel_id = nodes[0].create_channel("general").await?;
        let mut cluster = Self { nodes, channel_id };

        for i in 1..cluster.nodes.len() {
            let request = cluster.nodes[i].request_invite();
            let invite = cluster.nodes[0].issue_invite(&request, &channel_id)?;
            let owner = cluster.peer_id(0);
            let delivery = cluster.deliver(owner, vec![(request.peer_id, invite)]).await;
            if let Some((_, err)) = delivery.failures.into_iter().next() {
                return Err(err);
            }
        }
        Ok(cluster)
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }

    pub fn node_mut(&mut self, index: usize) -> &mut TestNode {
        &mut self.nodes[index]
    }

    pub fn peer_id(&self, index: usize) -> PeerId {
        self.nodes[index].peer_id()
    }

    /// Make every node a peer of every other node.
    pub fn connect_all(&mut self) {
        let ids: Vec<PeerId> = self.nodes.iter().map(Node::peer_id).collect();
        for node in &mut self.nodes {
            for id in &ids {
                if *id != node.peer_id() {
                    node.add_peer(*id);
                }
            }
        }
    }

    /// Deliver `outgoing` from `from`, then every reply, until the queue
    /// drains. Packets for nodes outside the cluster are dropped.
    pub async fn deliver(&mut self, from: PeerId, outgoing: Outgoing) -> Delivery {
        let mut delivery = Delivery::default();
        let mut queue: VecDeque<(PeerId, PeerId, weft_sync::Packet)> =
            outgoing.into_iter().map(|(to, packet)| (from, to, packet)).collect();

        while let Some((sender, to, packet)) = queue.pop_front() {
            let Some(node) = self.nodes.iter_mut().find(|n| n.peer_id() == to) else {
                debug!(peer = %to, "dropping packet for unknown node");
                continue;
            };
            delivery.packets += 1;
            match node.handle_packet(sender, packet).await {
                Ok(replies) => {
                    queue.extend(replies.into_iter().map(|(next, packet)| (to, next, packet)))
                }
                Err(err) => {
                    warn!(peer = %to, error = %err, "node rejected packet");
                    delivery.failures.push((to, err));
                }
            }
        }
        delivery
    }

    /// Post on the cluster channel from node `index` and deliver the
    /// resulting notifications.
    pub async fn post(&mut self, index: usize, text: &str) -> weft::Result<MessageHash> {
        let channel_id = self.channel_id;
        let (hash, outgoing) = self.nodes[index].post_text(&channel_id, text).await?;
        let from = self.peer_id(index);
        self.deliver(from, outgoing).await;
        Ok(hash)
    }

    /// Digests of every node that holds `channel_id`.
    pub fn digests(&self, channel_id: &ChannelId) -> Vec<ChannelDigest> {
        self.nodes
            .iter()
            .filter_map(|node| node.digest(channel_id).ok())
            .collect()
    }

    /// Whether every node holds `channel_id` with identical contents.
    pub fn is_converged(&self, channel_id: &ChannelId) -> bool {
        let digests = self.digests(channel_id);
        if digests.len() != self.nodes.len() {
            return false;
        }
        digests
            .windows(2)
            .all(|pair| verify_convergence(&pair[0], &pair[1]).is_converged())
    }
}
