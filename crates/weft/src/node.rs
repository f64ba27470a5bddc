//! The Node: one identity, its channels, and its sync sessions.
//!
//! A node is the single owner of every channel it holds. All mutation goes
//! through `&mut self`, so each inbound packet is handled to completion
//! before the next one is looked at.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use weft_channel::{
    BulkRequest, BulkResponse, Channel, ChannelError, ChannelEvent, ChannelSnapshot, QueryRequest,
    QueryResponse,
};
use weft_core::{now, Body, ChannelId, MessageHash, PeerId};
use weft_identity::{Identity, IdentityRecord, Invite, InviteRequest, X25519StaticSecret};
use weft_store::{Store, StoreExt};
use weft_sync::{
    ChannelDigest, ErrorCode, Packet, SyncAction, SyncDriver, SyncError, SyncReport, Transport,
    Violation,
};

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};

/// Packets to send, each addressed to a peer.
pub type Outgoing = Vec<(PeerId, Packet)>;

fn identity_key(name: &str) -> String {
    format!("identity/{name}")
}

/// Channels are stored per identity so several nodes can share one store.
fn channel_prefix(identity: &str) -> String {
    format!("channel/{identity}/")
}

fn channel_key(identity: &str, channel_id: &ChannelId) -> String {
    format!("{}{}", channel_prefix(identity), channel_id.to_hex())
}

async fn persist_channel<S: Store>(store: &S, identity: &Identity, channel: &Channel) -> Result<()> {
    let key = channel_key(identity.name(), channel.channel_id());
    store.put_cbor(&key, &channel.export()).await?;
    Ok(())
}

/// Send every packet in `outgoing` through `transport`.
pub async fn send_all<T: Transport + ?Sized>(transport: &T, outgoing: Outgoing) -> Result<()> {
    for (peer, packet) in outgoing {
        transport.send(&peer, packet).await?;
    }
    Ok(())
}

/// A Weft node.
pub struct Node<S: Store> {
    identity: Identity,
    store: Arc<S>,
    config: NodeConfig,
    peer_id: PeerId,
    channels: HashMap<ChannelId, Channel>,
    peers: BTreeSet<PeerId>,
    drivers: HashMap<(ChannelId, PeerId), SyncDriver>,
    /// Outstanding requests by (peer, request id), with their send time.
    pending: HashMap<(PeerId, u64), (ChannelId, Instant)>,
    next_request_id: u64,
    /// Pairs notified again while a sync was running.
    resync: HashSet<(ChannelId, PeerId)>,
    invite_secrets: Vec<X25519StaticSecret>,
    reports: HashMap<(ChannelId, PeerId), SyncReport>,
}

impl<S: Store> Node<S> {
    /// Create a node with a fresh identity and persist it.
    pub async fn create(name: impl Into<String>, store: S, config: NodeConfig) -> Result<Self> {
        let name = name.into();
        let key = identity_key(&name);
        if store.contains(&key).await? {
            return Err(NodeError::IdentityExists(name));
        }

        let identity = Identity::generate(name);
        store.put_cbor(&key, &identity.to_record()).await?;
        info!(identity = %identity.name(), "created identity");
        Ok(Self::assemble(identity, Arc::new(store), config, HashMap::new()))
    }

    /// Restore a node's identity and every stored channel.
    pub async fn load(name: &str, store: S, config: NodeConfig) -> Result<Self> {
        let record: Option<IdentityRecord> = store.get_cbor(&identity_key(name)).await?;
        let record = record.ok_or_else(|| NodeError::IdentityNotFound(name.to_string()))?;
        let identity = Identity::from_record(record)?;

        let mut channels = HashMap::new();
        for key in store.keys_with_prefix(&channel_prefix(identity.name())).await? {
            let snapshot: Option<ChannelSnapshot> = store.get_cbor(&key).await?;
            if let Some(snapshot) = snapshot {
                let channel = Channel::import(snapshot)?;
                channels.insert(*channel.channel_id(), channel);
            }
        }

        info!(identity = %identity.name(), channels = channels.len(), "loaded node");
        Ok(Self::assemble(identity, Arc::new(store), config, channels))
    }

    fn assemble(
        identity: Identity,
        store: Arc<S>,
        config: NodeConfig,
        channels: HashMap<ChannelId, Channel>,
    ) -> Self {
        let peer_id = PeerId::from_public_key(&identity.public_key());
        Self {
            identity,
            store,
            config,
            peer_id,
            channels,
            peers: BTreeSet::new(),
            drivers: HashMap::new(),
            pending: HashMap::new(),
            next_request_id: 1,
            resync: HashSet::new(),
            invite_secrets: Vec::new(),
            reports: HashMap::new(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Transport address, derived from the identity key.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn channel(&self, channel_id: &ChannelId) -> Option<&Channel> {
        self.channels.get(channel_id)
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<_> = self.channels.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.iter()
    }

    pub fn is_syncing(&self, channel_id: &ChannelId, peer: &PeerId) -> bool {
        self.drivers.contains_key(&(*channel_id, *peer))
    }

    /// Report of the last finished sync epoch for a pair.
    pub fn last_report(&self, channel_id: &ChannelId, peer: &PeerId) -> Option<&SyncReport> {
        self.reports.get(&(*channel_id, *peer))
    }

    /// Create the channel owned by this node's identity.
    pub async fn create_channel(&mut self, name: impl Into<String>) -> Result<ChannelId> {
        let channel_id = ChannelId::derive(&self.identity.public_key());
        if self.channels.contains_key(&channel_id) {
            return Err(NodeError::ChannelExists(channel_id));
        }

        let channel = Channel::create(&self.identity, name)?;
        persist_channel(self.store.as_ref(), &self.identity, &channel).await?;
        info!(channel = %channel_id, name = %channel.name(), "created channel");
        self.channels.insert(channel_id, channel);
        Ok(channel_id)
    }

    /// Post to a channel and announce it to every peer.
    pub async fn post(&mut self, channel_id: &ChannelId, body: Body) -> Result<(MessageHash, Outgoing)> {
        let channel = self
            .channels
            .get_mut(channel_id)
            .ok_or(NodeError::UnknownChannel(*channel_id))?;
        let envelope = channel.post(body, &self.identity)?;
        persist_channel(self.store.as_ref(), &self.identity, channel).await?;
        Ok((envelope.hash(), self.notify(channel_id, None)))
    }

    pub async fn post_text(&mut self, channel_id: &ChannelId, text: impl Into<String>) -> Result<(MessageHash, Outgoing)> {
        self.post(channel_id, Body::Text(text.into())).await
    }

    fn notify(&self, channel_id: &ChannelId, except: Option<&PeerId>) -> Outgoing {
        self.peers
            .iter()
            .filter(|peer| Some(*peer) != except)
            .map(|peer| (*peer, Packet::Notification { channel_id: *channel_id }))
            .collect()
    }

    /// Returns whether the peer was new.
    pub fn add_peer(&mut self, peer: PeerId) -> bool {
        self.peers.insert(peer)
    }

    /// Forget a peer and drop its sync sessions.
    pub fn remove_peer(&mut self, peer: &PeerId) -> bool {
        self.drivers.retain(|(_, p), _| p != peer);
        self.pending.retain(|(p, _), _| p != peer);
        self.resync.retain(|(_, p)| p != peer);
        self.peers.remove(peer)
    }

    /// Start a sync epoch pulling `channel_id` from `peer`.
    ///
    /// Replaces any epoch already running for the pair; responses to its
    /// requests are ignored from here on.
    pub fn sync_with(&mut self, peer: PeerId, channel_id: &ChannelId) -> Result<Outgoing> {
        let channel = self
            .channels
            .get(channel_id)
            .ok_or(NodeError::UnknownChannel(*channel_id))?;

        self.pending
            .retain(|(p, _), (c, _)| !(*p == peer && *c == *channel_id));
        let mut driver = SyncDriver::new(*channel_id, peer, self.config.sync.clone());
        let action = driver.start(channel);
        self.drivers.insert((*channel_id, peer), driver);
        Ok(self.dispatch(*channel_id, peer, action))
    }

    /// Ask to be invited. The returned request goes to the inviter out of band.
    pub fn request_invite(&mut self) -> InviteRequest {
        let (request, secret) = InviteRequest::new(&self.identity, self.peer_id);
        self.invite_secrets.push(secret);
        request
    }

    /// Answer an invite request for a channel this node can post to.
    ///
    /// The requester becomes a peer. The returned packet goes to
    /// `request.peer_id`.
    pub fn issue_invite(&mut self, request: &InviteRequest, channel_id: &ChannelId) -> Result<Packet> {
        let channel = self
            .channels
            .get(channel_id)
            .ok_or(NodeError::UnknownChannel(*channel_id))?;

        let now = now();
        let invite = Invite::issue(
            &self.identity,
            request,
            channel.info(),
            Some(now + self.config.link_ttl),
            now,
        )?;
        self.peers.insert(request.peer_id);
        info!(channel = %channel_id, peer = %request.peer_id, "issued invite");
        Ok(Packet::Invite {
            encrypted_chain: invite.to_bytes()?,
        })
    }

    pub fn subscribe(&self, channel_id: &ChannelId) -> Result<broadcast::Receiver<ChannelEvent>> {
        self.channels
            .get(channel_id)
            .map(Channel::subscribe)
            .ok_or(NodeError::UnknownChannel(*channel_id))
    }

    pub fn digest(&self, channel_id: &ChannelId) -> Result<ChannelDigest> {
        self.channels
            .get(channel_id)
            .map(ChannelDigest::compute)
            .ok_or(NodeError::UnknownChannel(*channel_id))
    }

    /// Handle one inbound packet, returning the packets to send in reply.
    ///
    /// An error means a sync session or an invite failed. The node itself
    /// stays usable.
    pub async fn handle_packet(&mut self, from: PeerId, packet: Packet) -> Result<Outgoing> {
        if let Err(reason) = packet.validate_limits() {
            warn!(peer = %from, kind = packet.kind(), reason, "packet exceeds limits");
            return match packet {
                Packet::Query { request_id, .. } | Packet::Bulk { request_id, .. } => Ok(vec![(
                    from,
                    error_packet(request_id, ErrorCode::ProtocolViolation, reason),
                )]),
                other => {
                    if let Some(request_id) = other.request_id() {
                        if let Some((channel_id, _)) = self.pending.remove(&(from, request_id)) {
                            self.drivers.remove(&(channel_id, from));
                        }
                    }
                    Err(SyncError::from(Violation::LimitExceeded(reason)).into())
                }
            };
        }

        debug!(peer = %from, kind = packet.kind(), "handling packet");
        match packet {
            Packet::Notification { channel_id } => self.on_notification(from, channel_id),
            Packet::Query {
                request_id,
                channel_id,
                request,
            } => Ok(vec![(from, self.answer_query(request_id, &channel_id, &request))]),
            Packet::Bulk {
                request_id,
                channel_id,
                request,
            } => Ok(vec![(from, self.answer_bulk(request_id, &channel_id, &request))]),
            Packet::QueryResponse { request_id, response } => {
                self.on_query_response(from, request_id, response)
            }
            Packet::BulkResponse { request_id, response } => {
                self.on_bulk_response(from, request_id, response).await
            }
            Packet::Invite { encrypted_chain } => self.on_invite(from, &encrypted_chain).await,
            Packet::Error {
                request_id,
                code,
                message,
            } => self.on_error(from, request_id, code, message),
        }
    }

    /// Handle packets from `transport` until it stays quiet for
    /// `idle_timeout`.
    pub async fn drive<T: Transport + ?Sized>(&mut self, transport: &T) -> Result<()> {
        let idle = self.config.idle_timeout;
        while let Some((from, packet)) = transport.recv_timeout(idle).await? {
            match self.handle_packet(from, packet).await {
                Ok(outgoing) => {
                    if let Err(e) = send_all(transport, outgoing).await {
                        warn!(peer = %from, error = %e, "failed to send reply");
                    }
                }
                Err(e) => warn!(peer = %from, error = %e, "packet handling failed"),
            }
            self.expire_requests();
        }
        self.expire_requests();
        debug!(peer = %self.peer_id, "transport idle");
        Ok(())
    }

    /// End every session whose outstanding request has waited longer than
    /// `sync.message_timeout`. Returns the pairs that were ended.
    pub fn expire_requests(&mut self) -> Vec<(ChannelId, PeerId)> {
        let timeout = self.config.sync.message_timeout;
        let expired: Vec<(PeerId, u64, ChannelId)> = self
            .pending
            .iter()
            .filter(|(_, (_, sent))| sent.elapsed() >= timeout)
            .map(|((peer, request_id), (channel_id, _))| (*peer, *request_id, *channel_id))
            .collect();

        let mut ended = Vec::with_capacity(expired.len());
        for (peer, request_id, channel_id) in expired {
            self.pending.remove(&(peer, request_id));
            let reason = format!("no answer to request {request_id} within {timeout:?}");
            self.terminate(channel_id, peer, SyncError::Timeout(reason));
            ended.push((channel_id, peer));
        }
        ended
    }

    fn on_notification(&mut self, from: PeerId, channel_id: ChannelId) -> Result<Outgoing> {
        if !self.channels.contains_key(&channel_id) {
            debug!(peer = %from, channel = %channel_id, "notification for unknown channel");
            return Ok(Vec::new());
        }
        self.peers.insert(from);
        if !self.config.auto_sync_on_notification {
            return Ok(Vec::new());
        }
        if self.is_syncing(&channel_id, &from) {
            self.resync.insert((channel_id, from));
            return Ok(Vec::new());
        }
        self.sync_with(from, &channel_id)
    }

    fn answer_query(&self, request_id: u64, channel_id: &ChannelId, request: &QueryRequest) -> Packet {
        let Some(channel) = self.channels.get(channel_id) else {
            return error_packet(request_id, ErrorCode::UnknownChannel, "unknown channel");
        };
        match channel.query(request) {
            Ok(response) => Packet::QueryResponse { request_id, response },
            Err(ChannelError::UnknownCursor(hash)) => error_packet(
                request_id,
                ErrorCode::UnknownCursor,
                format!("unknown cursor {hash}"),
            ),
            Err(e) => error_packet(request_id, ErrorCode::Internal, e.to_string()),
        }
    }

    fn answer_bulk(&self, request_id: u64, channel_id: &ChannelId, request: &BulkRequest) -> Packet {
        match self.channels.get(channel_id) {
            Some(channel) => Packet::BulkResponse {
                request_id,
                response: channel.bulk(request),
            },
            None => error_packet(request_id, ErrorCode::UnknownChannel, "unknown channel"),
        }
    }

    fn on_query_response(&mut self, from: PeerId, request_id: u64, response: QueryResponse) -> Result<Outgoing> {
        let Some((channel_id, _)) = self.pending.remove(&(from, request_id)) else {
            debug!(peer = %from, request_id, "ignoring unsolicited query response");
            return Ok(Vec::new());
        };
        let key = (channel_id, from);
        let (Some(driver), Some(channel)) = (self.drivers.get_mut(&key), self.channels.get(&channel_id)) else {
            return Ok(Vec::new());
        };

        match driver.on_query_response(channel, response) {
            Ok(action) => Ok(self.dispatch(channel_id, from, action)),
            Err(e) => Err(self.terminate(channel_id, from, e)),
        }
    }

    async fn on_bulk_response(&mut self, from: PeerId, request_id: u64, response: BulkResponse) -> Result<Outgoing> {
        let Some((channel_id, _)) = self.pending.remove(&(from, request_id)) else {
            debug!(peer = %from, request_id, "ignoring unsolicited bulk response");
            return Ok(Vec::new());
        };
        let key = (channel_id, from);
        let (Some(driver), Some(channel)) = (self.drivers.get_mut(&key), self.channels.get_mut(&channel_id)) else {
            return Ok(Vec::new());
        };

        let before = channel.len();
        let result = driver.on_bulk_response(channel, response);
        let persisted = if channel.len() > before {
            persist_channel(self.store.as_ref(), &self.identity, channel).await
        } else {
            Ok(())
        };

        // The request is gone from `pending`, so a session left behind here
        // would never finish or expire.
        if let Err(e) = persisted {
            self.end_session(channel_id, from);
            warn!(channel = %channel_id, peer = %from, error = %e, "sync session terminated");
            return Err(e);
        }
        match result {
            Ok(action) => Ok(self.dispatch(channel_id, from, action)),
            Err(e) => Err(self.terminate(channel_id, from, e)),
        }
    }

    async fn on_invite(&mut self, from: PeerId, encrypted_chain: &[u8]) -> Result<Outgoing> {
        let invite = Invite::from_bytes(encrypted_chain)?;
        let (index, payload) = self
            .invite_secrets
            .iter()
            .enumerate()
            .find_map(|(i, secret)| invite.open(secret).ok().map(|payload| (i, payload)))
            .ok_or(NodeError::NoMatchingInvite(from))?;

        // Redeeming registers the chain, so the root is checked first.
        let secret = &self.invite_secrets[index];
        let channel_id = payload.channel_id();
        let joined = if self.channels.contains_key(&channel_id) {
            None
        } else {
            Some(Channel::new(
                payload.channel_public_key,
                payload.channel_name,
                payload.root,
            )?)
        };

        invite.redeem(&mut self.identity, secret, now())?;
        self.invite_secrets.remove(index);
        self.store
            .put_cbor(&identity_key(self.identity.name()), &self.identity.to_record())
            .await?;
        if let Some(channel) = joined {
            persist_channel(self.store.as_ref(), &self.identity, &channel).await?;
            self.channels.insert(channel_id, channel);
        }
        self.peers.insert(from);
        info!(channel = %channel_id, peer = %from, "joined channel");

        if self.config.auto_sync_on_notification {
            self.sync_with(from, &channel_id)
        } else {
            Ok(Vec::new())
        }
    }

    fn on_error(&mut self, from: PeerId, request_id: u64, code: ErrorCode, message: String) -> Result<Outgoing> {
        let Some((channel_id, _)) = self.pending.remove(&(from, request_id)) else {
            warn!(peer = %from, request_id, ?code, %message, "peer reported error");
            return Ok(Vec::new());
        };
        Err(self.terminate(channel_id, from, SyncError::PeerError { code, message }))
    }

    fn end_session(&mut self, channel_id: ChannelId, peer: PeerId) {
        self.drivers.remove(&(channel_id, peer));
        self.resync.remove(&(channel_id, peer));
    }

    fn terminate(&mut self, channel_id: ChannelId, peer: PeerId, error: SyncError) -> NodeError {
        self.end_session(channel_id, peer);
        warn!(channel = %channel_id, %peer, %error, "sync session terminated");
        error.into()
    }

    fn next_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        id
    }

    fn dispatch(&mut self, channel_id: ChannelId, peer: PeerId, action: SyncAction) -> Outgoing {
        match action {
            SyncAction::Query(request) => {
                let request_id = self.next_request_id();
                self.pending.insert((peer, request_id), (channel_id, Instant::now()));
                vec![(
                    peer,
                    Packet::Query {
                        request_id,
                        channel_id,
                        request,
                    },
                )]
            }
            SyncAction::Bulk(request) => {
                let request_id = self.next_request_id();
                self.pending.insert((peer, request_id), (channel_id, Instant::now()));
                vec![(
                    peer,
                    Packet::Bulk {
                        request_id,
                        channel_id,
                        request,
                    },
                )]
            }
            SyncAction::Done(report) => {
                self.drivers.remove(&(channel_id, peer));
                let digest = self.channels.get(&channel_id).map(ChannelDigest::compute);
                info!(
                    channel = %channel_id,
                    %peer,
                    received = report.received_count,
                    outcome = ?report.outcome,
                    messages = digest.as_ref().map(|d| d.message_count),
                    order_hash = ?digest.as_ref().map(|d| d.order_hash),
                    "sync epoch complete"
                );
                let mut outgoing = if report.received_count > 0 {
                    self.notify(&channel_id, Some(&peer))
                } else {
                    Vec::new()
                };
                self.reports.insert((channel_id, peer), report);

                if self.resync.remove(&(channel_id, peer)) {
                    if let Ok(restart) = self.sync_with(peer, &channel_id) {
                        outgoing.extend(restart);
                    }
                }
                outgoing
            }
        }
    }
}

impl<S: Store> std::fmt::Debug for Node<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("identity", &self.identity.name())
            .field("peer_id", &self.peer_id)
            .field("channels", &self.channels.len())
            .field("peers", &self.peers.len())
            .field("syncing", &self.drivers.len())
            .finish()
    }
}

fn error_packet(request_id: u64, code: ErrorCode, message: impl Into<String>) -> Packet {
    Packet::Error {
        request_id,
        code,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use weft_channel::Cursor;
    use weft_identity::ChannelInfo;
    use weft_store::{MemoryStore, StoreError};
    use weft_sync::SyncOutcome;

    type TestNode = Node<Arc<MemoryStore>>;

    /// A memory store whose writes can be switched off.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failing: AtomicBool,
    }

    impl FlakyStore {
        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn get(&self, key: &str) -> weft_store::Result<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: &[u8]) -> weft_store::Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::other("disk full")));
            }
            self.inner.put(key, value).await
        }

        async fn delete(&self, key: &str) -> weft_store::Result<bool> {
            self.inner.delete(key).await
        }

        async fn keys_with_prefix(&self, prefix: &str) -> weft_store::Result<Vec<String>> {
            self.inner.keys_with_prefix(prefix).await
        }
    }

    async fn node(name: &str) -> TestNode {
        Node::create(name, Arc::new(MemoryStore::new()), NodeConfig::default())
            .await
            .unwrap()
    }

    /// Pass packets between two nodes until neither has anything to say,
    /// collecting handling errors.
    async fn exchange<A: Store, B: Store>(
        a: &mut Node<A>,
        b: &mut Node<B>,
        from: PeerId,
        outgoing: Outgoing,
    ) -> Vec<NodeError> {
        let mut errors = Vec::new();
        let mut queue: VecDeque<(PeerId, PeerId, Packet)> =
            outgoing.into_iter().map(|(to, p)| (from, to, p)).collect();
        while let Some((sender, to, packet)) = queue.pop_front() {
            let result = if to == a.peer_id() {
                a.handle_packet(sender, packet).await
            } else {
                b.handle_packet(sender, packet).await
            };
            match result {
                Ok(replies) => queue.extend(replies.into_iter().map(|(next, p)| (to, next, p))),
                Err(e) => errors.push(e),
            }
        }
        errors
    }

    async fn deliver(a: &mut TestNode, b: &mut TestNode, from: PeerId, outgoing: Outgoing) {
        let errors = exchange(a, b, from, outgoing).await;
        assert!(errors.is_empty(), "{errors:?}");
    }

    /// `owner` creates a channel and invites `guest`.
    async fn invited_pair() -> (TestNode, TestNode, ChannelId) {
        let mut owner = node("owner").await;
        let mut guest = node("guest").await;
        let channel_id = owner.create_channel("general").await.unwrap();

        let request = guest.request_invite();
        let invite = owner.issue_invite(&request, &channel_id).unwrap();
        let owner_id = owner.peer_id();
        let guest_id = guest.peer_id();
        deliver(&mut owner, &mut guest, owner_id, vec![(guest_id, invite)]).await;
        (owner, guest, channel_id)
    }

    #[tokio::test]
    async fn test_create_persists_identity() {
        let store = MemoryStore::new();
        let node = Node::create("alice", store, NodeConfig::default()).await.unwrap();
        assert!(node.store().contains("identity/alice").await.unwrap());
        assert_eq!(node.peer_id(), PeerId::from_public_key(&node.identity().public_key()));
    }

    #[tokio::test]
    async fn test_one_channel_per_identity() {
        let mut node = node("alice").await;
        let channel_id = node.create_channel("a").await.unwrap();

        let err = node.create_channel("b").await.unwrap_err();
        assert!(matches!(err, NodeError::ChannelExists(id) if id == channel_id));
    }

    #[tokio::test]
    async fn test_post_notifies_peers() {
        let mut node = node("alice").await;
        let channel_id = node.create_channel("a").await.unwrap();
        let peer = PeerId::from_bytes([7; 32]);
        assert!(node.add_peer(peer));

        let (hash, outgoing) = node.post_text(&channel_id, "hi").await.unwrap();

        assert!(node.channel(&channel_id).unwrap().contains(&hash));
        assert_eq!(outgoing, vec![(peer, Packet::Notification { channel_id })]);
    }

    #[tokio::test]
    async fn test_post_to_unknown_channel() {
        let mut node = node("alice").await;
        let missing = ChannelId::from_bytes([1; 32]);

        let err = node.post_text(&missing, "hi").await.unwrap_err();
        assert!(matches!(err, NodeError::UnknownChannel(_)));
    }

    #[tokio::test]
    async fn test_query_unknown_channel_answers_error() {
        let mut node = node("alice").await;
        let peer = PeerId::from_bytes([7; 32]);

        let replies = node
            .handle_packet(
                peer,
                Packet::Query {
                    request_id: 5,
                    channel_id: ChannelId::from_bytes([1; 32]),
                    request: QueryRequest::forward(Cursor::Height(0)),
                },
            )
            .await
            .unwrap();

        assert!(matches!(
            replies.as_slice(),
            [(p, Packet::Error { request_id: 5, code: ErrorCode::UnknownChannel, .. })] if *p == peer
        ));
    }

    #[tokio::test]
    async fn test_query_unknown_cursor_answers_error() {
        let mut node = node("alice").await;
        let channel_id = node.create_channel("a").await.unwrap();

        let replies = node
            .handle_packet(
                PeerId::from_bytes([7; 32]),
                Packet::Query {
                    request_id: 6,
                    channel_id,
                    request: QueryRequest::forward(Cursor::Hash(MessageHash::from_bytes([9; 32]))),
                },
            )
            .await
            .unwrap();

        assert!(matches!(
            replies.as_slice(),
            [(_, Packet::Error { code: ErrorCode::UnknownCursor, .. })]
        ));
    }

    #[tokio::test]
    async fn test_invite_joins_channel() {
        let (owner, guest, channel_id) = invited_pair().await;

        let joined = guest.channel(&channel_id).unwrap();
        assert_eq!(joined.root_hash(), owner.channel(&channel_id).unwrap().root_hash());
        assert!(guest
            .identity()
            .chain_for(&channel_id, joined.public_key())
            .is_some());
        assert!(guest.peers().any(|p| *p == owner.peer_id()));
        assert!(owner.peers().any(|p| *p == guest.peer_id()));
    }

    #[tokio::test]
    async fn test_invite_without_request_rejected() {
        let mut owner = node("owner").await;
        let mut stranger = node("stranger").await;
        let mut other = node("other").await;
        let channel_id = owner.create_channel("general").await.unwrap();

        let request = other.request_invite();
        let invite = owner.issue_invite(&request, &channel_id).unwrap();

        let err = stranger.handle_packet(owner.peer_id(), invite).await.unwrap_err();
        assert!(matches!(err, NodeError::NoMatchingInvite(_)));
        assert!(stranger.channel(&channel_id).is_none());
    }

    #[tokio::test]
    async fn test_invite_with_bad_root_adds_no_chain() {
        let mut owner = node("owner").await;
        let mut other = node("other").await;
        let mut guest = node("guest").await;
        let channel_id = owner.create_channel("general").await.unwrap();
        let other_id = other.create_channel("elsewhere").await.unwrap();

        let request = guest.request_invite();
        let info = ChannelInfo {
            root: other.channel(&other_id).unwrap().root().envelope.clone(),
            ..owner.channel(&channel_id).unwrap().info()
        };
        let invite = Invite::issue(owner.identity(), &request, info, None, now()).unwrap();
        let packet = Packet::Invite {
            encrypted_chain: invite.to_bytes().unwrap(),
        };

        let err = guest.handle_packet(owner.peer_id(), packet).await.unwrap_err();
        assert!(matches!(err, NodeError::Channel(_)));
        assert!(guest.channel(&channel_id).is_none());
        let owner_key = owner.identity().public_key();
        assert!(guest.identity().chain_for(&channel_id, &owner_key).is_none());
        let stored: IdentityRecord = guest
            .store()
            .get_cbor("identity/guest")
            .await
            .unwrap()
            .unwrap();
        let reloaded = Identity::from_record(stored).unwrap();
        assert!(reloaded.chain_for(&channel_id, &owner_key).is_none());
    }

    #[tokio::test]
    async fn test_hello_world_via_notifications() {
        let (mut owner, mut guest, channel_id) = invited_pair().await;
        let owner_id = owner.peer_id();
        let guest_id = guest.peer_id();

        let (hello, outgoing) = owner.post_text(&channel_id, "hello").await.unwrap();
        deliver(&mut owner, &mut guest, owner_id, outgoing).await;
        let (world, outgoing) = guest.post_text(&channel_id, "world").await.unwrap();
        deliver(&mut owner, &mut guest, guest_id, outgoing).await;

        // The guest pulled "hello" before posting, so "world" builds on it.
        let a = owner.channel(&channel_id).unwrap();
        let b = guest.channel(&channel_id).unwrap();
        assert_eq!(b.get(&world).unwrap().message.parents, vec![hello]);
        assert_eq!(a.leaves(), vec![world]);
        assert_eq!(a.order(), vec![a.root_hash(), hello, world]);
        assert_eq!(a.order(), b.order());
        assert_eq!(owner.digest(&channel_id).unwrap(), guest.digest(&channel_id).unwrap());
        assert_eq!(
            owner.last_report(&channel_id, &guest_id).unwrap().outcome,
            SyncOutcome::Complete
        );
    }

    #[tokio::test]
    async fn test_concurrent_posts_converge() {
        let (mut owner, mut guest, channel_id) = invited_pair().await;
        let owner_id = owner.peer_id();
        let guest_id = guest.peer_id();

        let (hello, _) = owner.post_text(&channel_id, "hello").await.unwrap();
        let (world, _) = guest.post_text(&channel_id, "world").await.unwrap();

        let outgoing = owner.sync_with(guest_id, &channel_id).unwrap();
        deliver(&mut owner, &mut guest, owner_id, outgoing).await;
        let outgoing = guest.sync_with(owner_id, &channel_id).unwrap();
        deliver(&mut owner, &mut guest, guest_id, outgoing).await;

        let mut expected = vec![hello, world];
        expected.sort();
        assert_eq!(owner.channel(&channel_id).unwrap().leaves(), expected);
        assert_eq!(guest.channel(&channel_id).unwrap().leaves(), expected);
    }

    #[tokio::test]
    async fn test_error_packet_ends_session() {
        let (mut owner, guest, channel_id) = invited_pair().await;
        let guest_id = guest.peer_id();

        let outgoing = owner.sync_with(guest_id, &channel_id).unwrap();
        let request_id = outgoing[0].1.request_id().unwrap();
        assert!(owner.is_syncing(&channel_id, &guest_id));

        let err = owner
            .handle_packet(
                guest_id,
                Packet::Error {
                    request_id,
                    code: ErrorCode::Internal,
                    message: "disk full".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Sync(SyncError::PeerError { code: ErrorCode::Internal, .. })));
        assert!(!owner.is_syncing(&channel_id, &guest_id));
    }

    #[tokio::test]
    async fn test_stale_response_ignored_after_restart() {
        let (mut owner, guest, channel_id) = invited_pair().await;
        let guest_id = guest.peer_id();

        let first = owner.sync_with(guest_id, &channel_id).unwrap();
        let stale_id = first[0].1.request_id().unwrap();
        owner.sync_with(guest_id, &channel_id).unwrap();

        let replies = owner
            .handle_packet(
                guest_id,
                Packet::QueryResponse {
                    request_id: stale_id,
                    response: QueryResponse {
                        abbreviated: vec![],
                        forward_hash: None,
                        backward_hash: None,
                    },
                },
            )
            .await
            .unwrap();
        assert!(replies.is_empty());
        assert!(owner.is_syncing(&channel_id, &guest_id));
    }

    #[tokio::test]
    async fn test_unanswered_request_expires() {
        let mut config = NodeConfig::default();
        config.sync.message_timeout = Duration::ZERO;
        let mut node = Node::create("alice", Arc::new(MemoryStore::new()), config)
            .await
            .unwrap();
        let channel_id = node.create_channel("a").await.unwrap();
        let peer = PeerId::from_bytes([3; 32]);

        let outgoing = node.sync_with(peer, &channel_id).unwrap();
        assert_eq!(outgoing.len(), 1);
        assert!(node.is_syncing(&channel_id, &peer));

        assert_eq!(node.expire_requests(), vec![(channel_id, peer)]);
        assert!(!node.is_syncing(&channel_id, &peer));
        assert!(node.expire_requests().is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_ends_bulk_session() {
        let mut owner = node("owner").await;
        let store = Arc::new(FlakyStore::default());
        let mut guest = Node::create("guest", Arc::clone(&store), NodeConfig::default())
            .await
            .unwrap();
        let channel_id = owner.create_channel("general").await.unwrap();
        let owner_id = owner.peer_id();
        let guest_id = guest.peer_id();

        let request = guest.request_invite();
        let invite = owner.issue_invite(&request, &channel_id).unwrap();
        let errors = exchange(&mut owner, &mut guest, owner_id, vec![(guest_id, invite)]).await;
        assert!(errors.is_empty(), "{errors:?}");

        store.set_failing(true);
        let (_, outgoing) = owner.post_text(&channel_id, "hello").await.unwrap();
        let errors = exchange(&mut owner, &mut guest, owner_id, outgoing).await;
        assert!(matches!(errors.as_slice(), [NodeError::Store(_)]));
        assert!(!guest.is_syncing(&channel_id, &owner_id));

        // Once storage recovers the next notification syncs again.
        store.set_failing(false);
        let (again, outgoing) = owner.post_text(&channel_id, "again").await.unwrap();
        let errors = exchange(&mut owner, &mut guest, owner_id, outgoing).await;
        assert!(errors.is_empty(), "{errors:?}");
        assert!(guest.channel(&channel_id).unwrap().contains(&again));
        assert!(!guest.is_syncing(&channel_id, &owner_id));

        let restored = Node::load("guest", Arc::clone(&store), NodeConfig::default())
            .await
            .unwrap();
        assert!(restored.channel(&channel_id).unwrap().contains(&again));
    }

    #[tokio::test]
    async fn test_shared_store_keeps_channels_apart() {
        let store = Arc::new(MemoryStore::new());
        let mut alice = Node::create("alice", Arc::clone(&store), NodeConfig::default())
            .await
            .unwrap();
        let mut bob = Node::create("bob", Arc::clone(&store), NodeConfig::default())
            .await
            .unwrap();
        let alice_channel = alice.create_channel("a").await.unwrap();
        let bob_channel = bob.create_channel("b").await.unwrap();

        let restored = Node::load("alice", Arc::clone(&store), NodeConfig::default())
            .await
            .unwrap();
        assert_eq!(restored.channel_ids(), vec![alice_channel]);
        let restored = Node::load("bob", store, NodeConfig::default()).await.unwrap();
        assert_eq!(restored.channel_ids(), vec![bob_channel]);
    }

    #[tokio::test]
    async fn test_remove_peer_drops_sessions() {
        let (mut owner, guest, channel_id) = invited_pair().await;
        let guest_id = guest.peer_id();
        owner.sync_with(guest_id, &channel_id).unwrap();

        assert!(owner.remove_peer(&guest_id));
        assert!(!owner.is_syncing(&channel_id, &guest_id));
        let (_, outgoing) = owner.post_text(&channel_id, "alone").await.unwrap();
        assert!(outgoing.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_sees_remote_messages() {
        let (mut owner, mut guest, channel_id) = invited_pair().await;
        let owner_id = owner.peer_id();
        let mut events = guest.subscribe(&channel_id).unwrap();

        let (hello, outgoing) = owner.post_text(&channel_id, "hello").await.unwrap();
        deliver(&mut owner, &mut guest, owner_id, outgoing).await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.hash, hello);
        assert_eq!(event.message.body().text(), Some("hello"));
    }

    #[tokio::test]
    async fn test_load_restores_channels_and_chains() {
        let (_owner, guest, channel_id) = invited_pair().await;
        let store = guest.store().clone();

        let restored = Node::load("guest", store, NodeConfig::default()).await.unwrap();
        assert_eq!(restored.channel_ids(), vec![channel_id]);
        assert_eq!(restored.identity().public_key(), guest.identity().public_key());
        let channel = restored.channel(&channel_id).unwrap();
        assert!(restored
            .identity()
            .chain_for(&channel_id, channel.public_key())
            .is_some());
    }

    #[tokio::test]
    async fn test_load_missing_identity() {
        let err = Node::load("nobody", MemoryStore::new(), NodeConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::IdentityNotFound(name) if name == "nobody"));
    }
}
