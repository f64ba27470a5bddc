//! The channel store.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use weft_core::{
    now, Body, Chain, ChannelId, ChannelKey, ChannelMessage, Ed25519PublicKey, MessageEnvelope,
    MessageHash, Timestamp, FUTURE_SKEW, MAX_PARENT_DELTA,
};
use weft_identity::{ChannelInfo, Identity};

use crate::error::{ChannelError, Result};
use crate::events::{ChannelEvent, EventOrigin, EVENT_CAPACITY};
use crate::query::{
    AbbreviatedMessage, BulkRequest, BulkResponse, Cursor, QueryRequest, QueryResponse, SYNC_LIMIT,
};
use crate::snapshot::ChannelSnapshot;

/// Maximum channel name length in bytes.
pub const MAX_NAME_LEN: usize = 128;

/// Maximum parents a message may name. A post builds on at most this many
/// of the newest leaves; the rest are picked up by later posts.
pub const MAX_PARENTS: usize = 256;

/// An appended message with its cached hash and wire form.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub hash: MessageHash,
    pub envelope: MessageEnvelope,
    pub message: ChannelMessage,
}

/// Outcome of [`Channel::receive`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveResult {
    Accepted {
        hash: MessageHash,
        message: ChannelMessage,
    },
    /// Already stored; nothing changed.
    Duplicate(MessageHash),
}

impl ReceiveResult {
    pub fn hash(&self) -> MessageHash {
        match self {
            ReceiveResult::Accepted { hash, .. } => *hash,
            ReceiveResult::Duplicate(hash) => *hash,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, ReceiveResult::Duplicate(_))
    }
}

/// A channel's message DAG.
pub struct Channel {
    public_key: Ed25519PublicKey,
    channel_id: ChannelId,
    name: String,
    key: ChannelKey,
    root_hash: MessageHash,

    /// Canonical order.
    messages: BTreeMap<(u64, MessageHash), StoredMessage>,
    /// Hash to height, for lookups into `messages`.
    index: HashMap<MessageHash, u64>,
    /// Every hash named as a parent by some stored message.
    referenced: HashSet<MessageHash>,
    /// Stored hashes nobody references.
    frontier: BTreeSet<MessageHash>,
    /// The frontier minus entries too old to build on.
    leaves: BTreeSet<MessageHash>,

    events: broadcast::Sender<ChannelEvent>,
}

impl Channel {
    /// Construct a channel from its public key, name and encrypted root.
    pub fn new(public_key: Ed25519PublicKey, name: impl Into<String>, root: MessageEnvelope) -> Result<Self> {
        let name = name.into();
        if name.len() > MAX_NAME_LEN {
            return Err(ChannelError::NameTooLong {
                len: name.len(),
                max: MAX_NAME_LEN,
            });
        }
        public_key
            .validate()
            .map_err(|_| ChannelError::InvalidPublicKey)?;
        if !root.is_encrypted() {
            return Err(ChannelError::RootMustBeEncrypted);
        }

        let channel_id = ChannelId::derive(&public_key);
        let key = ChannelKey::derive(&public_key);
        let message = root
            .open(&key)
            .map_err(|_| ChannelError::InvalidRoot("cannot be decrypted with the channel key"))?;

        if !message.parents.is_empty() {
            return Err(ChannelError::InvalidRoot("root has parents"));
        }
        if message.height != 0 {
            return Err(ChannelError::InvalidRoot("root height is not zero"));
        }
        if !message.content.chain.is_empty() {
            return Err(ChannelError::InvalidRoot("root must be signed by the channel key"));
        }
        if message.content.body != Body::Root {
            return Err(ChannelError::InvalidRoot("root body is not a root marker"));
        }
        if !message.timestamp().is_finite() {
            return Err(ChannelError::InvalidRoot("root timestamp is not finite"));
        }
        message
            .verify(&public_key, &channel_id)
            .map_err(|_| ChannelError::InvalidRoot("signature does not verify"))?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let root_hash = root.hash();
        let mut channel = Self {
            public_key,
            channel_id,
            name,
            key,
            root_hash,
            messages: BTreeMap::new(),
            index: HashMap::new(),
            referenced: HashSet::new(),
            frontier: BTreeSet::new(),
            leaves: BTreeSet::new(),
            events,
        };
        channel.append(StoredMessage {
            hash: root_hash,
            envelope: root,
            message,
        });
        Ok(channel)
    }

    /// Create a new channel owned by `owner`, with a self-signed root.
    pub fn create(owner: &Identity, name: impl Into<String>) -> Result<Self> {
        Self::create_at(owner, name, now())
    }

    pub fn create_at(owner: &Identity, name: impl Into<String>, timestamp: Timestamp) -> Result<Self> {
        let public_key = owner.public_key();
        let content = owner.sign_content(Chain::empty(), timestamp, Body::Root, &[], 0);
        let root = ChannelMessage::new(content, 0, Vec::new()).seal(&ChannelKey::derive(&public_key))?;
        let channel = Self::new(public_key, name, root)?;
        info!(channel = %channel.channel_id, name = %channel.name, "created channel");
        Ok(channel)
    }

    pub fn public_key(&self) -> &Ed25519PublicKey {
        &self.public_key
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_hash(&self) -> MessageHash {
        self.root_hash
    }

    /// What an invite into this channel needs to carry.
    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            public_key: self.public_key,
            name: self.name.clone(),
            root: self.root().envelope.clone(),
        }
    }

    pub fn root(&self) -> &StoredMessage {
        // The root is always stored at (0, root_hash).
        &self.messages[&(0, self.root_hash)]
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Always false: a channel holds at least its root.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, hash: &MessageHash) -> bool {
        self.index.contains_key(hash)
    }

    pub fn get(&self, hash: &MessageHash) -> Option<&StoredMessage> {
        let height = self.index.get(hash)?;
        self.messages.get(&(*height, *hash))
    }

    /// Messages in canonical order.
    pub fn messages(&self) -> impl Iterator<Item = &StoredMessage> {
        self.messages.values()
    }

    /// Hashes in canonical order.
    pub fn order(&self) -> Vec<MessageHash> {
        self.messages.keys().map(|(_, hash)| *hash).collect()
    }

    /// Current leaves, sorted by hash.
    pub fn leaves(&self) -> Vec<MessageHash> {
        self.leaves.iter().copied().collect()
    }

    pub fn min_leaf_height(&self) -> u64 {
        self.leaves
            .iter()
            .filter_map(|hash| self.index.get(hash))
            .copied()
            .min()
            .unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Post a message as `identity` at the current time.
    pub fn post(&mut self, body: Body, identity: &Identity) -> Result<MessageEnvelope> {
        self.post_at(body, identity, now())
    }

    /// Post a message on top of the current leaves.
    ///
    /// The timestamp is raised to the newest leaf's so the message is never
    /// older than its parents.
    pub fn post_at(&mut self, body: Body, identity: &Identity, timestamp: Timestamp) -> Result<MessageEnvelope> {
        let chain = identity
            .chain_for(&self.channel_id, &self.public_key)
            .ok_or(ChannelError::NoChainFound(self.channel_id))?;

        let parents = self.newest_leaves(MAX_PARENTS);
        let mut height = 0;
        let mut newest = Timestamp::NEG_INFINITY;
        for hash in &parents {
            if let Some(stored) = self.get(hash) {
                height = height.max(stored.message.height);
                newest = newest.max(stored.message.timestamp());
            }
        }
        let height = height + 1;
        let timestamp = timestamp.max(newest);

        let content = identity.sign_content(chain, timestamp, body, &parents, height);
        let message = ChannelMessage::new(content, height, parents);
        message.verify(&self.public_key, &self.channel_id)?;

        let envelope = message.seal(&self.key)?;
        let hash = envelope.hash();
        self.append(StoredMessage {
            hash,
            envelope: envelope.clone(),
            message: message.clone(),
        });
        debug!(channel = %self.channel_id, %hash, height, "posted message");
        self.emit(hash, message, EventOrigin::Local);
        Ok(envelope)
    }

    /// Receive an envelope from a peer, validated against the current time.
    pub fn receive(&mut self, envelope: &MessageEnvelope) -> Result<ReceiveResult> {
        self.receive_at(envelope, now())
    }

    /// Validate and append an envelope.
    ///
    /// Checks run in a fixed order and stop at the first failure. A message
    /// that is already stored passes every check and comes back as
    /// [`ReceiveResult::Duplicate`].
    pub fn receive_at(&mut self, envelope: &MessageEnvelope, now: Timestamp) -> Result<ReceiveResult> {
        let result = self.validate_and_append(envelope, now);
        match &result {
            Ok(ReceiveResult::Accepted { hash, message }) => {
                debug!(channel = %self.channel_id, %hash, height = message.height, "accepted message");
                self.emit(*hash, message.clone(), EventOrigin::Remote);
            }
            Ok(ReceiveResult::Duplicate(_)) => {}
            Err(e) => {
                warn!(channel = %self.channel_id, hash = %envelope.hash(), error = %e, "rejected message");
            }
        }
        result
    }

    fn validate_and_append(&mut self, envelope: &MessageEnvelope, now: Timestamp) -> Result<ReceiveResult> {
        if !envelope.is_encrypted() {
            return Err(ChannelError::IncomingMessageNotEncrypted);
        }

        let message = envelope.open(&self.key)?;
        message.verify(&self.public_key, &self.channel_id)?;

        let hash = envelope.hash();
        if message.parents.is_empty() {
            if hash != self.root_hash {
                return Err(ChannelError::InvalidParentCount);
            }
            return Ok(ReceiveResult::Duplicate(hash));
        }
        if message.parents.len() > MAX_PARENTS {
            return Err(ChannelError::InvalidParentCount);
        }

        let mut max_height = 0;
        let mut min_ts = Timestamp::INFINITY;
        let mut max_ts = Timestamp::NEG_INFINITY;
        for parent in &message.parents {
            let stored = self
                .get(parent)
                .ok_or(ChannelError::ParentNotFound(*parent))?;
            max_height = max_height.max(stored.message.height);
            min_ts = min_ts.min(stored.message.timestamp());
            max_ts = max_ts.max(stored.message.timestamp());
        }

        let expected = max_height + 1;
        if message.height != expected {
            return Err(ChannelError::InvalidHeight {
                expected,
                got: message.height,
            });
        }

        let timestamp = message.timestamp();
        let latest = now + FUTURE_SKEW;
        if !timestamp.is_finite() || timestamp < max_ts || timestamp >= latest {
            return Err(ChannelError::InvalidTimestamp {
                timestamp,
                min: max_ts,
                max: latest,
            });
        }

        let spread = max_ts - min_ts;
        if spread > MAX_PARENT_DELTA {
            return Err(ChannelError::ParentTooFarInThePast {
                spread,
                max: MAX_PARENT_DELTA,
            });
        }

        if self.contains(&hash) {
            return Ok(ReceiveResult::Duplicate(hash));
        }

        self.append(StoredMessage {
            hash,
            envelope: envelope.clone(),
            message: message.clone(),
        });
        Ok(ReceiveResult::Accepted { hash, message })
    }

    fn append(&mut self, stored: StoredMessage) {
        let hash = stored.hash;
        let height = stored.message.height;

        for parent in &stored.message.parents {
            self.referenced.insert(*parent);
            self.frontier.remove(parent);
        }
        if !self.referenced.contains(&hash) {
            self.frontier.insert(hash);
        }
        self.index.insert(hash, height);
        self.messages.insert((height, hash), stored);
        self.recompute_leaves();
    }

    /// Up to `limit` leaves, newest first by timestamp, returned in hash
    /// order.
    fn newest_leaves(&self, limit: usize) -> Vec<MessageHash> {
        let mut leaves: Vec<(Timestamp, MessageHash)> = self
            .leaves
            .iter()
            .filter_map(|hash| self.timestamp_of(hash).map(|ts| (ts, *hash)))
            .collect();
        if leaves.len() > limit {
            leaves.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
            leaves.truncate(limit);
        }
        let mut parents: Vec<MessageHash> = leaves.into_iter().map(|(_, hash)| hash).collect();
        parents.sort();
        parents
    }

    fn timestamp_of(&self, hash: &MessageHash) -> Option<Timestamp> {
        self.get(hash).map(|stored| stored.message.timestamp())
    }

    /// Leaves are the frontier entries within [`MAX_PARENT_DELTA`] of the
    /// newest one.
    fn recompute_leaves(&mut self) {
        let newest = self
            .frontier
            .iter()
            .filter_map(|hash| self.timestamp_of(hash))
            .fold(Timestamp::NEG_INFINITY, Timestamp::max);
        let cutoff = newest - MAX_PARENT_DELTA;

        self.leaves = self
            .frontier
            .iter()
            .filter(|hash| self.timestamp_of(hash).is_some_and(|ts| ts >= cutoff))
            .copied()
            .collect();
    }

    fn emit(&self, hash: MessageHash, message: ChannelMessage, origin: EventOrigin) {
        // No subscribers is fine.
        let _ = self.events.send(ChannelEvent {
            channel_id: self.channel_id,
            hash,
            message,
            origin,
        });
    }

    /// Answer a peer's query with a window of the canonical order.
    pub fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let start = match request.cursor {
            Cursor::Height(height) => (height.min(self.min_leaf_height()), MessageHash::ZERO),
            Cursor::Hash(hash) => {
                let height = self
                    .index
                    .get(&hash)
                    .ok_or(ChannelError::UnknownCursor(hash))?;
                (*height, hash)
            }
        };
        let limit = (request.limit as usize).min(SYNC_LIMIT);

        let (window, forward_hash): (Vec<&StoredMessage>, Option<MessageHash>) = if request.is_backward {
            let mut window: Vec<_> = self.messages.range(..start).rev().take(limit).map(|(_, m)| m).collect();
            window.reverse();
            let forward = self.messages.range(start..).next().map(|(_, m)| m.hash);
            (window, forward)
        } else {
            let mut iter = self.messages.range(start..).map(|(_, m)| m);
            let window: Vec<_> = iter.by_ref().take(limit).collect();
            let forward = iter.next().map(|m| m.hash);
            (window, forward)
        };

        let backward_hash = window.first().map(|m| m.hash);
        let abbreviated = window
            .into_iter()
            .map(|m| AbbreviatedMessage {
                hash: m.hash,
                parents: m.message.parents.clone(),
            })
            .collect();

        Ok(QueryResponse {
            abbreviated,
            forward_hash,
            backward_hash,
        })
    }

    /// Answer a peer's bulk fetch.
    ///
    /// Returns stored envelopes in request order, skipping unknown hashes,
    /// and stops once [`SYNC_LIMIT`] envelopes are collected.
    pub fn bulk(&self, request: &BulkRequest) -> BulkResponse {
        let mut messages = Vec::new();
        let mut consumed = 0;
        for hash in &request.hashes {
            if messages.len() == SYNC_LIMIT {
                break;
            }
            if let Some(stored) = self.get(hash) {
                messages.push(stored.envelope.clone());
            }
            consumed += 1;
        }
        BulkResponse {
            messages,
            forward_index: consumed as u32,
        }
    }

    pub fn export(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            public_key: self.public_key,
            name: self.name.clone(),
            root: self.root().envelope.clone(),
            messages: self
                .messages
                .values()
                .filter(|m| m.hash != self.root_hash)
                .map(|m| m.envelope.clone())
                .collect(),
        }
    }

    /// Rebuild a channel by replaying every stored envelope.
    ///
    /// Replay runs the receive checks without the future-timestamp bound,
    /// since the messages were accepted when they arrived.
    pub fn import(snapshot: ChannelSnapshot) -> Result<Self> {
        let mut channel = Self::new(snapshot.public_key, snapshot.name, snapshot.root)?;
        for envelope in &snapshot.messages {
            channel.validate_and_append(envelope, Timestamp::INFINITY)?;
        }
        debug!(channel = %channel.channel_id, messages = channel.len(), "imported channel");
        Ok(channel)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("channel_id", &self.channel_id)
            .field("name", &self.name)
            .field("messages", &self.messages.len())
            .field("leaves", &self.leaves)
            .finish()
    }
}
