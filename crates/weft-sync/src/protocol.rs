//! Sync driver state machine.
//!
//! One [`SyncDriver`] pulls a single channel from a single peer. It does no
//! I/O: the caller sends each [`SyncAction`] it returns and feeds the
//! peer's answer back through [`SyncDriver::on_query_response`] or
//! [`SyncDriver::on_bulk_response`].
//!
//! ## Cursor selection
//!
//! Each query window is scanned in order. An entry is committable when
//! every parent is stored locally or was committable earlier in the same
//! window. Committable entries that are not stored yet are fetched. If any
//! entry was not committable the next query walks backward from the
//! window's first entry, otherwise it continues forward past the window.
//!
//! A missing ancestor can sit further back than one backward window
//! reaches, which would make the walk oscillate between two windows. The
//! driver remembers each `(cursor, direction)` it queried along with the
//! local message count at the time. Revisiting one without progress starts
//! a deep backward walk that runs to the start of history and then sweeps
//! forward. A second stall ends the epoch as [`SyncOutcome::Stalled`].

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tracing::{debug, warn};
use weft_channel::{
    BulkRequest, BulkResponse, Channel, Cursor, QueryRequest, QueryResponse, ReceiveResult,
    SYNC_LIMIT,
};
use weft_core::{ChannelId, MessageHash, PeerId};

use crate::error::{Result, Violation};

/// Configuration for sync behavior.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Window size requested per query, capped at [`SYNC_LIMIT`].
    pub query_limit: u32,
    /// How long to wait for a peer's response.
    pub message_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            query_limit: SYNC_LIMIT as u32,
            message_timeout: Duration::from_secs(30),
        }
    }
}

/// How a sync epoch ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Every cursor was exhausted.
    #[default]
    Complete,
    /// The walk revisited a position twice without the local store growing.
    Stalled,
}

/// Result of a sync epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub queries_sent: usize,
    pub bulks_sent: usize,
    /// Messages appended to the local store.
    pub received_count: usize,
    /// Fetched messages that were already stored.
    pub duplicate_count: usize,
    pub outcome: SyncOutcome,
}

/// What the caller should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    Query(QueryRequest),
    Bulk(BulkRequest),
    Done(SyncReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    AwaitingQuery,
    AwaitingBulk,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeepWalk {
    NotTried,
    Active,
    Exhausted,
}

/// Initiator side of a sync session for one channel and one peer.
#[derive(Debug)]
pub struct SyncDriver {
    channel_id: ChannelId,
    peer: PeerId,
    config: SyncConfig,
    phase: Phase,
    /// Hashes of the outstanding bulk request.
    requested: Vec<MessageHash>,
    /// Query to issue once the outstanding bulk completes.
    after_bulk: Option<QueryRequest>,
    visited: HashMap<(Cursor, bool), usize>,
    deep_walk: DeepWalk,
    report: SyncReport,
}

impl SyncDriver {
    pub fn new(channel_id: ChannelId, peer: PeerId, config: SyncConfig) -> Self {
        Self {
            channel_id,
            peer,
            config,
            phase: Phase::Idle,
            requested: Vec::new(),
            after_bulk: None,
            visited: HashMap::new(),
            deep_walk: DeepWalk::NotTried,
            report: SyncReport::default(),
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn report(&self) -> &SyncReport {
        &self.report
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Begin the epoch with a forward query from the lowest local leaf.
    pub fn start(&mut self, channel: &Channel) -> SyncAction {
        debug!(channel = %self.channel_id, peer = %self.peer, "starting sync");
        let request = self.forward(Cursor::Height(channel.min_leaf_height()));
        self.issue_query(channel, request)
    }

    /// Handle the answer to the outstanding query.
    pub fn on_query_response(&mut self, channel: &Channel, response: QueryResponse) -> Result<SyncAction> {
        if self.phase != Phase::AwaitingQuery {
            return Err(Violation::UnexpectedResponse("query").into());
        }
        if response.abbreviated.len() > SYNC_LIMIT {
            return Err(Violation::OversizedQueryResponse {
                got: response.abbreviated.len(),
                max: SYNC_LIMIT,
            }
            .into());
        }

        let mut committable: HashSet<MessageHash> = HashSet::new();
        let mut fetch = Vec::new();
        let mut missing = false;
        for entry in &response.abbreviated {
            let ready = entry
                .parents
                .iter()
                .all(|parent| channel.contains(parent) || committable.contains(parent));
            if !ready {
                missing = true;
                continue;
            }
            if committable.insert(entry.hash) && !channel.contains(&entry.hash) {
                fetch.push(entry.hash);
            }
        }

        if missing && response.backward_hash.is_none() {
            return Err(Violation::MissingBackwardCursor.into());
        }

        let next = if self.deep_walk == DeepWalk::Active {
            match response.backward_hash {
                Some(hash) if !response.abbreviated.is_empty() => Some(self.backward(Cursor::Hash(hash))),
                _ => {
                    debug!(channel = %self.channel_id, peer = %self.peer, "deep walk reached start of history");
                    self.deep_walk = DeepWalk::Exhausted;
                    response.forward_hash.map(|hash| self.forward(Cursor::Hash(hash)))
                }
            }
        } else if missing {
            response.backward_hash.map(|hash| self.backward(Cursor::Hash(hash)))
        } else {
            response.forward_hash.map(|hash| self.forward(Cursor::Hash(hash)))
        };

        debug!(
            channel = %self.channel_id,
            peer = %self.peer,
            window = response.abbreviated.len(),
            fetch = fetch.len(),
            missing,
            "query window scanned"
        );

        if !fetch.is_empty() {
            self.after_bulk = next;
            return Ok(self.issue_bulk(fetch));
        }
        Ok(self.continue_with(channel, next))
    }

    /// Handle the answer to the outstanding bulk request.
    ///
    /// Every returned message is received into `channel`. A message that
    /// fails validation ends the session with its error.
    pub fn on_bulk_response(&mut self, channel: &mut Channel, response: BulkResponse) -> Result<SyncAction> {
        if self.phase != Phase::AwaitingBulk {
            return Err(Violation::UnexpectedResponse("bulk").into());
        }

        let requested = self.requested.len();
        if response.messages.len() > requested {
            return Err(Violation::OversizedBulkResponse {
                got: response.messages.len(),
                requested,
            }
            .into());
        }
        let index = response.forward_index;
        if (index == 0 && requested > 0) || index as usize > requested {
            return Err(Violation::InvalidForwardIndex { index, requested }.into());
        }

        let allowed: HashSet<&MessageHash> = self.requested.iter().collect();
        let mut hashes = Vec::with_capacity(response.messages.len());
        for envelope in &response.messages {
            let hash = envelope.hash();
            if !allowed.contains(&hash) {
                return Err(Violation::UnrequestedHash(hash).into());
            }
            hashes.push(hash);
        }

        for envelope in &response.messages {
            match channel.receive(envelope)? {
                ReceiveResult::Accepted { .. } => self.report.received_count += 1,
                ReceiveResult::Duplicate(_) => self.report.duplicate_count += 1,
            }
        }

        let remaining = self.requested.split_off(index as usize);
        if !remaining.is_empty() {
            debug!(channel = %self.channel_id, peer = %self.peer, remaining = remaining.len(), "continuing bulk");
            return Ok(self.issue_bulk(remaining));
        }

        let next = self.after_bulk.take();
        Ok(self.continue_with(channel, next))
    }

    fn forward(&self, cursor: Cursor) -> QueryRequest {
        QueryRequest::forward(cursor).with_limit(self.query_limit())
    }

    fn backward(&self, cursor: Cursor) -> QueryRequest {
        QueryRequest::backward(cursor).with_limit(self.query_limit())
    }

    fn query_limit(&self) -> u32 {
        self.config.query_limit.clamp(1, SYNC_LIMIT as u32)
    }

    fn continue_with(&mut self, channel: &Channel, next: Option<QueryRequest>) -> SyncAction {
        match next {
            Some(request) => self.issue_query(channel, request),
            None => self.finish(SyncOutcome::Complete),
        }
    }

    fn issue_query(&mut self, channel: &Channel, request: QueryRequest) -> SyncAction {
        let key = (request.cursor, request.is_backward);
        let local = channel.len();

        if self.visited.get(&key) == Some(&local) {
            if self.deep_walk != DeepWalk::NotTried {
                warn!(channel = %self.channel_id, peer = %self.peer, cursor = ?request.cursor, "sync stalled");
                return self.finish(SyncOutcome::Stalled);
            }
            debug!(channel = %self.channel_id, peer = %self.peer, cursor = ?request.cursor, "no progress, starting deep walk");
            self.deep_walk = DeepWalk::Active;
        }

        self.visited.insert(key, local);
        self.phase = Phase::AwaitingQuery;
        self.report.queries_sent += 1;
        SyncAction::Query(request)
    }

    fn issue_bulk(&mut self, hashes: Vec<MessageHash>) -> SyncAction {
        self.requested = hashes.clone();
        self.phase = Phase::AwaitingBulk;
        self.report.bulks_sent += 1;
        SyncAction::Bulk(BulkRequest { hashes })
    }

    fn finish(&mut self, outcome: SyncOutcome) -> SyncAction {
        self.phase = Phase::Done;
        self.requested.clear();
        self.after_bulk = None;
        self.report.outcome = outcome;
        debug!(
            channel = %self.channel_id,
            peer = %self.peer,
            received = self.report.received_count,
            ?outcome,
            "sync epoch finished"
        );
        SyncAction::Done(self.report.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use weft_channel::{AbbreviatedMessage, ChannelError};
    use weft_core::{now, Body, MessageEnvelope, Timestamp};
    use weft_identity::Identity;

    const PEER: PeerId = PeerId::from_bytes([0x99; 32]);

    fn base() -> Timestamp {
        now() - 100_000.0
    }

    fn driver(channel: &Channel) -> SyncDriver {
        SyncDriver::new(*channel.channel_id(), PEER, SyncConfig::default())
    }

    fn text(s: &str) -> Body {
        Body::Text(s.into())
    }

    /// Drive `local` against `remote` until the driver finishes.
    fn run(local: &mut Channel, remote: &Channel) -> Result<SyncReport> {
        let mut driver = driver(local);
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

    fn fetch_hashes(action: SyncAction) -> Vec<MessageHash> {
        match action {
            SyncAction::Bulk(request) => request.hashes,
            other => panic!("expected bulk, got {:?}", other),
        }
    }

    fn query(action: SyncAction) -> QueryRequest {
        match action {
            SyncAction::Query(request) => request,
            other => panic!("expected query, got {:?}", other),
        }
    }

    #[test]
    fn test_hello_world_converges() {
        let owner = Identity::generate("owner");
        let t = base();
        let mut a = Channel::create_at(&owner, "chat", t).unwrap();
        let mut b = Channel::import(a.export()).unwrap();

        let hello = a.post_at(text("hello"), &owner, t + 1.0).unwrap().hash();
        let world = b.post_at(text("world"), &owner, t + 2.0).unwrap().hash();

        run(&mut a, &b).unwrap();
        run(&mut b, &a).unwrap();

        let mut expected_leaves = vec![hello, world];
        expected_leaves.sort();
        assert_eq!(a.leaves(), expected_leaves);
        assert_eq!(b.leaves(), expected_leaves);

        let mut expected_order = vec![a.root_hash()];
        expected_order.extend(expected_leaves);
        assert_eq!(a.order(), expected_order);
        assert_eq!(b.order(), expected_order);
    }

    #[test]
    fn test_long_history_fetched_in_windows() {
        let owner = Identity::generate("owner");
        let t = base();
        let mut remote = Channel::create_at(&owner, "long", t).unwrap();
        let mut local = Channel::import(remote.export()).unwrap();
        for i in 0..300 {
            remote.post_at(text(&format!("m{i}")), &owner, t + 1.0 + i as f64).unwrap();
        }

        let report = run(&mut local, &remote).unwrap();

        assert_eq!(report.outcome, SyncOutcome::Complete);
        assert_eq!(report.received_count, 300);
        assert_eq!(local.order(), remote.order());
        assert!(report.queries_sent >= 3);
    }

    #[test]
    fn test_already_synced_fetches_nothing() {
        let owner = Identity::generate("owner");
        let t = base();
        let mut remote = Channel::create_at(&owner, "same", t).unwrap();
        remote.post_at(text("x"), &owner, t + 1.0).unwrap();
        let mut local = Channel::import(remote.export()).unwrap();

        let report = run(&mut local, &remote).unwrap();
        assert_eq!(report.bulks_sent, 0);
        assert_eq!(report.received_count, 0);
    }

    #[test]
    fn test_deep_missing_ancestor_found() {
        let owner = Identity::generate("owner");
        let t = base();
        let mut remote = Channel::create_at(&owner, "deep", t).unwrap();
        for i in 1..10 {
            remote.post_at(text(&format!("m{i}")), &owner, t + i as f64).unwrap();
        }

        // A side branch off m9 that the local replica never sees directly.
        let mut fork = Channel::import(remote.export()).unwrap();
        let side = fork.post_at(text("side"), &owner, t + 9.5).unwrap();

        for i in 10..=200 {
            remote.post_at(text(&format!("m{i}")), &owner, t + i as f64).unwrap();
        }
        let mut local = Channel::import(remote.export()).unwrap();

        remote.receive(&side).unwrap();
        remote.post_at(text("join"), &owner, t + 300.0).unwrap();
        assert_eq!(remote.len(), local.len() + 2);

        let report = run(&mut local, &remote).unwrap();

        assert_eq!(report.outcome, SyncOutcome::Complete);
        assert_eq!(report.received_count, 2);
        assert_eq!(local.order(), remote.order());
        assert_eq!(local.leaves(), remote.leaves());
    }

    #[test]
    fn test_unresolvable_gap_stalls() {
        let owner = Identity::generate("owner");
        let local = Channel::create_at(&owner, "gap", base()).unwrap();
        let root = local.root_hash();
        let orphan = MessageHash::from_bytes([0xAB; 32]);
        let ghost = MessageHash::from_bytes([0xCD; 32]);

        let gap_window = QueryResponse {
            abbreviated: vec![AbbreviatedMessage {
                hash: orphan,
                parents: vec![ghost],
            }],
            forward_hash: None,
            backward_hash: Some(orphan),
        };
        let root_window = QueryResponse {
            abbreviated: vec![AbbreviatedMessage {
                hash: root,
                parents: vec![],
            }],
            forward_hash: Some(orphan),
            backward_hash: Some(root),
        };
        let empty = QueryResponse {
            abbreviated: vec![],
            forward_hash: Some(root),
            backward_hash: None,
        };

        let mut driver = driver(&local);
        assert_eq!(query(driver.start(&local)).cursor, Cursor::Height(0));

        let q = query(driver.on_query_response(&local, gap_window.clone()).unwrap());
        assert_eq!((q.cursor, q.is_backward), (Cursor::Hash(orphan), true));

        let q = query(driver.on_query_response(&local, root_window.clone()).unwrap());
        assert_eq!((q.cursor, q.is_backward), (Cursor::Hash(orphan), false));

        // Back to the same backward query: deep walk starts.
        let q = query(driver.on_query_response(&local, gap_window.clone()).unwrap());
        assert_eq!((q.cursor, q.is_backward), (Cursor::Hash(orphan), true));

        let q = query(driver.on_query_response(&local, root_window).unwrap());
        assert_eq!((q.cursor, q.is_backward), (Cursor::Hash(root), true));

        let q = query(driver.on_query_response(&local, empty).unwrap());
        assert_eq!((q.cursor, q.is_backward), (Cursor::Hash(root), false));

        let root_forward = QueryResponse {
            abbreviated: vec![
                AbbreviatedMessage {
                    hash: root,
                    parents: vec![],
                },
                AbbreviatedMessage {
                    hash: orphan,
                    parents: vec![ghost],
                },
            ],
            forward_hash: None,
            backward_hash: Some(root),
        };
        // The forward sweep hits the same gap and would walk back again.
        let action = driver.on_query_response(&local, root_forward).unwrap();
        match action {
            SyncAction::Done(report) => assert_eq!(report.outcome, SyncOutcome::Stalled),
            other => panic!("expected stall, got {:?}", other),
        }
        assert!(driver.is_done());
    }

    #[test]
    fn test_oversized_query_response_is_violation() {
        let owner = Identity::generate("owner");
        let local = Channel::create_at(&owner, "big", base()).unwrap();
        let mut driver = driver(&local);
        driver.start(&local);

        let response = QueryResponse {
            abbreviated: vec![
                AbbreviatedMessage {
                    hash: local.root_hash(),
                    parents: vec![],
                };
                SYNC_LIMIT + 1
            ],
            forward_hash: None,
            backward_hash: None,
        };
        let err = driver.on_query_response(&local, response).unwrap_err();
        assert!(matches!(
            err,
            SyncError::ProtocolViolation(Violation::OversizedQueryResponse { got, .. }) if got == SYNC_LIMIT + 1
        ));
    }

    #[test]
    fn test_missing_without_backward_cursor_is_violation() {
        let owner = Identity::generate("owner");
        let local = Channel::create_at(&owner, "nocursor", base()).unwrap();
        let mut driver = driver(&local);
        driver.start(&local);

        let response = QueryResponse {
            abbreviated: vec![AbbreviatedMessage {
                hash: MessageHash::from_bytes([1; 32]),
                parents: vec![MessageHash::from_bytes([2; 32])],
            }],
            forward_hash: None,
            backward_hash: None,
        };
        let err = driver.on_query_response(&local, response).unwrap_err();
        assert!(matches!(
            err,
            SyncError::ProtocolViolation(Violation::MissingBackwardCursor)
        ));
    }

    #[test]
    fn test_response_without_request_is_violation() {
        let owner = Identity::generate("owner");
        let mut local = Channel::create_at(&owner, "idle", base()).unwrap();
        let mut driver = driver(&local);

        let err = driver
            .on_bulk_response(
                &mut local,
                BulkResponse {
                    messages: vec![],
                    forward_index: 0,
                },
            )
            .unwrap_err();
        assert!(err.is_violation());
    }

    /// Local holds the root, remote holds two more messages in a chain.
    fn two_behind() -> (Identity, Channel, Channel, [MessageEnvelope; 2]) {
        let owner = Identity::generate("owner");
        let t = base();
        let mut remote = Channel::create_at(&owner, "bulk", t).unwrap();
        let local = Channel::import(remote.export()).unwrap();
        let first = remote.post_at(text("one"), &owner, t + 1.0).unwrap();
        let second = remote.post_at(text("two"), &owner, t + 2.0).unwrap();
        (owner, local, remote, [first, second])
    }

    fn driver_awaiting_bulk(local: &Channel, remote: &Channel) -> (SyncDriver, Vec<MessageHash>) {
        let mut driver = driver(local);
        let request = query(driver.start(local));
        let response = remote.query(&request).unwrap();
        let hashes = fetch_hashes(driver.on_query_response(local, response).unwrap());
        (driver, hashes)
    }

    #[test]
    fn test_partial_bulk_requests_remainder() {
        let (_owner, mut local, remote, [first, second]) = two_behind();
        let (mut driver, hashes) = driver_awaiting_bulk(&local, &remote);
        assert_eq!(hashes, vec![first.hash(), second.hash()]);

        let partial = BulkResponse {
            messages: vec![first.clone()],
            forward_index: 1,
        };
        let rest = fetch_hashes(driver.on_bulk_response(&mut local, partial).unwrap());
        assert_eq!(rest, vec![second.hash()]);

        let action = driver
            .on_bulk_response(&mut local, remote.bulk(&BulkRequest { hashes: rest }))
            .unwrap();
        let action = match action {
            SyncAction::Query(request) => driver
                .on_query_response(&local, remote.query(&request).unwrap())
                .unwrap(),
            other => other,
        };
        assert!(matches!(action, SyncAction::Done(ref report) if report.received_count == 2));
        assert_eq!(local.order(), remote.order());
    }

    #[test]
    fn test_unrequested_hash_is_violation() {
        let (owner, mut local, remote, _) = two_behind();
        let (mut driver, _) = driver_awaiting_bulk(&local, &remote);

        let mut other = Channel::import(local.export()).unwrap();
        let stray = other.post(text("stray"), &owner).unwrap();
        let err = driver
            .on_bulk_response(
                &mut local,
                BulkResponse {
                    messages: vec![stray.clone()],
                    forward_index: 2,
                },
            )
            .unwrap_err();

        assert!(matches!(
            err,
            SyncError::ProtocolViolation(Violation::UnrequestedHash(h)) if h == stray.hash()
        ));
        assert_eq!(local.len(), 1);
    }

    #[test]
    fn test_bulk_forward_index_checked() {
        let (_owner, mut local, remote, _) = two_behind();

        let (mut driver, _) = driver_awaiting_bulk(&local, &remote);
        let err = driver
            .on_bulk_response(
                &mut local,
                BulkResponse {
                    messages: vec![],
                    forward_index: 0,
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::ProtocolViolation(Violation::InvalidForwardIndex { index: 0, requested: 2 })
        ));

        let (mut driver, _) = driver_awaiting_bulk(&local, &remote);
        let err = driver
            .on_bulk_response(
                &mut local,
                BulkResponse {
                    messages: vec![],
                    forward_index: 3,
                },
            )
            .unwrap_err();
        assert!(err.is_violation());
    }

    #[test]
    fn test_too_many_bulk_messages_is_violation() {
        let (_owner, mut local, remote, [first, second]) = two_behind();
        let (mut driver, _) = driver_awaiting_bulk(&local, &remote);

        let err = driver
            .on_bulk_response(
                &mut local,
                BulkResponse {
                    messages: vec![first.clone(), second.clone(), first],
                    forward_index: 2,
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::ProtocolViolation(Violation::OversizedBulkResponse { got: 3, requested: 2 })
        ));
    }

    #[test]
    fn test_invalid_fetched_message_surfaces() {
        let (_owner, mut local, remote, [_, second]) = two_behind();
        let (mut driver, _) = driver_awaiting_bulk(&local, &remote);

        // The child arrives without its parent.
        let err = driver
            .on_bulk_response(
                &mut local,
                BulkResponse {
                    messages: vec![second],
                    forward_index: 2,
                },
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::Channel(ChannelError::ParentNotFound(_))));
    }
}
