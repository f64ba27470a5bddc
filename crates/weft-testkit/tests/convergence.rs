//! Replicas that diverged converge once each pulls from the other.

mod common;

use anyhow::Result;
use weft_channel::{Cursor, QueryRequest, MAX_PARENTS};
use weft_core::{now, Body, Chain, ChannelKey, ChannelMessage, MessageEnvelope, MessageHash, Timestamp};
use weft_sync::{verify_convergence, ChannelDigest, Packet, SyncOutcome};
use weft_testkit::fixtures::{sync_channels, ChannelFixture, Cluster};

#[test]
fn disjoint_histories_converge() -> Result<()> {
    common::init_tracing();
    let mut fixture = ChannelFixture::with_messages(1, 5);
    let mut other = fixture.full_replica();

    fixture.post("left 1");
    fixture.post("left 2");
    let t = now() - 3_600.0;
    other.post_at(Body::Text("right 1".into()), &fixture.owner, t)?;
    other.post_at(Body::Text("right 2".into()), &fixture.owner, t + 1.0)?;

    let first = sync_channels(&mut fixture.channel, &other)?;
    let second = sync_channels(&mut other, &fixture.channel)?;

    assert_eq!(first.received_count, 2);
    assert_eq!(second.received_count, 2);
    assert_eq!(first.outcome, SyncOutcome::Complete);
    assert_eq!(fixture.channel.order(), other.order());
    assert_eq!(fixture.channel.leaves().len(), 2);
    assert!(verify_convergence(
        &ChannelDigest::compute(&fixture.channel),
        &ChannelDigest::compute(&other)
    )
    .is_converged());
    Ok(())
}

#[test]
fn merge_post_joins_leaves() -> Result<()> {
    let mut fixture = ChannelFixture::new(2);
    let mut other = fixture.full_replica();

    fixture.post("a");
    other.post_at(Body::Text("b".into()), &fixture.owner, now() - 60.0)?;
    sync_channels(&mut fixture.channel, &other)?;
    assert_eq!(fixture.channel.leaves().len(), 2);

    let merge = fixture.post("merge");
    let message = &fixture.channel.get(&merge).expect("stored").message;
    assert_eq!(message.parents.len(), 2);
    assert_eq!(message.height, 2);
    assert_eq!(fixture.channel.leaves(), vec![merge]);
    Ok(())
}

#[test]
fn resync_is_idempotent() -> Result<()> {
    let fixture = ChannelFixture::with_messages(3, 20);
    let mut replica = fixture.empty_replica();

    let first = sync_channels(&mut replica, &fixture.channel)?;
    let second = sync_channels(&mut replica, &fixture.channel)?;

    assert_eq!(first.received_count, 20);
    assert_eq!(second.received_count, 0);
    assert_eq!(second.bulks_sent, 0);
    assert_eq!(replica.len(), fixture.channel.len());
    Ok(())
}

#[test]
fn long_history_syncs_in_windows() -> Result<()> {
    let fixture = ChannelFixture::with_messages(4, 400);
    let mut replica = fixture.empty_replica();

    let report = sync_channels(&mut replica, &fixture.channel)?;

    assert_eq!(report.received_count, 400);
    assert!(report.queries_sent >= 4);
    assert_eq!(replica.order(), fixture.channel.order());
    Ok(())
}

#[tokio::test]
async fn concurrent_posts_across_cluster_converge() -> Result<()> {
    common::init_tracing();
    let mut cluster = Cluster::invited(4).await?;
    let channel_id = cluster.channel_id();

    for round in 0..3 {
        for index in 0..cluster.len() {
            cluster.post(index, &format!("round {round} from {index}")).await?;
        }
    }

    assert!(cluster.is_converged(&channel_id));
    let digest = &cluster.digests(&channel_id)[0];
    assert_eq!(digest.message_count, 1 + 3 * 4);
    Ok(())
}

#[tokio::test]
async fn mesh_cluster_converges() -> Result<()> {
    let mut cluster = Cluster::invited(3).await?;
    cluster.connect_all();
    let channel_id = cluster.channel_id();

    cluster.post(1, "from a guest").await?;
    cluster.post(2, "from another guest").await?;

    assert!(cluster.is_converged(&channel_id));
    Ok(())
}

/// A height-1 message on top of the root, as a concurrent writer would
/// produce it.
fn branch(fixture: &ChannelFixture, timestamp: Timestamp) -> Result<MessageEnvelope> {
    let parents = vec![fixture.channel.root_hash()];
    let content = fixture.owner.sign_content(
        Chain::empty(),
        timestamp,
        Body::Text(format!("branch at {timestamp}")),
        &parents,
        1,
    );
    let key = ChannelKey::derive(fixture.channel.public_key());
    Ok(ChannelMessage::new(content, 1, parents).seal(&key)?)
}

#[test]
fn wide_merge_stays_within_packet_limits() -> Result<()> {
    let mut fixture = ChannelFixture::new(8);
    let t = now() - 3_600.0;
    for i in 0..MAX_PARENTS + 44 {
        fixture.channel.receive(&branch(&fixture, t + i as f64)?)?;
    }

    let merge: MessageHash = fixture.post("merge");
    let parents = fixture.channel.get(&merge).expect("stored").message.parents.len();
    assert_eq!(parents, MAX_PARENTS);

    let window = fixture
        .channel
        .query(&QueryRequest::forward(Cursor::Hash(merge)))?;
    assert_eq!(window.abbreviated[0].hash, merge);
    let packet = Packet::QueryResponse {
        request_id: 1,
        response: window,
    };
    assert!(packet.validate_limits().is_ok());

    let mut replica = fixture.empty_replica();
    let report = sync_channels(&mut replica, &fixture.channel)?;
    assert_eq!(report.outcome, SyncOutcome::Complete);
    assert_eq!(report.received_count, MAX_PARENTS + 45);
    assert_eq!(replica.order(), fixture.channel.order());
    Ok(())
}
