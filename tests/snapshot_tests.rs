//! State transfer: log replay on restart and snapshot catch-up

mod common;

use common::{block, Cluster};
use pretty_assertions::assert_eq;
use profile_metastore::compaction::PollCompactionJobsRequest;
use profile_metastore::config::ConfigBuilder;
use profile_metastore::types::MetadataQuery;
use std::time::Duration;

fn all(tenant: &str) -> MetadataQuery {
    MetadataQuery {
        tenants: vec![tenant.to_string()],
        start_time: i64::MIN / 2,
        end_time: i64::MAX / 2,
        matchers: vec![],
        label_names: vec![],
    }
}

fn small_snapshots(builder: ConfigBuilder) -> ConfigBuilder {
    builder.snapshots(16, 4)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_restores_index_and_queues() {
    let mut cluster = Cluster::start(1).await;
    let node = cluster.leader().await;
    for i in 0..13 {
        node.add_block(block(&format!("b{i:02}"), "t1", 1, 1_000)).await.unwrap();
    }
    let leased = node
        .poll_compaction_jobs(PollCompactionJobsRequest {
            updates: vec![],
            capacity: 1,
        })
        .await
        .unwrap();
    assert_eq!(leased.assigned.len(), 1);

    let stats = node.compactor().stats();
    let jobs = node.compactor().jobs();
    drop(node);

    cluster.restart(1).await;
    let node = cluster.leader().await;
    assert_eq!(node.index().block_count(), 13);
    assert_eq!(node.compactor().stats(), stats);
    assert_eq!(node.compactor().jobs(), jobs);
    assert_eq!(node.query_metadata(all("t1")).await.unwrap().len(), 13);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_after_snapshot() {
    let mut cluster = Cluster::start_with(1, small_snapshots).await;
    let node = cluster.leader().await;
    for i in 0..40 {
        node.add_block(block(&format!("b{i:02}"), "t1", i % 3, 1_000)).await.unwrap();
    }
    let stats = node.compactor().stats();
    drop(node);

    cluster.restart(1).await;
    let node = cluster.leader().await;
    assert_eq!(node.index().block_count(), 40);
    assert_eq!(node.compactor().stats(), stats);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lagging_follower_catches_up() {
    let cluster = Cluster::start_with(3, small_snapshots).await;
    let leader = cluster.leader().await;
    cluster.sync().await;

    let lagging = cluster.others(leader.node().id()).remove(0);
    cluster.transport.isolate(lagging.node().id());
    for i in 0..50 {
        leader
            .add_block(block(&format!("b{i:02}"), "t1", i % 2, 1_000 * i as i64))
            .await
            .unwrap();
    }
    // Let the leader snapshot and compact past the follower's position
    tokio::time::sleep(Duration::from_millis(200)).await;
    cluster.transport.heal(lagging.node().id());

    cluster.sync().await;
    assert_eq!(lagging.index().block_count(), 50);
    assert_eq!(lagging.compactor().stats(), leader.compactor().stats());
    assert_eq!(lagging.compactor().jobs(), leader.compactor().jobs());
    assert_eq!(lagging.query_metadata(all("t1")).await.unwrap().len(), 50);
    cluster.shutdown().await;
}
