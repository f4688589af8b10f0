//! Store, fetch, and proximity lookup across small meshes.

mod common;

use std::time::Duration;

use cachet::{Address, distance, hashing};
use common::{MemoryHub, mesh, start_node, test_config, wait_until};

/// Rank a set of addresses against a query position the way the protocol
/// does, for computing expected lookup results.
fn global_nearest(query: &[u8], addrs: &[Address], n: usize) -> Vec<Address> {
    let target = distance::query_position(query);
    distance::nearest_addresses(&target, addrs.to_vec(), n)
}

#[tokio::test]
async fn two_node_store_fetch() {
    let hub = MemoryHub::new();
    let a = start_node(&hub, 1, test_config()).await;
    let b = start_node(&hub, 2, test_config()).await;
    mesh(&hub, &[a.clone(), b.clone()]).await;

    let hash = a.store("hello").await.expect("store");
    assert_eq!(hash, hashing::blake2b(b"hello"));

    let fetched = b.fetch(&hash).await.expect("fetch");
    assert_eq!(fetched, Some("hello".to_string()));

    let snapshot = a.telemetry_snapshot().await;
    assert_eq!(snapshot.peers, 1);
    assert_eq!(snapshot.stored_items, 1);
}

#[tokio::test]
async fn fetch_of_unknown_hash_is_not_found() {
    let hub = MemoryHub::new();
    let a = start_node(&hub, 3, test_config()).await;
    let b = start_node(&hub, 4, test_config()).await;
    mesh(&hub, &[a.clone(), b.clone()]).await;

    let missing = hashing::blake2b(b"never stored anywhere");
    assert_eq!(a.fetch(&missing).await.expect("fetch"), None);
}

#[tokio::test]
async fn store_replicates_to_the_swarm() {
    let hub = MemoryHub::new();
    let nodes = vec![
        start_node(&hub, 10, test_config()).await,
        start_node(&hub, 11, test_config()).await,
        start_node(&hub, 12, test_config()).await,
        start_node(&hub, 13, test_config()).await,
        start_node(&hub, 14, test_config()).await,
    ];
    mesh(&hub, &nodes).await;

    let hash = nodes[0].store("replicated payload").await.expect("store");

    let addrs: Vec<Address> = nodes.iter().map(|n| n.address().clone()).collect();
    let expected = global_nearest(hash.tagged().as_bytes(), &addrs, 3);

    for node in &nodes {
        let should_hold = expected.contains(node.address());
        let node = node.clone();
        assert!(
            wait_until(Duration::from_secs(3), move || {
                let node = node.clone();
                async move { node.has_local(&hash).await == should_hold }
            })
            .await,
            "replication placement did not match the swarm"
        );
    }
}

#[tokio::test]
async fn storing_identical_data_is_idempotent() {
    let hub = MemoryHub::new();
    let a = start_node(&hub, 20, test_config()).await;
    let b = start_node(&hub, 21, test_config()).await;
    let c = start_node(&hub, 22, test_config()).await;
    mesh(&hub, &[a.clone(), b.clone(), c.clone()]).await;

    let first = a.store("same bytes").await.expect("store");
    let second = a.store("same bytes").await.expect("store again");
    assert_eq!(first, second);

    for node in [&a, &b, &c] {
        assert!(node.stored_items().await <= 1);
    }
}

#[tokio::test]
async fn full_mesh_lookup_matches_the_global_ranking() {
    let hub = MemoryHub::new();
    let mut nodes = Vec::new();
    for seed in 30..37 {
        nodes.push(start_node(&hub, seed, test_config()).await);
    }
    mesh(&hub, &nodes).await;

    let query = hashing::blake2b(b"banana").tagged();
    let found = nodes[0]
        .nearest_peers(query.as_bytes(), 3)
        .await
        .expect("lookup");

    let addrs: Vec<Address> = nodes.iter().map(|n| n.address().clone()).collect();
    let mut expected = global_nearest(query.as_bytes(), &addrs, 3);
    let mut found_sorted = found.clone();
    found_sorted.sort();
    expected.sort();
    assert_eq!(found_sorted, expected);
}

#[tokio::test]
async fn ring_lookup_terminates_and_never_regresses() {
    let hub = MemoryHub::new();
    let mut nodes = Vec::new();
    for seed in 40..47 {
        nodes.push(start_node(&hub, seed, test_config()).await);
    }
    // Ring topology: each node only knows its two neighbors.
    let count = nodes.len();
    for i in 0..count {
        let next = (i + 1) % count;
        hub.connect(nodes[i].address(), nodes[next].address()).await;
    }
    for node in &nodes {
        let node = node.clone();
        assert!(
            wait_until(Duration::from_secs(5), move || {
                let node = node.clone();
                async move { node.peers().await.len() >= 2 }
            })
            .await,
            "ring admission did not converge"
        );
    }

    let query = hashing::blake2b(b"banana").tagged();
    let target = distance::query_position(query.as_bytes());

    let found = tokio::time::timeout(
        Duration::from_secs(10),
        nodes[0].nearest_peers(query.as_bytes(), 3),
    )
    .await
    .expect("lookup terminates within the round bound")
    .expect("lookup succeeds");

    assert_eq!(found.len(), 3);

    // The lookup must do at least as well as ranking the local seed set.
    let mut seed_set = nodes[0].peers().await;
    seed_set.push(nodes[0].address().clone());
    let seed_best = seed_set
        .iter()
        .map(|addr| distance::address_distance(&target, addr))
        .min()
        .expect("seed set is non-empty");
    let found_best = found
        .iter()
        .map(|addr| distance::address_distance(&target, addr))
        .min()
        .expect("result is non-empty");
    assert!(found_best <= seed_best);
}
