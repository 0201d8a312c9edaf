//! Replicas converge on the host's storage under concurrent writes, in both
//! broadcast modes.

mod common;

use common::{peer, room_with, settle};
use room_core::{ArrayOp, BroadcastMode, MemoryNetwork, Room, RoomConfig};
use serde_json::{json, Value};

async fn concurrent_workload(mode: BroadcastMode) -> (Value, Vec<Value>) {
    let network = MemoryNetwork::new();
    let config = RoomConfig {
        broadcast_mode: mode,
        ..RoomConfig::default()
    };

    let (host, _) = room_with(&network, "host", config.clone()).await;
    let mut clients: Vec<Room> = Vec::new();
    for id in ["c1", "c2", "c3"] {
        let (client, _) = room_with(&network, id, config.clone()).await;
        clients.push(client);
    }

    host.create_room(json!({"log": [], "tags": [], "title": "draft"}), None)
        .await
        .unwrap();
    for client in &clients {
        client.join_room(&peer("host")).await.unwrap();
    }
    settle().await;

    // Every client writes without waiting for the others
    let writes = clients.iter().enumerate().map(|(i, client)| async move {
        client.update_storage("title", json!(format!("by c{}", i + 1))).await?;
        client
            .update_storage_array("log", ArrayOp::Add, json!({"from": i + 1}), None)
            .await?;
        client
            .update_storage_array("tags", ArrayOp::AddUnique, json!({"tag": "shared"}), None)
            .await?;
        client
            .update_storage_array("tags", ArrayOp::AddUnique, json!({"tag": i + 1}), None)
            .await?;
        client
            .update_storage(format!("own_{}", i + 1), json!(i + 1))
            .await
    });
    for result in futures::future::join_all(writes).await {
        result.unwrap();
    }
    host.update_storage_array("log", ArrayOp::Add, json!({"from": 0}), None)
        .await
        .unwrap();
    settle().await;

    let authoritative = host.storage().await.unwrap().to_value();
    let mut replicas = Vec::new();
    for client in &clients {
        replicas.push(client.storage().await.unwrap().to_value());
    }
    (authoritative, replicas)
}

fn assert_converged(host: &Value, replicas: &[Value]) {
    for replica in replicas {
        assert_eq!(replica, host);
    }

    // No lost updates: every client's append made it
    let log = host["log"].as_array().unwrap();
    assert_eq!(log.len(), 4);
    for from in 0..=3 {
        assert!(log.contains(&json!({"from": from})));
    }

    // add-unique from three writers kept exactly one shared entry
    let tags = host["tags"].as_array().unwrap();
    assert_eq!(
        tags.iter().filter(|t| **t == json!({"tag": "shared"})).count(),
        1
    );
    assert_eq!(tags.len(), 4);

    for i in 1..=3 {
        assert_eq!(host[format!("own_{}", i)], json!(i));
    }
}

#[tokio::test(start_paused = true)]
async fn test_delta_broadcast_converges() {
    let (host, replicas) = concurrent_workload(BroadcastMode::Delta).await;
    assert_converged(&host, &replicas);
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_broadcast_converges() {
    let (host, replicas) = concurrent_workload(BroadcastMode::Snapshot).await;
    assert_converged(&host, &replicas);
}
