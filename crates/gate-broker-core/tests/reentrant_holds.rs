//! N acquires from the same owner yield a hold count of N, and exactly N
//! releases are required to remove the entry (§8, invariant 5).

use gate_broker_core::{Broker, BrokerConfig};
use gate_proto::{LockMode, OwnerToken, RequestId};

fn config(state_dir: std::path::PathBuf) -> BrokerConfig {
    BrokerConfig { state_dir, lease_ms: 300_000, max_hold_ms: 3_600_000, acquire_timeout_ms: 5_000 }
}

#[tokio::test]
async fn reentrant_acquires_accumulate_and_drain_one_release_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Broker::open(config(dir.path().to_path_buf())).await.unwrap();
    let owner = OwnerToken::new();

    for i in 0..5u64 {
        assert!(broker
            .acquire("/f".to_string(), LockMode::Write, owner, RequestId(i), 1_000)
            .await
            .unwrap());
    }

    let status = broker.status().await;
    let entry = &status.iter().find(|p| p.path == "/f").unwrap().entries[0];
    assert_eq!(entry.hold_count, 5);
    assert!(entry.granted);

    for _ in 0..4 {
        broker.release("/f".to_string(), owner).await.unwrap();
        let status = broker.status().await;
        let entry = status.iter().find(|p| p.path == "/f").unwrap();
        assert_eq!(entry.entries.len(), 1, "entry survives until the fifth release");
    }

    broker.release("/f".to_string(), owner).await.unwrap();
    let status = broker.status().await;
    assert!(status.iter().all(|p| p.path != "/f"), "entry removed once hold count hits zero");
}

#[tokio::test]
async fn a_second_owner_is_unaffected_by_the_firsts_reentrancy() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Broker::open(config(dir.path().to_path_buf())).await.unwrap();
    let first = OwnerToken::new();

    assert!(broker
        .acquire("/f".to_string(), LockMode::Write, first, RequestId(1), 1_000)
        .await
        .unwrap());
    assert!(broker
        .acquire("/f".to_string(), LockMode::Write, first, RequestId(2), 1_000)
        .await
        .unwrap());

    // A distinct owner cannot acquire re-entrantly; it must queue.
    let second = OwnerToken::new();
    let granted = broker
        .acquire("/f".to_string(), LockMode::Write, second, RequestId(3), 50)
        .await
        .unwrap();
    assert!(!granted, "second owner is not re-entrant and times out while first still holds");
}
