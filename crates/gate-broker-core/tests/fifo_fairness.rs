//! End-to-end FIFO fairness: a reader queued behind a writer must not be
//! granted before that writer (§8, invariant 3/4).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gate_broker_core::{Broker, BrokerConfig};
use gate_proto::{LockMode, OwnerToken, RequestId};

fn config(state_dir: PathBuf) -> BrokerConfig {
    BrokerConfig { state_dir, lease_ms: 300_000, max_hold_ms: 3_600_000, acquire_timeout_ms: 5_000 }
}

#[tokio::test]
async fn queued_reader_waits_behind_a_queued_writer() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Broker::open(config(dir.path().to_path_buf())).await.unwrap();

    let holder = OwnerToken::new();
    let writer = OwnerToken::new();
    let reader = OwnerToken::new();

    assert!(broker
        .acquire("/f".to_string(), LockMode::Read, holder, RequestId(1), 5_000)
        .await
        .unwrap());

    let broker_w = Arc::clone(&broker);
    let writer_task = tokio::spawn(async move {
        broker_w.acquire("/f".to_string(), LockMode::Write, writer, RequestId(2), 5_000).await
    });
    // Give the writer time to enqueue before the reader arrives.
    tokio::time::sleep(Duration::from_millis(30)).await;

    let broker_r = Arc::clone(&broker);
    let reader_task = tokio::spawn(async move {
        broker_r.acquire("/f".to_string(), LockMode::Read, reader, RequestId(3), 5_000).await
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Neither should be granted yet: the existing reader still holds, and
    // the writer is queued strictly ahead of the later reader.
    let status = broker.status().await;
    let entry = status.iter().find(|p| p.path == "/f").unwrap();
    assert!(entry.entries.iter().find(|e| e.owner == writer).is_some_and(|e| !e.granted));
    assert!(entry.entries.iter().find(|e| e.owner == reader).is_some_and(|e| !e.granted));

    broker.release("/f".to_string(), holder).await.unwrap();
    assert!(writer_task.await.unwrap().unwrap(), "writer is granted once the holder releases");

    // The reader must still be waiting: it arrived after the writer.
    let status = broker.status().await;
    let entry = status.iter().find(|p| p.path == "/f").unwrap();
    assert!(entry.entries.iter().find(|e| e.owner == reader).is_some_and(|e| !e.granted));

    broker.release("/f".to_string(), writer).await.unwrap();
    assert!(reader_task.await.unwrap().unwrap(), "reader is granted only after the writer releases");
}
