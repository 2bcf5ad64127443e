use std::sync::Arc;
use std::time::Duration;

use async_channel::Receiver;
use chrono::Utc;
use tokio::task::JoinHandle;

use udp_spool_proxy::pipeline::{Batch, Batcher, BatcherConfig, BatcherHandle, Message};
use udp_spool_proxy::ProxyStats;

fn msg(tenant: &str, dataset: &str, payload: &[u8]) -> Message {
    Message {
        payload: payload.to_vec(),
        source: "127.0.0.1:9999".to_string(),
        received_at: Utc::now(),
        tenant_id: tenant.to_string(),
        dataset_id: dataset.to_string(),
    }
}

fn start_batcher(
    config: BatcherConfig,
) -> (BatcherHandle, Receiver<Batch>, JoinHandle<()>, Arc<ProxyStats>) {
    let stats = Arc::new(ProxyStats::new());
    let (batch_tx, batch_rx) = async_channel::bounded(16);
    let (batcher, handle) = Batcher::new(config, batch_tx, Arc::clone(&stats));
    let task = tokio::spawn(batcher.run());
    (handle, batch_rx, task, stats)
}

async fn recv_batch(rx: &Receiver<Batch>) -> Batch {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a sealed batch")
        .expect("batch channel closed")
}

#[tokio::test]
async fn seals_on_line_threshold() {
    let (handle, batch_rx, task, _stats) = start_batcher(BatcherConfig {
        max_batch_lines: 2,
        max_batch_bytes: 0,
        batch_timeout: Duration::from_secs(30),
    });

    handle.try_send(msg("t1", "d1", br#"{"a":1}"#)).unwrap();
    handle.try_send(msg("t1", "d1", br#"{"b":2}"#)).unwrap();

    let batch = recv_batch(&batch_rx).await;
    assert_eq!(batch.tenant_id, "t1");
    assert_eq!(batch.dataset_id, "d1");
    assert_eq!(batch.line_count, 2);
    assert_eq!(batch.messages.len(), 2);
    assert_eq!(batch.messages[0].payload, br#"{"a":1}"#);
    assert_eq!(batch.messages[1].payload, br#"{"b":2}"#);

    handle.close();
    task.await.unwrap();
}

#[tokio::test]
async fn seals_on_byte_threshold() {
    let (handle, batch_rx, task, _stats) = start_batcher(BatcherConfig {
        max_batch_lines: 0,
        max_batch_bytes: 10,
        batch_timeout: Duration::from_secs(30),
    });

    // 9 bytes: under the threshold, must not seal yet.
    handle.try_send(msg("t1", "d1", b"123456789")).unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(300), batch_rx.recv())
            .await
            .is_err(),
        "batch sealed below the byte threshold"
    );

    // One more byte pushes past it.
    handle.try_send(msg("t1", "d1", b"x")).unwrap();
    let batch = recv_batch(&batch_rx).await;
    assert_eq!(batch.total_bytes, 10);
    assert_eq!(batch.line_count, 2);

    handle.close();
    task.await.unwrap();
}

#[tokio::test]
async fn seals_on_timer() {
    let (handle, batch_rx, task, _stats) = start_batcher(BatcherConfig {
        max_batch_lines: 0,
        max_batch_bytes: 0,
        batch_timeout: Duration::from_millis(200),
    });

    handle.try_send(msg("t1", "d1", b"hello world")).unwrap();

    let batch = recv_batch(&batch_rx).await;
    assert_eq!(batch.line_count, 1);

    handle.close();
    task.await.unwrap();
}

#[tokio::test]
async fn timer_seals_all_open_batches() {
    let (handle, batch_rx, task, _stats) = start_batcher(BatcherConfig {
        max_batch_lines: 0,
        max_batch_bytes: 0,
        batch_timeout: Duration::from_millis(200),
    });

    handle.try_send(msg("t1", "d1", b"one")).unwrap();
    handle.try_send(msg("t2", "d2", b"two")).unwrap();

    let first = recv_batch(&batch_rx).await;
    let second = recv_batch(&batch_rx).await;

    let mut keys = vec![
        (first.tenant_id.clone(), first.dataset_id.clone()),
        (second.tenant_id.clone(), second.dataset_id.clone()),
    ];
    keys.sort();
    assert_eq!(
        keys,
        vec![
            ("t1".to_string(), "d1".to_string()),
            ("t2".to_string(), "d2".to_string()),
        ]
    );

    handle.close();
    task.await.unwrap();
}

#[tokio::test]
async fn keys_accumulate_independently() {
    let (handle, batch_rx, task, _stats) = start_batcher(BatcherConfig {
        max_batch_lines: 2,
        max_batch_bytes: 0,
        batch_timeout: Duration::from_secs(30),
    });

    handle.try_send(msg("t1", "d1", b"a1")).unwrap();
    handle.try_send(msg("t2", "d2", b"b1")).unwrap();
    handle.try_send(msg("t1", "d1", b"a2")).unwrap();

    // Only (t1, d1) reached its line limit.
    let batch = recv_batch(&batch_rx).await;
    assert_eq!(batch.tenant_id, "t1");
    assert_eq!(batch.line_count, 2);
    assert_eq!(batch.messages[0].payload, b"a1");
    assert_eq!(batch.messages[1].payload, b"a2");

    // The (t2, d2) message is still open; close drains it.
    handle.close();
    let batch = recv_batch(&batch_rx).await;
    assert_eq!(batch.tenant_id, "t2");
    assert_eq!(batch.line_count, 1);

    task.await.unwrap();
}

#[tokio::test]
async fn close_seals_open_batches() {
    let (handle, batch_rx, task, stats) = start_batcher(BatcherConfig {
        max_batch_lines: 100,
        max_batch_bytes: 0,
        batch_timeout: Duration::from_secs(30),
    });

    handle.try_send(msg("t1", "d1", b"pending")).unwrap();
    handle.close();

    let batch = recv_batch(&batch_rx).await;
    assert_eq!(batch.line_count, 1);
    task.await.unwrap();

    assert_eq!(stats.snapshot().batches_created, 1);

    // Channel is closed for producers too.
    assert!(handle.try_send(msg("t1", "d1", b"late")).is_err());
}

#[tokio::test]
async fn batches_for_one_key_arrive_in_seal_order() {
    let (handle, batch_rx, task, _stats) = start_batcher(BatcherConfig {
        max_batch_lines: 1,
        max_batch_bytes: 0,
        batch_timeout: Duration::from_secs(30),
    });

    for i in 0..5u8 {
        handle.try_send(msg("t1", "d1", &[b'0' + i])).unwrap();
    }

    for i in 0..5u8 {
        let batch = recv_batch(&batch_rx).await;
        assert_eq!(batch.messages[0].payload, vec![b'0' + i]);
    }

    handle.close();
    task.await.unwrap();
}
