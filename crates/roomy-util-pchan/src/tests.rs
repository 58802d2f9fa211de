use std::time::Duration;

use super::*;

#[tokio::test]
async fn priority_items_overtake_background() {
    let (mut tx, mut rx) = channel(16);
    tx.send(Class::Background, "bg-1").await.expect("sends");
    tx.send(Class::Background, "bg-2").await.expect("sends");
    tx.send(Class::Priority, "prio-1").await.expect("sends");
    tx.send(Class::Priority, "prio-2").await.expect("sends");
    tx.finish();

    assert_eq!(rx.recv().await, Some("prio-1"));
    assert_eq!(rx.recv().await, Some("prio-2"));
    assert_eq!(rx.recv().await, Some("bg-1"));
    assert_eq!(rx.recv().await, Some("bg-2"));
    assert_eq!(rx.recv().await, None);
}

#[tokio::test]
async fn fifo_within_class() {
    let (mut tx, mut rx) = channel(16);
    for i in 0..5 {
        tx.send(Class::Background, i).await.expect("sends");
    }
    for i in 0..5 {
        assert_eq!(rx.recv().await, Some(i));
    }
}

#[tokio::test]
async fn finish_is_idempotent_and_rejects_later_sends() {
    let (mut tx, mut rx) = channel::<u32>(4);
    tx.send(Class::Background, 1).await.expect("sends");
    tx.finish();
    tx.finish();
    assert!(matches!(
        tx.send(Class::Priority, 2).await,
        Err(SendError::Finished(2))
    ));
    // Queued items still drain after finish
    assert_eq!(rx.recv().await, Some(1));
    assert_eq!(rx.recv().await, None);
}

#[tokio::test]
async fn dropping_all_senders_finishes() {
    let (mut tx, mut rx) = channel(4);
    let tx2 = tx.clone();
    tx.send(Class::Background, "only").await.expect("sends");
    drop(tx);
    drop(tx2);
    assert_eq!(rx.recv().await, Some("only"));
    assert_eq!(rx.recv().await, None);
}

#[tokio::test]
async fn dropped_receiver_errors_senders() {
    let (mut tx, rx) = channel::<u32>(1);
    drop(rx);
    assert!(matches!(
        tx.send(Class::Background, 7).await,
        Err(SendError::Closed(7))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_channel_applies_backpressure() {
    let (mut tx, mut rx) = channel(2);
    tx.send(Class::Background, 0u32).await.expect("sends");
    tx.send(Class::Background, 1u32).await.expect("sends");

    let blocked = tokio::spawn(async move {
        tx.send(Class::Background, 2u32).await.expect("sends");
        tx
    });
    // The third send must not complete while the channel is full
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());

    assert_eq!(rx.recv().await, Some(0));
    let tx = blocked.await.expect("sender task");
    drop(tx);
    assert_eq!(rx.recv().await, Some(1));
    assert_eq!(rx.recv().await, Some(2));
    assert_eq!(rx.recv().await, None);
}

#[tokio::test]
async fn multiple_producers_interleave() {
    let (tx, mut rx) = channel(64);
    let mut handles = Vec::new();
    for producer in 0..4u32 {
        let mut tx = tx.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..8u32 {
                tx.send(Class::Background, (producer, i)).await.expect("sends");
            }
        }));
    }
    drop(tx);
    for handle in handles {
        handle.await.expect("producer task");
    }

    let mut seen = Vec::new();
    while let Some(item) = rx.recv().await {
        seen.push(item);
    }
    assert_eq!(seen.len(), 32);
    // Per-producer FIFO holds even across interleaving
    for producer in 0..4u32 {
        let order: Vec<u32> = seen
            .iter()
            .filter(|(p, _)| *p == producer)
            .map(|(_, i)| *i)
            .collect();
        assert_eq!(order, (0..8).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn drain_ready_empties_both_classes() {
    let (mut tx, mut rx) = channel(8);
    tx.send(Class::Background, "bg").await.expect("sends");
    tx.send(Class::Priority, "prio").await.expect("sends");
    assert_eq!(rx.drain_ready(), vec!["prio", "bg"]);
    assert!(rx.is_empty());
}
