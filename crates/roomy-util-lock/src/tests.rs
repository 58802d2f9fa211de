use std::time::Duration;

use super::*;

#[tokio::test]
async fn exclusive_within_a_name() {
    let manager = LockManager::new();
    let guard = manager.lock("writer").await;
    assert!(manager.try_lock("writer").is_none());
    drop(guard);
    assert!(manager.try_lock("writer").is_some());
}

#[tokio::test]
async fn names_are_independent() {
    let manager = LockManager::new();
    let _a = manager.lock("a").await;
    assert!(manager.try_lock("b").is_some());
}

#[tokio::test]
async fn timeout_fires_when_held() {
    let manager = LockManager::new();
    let _held = manager.lock("busy").await;
    let err = manager
        .lock_timeout("busy", Duration::from_millis(20))
        .await
        .expect_err("must time out");
    assert_eq!(
        err,
        LockError::Timeout {
            name: "busy".into()
        }
    );
}

#[tokio::test]
async fn timeout_succeeds_when_free() {
    let manager = LockManager::new();
    let guard = manager
        .lock_timeout("free", Duration::from_millis(20))
        .await
        .expect("acquires");
    assert_eq!(guard.name(), "free");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waiters_proceed_after_release() {
    let manager = LockManager::new();
    let guard = manager.lock("handoff").await;

    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move {
            let _guard = manager.lock("handoff").await;
            true
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    drop(guard);
    assert!(waiter.await.expect("waiter task"));
}

#[tokio::test]
async fn clones_share_the_registry() {
    let manager = LockManager::new();
    let clone = manager.clone();
    let _guard = manager.lock("shared").await;
    assert!(clone.try_lock("shared").is_none());
}
