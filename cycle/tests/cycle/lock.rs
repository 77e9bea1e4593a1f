use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cycle::lock::LockError;
use cycle::store::{LockName, LockStore, StoreError};
use jiff::SignedDuration;
use test_helpers::TestCluster;
use tokio::time::Instant;

fn spot(id: u64) -> LockName {
    LockName::for_entity("spot", id).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn critical_sections_never_overlap() -> anyhow::Result<()> {
    let cluster = TestCluster::new();
    // two executors stand in for two processes sharing the store
    let executors = [cluster.lock_executor(), cluster.lock_executor()];
    let counter = Arc::new(AtomicUsize::new(0));
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for i in 0..20 {
        let executor = executors[i % 2].clone();
        let counter = counter.clone();
        let inside = inside.clone();
        let max_inside = max_inside.clone();
        tasks.push(tokio::spawn(async move {
            executor
                .execute_with_lock(&spot(1), Duration::from_secs(10), || async {
                    let now_inside = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now_inside, Ordering::SeqCst);
                    let value = counter.load(Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    counter.store(value + 1, Ordering::SeqCst);
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
                .await
        }));
    }
    for task in tasks {
        task.await??;
    }

    assert_eq!(counter.load(Ordering::SeqCst), 20);
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert!(cluster.store.get_lock(&spot(1)).await?.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_slow_bodies_run_one_after_the_other() -> anyhow::Result<()> {
    let cluster = TestCluster::new();
    let windows: Arc<Mutex<Vec<(Instant, Instant)>>> = Arc::default();
    let started = Instant::now();

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let executor = cluster.lock_executor();
        let windows = windows.clone();
        tasks.push(tokio::spawn(async move {
            executor
                .execute_with_lock(&spot(2), Duration::from_secs(10), || async move {
                    let entered = Instant::now();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    windows.lock().unwrap().push((entered, Instant::now()));
                })
                .await
        }));
    }
    for task in tasks {
        task.await??;
    }

    assert!(started.elapsed() >= Duration::from_secs(4));
    let mut windows = windows.lock().unwrap().clone();
    windows.sort();
    assert_eq!(windows.len(), 2);
    let ((_, first_left), (second_entered, _)) = (windows[0], windows[1]);
    assert!(first_left <= second_entered, "critical sections overlapped");
    Ok(())
}

#[tokio::test]
async fn released_when_body_returns_an_error() -> anyhow::Result<()> {
    let cluster = TestCluster::new();
    let executor = cluster.lock_executor();

    let result = executor
        .execute_with_lock(&spot(3), Duration::from_secs(1), || async {
            Err::<(), _>(anyhow::anyhow!("like service failed"))
        })
        .await?;

    assert_eq!(result.unwrap_err().to_string(), "like service failed");
    assert!(cluster.store.get_lock(&spot(3)).await?.is_none());
    Ok(())
}

async fn explode() {
    panic!("like service exploded")
}

#[tokio::test]
async fn released_when_body_panics() -> anyhow::Result<()> {
    let cluster = TestCluster::new();
    let executor = cluster.lock_executor();

    let panicking = executor.clone();
    let handle = tokio::spawn(async move {
        panicking
            .execute_with_lock(&spot(4), Duration::from_secs(1), explode)
            .await
    });
    assert!(handle.await.unwrap_err().is_panic());

    // release is spawned from the guard's drop, so allow it a moment
    let guard = executor.acquire(&spot(4), Duration::from_secs(1)).await?;
    guard.release().await?;
    Ok(())
}

#[tokio::test]
async fn released_when_caller_is_cancelled() -> anyhow::Result<()> {
    let cluster = TestCluster::new();
    let executor = cluster.lock_executor();

    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        executor.execute_with_lock(&spot(5), Duration::from_secs(1), || {
            tokio::time::sleep(Duration::from_secs(60))
        }),
    )
    .await;
    assert!(cancelled.is_err());

    let guard = executor.acquire(&spot(5), Duration::from_secs(1)).await?;
    guard.release().await?;
    Ok(())
}

#[tokio::test]
async fn times_out_without_running_the_body() -> anyhow::Result<()> {
    let cluster = TestCluster::new();
    let executor = cluster.lock_executor();
    let holder = executor.acquire(&spot(6), Duration::ZERO).await?;

    let invoked = AtomicBool::new(false);
    let started = Instant::now();
    let err = executor
        .execute_with_lock(&spot(6), Duration::from_millis(200), || async {
            invoked.store(true, Ordering::SeqCst);
        })
        .await
        .unwrap_err();

    match err {
        LockError::Timeout { name, waited } => {
            assert_eq!(name, spot(6));
            assert!(waited >= Duration::from_millis(200));
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(!invoked.load(Ordering::SeqCst));

    // the holder is unaffected by the failed attempt
    let entry = cluster.store.get_lock(&spot(6)).await?.unwrap();
    assert_eq!(entry.owner, holder.owner());
    holder.release().await?;
    Ok(())
}

#[tokio::test]
async fn nested_acquire_of_the_same_name_times_out() -> anyhow::Result<()> {
    let cluster = TestCluster::new();
    let executor = cluster.lock_executor();
    let inner = executor.clone();
    let name = spot(7);

    let nested = executor
        .execute_with_lock(&name, Duration::from_secs(1), || async {
            inner
                .execute_with_lock(&name, Duration::from_millis(100), || async {})
                .await
        })
        .await?;

    assert!(matches!(nested, Err(LockError::Timeout { .. })));
    assert!(cluster.store.get_lock(&name).await?.is_none());
    Ok(())
}

/// Concurrent "toggle like" requests from one member on one spot. Each
/// toggle reads, waits, then writes; without the lock the reads would
/// interleave and toggles would be lost.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_like_toggles_are_serialized() -> anyhow::Result<()> {
    let cluster = TestCluster::new();
    let likes: Arc<Mutex<HashSet<(u64, u64)>>> = Arc::default();
    let like_count = Arc::new(AtomicUsize::new(0));
    let (spot_id, member_id) = (42, 7);

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let executor = cluster.lock_executor();
        let likes = likes.clone();
        let like_count = like_count.clone();
        tasks.push(tokio::spawn(async move {
            executor
                .execute_with_lock(
                    &spot(spot_id),
                    Duration::from_secs(5),
                    || async move {
                        let liked =
                            likes.lock().unwrap().contains(&(spot_id, member_id));
                        tokio::time::sleep(Duration::from_millis(3)).await;
                        if liked {
                            likes.lock().unwrap().remove(&(spot_id, member_id));
                            like_count.fetch_sub(1, Ordering::SeqCst);
                        } else {
                            likes.lock().unwrap().insert((spot_id, member_id));
                            like_count.fetch_add(1, Ordering::SeqCst);
                        }
                    },
                )
                .await
        }));
    }
    for task in tasks {
        task.await??;
    }

    // an even number of toggles leaves the spot unliked
    assert!(likes.lock().unwrap().is_empty());
    assert_eq!(like_count.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn expired_lock_is_taken_over() -> anyhow::Result<()> {
    let cluster = TestCluster::new();
    let executor = cluster.lock_executor();

    let stale = executor
        .acquire_with_lease(&spot(8), Duration::ZERO, Duration::from_secs(1))
        .await?;
    assert!(matches!(
        executor.acquire(&spot(8), Duration::ZERO).await,
        Err(LockError::Timeout { .. })
    ));

    cluster.time_source.advance(SignedDuration::from_secs(2));
    let fresh = executor.acquire(&spot(8), Duration::ZERO).await?;
    assert_ne!(fresh.owner(), stale.owner());

    // the stale holder cannot free the new holder's lock
    stale.release().await?;
    let entry = cluster.store.get_lock(&spot(8)).await?.unwrap();
    assert_eq!(entry.owner, fresh.owner());

    fresh.release().await?;
    Ok(())
}

#[tokio::test]
async fn body_is_dropped_when_the_lock_is_taken_over() -> anyhow::Result<()> {
    let cluster = TestCluster::new();
    let executor = cluster.lock_executor();
    let finished = Arc::new(AtomicBool::new(false));

    let holder = executor.clone();
    let body_finished = finished.clone();
    let handle = tokio::spawn(async move {
        holder
            .execute_with_lock_lease(
                &spot(12),
                Duration::ZERO,
                Duration::from_millis(30),
                || async move {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    body_finished.store(true, Ordering::SeqCst);
                },
            )
            .await
    });
    while cluster.store.get_lock(&spot(12)).await?.is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // the holder's lease runs out and another caller takes the name
    cluster.time_source.advance(SignedDuration::from_secs(1));
    let thief = executor.acquire(&spot(12), Duration::ZERO).await?;

    match handle.await? {
        Err(LockError::Lost { name }) => assert_eq!(name, spot(12)),
        other => panic!("expected the lock to be lost, got {other:?}"),
    }
    assert!(!finished.load(Ordering::SeqCst));

    // the stale holder's cleanup leaves the new entry alone
    let entry = cluster.store.get_lock(&spot(12)).await?.unwrap();
    assert_eq!(entry.owner, thief.owner());
    thief.release().await?;
    Ok(())
}

#[tokio::test]
async fn sweep_deletes_expired_entries() -> anyhow::Result<()> {
    let cluster = TestCluster::new();
    let executor = cluster.lock_executor();

    let short = executor
        .acquire_with_lease(&spot(9), Duration::ZERO, Duration::from_secs(1))
        .await?;
    let long = executor.acquire(&spot(10), Duration::ZERO).await?;

    cluster.time_source.advance(SignedDuration::from_secs(2));
    assert_eq!(executor.sweep_expired().await?, 1);
    assert!(cluster.store.get_lock(&spot(9)).await?.is_none());
    assert!(cluster.store.get_lock(&spot(10)).await?.is_some());

    short.release().await?;
    long.release().await?;
    Ok(())
}

#[tokio::test]
async fn unavailable_store_fails_acquisition() -> anyhow::Result<()> {
    let cluster = TestCluster::new();
    let executor = cluster.lock_executor();
    cluster.store.set_available(false);

    let invoked = AtomicBool::new(false);
    let result = executor
        .execute_with_lock(&spot(11), Duration::from_secs(5), || async {
            invoked.store(true, Ordering::SeqCst);
        })
        .await;

    assert!(matches!(
        result,
        Err(LockError::Store(StoreError::Unavailable(_)))
    ));
    assert!(!invoked.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn lock_names_are_validated() {
    assert_eq!(spot(42).as_str(), "spot:42");
    assert!(matches!(
        LockName::new(""),
        Err(LockError::InvalidName(_))
    ));
}
