use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use recon_queue::RateLimitingQueue;
use rustc_hash::FxHashSet;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_never_hold_the_same_key() {
    let queue = RateLimitingQueue::with_default_limiter("workers");
    let in_flight: Arc<Mutex<FxHashSet<String>>> = Arc::default();
    let overlaps = Arc::new(AtomicUsize::new(0));
    let processed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let (queue, in_flight, overlaps, processed) =
            (queue.clone(), in_flight.clone(), overlaps.clone(), processed.clone());
        handles.push(tokio::spawn(async move {
            while let Some(key) = queue.get().await {
                if !in_flight.lock().unwrap().insert(key.clone()) {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.lock().unwrap().remove(&key);
                processed.fetch_add(1, Ordering::SeqCst);
                queue.done(&key);
            }
        }));
    }

    // Hammer three keys while workers are busy with them.
    for round in 0..50 {
        queue.add(format!("ws|k{}", round % 3));
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    while !queue.is_empty() || !in_flight.lock().unwrap().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    queue.shut_down();
    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    let n = processed.load(Ordering::SeqCst);
    assert!((3..=50).contains(&n), "processed {n}");
}

#[tokio::test]
async fn shut_down_stops_hand_out_and_ignores_adds() {
    let queue = RateLimitingQueue::with_default_limiter("drain");
    queue.add("ws|a");
    queue.add_after("ws|b", Duration::from_secs(60));
    queue.shut_down();
    queue.add("ws|c");
    assert!(queue.is_shutting_down());
    assert_eq!(queue.delayed_len(), 0);
    assert_eq!(queue.get().await, None);
}
