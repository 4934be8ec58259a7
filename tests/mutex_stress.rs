//! Mutual-exclusion stress for the cooperative mutex.

mod common;

use std::sync::Arc;

use forque::mutex::Mutex;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn counter_never_observes_a_second_holder() {
    common::init_tracing();

    const TASKS: usize = 8;
    const ITERATIONS: usize = 1000;

    let mutex: Arc<Mutex<i64>> = Arc::new(Mutex::new(0));

    let mut tasks = Vec::new();
    for _ in 0..TASKS {
        let mutex = Arc::clone(&mutex);
        tasks.push(tokio::spawn(async move {
            for _ in 0..ITERATIONS {
                let mut counter = mutex.lock().await;
                *counter += 1;
                assert_eq!(*counter, 1, "second holder observed inside the lock");
                *counter -= 1;
            }
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(*mutex.lock().await, 0);
    assert!(!mutex.is_locked());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn guard_survives_suspension_points() {
    common::init_tracing();

    let mutex: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

    let mut tasks = Vec::new();
    for id in 0..8 {
        let mutex = Arc::clone(&mutex);
        tasks.push(tokio::spawn(async move {
            for _ in 0..50 {
                let mut log = mutex.lock().await;
                log.push(id);
                // Hold the lock across a suspension; the task may resume on
                // a different worker thread.
                tokio::task::yield_now().await;
                let last: usize = *log.last().unwrap();
                assert_eq!(last, id, "log mutated while the lock was held");
            }
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(mutex.lock().await.len(), 8 * 50);
}
