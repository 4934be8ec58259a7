//! Runque hand-off and interruption behavior.

mod common;

use std::sync::Arc;

use forque::{Interrupted, Runque};

/// Move-only payload; equality proves the exact value crossed over.
#[derive(Debug, PartialEq, Eq)]
struct Item(u32, u32);

#[tokio::test]
async fn put_before_get() {
    common::init_tracing();
    let runque: Runque<Item> = Runque::fifo();

    runque.put(Item(1, 1)).await.unwrap();
    assert_eq!(runque.get().await.unwrap(), Item(1, 1));
}

#[tokio::test]
async fn get_before_put_hands_over_the_exact_value() {
    common::init_tracing();
    let runque: Arc<Runque<Item>> = Arc::new(Runque::fifo());

    let getter = tokio::spawn({
        let runque = Arc::clone(&runque);
        async move { runque.get().await.unwrap() }
    });
    // Let the getter suspend on the empty queue first.
    tokio::task::yield_now().await;

    runque.put(Item(1, 1)).await.unwrap();

    assert_eq!(getter.await.unwrap(), Item(1, 1));
}

#[tokio::test]
async fn fifo_orders_across_puts() {
    common::init_tracing();
    let runque: Runque<Item> = Runque::fifo();

    // Program order within one producer is preserved.
    runque.put(Item(1, 1)).await.unwrap();
    runque.put(Item(2, 2)).await.unwrap();
    runque.put(Item(3, 3)).await.unwrap();

    assert_eq!(runque.get().await.unwrap(), Item(1, 1));
    assert_eq!(runque.get().await.unwrap(), Item(2, 2));
    assert_eq!(runque.get().await.unwrap(), Item(3, 3));
}

#[tokio::test]
async fn lifo_orders_across_puts() {
    common::init_tracing();
    let runque: Runque<Item, forque::LifoBuffer<Item>> = Runque::lifo();

    runque.put(Item(1, 1)).await.unwrap();
    runque.put(Item(2, 2)).await.unwrap();

    assert_eq!(runque.get().await.unwrap(), Item(2, 2));
    assert_eq!(runque.get().await.unwrap(), Item(1, 1));
}

#[tokio::test]
async fn priority_serves_largest_first() {
    common::init_tracing();
    let runque: Runque<u32, forque::PriorityBuffer<u32>> = Runque::priority();

    runque.put(5).await.unwrap();
    runque.put(9).await.unwrap();
    runque.put(1).await.unwrap();

    assert_eq!(runque.get().await.unwrap(), 9);
    assert_eq!(runque.get().await.unwrap(), 5);
    assert_eq!(runque.get().await.unwrap(), 1);
}

#[tokio::test]
async fn dropped_getter_does_not_swallow_a_value() {
    common::init_tracing();
    let runque: Runque<Item> = Runque::fifo();

    {
        use std::future::Future;
        use std::pin::pin;
        use std::task::{Context, Waker};

        // Park a getter, then drop it while its waiter is still queued.
        let mut pending = pin!(runque.get());
        let mut cx = Context::from_waker(Waker::noop());
        assert!(pending.as_mut().poll(&mut cx).is_pending());
    }

    // The dead waiter must not eat the value.
    runque.put(Item(1, 1)).await.unwrap();
    assert_eq!(runque.get().await.unwrap(), Item(1, 1));
}

#[tokio::test]
async fn interrupt_wakes_a_suspended_getter() {
    common::init_tracing();
    let runque: Arc<Runque<Item>> = Arc::new(Runque::fifo());

    let getter = tokio::spawn({
        let runque = Arc::clone(&runque);
        async move { runque.get().await }
    });
    tokio::task::yield_now().await;

    runque.interrupt().await;

    assert_eq!(getter.await.unwrap(), Err(Interrupted));
}

#[tokio::test]
async fn interrupt_poisons_later_traffic() {
    common::init_tracing();
    let runque: Runque<Item> = Runque::fifo();

    runque.interrupt().await;

    assert_eq!(runque.get().await, Err(Interrupted));
    assert_eq!(runque.put(Item(1, 1)).await, Err(Interrupted));

    // Idempotent.
    runque.interrupt().await;
    assert_eq!(runque.get().await, Err(Interrupted));
}

#[tokio::test]
async fn interrupt_wakes_every_waiter() {
    common::init_tracing();
    let runque: Arc<Runque<Item>> = Arc::new(Runque::fifo());

    let mut getters = Vec::new();
    for _ in 0..4 {
        let runque = Arc::clone(&runque);
        getters.push(tokio::spawn(async move { runque.get().await }));
        tokio::task::yield_now().await;
    }

    runque.interrupt().await;

    for getter in getters {
        assert_eq!(getter.await.unwrap(), Err(Interrupted));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_and_consumers_balance() {
    common::init_tracing();

    const PRODUCERS: usize = 4;
    const PER_PRODUCER: u32 = 250;

    let runque: Arc<Runque<u32>> = Arc::new(Runque::fifo());
    let mut tasks = Vec::new();

    for producer in 0..PRODUCERS {
        let runque = Arc::clone(&runque);
        tasks.push(tokio::spawn(async move {
            for i in 0..PER_PRODUCER {
                runque.put(producer as u32 * PER_PRODUCER + i).await.unwrap();
            }
        }));
    }

    let consumer = tokio::spawn({
        let runque = Arc::clone(&runque);
        async move {
            let mut seen: Vec<u32> = Vec::new();
            for _ in 0..PRODUCERS as u32 * PER_PRODUCER {
                seen.push(runque.get().await.unwrap());
            }
            seen
        }
    });

    for task in tasks {
        task.await.unwrap();
    }
    let mut seen: Vec<u32> = consumer.await.unwrap();
    seen.sort_unstable();
    let expected: Vec<u32> = (0..PRODUCERS as u32 * PER_PRODUCER).collect();
    assert_eq!(seen, expected);
}
