//! Ordered hand-off buffer between the chain and consumers.
//!
//! A [`Runque`] carries ready items from producers (the chain publishing
//! retainments) to consumers awaiting [`get`](Runque::get). Ordering of the
//! buffered items is pluggable through the [`OrderedBuffer`] adapter
//! (FIFO, LIFO, or priority) and the whole structure is interruptible:
//! [`interrupt`](Runque::interrupt) wakes every waiter with [`Interrupted`]
//! and poisons all further traffic.
//!
//! Internally one [`Mutex`](crate::mutex::Mutex) linearizes enqueue and
//! dequeue. Waiters form a LIFO stack (the simplest correct structure;
//! per-prefix fairness is the chain's job, not the runque's), and a waiter's
//! resume always happens **outside** the mutex.
//!
//! [`SyncRunque`] is the single-threaded, non-suspending specialization over
//! the same adapters.

use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use crate::mutex::Mutex;

// ============================================================================
//  Interrupted
// ============================================================================

/// Terminal failure signal broadcast by `interrupt()`.
///
/// Once a runque is interrupted every `get` and `put`, including the ones
/// already suspended, fails with this error, and so does any chain
/// operation whose publication reaches the runque afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runqueue stopped")
    }
}

impl std::error::Error for Interrupted {}

// ============================================================================
//  OrderedBuffer Adapter
// ============================================================================

/// Common adapter over the ordering variants: `push`, `pop`, `is_empty`.
pub trait OrderedBuffer<V> {
    /// Enqueue `value`.
    fn push(&mut self, value: V);

    /// Dequeue the next value per this buffer's ordering, if any.
    fn pop(&mut self) -> Option<V>;

    /// Whether the buffer holds no values.
    fn is_empty(&self) -> bool;
}

/// First in, first out.
#[derive(Debug)]
pub struct FifoBuffer<V> {
    items: VecDeque<V>,
}

impl<V> Default for FifoBuffer<V> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }
}

impl<V> OrderedBuffer<V> for FifoBuffer<V> {
    fn push(&mut self, value: V) {
        self.items.push_back(value);
    }

    fn pop(&mut self) -> Option<V> {
        self.items.pop_front()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Last in, first out.
#[derive(Debug)]
pub struct LifoBuffer<V> {
    items: Vec<V>,
}

impl<V> Default for LifoBuffer<V> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<V> OrderedBuffer<V> for LifoBuffer<V> {
    fn push(&mut self, value: V) {
        self.items.push(value);
    }

    fn pop(&mut self) -> Option<V> {
        self.items.pop()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Largest first, by the value's natural order.
///
/// A custom priority is expressed by wrapping the value (`std::cmp::Reverse`
/// or a newtype), the standard-library convention.
#[derive(Debug)]
pub struct PriorityBuffer<V: Ord> {
    items: BinaryHeap<V>,
}

impl<V: Ord> Default for PriorityBuffer<V> {
    fn default() -> Self {
        Self {
            items: BinaryHeap::new(),
        }
    }
}

impl<V: Ord> OrderedBuffer<V> for PriorityBuffer<V> {
    fn push(&mut self, value: V) {
        self.items.push(value);
    }

    fn pop(&mut self) -> Option<V> {
        self.items.pop()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// ============================================================================
//  Waiters
// ============================================================================

/// One suspended `get()`.
///
/// The slot is filled (value or `Interrupted`) by `put`/`interrupt` after
/// the runque mutex is released; the stored waker fires afterwards. A
/// dropped `get` future marks its slot abandoned, and a `resume` that
/// finds an abandoned slot hands the outcome straight back so the caller
/// can try the next waiter instead of losing the value.
struct GetWaiter<V> {
    slot: parking_lot::Mutex<GetSlot<V>>,
}

struct GetSlot<V> {
    outcome: Option<Result<V, Interrupted>>,
    waker: Option<Waker>,
    abandoned: bool,
}

impl<V> GetWaiter<V> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: parking_lot::Mutex::new(GetSlot {
                outcome: None,
                waker: None,
                abandoned: false,
            }),
        })
    }

    /// Deliver an outcome and wake the suspended task.
    ///
    /// Returns the outcome untouched if the waiter's future was dropped
    /// before delivery.
    fn resume(&self, outcome: Result<V, Interrupted>) -> Option<Result<V, Interrupted>> {
        let waker: Option<Waker> = {
            let mut slot = self.slot.lock();
            if slot.abandoned {
                return Some(outcome);
            }
            debug_assert!(slot.outcome.is_none(), "waiter resumed twice");
            slot.outcome = Some(outcome);
            slot.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        None
    }
}

/// Future half of a suspended `get()`.
struct GetFuture<V> {
    waiter: Arc<GetWaiter<V>>,
}

impl<V> Future for GetFuture<V> {
    type Output = Result<V, Interrupted>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.waiter.slot.lock();
        if let Some(outcome) = slot.outcome.take() {
            return Poll::Ready(outcome);
        }
        slot.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<V> Drop for GetFuture<V> {
    fn drop(&mut self) {
        let mut slot = self.waiter.slot.lock();
        slot.abandoned = true;
        slot.waker = None;
        // A value delivered in the window between resume and this drop has
        // no reader left; it is dropped here, and its own drop handling
        // reports the loss.
        slot.outcome = None;
    }
}

// ============================================================================
//  Runque (async)
// ============================================================================

/// Lockable state: the item buffer, the waiter stack, the interrupt flag.
struct RunqueState<V, B> {
    items: B,
    waiters: Vec<Arc<GetWaiter<V>>>,
    interrupted: bool,
}

/// The asynchronous, multi-consumer hand-off buffer.
pub struct Runque<V, B = FifoBuffer<V>> {
    state: Mutex<RunqueState<V, B>>,
}

impl<V, B: OrderedBuffer<V> + Default> Default for Runque<V, B> {
    fn default() -> Self {
        Self::new(B::default())
    }
}

impl<V> Runque<V, FifoBuffer<V>> {
    /// A FIFO runque.
    #[must_use]
    pub fn fifo() -> Self {
        Self::default()
    }
}

impl<V> Runque<V, LifoBuffer<V>> {
    /// A LIFO runque.
    #[must_use]
    pub fn lifo() -> Self {
        Self::default()
    }
}

impl<V: Ord> Runque<V, PriorityBuffer<V>> {
    /// A priority runque over the value's natural order.
    #[must_use]
    pub fn priority() -> Self {
        Self::default()
    }
}

impl<V, B: OrderedBuffer<V>> Runque<V, B> {
    /// Build over an explicit buffer.
    #[must_use]
    pub fn new(buffer: B) -> Self {
        Self {
            state: Mutex::new(RunqueState {
                items: buffer,
                waiters: Vec::new(),
                interrupted: false,
            }),
        }
    }

    /// Await the next value.
    ///
    /// Returns the buffer's front immediately when one is queued, otherwise
    /// suspends until a `put` hands a value over.
    ///
    /// Dropping the returned future deregisters its waiter, so a later
    /// `put` is not swallowed by a dead getter; only a value delivered in
    /// the instant before the drop is lost (and reported by its own drop
    /// handling).
    ///
    /// # Errors
    ///
    /// [`Interrupted`] once the runque has been interrupted.
    pub async fn get(&self) -> Result<V, Interrupted> {
        let waiter: Arc<GetWaiter<V>> = {
            let mut state = self.state.lock().await;
            if state.interrupted {
                return Err(Interrupted);
            }
            if let Some(value) = state.items.pop() {
                return Ok(value);
            }
            let waiter = GetWaiter::new();
            state.waiters.push(Arc::clone(&waiter));
            waiter
        };

        GetFuture { waiter }.await
    }

    /// Deliver a value.
    ///
    /// Hands it directly to the most recent waiter if one is suspended,
    /// otherwise enqueues it. The waiter's resume runs outside the mutex.
    ///
    /// # Errors
    ///
    /// [`Interrupted`] once the runque has been interrupted; the value is
    /// dropped.
    pub async fn put(&self, value: V) -> Result<(), Interrupted> {
        self.put_reclaiming(value)
            .await
            .map_err(|(interrupted, _value)| interrupted)
    }

    /// `put` that hands the value back on interruption, so internal callers
    /// can dispose of it deliberately.
    async fn put_reclaiming(&self, value: V) -> Result<(), (Interrupted, V)> {
        let mut value: V = value;
        loop {
            let handoff: Option<(Arc<GetWaiter<V>>, V)> = {
                let mut state = self.state.lock().await;
                if state.interrupted {
                    return Err((Interrupted, value));
                }
                match state.waiters.pop() {
                    Some(waiter) => Some((waiter, value)),
                    None => {
                        state.items.push(value);
                        None
                    }
                }
            };

            let Some((waiter, handed)) = handoff else {
                return Ok(());
            };
            match waiter.resume(Ok(handed)) {
                None => return Ok(()),
                // The waiter's future was dropped while queued: reclaim the
                // value and try the next waiter.
                Some(returned) => {
                    value = returned.expect("resume hands back the outcome it was given");
                }
            }
        }
    }

    /// Interrupt the runque.
    ///
    /// Every suspended `get` resumes with [`Interrupted`]; every later `get`
    /// or `put` fails the same way. Idempotent.
    pub async fn interrupt(&self) {
        let waiters: Vec<Arc<GetWaiter<V>>> = {
            let mut state = self.state.lock().await;
            state.interrupted = true;
            std::mem::take(&mut state.waiters)
        };

        if !waiters.is_empty() {
            tracing::debug!(waiters = waiters.len(), "runque interrupted with waiters");
        }
        for waiter in waiters {
            // An abandoned waiter hands the signal back; nothing to do.
            let _ = waiter.resume(Err(Interrupted));
        }
    }
}

impl<V, B> fmt::Debug for Runque<V, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runque").finish_non_exhaustive()
    }
}

// ============================================================================
//  Publish Sink
// ============================================================================

/// Boxed publication future; erases the runque's buffer parameter. On
/// interruption the item comes back so the caller can dispose of it
/// deliberately.
pub(crate) type PublishFuture<'a, V> =
    Pin<Box<dyn Future<Output = Result<(), (Interrupted, V)>> + Send + 'a>>;

/// Type-erased `put` used by the chain to publish retainments without
/// naming the runque's ordering parameter.
pub(crate) trait PublishSink<V>: Send + Sync {
    fn publish(&self, item: V) -> PublishFuture<'_, V>;
}

impl<V, B> PublishSink<V> for Runque<V, B>
where
    V: Send + 'static,
    B: OrderedBuffer<V> + Send + 'static,
{
    fn publish(&self, item: V) -> PublishFuture<'_, V> {
        Box::pin(self.put_reclaiming(item))
    }
}

// ============================================================================
//  SyncRunque (single-threaded)
// ============================================================================

/// Non-suspending specialization for single-threaded use.
///
/// `get` returns `None` instead of suspending when the buffer is empty.
/// Shares the interrupt semantics of the async variant.
#[derive(Debug)]
pub struct SyncRunque<V, B = FifoBuffer<V>> {
    items: B,
    interrupted: bool,
    _marker: std::marker::PhantomData<V>,
}

impl<V, B: OrderedBuffer<V> + Default> Default for SyncRunque<V, B> {
    fn default() -> Self {
        Self::new(B::default())
    }
}

impl<V, B: OrderedBuffer<V>> SyncRunque<V, B> {
    /// Build over an explicit buffer.
    #[must_use]
    pub fn new(buffer: B) -> Self {
        Self {
            items: buffer,
            interrupted: false,
            _marker: std::marker::PhantomData,
        }
    }

    /// Take the next value, if any.
    ///
    /// # Errors
    ///
    /// [`Interrupted`] once interrupted.
    pub fn get(&mut self) -> Result<Option<V>, Interrupted> {
        if self.interrupted {
            return Err(Interrupted);
        }
        Ok(self.items.pop())
    }

    /// Enqueue a value.
    ///
    /// # Errors
    ///
    /// [`Interrupted`] once interrupted.
    pub fn put(&mut self, value: V) -> Result<(), Interrupted> {
        if self.interrupted {
            return Err(Interrupted);
        }
        self.items.push(value);
        Ok(())
    }

    /// Poison all further traffic.
    pub fn interrupt(&mut self) {
        self.interrupted = true;
    }
}

// ============================================================================
//  Tests
// ============================================================================
