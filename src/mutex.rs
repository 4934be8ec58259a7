//! Cooperative mutex for suspension-based exclusion.
//!
//! [`Mutex`] never blocks a thread. A contended `lock()` suspends the calling
//! task and the holder's `unlock` resumes exactly one waiter, which then owns
//! the lock. The entire fast path lives in a single atomic word.
//!
//! # State Word
//!
//! Bit 0: `taken` | Bit 1: `has waiters` | Bits 2..: waiter-stack pointer
//!
//! - `0b00`: free
//! - `0b01`: taken, nobody waiting
//! - `ptr | 0b11`: taken, with an atomically pushed LIFO stack of waiters
//!
//! A second field holds waiters already popped out of the word, reversed into
//! arrival order. Only the current lock holder touches it, so release costs at
//! most one atomic exchange. Waiters that arrive while the lock is held are
//! resumed FIFO within their cohort; cohorts themselves are served LIFO.
//! Fairness beyond that is not a contract.
//!
//! # Concurrency Model
//!
//! 1. `lock()`: CAS `free -> taken`, or push a waiter node and suspend.
//! 2. `unlock` (guard drop): CAS `taken -> free`, or swap the stack out,
//!    reverse it, and hand the lock to the head waiter. The resumed task owns
//!    the lock; the state word stays taken across the hand-off.
//!
//! Unlike the coroutine original, a Rust future can be dropped while queued.
//! Each waiter node carries a small phase word (waiting/granted/abandoned) so
//! an unlock can reap dead nodes and a future granted the lock after its task
//! lost interest releases it again. See `DESIGN.md` for the full argument.

use std::cell::UnsafeCell;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::ptr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::task::{Context, Poll, Waker};

// ============================================================================
//  Bit Constants
// ============================================================================

/// Lock bit: the mutex is held.
const TAKEN_BIT: usize = 1 << 0;

/// Waiter bit: the high bits of the state word hold a waiter-stack pointer.
const WAITERS_BIT: usize = 1 << 1;

/// Mask covering both flag bits.
const STATE_MASK: usize = TAKEN_BIT | WAITERS_BIT;

/// Waiter phases. A node starts `WAITING`; exactly one of the two transitions
/// wins: the unlocker grants the lock, or the abandoned future opts out.
const PHASE_WAITING: u8 = 0;
const PHASE_GRANTED: u8 = 1;
const PHASE_ABANDONED: u8 = 2;

// ============================================================================
//  Waiter Node
// ============================================================================

/// One suspended `lock()` call.
///
/// Heap-allocated and reachable from two places while queued: the state word
/// (or the owner-private list) and the suspended [`LockFuture`]. Ownership is
/// resolved through `phase`:
///
/// - granted: the future frees the node,
/// - abandoned: the unlocker frees the node when it pops it.
///
/// The grant/abandon transition and every waker access happen under the
/// node's `waker` lock, which is what makes freeing on either side safe: the
/// loser of the phase race never touches the node after releasing that lock.
struct Waiter {
    /// Next node toward the stack bottom. Written before the node is
    /// published with a releasing CAS; read only by the holder after the
    /// acquiring swap in unlock.
    next: UnsafeCell<*mut Waiter>,

    /// `PHASE_WAITING` / `PHASE_GRANTED` / `PHASE_ABANDONED`.
    phase: AtomicU8,

    /// Waker of the suspended task, refreshed on every poll.
    waker: parking_lot::Mutex<Option<Waker>>,
}

impl Waiter {
    fn new(waker: Waker) -> Box<Self> {
        Box::new(Self {
            next: UnsafeCell::new(ptr::null_mut()),
            phase: AtomicU8::new(PHASE_WAITING),
            waker: parking_lot::Mutex::new(Some(waker)),
        })
    }
}

// ============================================================================
//  Mutex
// ============================================================================

/// A suspension-based mutex protecting `T`.
///
/// `lock()` resolves to a [`MutexGuard`] exactly once with the lock held.
/// Dropping the guard releases the lock; many hand-off paths in the chain
/// drop a guard mid-function to order the release against what follows.
///
/// # Panics
///
/// Unlocking a free mutex is a programming error and traps.
pub struct Mutex<T: ?Sized> {
    /// The state word described in the module docs.
    state: AtomicUsize,

    /// Waiters popped out of `state` and reversed into FIFO order.
    ///
    /// INVARIANT: touched only while holding the lock.
    pending: UnsafeCell<*mut Waiter>,

    data: UnsafeCell<T>,
}

// SAFETY: the data is handed out only through the guard, which requires the
// lock; the raw waiter pointers are coordinated through the state word and
// the per-node phase protocol described on `Waiter`.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Create an unlocked mutex around `value`.
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            state: AtomicUsize::new(0),
            pending: UnsafeCell::new(ptr::null_mut()),
            data: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquire the lock, suspending if it is held.
    ///
    /// The returned future resolves exactly once, with the lock held.
    pub fn lock(&self) -> LockFuture<'_, T> {
        LockFuture {
            mutex: self,
            node: ptr::null_mut(),
            stage: Stage::Start,
        }
    }

    /// Acquire the lock without suspending.
    ///
    /// Returns `None` if the lock is currently held.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let mut current: usize = self.state.load(Ordering::Relaxed);
        loop {
            if current & TAKEN_BIT != 0 {
                return None;
            }
            match self.state.compare_exchange_weak(
                current,
                TAKEN_BIT,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(MutexGuard { mutex: self }),
                Err(observed) => current = observed,
            }
        }
    }

    /// Whether the lock is currently held by anyone.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & TAKEN_BIT != 0
    }

    /// Release the lock, resuming one waiter if any are queued.
    ///
    /// Called from guard drop and from a lock future that was granted the
    /// lock after its task stopped polling.
    fn unlock(&self) {
        assert!(
            self.state.load(Ordering::Relaxed) & TAKEN_BIT != 0,
            "unlock of a free mutex"
        );

        // SAFETY: we hold the lock, so `pending` is ours, and every node we
        // dereference was published to the state word with release ordering
        // and claimed back here with acquire ordering.
        unsafe {
            let mut head: *mut Waiter = *self.pending.get();
            loop {
                if head.is_null() {
                    // Nobody queued at the last look: try the plain release.
                    if self
                        .state
                        .compare_exchange(TAKEN_BIT, 0, Ordering::Release, Ordering::Relaxed)
                        .is_ok()
                    {
                        return;
                    }

                    // Waiters arrived. Claim the whole stack in one exchange,
                    // keeping the lock held, and reverse it into arrival order.
                    let observed: usize = self.state.swap(TAKEN_BIT, Ordering::Acquire);
                    debug_assert!(observed & WAITERS_BIT != 0);

                    let mut stacked = (observed & !STATE_MASK) as *mut Waiter;
                    while !stacked.is_null() {
                        let next: *mut Waiter = *(*stacked).next.get();
                        *(*stacked).next.get() = head;
                        head = stacked;
                        stacked = next;
                    }
                }

                // Pop the oldest waiter and try to hand it the lock.
                let waiter: *mut Waiter = head;
                head = *(*waiter).next.get();
                *self.pending.get() = head;

                let mut slot = (*waiter).waker.lock();
                match (*waiter).phase.compare_exchange(
                    PHASE_WAITING,
                    PHASE_GRANTED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        // Ownership transferred: the state word stays taken
                        // and the granted future frees the node.
                        let waker: Option<Waker> = slot.take();
                        drop(slot);
                        if let Some(waker) = waker {
                            waker.wake();
                        }
                        return;
                    }
                    Err(_) => {
                        // The future was dropped while queued; reap the node
                        // and keep looking for a live waiter.
                        drop(slot);
                        drop(Box::from_raw(waiter));
                    }
                }
            }
        }
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> std::fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

// ============================================================================
//  MutexGuard
// ============================================================================

/// Proof that the lock is held; releases on drop.
#[must_use = "dropping a guard immediately releases the lock"]
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

// SAFETY: the guard is an exclusive handle on the data; sending it to another
// thread is sending `&mut T`, sharing it is sharing `&T`.
unsafe impl<T: ?Sized + Send> Send for MutexGuard<'_, T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for MutexGuard<'_, T> {}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the lock is held for the guard's whole lifetime.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above, and the guard is unique.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<T: ?Sized + std::fmt::Debug> std::fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&**self, f)
    }
}

// ============================================================================
//  LockFuture
// ============================================================================

/// Where a [`LockFuture`] is in its life.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Not yet queued; the next poll runs the CAS loop.
    Start,

    /// Parked in the waiter stack (or the owner-private list).
    Queued,

    /// Resolved; polling again is a bug.
    Done,
}

/// Future returned by [`Mutex::lock`].
pub struct LockFuture<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,

    /// Waiter node, allocated lazily on first contention.
    node: *mut Waiter,

    stage: Stage,
}

// SAFETY: the raw node is either private to this future or shared under the
// waiter protocol; nothing about it is tied to a thread.
unsafe impl<T: ?Sized + Send> Send for LockFuture<'_, T> {}

impl<T: ?Sized> LockFuture<'_, T> {
    /// Free the lazily allocated node, if any. Only sound while the node is
    /// private to this future (never published, or reclaimed after a grant).
    fn discard_node(&mut self) {
        if !self.node.is_null() {
            // SAFETY: per above, this future is the sole owner right now.
            unsafe { drop(Box::from_raw(self.node)) };
            self.node = ptr::null_mut();
        }
    }
}

impl<'a, T: ?Sized> Future for LockFuture<'a, T> {
    type Output = MutexGuard<'a, T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        match this.stage {
            Stage::Done => panic!("lock future polled after completion"),

            Stage::Start => {
                let mut current: usize = this.mutex.state.load(Ordering::Relaxed);
                loop {
                    if current & TAKEN_BIT == 0 {
                        match this.mutex.state.compare_exchange_weak(
                            current,
                            TAKEN_BIT,
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        ) {
                            Ok(_) => {
                                this.discard_node();
                                this.stage = Stage::Done;
                                return Poll::Ready(MutexGuard { mutex: this.mutex });
                            }
                            Err(observed) => current = observed,
                        }
                        continue;
                    }

                    // Contended: publish a waiter node on the stack. The
                    // waker is stored before the node becomes reachable.
                    if this.node.is_null() {
                        this.node = Box::into_raw(Waiter::new(cx.waker().clone()));
                    }

                    let below: *mut Waiter = if current & WAITERS_BIT != 0 {
                        (current & !STATE_MASK) as *mut Waiter
                    } else {
                        ptr::null_mut()
                    };
                    // SAFETY: the node is still private until the CAS below
                    // succeeds.
                    unsafe { *(*this.node).next.get() = below };

                    debug_assert_eq!(this.node as usize & STATE_MASK, 0);
                    let desired: usize = this.node as usize | TAKEN_BIT | WAITERS_BIT;

                    // AcqRel: release publishes the node linkage to the
                    // unlocker's acquiring swap; acquire keeps the lock-path
                    // ordering uniform.
                    match this.mutex.state.compare_exchange_weak(
                        current,
                        desired,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => {
                            this.stage = Stage::Queued;
                            return Poll::Pending;
                        }
                        Err(observed) => current = observed,
                    }
                }
            }

            Stage::Queued => {
                // SAFETY: a queued node stays alive until we free it below or
                // in drop; see `Waiter`.
                let node = unsafe { &*this.node };

                let mut slot = node.waker.lock();
                if node.phase.load(Ordering::Acquire) == PHASE_GRANTED {
                    // Taking the waker lock above serialized us behind the
                    // unlocker's hand-off, so the node is ours to free.
                    drop(slot);
                    this.discard_node();
                    this.stage = Stage::Done;
                    return Poll::Ready(MutexGuard { mutex: this.mutex });
                }

                *slot = Some(cx.waker().clone());
                drop(slot);
                Poll::Pending
            }
        }
    }
}

impl<T: ?Sized> Drop for LockFuture<'_, T> {
    fn drop(&mut self) {
        match self.stage {
            Stage::Done => {}
            Stage::Start => self.discard_node(),
            Stage::Queued => {
                // SAFETY: queued nodes stay alive until a phase transition
                // settles ownership.
                let node = unsafe { &*self.node };

                let mut slot = node.waker.lock();
                match node.phase.compare_exchange(
                    PHASE_WAITING,
                    PHASE_ABANDONED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        // The queue keeps the node; unlock reaps it.
                        slot.take();
                        drop(slot);
                        self.node = ptr::null_mut();
                    }
                    Err(_) => {
                        // Granted between the last poll and this drop: the
                        // lock is ours and nobody else will release it.
                        drop(slot);
                        self.discard_node();
                        self.mutex.unlock();
                    }
                }
            }
        }
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::{Pin, pin};
    use std::sync::Arc;
    use std::task::{Context, Poll, Waker};

    use super::Mutex;

    /// Poll a future once with a no-op waker.
    fn poll_once<F: Future>(future: Pin<&mut F>) -> Poll<F::Output> {
        let mut cx = Context::from_waker(Waker::noop());
        future.poll(&mut cx)
    }

    #[test]
    fn uncontended_lock_resolves_immediately() {
        let mutex = Mutex::new(7_u32);

        let mut future = pin!(mutex.lock());
        let Poll::Ready(mut guard) = poll_once(future.as_mut()) else {
            panic!("uncontended lock suspended");
        };

        *guard += 1;
        drop(guard);

        assert!(!mutex.is_locked());
        assert_eq!(*mutex.try_lock().unwrap(), 8);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let mutex = Mutex::new(());

        let guard = mutex.try_lock().unwrap();
        assert!(mutex.is_locked());
        assert!(mutex.try_lock().is_none());

        drop(guard);
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn contended_lock_suspends_and_resumes_on_release() {
        let mutex = Mutex::new(0_i32);

        let guard = mutex.try_lock().unwrap();

        let mut future = pin!(mutex.lock());
        assert!(poll_once(future.as_mut()).is_pending());

        // Release: the queued waiter is granted the lock.
        drop(guard);

        let Poll::Ready(guard) = poll_once(future.as_mut()) else {
            panic!("granted waiter still pending");
        };
        assert!(mutex.is_locked());
        drop(guard);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn abandoned_waiter_is_reaped_on_release() {
        let mutex = Mutex::new(());

        let guard = mutex.try_lock().unwrap();

        {
            let mut future = pin!(mutex.lock());
            assert!(poll_once(future.as_mut()).is_pending());
            // Future dropped here while queued.
        }

        // The release must skip the dead waiter and leave the mutex free.
        drop(guard);
        assert!(!mutex.is_locked());
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn waiters_within_a_cohort_resume_in_fifo_order() {
        let mutex = Mutex::new(());

        let guard = mutex.try_lock().unwrap();

        let mut first = pin!(mutex.lock());
        let mut second = pin!(mutex.lock());
        assert!(poll_once(first.as_mut()).is_pending());
        assert!(poll_once(second.as_mut()).is_pending());

        drop(guard);

        // Both queued while the lock was held: the earlier arrival wins.
        assert!(poll_once(second.as_mut()).is_pending());
        let Poll::Ready(guard) = poll_once(first.as_mut()) else {
            panic!("first waiter not granted");
        };

        drop(guard);
        let Poll::Ready(guard) = poll_once(second.as_mut()) else {
            panic!("second waiter not granted");
        };
        drop(guard);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn guard_hands_off_across_tasks() {
        let mutex = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for id in 0..8_u32 {
            let mutex = Arc::clone(&mutex);
            tasks.push(tokio::spawn(async move {
                for _ in 0..100 {
                    let mut guard = mutex.lock().await;
                    guard.push(id);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(mutex.lock().await.len(), 800);
    }
}
