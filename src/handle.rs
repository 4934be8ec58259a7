//! Producer and consumer tickets.
//!
//! Both tickets wrap the same small record: the owning chain node, the
//! segment the slot was queued into, the slot itself, and the publication
//! sink. The record is cheap to clone and shares ownership of the slot, so
//! the chain keeps no back-reference to tickets and the runque can carry a
//! retainment independently of the producer's half.
//!
//! Consuming `self` in [`Reservation::release`] and [`Retainment::finalize`]
//! makes double use unrepresentable; dropping a ticket without completing it
//! is a contract violation (the slot keeps blocking its prefix) and is
//! logged.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::chain::{ChainNode, Slot};
use crate::runque::{Interrupted, PublishSink};

// ============================================================================
//  ItemRef
// ============================================================================

/// The shared ticket record for one queued slot.
pub(crate) struct ItemRef<T> {
    pub(crate) node: Arc<ChainNode<T>>,
    pub(crate) segment: u64,
    pub(crate) slot: Arc<Slot<T>>,
    pub(crate) sink: Weak<dyn PublishSink<Retainment<T>>>,
}

impl<T> Clone for ItemRef<T> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
            segment: self.segment,
            slot: Arc::clone(&self.slot),
            sink: self.sink.clone(),
        }
    }
}

// ============================================================================
//  Reservation
// ============================================================================

/// Producer-side ticket to an unfilled slot.
#[must_use = "an unreleased reservation blocks every later item at its prefix"]
pub struct Reservation<T> {
    item: Option<ItemRef<T>>,
}

impl<T> Reservation<T> {
    pub(crate) fn new(item: ItemRef<T>) -> Self {
        Self { item: Some(item) }
    }

    /// An already-released ticket, as handed back by an eager reserve.
    pub(crate) fn spent() -> Self {
        Self { item: None }
    }
}

impl<T: Send + Sync + 'static> Reservation<T> {
    /// Deposit the value, making the slot eligible for delivery.
    ///
    /// If the slot is already at the head of its prefix's serving order the
    /// retainment is published to the runque before this returns.
    ///
    /// # Errors
    ///
    /// [`Interrupted`] if the publication reaches an interrupted runque; the
    /// reservation is abandoned in that case.
    pub async fn release(mut self, value: T) -> Result<(), Interrupted> {
        let item: ItemRef<T> = self.item.take().expect("reservation already consumed");
        crate::chain::release(item, value).await
    }
}

impl<T> Drop for Reservation<T> {
    fn drop(&mut self) {
        if self.item.is_some() {
            tracing::warn!(
                target: "forque::handle",
                "reservation dropped without release; its prefix stays blocked"
            );
        }
    }
}

impl<T> fmt::Debug for Reservation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("consumed", &self.item.is_none())
            .finish()
    }
}

// ============================================================================
//  Retainment
// ============================================================================

/// Consumer-side ticket to a delivered, not-yet-finalized slot.
#[must_use = "an unfinalized retainment blocks every later item at its prefix"]
pub struct Retainment<T> {
    item: Option<ItemRef<T>>,
}

impl<T> Retainment<T> {
    pub(crate) fn new(item: ItemRef<T>) -> Self {
        Self { item: Some(item) }
    }

    pub(crate) fn item(&self) -> &ItemRef<T> {
        self.item.as_ref().expect("retainment already consumed")
    }

    /// Swallow the ticket without the contract-violation warning; used when
    /// an interrupt abandons publications mid-flight.
    pub(crate) fn abandon(mut self) {
        self.item.take();
    }

    /// Borrow the carried value. Valid until [`finalize`](Self::finalize).
    #[must_use]
    pub fn value(&self) -> &T {
        self.item()
            .slot
            .value()
            .expect("retainment delivered without a value")
    }
}

impl<T: Send + Sync + 'static> Retainment<T> {
    /// Erase the slot and cascade readiness to whatever it was blocking.
    ///
    /// # Errors
    ///
    /// [`Interrupted`] if a resulting publication reaches an interrupted
    /// runque.
    pub async fn finalize(mut self) -> Result<(), Interrupted> {
        let item: ItemRef<T> = self.item.take().expect("retainment already consumed");
        crate::chain::finalize(item).await
    }
}

impl<T> Drop for Retainment<T> {
    fn drop(&mut self) {
        if self.item.is_some() {
            tracing::warn!(
                target: "forque::handle",
                "retainment dropped without finalize; its prefix stays blocked"
            );
        }
    }
}

impl<T> fmt::Debug for Retainment<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retainment")
            .field("consumed", &self.item.is_none())
            .finish()
    }
}
