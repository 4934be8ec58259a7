//! The forque facade: one runque, one chain tree.
//!
//! A [`Forque`] owns the whole structure: the runque consumers drain, the
//! real root of the chain tree, and a synthetic *meta root* above it so the
//! real root participates uniformly in the parent-before-child protocol
//! (its retirement goes through `remove_child` like everyone else's). Both
//! roots are born active.
//!
//! All back-references inside the tree are non-owning and anchored here:
//! tickets must not outlive the forque that issued them.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::chain::{self, ChainNode, NodeCensus};
use crate::handle::{Reservation, Retainment};
use crate::runque::{FifoBuffer, Interrupted, OrderedBuffer, PublishSink, Runque};
use crate::tag::{Tag, TagKey};

/// Tag-structured work queue with hierarchical prefix exclusion.
///
/// While any item carrying a given tag prefix is in flight, no other item
/// with that prefix is delivered; disjoint prefixes run fully in parallel,
/// and arrival order is preserved within each prefix.
///
/// `B` picks the runque's ordering for ready items across prefixes; the
/// per-prefix guarantees do not depend on it.
pub struct Forque<T, B = FifoBuffer<Retainment<T>>> {
    runque: Arc<Runque<Retainment<T>, B>>,
    meta: Arc<ChainNode<T>>,
    root: Arc<ChainNode<T>>,
}

impl<T, B> Forque<T, B>
where
    T: Send + Sync + 'static,
    B: OrderedBuffer<Retainment<T>> + Send + 'static,
{
    /// Construct an empty queue over an explicit runque buffer.
    #[must_use]
    pub fn with_buffer(buffer: B) -> Self {
        let census = Arc::new(NodeCensus::default());
        let meta: Arc<ChainNode<T>> =
            ChainNode::new(Weak::new(), None, true, false, Arc::clone(&census));
        let root: Arc<ChainNode<T>> = ChainNode::new(
            Arc::downgrade(&meta),
            Some(TagKey::unit()),
            true,
            true,
            census,
        );

        // Seat the root under the meta root's single eternal epoch.
        {
            let mut state = meta
                .state
                .try_lock()
                .expect("freshly built node is uncontended");
            let segment = state.push_segment();
            segment.children.insert(TagKey::unit(), Arc::clone(&root));
        }

        Self {
            runque: Arc::new(Runque::new(buffer)),
            meta,
            root,
        }
    }

    /// Reserve a slot for `tag`.
    ///
    /// The slot is queued behind everything already reserved at the same
    /// prefix; it becomes deliverable once its value is released and its
    /// turn arrives.
    pub async fn reserve(&self, tag: &Tag) -> Reservation<T> {
        chain::reserve(&self.root, tag, self.sink()).await
    }

    /// Reserve and release in one step.
    ///
    /// Equivalent to `reserve(tag)` followed by an immediate release of
    /// `value`, except the value is deposited before the chain lock is
    /// dropped, so an already-eligible slot publishes without a second
    /// lock round.
    ///
    /// # Errors
    ///
    /// [`Interrupted`] if the immediate publication reaches an interrupted
    /// runque.
    pub async fn submit(&self, tag: &Tag, value: T) -> Result<(), Interrupted> {
        let _spent: Reservation<T> =
            chain::reserve_eager(&self.root, tag, self.sink(), value).await?;
        Ok(())
    }

    /// Await the next eligible retainment.
    ///
    /// # Errors
    ///
    /// [`Interrupted`] once the queue has been interrupted.
    pub async fn get(&self) -> Result<Retainment<T>, Interrupted> {
        self.runque.get().await
    }

    /// Wake every consumer with [`Interrupted`] and poison all further
    /// traffic. Outstanding reservations are abandoned: their releases fail
    /// with [`Interrupted`] when they would publish.
    pub async fn interrupt(&self) {
        self.runque.interrupt().await;
    }

    /// Number of live chain nodes, the meta root and real root included.
    ///
    /// Settles back to 2 after matched reserve/release/get/finalize cycles
    /// have drained.
    #[must_use]
    pub fn live_chain_nodes(&self) -> usize {
        self.meta.census().live()
    }

    /// The publication sink handed to chain operations.
    fn sink(&self) -> Weak<dyn PublishSink<Retainment<T>>> {
        let arc: Arc<Runque<Retainment<T>, B>> = Arc::clone(&self.runque);
        let arc: Arc<dyn PublishSink<Retainment<T>>> = arc;
        Arc::downgrade(&arc)
    }

    #[cfg(test)]
    pub(crate) fn root_handle(&self) -> &Arc<ChainNode<T>> {
        &self.root
    }

    #[cfg(test)]
    pub(crate) fn runque_handle(&self) -> Arc<dyn PublishSink<Retainment<T>>> {
        let arc: Arc<Runque<Retainment<T>, B>> = Arc::clone(&self.runque);
        arc
    }
}

impl<T, B> Default for Forque<T, B>
where
    T: Send + Sync + 'static,
    B: OrderedBuffer<Retainment<T>> + Default + Send + 'static,
{
    fn default() -> Self {
        Self::with_buffer(B::default())
    }
}

impl<T> Forque<T, FifoBuffer<Retainment<T>>>
where
    T: Send + Sync + 'static,
{
    /// Construct an empty FIFO-ordered queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T, B> fmt::Debug for Forque<T, B>
where
    T: Send + Sync + 'static,
    B: OrderedBuffer<Retainment<T>> + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Forque")
            .field("live_chain_nodes", &self.live_chain_nodes())
            .finish_non_exhaustive()
    }
}
