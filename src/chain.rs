//! The chain/segment tree: prefix exclusion and FIFO-within-prefix.
//!
//! Every tag prefix maps to a chain node; each node orders the work queued
//! at exactly its prefix into *segments*, the epochs of that prefix. A
//! segment holds *siblings* (slots queued at this prefix during the epoch)
//! and a child map (deeper prefixes opened during the epoch). Within one
//! epoch siblings serve strictly before children; epochs serve strictly in
//! order. Disjoint prefixes never wait on each other.
//!
//! # Invariants
//!
//! 1. The serving segment of a node is always the head of its deque, and it
//!    serves only while the node is `active`.
//! 2. The head sibling of the serving segment is the next eligible item;
//!    its retainment is published once its value arrives.
//! 3. A segment that has grown children (*forked*) accepts no new siblings;
//!    later work at this exact prefix opens a trailing segment.
//! 4. A child is born active exactly when it is created under an active,
//!    sibling-free serving segment; otherwise activation reaches it later
//!    through the cascade.
//! 5. `version` is node-wide monotonic and bumped on every structural
//!    mutation. Retirement captures it before releasing its locks, and
//!    `remove_child` erases a child only if the child still holds the
//!    captured version; any interleaved reserve voids the removal.
//!
//! # Locking
//!
//! Each node's state sits behind one [`Mutex`](crate::mutex::Mutex). Every
//! multi-lock acquisition is parent-before-child; descent overlaps (child
//! locked, then parent released) so a reserve can never slip into a node
//! that a concurrent retirement is detaching. Paths that walk upward first
//! capture what they need, release both locks, and reacquire from scratch.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::handle::{ItemRef, Reservation, Retainment};
use crate::mutex::{Mutex, MutexGuard};
use crate::runque::{Interrupted, PublishSink};
use crate::tag::{Tag, TagKey};

mod retire;
mod serve;
pub mod test_hooks;

pub(crate) use retire::finalize;
pub(crate) use serve::release;

// ============================================================================
//  Census
// ============================================================================

/// Live chain-node accounting.
///
/// Every node registers at creation and deregisters on drop; after matched
/// reserves, releases, finalizes and drains the count settles back to the
/// meta root plus the real root.
#[derive(Debug, Default)]
pub(crate) struct NodeCensus {
    live: AtomicUsize,
}

impl NodeCensus {
    fn spawned(&self) {
        self.live.fetch_add(1, Ordering::Relaxed);
    }

    fn retired(&self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

// ============================================================================
//  Slots and Segments
// ============================================================================

/// One queued item: an initially empty value cell.
///
/// The cell is written once by `release` and read by the consumer through
/// its retainment until `finalize` erases the slot.
pub(crate) struct Slot<T> {
    value: OnceLock<T>,
}

impl<T> Slot<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            value: OnceLock::new(),
        })
    }

    /// Deposit the value. Trapping here means a double release, which the
    /// consuming ticket API is supposed to make unrepresentable.
    pub(crate) fn store(&self, value: T) {
        assert!(self.value.set(value).is_ok(), "slot released twice");
    }

    pub(crate) fn value(&self) -> Option<&T> {
        self.value.get()
    }
}

/// One epoch of a chain node's ordering.
pub(crate) struct Segment<T> {
    pub(crate) id: u64,
    pub(crate) siblings: VecDeque<Arc<Slot<T>>>,
    pub(crate) children: HashMap<TagKey, Arc<ChainNode<T>>>,
}

impl<T> Segment<T> {
    fn new(id: u64) -> Self {
        Self {
            id,
            siblings: VecDeque::new(),
            children: HashMap::new(),
        }
    }

    /// A forked segment has grown children and accepts no new siblings.
    pub(crate) fn is_forked(&self) -> bool {
        !self.children.is_empty()
    }

    /// Nothing left to serve in this epoch.
    pub(crate) fn is_exhausted(&self) -> bool {
        self.siblings.is_empty() && self.children.is_empty()
    }
}

// ============================================================================
//  Chain Nodes
// ============================================================================

/// Mutable state of a chain node, guarded by the node's mutex.
pub(crate) struct NodeState<T> {
    pub(crate) segments: VecDeque<Segment<T>>,

    /// Whether this prefix is currently allowed to publish. Never cleared:
    /// exhausted nodes are removed, not deactivated.
    pub(crate) active: bool,

    /// Node-wide monotonic mutation counter; the removal gate.
    pub(crate) version: u64,

    next_segment_id: u64,
}

impl<T> NodeState<T> {
    /// Record a structural mutation.
    pub(crate) fn touch(&mut self) {
        self.version += 1;
    }

    /// Open a trailing segment.
    pub(crate) fn push_segment(&mut self) -> &mut Segment<T> {
        self.version += 1;
        let id: u64 = self.next_segment_id;
        self.next_segment_id += 1;
        self.segments.push_back(Segment::new(id));
        self.segments.back_mut().expect("segment just pushed")
    }
}

/// One level of the prefix tree.
///
/// Ownership runs strictly top-down (meta root → root → children through
/// the segment child maps); `parent` is a non-owning back-reference whose
/// lifetime is anchored at the forque.
pub(crate) struct ChainNode<T> {
    pub(crate) state: Mutex<NodeState<T>>,
    pub(crate) parent: Weak<ChainNode<T>>,

    /// This node's key in its parent's child map; `None` only for the meta
    /// root.
    pub(crate) key: Option<TagKey>,

    /// Set on the real root only. The root participates in the locking
    /// protocol through the meta root but is never retired through it; its
    /// retirement stops once its own segments are gone.
    pub(crate) is_root: bool,

    census: Arc<NodeCensus>,
}

impl<T> ChainNode<T> {
    pub(crate) fn new(
        parent: Weak<ChainNode<T>>,
        key: Option<TagKey>,
        active: bool,
        is_root: bool,
        census: Arc<NodeCensus>,
    ) -> Arc<Self> {
        census.spawned();
        tracing::trace!(target: "forque::chain", ?key, active, "chain node created");
        Arc::new(Self {
            state: Mutex::new(NodeState {
                segments: VecDeque::new(),
                active,
                version: 0,
                next_segment_id: 0,
            }),
            parent,
            key,
            is_root,
            census,
        })
    }

    pub(crate) fn census(&self) -> &NodeCensus {
        &self.census
    }
}

impl<T> Drop for ChainNode<T> {
    fn drop(&mut self) {
        self.census.retired();
    }
}

// ============================================================================
//  LockedNode
// ============================================================================

/// A chain node together with its held lock.
///
/// Traversals rebind "current node" while keeping a lock held, which a
/// guard borrowing a local `Arc` cannot express. The guard here is detached
/// to `'static`: the mutex it releases lives inside the `Arc` allocation,
/// which the `node` field keeps alive for at least as long as the guard,
/// and the field order releases the lock before the `Arc` can drop.
pub(crate) struct LockedNode<T: 'static> {
    guard: MutexGuard<'static, NodeState<T>>,
    node: Arc<ChainNode<T>>,
}

impl<T: 'static> LockedNode<T> {
    pub(crate) async fn lock(node: Arc<ChainNode<T>>) -> Self {
        let guard: MutexGuard<'_, NodeState<T>> = node.state.lock().await;
        // SAFETY: see the type docs; the borrow is re-anchored from the
        // stack `Arc` to the heap allocation it pins.
        let guard: MutexGuard<'static, NodeState<T>> = unsafe {
            std::mem::transmute::<MutexGuard<'_, NodeState<T>>, MutexGuard<'static, NodeState<T>>>(
                guard,
            )
        };
        Self { guard, node }
    }

    pub(crate) fn node(&self) -> &Arc<ChainNode<T>> {
        &self.node
    }
}

impl<T: 'static> Deref for LockedNode<T> {
    type Target = NodeState<T>;

    fn deref(&self) -> &NodeState<T> {
        &self.guard
    }
}

impl<T: 'static> DerefMut for LockedNode<T> {
    fn deref_mut(&mut self) -> &mut NodeState<T> {
        &mut self.guard
    }
}

// ============================================================================
//  Reserve
// ============================================================================

/// Reserve a slot for `tag`, descending from `root` and creating chain
/// nodes lazily.
pub(crate) async fn reserve<T: Send + Sync + 'static>(
    root: &Arc<ChainNode<T>>,
    tag: &Tag,
    sink: Weak<dyn PublishSink<Retainment<T>>>,
) -> Reservation<T> {
    let (reservation, published) = reserve_slot(root, tag, sink, None).await;
    debug_assert!(published.is_none(), "reserve without a value published");
    reservation
}

/// Reserve and release in one step.
///
/// The value is deposited before the node's lock is dropped; if the fresh
/// slot is already eligible (active serving segment, only sibling) its
/// retainment is published immediately.
///
/// # Errors
///
/// [`Interrupted`] if the eager publication reaches an interrupted runque.
pub(crate) async fn reserve_eager<T: Send + Sync + 'static>(
    root: &Arc<ChainNode<T>>,
    tag: &Tag,
    sink: Weak<dyn PublishSink<Retainment<T>>>,
    value: T,
) -> Result<Reservation<T>, Interrupted> {
    let (reservation, published) = reserve_slot(root, tag, sink, Some(value)).await;
    if let Some(retainment) = published {
        publish_all(vec![retainment]).await?;
    }
    Ok(reservation)
}

async fn reserve_slot<T: Send + Sync + 'static>(
    root: &Arc<ChainNode<T>>,
    tag: &Tag,
    sink: Weak<dyn PublishSink<Retainment<T>>>,
    eager: Option<T>,
) -> (Reservation<T>, Option<Retainment<T>>) {
    let mut locked: LockedNode<T> = LockedNode::lock(Arc::clone(root)).await;
    let mut view = tag.view();

    // Descend to the node addressing the full tag, creating levels lazily.
    // Every level's key selects a child, the last included: two tags that
    // differ only in their final level land in distinct nodes and run in
    // parallel. Only items tagged exactly a node's prefix queue as its
    // siblings.
    loop {
        if locked.segments.is_empty() {
            locked.push_segment();
        }
        let node_active: bool = locked.active;
        let serving: bool = locked.segments.len() == 1;

        let existing: Option<Arc<ChainNode<T>>> = locked
            .segments
            .back()
            .expect("segment ensured above")
            .children
            .get(view.key())
            .cloned();

        let child: Arc<ChainNode<T>> = match existing {
            Some(child) => child,
            None => {
                let sibling_free: bool = locked
                    .segments
                    .back()
                    .expect("segment ensured above")
                    .siblings
                    .is_empty();
                let born_active: bool = node_active && serving && sibling_free;

                let child = ChainNode::new(
                    Arc::downgrade(locked.node()),
                    Some(view.key().clone()),
                    born_active,
                    false,
                    Arc::clone(&locked.node().census),
                );
                locked.touch();
                locked
                    .segments
                    .back_mut()
                    .expect("segment ensured above")
                    .children
                    .insert(view.key().clone(), Arc::clone(&child));
                child
            }
        };

        // Parent-before-child: take the child's lock while still holding
        // ours, so a concurrent retirement cannot detach the child in
        // between, then release ours before moving on.
        let child_locked: LockedNode<T> = LockedNode::lock(child).await;
        drop(locked);
        locked = child_locked;

        if view.last() {
            break;
        }
        view = view.next();
    }

    // Append the item as a sibling of the full-tag node's tail epoch.
    if locked
        .segments
        .back()
        .is_none_or(|segment| segment.is_forked())
    {
        locked.push_segment();
    }

    locked.touch();
    let node_active: bool = locked.active;
    let serving: bool = locked.segments.len() == 1;

    let slot: Arc<Slot<T>> = Slot::new();
    let (segment_id, only_sibling) = {
        let segment = locked.segments.back_mut().expect("segment ensured above");
        segment.siblings.push_back(Arc::clone(&slot));
        (segment.id, segment.siblings.len() == 1)
    };

    let item = ItemRef {
        node: Arc::clone(locked.node()),
        segment: segment_id,
        slot,
        sink,
    };

    // An eager value is deposited either way; publication additionally
    // needs the fresh slot to be the head of an active serving segment.
    // The ticket handed back for an eager reserve is already spent.
    let (reservation, published) = match eager {
        Some(value) => {
            item.slot.store(value);
            let published = (node_active && serving && only_sibling)
                .then(|| Retainment::new(item.clone()));
            (Reservation::spent(), published)
        }
        None => (Reservation::new(item), None),
    };

    drop(locked);
    (reservation, published)
}

// ============================================================================
//  Activation
// ============================================================================

/// Wake an inactive subtree whose prefix just unblocked.
///
/// Marks each node active and either publishes the head sibling of its
/// serving segment (if the value already arrived) or cascades into the
/// segment's children. Locks one node at a time; the cascade only ever
/// walks downward.
pub(crate) async fn activate_subtree<T: Send + Sync + 'static>(
    mut pending: Vec<Arc<ChainNode<T>>>,
    sink: &Weak<dyn PublishSink<Retainment<T>>>,
) -> Vec<Retainment<T>> {
    let mut ready: Vec<Retainment<T>> = Vec::new();

    while let Some(node) = pending.pop() {
        let mut locked: LockedNode<T> = LockedNode::lock(node).await;
        locked.active = true;

        let Some(segment) = locked.segments.front() else {
            // Created during a descent that has not reached its leaf yet;
            // the pending reserve publishes through the active flag later.
            continue;
        };

        match segment.siblings.front() {
            Some(head) => {
                if head.value().is_some() {
                    ready.push(Retainment::new(ItemRef {
                        node: Arc::clone(locked.node()),
                        segment: segment.id,
                        slot: Arc::clone(head),
                        sink: sink.clone(),
                    }));
                }
                // An empty head slot is published by its eventual release.
            }
            None => pending.extend(segment.children.values().cloned()),
        }
    }

    ready
}

// ============================================================================
//  Publication
// ============================================================================

/// Push freshly eligible retainments into the runque.
///
/// Runs with no chain lock held. On interruption the remaining retainments
/// are abandoned (the queue is tearing down) and the failure propagates.
pub(crate) async fn publish_all<T: Send + Sync + 'static>(
    ready: Vec<Retainment<T>>,
) -> Result<(), Interrupted> {
    let mut pending = ready.into_iter();
    while let Some(retainment) = pending.next() {
        let sink: Arc<dyn PublishSink<Retainment<T>>> = retainment
            .item()
            .sink
            .upgrade()
            .expect("retainment published after its forque was dropped");

        tracing::trace!(target: "forque::chain", "retainment published");
        if let Err((interrupted, rejected)) = sink.publish(retainment).await {
            rejected.abandon();
            for abandoned in pending {
                abandoned.abandon();
            }
            return Err(interrupted);
        }
    }
    Ok(())
}

// ============================================================================
//  Tests
// ============================================================================
