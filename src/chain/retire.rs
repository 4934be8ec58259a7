//! Finalization, segment retirement, and version-gated child removal.
//!
//! `finalize` pops the served head sibling and decides the continuation:
//! promote the next sibling, wake the segment's children, or retire the
//! exhausted epoch. Retirement may remove the whole node from its parent
//! and cascade further up; every upward step captures what it needs,
//! releases both held locks, and reacquires (parent, child) from scratch,
//! re-verifying everything it assumed, the same capture/relock/validate
//! discipline as a parent-pointer acquisition in a locked tree.

use std::sync::Arc;

use super::test_hooks;
use super::{ChainNode, LockedNode, activate_subtree, publish_all};
use crate::handle::{ItemRef, Retainment};
use crate::runque::Interrupted;
use crate::tag::TagKey;

/// Finish a served item: erase its slot and cascade readiness.
///
/// Runs under (parent, self) locks acquired in that order; the paths that
/// stay within the node drop the parent lock immediately.
///
/// # Errors
///
/// [`Interrupted`] if a resulting publication reaches an interrupted
/// runque.
///
/// # Panics
///
/// Panics on contract violations: finalizing outside the serving segment
/// or a slot that is not its segment's head (both only reachable through a
/// double finalize or a forgotten release), or finalizing after the forque
/// is gone.
pub(crate) async fn finalize<T: Send + Sync + 'static>(item: ItemRef<T>) -> Result<(), Interrupted> {
    let parent: Arc<ChainNode<T>> = item
        .node
        .parent
        .upgrade()
        .expect("chain node outlived its forque");

    let parent_locked: LockedNode<T> = LockedNode::lock(parent).await;
    let mut locked: LockedNode<T> = LockedNode::lock(Arc::clone(&item.node)).await;

    // Pop the served head sibling.
    locked.touch();
    {
        let segment = locked
            .segments
            .front_mut()
            .expect("finalize on an empty chain node");
        assert_eq!(
            segment.id, item.segment,
            "finalize outside the serving segment"
        );
        let head = segment
            .siblings
            .pop_front()
            .expect("finalize on an empty segment");
        assert!(
            Arc::ptr_eq(&head, &item.slot),
            "finalize of a slot that is not the head of its segment"
        );
    }

    let segment = locked.segments.front().expect("segment still present");

    let ready: Vec<Retainment<T>> = if let Some(next_head) = segment.siblings.front() {
        // The epoch continues: promote the new head if its value arrived.
        drop(parent_locked);
        let ready = match next_head.value() {
            Some(_) => vec![Retainment::new(ItemRef {
                node: Arc::clone(locked.node()),
                segment: segment.id,
                slot: Arc::clone(next_head),
                sink: item.sink.clone(),
            })],
            None => Vec::new(),
        };
        drop(locked);
        ready
    } else if segment.is_forked() {
        // Siblings drained; the epoch's children take over.
        drop(parent_locked);
        let children: Vec<Arc<ChainNode<T>>> = segment.children.values().cloned().collect();
        drop(locked);
        activate_subtree(children, &item.sink).await
    } else {
        // The epoch is exhausted; retire it, still holding both locks.
        retire_serving_segment(parent_locked, locked, &item).await
    };

    publish_all(ready).await
}

/// Retire the exhausted serving segment of `locked`, cascading upward.
///
/// Entered with (parent, self) locks held. Either the node has a trailing
/// epoch to activate, or the node itself is exhausted and must be removed
/// from its parent, which may in turn exhaust the parent's serving
/// segment, continuing the loop one level up. The walk ends at the real
/// root: its segments retire like anyone's, but the node itself stays
/// seated under the meta root.
async fn retire_serving_segment<T: Send + Sync + 'static>(
    mut parent_locked: LockedNode<T>,
    mut locked: LockedNode<T>,
    item: &ItemRef<T>,
) -> Vec<Retainment<T>> {
    loop {
        debug_assert!(
            locked
                .segments
                .front()
                .is_some_and(super::Segment::is_exhausted),
            "retiring a segment that still has work"
        );
        locked.touch();
        locked.segments.pop_front();
        tracing::trace!(target: "forque::chain", "segment retired");

        if !locked.segments.is_empty() {
            // A trailing epoch exists: it becomes the serving segment.
            drop(parent_locked);

            let segment = locked.segments.front().expect("trailing segment");
            if let Some(head) = segment.siblings.front() {
                let ready = match head.value() {
                    Some(_) => vec![Retainment::new(ItemRef {
                        node: Arc::clone(locked.node()),
                        segment: segment.id,
                        slot: Arc::clone(head),
                        sink: item.sink.clone(),
                    })],
                    None => Vec::new(),
                };
                drop(locked);
                return ready;
            }

            let children: Vec<Arc<ChainNode<T>>> = segment.children.values().cloned().collect();
            drop(locked);
            return activate_subtree(children, &item.sink).await;
        }

        // The root is never retired through its parent: it sits empty under
        // the meta root's eternal epoch until the next reserve opens a
        // fresh one.
        if locked.node().is_root {
            return Vec::new();
        }

        // The node is exhausted. Capture everything the removal needs, drop
        // both locks (parent first), and go through remove_child.
        let key: TagKey = locked
            .node()
            .key
            .clone()
            .expect("only the meta root lacks a key, and it is never retired through a parent");
        let version: u64 = locked.version;
        let node: Arc<ChainNode<T>> = Arc::clone(locked.node());
        let parent: Arc<ChainNode<T>> = Arc::clone(parent_locked.node());
        drop(parent_locked);
        drop(locked);

        test_hooks::call_before_child_removal();

        match remove_child(parent, &key, version, &node).await {
            Cascade::Done => return Vec::new(),
            Cascade::Continue {
                parent_locked: next_parent,
                locked: next_node,
            } => {
                parent_locked = next_parent;
                locked = next_node;
            }
        }
    }
}

/// Outcome of a child removal: either the walk stops, or the parent's own
/// serving segment emptied and retirement continues one level up.
enum Cascade<T: 'static> {
    Done,
    Continue {
        parent_locked: LockedNode<T>,
        locked: LockedNode<T>,
    },
}

/// Erase `node` from `parent`'s serving segment, gated on the version
/// captured when the removal was decided.
///
/// Relocks (parent, child) in order and re-verifies: the child must still
/// sit in the serving segment under `key`, be the same node, and carry the
/// captured version. A reserve that slipped in (even one that fully
/// drained again) bumped the version, so the stale removal is a no-op.
/// The child's lock is dropped before the erase, so no observer can reach
/// a detached node through the map.
async fn remove_child<T: Send + Sync + 'static>(
    parent: Arc<ChainNode<T>>,
    key: &TagKey,
    version: u64,
    node: &Arc<ChainNode<T>>,
) -> Cascade<T> {
    let mut parent_locked: LockedNode<T> = LockedNode::lock(parent).await;

    let still_ours: bool = parent_locked
        .segments
        .front()
        .and_then(|segment| segment.children.get(key))
        .is_some_and(|child| Arc::ptr_eq(child, node));
    if !still_ours {
        tracing::trace!(target: "forque::chain", "child removal skipped: node replaced or gone");
        return Cascade::Done;
    }

    {
        let child_locked: LockedNode<T> = LockedNode::lock(Arc::clone(node)).await;
        if child_locked.version != version {
            tracing::trace!(target: "forque::chain", "child removal skipped: version moved");
            return Cascade::Done;
        }
        // Drop the child's lock before the structural erase.
    }

    parent_locked.touch();
    let segment = parent_locked
        .segments
        .front_mut()
        .expect("serving segment verified above");
    segment.children.remove(key);
    tracing::trace!(target: "forque::chain", "child chain removed");

    if !segment.is_exhausted() {
        return Cascade::Done;
    }

    // The parent's serving segment emptied with this removal. Every node a
    // child can be removed from has a parent of its own (interior nodes
    // have real parents, the root has the meta root), so the retirement
    // walk always has a lock pair to continue with.
    let grandparent: Arc<ChainNode<T>> = parent_locked
        .node()
        .parent
        .upgrade()
        .expect("a removable child's parent has a parent of its own");
    let parent_node: Arc<ChainNode<T>> = Arc::clone(parent_locked.node());
    drop(parent_locked);

    let grandparent_locked: LockedNode<T> = LockedNode::lock(grandparent).await;
    let parent_relocked: LockedNode<T> = LockedNode::lock(parent_node).await;

    // Re-verify after the relock window: a reserve may have refilled the
    // serving segment (or the node may already be gone).
    let still_exhausted: bool = parent_relocked
        .segments
        .front()
        .is_some_and(super::Segment::is_exhausted);
    if still_exhausted {
        Cascade::Continue {
            parent_locked: grandparent_locked,
            locked: parent_relocked,
        }
    } else {
        Cascade::Done
    }
}
