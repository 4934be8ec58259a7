//! Value deposit and promotion.

use std::sync::Arc;

use super::{LockedNode, publish_all};
use crate::handle::{ItemRef, Retainment};
use crate::runque::Interrupted;

/// Deposit the value for a reserved slot.
///
/// If the slot is the head sibling of the node's active serving segment the
/// retainment is published right away; otherwise the value waits to be
/// promoted by the preceding sibling's finalize or by the activation
/// cascade.
///
/// # Errors
///
/// [`Interrupted`] if the publication reaches an interrupted runque.
///
/// # Panics
///
/// Panics if the slot's segment is gone. An unreleased sibling pins its
/// segment, so this is unreachable while the ticket contract holds.
pub(crate) async fn release<T: Send + Sync + 'static>(
    item: ItemRef<T>,
    value: T,
) -> Result<(), Interrupted> {
    let published: Option<Retainment<T>> = {
        let locked: LockedNode<T> = LockedNode::lock(Arc::clone(&item.node)).await;

        let active: bool = locked.active;
        let serving_id: Option<u64> = locked.segments.front().map(|segment| segment.id);
        let segment = locked
            .segments
            .iter()
            .find(|segment| segment.id == item.segment)
            .expect("release into a retired segment");

        item.slot.store(value);

        let eligible: bool = active
            && serving_id == Some(item.segment)
            && segment
                .siblings
                .front()
                .is_some_and(|head| Arc::ptr_eq(head, &item.slot));

        eligible.then(|| Retainment::new(item.clone()))
    };

    match published {
        Some(retainment) => publish_all(vec![retainment]).await,
        None => Ok(()),
    }
}
