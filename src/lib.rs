//! # Forque
//!
//! A tag-structured, fully asynchronous work queue with hierarchical
//! mutual exclusion.
//!
//! Work items carry a [`Tag`], an ordered sequence of level values, and
//! the rule is simple: while any item with a given tag *prefix* is in
//! flight, no other item sharing that prefix is delivered. Disjoint
//! prefixes run in parallel; within one prefix, arrival order is preserved.
//!
//! ## Design
//!
//! - A per-prefix tree of mutex-guarded *chain nodes* orders work into
//!   segments (epochs) of siblings and child prefixes, and publishes ready
//!   items downstream.
//! - A [`Runque`] hands ready items to consumers, with pluggable ordering
//!   across prefixes and a collective [`interrupt`](Forque::interrupt).
//! - Everything suspends cooperatively on a purpose-built
//!   [`mutex::Mutex`]; there are no thread blocks, sleeps, or I/O anywhere
//!   in the core, and any executor that polls futures to completion works.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let queue: Forque<String> = Forque::new();
//!
//! // producer
//! let ticket = queue.reserve(&Tag::from((42_u32, "build"))).await;
//! ticket.release("payload".to_string()).await?;
//!
//! // consumer
//! let work = queue.get().await?;
//! process(work.value());
//! work.finalize().await?;
//! ```

pub mod chain;
pub mod forque;
pub mod handle;
pub mod mutex;
pub mod runque;
pub mod tag;

pub use forque::Forque;
pub use handle::{Reservation, Retainment};
pub use runque::{
    FifoBuffer, Interrupted, LifoBuffer, OrderedBuffer, PriorityBuffer, Runque, SyncRunque,
};
pub use tag::{DefaultHashCompare, HashCompare, Tag, TagBuilder, TagError, TagKey, TagView};
