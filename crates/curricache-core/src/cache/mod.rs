//! Tier 1: the in-page cache.
//!
//! [`EntryCache`] and [`CollectionIndex`] are plain data structures with no
//! I/O. [`CacheCoordinator`] owns them and is the only thing that mutates
//! them.

pub mod collection;
pub mod coordinator;
pub mod digest;
pub mod entry;
pub mod policy;

pub use collection::{CollectionEntry, CollectionIndex};
pub use coordinator::{CacheCoordinator, CacheEvent};
pub use digest::IdentityDigest;
pub use entry::{CacheEntry, EntryCache};
pub use policy::{Policies, StalenessPolicy};
