//! Data models for the learning dashboard.
//!
//! - `EntityKey`, `OwnerKey`: identities used as cache keys
//! - `Curriculum`, `Resource`: the cached entity and its reading list
//! - `CurriculumPatch`: write payload sent to the backend
//! - `DashboardAggregate`: per-owner summary numbers

pub mod curriculum;
pub mod keys;

pub use curriculum::{
    CacheRecord, Curriculum, CurriculumPatch, DashboardAggregate, RecordIdentity, Resource,
    ResourceKind,
};
pub use keys::{EntityKey, OwnerKey};
