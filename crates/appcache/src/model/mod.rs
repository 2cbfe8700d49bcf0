//! # Model
//!
//! Entries, caches, groups and hosts, plus the registry that owns them.

mod cache;
mod entry;
mod group;
mod host;
mod registry;

pub use cache::{Cache, CacheId, ResponseLookup};
pub use entry::{Entry, EntryFlags};
pub use group::{Group, GroupId, UpdateStatus};
pub use host::{BackendId, Host, HostId, HostKey};

pub(crate) use registry::Registry;
