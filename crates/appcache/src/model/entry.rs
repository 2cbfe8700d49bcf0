use serde::{Deserialize, Serialize};
use url::Url;

use crate::storage::{EntryRecord, StorageKey};

bitflags::bitflags! {
    /// Roles a URL plays in a cache. A URL discovered under several roles
    /// carries the union of them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct EntryFlags: u32 {
        /// Listed in the manifest's `CACHE:` section
        const EXPLICIT = 1 << 0;
        /// Target of a fallback namespace
        const FALLBACK = 1 << 1;
        /// A document that referenced the manifest
        const MASTER = 1 << 2;
        /// The manifest itself
        const MANIFEST = 1 << 3;
        /// Stored, but outside the cache's navigation scope
        const FOREIGN = 1 << 4;
    }
}

impl EntryFlags {
    /// Roles whose download failure fails the whole update.
    pub fn is_mandatory(self) -> bool {
        self.intersects(EntryFlags::EXPLICIT | EntryFlags::FALLBACK)
    }

    pub fn is_master_only(self) -> bool {
        self.contains(EntryFlags::MASTER) && !self.is_mandatory()
    }
}

/// A single cached resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub url: Url,
    pub flags: EntryFlags,
    pub storage_key: StorageKey,
    pub size: u64,
}

impl Entry {
    pub fn new(url: Url, flags: EntryFlags, storage_key: StorageKey, size: u64) -> Self {
        Self {
            url,
            flags,
            storage_key,
            size,
        }
    }

    pub fn is_foreign(&self) -> bool {
        self.flags.contains(EntryFlags::FOREIGN)
    }
}

impl From<EntryRecord> for Entry {
    fn from(record: EntryRecord) -> Self {
        Self {
            url: record.url,
            flags: record.flags,
            storage_key: record.storage_key,
            size: record.size,
        }
    }
}

impl From<&Entry> for EntryRecord {
    fn from(entry: &Entry) -> Self {
        Self {
            url: entry.url.clone(),
            flags: entry.flags,
            storage_key: entry.storage_key.clone(),
            size: entry.size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mandatory_roles() {
        assert!(EntryFlags::EXPLICIT.is_mandatory());
        assert!((EntryFlags::FALLBACK | EntryFlags::MASTER).is_mandatory());
        assert!(!EntryFlags::MASTER.is_mandatory());

        assert!(EntryFlags::MASTER.is_master_only());
        assert!((EntryFlags::MASTER | EntryFlags::FOREIGN).is_master_only());
        assert!(!(EntryFlags::MASTER | EntryFlags::EXPLICIT).is_master_only());
    }

    #[test]
    fn test_flags_serialize() {
        let flags = EntryFlags::EXPLICIT | EntryFlags::MASTER;
        let json = serde_json::to_string(&flags).unwrap();
        let back: EntryFlags = serde_json::from_str(&json).unwrap();
        assert_eq!(back, flags);
    }
}
