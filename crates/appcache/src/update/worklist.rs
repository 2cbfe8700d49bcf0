use std::collections::HashMap;

use cache_manifest::Manifest;
use url::Url;

use crate::model::{Cache, EntryFlags};

/// URLs an update must fetch, each once, with the union of its roles.
#[derive(Debug, Default, Clone)]
pub(crate) struct WorkList {
    order: Vec<Url>,
    flags: HashMap<Url, EntryFlags>,
    /// Roles the manifest URL itself picked up; it is never fetched as a
    /// resource.
    manifest_flags: EntryFlags,
}

impl WorkList {
    /// Merge the roles from every source:
    ///
    /// 1. explicit entries
    /// 2. fallback namespace targets
    /// 3. master entries of the current newest cache (upgrades only)
    /// 4. pending master entries
    pub(crate) fn build<'a>(
        manifest_url: &Url,
        manifest: &Manifest,
        newest: Option<&Cache>,
        pending_masters: impl IntoIterator<Item = &'a Url>,
    ) -> Self {
        let mut list = Self::default();
        for url in &manifest.explicit_urls {
            list.add(manifest_url, url.clone(), EntryFlags::EXPLICIT);
        }
        for url in manifest.fallback_targets() {
            list.add(manifest_url, url.clone(), EntryFlags::FALLBACK);
        }
        if let Some(newest) = newest {
            let mut carried: Vec<&Url> = newest
                .entries()
                .filter(|entry| entry.flags.contains(EntryFlags::MASTER))
                .map(|entry| &entry.url)
                .collect();
            carried.sort();
            for url in carried {
                list.add(manifest_url, url.clone(), EntryFlags::MASTER);
            }
        }
        for url in pending_masters {
            list.add(manifest_url, url.clone(), EntryFlags::MASTER);
        }
        list
    }

    /// Returns `true` if the URL was not yet in the list.
    pub(crate) fn add(&mut self, manifest_url: &Url, url: Url, flags: EntryFlags) -> bool {
        if &url == manifest_url {
            self.manifest_flags |= flags;
            return false;
        }
        match self.flags.get_mut(&url) {
            Some(existing) => {
                *existing |= flags;
                false
            }
            None => {
                self.flags.insert(url.clone(), flags);
                self.order.push(url);
                true
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn flags(&self, url: &Url) -> Option<EntryFlags> {
        self.flags.get(url).copied()
    }

    pub(crate) fn manifest_flags(&self) -> EntryFlags {
        self.manifest_flags
    }

    pub(crate) fn urls(&self) -> impl Iterator<Item = &Url> {
        self.order.iter()
    }
}
