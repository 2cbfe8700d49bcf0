use std::fmt;

use url::Url;

use super::{CacheId, GroupId};

/// Identifies one frontend registered with the service. Host ids are only
/// unique within a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostId(pub i32);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Service-wide host identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostKey {
    pub backend: BackendId,
    pub host: HostId,
}

impl HostKey {
    pub fn new(backend: BackendId, host: HostId) -> Self {
        Self { backend, host }
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.backend.0, self.host.0)
    }
}

/// One client document.
#[derive(Debug, Clone)]
pub struct Host {
    pub key: HostKey,
    /// At most one cache at a time.
    pub associated_cache: Option<CacheId>,
    /// The group this host selected through a manifest, kept alive while the
    /// host exists.
    pub selected_group: Option<GroupId>,
    pub selection_made: bool,
    pub document_url: Option<Url>,
}

impl Host {
    pub fn new(key: HostKey) -> Self {
        Self {
            key,
            associated_cache: None,
            selected_group: None,
            selection_made: false,
            document_url: None,
        }
    }
}
