use serde::{Deserialize, Serialize};
use url::Url;

/// A fallback namespace: requests whose URL starts with `namespace_url`
/// are answered with `target_url` when the network is unavailable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub namespace_url: Url,
    pub target_url: Url,
}

impl Namespace {
    pub fn new(namespace_url: Url, target_url: Url) -> Self {
        Self {
            namespace_url,
            target_url,
        }
    }

    /// Prefix match against the namespace URL.
    pub fn is_match(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.namespace_url.as_str())
    }
}

/// Parsed, immutable description of what one cache version should contain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Explicit entries in document order, without duplicates.
    pub explicit_urls: Vec<Url>,
    pub fallback_namespaces: Vec<Namespace>,
    pub online_whitelist_namespaces: Vec<Url>,
    /// Set by a `*` line in the `NETWORK:` section.
    pub online_whitelist_all: bool,
}

impl Manifest {
    /// Target URLs of every fallback namespace, in declaration order.
    pub fn fallback_targets(&self) -> impl Iterator<Item = &Url> {
        self.fallback_namespaces.iter().map(|ns| &ns.target_url)
    }

    pub fn is_empty(&self) -> bool {
        self.explicit_urls.is_empty()
            && self.fallback_namespaces.is_empty()
            && self.online_whitelist_namespaces.is_empty()
            && !self.online_whitelist_all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_prefix_match() {
        let ns = Namespace::new(
            Url::parse("http://example.com/docs/").unwrap(),
            Url::parse("http://example.com/offline.html").unwrap(),
        );

        assert!(ns.is_match(&Url::parse("http://example.com/docs/a/b.html").unwrap()));
        assert!(ns.is_match(&Url::parse("http://example.com/docs/").unwrap()));
        assert!(!ns.is_match(&Url::parse("http://example.com/doc").unwrap()));
        assert!(!ns.is_match(&Url::parse("http://other.com/docs/x").unwrap()));
    }
}
