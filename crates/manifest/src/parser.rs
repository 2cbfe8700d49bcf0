// Cache manifest parser: turns raw manifest bytes into a `Manifest`.

use std::collections::HashSet;

use tracing::{debug, trace};
use url::Url;

use crate::error::ManifestError;
use crate::manifest::{Manifest, Namespace};

pub const MANIFEST_SIGNATURE: &str = "CACHE MANIFEST";

const BYTE_ORDER_MARK: char = '\u{FEFF}';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Explicit,
    Fallback,
    OnlineWhitelist,
    Unknown,
}

/// Parses a manifest document fetched from `manifest_url`.
///
/// Invalid UTF-8 sequences are replaced rather than rejected. Relative URLs
/// are resolved against `manifest_url` and fragments are dropped. Entries
/// that cannot be resolved, or that use a scheme other than the manifest's,
/// are skipped. Fallback namespaces must share the manifest's origin.
pub fn parse(manifest_url: &Url, data: &[u8]) -> Result<Manifest, ManifestError> {
    if data.is_empty() {
        return Err(ManifestError::Empty);
    }

    let text = String::from_utf8_lossy(data);
    let text = text.strip_prefix(BYTE_ORDER_MARK).unwrap_or(&text);

    let rest = text
        .strip_prefix(MANIFEST_SIGNATURE)
        .ok_or(ManifestError::MissingSignature)?;
    if !rest.is_empty() && !rest.starts_with([' ', '\t', '\r', '\n']) {
        return Err(ManifestError::MissingSignature);
    }

    let mut manifest = Manifest::default();
    let mut seen_explicit = HashSet::new();
    let mut section = Section::Explicit;

    // The remainder of the signature line is ignored.
    for raw_line in rest.split(['\r', '\n']).skip(1) {
        let line = raw_line.trim_matches([' ', '\t']);
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match line {
            "CACHE:" => {
                section = Section::Explicit;
                continue;
            }
            "FALLBACK:" => {
                section = Section::Fallback;
                continue;
            }
            "NETWORK:" => {
                section = Section::OnlineWhitelist;
                continue;
            }
            _ if line.ends_with(':') => {
                trace!(header = line, "Entering unknown manifest section");
                section = Section::Unknown;
                continue;
            }
            _ => {}
        }

        let mut tokens = line.split([' ', '\t']).filter(|t| !t.is_empty());
        let Some(first) = tokens.next() else {
            continue;
        };

        match section {
            Section::Unknown => {}
            Section::Explicit => {
                if let Some(url) = resolve(manifest_url, first) {
                    if url.scheme() != manifest_url.scheme() {
                        debug!(url = %url, "Ignoring explicit entry with foreign scheme");
                        continue;
                    }
                    if seen_explicit.insert(url.clone()) {
                        manifest.explicit_urls.push(url);
                    }
                }
            }
            Section::OnlineWhitelist => {
                if first == "*" {
                    manifest.online_whitelist_all = true;
                    continue;
                }
                if let Some(url) = resolve(manifest_url, first) {
                    if url.scheme() != manifest_url.scheme() {
                        continue;
                    }
                    manifest.online_whitelist_namespaces.push(url);
                }
            }
            Section::Fallback => {
                let Some(second) = tokens.next() else {
                    debug!(line, "Fallback line without a target");
                    continue;
                };
                let (Some(namespace_url), Some(target_url)) =
                    (resolve(manifest_url, first), resolve(manifest_url, second))
                else {
                    continue;
                };
                if namespace_url.origin() != manifest_url.origin()
                    || target_url.origin() != manifest_url.origin()
                {
                    debug!(
                        namespace = %namespace_url,
                        target = %target_url,
                        "Ignoring cross-origin fallback namespace"
                    );
                    continue;
                }
                manifest
                    .fallback_namespaces
                    .push(Namespace::new(namespace_url, target_url));
            }
        }
    }

    debug!(
        manifest_url = %manifest_url,
        explicit = manifest.explicit_urls.len(),
        fallback = manifest.fallback_namespaces.len(),
        network = manifest.online_whitelist_namespaces.len(),
        "Parsed cache manifest"
    );

    Ok(manifest)
}

fn resolve(base: &Url, token: &str) -> Option<Url> {
    let mut url = base.join(token).ok()?;
    url.set_fragment(None);
    Some(url)
}
