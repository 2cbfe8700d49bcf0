use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

const DEFAULT_USER_AGENT: &str = concat!("appcache-engine/", env!("CARGO_PKG_VERSION"));

/// Media type a manifest response must carry when
/// [`UpdateConfig::require_manifest_mime_type`] is set.
pub const MANIFEST_MIME_TYPE: &str = "text/cache-manifest";

/// Top-level configuration for an [`AppCacheService`](crate::AppCacheService)
#[derive(Debug, Clone, Default)]
pub struct AppCacheConfig {
    pub transport: TransportConfig,
    pub update: UpdateConfig,
    pub storage: StorageConfig,
}

impl AppCacheConfig {
    pub fn builder() -> crate::builder::AppCacheConfigBuilder {
        crate::builder::AppCacheConfigBuilder::new()
    }
}

// --- Transport Configuration ---
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Overall timeout for the entire HTTP request
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// User agent string
    pub user_agent: String,

    /// Custom HTTP headers for requests
    pub headers: HeaderMap,

    pub danger_accept_invalid_certs: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: TransportConfig::get_default_headers(),
            danger_accept_invalid_certs: false,
        }
    }
}

impl TransportConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers
    }
}

// --- Update Configuration ---
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    /// Max concurrent resource downloads per update job
    pub fetch_concurrency: usize,
    /// Reject manifests not served as `text/cache-manifest`
    pub require_manifest_mime_type: bool,
    /// Automatic re-runs after a transient failure
    pub max_update_retries: u32,
    pub retry_delay_base: Duration, // Base for exponential backoff
    pub retry_delay_max: Duration,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            fetch_concurrency: 3,
            require_manifest_mime_type: true,
            max_update_retries: 3,
            retry_delay_base: Duration::from_millis(500),
            retry_delay_max: Duration::from_secs(30),
        }
    }
}

impl UpdateConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_delay_base
            .saturating_mul(factor)
            .min(self.retry_delay_max)
    }
}

// --- Storage Configuration ---
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// Directory for disk storage; in-memory storage when `None`
    pub path: Option<PathBuf>,
    /// Maximum bytes a single group's newest cache may occupy
    pub group_quota: Option<u64>,
}
