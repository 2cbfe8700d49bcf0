//! # Builder for AppCacheConfig
//!
//! Fluent construction of [`AppCacheConfig`] instances.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use appcache_engine::AppCacheConfig;
//!
//! let config = AppCacheConfig::builder()
//!     .with_timeout(Duration::from_secs(60))
//!     .with_user_agent("MyApp/1.0")
//!     .with_fetch_concurrency(4)
//!     .with_group_quota(50 * 1024 * 1024)
//!     .build();
//!
//! assert_eq!(config.update.fetch_concurrency, 4);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::AppCacheConfig;

/// Builder for creating AppCacheConfig instances with a fluent API
#[derive(Debug, Clone)]
pub struct AppCacheConfigBuilder {
    config: AppCacheConfig,
}

impl AppCacheConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: AppCacheConfig::default(),
        }
    }

    /// Set the overall timeout for the entire HTTP request
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.transport.timeout = timeout;
        self
    }

    /// Set the connection timeout (time to establish initial connection)
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.transport.connect_timeout = timeout;
        self
    }

    /// Set the user agent string
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.transport.user_agent = user_agent.into();
        self
    }

    /// Add a custom HTTP header
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.as_ref().parse::<reqwest::header::HeaderName>(),
            HeaderValue::from_str(value.as_ref()),
        ) {
            self.config.transport.headers.insert(name, value);
        }
        self
    }

    /// Set all HTTP headers, replacing any existing headers
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.config.transport.headers = headers;
        self
    }

    /// Set whether to accept invalid certificates
    ///
    /// # Warning
    /// This is unsafe and should only be used for testing or in controlled environments.
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.config.transport.danger_accept_invalid_certs = accept;
        self
    }

    /// Max concurrent resource downloads per update (at least one)
    pub fn with_fetch_concurrency(mut self, concurrency: usize) -> Self {
        self.config.update.fetch_concurrency = concurrency.max(1);
        self
    }

    pub fn with_manifest_mime_check(mut self, required: bool) -> Self {
        self.config.update.require_manifest_mime_type = required;
        self
    }

    /// Configure automatic retries of transient update failures
    pub fn with_retries(mut self, max_retries: u32, delay_base: Duration) -> Self {
        self.config.update.max_update_retries = max_retries;
        self.config.update.retry_delay_base = delay_base;
        self
    }

    /// Persist caches under `path` instead of keeping them in memory
    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage.path = Some(path.into());
        self
    }

    pub fn with_group_quota(mut self, bytes: u64) -> Self {
        self.config.storage.group_quota = Some(bytes);
        self
    }

    /// Build the AppCacheConfig instance
    pub fn build(self) -> AppCacheConfig {
        self.config
    }
}

impl Default for AppCacheConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = AppCacheConfigBuilder::new().build();
        assert_eq!(config.transport.timeout, Duration::from_secs(30));
        assert_eq!(config.transport.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.update.fetch_concurrency, 3);
        assert!(config.update.require_manifest_mime_type);
        assert!(config.storage.path.is_none());
        assert!(!config.transport.danger_accept_invalid_certs);
    }

    #[test]
    fn test_builder_customization() {
        let config = AppCacheConfigBuilder::new()
            .with_timeout(Duration::from_secs(60))
            .with_user_agent("CustomUserAgent/1.0")
            .with_header("X-Custom-Header", "CustomValue")
            .with_fetch_concurrency(0)
            .with_retries(1, Duration::from_millis(10))
            .with_storage_path("/tmp/appcache")
            .build();

        assert_eq!(config.transport.timeout, Duration::from_secs(60));
        assert_eq!(config.transport.user_agent, "CustomUserAgent/1.0");
        assert_eq!(config.update.fetch_concurrency, 1);
        assert_eq!(config.update.max_update_retries, 1);
        assert_eq!(config.storage.path, Some(PathBuf::from("/tmp/appcache")));

        let header_value = config.transport.headers.get("X-Custom-Header").unwrap();
        assert_eq!(header_value.to_str().unwrap(), "CustomValue");
    }
}
