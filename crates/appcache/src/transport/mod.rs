//! # Transport
//!
//! The network side of the engine. Every fetch is a plain GET with
//! redirects disabled: a redirect comes back as a 3xx response, which the
//! update job treats as a failure.

mod http;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

pub use http::{HttpTransport, create_client};
#[cfg(any(test, feature = "mock"))]
pub use mock::{MockResponse, MockTransport};

use crate::error::TransportError;
use crate::storage::ResponseMetadata;

/// Conditional request validators taken from a previous response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    /// Validators of a stored response, if it carried any.
    pub fn from_metadata(metadata: &ResponseMetadata) -> Option<Self> {
        let validators = Self {
            etag: metadata.etag.clone(),
            last_modified: metadata.last_modified.clone(),
        };
        (!validators.is_empty()).then_some(validators)
    }

    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: Url,
    pub validators: Option<Validators>,
}

impl FetchRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            validators: None,
        }
    }

    pub fn with_validators(mut self, validators: Option<Validators>) -> Self {
        self.validators = validators;
        self
    }

    pub fn is_conditional(&self) -> bool {
        self.validators.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub metadata: ResponseMetadata,
    pub body: Bytes,
}

impl FetchResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }

    /// 404 and 410 mean the resource is gone rather than broken.
    pub fn is_gone(&self) -> bool {
        matches!(self.status, 404 | 410)
    }
}

/// Network collaborator used by the update job.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a GET for `request.url` without following redirects.
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError>;
}
