//! Scripted in-memory transport for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use url::Url;

use super::{FetchRequest, FetchResponse, Transport};
use crate::config::MANIFEST_MIME_TYPE;
use crate::error::TransportError;
use crate::storage::ResponseMetadata;

/// One scripted reply.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    /// Reply with a connection error instead of a response.
    pub network_error: bool,
}

impl MockResponse {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            content_type: None,
            etag: None,
            network_error: false,
        }
    }

    /// A 200 response served as `text/cache-manifest`.
    pub fn manifest(body: impl Into<Bytes>) -> Self {
        Self::ok(body).with_content_type(MANIFEST_MIME_TYPE)
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            ..Self::ok(Bytes::new())
        }
    }

    pub fn network_error() -> Self {
        Self {
            network_error: true,
            ..Self::status(0)
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Requests carrying a matching `If-None-Match` get a 304.
    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }
}

/// [`Transport`] answering from per-URL scripts.
///
/// Each URL has a queue of replies; replies are consumed in order and the
/// last one repeats. Unscripted URLs answer 404. A held URL blocks its
/// requests until released.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<Url, VecDeque<MockResponse>>>,
    requests: Mutex<Vec<FetchRequest>>,
    gates: Mutex<HashMap<Url, Arc<Semaphore>>>,
    latency: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: AtomicUsize,
}

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every reply by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Append a reply to the URL's script.
    pub fn respond(&self, url: &Url, response: MockResponse) {
        self.routes
            .lock()
            .entry(url.clone())
            .or_default()
            .push_back(response);
    }

    /// Replace the URL's script with a single reply.
    pub fn set(&self, url: &Url, response: MockResponse) {
        self.routes
            .lock()
            .insert(url.clone(), VecDeque::from([response]));
    }

    /// Block requests for `url` until [`release`](Self::release).
    pub fn hold(&self, url: &Url) {
        self.gates
            .lock()
            .insert(url.clone(), Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, url: &Url) {
        if let Some(gate) = self.gates.lock().remove(url) {
            gate.close();
        }
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self, url: &Url) -> usize {
        self.requests.lock().iter().filter(|r| &r.url == url).count()
    }

    /// Highest number of requests that were in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_response(&self, url: &Url) -> Option<MockResponse> {
        let mut routes = self.routes.lock();
        let script = routes.get_mut(url)?;
        if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError> {
        self.requests.lock().push(request.clone());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard(self.in_flight.clone());

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let gate = self.gates.lock().get(&request.url).cloned();
        if let Some(gate) = gate {
            // Closed on release.
            let _ = gate.acquire().await;
        }

        let Some(response) = self.next_response(&request.url) else {
            return Ok(FetchResponse {
                status: 404,
                metadata: ResponseMetadata::new(0),
                body: Bytes::new(),
            });
        };
        if response.network_error {
            return Err(TransportError::Connection(request.url.to_string()));
        }

        let not_modified = match (&response.etag, &request.validators) {
            (Some(etag), Some(validators)) => validators.etag.as_ref() == Some(etag),
            _ => false,
        };
        let (status, body) = if not_modified {
            (304, Bytes::new())
        } else {
            (response.status, response.body)
        };

        let metadata = ResponseMetadata::new(body.len() as u64)
            .with_content_type_option(response.content_type)
            .with_etag_option(response.etag);
        Ok(FetchResponse {
            status,
            metadata,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Validators;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_script_order_and_sticky_last() {
        let transport = MockTransport::new();
        let target = url("http://example.com/a.js");
        transport.respond(&target, MockResponse::status(503));
        transport.respond(&target, MockResponse::ok("ok"));

        let statuses: Vec<u16> = futures::future::join_all(
            (0..3).map(|_| transport.fetch(FetchRequest::new(target.clone()))),
        )
        .await
        .into_iter()
        .map(|r| r.unwrap().status)
        .collect();
        assert_eq!(statuses, vec![503, 200, 200]);
        assert_eq!(transport.request_count(&target), 3);

        let missing = transport
            .fetch(FetchRequest::new(url("http://example.com/missing")))
            .await
            .unwrap();
        assert_eq!(missing.status, 404);
    }

    #[tokio::test]
    async fn test_conditional_request_gets_not_modified() {
        let transport = MockTransport::new();
        let target = url("http://example.com/app.appcache");
        transport.set(&target, MockResponse::manifest("CACHE MANIFEST\n").with_etag("\"v1\""));

        let request = FetchRequest::new(target.clone()).with_validators(Some(Validators {
            etag: Some("\"v1\"".to_string()),
            last_modified: None,
        }));
        let response = transport.fetch(request).await.unwrap();
        assert_eq!(response.status, 304);
        assert!(response.body.is_empty());
    }

    #[tokio::test]
    async fn test_hold_and_release() {
        let transport = Arc::new(MockTransport::new());
        let target = url("http://example.com/slow");
        transport.set(&target, MockResponse::ok("done"));
        transport.hold(&target);

        let pending = {
            let transport = transport.clone();
            let target = target.clone();
            tokio::spawn(async move { transport.fetch(FetchRequest::new(target)).await })
        };
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        transport.release(&target);
        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.body, Bytes::from_static(b"done"));
    }

    #[tokio::test]
    async fn test_network_error() {
        let transport = MockTransport::new();
        let target = url("http://example.com/down");
        transport.set(&target, MockResponse::network_error());
        assert!(matches!(
            transport.fetch(FetchRequest::new(target)).await,
            Err(TransportError::Connection(_))
        ));
    }
}
