use async_trait::async_trait;
use reqwest::header::{
    CONTENT_TYPE, ETAG, HeaderMap, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, LOCATION,
};
use reqwest::{Client, redirect};
use tracing::{debug, trace};

use super::{FetchRequest, FetchResponse, Transport};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::storage::ResponseMetadata;

/// Create a reqwest client for the engine. Redirects are never followed.
pub fn create_client(config: &TransportConfig) -> Result<Client, TransportError> {
    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(5)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .redirect(redirect::Policy::none())
        .danger_accept_invalid_certs(config.danger_accept_invalid_certs);

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    client_builder.build().map_err(TransportError::from)
}

/// [`Transport`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        Ok(Self {
            client: create_client(config)?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError> {
        let mut builder = self.client.get(request.url.clone());
        if let Some(validators) = &request.validators {
            if let Some(etag) = &validators.etag {
                builder = builder.header(IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = &validators.last_modified {
                builder = builder.header(IF_MODIFIED_SINCE, last_modified);
            }
        }

        trace!(url = %request.url, conditional = request.is_conditional(), "Sending request");
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        debug!(url = %request.url, status, size = body.len(), "Received response");

        let metadata = ResponseMetadata::new(body.len() as u64)
            .with_etag_option(header_string(&headers, ETAG))
            .with_last_modified_option(header_string(&headers, LAST_MODIFIED))
            .with_content_type_option(header_string(&headers, CONTENT_TYPE))
            .with_location_option(header_string(&headers, LOCATION));

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
    use std::time::Duration;

    #[test]
    fn test_create_client_with_config() {
        let config = TransportConfig {
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(create_client(&config).is_ok());
    }

    #[test]
    fn test_header_string_skips_invalid_values() {
        let mut headers = HeaderMap::new();
        headers.insert(ETAG, "\"abc\"".parse().unwrap());
        headers.insert(
            LOCATION,
            reqwest::header::HeaderValue::from_bytes(b"\xff").unwrap(),
        );

        assert_eq!(header_string(&headers, ETAG).as_deref(), Some("\"abc\""));
        assert_eq!(header_string(&headers, LOCATION), None);
        assert_eq!(header_string(&headers, CONTENT_TYPE), None);
    }
}
