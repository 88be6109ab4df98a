//! JSON over HTTP provider.
//!
//! Every operation is a `POST` to `{endpoint}/resources/{type}/{operation}`
//! with the request as the JSON body. Transport failures, 5xx and 429
//! responses are retried; 404 means the resource does not exist.
//!
//! A create is only repeated when the first attempt cannot have reached the
//! service (connection failures and 429). Anything else is returned so the
//! pending record left by the executor is resolved by recovery instead of
//! risking a duplicate.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::ProviderError;
use crate::graph::AttributeMap;

use super::{ApplyRequest, DestroyRequest, Lookup, Provider, ProviderResult, ReadRequest};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum number of attempts for transient failures.
const MAX_RETRIES: u32 = 3;

/// Delay between retries in milliseconds.
const RETRY_DELAY_MS: u64 = 500;

/// Provider backed by an HTTP service.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: Client,
    endpoint: String,
    retry_delay: Duration,
}

/// Outcome of a single request that did not fail outright.
enum Response<T> {
    Body(T),
    NotFound,
    NotImplemented,
}

/// Which failures a request may be repeated after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    /// Any transient failure; repeating the request is harmless.
    Transient,
    /// Only failures where the service never processed the request.
    Unprocessed,
}

/// A failed attempt and whether the service may have acted on it.
struct Failure {
    error: ProviderError,
    processed: bool,
}

impl Failure {
    const fn processed(error: ProviderError) -> Self {
        Self {
            error,
            processed: true,
        }
    }
}

impl HttpProvider {
    /// Creates a provider for the given base URL.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, timeout_secs: Option<u64>) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(
                timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
            ))
            .build()
            .map_err(|e| ProviderError::transport(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        })
    }

    /// Sets the base delay between retries.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Base URL of the provider service.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, resource_type: &str, operation: &str) -> String {
        format!("{}/resources/{resource_type}/{operation}", self.endpoint)
    }

    /// Posts a request, retrying transient failures allowed by `retry`.
    async fn post<B, T>(&self, url: &str, body: &B, retry: Retry) -> ProviderResult<Response<T>>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                debug!("Retry attempt {attempt} of {MAX_RETRIES} for {url}");
                tokio::time::sleep(self.retry_delay * attempt).await;
            }

            match self.post_once(url, body).await {
                Ok(response) => return Ok(response),
                Err(Failure {
                    error: e @ ProviderError::Transport { .. },
                    processed,
                }) if retry == Retry::Transient || !processed => last_error = Some(e),
                Err(failure) => return Err(failure.error),
            }
        }

        Err(last_error.unwrap_or_else(|| ProviderError::transport("Max retries exceeded")))
    }

    async fn post_once<B, T>(&self, url: &str, body: &B) -> Result<Response<T>, Failure>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        trace!("POST {url}");

        let response = self
            .client
            .post(url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| Failure {
                processed: !e.is_connect(),
                error: ProviderError::transport(format!("Request failed: {e}")),
            })?;

        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(Response::NotFound);
        }
        if status == StatusCode::NOT_IMPLEMENTED {
            return Ok(Response::NotImplemented);
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(Failure {
                processed: status != StatusCode::TOO_MANY_REQUESTS,
                error: ProviderError::transport(format!("HTTP {}: {body}", status.as_u16())),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Failure::processed(ProviderError::rejected(format!(
                "HTTP {}: {body}",
                status.as_u16()
            ))));
        }

        let text = response.text().await.map_err(|e| {
            Failure::processed(ProviderError::transport(format!(
                "Failed to read response: {e}"
            )))
        })?;
        let text = if text.trim().is_empty() { "null" } else { text.as_str() };

        serde_json::from_str(text).map(Response::Body).map_err(|e| {
            Failure::processed(ProviderError::rejected(format!(
                "Failed to parse response: {e}"
            )))
        })
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn apply(&self, request: ApplyRequest) -> ProviderResult<AttributeMap> {
        let url = self.url(&request.resource_type, "apply");
        let retry = if request.prior.is_some() {
            Retry::Transient
        } else {
            Retry::Unprocessed
        };
        match self.post(&url, &request, retry).await? {
            Response::Body(attributes) => Ok(attributes),
            Response::NotFound => Err(ProviderError::NotFound {
                resource: request.id.to_string(),
            }),
            Response::NotImplemented => Err(ProviderError::Unsupported {
                resource_type: request.resource_type,
            }),
        }
    }

    async fn destroy(&self, request: DestroyRequest) -> ProviderResult<()> {
        let url = self.url(&request.resource_type, "destroy");
        match self
            .post::<_, serde_json::Value>(&url, &request, Retry::Transient)
            .await?
        {
            Response::Body(_) => Ok(()),
            Response::NotFound => Err(ProviderError::NotFound {
                resource: request.id.to_string(),
            }),
            Response::NotImplemented => Err(ProviderError::Unsupported {
                resource_type: request.resource_type,
            }),
        }
    }

    async fn lookup(&self, request: ReadRequest) -> ProviderResult<Lookup> {
        let url = self.url(&request.resource_type, "lookup");
        match self.post(&url, &request, Retry::Transient).await? {
            Response::Body(attributes) => Ok(Lookup::Found(attributes)),
            Response::NotFound => Ok(Lookup::Absent),
            Response::NotImplemented => Ok(Lookup::Unknown),
        }
    }

    async fn read(&self, request: ReadRequest) -> ProviderResult<Option<AttributeMap>> {
        let url = self.url(&request.resource_type, "read");
        match self.post(&url, &request, Retry::Transient).await? {
            Response::Body(attributes) => Ok(Some(attributes)),
            Response::NotFound => Ok(None),
            Response::NotImplemented => Ok(Some(request.attributes)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceId;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> HttpProvider {
        HttpProvider::new(&server.uri(), Some(5))
            .unwrap()
            .with_retry_delay(Duration::from_millis(1))
    }

    fn apply_request() -> ApplyRequest {
        ApplyRequest {
            id: ResourceId::root("network", "main"),
            resource_type: String::from("network"),
            desired: AttributeMap::from([(String::from("cidr"), json!("10.0.0.0/16"))]),
            prior: None,
        }
    }

    fn read_request() -> ReadRequest {
        ReadRequest {
            id: ResourceId::root("network", "main"),
            resource_type: String::from("network"),
            attributes: AttributeMap::from([(String::from("id"), json!("net-1"))]),
        }
    }

    #[tokio::test]
    async fn test_apply_returns_attributes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources/network/apply"))
            .and(body_partial_json(json!({"id": "network.main", "desired": {"cidr": "10.0.0.0/16"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "net-1", "cidr": "10.0.0.0/16"})))
            .expect(1)
            .mount(&server)
            .await;

        let attributes = provider(&server).apply(apply_request()).await.unwrap();
        assert_eq!(attributes.get("id"), Some(&json!("net-1")));
    }

    #[tokio::test]
    async fn test_update_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources/network/apply"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/resources/network/apply"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "net-1"})))
            .mount(&server)
            .await;

        let mut update = apply_request();
        update.prior = Some(AttributeMap::from([(String::from("id"), json!("net-1"))]));
        let attributes = provider(&server).apply(update).await.unwrap();
        assert_eq!(attributes.get("id"), Some(&json!("net-1")));
    }

    #[tokio::test]
    async fn test_create_not_repeated_after_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources/network/apply"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/resources/network/apply"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "net-2"})))
            .expect(0)
            .mount(&server)
            .await;

        let err = provider(&server).apply(apply_request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Transport { .. }));
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_retried_after_throttling() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources/network/apply"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/resources/network/apply"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "net-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let attributes = provider(&server).apply(apply_request()).await.unwrap();
        assert_eq!(attributes.get("id"), Some(&json!("net-1")));
    }

    #[tokio::test]
    async fn test_apply_rejection_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources/network/apply"))
            .respond_with(ResponseTemplate::new(422).set_body_string("cidr overlaps"))
            .expect(1)
            .mount(&server)
            .await;

        let err = provider(&server).apply(apply_request()).await.unwrap_err();
        assert_eq!(err, ProviderError::rejected("HTTP 422: cidr overlaps"));
    }

    #[tokio::test]
    async fn test_persistent_server_error_is_transport_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(u64::from(MAX_RETRIES))
            .mount(&server)
            .await;

        let err = provider(&server).read(read_request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_destroy_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources/network/destroy"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let request = DestroyRequest {
            id: ResourceId::root("network", "main"),
            resource_type: String::from("network"),
            attributes: AttributeMap::new(),
        };
        let err = provider(&server).destroy(request).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_lookup_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources/network/lookup"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/resources/subnet/lookup"))
            .respond_with(ResponseTemplate::new(501))
            .mount(&server)
            .await;

        let provider = provider(&server);
        assert_eq!(provider.lookup(read_request()).await.unwrap(), Lookup::Absent);

        let mut request = read_request();
        request.resource_type = String::from("subnet");
        assert_eq!(provider.lookup(request).await.unwrap(), Lookup::Unknown);
    }

    #[tokio::test]
    async fn test_read_returns_current_attributes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources/network/read"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "net-1", "cidr": "10.9.0.0/16"})))
            .mount(&server)
            .await;

        let attributes = provider(&server).read(read_request()).await.unwrap().unwrap();
        assert_eq!(attributes.get("cidr"), Some(&json!("10.9.0.0/16")));
    }
}
