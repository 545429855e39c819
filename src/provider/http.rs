//! JSON-over-HTTP provider.
//!
//! Speaks a small RPC protocol to a remote provider process:
//! `POST {endpoint}/resources/{operation}` with a [`ResourceRequest`] body,
//! answered by a [`ProviderResponse`], and `POST {endpoint}/functions/invoke`
//! for provider functions.

use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::trace;

use crate::error::{ConfigError, ProviderError, Result};

use super::traits::{Operation, Provider, ProviderResponse, ProviderResult, ResourceRequest};

/// Environment variable holding the provider endpoint.
pub const ENDPOINT_ENV: &str = "INFRAGRAPH_PROVIDER_ENDPOINT";

/// Environment variable holding the bearer token.
pub const TOKEN_ENV: &str = "INFRAGRAPH_PROVIDER_TOKEN";

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Header carrying [`ResourceRequest::idempotency_key`].
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Retry-after used when a 429 carries no usable header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Body of a function call.
#[derive(Debug, Serialize)]
struct InvokeRequest<'a> {
    token: &'a str,
    args: &'a Value,
}

/// Provider reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpProvider {
    /// Creates a provider client for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: Option<&str>) -> ProviderResult<Self> {
        Self::with_timeout(endpoint, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a provider client with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(
        endpoint: &str,
        token: Option<&str>,
        timeout_secs: u64,
    ) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.map(ToString::to_string),
        })
    }

    /// Creates a provider client from `INFRAGRAPH_PROVIDER_ENDPOINT` and the
    /// optional `INFRAGRAPH_PROVIDER_TOKEN`.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint variable is missing.
    pub fn from_env() -> Result<Self> {
        let endpoint = std::env::var(ENDPOINT_ENV).map_err(|_| ConfigError::MissingEnvVar {
            name: ENDPOINT_ENV.to_string(),
        })?;
        let token = std::env::var(TOKEN_ENV).ok();
        Ok(Self::new(&endpoint, token.as_deref())?)
    }

    /// The endpoint this client talks to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
        idempotency_key: Option<&str>,
    ) -> ProviderResult<Response> {
        let url = format!("{}/{path}", self.endpoint);
        trace!("POST {url}");

        let mut request = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(body);
        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(key) = idempotency_key {
            request = request.header(IDEMPOTENCY_KEY_HEADER, key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout {
                    operation: path.to_string(),
                }
            } else {
                ProviderError::network(format!("Request failed: {e}"))
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return Err(ProviderError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }

        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> ProviderResult<T> {
        response.json().await.map_err(|e| ProviderError::InvalidResponse {
            message: format!("Failed to parse response: {e}"),
        })
    }

    async fn resource_call(
        &self,
        operation: Operation,
        request: &ResourceRequest,
    ) -> ProviderResult<Response> {
        let path = format!("resources/{operation}");
        self.post(&path, request, request.idempotency_key.as_deref())
            .await
            .map_err(|err| match err {
                ProviderError::NotFound { .. } => ProviderError::NotFound {
                    id: request.id.clone().unwrap_or_else(|| request.name.clone()),
                },
                other => other,
            })
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn create(&self, request: &ResourceRequest) -> ProviderResult<ProviderResponse> {
        let response = self.resource_call(Operation::Create, request).await?;
        Self::decode(response).await
    }

    async fn read(&self, request: &ResourceRequest) -> ProviderResult<ProviderResponse> {
        let response = self.resource_call(Operation::Read, request).await?;
        Self::decode(response).await
    }

    async fn update(&self, request: &ResourceRequest) -> ProviderResult<ProviderResponse> {
        let response = self.resource_call(Operation::Update, request).await?;
        Self::decode(response).await
    }

    async fn delete(&self, request: &ResourceRequest) -> ProviderResult<()> {
        self.resource_call(Operation::Delete, request).await?;
        Ok(())
    }

    async fn invoke(&self, token: &str, args: &Value) -> ProviderResult<Value> {
        let response = self
            .post("functions/invoke", &InvokeRequest { token, args }, None)
            .await?;
        Self::decode(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ResourceRequest {
        let mut properties = Map::new();
        properties.insert(String::from("location"), json!("westeurope"));
        ResourceRequest::new("azure-native:resources:ResourceGroup", "rg", properties)
    }

    #[tokio::test]
    async fn test_create_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources/create"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "/subscriptions/1/resourceGroups/rg1a2b",
                "outputs": { "name": "rg1a2b" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), Some("secret")).unwrap();
        let response = provider.create(&request()).await.unwrap();
        assert_eq!(response.id, "/subscriptions/1/resourceGroups/rg1a2b");
        assert_eq!(response.outputs["name"], json!("rg1a2b"));
    }

    #[tokio::test]
    async fn test_create_sends_idempotency_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources/create"))
            .and(header(IDEMPOTENCY_KEY_HEADER, "rg-7f3a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "/subscriptions/1/resourceGroups/rg7f3a"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), None).unwrap();
        let response = provider
            .create(&request().with_idempotency_key("rg-7f3a"))
            .await
            .unwrap();
        assert_eq!(response.id, "/subscriptions/1/resourceGroups/rg7f3a");
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        Mock::given(path("/resources/create"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&server)
            .await;
        Mock::given(path("/resources/update"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;
        Mock::given(path("/resources/read"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad sku"))
            .mount(&server)
            .await;
        Mock::given(path("/resources/delete"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), None).unwrap();
        let req = request().with_id("/rg");

        assert_eq!(
            provider.create(&req).await.unwrap_err(),
            ProviderError::RateLimited { retry_after_secs: 3 }
        );
        assert!(provider.update(&req).await.unwrap_err().is_transient());
        assert!(matches!(
            provider.read(&req).await.unwrap_err(),
            ProviderError::Rejected { status: 400, .. }
        ));
        assert_eq!(
            provider.delete(&req).await.unwrap_err(),
            ProviderError::NotFound {
                id: String::from("/rg")
            }
        );
    }

    #[tokio::test]
    async fn test_invoke() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/functions/invoke"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "primarySharedKey": "k1" })),
            )
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), None).unwrap();
        let result = provider
            .invoke(
                "azure-native:operationalinsights:getSharedKeys",
                &json!({ "workspaceName": "ws" }),
            )
            .await
            .unwrap();
        assert_eq!(result["primarySharedKey"], json!("k1"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let provider = HttpProvider::with_timeout("http://127.0.0.1:9", None, 2).unwrap();
        let err = provider.create(&request()).await.unwrap_err();
        assert!(err.is_transient());
    }
}
