//! HTTP provider plugin client.
//!
//! A plugin is any HTTP service answering `POST {endpoint}/v1/apply` with the
//! request below and a `{ physical_id, outputs }` body. Status codes map onto
//! [`ProviderError`] so the executor can decide what to retry:
//! - 429 is rate limiting, honouring `Retry-After`
//! - 5xx and network failures are transient
//! - other 4xx are rejections, except 404 on delete which means already gone

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::ProviderError;
use crate::graph::Outputs;
use crate::planner::OperationKind;

use super::{Provider, ProviderRequest};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Delay used when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 1;

/// Provider plugin reachable over HTTP.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

/// Wire format of an apply request.
#[derive(Debug, Serialize)]
struct ApplyBody<'a> {
    operation: OperationKind,
    #[serde(rename = "type")]
    resource_type: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    physical_id: Option<&'a str>,
    properties: &'a BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous: Option<&'a BTreeMap<String, Value>>,
}

/// Wire format of an apply response.
#[derive(Debug, Deserialize)]
struct ApplyResponse {
    physical_id: String,
    #[serde(default)]
    outputs: BTreeMap<String, Value>,
}

/// Wire format of an error body.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(alias = "message")]
    error: String,
}

impl HttpProvider {
    /// Creates a client for the plugin at `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str) -> Result<Self, ProviderError> {
        Self::with_timeout(endpoint, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a client with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(endpoint: &str, timeout_secs: u64) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Sends a bearer token with every request.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Returns the plugin endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn error_message(response: reqwest::Response) -> String {
        let body = response.text().await.unwrap_or_default();
        serde_json::from_str::<ErrorBody>(&body).map_or(body, |e| e.error)
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn apply(&self, request: &ProviderRequest) -> Result<Outputs, ProviderError> {
        let url = format!("{}/v1/apply", self.endpoint);
        let body = ApplyBody {
            operation: request.operation,
            resource_type: &request.id.resource_type,
            name: &request.id.name,
            physical_id: request.physical_id.as_deref(),
            properties: &request.properties,
            previous: request.previous.as_ref(),
        };

        trace!("POST {url} for {} {}", request.operation, request.id);

        let mut builder = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&body);
        if let Some(token) = &self.token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::network(format!("Request to {url} failed: {e}")))?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return Err(ProviderError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if status == StatusCode::NOT_FOUND && request.operation == OperationKind::Delete {
            let physical_id = request.physical_id.clone().unwrap_or_default();
            debug!("{} already gone ({physical_id})", request.id);
            return Ok(Outputs::new(physical_id));
        }

        if status.is_server_error() {
            let message = Self::error_message(response).await;
            return Err(ProviderError::unavailable(format!("{status}: {message}")));
        }

        if !status.is_success() {
            let message = Self::error_message(response).await;
            return Err(ProviderError::rejected(status.as_u16(), message));
        }

        let parsed: ApplyResponse = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse {
                message: format!("Failed to parse response: {e}"),
            }
        })?;

        if parsed.physical_id.is_empty() && request.operation != OperationKind::Delete {
            return Err(ProviderError::InvalidResponse {
                message: String::from("response has an empty physical_id"),
            });
        }

        Ok(Outputs {
            physical_id: parsed.physical_id,
            attributes: parsed.outputs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceId;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header as header_matcher, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_request() -> ProviderRequest {
        ProviderRequest::create(
            ResourceId::new("todo-table", "aws:dynamodb:Table"),
            serde_json::from_value(json!({"hashKey": "id"})).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_successful_create() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/apply"))
            .and(body_partial_json(json!({
                "operation": "create",
                "type": "aws:dynamodb:Table",
                "name": "todo-table",
                "properties": {"hashKey": "id"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "physical_id": "todo-table-abc",
                "outputs": {"name": "todo-table-abc", "arn": "arn:aws:dynamodb:::table/todo"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri()).unwrap();
        let outputs = provider.apply(&create_request()).await.unwrap();
        assert_eq!(outputs.physical_id, "todo-table-abc");
        assert_eq!(outputs.get("name"), Some(json!("todo-table-abc")));
    }

    #[tokio::test]
    async fn test_bearer_token_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header_matcher("authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"physical_id": "x"})))
            .expect(1)
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri()).unwrap().with_token("s3cret");
        assert!(provider.apply(&create_request()).await.is_ok());
    }

    #[tokio::test]
    async fn test_rate_limit_maps_to_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri()).unwrap();
        let err = provider.apply(&create_request()).await.unwrap_err();
        assert_eq!(err, ProviderError::RateLimited { retry_after_secs: 7 });
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri()).unwrap();
        let err = provider.apply(&create_request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_client_error_is_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"error": "hashKey is required"})),
            )
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri()).unwrap();
        let err = provider.apply(&create_request()).await.unwrap_err();
        assert_eq!(err, ProviderError::rejected(400, "hashKey is required"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_delete_of_missing_resource_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"operation": "delete", "physical_id": "gone-1"})))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri()).unwrap();
        let request = ProviderRequest::delete(
            ResourceId::new("t", "aws:dynamodb:Table"),
            String::from("gone-1"),
            BTreeMap::new(),
        );
        let outputs = provider.apply(&request).await.unwrap();
        assert_eq!(outputs.physical_id, "gone-1");
    }

    #[tokio::test]
    async fn test_malformed_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri()).unwrap();
        let err = provider.apply(&create_request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        let provider = HttpProvider::with_timeout("http://127.0.0.1:9", 2).unwrap();
        let err = provider.apply(&create_request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Network { .. }));
    }
}
