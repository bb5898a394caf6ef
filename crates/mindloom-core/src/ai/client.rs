//! Model client abstraction and the HTTP implementation.
//!
//! The router talks to model endpoints through [`ModelClient`]; production
//! uses [`HttpModelClient`] over `reqwest` with an explicit per-call
//! timeout, tests inject scripted fakes.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A completion request sent to a model.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    /// User prompt.
    pub prompt: String,
    /// Optional system prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Output token cap.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

impl CompletionRequest {
    /// Request with the defaults the pipeline uses.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            max_tokens: 1024,
            temperature: 0.7,
        }
    }

    /// Attach a system prompt.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Cap the output tokens.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// A model's reply.
#[derive(Debug, Clone, Deserialize)]
pub struct Completion {
    /// Raw text of the reply.
    pub text: String,
    /// Prompt tokens, when the endpoint reports usage.
    #[serde(default)]
    pub input_tokens: Option<u32>,
    /// Completion tokens, when the endpoint reports usage.
    #[serde(default)]
    pub output_tokens: Option<u32>,
}

/// Errors from model calls.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// The call exceeded its timeout and was cancelled.
    #[error("model call timeout after {0:?}")]
    Timeout(Duration),
    /// Connection-level failure.
    #[error("model transport error: {0}")]
    Transport(String),
    /// Non-success HTTP status.
    #[error("model endpoint returned {code}: {message}")]
    Status {
        /// HTTP status code.
        code: u16,
        /// Response body or reason.
        message: String,
    },
    /// The endpoint replied but the body was not usable.
    #[error("invalid model response: {0}")]
    InvalidResponse(String),
    /// The model is not configured.
    #[error("unknown model: {0}")]
    UnknownModel(String),
}

impl ModelError {
    /// Whether the failure is transient (timeouts, connection resets, 5xx,
    /// 429). Transient failures are retried and count against breakers.
    pub fn is_transient(&self) -> bool {
        match self {
            ModelError::Timeout(_) | ModelError::Transport(_) => true,
            ModelError::Status { code, .. } => *code == 429 || *code >= 500,
            ModelError::InvalidResponse(_) | ModelError::UnknownModel(_) => false,
        }
    }
}

/// Client for model completion endpoints.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Call `model` with `request`.
    async fn complete(
        &self,
        model: &str,
        request: &CompletionRequest,
    ) -> Result<Completion, ModelError>;
}

/// Endpoint configuration for one model.
#[derive(Debug, Clone)]
pub struct ModelEndpoint {
    /// Completion URL.
    pub url: String,
    /// Bearer key, read from `MODEL_API_KEY_<NAME>` in deployments.
    pub api_key: String,
    /// Per-call timeout.
    pub timeout: Duration,
}

impl ModelEndpoint {
    /// Build an endpoint with the key read from `MODEL_API_KEY_<NAME>`
    /// (model name uppercased, dashes as underscores). Returns `None` when
    /// the key is not set, so unconfigured models simply stay out of the
    /// client.
    pub fn from_env(model: &str, url: impl Into<String>) -> Option<Self> {
        let var = format!(
            "MODEL_API_KEY_{}",
            model.to_uppercase().replace('-', "_")
        );
        let api_key = std::env::var(&var).ok()?;
        Some(Self {
            url: url.into(),
            api_key,
            timeout: Duration::from_secs(30),
        })
    }
}

/// HTTP client over configured model endpoints.
pub struct HttpModelClient {
    http: reqwest::Client,
    endpoints: HashMap<String, ModelEndpoint>,
}

#[derive(Serialize)]
struct HttpCompletionBody<'a> {
    model: &'a str,
    #[serde(flatten)]
    request: &'a CompletionRequest,
}

impl HttpModelClient {
    /// Build a client over `endpoints`, keyed by model name.
    pub fn new(endpoints: HashMap<String, ModelEndpoint>) -> Result<Self, ModelError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ModelError::Transport(e.to_string()))?;
        Ok(Self { http, endpoints })
    }

    fn endpoint(&self, model: &str) -> Result<&ModelEndpoint, ModelError> {
        self.endpoints
            .get(model)
            .ok_or_else(|| ModelError::UnknownModel(model.to_string()))
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn complete(
        &self,
        model: &str,
        request: &CompletionRequest,
    ) -> Result<Completion, ModelError> {
        let endpoint = self.endpoint(model)?;
        let body = HttpCompletionBody { model, request };

        let send = self
            .http
            .post(&endpoint.url)
            .bearer_auth(&endpoint.api_key)
            .json(&body)
            .send();

        let response = match tokio::time::timeout(endpoint.timeout, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(ModelError::Transport(e.to_string())),
            Err(_) => return Err(ModelError::Timeout(endpoint.timeout)),
        };

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                code: status.as_u16(),
                message,
            });
        }

        response
            .json::<Completion>()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ModelError::Timeout(Duration::from_secs(30)).is_transient());
        assert!(ModelError::Transport("reset".into()).is_transient());
        assert!(ModelError::Status {
            code: 429,
            message: "slow down".into()
        }
        .is_transient());
        assert!(ModelError::Status {
            code: 503,
            message: "".into()
        }
        .is_transient());

        assert!(!ModelError::Status {
            code: 401,
            message: "unauthorized".into()
        }
        .is_transient());
        assert!(!ModelError::InvalidResponse("bad json".into()).is_transient());
    }

    #[test]
    fn unknown_model_rejected() {
        let client = HttpModelClient::new(HashMap::new()).unwrap();
        assert!(matches!(
            client.endpoint("ghost"),
            Err(ModelError::UnknownModel(_))
        ));
    }

    #[test]
    fn endpoint_key_comes_from_the_environment() {
        std::env::set_var("MODEL_API_KEY_GPT_4O_MINI", "sk-test");
        let endpoint =
            ModelEndpoint::from_env("gpt-4o-mini", "https://api.example.com/v1/complete")
                .expect("key is set");
        assert_eq!(endpoint.api_key, "sk-test");
        std::env::remove_var("MODEL_API_KEY_GPT_4O_MINI");

        assert!(ModelEndpoint::from_env("ghost-model", "https://api.example.com").is_none());
    }

    #[tokio::test]
    async fn mocked_client_drives_the_trait() {
        let mut mock = MockModelClient::new();
        mock.expect_complete().returning(|_, _| {
            Ok(Completion {
                text: "mocked".into(),
                input_tokens: Some(1),
                output_tokens: Some(2),
            })
        });

        let completion = mock
            .complete("gpt-4o", &CompletionRequest::new("hi"))
            .await
            .unwrap();
        assert_eq!(completion.text, "mocked");
    }
}
