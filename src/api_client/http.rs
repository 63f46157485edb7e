//! reqwest-backed chat-completions transport against an
//! OpenAI/OpenRouter-compatible `/chat/completions` endpoint.

use super::{ApiClient, CompletionRequest, TokenUsage};
use crate::error::PipelineError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize, Default)]
struct UsagePayload {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
}

/// Client configuration pooled the way the teacher's `ClientConfig`
/// configures connection and request timeouts.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub request_timeout: Duration,
    /// Sent as `HTTP-Referer`, identifying the client to the upstream
    /// router (required by `spec.md` §6's header contract).
    pub referer: String,
    /// Sent as `X-Title`.
    pub title: String,
}

pub struct HttpApiClient {
    http: Client,
    config: HttpClientConfig,
}

impl HttpApiClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, PipelineError> {
        let http = Client::builder()
            .pool_max_idle_per_host(20)
            .pool_idle_timeout(Duration::from_secs(30))
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| PipelineError::Configuration(format!("failed to build http client: {e}")))?;
        Ok(Self { http, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<(String, TokenUsage), PipelineError> {
        let body = ChatCompletionRequest {
            model: request.model,
            messages: vec![
                ChatMessage { role: "system", content: request.system_prompt },
                ChatMessage { role: "user", content: request.user_prompt },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .header("HTTP-Referer", &self.config.referer)
            .header("X-Title", &self.config.title)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PipelineError::Timeout(self.config.request_timeout.as_millis() as u64)
                } else {
                    PipelineError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(PipelineError::RateLimit {
                message: "upstream API returned 429".to_string(),
                retry_after_secs: retry_after,
            });
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(PipelineError::Authentication(format!("upstream rejected credentials ({status})")));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .ok()
                .and_then(|b| b.error)
                .map(|e| e.message)
                .filter(|m| !m.is_empty())
                .unwrap_or(body);
            return Err(PipelineError::Api { status: status.as_u16(), message });
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Parsing(format!("malformed chat-completions response: {e}")))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| PipelineError::Parsing("chat-completions response had no choices".to_string()))?;

        let usage = body
            .usage
            .map(|u| TokenUsage { input_tokens: u.prompt_tokens, output_tokens: u.completion_tokens })
            .unwrap_or_else(|| {
                warn!("chat-completions response omitted usage, estimating as zero");
                TokenUsage::default()
            });

        Ok((content, usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: String) -> HttpClientConfig {
        HttpClientConfig {
            base_url,
            api_key: "test-key".to_string(),
            request_timeout: Duration::from_secs(5),
            referer: "https://example.test/flashcards".to_string(),
            title: "Flashcard Pipeline Tests".to_string(),
        }
    }

    #[tokio::test]
    async fn sends_header_contract_and_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("HTTP-Referer", "https://example.test/flashcards"))
            .and(header("X-Title", "Flashcard Pipeline Tests"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "1", "model": "m", "object": "chat.completion", "created": 0,
                "choices": [{"message": {"content": "hello"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 3, "completion_tokens": 5, "total_tokens": 8}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpApiClient::new(config(server.uri())).unwrap();
        let (content, usage) = client
            .complete(CompletionRequest {
                model: "model-x",
                system_prompt: "sys",
                user_prompt: "user",
                temperature: 0.4,
                max_tokens: 512,
            })
            .await
            .unwrap();

        assert_eq!(content, "hello");
        assert_eq!(usage.input_tokens, 3);
        assert_eq!(usage.output_tokens, 5);
    }

    #[tokio::test]
    async fn rate_limit_response_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "17"))
            .mount(&server)
            .await;

        let client = HttpApiClient::new(config(server.uri())).unwrap();
        let err = client
            .complete(CompletionRequest {
                model: "model-x",
                system_prompt: "sys",
                user_prompt: "user",
                temperature: 0.4,
                max_tokens: 512,
            })
            .await
            .unwrap_err();

        match err {
            PipelineError::RateLimit { retry_after_secs, .. } => assert_eq!(retry_after_secs, 17),
            other => panic!("expected RateLimit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_maps_to_retryable_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = HttpApiClient::new(config(server.uri())).unwrap();
        let err = client
            .complete(CompletionRequest {
                model: "model-x",
                system_prompt: "sys",
                user_prompt: "user",
                temperature: 0.4,
                max_tokens: 512,
            })
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        match err {
            PipelineError::Api { status, .. } => assert_eq!(status, 500),
            other => panic!("expected Api, got {other:?}"),
        }
    }
}
