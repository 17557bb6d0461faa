//! Generation module for Forma — debrief text generation
//!
//! Provides a `GenerationBackend` trait with a Gemini implementation that
//! calls `generateContent` with a system instruction, a user prompt, and a
//! JSON response mime type. The backend is an untyped external boundary:
//! it either returns text or fails, and failures are classified by
//! signature (`classify_failure`) so callers can tell retryable rate
//! limiting apart from everything else.
//!
//! Transport errors and 5xx responses are retried with backoff; 4xx —
//! including 429 — are surfaced immediately so classification sees them.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

// ============================================================================
// GenerationBackend trait
// ============================================================================

/// One generation call: prompt text in, raw model text out.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system_text: String,
    pub user_text: String,
}

#[derive(Debug, Clone)]
pub struct GenerationResponse {
    pub text: String,
}

/// Abstraction over text-generation providers.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, GenerationError>;

    /// Model identifier recorded in debrief metadata.
    fn model(&self) -> &str;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Error types + classifier
// ============================================================================

/// Generation call errors
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Missing API key")]
    MissingApiKey,

    #[error("Missing generation model identifier")]
    MissingModel,

    #[error("Response contained no candidate text")]
    EmptyResponse,
}

/// Signature-based classification of a failed generation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Gateway rate limit — retryable by the caller after backoff.
    RateLimited,
    /// Anything else — rethrown unchanged.
    Unclassified,
}

/// Classify a generation failure. Rate limiting is detected by HTTP 429 or
/// by known gateway phrasings in the message body; malformed output is not
/// a concern here — it is detected downstream at parse time.
pub fn classify_failure(err: &GenerationError) -> FailureClass {
    match err {
        GenerationError::Api { code: 429, .. } => FailureClass::RateLimited,
        GenerationError::Api { message, .. } if is_rate_limit_message(message) => {
            FailureClass::RateLimited
        }
        GenerationError::Http(e) if e.status() == Some(reqwest::StatusCode::TOO_MANY_REQUESTS) => {
            FailureClass::RateLimited
        }
        _ => FailureClass::Unclassified,
    }
}

fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit") || lower.contains("free credits")
}

/// Worth another attempt inside the client: transport failures and 5xx.
fn is_transient(err: &GenerationError) -> bool {
    match err {
        GenerationError::Api { code, .. } => *code >= 500,
        GenerationError::Http(e) => !e.is_decode(),
        _ => false,
    }
}

// ============================================================================
// Config
// ============================================================================

/// Gemini generation client configuration
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub api_key: String,
    pub model: String,
    pub temperature: f64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl GenerationConfig {
    pub fn new(api_key: Option<String>, model: String, temperature: f64) -> Self {
        let api_key = api_key
            .or_else(|| std::env::var("GOOGLE_API_KEY").ok())
            .unwrap_or_default();

        Self {
            api_key,
            model,
            temperature,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

// ============================================================================
// Gemini API structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    system_instruction: GeminiContent,
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f64,
    response_mime_type: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiCandidateContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorResponse {
    error: Option<GeminiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    code: u16,
    message: String,
}

// ============================================================================
// GeminiGenerationClient
// ============================================================================

/// Gemini generation client — calls the Gemini `generateContent` API.
#[derive(Debug, Clone)]
pub struct GeminiGenerationClient {
    client: Client,
    config: GenerationConfig,
    base_url: String,
}

impl GeminiGenerationClient {
    pub fn new(config: GenerationConfig) -> Result<Self, GenerationError> {
        Self::with_base_url(
            config,
            "https://generativelanguage.googleapis.com/v1beta".to_string(),
        )
    }

    /// Create a client with a custom base URL (for testing / integration)
    pub fn with_base_url(
        config: GenerationConfig,
        base_url: String,
    ) -> Result<Self, GenerationError> {
        if config.model.is_empty() {
            return Err(GenerationError::MissingModel);
        }
        if config.api_key.is_empty() {
            return Err(GenerationError::MissingApiKey);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            config,
            base_url,
        })
    }

    /// Generate text with transient-failure retry.
    pub async fn generate_raw(
        &self,
        request: &GenerationRequest,
    ) -> Result<String, GenerationError> {
        let retry_strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.config.max_retries);

        let result = RetryIf::spawn(
            retry_strategy,
            || self.generate_once(request),
            is_transient,
        )
        .await;

        if let Err(e) = &result {
            tracing::error!(
                model = %self.config.model,
                error = %e,
                "Generation call failed"
            );
        }

        result
    }

    async fn generate_once(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.config.model, self.config.api_key
        );

        let body = GeminiRequest {
            system_instruction: GeminiContent {
                parts: vec![GeminiPart {
                    text: request.system_text.clone(),
                }],
            },
            contents: vec![GeminiContent {
                parts: vec![GeminiPart {
                    text: request.user_text.clone(),
                }],
            }],
            generation_config: GeminiGenerationConfig {
                temperature: self.config.temperature,
                response_mime_type: "application/json".to_string(),
            },
        };

        let response = self.client.post(&url).json(&body).send().await?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let error_detail = serde_json::from_str::<GeminiErrorResponse>(&error_body)
                .ok()
                .and_then(|e| e.error);

            let (code, message) = error_detail
                .map(|e| (e.code, e.message))
                .unwrap_or((status.as_u16(), error_body));

            tracing::error!(code = code, message = %message, "Gemini API error");

            return Err(GenerationError::Api { code, message });
        }

        let gemini_response: GeminiResponse = response.json().await?;

        gemini_response
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .find_map(|p| p.text)
            .ok_or(GenerationError::EmptyResponse)
    }
}

#[async_trait]
impl GenerationBackend for GeminiGenerationClient {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, GenerationError> {
        let text = self.generate_raw(request).await?;
        Ok(GenerationResponse { text })
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn name(&self) -> &str {
        "gemini"
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(api_key: &str) -> GenerationConfig {
        GenerationConfig {
            api_key: api_key.to_string(),
            model: "gemini-2.0-flash".to_string(),
            temperature: 0.7,
            max_retries: 2,
            retry_delay_ms: 10,
        }
    }

    fn test_request() -> GenerationRequest {
        GenerationRequest {
            system_text: "You are a coach.".to_string(),
            user_text: "Summarize the session.".to_string(),
        }
    }

    fn mock_generate_response(text: &str) -> serde_json::Value {
        serde_json::json!({
            "candidates": [{
                "content": { "parts": [{ "text": text }] }
            }]
        })
    }

    #[tokio::test]
    async fn test_generate_returns_candidate_text() {
        let mock_server = MockServer::start().await;
        let client =
            GeminiGenerationClient::with_base_url(test_config("test-api-key"), mock_server.uri())
                .expect("Failed to create client");

        Mock::given(method("POST"))
            .and(path("/models/gemini-2.0-flash:generateContent"))
            .and(body_partial_json(serde_json::json!({
                "systemInstruction": { "parts": [{ "text": "You are a coach." }] },
                "generationConfig": { "temperature": 0.7, "responseMimeType": "application/json" }
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(mock_generate_response(r#"{"summary":"Solid work."}"#)),
            )
            .mount(&mock_server)
            .await;

        let result = client.generate(&test_request()).await;

        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result.err());
        assert_eq!(result.unwrap().text, r#"{"summary":"Solid work."}"#);
    }

    #[tokio::test]
    async fn test_missing_model_is_construction_error() {
        let mut config = test_config("test-api-key");
        config.model = String::new();

        let result = GeminiGenerationClient::new(config);
        match result {
            Err(GenerationError::MissingModel) => {}
            _ => panic!("Expected MissingModel error"),
        }
    }

    #[tokio::test]
    async fn test_missing_api_key_is_construction_error() {
        let result = GeminiGenerationClient::new(test_config(""));
        match result {
            Err(GenerationError::MissingApiKey) => {}
            _ => panic!("Expected MissingApiKey error"),
        }
    }

    #[tokio::test]
    async fn test_429_surfaces_without_retry() {
        let mock_server = MockServer::start().await;
        let client =
            GeminiGenerationClient::with_base_url(test_config("test-api-key"), mock_server.uri())
                .expect("Failed to create client");

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": { "code": 429, "message": "Rate limit exceeded" }
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let result = client.generate(&test_request()).await;

        match result {
            Err(e @ GenerationError::Api { code: 429, .. }) => {
                assert_eq!(classify_failure(&e), FailureClass::RateLimited);
            }
            other => panic!("Expected Api 429, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retries_on_500_then_succeeds() {
        let mock_server = MockServer::start().await;
        let client =
            GeminiGenerationClient::with_base_url(test_config("test-api-key"), mock_server.uri())
                .expect("Failed to create client");

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "error": { "code": 500, "message": "Internal server error" }
            })))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(mock_generate_response("ok")),
            )
            .mount(&mock_server)
            .await;

        let result = client.generate(&test_request()).await;
        assert!(result.is_ok(), "Expected success after retry");
    }

    #[tokio::test]
    async fn test_empty_candidates_is_empty_response() {
        let mock_server = MockServer::start().await;
        let client =
            GeminiGenerationClient::with_base_url(test_config("test-api-key"), mock_server.uri())
                .expect("Failed to create client");

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "candidates": [] })),
            )
            .mount(&mock_server)
            .await;

        let result = client.generate(&test_request()).await;
        assert!(matches!(result, Err(GenerationError::EmptyResponse)));
    }

    // --- classifier tests ---

    #[test]
    fn test_classify_429_code() {
        let err = GenerationError::Api {
            code: 429,
            message: "Too many requests".to_string(),
        };
        assert_eq!(classify_failure(&err), FailureClass::RateLimited);
    }

    #[test]
    fn test_classify_rate_limit_message() {
        let err = GenerationError::Api {
            code: 400,
            message: "Rate limit reached for this project".to_string(),
        };
        assert_eq!(classify_failure(&err), FailureClass::RateLimited);
    }

    #[test]
    fn test_classify_free_credits_message() {
        let err = GenerationError::Api {
            code: 403,
            message: "You have exhausted your free credits".to_string(),
        };
        assert_eq!(classify_failure(&err), FailureClass::RateLimited);
    }

    #[test]
    fn test_classify_other_errors_unclassified() {
        let err = GenerationError::Api {
            code: 500,
            message: "Internal server error".to_string(),
        };
        assert_eq!(classify_failure(&err), FailureClass::Unclassified);
        assert_eq!(
            classify_failure(&GenerationError::EmptyResponse),
            FailureClass::Unclassified
        );
    }
}
