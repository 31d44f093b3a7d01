//! Language model backends.
//!
//! Every backend exposes the same capability, `complete`: take a chat-style
//! request (optionally carrying the JSON shape the answer should follow) and
//! return the model's raw text.
//!
//!   OllamaBackend     - local served model via `/api/chat`
//!   GeminiBackend     - remote hosted model via `generateContent`
//!   InProcessBackend  - a generator living in this process, run on the blocking pool
//!   FallbackBackend   - explicit primary/secondary pairing

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::LlmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    /// JSON schema the answer should conform to, when the caller has one.
    pub response_shape: Option<Value>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages, ..Self::default() }
    }

    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self::new(vec![Message::user(prompt)])
    }

    pub fn with_shape(mut self, shape: Value) -> Self {
        self.response_shape = Some(shape);
        self
    }

    /// Flatten to a single prompt string for backends without a chat format.
    pub fn to_prompt(&self) -> String {
        self.messages
            .iter()
            .map(|m| match m.role {
                Role::System => format!("SYSTEM:\n{}", m.content),
                Role::User => format!("USER:\n{}", m.content),
                Role::Assistant => format!("ASSISTANT:\n{}", m.content),
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;

    fn model_id(&self) -> &str;
}

#[async_trait]
impl<T: LlmBackend + ?Sized> LlmBackend for Arc<T> {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        (**self).complete(request).await
    }

    fn model_id(&self) -> &str {
        (**self).model_id()
    }
}

async fn check_response_status(resp: reqwest::Response) -> Result<Value, LlmError> {
    let status = resp.status().as_u16();
    let body: Value = resp.json().await?;
    if status >= 400 {
        let message = body["error"]["message"]
            .as_str()
            .or_else(|| body["error"].as_str())
            .unwrap_or("unknown API error")
            .to_string();
        return Err(LlmError::Api { status, message });
    }
    Ok(body)
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, LlmError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(LlmError::Http)
}

// ── Ollama (local served) ─────────────────────────────────────────────────────

#[derive(Clone)]
pub struct OllamaBackend {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<Value>,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
}

#[derive(Deserialize)]
struct OllamaMessage {
    content: String,
}

impl OllamaBackend {
    pub fn new(base_url: String, model: String, timeout: Duration) -> Result<Self, LlmError> {
        Ok(Self {
            base_url,
            model,
            client: http_client(timeout)?,
        })
    }

    /// A local Ollama server on its default port.
    pub fn local() -> Result<Self, LlmError> {
        Self::new(
            "http://localhost:11434".to_string(),
            "llama3".to_string(),
            Duration::from_secs(120),
        )
    }
}

#[async_trait]
impl LlmBackend for OllamaBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let url = format!("{}/api/chat", self.base_url);

        let body = OllamaChatRequest {
            model: &self.model,
            messages: &request.messages,
            stream: false,
            // Force JSON output when a shape is known
            format: request.response_shape.clone(),
            options: request.temperature.map(|t| json!({ "temperature": t })),
        };

        let response = self.client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    LlmError::Unavailable(format!("Ollama at {} unreachable: {}", self.base_url, e))
                } else {
                    LlmError::Http(e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, message });
        }

        let chat: OllamaChatResponse = response.json().await?;
        Ok(chat.message.content)
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

// ── Gemini (remote hosted) ────────────────────────────────────────────────────

pub struct GeminiBackend {
    base_url: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl GeminiBackend {
    pub fn new(api_key: String, model: String, timeout: Duration) -> Result<Self, LlmError> {
        Ok(Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model,
            api_key,
            client: http_client(timeout)?,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_body(&self, request: &CompletionRequest) -> Value {
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();

        let contents: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let role = if m.role == Role::Assistant { "model" } else { "user" };
                json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect();

        let mut generation = json!({ "temperature": request.temperature.unwrap_or(0.5) });
        if request.response_shape.is_some() {
            generation["responseMimeType"] = json!("application/json");
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": generation,
        });
        if !system.is_empty() {
            body["systemInstruction"] = json!({ "parts": [{ "text": system.join("\n\n") }] });
        }
        body
    }
}

#[async_trait]
impl LlmBackend for GeminiBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let resp = self.client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&self.build_body(request))
            .send()
            .await?;
        let json = check_response_status(resp).await?;

        let text: String = json["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.is_empty() {
            let reason = json["promptFeedback"]["blockReason"]
                .as_str()
                .or_else(|| json["candidates"][0]["finishReason"].as_str())
                .unwrap_or("empty response");
            return Err(LlmError::Api { status: 200, message: reason.to_string() });
        }
        Ok(text)
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

// ── In-process ────────────────────────────────────────────────────────────────

/// A model that runs inside this process. Generation is blocking, so the
/// backend moves it onto tokio's blocking pool.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, request: &CompletionRequest) -> Result<String, String>;
}

impl<F> TextGenerator for F
where
    F: Fn(&CompletionRequest) -> Result<String, String> + Send + Sync,
{
    fn generate(&self, request: &CompletionRequest) -> Result<String, String> {
        self(request)
    }
}

#[derive(Clone)]
pub struct InProcessBackend {
    name: String,
    generator: Arc<dyn TextGenerator>,
}

impl InProcessBackend {
    pub fn new(name: impl Into<String>, generator: impl TextGenerator + 'static) -> Self {
        Self {
            name: name.into(),
            generator: Arc::new(generator),
        }
    }
}

#[async_trait]
impl LlmBackend for InProcessBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let generator = Arc::clone(&self.generator);
        let request = request.clone();
        tokio::task::spawn_blocking(move || generator.generate(&request))
            .await
            .map_err(|e| LlmError::Generation(e.to_string()))?
            .map_err(LlmError::Generation)
    }

    fn model_id(&self) -> &str {
        &self.name
    }
}

// ── Explicit fallback ─────────────────────────────────────────────────────────

/// Sends to `primary`; only when it is unreachable does the request go to
/// `secondary`. Never built implicitly.
pub struct FallbackBackend {
    primary: Arc<dyn LlmBackend>,
    secondary: Arc<dyn LlmBackend>,
}

impl FallbackBackend {
    pub fn new(primary: Arc<dyn LlmBackend>, secondary: Arc<dyn LlmBackend>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl LlmBackend for FallbackBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        match self.primary.complete(request).await {
            Ok(text) => Ok(text),
            Err(e) if e.is_transient() => {
                warn!(
                    primary = self.primary.model_id(),
                    secondary = self.secondary.model_id(),
                    error = %e,
                    "Primary backend unavailable, using configured fallback"
                );
                self.secondary.complete(request).await
            }
            Err(e) => Err(e),
        }
    }

    fn model_id(&self) -> &str {
        self.primary.model_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_ollama_backend() {
        let backend = OllamaBackend::local().unwrap();
        assert_eq!(backend.model_id(), "llama3");
        assert_eq!(backend.base_url, "http://localhost:11434");
    }

    #[test]
    fn test_gemini_body_splits_system_messages() {
        let backend = GeminiBackend::new("k".into(), "gemini-1.5-flash".into(), Duration::from_secs(5)).unwrap();
        let request = CompletionRequest::new(vec![
            Message::system("be precise"),
            Message::user("q"),
            Message::assistant("a"),
        ])
        .with_shape(json!({"type": "object"}));

        let body = backend.build_body(&request);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be precise");
        assert_eq!(body["contents"].as_array().unwrap().len(), 2);
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
    }

    #[test]
    fn test_to_prompt_flattens_roles() {
        let request = CompletionRequest::new(vec![Message::system("s"), Message::user("u")]);
        assert_eq!(request.to_prompt(), "SYSTEM:\ns\n\nUSER:\nu");
    }

    #[tokio::test]
    async fn test_in_process_backend_runs_generator() {
        let backend = InProcessBackend::new("echo", |req: &CompletionRequest| -> Result<String, String> {
            Ok(req.messages.last().map(|m| m.content.clone()).unwrap_or_default())
        });
        let out = backend.complete(&CompletionRequest::from_prompt("hello")).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_in_process_error_is_generation_error() {
        let backend = InProcessBackend::new("broken", |_: &CompletionRequest| -> Result<String, String> { Err("no weights".to_string()) });
        let err = backend.complete(&CompletionRequest::from_prompt("x")).await.unwrap_err();
        assert!(matches!(err, LlmError::Generation(_)));
    }

    #[tokio::test]
    async fn test_fallback_only_on_unavailable() {
        let down = Arc::new(InProcessBackend::new("down", |_: &CompletionRequest| -> Result<String, String> { Err("x".to_string()) }));
        let up = Arc::new(InProcessBackend::new("up", |_: &CompletionRequest| -> Result<String, String> { Ok("ok".to_string()) }));

        // Generation errors are not transient, so no fallback happens
        let backend = FallbackBackend::new(down, up);
        assert!(backend.complete(&CompletionRequest::from_prompt("q")).await.is_err());
    }
}
