use std::{env, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::SessionError,
    session::backend::{InferenceBackend, InferenceRequest, ModelOutput, NativeCall, Prompt},
    types::{ChatMessage, Tool},
};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpBackendConfig {
    pub base_url: String,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub connect_timeout_ms: u64,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: None,
            api_key: None,
            connect_timeout_ms: 5_000,
        }
    }
}

impl HttpBackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn apply_env(mut self) -> Self {
        if let Ok(base_url) = env::var("TEMPLATE_TRAINER_URL") {
            self.base_url = base_url;
        }
        if let Ok(model) = env::var("TEMPLATE_TRAINER_MODEL") {
            self.model = Some(model);
        }
        if let Ok(api_key) = env::var("TEMPLATE_TRAINER_API_KEY") {
            self.api_key = Some(api_key);
        }
        self
    }
}

/// llama.cpp server (or any OpenAI-compatible proxy such as LiteLLM).
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    config: HttpBackendConfig,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self, SessionError> {
        Self::from_config(HttpBackendConfig::new(base_url))
    }

    pub fn from_config(config: HttpBackendConfig) -> Result<Self, SessionError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()?;

        Ok(Self { client, config })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn with_default_headers(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn probe(&self, path: &str) -> Result<StatusCode, SessionError> {
        let response = self
            .with_default_headers(self.client.get(self.endpoint(path)))
            .send()
            .await?;
        Ok(response.status())
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[Tool],
        request: &InferenceRequest,
    ) -> Result<ModelOutput, SessionError> {
        let body = ChatRequestBody {
            model: self.config.model.as_deref(),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            tool_choice: if tools.is_empty() { None } else { Some("auto") },
            tools: if tools.is_empty() { None } else { Some(tools) },
        };

        let response = self
            .with_default_headers(self.client.post(self.endpoint("v1/chat/completions")))
            .json(&body)
            .send()
            .await?;
        let parsed: ChatCompletionResponse = read_json(response).await?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or(SessionError::InvalidResponse("response did not contain any choices"))?;

        let calls: Vec<NativeCall> = choice
            .message
            .tool_calls
            .into_iter()
            .map(|call| NativeCall {
                name: call.function.name,
                arguments: call.function.arguments,
            })
            .collect();

        if calls.is_empty() {
            Ok(ModelOutput::text(choice.message.content.unwrap_or_default()))
        } else {
            Ok(ModelOutput::Native {
                content: choice.message.content,
                calls,
            })
        }
    }

    async fn raw_completion(
        &self,
        prompt: &str,
        request: &InferenceRequest,
    ) -> Result<ModelOutput, SessionError> {
        let body = RawCompletionBody {
            model: self.config.model.as_deref(),
            prompt,
            temperature: request.temperature,
            n_predict: request.max_tokens,
            max_tokens: request.max_tokens,
            cache_prompt: true,
        };

        let response = self
            .with_default_headers(self.client.post(self.endpoint("completion")))
            .json(&body)
            .send()
            .await?;
        let parsed: RawCompletionResponse = read_json(response).await?;

        let content = parsed
            .content
            .or_else(|| parsed.choices.into_iter().next().map(|choice| choice.text))
            .ok_or(SessionError::InvalidResponse("completion response had no content"))?;

        Ok(ModelOutput::text(content))
    }
}

async fn read_json<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
) -> Result<T, SessionError> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await?;
        if let Ok(error) = serde_json::from_str::<ErrorEnvelope>(&text) {
            return Err(SessionError::Server(error.error.message));
        }
        return Err(SessionError::Server(format!("unexpected status {status}: {text}")));
    }
    Ok(response.json().await?)
}

#[async_trait]
impl InferenceBackend for HttpBackend {
    async fn health(&self) -> Result<(), SessionError> {
        match self.probe("health").await {
            Ok(status) if status.is_success() => Ok(()),
            // 503 means llama.cpp is still loading the model.
            Ok(status) if status == StatusCode::SERVICE_UNAVAILABLE => {
                Err(SessionError::Server("model is still loading".to_string()))
            }
            first => {
                let status = self.probe("health/liveliness").await?;
                if status.is_success() {
                    Ok(())
                } else {
                    let reason = match first {
                        Ok(status) => format!("health probe returned {status}"),
                        Err(error) => error.to_string(),
                    };
                    Err(SessionError::Server(reason))
                }
            }
        }
    }

    async fn complete(&self, request: &InferenceRequest) -> Result<ModelOutput, SessionError> {
        match &request.prompt {
            Prompt::Chat { messages, tools } => self.chat(messages, tools, request).await,
            Prompt::Text(prompt) => self.raw_completion(prompt, request).await,
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[derive(Debug, Serialize)]
struct ChatRequestBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [Tool]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct RawCompletionBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    prompt: &'a str,
    temperature: f32,
    n_predict: u32,
    max_tokens: u32,
    cache_prompt: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ResponseChoice>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    function: ResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct RawCompletionResponse {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    choices: Vec<TextChoice>,
}

#[derive(Debug, Deserialize)]
struct TextChoice {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}
