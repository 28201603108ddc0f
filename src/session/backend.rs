use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SessionError;
use crate::types::{ChatMessage, Tool};

/// What is sent to the inference server for one test case.
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    /// Messages go to a chat-completions endpoint; the server applies its own template.
    Chat {
        messages: Vec<ChatMessage>,
        tools: Vec<Tool>,
    },
    /// Fully rendered prompt text for a raw completion endpoint.
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub prompt: Prompt,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl InferenceRequest {
    pub fn new(prompt: Prompt) -> Self {
        Self {
            prompt,
            temperature: 0.0,
            max_tokens: 256,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn prompt_text(&self) -> Option<&str> {
        match &self.prompt {
            Prompt::Text(text) => Some(text),
            Prompt::Chat { .. } => None,
        }
    }
}

/// A tool call the server already parsed out of the generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeCall {
    pub name: String,
    /// Either a JSON object or the JSON-encoded string most servers send.
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelOutput {
    Native {
        content: Option<String>,
        calls: Vec<NativeCall>,
    },
    Text { content: String },
}

impl ModelOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    /// Raw text as produced by the model, for reports.
    pub fn raw_text(&self) -> String {
        match self {
            ModelOutput::Text { content } => content.clone(),
            ModelOutput::Native { content, calls } => {
                let mut raw = content.clone().unwrap_or_default();
                for call in calls {
                    if !raw.is_empty() {
                        raw.push('\n');
                    }
                    raw.push_str(&format!("[native] {}({})", call.name, call.arguments));
                }
                raw
            }
        }
    }
}

/// Transport to one inference server.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Succeeds once the server can accept completions.
    async fn health(&self) -> Result<(), SessionError>;

    async fn complete(&self, request: &InferenceRequest) -> Result<ModelOutput, SessionError>;

    fn name(&self) -> &'static str;
}
