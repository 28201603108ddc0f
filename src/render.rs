//! Chat-template rendering.
//!
//! Templates are Jinja documents in the dialect Hugging Face tokenizers use:
//! `trim_blocks` and `lstrip_blocks` are on, Python string methods resolve
//! through the minijinja pycompat layer, and `raise_exception` aborts the
//! render with the template's own message.

use std::collections::BTreeSet;

use chrono::{format::StrftimeItems, format::Item, NaiveDate, NaiveDateTime};
use minijinja::{Environment, Error, ErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{ChatMessage, Conversation, Tool};

#[derive(Debug, Clone, Error, PartialEq)]
#[error("template syntax error: {message}")]
pub struct TemplateSyntaxError {
    pub message: String,
    pub line: Option<usize>,
}

impl From<Error> for TemplateSyntaxError {
    fn from(error: Error) -> Self {
        let mut message = error.to_string();
        let mut source = std::error::Error::source(&error);
        while let Some(inner) = source {
            message.push_str(": ");
            message.push_str(&inner.to_string());
            source = inner.source();
        }
        Self {
            message,
            line: error.line(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    pub bos_token: String,
    pub eos_token: String,
    pub add_generation_prompt: bool,
    /// Date reported by `strftime_now` so renders stay reproducible.
    pub date: NaiveDate,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            bos_token: "<s>".to_string(),
            eos_token: "</s>".to_string(),
            add_generation_prompt: true,
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default(),
        }
    }
}

impl RenderOptions {
    pub fn with_bos_token(mut self, token: impl Into<String>) -> Self {
        self.bos_token = token.into();
        self
    }

    pub fn with_eos_token(mut self, token: impl Into<String>) -> Self {
        self.eos_token = token.into();
        self
    }

    pub fn with_generation_prompt(mut self, enabled: bool) -> Self {
        self.add_generation_prompt = enabled;
        self
    }
}

const ENVIRONMENT_GLOBALS: &[&str] = &[
    "raise_exception",
    "strftime_now",
    "range",
    "dict",
    "namespace",
    "debug",
    "cycler",
    "joiner",
];

#[derive(Serialize)]
struct Bindings<'a> {
    messages: Vec<Value>,
    tools: Option<&'a [Tool]>,
    tools_json: String,
    add_generation_prompt: bool,
    bos_token: &'a str,
    eos_token: &'a str,
    date_string: String,
}

#[derive(Debug, Clone, Default)]
pub struct Renderer {
    options: RenderOptions,
}

impl Renderer {
    pub fn new(options: RenderOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    pub fn render(
        &self,
        template: &str,
        messages: &[ChatMessage],
        tools: &[Tool],
    ) -> Result<String, TemplateSyntaxError> {
        let env = self.environment();
        let compiled = env.template_from_str(template)?;

        let bindings = Bindings {
            messages: messages.iter().map(ChatMessage::template_value).collect(),
            tools: if tools.is_empty() { None } else { Some(tools) },
            tools_json: serde_json::to_string(tools).map_err(|error| TemplateSyntaxError {
                message: format!("tool schema is not serializable: {error}"),
                line: None,
            })?,
            add_generation_prompt: self.options.add_generation_prompt,
            bos_token: &self.options.bos_token,
            eos_token: &self.options.eos_token,
            date_string: self.options.date.format("%d %b %Y").to_string(),
        };

        Ok(compiled.render(&bindings)?)
    }

    pub fn render_conversation(
        &self,
        template: &str,
        conversation: &Conversation,
    ) -> Result<String, TemplateSyntaxError> {
        self.render(template, &conversation.messages, &conversation.tools)
    }

    /// Parses without rendering.
    pub fn check(&self, template: &str) -> Result<(), TemplateSyntaxError> {
        let env = self.environment();
        env.template_from_str(template)?;
        Ok(())
    }

    /// Top-level names the template reads from its context, minus the helpers
    /// the environment itself provides.
    pub fn variable_contract(&self, template: &str) -> Result<BTreeSet<String>, TemplateSyntaxError> {
        let env = self.environment();
        let compiled = env.template_from_str(template)?;
        Ok(compiled
            .undeclared_variables(false)
            .into_iter()
            .filter(|name| !ENVIRONMENT_GLOBALS.contains(&name.as_str()))
            .collect())
    }

    fn environment<'source>(&self) -> Environment<'source> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.set_unknown_method_callback(minijinja_contrib::pycompat::unknown_method_callback);
        env.add_function("raise_exception", raise_exception);

        let now = self.options.date.and_hms_opt(0, 0, 0).unwrap_or_default();
        env.add_function("strftime_now", move |format: String| strftime(now, &format));
        env
    }
}

fn raise_exception(message: String) -> Result<String, Error> {
    Err(Error::new(ErrorKind::InvalidOperation, message))
}

fn strftime(now: NaiveDateTime, format: &str) -> Result<String, Error> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("invalid strftime format: {format}"),
        ));
    }
    Ok(now.format(format).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FunctionCall, ToolCall};
    use serde_json::json;

    const CHATML: &str = "{% for message in messages %}<|im_start|>{{ message['role'] }}\n{{ message['content'] }}<|im_end|>\n{% endfor %}{% if add_generation_prompt %}<|im_start|>assistant\n{% endif %}";

    #[test]
    fn renders_messages_with_generation_prompt() {
        let renderer = Renderer::default();
        let prompt = renderer
            .render_conversation(CHATML, &Conversation::smoke_test())
            .unwrap();
        assert!(prompt.starts_with("<|im_start|>system\nYou are a helpful assistant.<|im_end|>\n"));
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let renderer = Renderer::default();
        let template = "{{ bos_token }}{% if tools %}{{ tools | tojson }}{% endif %}{{ strftime_now('%Y-%m-%d') }}{% for m in messages %}[{{ m.role }}]{{ m.content | trim }}{% endfor %}";
        let conversation = Conversation::smoke_test();
        let first = renderer.render_conversation(template, &conversation).unwrap();
        let second = renderer.render_conversation(template, &conversation).unwrap();
        assert_eq!(first, second);
        assert!(first.contains("2024-01-01"));
        assert!(first.contains("get_weather"));
    }

    #[test]
    fn python_string_methods_are_available() {
        let renderer = Renderer::default();
        let template = "{% for m in messages %}{% if m.content.startswith('What') %}{{ m.content.upper() }}{% endif %}{% endfor %}";
        let prompt = renderer
            .render_conversation(template, &Conversation::smoke_test())
            .unwrap();
        assert_eq!(prompt, "WHAT'S THE WEATHER LIKE IN PARIS?");
    }

    #[test]
    fn tool_call_arguments_render_as_objects() {
        let renderer = Renderer::default();
        let messages = vec![ChatMessage::assistant("").with_tool_calls(vec![ToolCall::new(
            FunctionCall::new("get_weather", json!({"location": "Tokyo"})),
        )])];
        let template = "{% for m in messages %}{% for call in m.tool_calls %}{{ call.function.arguments.location }}{% endfor %}{% endfor %}";
        assert_eq!(renderer.render(template, &messages, &[]).unwrap(), "Tokyo");
    }

    #[test]
    fn unparsable_template_is_a_syntax_error() {
        let renderer = Renderer::default();
        let err = renderer
            .render_conversation("{% for message in messages %}", &Conversation::smoke_test())
            .unwrap_err();
        assert!(err.message.contains("syntax error") || err.message.contains("unexpected"));
        assert!(renderer.check("{{ unclosed").is_err());
    }

    #[test]
    fn raise_exception_surfaces_template_message() {
        let renderer = Renderer::default();
        let template = "{% if messages[0]['role'] == 'system' %}{{ raise_exception('System role not supported') }}{% endif %}";
        let err = renderer
            .render_conversation(template, &Conversation::smoke_test())
            .unwrap_err();
        assert!(err.message.contains("System role not supported"));
    }

    #[test]
    fn variable_contract_lists_context_names() {
        let renderer = Renderer::default();
        let contract = renderer
            .variable_contract("{{ bos_token }}{% for m in messages %}{{ m.content }}{% endfor %}{{ raise_exception('x') if false }}")
            .unwrap();
        assert_eq!(
            contract.into_iter().collect::<Vec<_>>(),
            vec!["bos_token".to_string(), "messages".to_string()]
        );
    }
}
