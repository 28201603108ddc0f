//! Where template text comes from, and where it is kept once it exists.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use similar::TextDiff;
use thiserror::Error;
use tracing::{debug, warn};

const GENERIC: &str = include_str!("../../templates/generic.jinja");
const CHATML: &str = include_str!("../../templates/chatml.jinja");
const HERMES: &str = include_str!("../../templates/hermes.jinja");
const LLAMA_3_1: &str = include_str!("../../templates/llama-3.1.jinja");

const CATALOG: &[(&str, &str)] = &[
    ("generic", GENERIC),
    ("chatml", CHATML),
    ("hermes", HERMES),
    ("llama-3.1", LLAMA_3_1),
];

// More specific keys first so "llama-3.1" never lands on a shorter prefix.
const FAMILIES: &[(&str, &str)] = &[
    ("llama-3.3", "llama-3.1"),
    ("llama-3.2", "llama-3.1"),
    ("llama-3.1", "llama-3.1"),
    ("llama-3", "llama-3.1"),
    ("llama3", "llama-3.1"),
    ("qwen2.5", "hermes"),
    ("qwen2", "hermes"),
    ("qwen", "hermes"),
    ("hermes", "hermes"),
    ("phi", "chatml"),
    ("mistral", "generic"),
    ("deepseek", "generic"),
    ("glm", "generic"),
    ("gemma", "generic"),
];

const HUB_BASE_URL: &str = "https://huggingface.co";
const HUB_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TemplateSourceError {
    #[error("template '{0}' not found")]
    NotFound(String),

    #[error("failed to read template {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{identifier}: {message}")]
    InvalidFormat { identifier: String, message: String },

    #[error("{0} has no chat_template")]
    NoChatTemplate(String),

    #[error("template id '{0}' already holds different text")]
    Conflict(String),
}

/// Resolves an identifier to template text.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn resolve(&self, identifier: &str) -> Result<String, TemplateSourceError>;

    fn name(&self) -> &'static str;
}

/// Maps a model name to the catalog entry of its template family.
pub fn guess_family(model_name: &str) -> &'static str {
    let lower = model_name.to_lowercase();
    FAMILIES
        .iter()
        .find(|(key, _)| lower.contains(key))
        .map_or("generic", |(_, family)| *family)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinTemplates;

impl BuiltinTemplates {
    pub fn get(&self, name: &str) -> Option<&'static str> {
        CATALOG
            .iter()
            .find(|(entry, _)| *entry == name)
            .map(|(_, text)| *text)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> {
        CATALOG.iter().map(|(name, _)| *name)
    }
}

#[async_trait]
impl TemplateSource for BuiltinTemplates {
    async fn resolve(&self, identifier: &str) -> Result<String, TemplateSourceError> {
        match self.get(identifier) {
            Some(text) => Ok(text.to_string()),
            None => {
                warn!(template = identifier, "unknown built-in template, using generic");
                Ok(GENERIC.to_string())
            }
        }
    }

    fn name(&self) -> &'static str {
        "builtin"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileTemplates;

impl FileTemplates {
    /// Reads a template; `.json` files hold `{ "template": ..., <metadata> }`.
    pub fn load(&self, path: &Path) -> Result<(String, Map<String, Value>), TemplateSourceError> {
        let text = fs::read_to_string(path).map_err(|source| TemplateSourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            return Ok((text, Map::new()));
        }

        let invalid = |message: String| TemplateSourceError::InvalidFormat {
            identifier: path.display().to_string(),
            message,
        };
        let mut document: Map<String, Value> =
            serde_json::from_str(&text).map_err(|error| invalid(error.to_string()))?;
        match document.remove("template") {
            Some(Value::String(template)) => Ok((template, document)),
            _ => Err(invalid("missing string field 'template'".to_string())),
        }
    }
}

#[async_trait]
impl TemplateSource for FileTemplates {
    async fn resolve(&self, identifier: &str) -> Result<String, TemplateSourceError> {
        self.load(Path::new(identifier)).map(|(text, _)| text)
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Reads `chat_template` out of a Hugging Face repository's `tokenizer_config.json`.
#[derive(Debug, Clone)]
pub struct HubTemplates {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl Default for HubTemplates {
    fn default() -> Self {
        Self::new(HUB_BASE_URL)
    }
}

impl HubTemplates {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            timeout: HUB_TIMEOUT,
        }
    }

    /// Bounds the whole fetch, connection included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self, repo: &str) -> String {
        format!(
            "{}/{}/raw/main/tokenizer_config.json",
            self.base_url.trim_end_matches('/'),
            repo.trim_matches('/')
        )
    }
}

#[async_trait]
impl TemplateSource for HubTemplates {
    async fn resolve(&self, identifier: &str) -> Result<String, TemplateSourceError> {
        let url = self.endpoint(identifier);
        debug!(%url, "fetching tokenizer config");
        let response = self.client.get(&url).timeout(self.timeout).send().await?;
        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Err(TemplateSourceError::NotFound(identifier.to_string())),
            status => {
                return Err(TemplateSourceError::InvalidFormat {
                    identifier: identifier.to_string(),
                    message: format!("unexpected status {status}"),
                })
            }
        }

        let config: Value = response.json().await?;
        chat_template_from_config(&config)
            .ok_or_else(|| TemplateSourceError::NoChatTemplate(identifier.to_string()))
    }

    fn name(&self) -> &'static str {
        "hub"
    }
}

/// `chat_template` is either a string or a list of `{name, template}` entries,
/// where the entry named `default` wins.
fn chat_template_from_config(config: &Value) -> Option<String> {
    match config.get("chat_template")? {
        Value::String(template) => Some(template.clone()),
        Value::Array(entries) => {
            let template_of = |entry: &Value| match entry {
                Value::String(text) => Some(text.clone()),
                other => other.get("template")?.as_str().map(str::to_string),
            };
            entries
                .iter()
                .find(|entry| entry.get("name").and_then(Value::as_str) == Some("default"))
                .or_else(|| entries.first())
                .and_then(template_of)
        }
        _ => None,
    }
}

/// Dispatches template selectors:
/// `builtin:<name>`, `hf:<owner/repo>`, `auto` (family of the model hint),
/// an existing file path, or a bare built-in name.
pub struct TemplateResolver {
    builtin: BuiltinTemplates,
    files: FileTemplates,
    hub: Arc<dyn TemplateSource>,
    model_hint: Option<String>,
}

impl Default for TemplateResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateResolver {
    pub fn new() -> Self {
        Self {
            builtin: BuiltinTemplates,
            files: FileTemplates,
            hub: Arc::new(HubTemplates::default()),
            model_hint: None,
        }
    }

    pub fn with_hub(mut self, hub: Arc<dyn TemplateSource>) -> Self {
        self.hub = hub;
        self
    }

    pub fn with_model_hint(mut self, model: impl Into<String>) -> Self {
        self.model_hint = Some(model.into());
        self
    }

    pub async fn resolve(&self, selector: &str) -> Result<String, TemplateSourceError> {
        if let Some(name) = selector.strip_prefix("builtin:") {
            return self.builtin.resolve(name).await;
        }
        if let Some(repo) = selector.strip_prefix("hf:") {
            return self.hub.resolve(repo).await;
        }
        if selector == "auto" {
            let family = self.model_hint.as_deref().map_or("generic", guess_family);
            debug!(family, "resolved template family from model name");
            return self.builtin.resolve(family).await;
        }
        if Path::new(selector).is_file() {
            return self.files.resolve(selector).await;
        }
        self.builtin
            .get(selector)
            .map(str::to_string)
            .ok_or_else(|| TemplateSourceError::NotFound(selector.to_string()))
    }
}

/// Insert-only map from template id to text.
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    templates: BTreeMap<String, Arc<str>>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-inserting identical text is a no-op; different text under a known id is rejected.
    pub fn insert(
        &mut self,
        id: impl Into<String>,
        text: impl Into<Arc<str>>,
    ) -> Result<Arc<str>, TemplateSourceError> {
        let id = id.into();
        let text = text.into();
        match self.templates.get(&id) {
            Some(existing) if *existing == text => Ok(existing.clone()),
            Some(_) => Err(TemplateSourceError::Conflict(id)),
            None => {
                self.templates.insert(id, text.clone());
                Ok(text)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<str>> {
        self.templates.get(id).cloned()
    }

    pub fn contains_text(&self, text: &str) -> bool {
        self.templates.values().any(|existing| existing.as_ref() == text)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Writes `template` to `path`, or `{ "template": ..., <metadata> }` to
/// `path` with a `.json` extension when metadata is given. Returns the path written.
pub fn save_template(
    path: &Path,
    template: &str,
    metadata: Option<&Map<String, Value>>,
) -> std::io::Result<PathBuf> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    match metadata {
        Some(metadata) => {
            let mut document = Map::new();
            document.insert("template".to_string(), Value::String(template.to_string()));
            document.extend(metadata.clone());
            let target = path.with_extension("json");
            let text = serde_json::to_string_pretty(&Value::Object(document))?;
            fs::write(&target, text)?;
            Ok(target)
        }
        None => {
            fs::write(path, template)?;
            Ok(path.to_path_buf())
        }
    }
}

/// Unified line diff from `original` to `modified`.
pub fn template_diff(original: &str, modified: &str) -> String {
    TextDiff::from_lines(original, modified)
        .unified_diff()
        .context_radius(3)
        .header("original", "modified")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{render::Renderer, types::Conversation};
    use serde_json::json;

    #[test]
    fn catalog_templates_render_smoke_conversation() {
        let renderer = Renderer::default();
        let conversation = Conversation::smoke_test();
        for name in BuiltinTemplates.names() {
            let template = BuiltinTemplates.get(name).unwrap();
            let prompt = renderer
                .render_conversation(template, &conversation)
                .unwrap_or_else(|error| panic!("{name}: {error}"));
            assert!(prompt.contains("Paris"), "{name} dropped the user turn");
        }
    }

    #[test]
    fn guesses_families() {
        assert_eq!(guess_family("Meta-Llama-3.1-8B-Instruct"), "llama-3.1");
        assert_eq!(guess_family("Qwen2.5-7B-Instruct-Q4_K_M.gguf"), "hermes");
        assert_eq!(guess_family("Phi-4-mini"), "chatml");
        assert_eq!(guess_family("tinyllama"), "generic");
    }

    #[tokio::test]
    async fn unknown_builtin_falls_back_to_generic() {
        let text = BuiltinTemplates.resolve("no-such-family").await.unwrap();
        assert_eq!(text, GENERIC);
    }

    #[test]
    fn chat_template_prefers_default_entry() {
        let config = json!({
            "chat_template": [
                {"name": "tool_use", "template": "tools"},
                {"name": "default", "template": "plain"}
            ]
        });
        assert_eq!(chat_template_from_config(&config).as_deref(), Some("plain"));
        assert_eq!(
            chat_template_from_config(&json!({"chat_template": "x"})).as_deref(),
            Some("x")
        );
        assert!(chat_template_from_config(&json!({})).is_none());
    }

    #[tokio::test]
    async fn resolver_dispatches_selectors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.json");
        fs::write(&path, r#"{"template": "{{ messages }}", "score": 0.9}"#).unwrap();

        let resolver = TemplateResolver::new().with_model_hint("Hermes-3-Llama");
        assert_eq!(resolver.resolve("builtin:chatml").await.unwrap(), CHATML);
        assert_eq!(resolver.resolve("chatml").await.unwrap(), CHATML);
        assert_eq!(resolver.resolve("auto").await.unwrap(), HERMES);
        assert_eq!(
            resolver.resolve(path.to_str().unwrap()).await.unwrap(),
            "{{ messages }}"
        );
        assert!(matches!(
            resolver.resolve("definitely-missing").await,
            Err(TemplateSourceError::NotFound(_))
        ));
    }

    #[test]
    fn store_is_insert_only() {
        let mut store = TemplateStore::new();
        store.insert("seed", "a").unwrap();
        store.insert("seed", "a").unwrap();
        assert!(matches!(
            store.insert("seed", "b"),
            Err(TemplateSourceError::Conflict(_))
        ));
        assert!(store.contains_text("a"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn saves_with_metadata_and_diffs() {
        let dir = tempfile::tempdir().unwrap();
        let mut metadata = Map::new();
        metadata.insert("score".to_string(), json!(0.75));
        let written = save_template(&dir.path().join("best.jinja"), "x\ny\n", Some(&metadata)).unwrap();
        assert_eq!(written.extension().unwrap(), "json");

        let (text, loaded) = FileTemplates.load(&written).unwrap();
        assert_eq!(text, "x\ny\n");
        assert_eq!(loaded["score"], 0.75);

        let diff = template_diff("x\ny\n", "x\nz\ny\n");
        assert!(diff.contains("+z"));
        assert!(diff.starts_with("--- original"));
    }
}
