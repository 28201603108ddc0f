pub mod config;
pub mod error;
pub mod eval;
pub mod extract;
pub mod mutate;
pub mod optimize;
pub mod render;
pub mod report;
pub mod score;
pub mod session;
pub mod suite;
pub mod template;
pub mod types;

pub use config::{ServerConfig, TrainerConfig};
pub use error::{SessionError, TrainerError};
pub use eval::{CaseOutcome, EndpointMode, EvalConfig, Evaluator, TemplateEvaluation};
pub use extract::{extract, extract_output, Provenance, ToolCallAttempt};
pub use mutate::{InvalidMutation, MutationEngine, MutationOperator};
pub use optimize::{
    GenerationSummary,
    OptimizationRun,
    OptimizeError,
    Optimizer,
    OptimizerConfig,
    Population,
    StopReason,
    TemplateVariant,
};
pub use render::{RenderOptions, Renderer, TemplateSyntaxError};
pub use report::{save_best, RunReport};
pub use score::{ArgMatcher, Category, Expectation, ExpectedCall, Predicate, Reason, ScoreResult, Scorer};
pub use session::{
    HttpBackend,
    HttpBackendConfig,
    InferenceBackend,
    InferenceRequest,
    LaunchSpec,
    ModelOutput,
    Prompt,
    ScriptedBackend,
    ServerSession,
    SessionConfig,
    SessionState,
};
pub use suite::{SuiteError, TestCase, TestSuite};
pub use template::{
    BuiltinTemplates,
    FileTemplates,
    HubTemplates,
    TemplateResolver,
    TemplateSource,
    TemplateSourceError,
    TemplateStore,
};
pub use types::{ChatMessage, Conversation, FunctionCall, FunctionDefinition, MessageRole, Tool, ToolCall};
