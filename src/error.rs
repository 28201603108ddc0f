use std::time::Duration;

use thiserror::Error;

use crate::session::SessionState;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("server unavailable after {attempts} readiness probe(s): {reason}")]
    ServerUnavailable { attempts: u32, reason: String },

    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    #[error("server returned an error: {0}")]
    Server(String),

    #[error("invalid response from server: {0}")]
    InvalidResponse(&'static str),

    #[error("session is {0}, expected ready")]
    NotReady(SessionState),

    #[error("server process error: {0}")]
    Process(#[from] std::io::Error),

    #[error("server process exited ({0})")]
    ProcessExited(String),

    #[error("scripted backend exhausted")]
    ScriptExhausted,
}

impl SessionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::RequestTimeout(_))
    }
}

#[derive(Debug, Error)]
pub enum TrainerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Suite(#[from] crate::suite::SuiteError),

    #[error(transparent)]
    Template(#[from] crate::template::TemplateSourceError),

    #[error(transparent)]
    TemplateSyntax(#[from] crate::render::TemplateSyntaxError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Optimize(#[from] crate::optimize::OptimizeError),

    #[error("report rendering failed: {0}")]
    Report(#[from] handlebars::RenderError),
}
