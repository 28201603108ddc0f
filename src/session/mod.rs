//! Lifecycle of one inference-server connection.
//!
//! A [`ServerSession`] wraps an [`InferenceBackend`] (and optionally the child
//! process serving it) in an explicit state machine. `complete` takes `&mut self`,
//! so a session never has more than one request in flight.

use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::SessionError;

pub mod backend;
pub mod http;
pub mod process;
pub mod scripted;

pub use backend::{InferenceBackend, InferenceRequest, ModelOutput, NativeCall, Prompt};
pub use http::{HttpBackend, HttpBackendConfig};
pub use process::{LaunchSpec, ServerProcess};
pub use scripted::ScriptedBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Starting,
    Ready,
    Busy,
    Stopped,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Starting => "starting",
            SessionState::Ready => "ready",
            SessionState::Busy => "busy",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub readiness_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub health_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub launch: Option<LaunchSpec>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            readiness_retries: 10,
            initial_backoff_ms: 250,
            max_backoff_ms: 5_000,
            health_timeout_ms: 5_000,
            shutdown_timeout_ms: 10_000,
            launch: None,
        }
    }
}

impl SessionConfig {
    pub fn with_readiness_retries(mut self, retries: u32) -> Self {
        self.readiness_retries = retries;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff_ms = initial.as_millis() as u64;
        self.max_backoff_ms = max.as_millis() as u64;
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_launch(mut self, launch: LaunchSpec) -> Self {
        self.launch = Some(launch);
        self
    }

    fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

pub struct ServerSession {
    state: SessionState,
    backend: Arc<dyn InferenceBackend>,
    process: Option<ServerProcess>,
    config: SessionConfig,
}

impl ServerSession {
    pub fn new(backend: Arc<dyn InferenceBackend>, config: SessionConfig) -> Self {
        Self {
            state: SessionState::Uninitialized,
            backend,
            process: None,
            config,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Launches the configured server (if any) and waits for it to report healthy.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Ready {
            return Ok(());
        }
        self.state = SessionState::Starting;

        if self.process.is_none() {
            if let Some(launch) = &self.config.launch {
                match launch.spawn() {
                    Ok(process) => self.process = Some(process),
                    Err(error) => {
                        self.state = SessionState::Failed;
                        return Err(error);
                    }
                }
            }
        }

        let attempts = self.config.readiness_retries.max(1);
        let max_backoff = Duration::from_millis(self.config.max_backoff_ms);
        let mut backoff = Duration::from_millis(self.config.initial_backoff_ms);
        let mut last_reason = String::new();

        for attempt in 1..=attempts {
            if let Some(status) = self.process_exit()? {
                self.state = SessionState::Failed;
                return Err(SessionError::ProcessExited(status));
            }

            match self.probe().await {
                Ok(()) => {
                    info!(backend = self.backend.name(), attempt, "inference server ready");
                    self.state = SessionState::Ready;
                    return Ok(());
                }
                Err(error) => {
                    debug!(attempt, %error, "readiness probe failed");
                    last_reason = error.to_string();
                }
            }

            if attempt < attempts {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        }

        self.state = SessionState::Failed;
        Err(SessionError::ServerUnavailable {
            attempts,
            reason: last_reason,
        })
    }

    /// Sends one request. A timeout or transport error triggers a health check
    /// that decides whether the session stays usable.
    pub async fn complete(
        &mut self,
        request: &InferenceRequest,
        timeout: Duration,
    ) -> Result<ModelOutput, SessionError> {
        if self.state != SessionState::Ready {
            return Err(SessionError::NotReady(self.state));
        }
        self.state = SessionState::Busy;

        let outcome = tokio::time::timeout(timeout, self.backend.complete(request)).await;
        let error = match outcome {
            Ok(Ok(output)) => {
                self.state = SessionState::Ready;
                return Ok(output);
            }
            Ok(Err(error)) => error,
            Err(_) => SessionError::RequestTimeout(timeout),
        };

        let healthy = match self.process_exit() {
            Ok(Some(_)) | Err(_) => false,
            Ok(None) => self.probe().await.is_ok(),
        };
        if healthy {
            self.state = SessionState::Ready;
        } else {
            warn!(%error, "inference server unhealthy after failed request");
            self.state = SessionState::Failed;
        }
        Err(error)
    }

    /// Releases the server process. Safe to call from any state, any number of times.
    pub async fn stop(&mut self) {
        if let Some(process) = self.process.take() {
            process.shutdown(self.config.shutdown_timeout()).await;
        }
        if self.state != SessionState::Stopped {
            debug!(from = %self.state, "session stopped");
        }
        self.state = SessionState::Stopped;
    }

    pub async fn restart(&mut self) -> Result<(), SessionError> {
        warn!(from = %self.state, "restarting session");
        self.stop().await;
        self.start().await
    }

    async fn probe(&self) -> Result<(), SessionError> {
        let timeout = self.config.health_timeout();
        match tokio::time::timeout(timeout, self.backend.health()).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::RequestTimeout(timeout)),
        }
    }

    fn process_exit(&mut self) -> Result<Option<String>, SessionError> {
        match self.process.as_mut() {
            Some(process) => process.exit_status(),
            None => Ok(None),
        }
    }
}

impl fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSession")
            .field("state", &self.state)
            .field("backend", &self.backend.name())
            .field("process", &self.process.is_some())
            .finish()
    }
}
