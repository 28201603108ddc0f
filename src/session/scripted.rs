use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    error::SessionError,
    session::backend::{InferenceBackend, InferenceRequest, ModelOutput},
};

type Responder = dyn Fn(&InferenceRequest) -> Result<ModelOutput, SessionError> + Send + Sync;

enum Script {
    Queue(Mutex<VecDeque<ModelOutput>>),
    Responder(Arc<Responder>),
}

/// Offline backend that replays canned outputs or asks a closure for them.
pub struct ScriptedBackend {
    script: Script,
    delay: Option<Duration>,
    healthy: AtomicBool,
    failing_probes: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(outputs: impl IntoIterator<Item = ModelOutput>) -> Self {
        Self::with_script(Script::Queue(Mutex::new(outputs.into_iter().collect())))
    }

    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(texts.into_iter().map(ModelOutput::text))
    }

    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(&InferenceRequest) -> Result<ModelOutput, SessionError> + Send + Sync + 'static,
    {
        Self::with_script(Script::Responder(Arc::new(responder)))
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            delay: None,
            healthy: AtomicBool::new(true),
            failing_probes: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Every completion sleeps this long first (useful with request timeouts).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// The next `count` health checks fail, then the backend reports healthy again.
    pub fn fail_health_checks(&self, count: usize) {
        self.failing_probes.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_output(&self, request: &InferenceRequest) -> Result<ModelOutput, SessionError> {
        match &self.script {
            Script::Responder(responder) => responder(request),
            Script::Queue(queue) => {
                let mut queue = queue
                    .lock()
                    .map_err(|_| SessionError::Server("scripted queue poisoned".to_string()))?;
                queue.pop_front().ok_or(SessionError::ScriptExhausted)
            }
        }
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn health(&self) -> Result<(), SessionError> {
        let failing = self
            .failing_probes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SessionError::Server("scripted health check failure".to_string()));
        }
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SessionError::Server("scripted backend marked unhealthy".to_string()))
        }
    }

    async fn complete(&self, request: &InferenceRequest) -> Result<ModelOutput, SessionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next_output(request)
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::backend::Prompt;

    #[tokio::test]
    async fn replays_outputs_in_order_then_exhausts() {
        let backend = ScriptedBackend::from_texts(["first", "second"]);
        let request = InferenceRequest::new(Prompt::Text("hi".to_string()));

        assert_eq!(backend.complete(&request).await.unwrap(), ModelOutput::text("first"));
        assert_eq!(backend.complete(&request).await.unwrap(), ModelOutput::text("second"));
        assert!(matches!(
            backend.complete(&request).await,
            Err(SessionError::ScriptExhausted)
        ));
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn failing_health_checks_recover() {
        let backend = ScriptedBackend::from_texts(Vec::<String>::new());
        backend.fail_health_checks(2);

        assert!(backend.health().await.is_err());
        assert!(backend.health().await.is_err());
        assert!(backend.health().await.is_ok());
    }

    #[tokio::test]
    async fn responder_sees_the_prompt() {
        let backend = ScriptedBackend::from_fn(|request| {
            Ok(ModelOutput::text(request.prompt_text().unwrap_or_default().to_uppercase()))
        });
        let request = InferenceRequest::new(Prompt::Text("echo".to_string()));
        assert_eq!(backend.complete(&request).await.unwrap(), ModelOutput::text("ECHO"));
    }
}
