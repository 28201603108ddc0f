//! Runs one template against a test suite.
//!
//! Per case: render, send, extract, score. Failures below this boundary become
//! case diagnostics. The only thing that ends a pass early is a session that
//! stays `Failed` after one restart; the rest of the suite is then scored as
//! aborted.

use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::{stream::FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    error::SessionError,
    extract::{extract_output, ToolCallAttempt},
    render::{RenderOptions, Renderer, TemplateSyntaxError},
    score::{Category, Reason, ScoreResult, Scorer},
    session::{InferenceRequest, Prompt, ServerSession, SessionState},
    suite::{TestCase, TestSuite},
};

/// Score at or above which a failed case still counts as partial.
pub const PARTIAL_SCORE: f64 = 0.5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointMode {
    /// Render locally and send the prompt to the raw completion endpoint.
    #[default]
    Completion,
    /// Send messages and tools to the chat endpoint; the server applies its own template.
    Chat,
}

impl fmt::Display for EndpointMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointMode::Completion => f.write_str("completion"),
            EndpointMode::Chat => f.write_str("chat"),
        }
    }
}

impl FromStr for EndpointMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "completion" | "raw" => Ok(EndpointMode::Completion),
            "chat" => Ok(EndpointMode::Chat),
            other => Err(format!("unknown endpoint mode '{other}' (expected completion or chat)")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub mode: EndpointMode,
    pub request_timeout_ms: u64,
    pub temperature: f32,
    pub max_tokens: u32,
    pub partial_threshold: f64,
    pub render: RenderOptions,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            mode: EndpointMode::default(),
            request_timeout_ms: 60_000,
            temperature: 0.0,
            max_tokens: 256,
            partial_threshold: Scorer::default().partial_threshold,
            render: RenderOptions::default(),
        }
    }
}

impl EvalConfig {
    pub fn with_mode(mut self, mode: EndpointMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_partial_threshold(mut self, threshold: f64) -> Self {
        self.partial_threshold = threshold;
        self
    }

    pub fn with_render_options(mut self, render: RenderOptions) -> Self {
        self.render = render;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseOutcome {
    pub category: Category,
    pub result: Arc<ScoreResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<ToolCallAttempt>,
}

impl CaseOutcome {
    fn failed(case: &TestCase, reason: Reason, latency: Duration) -> Self {
        Self {
            category: case.category,
            result: Arc::new(ScoreResult::failed(&case.id, reason)),
            raw_output: None,
            latency_ms: latency.as_millis() as u64,
            attempts: Vec::new(),
        }
    }

    pub fn case_id(&self) -> &str {
        &self.result.case_id
    }
}

/// Everything one template earned on one suite, in suite order.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateEvaluation {
    pub outcomes: Vec<CaseOutcome>,
    /// Mean case score in [0, 1].
    pub score: f64,
    pub per_category: BTreeMap<Category, f64>,
    pub passed: usize,
    pub partial: usize,
    pub failed: usize,
    /// The session could not be recovered and some cases were never run.
    pub aborted: bool,
}

impl TemplateEvaluation {
    pub fn from_outcomes(outcomes: Vec<CaseOutcome>, aborted: bool) -> Self {
        let mut sums: BTreeMap<Category, (f64, usize)> = BTreeMap::new();
        let (mut passed, mut partial, mut failed) = (0, 0, 0);
        for outcome in &outcomes {
            let entry = sums.entry(outcome.category).or_insert((0.0, 0));
            entry.0 += outcome.result.score;
            entry.1 += 1;

            if outcome.result.passed {
                passed += 1;
            } else if outcome.result.score >= PARTIAL_SCORE {
                partial += 1;
            } else {
                failed += 1;
            }
        }

        let score = if outcomes.is_empty() {
            0.0
        } else {
            outcomes.iter().map(|o| o.result.score).sum::<f64>() / outcomes.len() as f64
        };
        let per_category = sums
            .into_iter()
            .map(|(category, (sum, count))| (category, sum / count as f64))
            .collect();

        Self {
            outcomes,
            score,
            per_category,
            passed,
            partial,
            failed,
            aborted,
        }
    }

    /// Score on the 0-100 scale used in summaries.
    pub fn display_score(&self) -> f64 {
        self.score * 100.0
    }

    pub fn min_category_score(&self) -> f64 {
        self.per_category
            .values()
            .copied()
            .reduce(f64::min)
            .unwrap_or(0.0)
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn results(&self) -> impl Iterator<Item = &Arc<ScoreResult>> {
        self.outcomes.iter().map(|outcome| &outcome.result)
    }
}

enum CaseRun {
    Scored(CaseOutcome),
    SessionFailed(SessionError),
}

#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    renderer: Renderer,
    scorer: Scorer,
    config: EvalConfig,
}

impl Evaluator {
    pub fn new(config: EvalConfig) -> Self {
        Self {
            renderer: Renderer::new(config.render.clone()),
            scorer: Scorer::new(config.partial_threshold),
            config,
        }
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn scorer(&self) -> &Scorer {
        &self.scorer
    }

    pub async fn evaluate(
        &self,
        session: &mut ServerSession,
        template: &str,
        suite: &TestSuite,
    ) -> TemplateEvaluation {
        if let Err(error) = self.renderer.check(template) {
            warn!(%error, "template does not parse; failing every case");
            let outcomes = suite
                .iter()
                .map(|case| {
                    CaseOutcome::failed(
                        case,
                        Reason::TemplateSyntax {
                            message: error.message.clone(),
                        },
                        Duration::ZERO,
                    )
                })
                .collect();
            return TemplateEvaluation::from_outcomes(outcomes, false);
        }

        if !session.is_ready() {
            if let Err(error) = self.recover(session).await {
                return self.abort_from(suite.cases(), Vec::new(), &error);
            }
        }

        let started = Instant::now();
        let mut outcomes = Vec::with_capacity(suite.len());
        for (index, case) in suite.iter().enumerate() {
            let error = match self.run_case(session, template, case).await {
                CaseRun::Scored(outcome) => {
                    outcomes.push(outcome);
                    continue;
                }
                CaseRun::SessionFailed(error) => error,
            };

            warn!(case = %case.id, %error, "session failed; restarting and retrying the case");
            let retry = match self.recover(session).await {
                Ok(()) => self.run_case(session, template, case).await,
                Err(restart_error) => CaseRun::SessionFailed(restart_error),
            };
            match retry {
                CaseRun::Scored(outcome) => outcomes.push(outcome),
                CaseRun::SessionFailed(error) => {
                    // Leave the session usable for the next template if at all possible.
                    if let Err(restart_error) = self.recover(session).await {
                        warn!(%restart_error, "session could not be restarted");
                    }
                    return self.abort_from(&suite.cases()[index..], outcomes, &error);
                }
            }
        }

        let evaluation = TemplateEvaluation::from_outcomes(outcomes, false);
        info!(
            cases = evaluation.total(),
            passed = evaluation.passed,
            score = evaluation.display_score(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "template evaluated"
        );
        evaluation
    }

    /// Evaluates `templates` with at most one in-flight evaluation per session.
    /// Results come back in `templates` order.
    pub async fn evaluate_batch(
        &self,
        sessions: &mut [ServerSession],
        templates: &[Arc<str>],
        suite: &TestSuite,
    ) -> Vec<TemplateEvaluation> {
        let next = AtomicUsize::new(0);
        let mut workers = FuturesUnordered::new();
        for session in sessions.iter_mut() {
            let next = &next;
            workers.push(async move {
                let mut done = Vec::new();
                loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(template) = templates.get(index) else {
                        break;
                    };
                    done.push((index, self.evaluate(session, template, suite).await));
                }
                done
            });
        }

        let mut indexed = Vec::with_capacity(templates.len());
        while let Some(done) = workers.next().await {
            indexed.extend(done);
        }
        indexed.sort_by_key(|(index, _)| *index);
        indexed.into_iter().map(|(_, evaluation)| evaluation).collect()
    }

    /// Builds the request for one case. The template is rendered in both modes
    /// so a template that cannot render the conversation fails the case either way.
    pub fn build_request(
        &self,
        template: &str,
        case: &TestCase,
    ) -> Result<InferenceRequest, TemplateSyntaxError> {
        let rendered = self.renderer.render(template, &case.messages, &case.tools)?;
        let prompt = match self.config.mode {
            EndpointMode::Completion => Prompt::Text(rendered),
            EndpointMode::Chat => Prompt::Chat {
                messages: case.messages.clone(),
                tools: case.tools.clone(),
            },
        };
        Ok(InferenceRequest::new(prompt)
            .with_temperature(self.config.temperature)
            .with_max_tokens(self.config.max_tokens))
    }

    async fn run_case(&self, session: &mut ServerSession, template: &str, case: &TestCase) -> CaseRun {
        let request = match self.build_request(template, case) {
            Ok(request) => request,
            Err(error) => {
                debug!(case = %case.id, %error, "conversation does not render");
                return CaseRun::Scored(CaseOutcome::failed(
                    case,
                    Reason::TemplateSyntax {
                        message: error.message,
                    },
                    Duration::ZERO,
                ));
            }
        };

        let started = Instant::now();
        let outcome = session.complete(&request, self.config.request_timeout()).await;
        let latency = started.elapsed();

        let output = match outcome {
            Ok(output) => output,
            Err(error) if session.state() == SessionState::Failed => {
                return CaseRun::SessionFailed(error)
            }
            Err(SessionError::NotReady(state)) => {
                return CaseRun::SessionFailed(SessionError::NotReady(state))
            }
            Err(SessionError::RequestTimeout(after)) => {
                debug!(case = %case.id, after_ms = after.as_millis() as u64, "request timed out");
                return CaseRun::Scored(CaseOutcome::failed(
                    case,
                    Reason::RequestTimeout {
                        after_ms: after.as_millis() as u64,
                    },
                    latency,
                ));
            }
            Err(error) => {
                debug!(case = %case.id, %error, "request failed");
                return CaseRun::Scored(CaseOutcome::failed(
                    case,
                    Reason::Transport {
                        message: error.to_string(),
                    },
                    latency,
                ));
            }
        };

        let attempts = extract_output(&output);
        let result = self.scorer.score(case, &attempts);
        debug!(
            case = %case.id,
            attempts = attempts.len(),
            score = result.score,
            passed = result.passed,
            "case scored"
        );

        CaseRun::Scored(CaseOutcome {
            category: case.category,
            result: Arc::new(result),
            raw_output: Some(output.raw_text()),
            latency_ms: latency.as_millis() as u64,
            attempts,
        })
    }

    async fn recover(&self, session: &mut ServerSession) -> Result<(), SessionError> {
        match session.state() {
            SessionState::Ready => Ok(()),
            SessionState::Uninitialized => session.start().await,
            _ => session.restart().await,
        }
    }

    fn abort_from(
        &self,
        remaining: &[TestCase],
        mut outcomes: Vec<CaseOutcome>,
        error: &SessionError,
    ) -> TemplateEvaluation {
        warn!(
            %error,
            skipped = remaining.len(),
            "session unavailable; scoring remaining cases as aborted"
        );
        outcomes.extend(remaining.iter().map(|case| {
            CaseOutcome::failed(
                case,
                Reason::Aborted {
                    message: error.to_string(),
                },
                Duration::ZERO,
            )
        }));
        TemplateEvaluation::from_outcomes(outcomes, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ModelOutput, ScriptedBackend, SessionConfig};

    const PLAIN: &str = "{% for message in messages %}{{ message.role }}: {{ message.content }}\n{% endfor %}";

    fn session(backend: Arc<ScriptedBackend>) -> ServerSession {
        ServerSession::new(
            backend,
            SessionConfig::default()
                .with_readiness_retries(2)
                .with_backoff(Duration::from_millis(1), Duration::from_millis(1)),
        )
    }

    fn weather_suite() -> TestSuite {
        TestSuite::builtin()
            .unwrap()
            .filter_categories(&[Category::Basic])
    }

    #[tokio::test]
    async fn unparsable_template_fails_every_case() {
        let backend = Arc::new(ScriptedBackend::from_texts(Vec::<String>::new()));
        let mut session = session(backend.clone());
        let suite = weather_suite();

        let evaluation = Evaluator::default()
            .evaluate(&mut session, "{% for message in messages %}", &suite)
            .await;

        assert_eq!(evaluation.failed, suite.len());
        assert_eq!(evaluation.score, 0.0);
        assert!(evaluation
            .results()
            .all(|r| matches!(r.reasons[0], Reason::TemplateSyntax { .. })));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn outcomes_follow_suite_order() {
        let backend = Arc::new(ScriptedBackend::from_fn(|request| {
            let prompt = request.prompt_text().unwrap_or_default();
            let city = ["Boston", "Tokyo", "Paris"]
                .into_iter()
                .find(|city| prompt.contains(city))
                .unwrap_or("Nowhere");
            Ok(ModelOutput::text(format!(
                r#"{{"name": "get_weather", "arguments": {{"location": "{city}"}}}}"#
            )))
        }));
        let mut session = session(backend);
        let suite = weather_suite();

        let evaluation = Evaluator::default().evaluate(&mut session, PLAIN, &suite).await;
        let ids: Vec<&str> = evaluation.outcomes.iter().map(CaseOutcome::case_id).collect();
        let expected: Vec<&str> = suite.iter().map(|case| case.id.as_str()).collect();
        assert_eq!(ids, expected);
        assert!(evaluation
            .outcomes
            .iter()
            .find(|o| o.case_id() == "basic/weather-lookup")
            .unwrap()
            .result
            .passed);
    }

    #[tokio::test]
    async fn chat_mode_sends_messages() {
        let backend = Arc::new(ScriptedBackend::from_fn(|request| {
            assert!(matches!(request.prompt, Prompt::Chat { .. }));
            Ok(ModelOutput::Native {
                content: None,
                calls: vec![crate::session::NativeCall {
                    name: "get_weather".to_string(),
                    arguments: serde_json::Value::String(r#"{"location": "Boston"}"#.to_string()),
                }],
            })
        }));
        let mut session = session(backend);
        let suite = TestSuite::new(vec![weather_suite()
            .get("basic/weather-lookup")
            .unwrap()
            .clone()])
        .unwrap();

        let evaluator = Evaluator::new(EvalConfig::default().with_mode(EndpointMode::Chat));
        let evaluation = evaluator.evaluate(&mut session, PLAIN, &suite).await;
        assert_eq!(evaluation.passed, 1);
        assert_eq!(evaluation.display_score(), 100.0);
    }

    #[tokio::test]
    async fn unrecoverable_session_aborts_the_rest() {
        let backend = Arc::new(ScriptedBackend::from_texts(Vec::<String>::new()));
        backend.set_healthy(false);
        let mut session = session(backend);
        let suite = weather_suite();

        let evaluation = Evaluator::default().evaluate(&mut session, PLAIN, &suite).await;
        assert!(evaluation.aborted);
        assert_eq!(evaluation.total(), suite.len());
        assert!(evaluation
            .results()
            .all(|r| !r.passed && matches!(r.reasons[0], Reason::Aborted { .. })));
    }

    #[test]
    fn aggregates_counts_and_categories() {
        let outcome = |id: &str, category, score: f64, passed| CaseOutcome {
            category,
            result: Arc::new(ScoreResult {
                case_id: id.to_string(),
                passed,
                score,
                reasons: Vec::new(),
                notes: Vec::new(),
            }),
            raw_output: None,
            latency_ms: 0,
            attempts: Vec::new(),
        };
        let evaluation = TemplateEvaluation::from_outcomes(
            vec![
                outcome("a", Category::Basic, 1.0, true),
                outcome("b", Category::Basic, 0.5, false),
                outcome("c", Category::Complex, 0.0, false),
            ],
            false,
        );
        assert_eq!((evaluation.passed, evaluation.partial, evaluation.failed), (1, 1, 1));
        assert_eq!(evaluation.per_category[&Category::Basic], 0.75);
        assert_eq!(evaluation.min_category_score(), 0.0);
        assert!((evaluation.score - 0.5).abs() < 1e-12);
    }

    #[test]
    fn endpoint_mode_parses() {
        assert_eq!("chat".parse::<EndpointMode>().unwrap(), EndpointMode::Chat);
        assert_eq!("Completion".parse::<EndpointMode>().unwrap(), EndpointMode::Completion);
        assert!("grpc".parse::<EndpointMode>().is_err());
    }
}
