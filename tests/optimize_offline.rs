use std::{sync::Arc, time::Duration};

use template_trainer::{
    Conversation, Evaluator, ModelOutput, Optimizer, OptimizerConfig, OptimizationRun, Renderer,
    ScriptedBackend, ServerSession, SessionConfig, StopReason, TestSuite,
};

const SEED: &str = "{% for message in messages %}{{ message.role }}: {{ message.content }}\n{% endfor %}{% if add_generation_prompt %}assistant: {% endif %}";

/// Answers well only when the prompt carries a strict format directive, and
/// almost right when it carries a worked example.
fn format_sensitive_backend() -> Arc<ScriptedBackend> {
    Arc::new(ScriptedBackend::from_fn(|request| {
        let prompt = request.prompt_text().unwrap_or_default();
        let reply = if prompt.contains("IMPORTANT:") {
            r#"<tool_call={"name": "get_weather", "arguments": {"location": "Boston"}}>"#
        } else if prompt.contains("Example") {
            r#"{"name": "get_weather", "arguments": {"location": "boston"}}"#
        } else {
            "Let me think about the weather in Boston."
        };
        Ok(ModelOutput::text(reply))
    }))
}

fn suite() -> TestSuite {
    let builtin = TestSuite::builtin().unwrap();
    TestSuite::new(vec![builtin.get("basic/weather-lookup").unwrap().clone()]).unwrap()
}

async fn run_with_seed(seed: u64) -> OptimizationRun {
    let mut sessions = vec![ServerSession::new(
        format_sensitive_backend(),
        SessionConfig::default(),
    )];
    let config = OptimizerConfig::default()
        .with_seed(seed)
        .with_generations(6)
        .with_plateau(6, 1e-3);
    Optimizer::new(config, Evaluator::default())
        .run(&mut sessions, vec![("seed".to_string(), SEED.to_string())], &suite())
        .await
        .unwrap()
}

#[tokio::test]
async fn search_finds_the_strict_format_directive() {
    let run = run_with_seed(42).await;

    assert_eq!(run.seed, 42);
    assert_eq!(run.origin().id, "seed");
    assert_eq!(run.origin().score, 0.0);
    assert_eq!(run.best.score, 1.0);
    assert!(run
        .best
        .operators
        .iter()
        .any(|operator| operator.contains("tighten-output-format-directive")));
    assert!(run.best.text.contains("IMPORTANT:"));
}

#[tokio::test]
async fn best_score_never_decreases() {
    let run = run_with_seed(7).await;

    let best_scores: Vec<f64> = run.history.iter().map(|h| h.best_score).collect();
    assert!(best_scores.windows(2).all(|pair| pair[1] >= pair[0]), "{best_scores:?}");
    let generations: Vec<usize> = run.history.iter().map(|h| h.generation).collect();
    assert!(generations.windows(2).all(|pair| pair[1] == pair[0] + 1));
    assert!(run.best.score >= run.origin().score);
}

#[tokio::test]
async fn lineage_links_seed_to_best() {
    let run = run_with_seed(3).await;

    assert_eq!(run.lineage.first().unwrap().id, "seed");
    assert_eq!(run.lineage.last().unwrap().id, run.best.id);
    for pair in run.lineage.windows(2) {
        assert_eq!(pair[1].parent.as_deref(), Some(pair[0].id.as_str()));
        assert_eq!(pair[1].lineage_depth, pair[0].lineage_depth + 1);
    }
}

#[tokio::test]
async fn every_variant_renders_the_smoke_test() {
    let run = run_with_seed(11).await;
    let renderer = Renderer::default();
    let smoke = Conversation::smoke_test();

    for variant in &run.variants {
        renderer
            .render_conversation(&variant.text, &smoke)
            .unwrap_or_else(|error| panic!("{} does not render: {error}", variant.id));
    }
    let mut texts: Vec<&str> = run.variants.iter().map(|v| v.text.as_ref()).collect();
    texts.sort_unstable();
    texts.dedup();
    assert_eq!(texts.len(), run.variants.len());
}

#[tokio::test]
async fn same_seed_replays_the_same_search() {
    let first = run_with_seed(2024).await;
    let second = run_with_seed(2024).await;

    assert_eq!(first.best.id, second.best.id);
    assert_eq!(first.best.text, second.best.text);
    assert_eq!(first.variants.len(), second.variants.len());
    for (a, b) in first.variants.iter().zip(&second.variants) {
        assert_eq!(a.text, b.text);
        assert_eq!(a.score, b.score);
    }
}

#[tokio::test(start_paused = true)]
async fn budget_stops_with_best_so_far() {
    let backend = Arc::new(
        ScriptedBackend::from_fn(|_| Ok(ModelOutput::text("no tools today")))
            .with_delay(Duration::from_secs(1)),
    );
    let mut sessions = vec![ServerSession::new(backend, SessionConfig::default())];
    let config = OptimizerConfig::default()
        .with_seed(9)
        .with_wall_clock_budget(Duration::from_millis(1_500));

    let run = Optimizer::new(config, Evaluator::default())
        .run(&mut sessions, vec![("seed".to_string(), SEED.to_string())], &suite())
        .await
        .unwrap();

    assert_eq!(run.stop_reason, StopReason::Budget);
    assert_eq!(run.best.id, "seed");
    assert_eq!(run.history.len(), 1);
}
