//! Results artifact and human-readable summary.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use handlebars::{no_escape, Handlebars, RenderError};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::{
    eval::{EndpointMode, TemplateEvaluation},
    optimize::{GenerationSummary, OptimizationRun, StopReason},
    score::Category,
    template::{save_template, template_diff},
};

const SUMMARY_TEMPLATE: &str = r#"Tool-calling evaluation
Endpoint: {{endpoint}} ({{mode}})
Template: {{template}}

{{#each cases}}
{{status}} {{id}} [{{category}}] {{score}}
{{#each reasons}}
    - {{this}}
{{/each}}
{{/each}}

Categories:
{{#each categories}}
  {{name}}: {{score}}
{{/each}}

Score: {{score}}/100 ({{passed}} passed, {{partial}} partial, {{failed}} failed of {{total}})
{{#if optimization}}

Optimization (seed {{optimization.seed}}, stopped: {{optimization.stop_reason}})
{{#each optimization.generations}}
  gen {{generation}}: best {{best}} mean {{mean}} ({{evaluated}} evaluated, {{discarded}} discarded)
{{/each}}
Best: {{optimization.best_id}} {{optimization.best_score}} (seed {{optimization.seed_score}}, {{optimization.improvement}})
Lineage: {{optimization.lineage}}
{{/if}}
"#;

#[derive(Debug, Clone, Serialize)]
pub struct CaseRecord {
    pub id: String,
    pub category: Category,
    pub passed: bool,
    pub score: f64,
    pub reasons: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LineageStep {
    pub id: String,
    pub generation: usize,
    pub operators: Vec<String>,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationRecord {
    pub seed: u64,
    pub stop_reason: StopReason,
    pub best_id: String,
    pub best_score: f64,
    pub seed_score: f64,
    pub improvement: f64,
    pub variants: usize,
    pub generations: Vec<GenerationSummary>,
    pub lineage: Vec<LineageStep>,
}

impl From<&OptimizationRun> for OptimizationRecord {
    fn from(run: &OptimizationRun) -> Self {
        Self {
            seed: run.seed,
            stop_reason: run.stop_reason,
            best_id: run.best.id.clone(),
            best_score: run.best.score,
            seed_score: run.origin().score,
            improvement: run.improvement(),
            variants: run.variants.len(),
            generations: run.history.clone(),
            lineage: run
                .lineage
                .iter()
                .map(|variant| LineageStep {
                    id: variant.id.clone(),
                    generation: variant.generation,
                    operators: variant.operators.clone(),
                    score: variant.score,
                })
                .collect(),
        }
    }
}

/// Contents of `results_<timestamp>.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub endpoint: String,
    pub template: String,
    pub mode: EndpointMode,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// 0-100.
    pub score: f64,
    pub passed: usize,
    pub partial: usize,
    pub failed: usize,
    pub total: usize,
    pub aborted: bool,
    pub per_category: BTreeMap<Category, f64>,
    pub cases: Vec<CaseRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimization: Option<OptimizationRecord>,
}

impl RunReport {
    pub fn from_evaluation(
        endpoint: impl Into<String>,
        template: impl Into<String>,
        mode: EndpointMode,
        evaluation: &TemplateEvaluation,
    ) -> Self {
        let cases = evaluation
            .outcomes
            .iter()
            .map(|outcome| CaseRecord {
                id: outcome.result.case_id.clone(),
                category: outcome.category,
                passed: outcome.result.passed,
                score: outcome.result.score,
                reasons: outcome.result.reasons.iter().map(ToString::to_string).collect(),
                notes: outcome.result.notes.iter().map(ToString::to_string).collect(),
                raw_output: outcome.raw_output.clone(),
                latency_ms: outcome.latency_ms,
            })
            .collect();

        Self {
            endpoint: endpoint.into(),
            template: template.into(),
            mode,
            timestamp: Utc::now(),
            seed: None,
            score: evaluation.display_score(),
            passed: evaluation.passed,
            partial: evaluation.partial,
            failed: evaluation.failed,
            total: evaluation.total(),
            aborted: evaluation.aborted,
            per_category: evaluation.per_category.clone(),
            cases,
            optimization: None,
        }
    }

    /// Report for an optimization run; case records are the best variant's.
    pub fn from_optimization(
        endpoint: impl Into<String>,
        template: impl Into<String>,
        mode: EndpointMode,
        run: &OptimizationRun,
    ) -> Self {
        let mut report = Self::from_evaluation(endpoint, template, mode, &run.best.evaluation);
        report.seed = Some(run.seed);
        report.optimization = Some(OptimizationRecord::from(run));
        report
    }

    pub fn file_name(&self) -> String {
        format!("results_{}.json", self.timestamp.format("%Y%m%d_%H%M%S"))
    }

    pub fn write_json(&self, dir: &Path) -> std::io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    pub fn render_summary(&self) -> Result<String, RenderError> {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(no_escape);
        handlebars.render_template(SUMMARY_TEMPLATE, &self.summary_view())
    }

    fn summary_view(&self) -> Value {
        let cases: Vec<Value> = self
            .cases
            .iter()
            .map(|case| {
                let status = if case.passed {
                    "PASS"
                } else if case.score >= crate::eval::PARTIAL_SCORE {
                    "PART"
                } else {
                    "FAIL"
                };
                json!({
                    "status": status,
                    "id": case.id,
                    "category": case.category,
                    "score": format!("{:.2}", case.score),
                    "reasons": case.reasons,
                })
            })
            .collect();
        let categories: Vec<Value> = self
            .per_category
            .iter()
            .map(|(category, score)| json!({ "name": category, "score": format!("{:.2}", score) }))
            .collect();

        let optimization = self.optimization.as_ref().map(|record| {
            json!({
                "seed": record.seed,
                "stop_reason": record.stop_reason.to_string(),
                "best_id": record.best_id,
                "best_score": format!("{:.3}", record.best_score),
                "seed_score": format!("{:.3}", record.seed_score),
                "improvement": format!("{:+.3}", record.improvement),
                "generations": record.generations.iter().map(|g| json!({
                    "generation": g.generation,
                    "best": format!("{:.3}", g.best_score),
                    "mean": format!("{:.3}", g.mean_score),
                    "evaluated": g.evaluated,
                    "discarded": g.discarded,
                })).collect::<Vec<_>>(),
                "lineage": record
                    .lineage
                    .iter()
                    .map(|step| match step.operators.last() {
                        Some(operator) => format!("{} ({operator})", step.id),
                        None => step.id.clone(),
                    })
                    .collect::<Vec<_>>()
                    .join(" -> "),
            })
        });

        json!({
            "endpoint": self.endpoint,
            "mode": self.mode.to_string(),
            "template": self.template,
            "cases": cases,
            "categories": categories,
            "score": format!("{:.1}", self.score),
            "passed": self.passed,
            "partial": self.partial,
            "failed": self.failed,
            "total": self.total,
            "optimization": optimization,
        })
    }
}

/// Files written for the best template of an optimization run.
#[derive(Debug, Clone)]
pub struct SavedTemplate {
    pub template: PathBuf,
    pub metadata: PathBuf,
    pub diff: PathBuf,
}

/// Writes `best_template.jinja`, its metadata as `best_template.json`, and a
/// unified diff against the seed it descends from.
pub fn save_best(dir: &Path, run: &OptimizationRun) -> std::io::Result<SavedTemplate> {
    let base = dir.join("best_template.jinja");
    let template = save_template(&base, &run.best.text, None)?;

    let mut metadata = Map::new();
    metadata.insert("id".to_string(), json!(run.best.id));
    metadata.insert("seed".to_string(), json!(run.seed));
    metadata.insert("score".to_string(), json!(run.best.score));
    metadata.insert("per_category".to_string(), serde_json::to_value(&run.best.per_category)?);
    metadata.insert("operators".to_string(), json!(run.best.operators));
    metadata.insert(
        "lineage".to_string(),
        json!(run.lineage.iter().map(|v| v.id.as_str()).collect::<Vec<_>>()),
    );
    let metadata = save_template(&base, &run.best.text, Some(&metadata))?;

    let diff = dir.join("best_template.diff");
    fs::write(&diff, template_diff(&run.origin().text, &run.best.text))?;

    Ok(SavedTemplate {
        template,
        metadata,
        diff,
    })
}
