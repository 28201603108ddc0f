//! Generational template search.
//!
//! Generation 0 holds the seed templates. Every later generation keeps the
//! top survivors, asks the [`MutationEngine`] for offspring of each, evaluates
//! the offspring and trims survivors plus offspring back to the population
//! width. All random choices come from one `StdRng`, so a recorded seed
//! replays the same search against a deterministic backend.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
    time::Duration,
};

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    eval::{Evaluator, TemplateEvaluation},
    mutate::MutationEngine,
    score::Category,
    session::ServerSession,
    suite::TestSuite,
    template::TemplateStore,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Generations after the seed generation.
    pub generations: usize,
    pub population_width: usize,
    pub survivors: usize,
    pub offspring_per_survivor: usize,
    /// Extra attempts per offspring slot after an invalid or duplicate mutation.
    pub max_retries: usize,
    pub plateau_generations: usize,
    pub epsilon: f64,
    pub compose_probability: f64,
    /// 0 derives a seed from the clock; the seed used is recorded in the run.
    pub seed: u64,
    pub parallelism: usize,
    pub wall_clock_budget_ms: Option<u64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            generations: 5,
            population_width: 6,
            survivors: 2,
            offspring_per_survivor: 3,
            max_retries: 4,
            plateau_generations: 2,
            epsilon: 1e-3,
            compose_probability: 0.25,
            seed: 0,
            parallelism: 1,
            wall_clock_budget_ms: None,
        }
    }
}

impl OptimizerConfig {
    pub fn with_generations(mut self, generations: usize) -> Self {
        self.generations = generations;
        self
    }

    pub fn with_population_width(mut self, width: usize) -> Self {
        self.population_width = width;
        self
    }

    pub fn with_survivors(mut self, survivors: usize) -> Self {
        self.survivors = survivors;
        self
    }

    pub fn with_offspring_per_survivor(mut self, offspring: usize) -> Self {
        self.offspring_per_survivor = offspring;
        self
    }

    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_plateau(mut self, generations: usize, epsilon: f64) -> Self {
        self.plateau_generations = generations;
        self.epsilon = epsilon;
        self
    }

    pub fn with_compose_probability(mut self, probability: f64) -> Self {
        self.compose_probability = probability;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_wall_clock_budget(mut self, budget: Duration) -> Self {
        self.wall_clock_budget_ms = Some(budget.as_millis() as u64);
        self
    }

    pub fn validate(&self) -> Result<(), OptimizeError> {
        let invalid = |message: &str| -> Result<(), OptimizeError> {
            Err(OptimizeError::InvalidConfig(message.to_string()))
        };
        if self.population_width == 0 {
            return invalid("population_width must be at least 1");
        }
        if self.survivors == 0 || self.survivors > self.population_width {
            return invalid("survivors must be between 1 and population_width");
        }
        if !(0.0..=1.0).contains(&self.compose_probability) {
            return invalid("compose_probability must be within [0, 1]");
        }
        if !(self.epsilon >= 0.0) {
            return invalid("epsilon must not be negative");
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum OptimizeError {
    #[error("invalid optimizer configuration: {0}")]
    InvalidConfig(String),

    #[error("no seed templates given")]
    NoSeeds,

    #[error("no server sessions given")]
    NoSessions,

    #[error("stopped ({0}) before any template was evaluated")]
    NothingEvaluated(StopReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    GenerationLimit,
    Plateau,
    Budget,
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StopReason::GenerationLimit => "generation limit",
            StopReason::Plateau => "plateau",
            StopReason::Budget => "wall-clock budget",
            StopReason::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// One evaluated template. Never changed after creation.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateVariant {
    pub id: String,
    #[serde(skip)]
    pub text: Arc<str>,
    pub generation: usize,
    pub parent: Option<String>,
    pub lineage_depth: usize,
    /// Operators applied since the seed, oldest first.
    pub operators: Vec<String>,
    pub score: f64,
    pub per_category: BTreeMap<Category, f64>,
    pub discovery_index: usize,
    #[serde(skip)]
    pub evaluation: Arc<TemplateEvaluation>,
}

impl TemplateVariant {
    pub fn min_category_score(&self) -> f64 {
        self.evaluation.min_category_score()
    }

    pub fn is_seed(&self) -> bool {
        self.parent.is_none()
    }
}

/// Best first: higher score, then higher weakest category, then shallower
/// lineage, then earlier discovery.
pub fn rank(a: &TemplateVariant, b: &TemplateVariant) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.min_category_score().total_cmp(&a.min_category_score()))
        .then_with(|| a.lineage_depth.cmp(&b.lineage_depth))
        .then_with(|| a.discovery_index.cmp(&b.discovery_index))
}

#[derive(Debug, Clone, Serialize)]
pub struct Population {
    pub generation: usize,
    /// Ranked, best first.
    pub members: Vec<Arc<TemplateVariant>>,
}

impl Population {
    fn ranked(generation: usize, mut members: Vec<Arc<TemplateVariant>>, width: usize) -> Self {
        members.sort_by(|a, b| rank(a, b));
        members.truncate(width);
        Self { generation, members }
    }

    pub fn best(&self) -> Option<&Arc<TemplateVariant>> {
        self.members.first()
    }

    pub fn mean_score(&self) -> f64 {
        if self.members.is_empty() {
            return 0.0;
        }
        self.members.iter().map(|m| m.score).sum::<f64>() / self.members.len() as f64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationSummary {
    pub generation: usize,
    pub best_id: String,
    pub best_score: f64,
    pub mean_score: f64,
    pub evaluated: usize,
    pub discarded: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationRun {
    pub seed: u64,
    pub stop_reason: StopReason,
    pub best: Arc<TemplateVariant>,
    /// Seed first, best last.
    pub lineage: Vec<Arc<TemplateVariant>>,
    pub history: Vec<GenerationSummary>,
    pub variants: Vec<Arc<TemplateVariant>>,
}

impl OptimizationRun {
    /// Seed variant the best one descends from.
    pub fn origin(&self) -> &Arc<TemplateVariant> {
        self.lineage.first().unwrap_or(&self.best)
    }

    pub fn improvement(&self) -> f64 {
        self.best.score - self.origin().score
    }
}

struct Candidate {
    id: String,
    text: Arc<str>,
    parent: Option<Arc<TemplateVariant>>,
    operator: Option<String>,
    discovery_index: usize,
}

pub struct Optimizer {
    config: OptimizerConfig,
    evaluator: Evaluator,
    mutations: MutationEngine,
    cancel: CancellationToken,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig, evaluator: Evaluator) -> Self {
        let mutations = MutationEngine::new(evaluator.renderer().clone());
        Self {
            config,
            evaluator,
            mutations,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Runs the search. `seeds` are `(id, template text)` pairs; duplicate texts
    /// are evaluated once.
    pub async fn run(
        &self,
        sessions: &mut [ServerSession],
        seeds: Vec<(String, String)>,
        suite: &TestSuite,
    ) -> Result<OptimizationRun, OptimizeError> {
        self.config.validate()?;
        if seeds.is_empty() {
            return Err(OptimizeError::NoSeeds);
        }
        if sessions.is_empty() {
            return Err(OptimizeError::NoSessions);
        }
        let active = self.config.parallelism.clamp(1, sessions.len());
        let sessions = &mut sessions[..active];

        let seed = match self.config.seed {
            0 => clock_seed(),
            seed => seed,
        };
        let mut rng = StdRng::seed_from_u64(seed);
        let deadline = self
            .config
            .wall_clock_budget_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        info!(seed, generations = self.config.generations, "starting template optimization");

        let mut store = TemplateStore::new();
        let mut discovered = 0usize;
        let mut candidates = Vec::new();
        for (id, text) in seeds {
            if store.contains_text(&text) {
                debug!(%id, "skipping duplicate seed template");
                continue;
            }
            let text = match store.insert(id.clone(), text) {
                Ok(text) => text,
                Err(error) => {
                    warn!(%error, "skipping seed template");
                    continue;
                }
            };
            candidates.push(Candidate {
                id,
                text,
                parent: None,
                operator: None,
                discovery_index: discovered,
            });
            discovered += 1;
        }
        if candidates.is_empty() {
            return Err(OptimizeError::NoSeeds);
        }

        let seeds = match self.evaluate(sessions, candidates, 0, suite, deadline).await {
            Ok(seeds) => seeds,
            Err(reason) => return Err(OptimizeError::NothingEvaluated(reason)),
        };
        let mut variants = seeds.clone();
        let mut population = Population::ranked(0, seeds, self.config.population_width);
        let mut best = population
            .best()
            .cloned()
            .ok_or(OptimizeError::NoSeeds)?;
        let mut history = vec![summarize(&population, variants.len(), 0)];
        log_generation(&history[0]);

        let mut stop_reason = StopReason::GenerationLimit;
        let mut stale_generations = 0usize;

        for generation in 1..=self.config.generations {
            if let Some(reason) = self.interrupted(deadline) {
                stop_reason = reason;
                break;
            }

            let survivors: Vec<_> = population
                .members
                .iter()
                .take(self.config.survivors)
                .cloned()
                .collect();

            let mut offspring = Vec::new();
            let mut discarded = 0usize;
            for parent in &survivors {
                for _ in 0..self.config.offspring_per_survivor {
                    match self.breed(parent, &mut rng, &mut store, generation, discovered) {
                        (Some(candidate), rejected) => {
                            discarded += rejected;
                            discovered += 1;
                            offspring.push(candidate);
                        }
                        (None, rejected) => discarded += rejected,
                    }
                }
            }

            let evaluated = offspring.len();
            let children = match self
                .evaluate(sessions, offspring, generation, suite, deadline)
                .await
            {
                Ok(children) => children,
                Err(reason) => {
                    stop_reason = reason;
                    break;
                }
            };
            variants.extend(children.iter().cloned());

            let mut members = survivors;
            members.extend(children);
            population = Population::ranked(generation, members, self.config.population_width);
            let summary = summarize(&population, evaluated, discarded);
            log_generation(&summary);
            history.push(summary);

            let Some(leader) = population.best() else {
                break;
            };
            let improvement = leader.score - best.score;
            if rank(leader, &best) == Ordering::Less {
                best = leader.clone();
            }
            if improvement > self.config.epsilon {
                stale_generations = 0;
            } else {
                stale_generations += 1;
                if stale_generations >= self.config.plateau_generations {
                    stop_reason = StopReason::Plateau;
                    break;
                }
            }
        }

        let lineage = lineage_of(&best, &variants);
        info!(
            seed,
            reason = %stop_reason,
            best = %best.id,
            score = best.score,
            variants = variants.len(),
            "optimization finished"
        );

        Ok(OptimizationRun {
            seed,
            stop_reason,
            best,
            lineage,
            history,
            variants,
        })
    }

    /// Produces at most one valid, never-seen offspring of `parent`, returning
    /// it with the number of rejected attempts.
    fn breed(
        &self,
        parent: &Arc<TemplateVariant>,
        rng: &mut StdRng,
        store: &mut TemplateStore,
        generation: usize,
        discovery_index: usize,
    ) -> (Option<Candidate>, usize) {
        let mut rejected = 0;
        for _ in 0..=self.config.max_retries {
            let operator = self
                .mutations
                .random_operator(rng, self.config.compose_probability);
            let mutation_seed: u64 = rng.gen();

            let text = match self.mutations.mutate(&parent.text, &operator, mutation_seed) {
                Ok(text) => text,
                Err(error) => {
                    debug!(parent = %parent.id, %operator, %error, "discarding invalid mutation");
                    rejected += 1;
                    continue;
                }
            };
            if store.contains_text(&text) {
                debug!(parent = %parent.id, %operator, "discarding duplicate mutation");
                rejected += 1;
                continue;
            }

            let id = format!("g{generation}-v{discovery_index}");
            match store.insert(id.clone(), text) {
                Ok(text) => {
                    return (
                        Some(Candidate {
                            id,
                            text,
                            parent: Some(parent.clone()),
                            operator: Some(operator.to_string()),
                            discovery_index,
                        }),
                        rejected,
                    )
                }
                Err(error) => {
                    warn!(%error, "template store rejected offspring");
                    rejected += 1;
                }
            }
        }
        (None, rejected)
    }

    async fn evaluate(
        &self,
        sessions: &mut [ServerSession],
        candidates: Vec<Candidate>,
        generation: usize,
        suite: &TestSuite,
        deadline: Option<Instant>,
    ) -> Result<Vec<Arc<TemplateVariant>>, StopReason> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let texts: Vec<Arc<str>> = candidates.iter().map(|c| c.text.clone()).collect();

        let budget = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        let evaluations = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(StopReason::Cancelled),
            _ = budget => return Err(StopReason::Budget),
            evaluations = self.evaluator.evaluate_batch(sessions, &texts, suite) => evaluations,
        };

        Ok(candidates
            .into_iter()
            .zip(evaluations)
            .map(|(candidate, evaluation)| {
                let (lineage_depth, mut operators) = match &candidate.parent {
                    Some(parent) => (parent.lineage_depth + 1, parent.operators.clone()),
                    None => (0, Vec::new()),
                };
                operators.extend(candidate.operator);
                Arc::new(TemplateVariant {
                    id: candidate.id,
                    text: candidate.text,
                    generation,
                    parent: candidate.parent.map(|parent| parent.id.clone()),
                    lineage_depth,
                    operators,
                    score: evaluation.score,
                    per_category: evaluation.per_category.clone(),
                    discovery_index: candidate.discovery_index,
                    evaluation: Arc::new(evaluation),
                })
            })
            .collect())
    }

    fn interrupted(&self, deadline: Option<Instant>) -> Option<StopReason> {
        if self.cancel.is_cancelled() {
            return Some(StopReason::Cancelled);
        }
        match deadline {
            Some(deadline) if Instant::now() >= deadline => Some(StopReason::Budget),
            _ => None,
        }
    }
}

fn clock_seed() -> u64 {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    (nanos as u64).max(1)
}

fn summarize(population: &Population, evaluated: usize, discarded: usize) -> GenerationSummary {
    let (best_id, best_score) = population
        .best()
        .map(|best| (best.id.clone(), best.score))
        .unwrap_or_default();
    GenerationSummary {
        generation: population.generation,
        best_id,
        best_score,
        mean_score: population.mean_score(),
        evaluated,
        discarded,
    }
}

fn log_generation(summary: &GenerationSummary) {
    info!(
        generation = summary.generation,
        best = %summary.best_id,
        best_score = summary.best_score,
        mean_score = summary.mean_score,
        evaluated = summary.evaluated,
        discarded = summary.discarded,
        "generation complete"
    );
}

fn lineage_of(
    best: &Arc<TemplateVariant>,
    variants: &[Arc<TemplateVariant>],
) -> Vec<Arc<TemplateVariant>> {
    let by_id: HashMap<&str, &Arc<TemplateVariant>> =
        variants.iter().map(|v| (v.id.as_str(), v)).collect();
    let mut lineage = vec![best.clone()];
    let mut current = best;
    while let Some(parent) = current.parent.as_deref().and_then(|id| by_id.get(id).copied()) {
        lineage.push(parent.clone());
        current = parent;
    }
    lineage.reverse();
    lineage
}
