//! Active learning loop: lattice seed, then select → query → refit.

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::gateway::{Judge, RetryPolicy};
use crate::prompts::{PromptTemplate, DEFAULT_SYSTEM_MESSAGE};
use crate::thurstonian::{self, Comparison, FitConfig, FitError, Utility};

use super::graph::{GraphError, PreferenceGraph};
use super::query::{
    query_and_add, BatchSummary, QueryError, QuerySettings, DEFAULT_CONCURRENCY_LIMIT,
    DEFAULT_SAMPLES_PER_PROMPT,
};
use super::sampler::select_new_pairs;
use super::trace::TraceSink;

#[derive(Debug, thiserror::Error)]
pub enum LearnError {
    #[error("invalid learner config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Fit(#[from] FitError),
}

#[derive(Debug, Clone)]
pub struct LearnerConfig {
    pub system_message: String,
    pub num_epochs: usize,
    pub learning_rate: f64,
    /// Scales the `n * log2(n)` edge budget.
    pub edge_multiplier: f64,
    /// Ring-lattice degree for the seed batch. Must be even; at or above the
    /// option count the seed batch is every pair.
    pub degree: usize,
    pub num_edges_per_iter: usize,
    /// Mean-gap percentile cut for active selection (0..=100).
    pub percentile_p: f64,
    /// Degree-sum percentile cut for active selection (0..=100).
    pub percentile_q: f64,
    /// Completions per prompt.
    pub k: usize,
    pub seed: u64,
    pub concurrency_limit: usize,
    pub retry: RetryPolicy,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            system_message: DEFAULT_SYSTEM_MESSAGE.to_string(),
            num_epochs: 500,
            learning_rate: 0.01,
            edge_multiplier: 1.0,
            degree: 2,
            num_edges_per_iter: 200,
            percentile_p: 10.0,
            percentile_q: 20.0,
            k: DEFAULT_SAMPLES_PER_PROMPT,
            seed: 42,
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            retry: RetryPolicy::default(),
        }
    }
}

impl LearnerConfig {
    pub fn validate(&self) -> Result<(), LearnError> {
        let bad = |msg: &str| Err(LearnError::InvalidConfig(msg.to_string()));
        if self.num_edges_per_iter == 0 {
            return bad("num_edges_per_iter must be >= 1");
        }
        if !(self.edge_multiplier.is_finite() && self.edge_multiplier > 0.0) {
            return bad("edge_multiplier must be a positive number");
        }
        if self.k == 0 {
            return bad("k must be >= 1");
        }
        if self.concurrency_limit == 0 {
            return bad("concurrency_limit must be >= 1");
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return bad("learning_rate must be a positive number");
        }
        for q in [self.percentile_p, self.percentile_q] {
            if !(0.0..=100.0).contains(&q) {
                return bad("percentiles must be in [0, 100]");
            }
        }
        Ok(())
    }

    fn fit_config(&self, fit_index: u64) -> FitConfig {
        FitConfig {
            num_epochs: self.num_epochs,
            learning_rate: self.learning_rate,
            seed: self.seed.wrapping_add(fit_index),
        }
    }

    fn query_settings(&self, template: &PromptTemplate, entity: Option<&str>) -> QuerySettings {
        QuerySettings {
            template: template.clone(),
            entity: entity.map(str::to_string),
            system_message: self.system_message.clone(),
            k: self.k,
            concurrency_limit: self.concurrency_limit,
            retry: self.retry,
        }
    }
}

/// Edge budget for `n` options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgePlan {
    pub target_edges: usize,
    pub initial_edges: usize,
    pub iterations: usize,
}

impl EdgePlan {
    /// `target = ceil(multiplier * n * log2 n)`, seeded by `n * degree / 2`
    /// lattice edges (at most every pair), the rest split into
    /// `ceil(remaining / per_iter)` rounds.
    pub fn new(n: usize, edge_multiplier: f64, degree: usize, num_edges_per_iter: usize) -> Self {
        let target_edges = if n < 2 {
            0
        } else {
            let nf = n as f64;
            (edge_multiplier * nf * nf.log2()).ceil().max(0.0) as usize
        };
        let initial_edges = (n * degree / 2).min(n * n.saturating_sub(1) / 2);
        let remaining = target_edges.saturating_sub(initial_edges);
        let iterations = remaining.div_ceil(num_edges_per_iter.max(1));
        Self {
            target_edges,
            initial_edges,
            iterations,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every planned iteration ran.
    Completed,
    /// The training pool had no unqueried pairs left.
    NoCandidates,
}

#[derive(Debug, Clone)]
pub struct LearnOutcome {
    /// Indexed by option id.
    pub utilities: Vec<Utility>,
    pub plan: EdgePlan,
    pub iterations_run: usize,
    pub stop_reason: StopReason,
    pub edges: usize,
    pub batches: Vec<BatchSummary>,
}

pub struct ThurstonianActiveLearner {
    config: LearnerConfig,
}

impl ThurstonianActiveLearner {
    pub fn new(config: LearnerConfig) -> Result<Self, LearnError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &LearnerConfig {
        &self.config
    }

    /// Run the full loop against `judge` and return the latest utilities.
    pub async fn fit<J: Judge + ?Sized>(
        &self,
        graph: &mut PreferenceGraph,
        judge: &J,
        template: &PromptTemplate,
        entity: Option<&str>,
        trace: Option<&dyn TraceSink>,
    ) -> Result<LearnOutcome, LearnError> {
        let cfg = &self.config;
        let n = graph.len();
        let plan = EdgePlan::new(n, cfg.edge_multiplier, cfg.degree, cfg.num_edges_per_iter);
        let settings = cfg.query_settings(template, entity);
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let mut batches = Vec::with_capacity(plan.iterations + 1);

        tracing::info!(
            options = n,
            target_edges = plan.target_edges,
            initial_edges = plan.initial_edges,
            iterations = plan.iterations,
            "Starting active learning"
        );

        let seed_pairs = if cfg.degree % 2 == 0 && cfg.degree >= n {
            graph.complete_graph()
        } else {
            graph.sample_regular_graph(cfg.degree)?
        };
        batches.push(query_and_add(graph, judge, &seed_pairs, &settings, trace).await?);

        let mut fit_index = 0u64;
        let mut utilities = fit_graph(graph, &cfg.fit_config(fit_index))?;
        let mut iterations_run = 0;
        let mut stop_reason = StopReason::Completed;

        for iteration in 1..=plan.iterations {
            let existing = graph.edges().keys().copied().collect();
            let pairs = select_new_pairs(
                &utilities,
                &existing,
                graph.training_pool(),
                cfg.num_edges_per_iter,
                cfg.percentile_p,
                cfg.percentile_q,
                &mut rng,
            );
            if pairs.is_empty() {
                stop_reason = StopReason::NoCandidates;
                break;
            }

            let summary = query_and_add(graph, judge, &pairs, &settings, trace).await?;
            fit_index += 1;
            utilities = fit_graph(graph, &cfg.fit_config(fit_index))?;
            iterations_run = iteration;

            tracing::info!(
                iteration,
                of = plan.iterations,
                queried = summary.pairs_requested,
                edges = graph.edges().len(),
                "Active learning iteration done"
            );
            batches.push(summary);
        }

        tracing::info!(
            iterations_run,
            edges = graph.edges().len(),
            stop_reason = ?stop_reason,
            "Active learning finished"
        );

        Ok(LearnOutcome {
            utilities,
            plan,
            iterations_run,
            stop_reason,
            edges: graph.edges().len(),
            batches,
        })
    }
}

/// Fit utilities to the graph's current edges.
pub fn fit_graph(graph: &PreferenceGraph, config: &FitConfig) -> Result<Vec<Utility>, FitError> {
    let comparisons: Vec<Comparison> = graph
        .edges()
        .values()
        .map(|e| Comparison {
            a: e.option_a,
            b: e.option_b,
            probability_a: e.probability_a,
        })
        .collect();
    thurstonian::fit(graph.len(), &comparisons, config)
}
