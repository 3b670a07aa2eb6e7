//! Concurrent judge queries and aggregation into edges.
//!
//! Each canonical pair is asked in both presentation orders, `k` samples per
//! prompt. Prompts are dispatched under a concurrency cap with every call
//! wrapped in the retry policy; the first call that exhausts its retries
//! aborts the whole batch. Edges are written only after the batch resolves.

use std::collections::BTreeMap;

use futures::stream::{self, StreamExt, TryStreamExt};

use crate::gateway::{Judge, ProviderError, RetryPolicy};
use crate::prompts::{to_messages, PromptTemplate, DEFAULT_SYSTEM_MESSAGE};

use super::graph::{CanonicalPair, Edge, GraphError, OrientedPair, PreferenceGraph};
use super::parse::{parse_forced_choice, Choice};
use super::trace::{now_epoch_ms, prompt_hash, QueryTrace, TraceError, TraceSink};

/// Unparseable share above which a batch is flagged.
pub const UNPARSEABLE_WARN_RATE: f64 = 0.5;

pub const DEFAULT_CONCURRENCY_LIMIT: usize = 30;
pub const DEFAULT_SAMPLES_PER_PROMPT: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("judge call failed: {0}")]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("trace error: {0}")]
    Trace(#[from] TraceError),
    #[error("invalid query settings: {0}")]
    InvalidSettings(String),
}

/// How prompts are rendered and dispatched.
#[derive(Debug, Clone)]
pub struct QuerySettings {
    pub template: PromptTemplate,
    /// Substituted for `{entity}` when present.
    pub entity: Option<String>,
    pub system_message: String,
    /// Completions requested per prompt.
    pub k: usize,
    pub concurrency_limit: usize,
    pub retry: RetryPolicy,
}

impl QuerySettings {
    pub fn new(template: PromptTemplate) -> Self {
        Self {
            template,
            entity: None,
            system_message: DEFAULT_SYSTEM_MESSAGE.to_string(),
            k: DEFAULT_SAMPLES_PER_PROMPT,
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            retry: RetryPolicy::default(),
        }
    }

    pub fn entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    pub fn validate(&self) -> Result<(), QueryError> {
        if self.k == 0 {
            return Err(QueryError::InvalidSettings("k must be >= 1".into()));
        }
        if self.concurrency_limit == 0 {
            return Err(QueryError::InvalidSettings(
                "concurrency_limit must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

/// Parsed replies for one rendered prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptOutcome {
    pub pair: OrientedPair,
    pub choices: Vec<Choice>,
}

/// Counts folded out of a batch of prompt outcomes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregation {
    pub edges: Vec<Edge>,
    /// Pairs with no valid reply in either orientation.
    pub dropped: Vec<CanonicalPair>,
    pub responses: usize,
    pub unparseable: usize,
}

impl Aggregation {
    pub fn unparseable_rate(&self) -> f64 {
        if self.responses == 0 {
            0.0
        } else {
            self.unparseable as f64 / self.responses as f64
        }
    }

    /// Strictly more than [`UNPARSEABLE_WARN_RATE`] of replies were unusable.
    pub fn exceeds_unparseable_threshold(&self) -> bool {
        self.unparseable_rate() > UNPARSEABLE_WARN_RATE
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub pairs_requested: usize,
    pub prompts: usize,
    pub responses: usize,
    pub unparseable: usize,
    pub edges_updated: usize,
    pub pairs_dropped: usize,
}

impl BatchSummary {
    pub fn unparseable_rate(&self) -> f64 {
        if self.responses == 0 {
            0.0
        } else {
            self.unparseable as f64 / self.responses as f64
        }
    }

    pub fn exceeds_unparseable_threshold(&self) -> bool {
        self.unparseable_rate() > UNPARSEABLE_WARN_RATE
    }
}

/// Fold prompt outcomes into one edge per canonical pair.
///
/// `probability_a` is the share of valid replies, across both orientations
/// and all samples, that named the lower-id option. Result depends only on
/// the multiset of outcomes, not their order.
pub fn aggregate_responses(outcomes: &[PromptOutcome]) -> Result<Aggregation, GraphError> {
    // (count preferring lo, valid total)
    let mut tallies: BTreeMap<CanonicalPair, (usize, usize)> = BTreeMap::new();
    let mut agg = Aggregation::default();

    for outcome in outcomes {
        let pair = outcome.pair.canonical()?;
        let tally = tallies.entry(pair).or_default();
        for choice in &outcome.choices {
            agg.responses += 1;
            if !choice.is_valid() {
                agg.unparseable += 1;
                continue;
            }
            let winner = if *choice == Choice::A {
                outcome.pair.first
            } else {
                outcome.pair.second
            };
            tally.1 += 1;
            if winner == pair.lo() {
                tally.0 += 1;
            }
        }
    }

    for (pair, (count_first, total)) in tallies {
        if total == 0 {
            agg.dropped.push(pair);
            continue;
        }
        agg.edges
            .push(Edge::new(pair, count_first as f64 / total as f64)?);
    }
    Ok(agg)
}

/// Query every pair in both orientations, aggregate, and write the edges.
///
/// An empty `pairs` slice is a no-op. Pairs whose replies were all
/// unparseable keep whatever edge they had before.
pub async fn query_and_add<J: Judge + ?Sized>(
    graph: &mut PreferenceGraph,
    judge: &J,
    pairs: &[CanonicalPair],
    settings: &QuerySettings,
    trace: Option<&dyn TraceSink>,
) -> Result<BatchSummary, QueryError> {
    if pairs.is_empty() {
        return Ok(BatchSummary::default());
    }
    settings.validate()?;

    let oriented: Vec<OrientedPair> = pairs.iter().flat_map(|p| p.orientations()).collect();
    let batch = graph.generate_prompts(&oriented, &settings.template, settings.entity.as_deref())?;
    let k = settings.k;
    let retry = settings.retry;

    let mut replies: Vec<(usize, Vec<Option<String>>)> =
        stream::iter(batch.prompts.iter().enumerate().map(|(idx, prompt)| {
            let messages = to_messages(&settings.system_message, prompt);
            async move {
                let messages = &messages;
                let texts = retry.run(move || judge.send(messages, k)).await?;
                Ok::<_, ProviderError>((idx, texts))
            }
        }))
        .buffer_unordered(settings.concurrency_limit)
        .try_collect()
        .await?;
    replies.sort_by_key(|(idx, _)| *idx);

    let mut outcomes = Vec::with_capacity(replies.len());
    for (idx, texts) in replies {
        let pair = batch.pairs[idx];
        let choices: Vec<Choice> = texts
            .iter()
            .map(|t| parse_forced_choice(t.as_deref()))
            .collect();
        if let Some(sink) = trace {
            sink.record(build_trace(idx, pair, &batch.prompts[idx], settings, &choices))?;
        }
        outcomes.push(PromptOutcome { pair, choices });
    }

    let agg = aggregate_responses(&outcomes)?;
    if agg.exceeds_unparseable_threshold() {
        tracing::warn!(
            rate = agg.unparseable_rate(),
            unparseable = agg.unparseable,
            total = agg.responses,
            "More than half of judge replies were unparseable"
        );
    }
    for pair in &agg.dropped {
        tracing::debug!(
            option_a = pair.lo(),
            option_b = pair.hi(),
            "No valid replies for pair; edge left unchanged"
        );
    }

    let summary = BatchSummary {
        pairs_requested: pairs.len(),
        prompts: batch.prompts.len(),
        responses: agg.responses,
        unparseable: agg.unparseable,
        edges_updated: agg.edges.len(),
        pairs_dropped: agg.dropped.len(),
    };
    graph.add_edges(agg.edges)?;
    Ok(summary)
}

fn build_trace(
    idx: usize,
    pair: OrientedPair,
    prompt: &str,
    settings: &QuerySettings,
    choices: &[Choice],
) -> QueryTrace {
    let count = |c: Choice| choices.iter().filter(|&&x| x == c).count();
    QueryTrace {
        timestamp_ms: now_epoch_ms(),
        prompt_index: idx,
        first: pair.first,
        second: pair.second,
        template_slug: settings.template.slug.clone(),
        entity: settings.entity.clone(),
        prompt_hash: prompt_hash(prompt),
        samples_requested: settings.k,
        choices: choices.to_vec(),
        count_a: count(Choice::A),
        count_b: count(Choice::B),
        unparseable: count(Choice::Unparseable),
    }
}
