use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;

use utility_harness::elicit::{
    query_and_add, CanonicalPair, Edge, LearnerConfig, PreferenceGraph, QueryError,
    QuerySettings, StopReason, ThurstonianActiveLearner, DEFAULT_HOLDOUT_FRACTION,
};
use utility_harness::gateway::{Judge, Message, ProviderError, RetryPolicy};
use utility_harness::prompts::PromptTemplate;

/// Renders as `"<id of A>|<id of B>"` when option texts are their ids.
fn id_template() -> PromptTemplate {
    PromptTemplate::new("ids", "{option_A}|{option_B}")
}

fn graph(n: usize) -> PreferenceGraph {
    let mut rng = StdRng::seed_from_u64(42);
    let options = (0..n).map(|i| i.to_string()).collect();
    PreferenceGraph::new(options, DEFAULT_HOLDOUT_FRACTION, &mut rng).unwrap()
}

fn shown_ids(messages: &[Message]) -> (usize, usize) {
    let user = &messages.last().unwrap().content;
    let (a, b) = user.split_once('|').unwrap();
    (a.parse().unwrap(), b.parse().unwrap())
}

fn no_wait(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    }
}

fn settings(k: usize) -> QuerySettings {
    QuerySettings {
        k,
        retry: no_wait(1),
        ..QuerySettings::new(id_template())
    }
}

/// Picks the lower id in 9 of every 10 samples.
struct PreferLower {
    calls: AtomicUsize,
}

impl PreferLower {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Judge for PreferLower {
    async fn send(
        &self,
        messages: &[Message],
        k: usize,
    ) -> Result<Vec<Option<String>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (a, b) = shown_ids(messages);
        Ok((0..k)
            .map(|i| {
                let lower_is_a = a < b;
                let pick_lower = i % 10 != 9;
                let label = if lower_is_a == pick_lower { "A" } else { "B" };
                Some(label.to_string())
            })
            .collect())
    }
}

/// Always answers the same fixed text.
struct Constant(&'static str);

#[async_trait]
impl Judge for Constant {
    async fn send(
        &self,
        _messages: &[Message],
        k: usize,
    ) -> Result<Vec<Option<String>>, ProviderError> {
        Ok(vec![Some(self.0.to_string()); k])
    }
}

#[tokio::test]
async fn position_biased_judge_is_cancelled_by_both_orientations() {
    let mut g = graph(6);
    let pairs: Vec<CanonicalPair> = g.sample_regular_graph(2).unwrap();
    let summary = query_and_add(&mut g, &Constant("A"), &pairs, &settings(3), None)
        .await
        .unwrap();

    assert_eq!(summary.prompts, pairs.len() * 2);
    assert_eq!(summary.edges_updated, pairs.len());
    for pair in &pairs {
        assert_eq!(g.edge(pair).unwrap().probability_a, 0.5);
    }
}

#[tokio::test]
async fn consistent_judge_yields_expected_probability() {
    let mut g = graph(5);
    let pair = CanonicalPair::new(1, 3).unwrap();
    query_and_add(&mut g, &PreferLower::new(), &[pair], &settings(10), None)
        .await
        .unwrap();
    let edge = g.edge(&pair).unwrap();
    assert_eq!((edge.option_a, edge.option_b), (1, 3));
    assert!((edge.probability_a - 0.9).abs() < 1e-12);
}

#[tokio::test]
async fn unparseable_batch_leaves_prior_edges_untouched() {
    let mut g = graph(4);
    let pair = CanonicalPair::new(0, 2).unwrap();
    g.add_edges([Edge::new(pair, 0.7).unwrap()]).unwrap();

    let summary = query_and_add(&mut g, &Constant("maybe"), &[pair], &settings(3), None)
        .await
        .unwrap();
    assert_eq!(summary.responses, 6);
    assert_eq!(summary.unparseable, 6);
    assert_eq!(summary.pairs_dropped, 1);
    assert_eq!(summary.unparseable_rate(), 1.0);
    assert!(summary.exceeds_unparseable_threshold());
    assert_eq!(g.edge(&pair).unwrap().probability_a, 0.7);
}

#[tokio::test]
async fn empty_pair_list_makes_no_calls() {
    let mut g = graph(4);
    let judge = PreferLower::new();
    let summary = query_and_add(&mut g, &judge, &[], &settings(3), None)
        .await
        .unwrap();
    assert_eq!(summary.prompts, 0);
    assert_eq!(judge.calls.load(Ordering::SeqCst), 0);
}

/// Fails every call that shows `bad` as option A.
struct FailsOn {
    bad: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl Judge for FailsOn {
    async fn send(
        &self,
        messages: &[Message],
        k: usize,
    ) -> Result<Vec<Option<String>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if shown_ids(messages).0 == self.bad {
            return Err(ProviderError::provider("test", "boom", true));
        }
        Ok(vec![Some("A".to_string()); k])
    }
}

#[tokio::test]
async fn exhausted_retries_abort_the_whole_batch() {
    let mut g = graph(5);
    let pairs = g.sample_regular_graph(2).unwrap();
    let judge = FailsOn {
        bad: 3,
        calls: AtomicUsize::new(0),
    };
    let s = QuerySettings {
        retry: no_wait(3),
        concurrency_limit: 1,
        ..settings(2)
    };

    let err = query_and_add(&mut g, &judge, &pairs, &s, None)
        .await
        .unwrap_err();
    match err {
        QueryError::Provider(ProviderError::RetriesExhausted { attempts, .. }) => {
            assert_eq!(attempts, 3)
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // No partial writes from the prompts that did succeed.
    assert!(g.edges().is_empty());
}

/// Fails the first `failures` calls overall, then answers "B".
struct Flaky {
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl Judge for Flaky {
    async fn send(
        &self,
        _messages: &[Message],
        k: usize,
    ) -> Result<Vec<Option<String>>, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Err(ProviderError::provider("test", "connection reset", true));
        }
        Ok(vec![Some("B".to_string()); k])
    }
}

#[tokio::test]
async fn transient_failures_are_retried_within_the_call() {
    let mut g = graph(4);
    let pair = CanonicalPair::new(0, 1).unwrap();
    let judge = Flaky {
        failures: 2,
        calls: AtomicUsize::new(0),
    };
    let s = QuerySettings {
        retry: no_wait(5),
        concurrency_limit: 1,
        ..settings(1)
    };
    let summary = query_and_add(&mut g, &judge, &[pair], &s, None)
        .await
        .unwrap();
    assert_eq!(summary.edges_updated, 1);
    assert_eq!(judge.calls.load(Ordering::SeqCst), 4);
}

/// Tracks the peak number of overlapping calls.
struct Gauge {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Judge for Gauge {
    async fn send(
        &self,
        _messages: &[Message],
        k: usize,
    ) -> Result<Vec<Option<String>>, ProviderError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(vec![Some("A".to_string()); k])
    }
}

#[tokio::test]
async fn concurrency_limit_bounds_in_flight_calls() {
    let mut g = graph(12);
    let pairs = g.sample_regular_graph(4).unwrap();
    let judge = Gauge {
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    };
    let s = QuerySettings {
        concurrency_limit: 4,
        ..settings(1)
    };
    query_and_add(&mut g, &judge, &pairs, &s, None).await.unwrap();
    let peak = judge.peak.load(Ordering::SeqCst);
    assert!(peak <= 4, "peak {peak}");
    assert!(peak >= 2, "calls never overlapped");
}

#[tokio::test]
async fn four_option_run_recovers_the_judge_ordering() {
    let mut g = graph(4);
    let learner = ThurstonianActiveLearner::new(LearnerConfig {
        k: 10,
        degree: 2,
        num_epochs: 1000,
        retry: no_wait(1),
        ..LearnerConfig::default()
    })
    .unwrap();

    let outcome = learner
        .fit(&mut g, &PreferLower::new(), &id_template(), None, None)
        .await
        .unwrap();
    let means: Vec<f64> = outcome.utilities.iter().map(|u| u.mean).collect();

    for w in means.windows(2) {
        assert!(w[0] > w[1], "utilities not decreasing: {means:?}");
    }
    let extreme = means[0] - means[3];
    for i in 0..4 {
        for j in (i + 1)..4 {
            assert!((means[i] - means[j]).abs() <= extreme + 1e-12);
        }
    }
}

#[tokio::test]
async fn learner_runs_exactly_the_planned_iterations() {
    let mut g = graph(16);
    let learner = ThurstonianActiveLearner::new(LearnerConfig {
        k: 1,
        num_edges_per_iter: 5,
        num_epochs: 50,
        retry: no_wait(1),
        ..LearnerConfig::default()
    })
    .unwrap();
    let judge = PreferLower::new();

    let outcome = learner
        .fit(&mut g, &judge, &id_template(), None, None)
        .await
        .unwrap();

    // target 16 * log2(16) = 64, lattice 16, so ceil(48 / 5) rounds.
    assert_eq!(outcome.plan.iterations, 10);
    assert_eq!(outcome.iterations_run, 10);
    assert_eq!(outcome.stop_reason, StopReason::Completed);
    assert_eq!(outcome.batches.len(), 11);
    assert_eq!(outcome.edges, 16 + 10 * 5);

    let requested: usize = outcome.batches.iter().map(|b| b.pairs_requested).sum();
    assert_eq!(judge.calls.load(Ordering::SeqCst), 2 * requested);
    // Held-out pairs only ever enter through the seed lattice.
    let lattice: BTreeSet<_> = g.sample_regular_graph(2).unwrap().into_iter().collect();
    assert!(g
        .edges()
        .keys()
        .filter(|p| g.holdout().contains(p))
        .all(|p| lattice.contains(p)));
}

#[tokio::test]
async fn learner_halts_when_candidates_run_out() {
    let mut g = graph(5);
    let learner = ThurstonianActiveLearner::new(LearnerConfig {
        k: 1,
        edge_multiplier: 3.0,
        num_edges_per_iter: 2,
        num_epochs: 50,
        retry: no_wait(1),
        ..LearnerConfig::default()
    })
    .unwrap();

    let outcome = learner
        .fit(&mut g, &PreferLower::new(), &id_template(), None, None)
        .await
        .unwrap();

    assert_eq!(outcome.plan.iterations, 15);
    assert_eq!(outcome.stop_reason, StopReason::NoCandidates);
    assert!(outcome.iterations_run < outcome.plan.iterations);

    let queried: BTreeSet<_> = g.edges().keys().copied().collect();
    assert!(g.training_pool().is_subset(&queried));
    let lattice: BTreeSet<_> = g.sample_regular_graph(2).unwrap().into_iter().collect();
    assert!(queried
        .iter()
        .filter(|p| g.holdout().contains(p))
        .all(|p| lattice.contains(p)));
}

#[tokio::test]
async fn two_options_run_with_the_default_config() {
    let mut g = graph(2);
    let learner = ThurstonianActiveLearner::new(LearnerConfig {
        retry: no_wait(1),
        ..LearnerConfig::default()
    })
    .unwrap();
    let judge = PreferLower::new();

    let outcome = learner
        .fit(&mut g, &judge, &id_template(), None, None)
        .await
        .unwrap();

    let only = CanonicalPair::new(0, 1).unwrap();
    assert_eq!(outcome.plan.initial_edges, 1);
    assert_eq!(outcome.edges, 1);
    assert!(g.edge(&only).is_some());
    // The lone pair is held out, so there is nothing left to select.
    assert_eq!(outcome.stop_reason, StopReason::NoCandidates);
    assert_eq!(judge.calls.load(Ordering::SeqCst), 2);
    assert!(outcome.utilities[0].mean > outcome.utilities[1].mean);
}

#[tokio::test]
async fn invalid_degree_is_reported() {
    let mut g = graph(4);
    let learner = ThurstonianActiveLearner::new(LearnerConfig {
        degree: 3,
        ..LearnerConfig::default()
    })
    .unwrap();
    let err = learner
        .fit(&mut g, &PreferLower::new(), &id_template(), None, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("degree"));
}
