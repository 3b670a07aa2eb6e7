//! Preference elicitation: graph, forced-choice parsing, concurrent judge
//! queries, active pair selection and the learning loop tying them together.

pub mod graph;
pub mod learner;
pub mod parse;
pub mod query;
pub mod sampler;
pub mod trace;

pub use graph::{
    CanonicalPair, Edge, GraphError, OptionId, OrientedPair, PreferenceGraph, PreferenceOption,
    PromptBatch, DEFAULT_HOLDOUT_FRACTION,
};
pub use learner::{
    fit_graph, EdgePlan, LearnError, LearnOutcome, LearnerConfig, StopReason,
    ThurstonianActiveLearner,
};
pub use parse::{parse_forced_choice, Choice};
pub use query::{
    aggregate_responses, query_and_add, Aggregation, BatchSummary, PromptOutcome, QueryError,
    QuerySettings, UNPARSEABLE_WARN_RATE,
};
pub use sampler::{percentile, select_new_pairs};
pub use trace::{JsonlTraceSink, QueryTrace, TraceError, TraceSink, TraceWorker};
