#![forbid(unsafe_code)]

//! # utility-harness
//!
//! Estimate the latent preferences of an LLM (or of an entity an LLM is asked
//! to role-play) over a fixed set of options.
//!
//! Instead of asking for scores, the harness asks forced-choice questions
//! ("A or B?"), queries each pair in both presentation orders to cancel
//! position bias, and fits a Thurstonian model where every option has a
//! Gaussian utility. An active learning loop spends the query budget on pairs
//! the current fit is least sure about and that have been compared least.

pub mod elicit;
pub mod gateway;
pub mod inputs;
pub mod projection;
pub mod prompts;
pub mod snapshot;
pub mod thurstonian;

pub use elicit::{
    query_and_add, CanonicalPair, Edge, JsonlTraceSink, LearnError, LearnOutcome, LearnerConfig,
    PreferenceGraph, QueryError, QuerySettings, QueryTrace, StopReason,
    ThurstonianActiveLearner, TraceError, TraceSink, TraceWorker,
};
pub use gateway::{
    Attribution, Judge, JudgeConfig, JudgeGateway, ProviderError, ProviderProfile, RetryPolicy,
    UsageSink,
};
pub use prompts::PromptTemplate;
pub use snapshot::{compute_utilities_if_needed, ComputeRequest, Snapshot, SnapshotError};
pub use thurstonian::{FitConfig, FitError, Utility};
