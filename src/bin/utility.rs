#![forbid(unsafe_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

use utility_harness::elicit::{JsonlTraceSink, TraceSink, TraceWorker};
use utility_harness::gateway::{
    Attribution, JudgeConfig, JudgeGateway, NoopUsageSink, ProviderProfile, RetryPolicy,
    StderrUsageSink, UsageSink,
};
use utility_harness::inputs::{load_options, Entities};
use utility_harness::projection::ProjectionReport;
use utility_harness::prompts::PromptTemplate;
use utility_harness::snapshot::{
    ai_snapshot_path, compute_utilities_if_needed, entity_snapshot_path, list_ai_snapshots,
    ComputeRequest, Snapshot,
};
use utility_harness::{LearnerConfig, ThurstonianActiveLearner};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "utility", version, about = "Pairwise-preference utility estimation CLI")]
struct Cli {
    /// Log every provider call as a JSON line on stderr
    #[arg(long, global = true)]
    usage_log: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Learn utilities for one model (optionally role-playing an entity)
    Compute {
        #[arg(long)]
        options: PathBuf,
        #[arg(long)]
        model: String,
        #[arg(long, default_value = "openai")]
        provider: String,
        /// Built-in prompt: ai, politician or platform
        #[arg(long, default_value = "ai")]
        prompt: String,
        #[arg(long)]
        entity: Option<String>,
        #[arg(long)]
        system_prompt: Option<String>,
        #[arg(long)]
        out: PathBuf,
        /// JSONL trace of every judged prompt
        #[arg(long)]
        trace: Option<PathBuf>,
        #[command(flatten)]
        judge: JudgeArgs,
        #[command(flatten)]
        learner: LearnerArgs,
    },
    /// Compute AI and entity utilities, then project them together
    Survey {
        #[arg(long)]
        options: PathBuf,
        #[arg(long)]
        entities: PathBuf,
        #[arg(long)]
        model: String,
        #[arg(long, default_value = "openai")]
        provider: String,
        #[arg(long, default_value = "gpt-4.1")]
        entity_model: String,
        #[arg(long, default_value = "openai")]
        entity_provider: String,
        #[arg(long, default_value = "political_results")]
        output_dir: PathBuf,
        /// Directory holding existing snapshots (defaults to --output-dir)
        #[arg(long)]
        precomputed_dir: Option<PathBuf>,
        #[arg(long)]
        system_prompt: Option<String>,
        /// Entity pinned to the upper-left quadrant of the projection
        #[arg(long)]
        anchor: Option<String>,
        #[command(flatten)]
        judge: JudgeArgs,
        #[command(flatten)]
        learner: LearnerArgs,
    },
    /// Project existing snapshots without querying anything
    Project {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        options: PathBuf,
        #[arg(long)]
        entities: PathBuf,
        #[arg(long, default_value = "gpt-4.1")]
        entity_model: String,
        #[arg(long)]
        anchor: Option<String>,
        #[arg(long)]
        highlight: Option<String>,
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Args, Clone)]
struct JudgeArgs {
    /// Override the provider's API base URL
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long, default_value_t = 1.0)]
    temperature: f32,
    #[arg(long, default_value_t = 100)]
    max_tokens: u32,
}

#[derive(Args, Clone)]
struct LearnerArgs {
    /// Completions per prompt
    #[arg(long, default_value_t = 3)]
    k: usize,
    #[arg(long, default_value_t = 30)]
    concurrency_limit: usize,
    #[arg(long, default_value_t = 200)]
    num_edges_per_iter: usize,
    #[arg(long, default_value_t = 1.0)]
    edge_multiplier: f64,
    #[arg(long, default_value_t = 500)]
    num_epochs: usize,
    #[arg(long, default_value_t = 0.01)]
    learning_rate: f64,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long, default_value_t = 5)]
    max_attempts: u32,
}

impl LearnerArgs {
    fn learner(&self, system_prompt: Option<&str>) -> CliResult<ThurstonianActiveLearner> {
        let mut config = LearnerConfig {
            k: self.k,
            concurrency_limit: self.concurrency_limit,
            num_edges_per_iter: self.num_edges_per_iter,
            edge_multiplier: self.edge_multiplier,
            num_epochs: self.num_epochs,
            learning_rate: self.learning_rate,
            seed: self.seed,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                ..RetryPolicy::default()
            },
            ..LearnerConfig::default()
        };
        if let Some(prompt) = system_prompt {
            config.system_message = prompt.to_string();
        }
        Ok(ThurstonianActiveLearner::new(config)?)
    }
}

fn build_judge<U: UsageSink>(
    provider: &str,
    model: &str,
    args: &JudgeArgs,
    usage: Arc<U>,
    caller: &'static str,
    run_id: Uuid,
) -> CliResult<JudgeGateway<U>> {
    let profile = ProviderProfile::by_name(provider)?;
    let config = JudgeConfig {
        model: model.to_string(),
        temperature: args.temperature,
        max_tokens: Some(args.max_tokens),
        structured_output: true,
    };
    Ok(JudgeGateway::from_env(
        profile,
        args.base_url.clone(),
        usage,
        config,
        Attribution::new(caller).with_run(run_id),
    )?)
}

fn open_trace(path: Option<&Path>) -> CliResult<(Option<JsonlTraceSink>, Option<TraceWorker>)> {
    Ok(match path {
        Some(path) => {
            let (sink, worker) = JsonlTraceSink::new(path)?;
            (Some(sink), Some(worker))
        }
        None => (None, None),
    })
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), io::Error> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    std::fs::write(path, json)
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> CliResult<()> {
    init_tracing();
    let cli = Cli::parse();
    if cli.usage_log {
        run(cli.command, Arc::new(StderrUsageSink)).await
    } else {
        run(cli.command, Arc::new(NoopUsageSink)).await
    }
}

async fn run<U: UsageSink>(command: Commands, usage: Arc<U>) -> CliResult<()> {
    let run_id = Uuid::new_v4();
    match command {
        Commands::Compute {
            options,
            model,
            provider,
            prompt,
            entity,
            system_prompt,
            out,
            trace,
            judge,
            learner,
        } => {
            let template = PromptTemplate::by_slug(&prompt)
                .ok_or_else(|| format!("unknown prompt {prompt:?}; expected ai, politician or platform"))?;
            if template.mentions_entity() && entity.is_none() {
                return Err(format!("--prompt {prompt} needs --entity").into());
            }
            let options = load_options(&options)?;
            let learner = learner.learner(system_prompt.as_deref())?;
            let judge = build_judge(&provider, &model, &judge, usage, "utility::compute", run_id)?;

            let (trace_sink, trace_worker) = open_trace(trace.as_deref())?;
            let trace_ref = trace_sink.as_ref().map(|sink| sink as &dyn TraceSink);

            let req = ComputeRequest {
                path: &out,
                options: &options,
                template: &template,
                entity_name: entity.as_deref(),
                model_name: &model,
                system_prompt: system_prompt.as_deref(),
            };
            let utilities = compute_utilities_if_needed(&req, &judge, &learner, trace_ref).await?;

            drop(trace_sink);
            if let Some(worker) = trace_worker {
                worker.join()?;
            }
            println!("{} utilities in {}", utilities.len(), out.display());
        }
        Commands::Survey {
            options,
            entities,
            model,
            provider,
            entity_model,
            entity_provider,
            output_dir,
            precomputed_dir,
            system_prompt,
            anchor,
            judge,
            learner,
        } => {
            let options = load_options(&options)?;
            let entities = Entities::load(&entities)?;
            let n = options.len();
            let learner = learner.learner(system_prompt.as_deref())?;
            let base_dir = precomputed_dir.unwrap_or_else(|| output_dir.clone());
            std::fs::create_dir_all(&output_dir)?;

            let ai_judge = build_judge(
                &provider,
                &model,
                &judge,
                usage.clone(),
                "utility::survey::ai",
                run_id,
            )?;
            let ai_path = ai_snapshot_path(&base_dir, &model, system_prompt.as_deref());
            let ai_template = PromptTemplate::ai();
            compute_utilities_if_needed(
                &ComputeRequest {
                    path: &ai_path,
                    options: &options,
                    template: &ai_template,
                    entity_name: Some(model.as_str()),
                    model_name: &model,
                    system_prompt: system_prompt.as_deref(),
                },
                &ai_judge,
                &learner,
                None,
            )
            .await?;

            let mut ai_vectors = Vec::new();
            for (name, path) in list_ai_snapshots(&base_dir)? {
                ai_vectors.push((name, Snapshot::load(&path)?.mean_vector(n)?));
            }

            let entity_judge = build_judge(
                &entity_provider,
                &entity_model,
                &judge,
                usage,
                "utility::survey::entity",
                run_id,
            )?;
            let mut entity_vectors = Vec::new();
            for entity in entities.all() {
                let path = entity_snapshot_path(&base_dir, entity, &entity_model);
                let template = entities.template_for(entity);
                let utilities = compute_utilities_if_needed(
                    &ComputeRequest {
                        path: &path,
                        options: &options,
                        template: &template,
                        entity_name: Some(entity),
                        model_name: &entity_model,
                        system_prompt: system_prompt.as_deref(),
                    },
                    &entity_judge,
                    &learner,
                    None,
                )
                .await?;
                let means = utilities.iter().map(|u| u.mean).collect();
                entity_vectors.push((entity.to_string(), means));
            }

            let report =
                ProjectionReport::build(entity_vectors, ai_vectors, anchor.as_deref(), Some(model))?;
            let out = output_dir.join("political_pca.json");
            write_json(&out, &report)?;
            println!("projection written to {}", out.display());
        }
        Commands::Project {
            dir,
            options,
            entities,
            entity_model,
            anchor,
            highlight,
            out,
        } => {
            let n = load_options(&options)?.len();
            let entities = Entities::load(&entities)?;

            let mut entity_vectors = Vec::new();
            for entity in entities.all() {
                let path = entity_snapshot_path(&dir, entity, &entity_model);
                if !Snapshot::exists(&path) {
                    tracing::warn!(entity, path = %path.display(), "No snapshot; skipping entity");
                    continue;
                }
                entity_vectors.push((entity.to_string(), Snapshot::load(&path)?.mean_vector(n)?));
            }
            let mut ai_vectors = Vec::new();
            for (name, path) in list_ai_snapshots(&dir)? {
                ai_vectors.push((name, Snapshot::load(&path)?.mean_vector(n)?));
            }

            let report =
                ProjectionReport::build(entity_vectors, ai_vectors, anchor.as_deref(), highlight)?;
            write_json(&out, &report)?;
            println!("projection written to {}", out.display());
        }
    }
    Ok(())
}
