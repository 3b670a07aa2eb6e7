//! JSON snapshots of fitted utilities.
//!
//! A snapshot is `{options, utilities: {"<id>": {mean, variance}}, ...metadata}`.
//! An existing file at the target path counts as "already computed"; it is
//! never revalidated against the requesting configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::elicit::{
    GraphError, LearnError, PreferenceGraph, ThurstonianActiveLearner, TraceSink,
    DEFAULT_HOLDOUT_FRACTION,
};
use crate::gateway::Judge;
use crate::prompts::PromptTemplate;
use crate::thurstonian::Utility;

const AI_DIR: &str = "ais";
const ENTITY_DIR: &str = "entities";
const FILE_PREFIX: &str = "results_";
const FILE_SUFFIX: &str = ".json";
/// Hex chars of the system-prompt fingerprint in AI snapshot names.
const PROMPT_FINGERPRINT_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid snapshot json at {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("utility key is not an option index: {0:?}")]
    MalformedKey(String),
    #[error("snapshot has no utility for option {0}")]
    MissingUtility(usize),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Learn(#[from] LearnError),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SnapshotError + '_ {
    move |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub options: Vec<String>,
    pub utilities: BTreeMap<String, Utility>,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl Snapshot {
    pub fn new(options: Vec<String>, utilities: &[Utility]) -> Self {
        Self {
            options,
            utilities: utilities
                .iter()
                .enumerate()
                .map(|(id, u)| (id.to_string(), *u))
                .collect(),
            metadata: Map::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn exists(path: &Path) -> bool {
        path.is_file()
    }

    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let raw = std::fs::read_to_string(path).map_err(io_err(path))?;
        serde_json::from_str(&raw).map_err(|source| SnapshotError::Serde {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| SnapshotError::Serde {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(io_err(path))
    }

    /// Utilities keyed by option index.
    pub fn utilities_by_id(&self) -> Result<BTreeMap<usize, Utility>, SnapshotError> {
        self.utilities
            .iter()
            .map(|(k, u)| {
                k.parse::<usize>()
                    .map(|id| (id, *u))
                    .map_err(|_| SnapshotError::MalformedKey(k.clone()))
            })
            .collect()
    }

    /// Utilities for ids `0..n`, in order. Every id must be present.
    pub fn utility_vector(&self, n: usize) -> Result<Vec<Utility>, SnapshotError> {
        let by_id = self.utilities_by_id()?;
        (0..n)
            .map(|id| {
                by_id
                    .get(&id)
                    .copied()
                    .ok_or(SnapshotError::MissingUtility(id))
            })
            .collect()
    }

    /// Means for ids `0..n`, in order.
    pub fn mean_vector(&self, n: usize) -> Result<Vec<f64>, SnapshotError> {
        Ok(self
            .utility_vector(n)?
            .into_iter()
            .map(|u| u.mean)
            .collect())
    }
}

/// `dir/ais/results_<model>[_<fingerprint>].json`.
pub fn ai_snapshot_path(dir: &Path, model: &str, system_prompt: Option<&str>) -> PathBuf {
    let name = match system_prompt {
        Some(prompt) => {
            let hex = blake3::hash(prompt.as_bytes()).to_hex();
            format!("{FILE_PREFIX}{model}_{}{FILE_SUFFIX}", &hex.as_str()[..PROMPT_FINGERPRINT_LEN])
        }
        None => format!("{FILE_PREFIX}{model}{FILE_SUFFIX}"),
    };
    dir.join(AI_DIR).join(name)
}

/// `dir/entities/<entity, lowercased, spaces to underscores>/results_<model>.json`.
pub fn entity_snapshot_path(dir: &Path, entity: &str, model: &str) -> PathBuf {
    let slug = entity.replace(' ', "_").to_lowercase();
    dir.join(ENTITY_DIR)
        .join(slug)
        .join(format!("{FILE_PREFIX}{model}{FILE_SUFFIX}"))
}

/// Recover the model label from an AI snapshot file name.
///
/// A trailing `_xxxxxxxx` segment of fingerprint length is stripped.
pub fn model_from_ai_file_name(file_name: &str) -> Option<String> {
    let stem = file_name
        .strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?;
    match stem.rsplit_once('_') {
        Some((model, tail)) if tail.len() == PROMPT_FINGERPRINT_LEN => Some(model.to_string()),
        _ => Some(stem.to_string()),
    }
}

/// Every AI snapshot under `dir/ais`, sorted by file name.
pub fn list_ai_snapshots(dir: &Path) -> Result<Vec<(String, PathBuf)>, SnapshotError> {
    let ais = dir.join(AI_DIR);
    if !ais.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in std::fs::read_dir(&ais).map_err(io_err(&ais))? {
        let entry = entry.map_err(io_err(&ais))?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if let Some(model) = model_from_ai_file_name(name) {
            found.push((name.to_string(), model, entry.path()));
        }
    }
    found.sort();
    Ok(found.into_iter().map(|(_, m, p)| (m, p)).collect())
}

/// What to compute and where to store it.
#[derive(Debug, Clone)]
pub struct ComputeRequest<'a> {
    pub path: &'a Path,
    pub options: &'a [String],
    pub template: &'a PromptTemplate,
    /// Recorded in metadata and substituted for `{entity}`.
    pub entity_name: Option<&'a str>,
    pub model_name: &'a str,
    pub system_prompt: Option<&'a str>,
}

/// Load utilities from `req.path` if present, otherwise learn and save them.
pub async fn compute_utilities_if_needed<J: Judge + ?Sized>(
    req: &ComputeRequest<'_>,
    judge: &J,
    learner: &ThurstonianActiveLearner,
    trace: Option<&dyn TraceSink>,
) -> Result<Vec<Utility>, SnapshotError> {
    if Snapshot::exists(req.path) {
        tracing::info!(path = %req.path.display(), "Snapshot exists; skipping computation");
        let snapshot = Snapshot::load(req.path)?;
        return snapshot.utility_vector(snapshot.options.len());
    }

    tracing::info!(
        entity = req.entity_name.unwrap_or("-"),
        model = req.model_name,
        options = req.options.len(),
        "Computing utilities"
    );
    let mut rng = StdRng::seed_from_u64(learner.config().seed);
    let mut graph = PreferenceGraph::new(req.options.to_vec(), DEFAULT_HOLDOUT_FRACTION, &mut rng)?;
    let outcome = learner
        .fit(&mut graph, judge, req.template, req.entity_name, trace)
        .await?;

    let mut snapshot = Snapshot::new(req.options.to_vec(), &outcome.utilities)
        .with_meta("entity_name", req.entity_name)
        .with_meta("model_name", req.model_name)
        .with_meta("created_at", chrono::Utc::now().to_rfc3339());
    if let Some(prompt) = req.system_prompt {
        snapshot = snapshot.with_meta("system_prompt", prompt);
    }
    snapshot.save(req.path)?;
    Ok(outcome.utilities)
}
