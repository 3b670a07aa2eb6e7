//! Option and entity list files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::prompts::PromptTemplate;

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} contains no options")]
    Empty(PathBuf),
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, InputError> {
    let raw = std::fs::read_to_string(path).map_err(|source| InputError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| InputError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Flatten `category -> [text]` in category order, keeping in-category order.
pub fn flatten_options(by_category: BTreeMap<String, Vec<String>>) -> Vec<String> {
    by_category.into_values().flatten().collect()
}

/// Load an options file (`{"category": ["text", ...], ...}`) as one list.
pub fn load_options(path: &Path) -> Result<Vec<String>, InputError> {
    let by_category: BTreeMap<String, Vec<String>> = read_json(path)?;
    let options = flatten_options(by_category);
    if options.is_empty() {
        return Err(InputError::Empty(path.to_path_buf()));
    }
    Ok(options)
}

/// Entities to survey, grouped by which prompt frames them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Entities {
    #[serde(default)]
    pub politicians: Vec<String>,
    #[serde(default)]
    pub platforms: Vec<String>,
}

impl Entities {
    pub fn load(path: &Path) -> Result<Self, InputError> {
        read_json(path)
    }

    /// Politicians first, then platforms.
    pub fn all(&self) -> impl Iterator<Item = &str> {
        self.politicians
            .iter()
            .chain(self.platforms.iter())
            .map(String::as_str)
    }

    /// Politicians are asked with the politician prompt, everything else
    /// with the platform prompt.
    pub fn template_for(&self, entity: &str) -> PromptTemplate {
        if self.politicians.iter().any(|p| p == entity) {
            PromptTemplate::politician()
        } else {
            PromptTemplate::platform()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_sorts_categories_not_items() {
        let mut m = BTreeMap::new();
        m.insert("taxes".to_string(), vec!["t2".to_string(), "t1".to_string()]);
        m.insert("energy".to_string(), vec!["e1".to_string()]);
        assert_eq!(flatten_options(m), vec!["e1", "t2", "t1"]);
    }

    #[test]
    fn test_load_options_and_entities() {
        let dir = tempfile::tempdir().unwrap();
        let opts = dir.path().join("options.json");
        std::fs::write(&opts, r#"{"b": ["x"], "a": ["y", "z"]}"#).unwrap();
        assert_eq!(load_options(&opts).unwrap(), vec!["y", "z", "x"]);

        let empty = dir.path().join("empty.json");
        std::fs::write(&empty, "{}").unwrap();
        assert!(matches!(load_options(&empty), Err(InputError::Empty(_))));

        let ents = dir.path().join("entities.json");
        std::fs::write(&ents, r#"{"politicians": ["P One"], "platforms": ["Green"]}"#).unwrap();
        let e = Entities::load(&ents).unwrap();
        assert_eq!(e.all().collect::<Vec<_>>(), vec!["P One", "Green"]);
        assert_eq!(e.template_for("P One").slug, "politician");
        assert_eq!(e.template_for("Green").slug, "platform");
    }
}
