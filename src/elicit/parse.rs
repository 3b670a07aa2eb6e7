//! Forced-choice reply classification.

use serde::{Deserialize, Serialize};

/// Classified judge reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Choice {
    A,
    B,
    Unparseable,
}

impl Choice {
    pub fn is_valid(&self) -> bool {
        !matches!(self, Choice::Unparseable)
    }
}

/// Classify a raw reply as `A`, `B`, or unparseable.
///
/// Exact single-letter answers win; otherwise the first standalone `A`,
/// then `B`, delimited by spaces, is taken. Anything else (including no
/// reply) is unparseable.
pub fn parse_forced_choice(raw: Option<&str>) -> Choice {
    let Some(raw) = raw else {
        return Choice::Unparseable;
    };
    let text = raw.trim().to_uppercase();
    if text.is_empty() {
        return Choice::Unparseable;
    }
    match text.as_str() {
        "A" => return Choice::A,
        "B" => return Choice::B,
        _ => {}
    }

    let padded = format!(" {text} ");
    if padded.contains(" A ") {
        Choice::A
    } else if padded.contains(" B ") {
        Choice::B
    } else {
        Choice::Unparseable
    }
}
