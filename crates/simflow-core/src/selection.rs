//! Which realisations each process type is auto-submitted for.
//!
//! A selector is written in config as `ALL`, `ONCE`, `NONE` or a SQL-LIKE
//! pattern over run names (`%` matches any run of characters, `_` exactly
//! one). `ONCE` is shorthand for `%_REL01`: the first realisation of each
//! fault.

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use crate::types::ProcessType;

pub const ONCE_PATTERN: &str = "%_REL01";

static ONCE_RE: OnceLock<LikePattern> = OnceLock::new();

fn once_pattern() -> &'static LikePattern {
    ONCE_RE.get_or_init(|| LikePattern::new(ONCE_PATTERN))
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selector {
    #[default]
    All,
    Once,
    None,
    /// Compiled when the selector is parsed.
    Pattern(LikePattern),
}

impl Selector {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "ALL" | "all" => Selector::All,
            "ONCE" | "once" => Selector::Once,
            "NONE" | "none" => Selector::None,
            other => Selector::Pattern(LikePattern::new(other)),
        }
    }

    pub fn matches(&self, run_name: &str) -> bool {
        match self {
            Selector::All => true,
            Selector::None => false,
            Selector::Once => once_pattern().matches(run_name),
            Selector::Pattern(p) => p.matches(run_name),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::All => f.write_str("ALL"),
            Selector::Once => f.write_str("ONCE"),
            Selector::None => f.write_str("NONE"),
            Selector::Pattern(p) => f.write_str(p.as_str()),
        }
    }
}

impl Serialize for Selector {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Selector {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(Selector::parse(&raw))
    }
}

// ---------------------------------------------------------------------------
// LikePattern
// ---------------------------------------------------------------------------

/// SQL `LIKE` semantics (case-sensitive, anchored at both ends).
#[derive(Debug, Clone)]
pub struct LikePattern {
    source: String,
    re: Regex,
}

impl PartialEq for LikePattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for LikePattern {}

impl LikePattern {
    pub fn new(pattern: &str) -> Self {
        let mut re = String::with_capacity(pattern.len() + 8);
        re.push('^');
        for ch in pattern.chars() {
            match ch {
                '%' => re.push_str(".*"),
                '_' => re.push('.'),
                c => re.push_str(&regex::escape(&c.to_string())),
            }
        }
        re.push('$');
        // Every literal is escaped, so the generated expression always compiles.
        let re = Regex::new(&re).unwrap_or_else(|_| Regex::new("^$").unwrap());
        Self {
            source: pattern.to_string(),
            re,
        }
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, s: &str) -> bool {
        self.re.is_match(s)
    }
}

// ---------------------------------------------------------------------------
// TaskSelection
// ---------------------------------------------------------------------------

/// Per-process-type selectors; process types not listed default to `ALL`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskSelection(pub BTreeMap<ProcessType, Selector>);

impl TaskSelection {
    pub fn selector(&self, process_type: ProcessType) -> Selector {
        self.0.get(&process_type).cloned().unwrap_or_default()
    }

    pub fn selects(&self, run_name: &str, process_type: ProcessType) -> bool {
        self.0
            .get(&process_type)
            .map_or(true, |selector| selector.matches(run_name))
    }

    pub fn set(&mut self, process_type: ProcessType, selector: Selector) {
        self.0.insert(process_type, selector);
    }
}
