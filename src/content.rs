//! Prompt and FAQ content.
//!
//! Content lives in a versioned TOML table so wording can change without touching the
//! relay. The built-in table is compiled into the binary; `content.path` points at a
//! replacement.

use regex_lite::{Regex, RegexBuilder};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

const BUILTIN_CONTENT: &str = include_str!("../content/default.toml");

/// Highest content table version this build understands.
pub const CONTENT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("failed to read content file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid content TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unsupported content version {found} (max: {max})", max = CONTENT_VERSION)]
    Version { found: u32 },

    #[error("intent '{intent}' has invalid pattern '{pattern}': {source}")]
    Pattern {
        intent: String,
        pattern: String,
        source: regex_lite::Error,
    },

    #[error("intent '{0}' has no patterns")]
    NoPatterns(String),

    #[error("system prompt is empty")]
    EmptyPrompt,
}

#[derive(Debug, Deserialize)]
struct RawContent {
    version: u32,
    system_prompt: String,
    #[serde(default)]
    intents: Vec<RawIntent>,
}

#[derive(Debug, Deserialize)]
struct RawIntent {
    name: String,
    patterns: Vec<String>,
    answer: String,
}

/// A recognized question category with its canned answer.
#[derive(Debug)]
pub struct Intent {
    pub name: String,
    patterns: Vec<Regex>,
    pub answer: String,
}

impl Intent {
    pub fn matches(&self, text: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(text))
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}

/// Loaded prompt plus intents in priority order.
#[derive(Debug)]
pub struct ContentTable {
    pub version: u32,
    pub system_prompt: String,
    pub intents: Vec<Intent>,
}

impl ContentTable {
    pub fn builtin() -> Result<Self, ContentError> {
        Self::parse(BUILTIN_CONTENT)
    }

    pub fn load(path: &Path) -> Result<Self, ContentError> {
        let text = std::fs::read_to_string(path).map_err(|e| ContentError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&text)
    }

    /// Load from `path` when given, otherwise use the built-in table.
    pub fn from_optional_path(path: Option<&Path>) -> Result<Self, ContentError> {
        match path {
            Some(p) => Self::load(p),
            None => Self::builtin(),
        }
    }

    pub fn parse(text: &str) -> Result<Self, ContentError> {
        let raw: RawContent = toml::from_str(text)?;

        if raw.version > CONTENT_VERSION {
            return Err(ContentError::Version { found: raw.version });
        }

        let system_prompt = raw.system_prompt.trim().to_string();
        if system_prompt.is_empty() {
            return Err(ContentError::EmptyPrompt);
        }

        let intents = raw
            .intents
            .into_iter()
            .map(compile_intent)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            version: raw.version,
            system_prompt,
            intents,
        })
    }

    /// First intent in priority order whose patterns match `text`.
    pub fn match_intent(&self, text: &str) -> Option<&Intent> {
        if text.is_empty() {
            return None;
        }
        self.intents.iter().find(|intent| intent.matches(text))
    }
}

fn compile_intent(raw: RawIntent) -> Result<Intent, ContentError> {
    if raw.patterns.is_empty() {
        return Err(ContentError::NoPatterns(raw.name));
    }

    let mut patterns = Vec::with_capacity(raw.patterns.len());
    for pattern in &raw.patterns {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| ContentError::Pattern {
                intent: raw.name.clone(),
                pattern: pattern.clone(),
                source: e,
            })?;
        patterns.push(regex);
    }

    Ok(Intent {
        name: raw.name,
        patterns,
        answer: raw.answer.trim().to_string(),
    })
}
