//! Protection level classification from file names.
//!
//! A file declares its sensitivity with a bracket label in its name, e.g.
//! `RULES[超重要L10].md` or `notes[L4].txt`. Labels are tried in a fixed
//! priority order and the first one that yields an in-range level wins.
//! Unlabelled files get [`DEFAULT_LEVEL`].

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::debug;

pub const MAX_LEVEL: u8 = 10;

/// Level assigned when no label matches. Non-zero so unmarked files still
/// land in the `Minimal` class.
pub const DEFAULT_LEVEL: u8 = 3;

/// `matched_label` value reported for unlabelled files.
pub const DEFAULT_LABEL: &str = "default";

/// Protection level in `0..=10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ProtectionLevel(u8);

impl ProtectionLevel {
    pub const fn new(value: u8) -> Option<Self> {
        if value <= MAX_LEVEL {
            Some(Self(value))
        } else {
            None
        }
    }

    pub const fn value(self) -> u8 {
        self.0
    }

    pub fn all() -> impl Iterator<Item = ProtectionLevel> {
        (0..=MAX_LEVEL).map(ProtectionLevel)
    }

    /// Level 7 and above.
    pub fn is_highly_protected(self) -> bool {
        self.0 >= 7
    }

    /// Level 3 and below.
    pub fn is_unprotected(self) -> bool {
        self.0 <= 3
    }
}

impl Default for ProtectionLevel {
    fn default() -> Self {
        Self(DEFAULT_LEVEL)
    }
}

impl TryFrom<u8> for ProtectionLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("protection level {value} is outside 0..={MAX_LEVEL}"))
    }
}

impl From<ProtectionLevel> for u8 {
    fn from(level: ProtectionLevel) -> u8 {
        level.0
    }
}

impl fmt::Display for ProtectionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Result of classifying one file name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub level: ProtectionLevel,
    /// The bracket label that decided the level, or [`DEFAULT_LABEL`].
    pub matched_label: String,
}

impl Classification {
    pub fn is_default(&self) -> bool {
        self.matched_label == DEFAULT_LABEL
    }
}

struct LabelPattern {
    name: &'static str,
    regex: Regex,
}

// Priority order. `\[重要L` cannot match inside `[超重要L` / `[中重要L` / `[低重要L`
// because the bracket must directly precede the prefix.
static LABEL_PATTERNS: Lazy<Vec<LabelPattern>> = Lazy::new(|| {
    [
        ("超重要L", r"\[超重要L([0-9]+)\]"),
        ("重要L", r"\[重要L([0-9]+)\]"),
        ("中重要L", r"\[中重要L([0-9]+)\]"),
        ("低重要L", r"\[低重要L([0-9]+)\]"),
        ("L", r"\[L([0-9]+)\]"),
        ("重要度", r"\[重要度([0-9]+)\]"),
    ]
    .into_iter()
    .map(|(name, pattern)| LabelPattern {
        name,
        regex: Regex::new(pattern).expect("static label pattern"),
    })
    .collect()
});

/// Label prefixes in the order they are tried.
pub fn label_priority() -> Vec<&'static str> {
    LABEL_PATTERNS.iter().map(|p| p.name).collect()
}

/// Classify a bare file name.
pub fn classify(file_name: &str) -> Classification {
    for pattern in LABEL_PATTERNS.iter() {
        for caps in pattern.regex.captures_iter(file_name) {
            let level = caps
                .get(1)
                .and_then(|m| m.as_str().parse::<u8>().ok())
                .and_then(ProtectionLevel::new);
            if let Some(level) = level {
                let matched_label = caps
                    .get(0)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();
                debug!(file_name, %level, label = %matched_label, "classified");
                return Classification {
                    level,
                    matched_label,
                };
            }
        }
    }
    Classification {
        level: ProtectionLevel::default(),
        matched_label: DEFAULT_LABEL.to_string(),
    }
}

/// Classify by the final component of `path`; parent directories never
/// influence the result.
pub fn classify_path(path: &Path) -> Classification {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    classify(&name)
}
