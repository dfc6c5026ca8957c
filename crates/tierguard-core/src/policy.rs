//! Static level → policy class table.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::level::ProtectionLevel;

/// Behaviour profile for a range of protection levels.
///
/// Variants are declared loosest first, so the derived `Ord` ranks them by
/// strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyClass {
    None,
    Minimal,
    Moderate,
    Strict,
    Absolute,
}

impl PolicyClass {
    pub const ALL: [PolicyClass; 5] = [
        PolicyClass::Absolute,
        PolicyClass::Strict,
        PolicyClass::Moderate,
        PolicyClass::Minimal,
        PolicyClass::None,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Minimal => "minimal",
            Self::Moderate => "moderate",
            Self::Strict => "strict",
            Self::Absolute => "absolute",
        }
    }

    /// Inclusive level range mapped to this class.
    pub fn level_range(&self) -> (u8, u8) {
        match self {
            Self::Absolute => (9, 10),
            Self::Strict => (7, 8),
            Self::Moderate => (4, 6),
            Self::Minimal => (1, 3),
            Self::None => (0, 0),
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Absolute => "read and append only; never modified, overwritten or deleted",
            Self::Strict => "delete needs confirmation and a backup; modify needs a backup",
            Self::Moderate => "destructive operations need a stated reason",
            Self::Minimal => "everything allowed; destructive operations are logged",
            Self::None => "no restrictions",
        }
    }
}

impl fmt::Display for PolicyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compensating controls a class demands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTag {
    AppendOnly,
    ConfirmUser,
    ConfirmBackup,
    ConfirmReason,
    LogChange,
}

impl ActionTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AppendOnly => "append_only",
            Self::ConfirmUser => "confirm_user",
            Self::ConfirmBackup => "confirm_backup",
            Self::ConfirmReason => "confirm_reason",
            Self::LogChange => "log_change",
        }
    }
}

impl fmt::Display for ActionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn class_for(level: ProtectionLevel) -> PolicyClass {
    match level.value() {
        9..=10 => PolicyClass::Absolute,
        7..=8 => PolicyClass::Strict,
        4..=6 => PolicyClass::Moderate,
        1..=3 => PolicyClass::Minimal,
        _ => PolicyClass::None,
    }
}

pub fn required_actions(class: PolicyClass) -> &'static [ActionTag] {
    match class {
        PolicyClass::Absolute => &[ActionTag::AppendOnly],
        PolicyClass::Strict => &[ActionTag::ConfirmUser, ActionTag::ConfirmBackup],
        PolicyClass::Moderate => &[ActionTag::ConfirmReason],
        PolicyClass::Minimal => &[ActionTag::LogChange],
        PolicyClass::None => &[],
    }
}

/// One row of the printable policy table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRow {
    pub class: PolicyClass,
    pub min_level: u8,
    pub max_level: u8,
    pub required_actions: Vec<ActionTag>,
    pub description: &'static str,
}

/// The whole table, strictest class first.
pub fn policy_table() -> Vec<PolicyRow> {
    PolicyClass::ALL
        .iter()
        .map(|class| {
            let (min_level, max_level) = class.level_range();
            PolicyRow {
                class: *class,
                min_level,
                max_level,
                required_actions: required_actions(*class).to_vec(),
                description: class.description(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(v: u8) -> ProtectionLevel {
        ProtectionLevel::new(v).unwrap()
    }

    #[test]
    fn table_matches_fixed_ranges() {
        let expected = [
            (0, PolicyClass::None),
            (1, PolicyClass::Minimal),
            (2, PolicyClass::Minimal),
            (3, PolicyClass::Minimal),
            (4, PolicyClass::Moderate),
            (5, PolicyClass::Moderate),
            (6, PolicyClass::Moderate),
            (7, PolicyClass::Strict),
            (8, PolicyClass::Strict),
            (9, PolicyClass::Absolute),
            (10, PolicyClass::Absolute),
        ];
        for (v, class) in expected {
            assert_eq!(class_for(level(v)), class, "level {v}");
        }
    }

    #[test]
    fn protection_never_decreases_with_level() {
        let levels: Vec<ProtectionLevel> = ProtectionLevel::all().collect();
        for a in &levels {
            for b in &levels {
                if a < b {
                    assert!(
                        class_for(*a) <= class_for(*b),
                        "{a} maps to {} but {b} maps to {}",
                        class_for(*a),
                        class_for(*b)
                    );
                }
            }
        }
    }

    #[test]
    fn ranges_are_total_and_disjoint() {
        let mut seen = [0u8; 11];
        for class in PolicyClass::ALL {
            let (lo, hi) = class.level_range();
            for v in lo..=hi {
                seen[v as usize] += 1;
                assert_eq!(class_for(level(v)), class);
            }
        }
        assert!(seen.iter().all(|count| *count == 1));
    }

    #[test]
    fn required_actions_per_class() {
        assert_eq!(required_actions(PolicyClass::Absolute), &[ActionTag::AppendOnly]);
        assert!(required_actions(PolicyClass::Strict).contains(&ActionTag::ConfirmBackup));
        assert_eq!(required_actions(PolicyClass::Moderate), &[ActionTag::ConfirmReason]);
        assert_eq!(required_actions(PolicyClass::Minimal), &[ActionTag::LogChange]);
        assert!(required_actions(PolicyClass::None).is_empty());
    }

    #[test]
    fn printable_table_is_strictest_first() {
        let table = policy_table();
        assert_eq!(table.len(), 5);
        assert_eq!(table[0].class, PolicyClass::Absolute);
        assert_eq!((table[0].min_level, table[0].max_level), (9, 10));
        assert_eq!(table[4].class, PolicyClass::None);
        let json = serde_json::to_value(&table).unwrap();
        assert_eq!(json[1]["class"], "strict");
        assert_eq!(json[1]["requiredActions"][1], "confirm_backup");
    }
}
