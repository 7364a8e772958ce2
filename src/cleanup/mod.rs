//! Offline cleanup: rule-based deletion candidates and the local trash.

pub mod selector;
pub mod trash;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use selector::{group_by_reason, select_candidates, Candidate};

/// A declarative deletion rule. Rules are evaluated in order and the first
/// match wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Rule {
    #[serde(rename = "age_and_size", alias = "age-and-size")]
    AgeAndSize { min_age_years: f64, min_size_mb: f64 },
    #[serde(rename = "age_and_duration", alias = "age-and-duration")]
    AgeAndDuration {
        min_age_years: f64,
        #[serde(alias = "max_duration_secs")]
        max_duration_sec: f64,
    },
}

impl Rule {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AgeAndSize { .. } => "age-and-size",
            Self::AgeAndDuration { .. } => "age-and-duration",
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AgeAndSize {
                min_age_years,
                min_size_mb,
            } => write!(f, "{} (age >= {}y, size >= {}MB)", self.name(), min_age_years, min_size_mb),
            Self::AgeAndDuration {
                min_age_years,
                max_duration_sec,
            } => write!(
                f,
                "{} (age >= {}y, duration <= {}s)",
                self.name(),
                min_age_years,
                max_duration_sec
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindRules {
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

fn enabled_default() -> bool {
    true
}

/// Per-kind rule configuration, keyed `photos` and `videos` in the config
/// file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionCriteria {
    #[serde(default = "KindRules::no_rules")]
    pub photos: KindRules,
    #[serde(default = "KindRules::no_rules")]
    pub videos: KindRules,
}

impl KindRules {
    fn no_rules() -> Self {
        Self {
            enabled: true,
            rules: Vec::new(),
        }
    }
}

impl Default for SelectionCriteria {
    fn default() -> Self {
        Self {
            photos: KindRules::no_rules(),
            videos: KindRules {
                enabled: true,
                rules: vec![
                    Rule::AgeAndSize {
                        min_age_years: 2.0,
                        min_size_mb: 100.0,
                    },
                    Rule::AgeAndDuration {
                        min_age_years: 1.0,
                        max_duration_sec: 5.0,
                    },
                ],
            },
        }
    }
}

impl SelectionCriteria {
    pub fn rule_count(&self) -> usize {
        let enabled = |k: &KindRules| if k.enabled { k.rules.len() } else { 0 };
        enabled(&self.photos) + enabled(&self.videos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_criteria() {
        let c = SelectionCriteria::default();
        assert!(c.photos.enabled);
        assert!(c.photos.rules.is_empty());
        assert_eq!(c.videos.rules.len(), 2);
        assert_eq!(c.rule_count(), 2);
    }

    #[test]
    fn test_parse_rules_with_aliases() {
        let json = r#"{
            "videos": {"enabled": true, "rules": [
                {"type": "age_and_size", "min_age_years": 3, "min_size_mb": 500},
                {"type": "age-and-duration", "min_age_years": 1, "max_duration_secs": 2.5}
            ]},
            "photos": {"enabled": false}
        }"#;
        let c: SelectionCriteria = serde_json::from_str(json).unwrap();
        assert_eq!(
            c.videos.rules[0],
            Rule::AgeAndSize {
                min_age_years: 3.0,
                min_size_mb: 500.0
            }
        );
        assert_eq!(
            c.videos.rules[1],
            Rule::AgeAndDuration {
                min_age_years: 1.0,
                max_duration_sec: 2.5
            }
        );
        assert!(!c.photos.enabled);
        assert_eq!(c.rule_count(), 2);
    }

    #[test]
    fn test_unknown_rule_type_rejected() {
        let json = r#"{"videos": {"rules": [{"type": "blurry"}]}}"#;
        assert!(serde_json::from_str::<SelectionCriteria>(json).is_err());
    }

    #[test]
    fn test_rule_display() {
        let r = Rule::AgeAndSize {
            min_age_years: 2.0,
            min_size_mb: 100.0,
        };
        assert_eq!(r.to_string(), "age-and-size (age >= 2y, size >= 100MB)");
    }
}
