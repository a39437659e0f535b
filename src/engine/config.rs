use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::domain::Thresholds;

/// Errors from loading or validating a rule configuration file.
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("rule file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("failed to read rule file: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Parse(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("rule engine not initialized")]
    NotInitialized,
}

/// A single risk rule: a weighted expression over the rule context.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub expression: String,
    pub weight: f64,
    pub enabled: bool,
    pub description: String,
}

/// Runtime statistics for one rule, accumulated across evaluations.
///
/// Counters are monotonic between [`RuleEngine::reset_statistics`]
/// calls.
///
/// [`RuleEngine::reset_statistics`]: crate::engine::RuleEngine::reset_statistics
#[derive(Debug, Clone, Default)]
pub struct RuleStats {
    pub evaluation_count: u64,
    pub hit_count: u64,
    pub total_evaluation_time: Duration,
}

impl RuleStats {
    /// Hit rate as a percentage of evaluations.
    pub fn hit_rate(&self) -> f64 {
        if self.evaluation_count == 0 {
            0.0
        } else {
            self.hit_count as f64 / self.evaluation_count as f64 * 100.0
        }
    }

    /// Mean evaluation time.
    pub fn avg_evaluation_time(&self) -> Duration {
        if self.evaluation_count == 0 {
            Duration::ZERO
        } else {
            self.total_evaluation_time / self.evaluation_count as u32
        }
    }
}

/// An immutable, validated rule configuration.
///
/// Rules are held in priority order (weight descending). The active
/// configuration is swapped wholesale on reload; evaluations hold an
/// `Arc` snapshot for their full pass.
#[derive(Debug, Clone)]
pub struct RuleConfig {
    pub version: String,
    pub rules: Vec<Rule>,
    pub thresholds: Thresholds,
    pub loaded_at: DateTime<Utc>,
}

impl RuleConfig {
    /// An empty placeholder configuration (engine not yet loaded).
    pub fn empty() -> Self {
        RuleConfig {
            version: "0.0.0".to_string(),
            rules: Vec::new(),
            thresholds: Thresholds::default(),
            loaded_at: Utc::now(),
        }
    }

    /// Enabled rules in priority order.
    pub fn enabled_rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| r.enabled)
    }

    /// Find a rule by id.
    pub fn find_rule(&self, rule_id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == rule_id)
    }

    /// Parse and validate a rule configuration from JSON text.
    ///
    /// Unknown fields are tolerated. A rule missing `id` or `expression`
    /// is skipped with an error logged, matching the loader's contract of
    /// never failing the whole file for one bad rule.
    pub fn from_json_str(content: &str) -> Result<Self, RuleError> {
        let raw: RawRuleFile =
            serde_json::from_str(content).map_err(|e| RuleError::Parse(e.to_string()))?;

        let mut rules = Vec::with_capacity(raw.rules.len());
        for (index, raw_rule) in raw.rules.into_iter().enumerate() {
            let Some(id) = raw_rule.id else {
                error!(index, "rule missing id, skipping");
                continue;
            };
            let Some(expression) = raw_rule.expression else {
                error!(rule_id = %id, "rule missing expression, skipping");
                continue;
            };

            rules.push(Rule {
                name: raw_rule.name.unwrap_or_else(|| id.clone()),
                id,
                expression,
                weight: raw_rule.weight.unwrap_or(1.0),
                enabled: raw_rule.enabled.unwrap_or(true),
                description: raw_rule.description.unwrap_or_default(),
            });
        }

        // Duplicate ids would make statistics and audit trails ambiguous
        let mut seen = HashSet::new();
        for rule in &rules {
            if !seen.insert(rule.id.as_str()) {
                return Err(RuleError::Validation(format!(
                    "duplicate rule id: {}",
                    rule.id
                )));
            }
        }

        let thresholds = raw.thresholds.unwrap_or_default();
        if !thresholds.is_valid() {
            return Err(RuleError::Validation(format!(
                "thresholds must satisfy 0 <= approve ({}) < review ({}) <= 100",
                thresholds.approve_threshold, thresholds.review_threshold
            )));
        }

        // Priority order: weight descending
        rules.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let config = RuleConfig {
            version: raw.version.unwrap_or_else(|| "1.0.0".to_string()),
            rules,
            thresholds,
            loaded_at: Utc::now(),
        };

        if config.rules.is_empty() {
            warn!(version = %config.version, "rule configuration contains no usable rules");
        }

        Ok(config)
    }

    /// Parse and validate a rule configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(RuleError::FileNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&content)?;
        info!(
            path = %path.display(),
            version = %config.version,
            rules = config.rules.len(),
            "rule configuration loaded"
        );
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
struct RawRuleFile {
    version: Option<String>,
    rules: Vec<RawRule>,
    thresholds: Option<Thresholds>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    id: Option<String>,
    name: Option<String>,
    expression: Option<String>,
    weight: Option<f64>,
    enabled: Option<bool>,
    description: Option<String>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE_RULES: &str = r#"{
        "version": "2024-06-01.1",
        "rules": [
            {
                "id": "R001",
                "name": "high amount",
                "expression": "amount > 10000",
                "weight": 40.0,
                "description": "large single transaction"
            },
            {
                "id": "R002",
                "name": "risky customer",
                "expression": "customer_risk_score > 70",
                "weight": 60.0
            },
            {
                "id": "R003",
                "name": "disabled probe",
                "expression": "amount > 0",
                "weight": 5.0,
                "enabled": false
            }
        ],
        "thresholds": { "approve_threshold": 30.0, "review_threshold": 70.0 }
    }"#;

    #[test]
    fn test_parse_sorts_by_weight() {
        let config = RuleConfig::from_json_str(SAMPLE_RULES).unwrap();

        assert_eq!(config.version, "2024-06-01.1");
        assert_eq!(config.rules.len(), 3);
        // Priority order: weight descending
        assert_eq!(config.rules[0].id, "R002");
        assert_eq!(config.rules[1].id, "R001");
        assert_eq!(config.rules[2].id, "R003");

        let enabled: Vec<_> = config.enabled_rules().map(|r| r.id.as_str()).collect();
        assert_eq!(enabled, vec!["R002", "R001"]);
    }

    #[test]
    fn test_defaults_applied() {
        let json = r#"{
            "rules": [ { "id": "R1", "expression": "amount > 1" } ]
        }"#;
        let config = RuleConfig::from_json_str(json).unwrap();

        assert_eq!(config.version, "1.0.0");
        assert_eq!(config.rules[0].weight, 1.0);
        assert!(config.rules[0].enabled);
        assert_eq!(config.rules[0].name, "R1");
        assert_eq!(config.thresholds.approve_threshold, 30.0);
    }

    #[test]
    fn test_bad_rules_skipped() {
        let json = r#"{
            "rules": [
                { "name": "no id", "expression": "amount > 1" },
                { "id": "R2" },
                { "id": "R3", "expression": "amount > 3", "unknown_field": true }
            ]
        }"#;
        let config = RuleConfig::from_json_str(json).unwrap();

        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].id, "R3");
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let json = r#"{
            "rules": [
                { "id": "R1", "expression": "amount > 1" },
                { "id": "R1", "expression": "amount > 2" }
            ]
        }"#;
        assert!(matches!(
            RuleConfig::from_json_str(json),
            Err(RuleError::Validation(_))
        ));
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let json = r#"{
            "rules": [],
            "thresholds": { "approve_threshold": 80.0, "review_threshold": 20.0 }
        }"#;
        assert!(matches!(
            RuleConfig::from_json_str(json),
            Err(RuleError::Validation(_))
        ));
    }

    #[test]
    fn test_stats_accessors() {
        let stats = RuleStats {
            evaluation_count: 4,
            hit_count: 1,
            total_evaluation_time: Duration::from_micros(800),
        };
        assert_eq!(stats.hit_rate(), 25.0);
        assert_eq!(stats.avg_evaluation_time(), Duration::from_micros(200));

        assert_eq!(RuleStats::default().hit_rate(), 0.0);
        assert_eq!(RuleStats::default().avg_evaluation_time(), Duration::ZERO);
    }
}
