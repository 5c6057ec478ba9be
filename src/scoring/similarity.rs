//! Pairwise similarity policies
//!
//! Every policy must be symmetric and give `1.0` when a result is compared
//! with itself.

use crate::run::AgentResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Debug;

/// Similarity between two agent results, in `[0, 1]`
pub trait Similarity: Send + Sync + Debug {
    /// Compare two results
    fn similarity(&self, a: &AgentResult, b: &AgentResult) -> f64;

    /// Policy name for logging
    fn name(&self) -> &str;
}

/// Built-in similarity policies, selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringPolicy {
    /// Identical results only
    #[default]
    Exact,
    /// Identical after case-folding and whitespace collapse
    Normalized,
    /// Jaccard overlap of word sets
    TokenOverlap,
}

impl ScoringPolicy {
    /// Instantiate the policy
    pub fn similarity(&self) -> Box<dyn Similarity> {
        match self {
            Self::Exact => Box::new(ExactMatch),
            Self::Normalized => Box::new(NormalizedMatch),
            Self::TokenOverlap => Box::new(TokenOverlap),
        }
    }
}

impl std::str::FromStr for ScoringPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(Self::Exact),
            "normalized" => Ok(Self::Normalized),
            "token_overlap" | "token-overlap" => Ok(Self::TokenOverlap),
            other => Err(format!("unknown scoring policy '{}'", other)),
        }
    }
}

/// 1.0 for identical results, else 0.0
///
/// Two structured results compare as JSON values; any other pairing compares
/// rendered text.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatch;

impl Similarity for ExactMatch {
    fn similarity(&self, a: &AgentResult, b: &AgentResult) -> f64 {
        let equal = match (a, b) {
            (AgentResult::Structured(x), AgentResult::Structured(y)) => x == y,
            _ => a.as_text() == b.as_text(),
        };
        if equal {
            1.0
        } else {
            0.0
        }
    }

    fn name(&self) -> &str {
        "exact"
    }
}

/// Exact match after lower-casing and collapsing whitespace
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizedMatch;

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

impl Similarity for NormalizedMatch {
    fn similarity(&self, a: &AgentResult, b: &AgentResult) -> f64 {
        if normalize(&a.as_text()) == normalize(&b.as_text()) {
            1.0
        } else {
            0.0
        }
    }

    fn name(&self) -> &str {
        "normalized"
    }
}

/// Jaccard index over lower-cased alphanumeric words
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenOverlap;

fn tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

impl Similarity for TokenOverlap {
    fn similarity(&self, a: &AgentResult, b: &AgentResult) -> f64 {
        let left = tokens(&a.as_text());
        let right = tokens(&b.as_text());

        let union = left.union(&right).count();
        if union == 0 {
            return 1.0;
        }
        let shared = left.intersection(&right).count();
        shared as f64 / union as f64
    }

    fn name(&self) -> &str {
        "token_overlap"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn all_policies() -> Vec<Box<dyn Similarity>> {
        vec![Box::new(ExactMatch), Box::new(NormalizedMatch), Box::new(TokenOverlap)]
    }

    #[test]
    fn test_reflexive_and_symmetric() {
        let samples = [
            AgentResult::text("Ship it"),
            AgentResult::text("do not ship"),
            AgentResult::structured(json!({"vote": "yes", "confidence": 0.9})),
            AgentResult::text(""),
        ];
        for policy in all_policies() {
            for a in &samples {
                assert_eq!(policy.similarity(a, a), 1.0, "{} not reflexive", policy.name());
                for b in &samples {
                    assert_eq!(
                        policy.similarity(a, b),
                        policy.similarity(b, a),
                        "{} not symmetric",
                        policy.name()
                    );
                }
            }
        }
    }

    #[test]
    fn test_exact_match() {
        let policy = ExactMatch;
        assert_eq!(policy.similarity(&"yes".into(), &"yes".into()), 1.0);
        assert_eq!(policy.similarity(&"yes".into(), &"Yes".into()), 0.0);
        assert_eq!(
            policy.similarity(&AgentResult::structured(json!("yes")), &"yes".into()),
            1.0
        );
        assert_eq!(
            policy.similarity(
                &AgentResult::structured(json!({"a": 1, "b": 2})),
                &AgentResult::structured(json!({"b": 2, "a": 1}))
            ),
            1.0
        );
    }

    #[test]
    fn test_normalized_match() {
        let policy = NormalizedMatch;
        assert_eq!(policy.similarity(&"  Approve\n".into(), &"approve".into()), 1.0);
        assert_eq!(policy.similarity(&"approve".into(), &"reject".into()), 0.0);
    }

    #[test]
    fn test_token_overlap() {
        let policy = TokenOverlap;
        assert_eq!(policy.similarity(&"ship the build".into(), &"Ship the build!".into()), 1.0);
        assert_eq!(policy.similarity(&"alpha beta".into(), &"alpha".into()), 0.5);
        assert_eq!(policy.similarity(&"alpha".into(), &"beta".into()), 0.0);
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("exact".parse::<ScoringPolicy>(), Ok(ScoringPolicy::Exact));
        assert_eq!("Token-Overlap".parse::<ScoringPolicy>(), Ok(ScoringPolicy::TokenOverlap));
        assert!("cosine".parse::<ScoringPolicy>().is_err());
    }
}
