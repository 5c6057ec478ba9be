//! Consensus scoring
//!
//! Agreement is the arithmetic mean of pairwise similarity over every
//! unordered pair of successful results. A single outlier among many agreeing
//! agents lowers the score without zeroing it.

pub mod similarity;

pub use similarity::{ExactMatch, NormalizedMatch, ScoringPolicy, Similarity, TokenOverlap};

use crate::run::AgentResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Minimum number of successful results needed to judge agreement
pub const MIN_CONSENSUS_RESULTS: usize = 2;

/// Outcome of scoring a set of results against a threshold
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConsensusDecision {
    /// Mean pairwise similarity in `[0, 1]`
    pub score: f64,
    /// `score >= threshold`
    pub reached: bool,
    /// Number of pairs compared
    pub pairs: usize,
}

/// Computes agreement among successful agent results
#[derive(Debug, Clone)]
pub struct ConsensusScorer {
    similarity: Arc<dyn Similarity>,
}

impl ConsensusScorer {
    /// Create a scorer with a similarity policy
    pub fn new(similarity: Arc<dyn Similarity>) -> Self {
        Self { similarity }
    }

    /// Create a scorer from a built-in policy
    pub fn from_policy(policy: ScoringPolicy) -> Self {
        Self::new(Arc::from(policy.similarity()))
    }

    /// Name of the similarity policy in use
    pub fn policy_name(&self) -> &str {
        self.similarity.name()
    }

    /// Mean pairwise similarity; `0.0` with fewer than two results
    pub fn score(&self, results: &[AgentResult]) -> f64 {
        self.score_pairs(results).0
    }

    /// Score and compare against a threshold (inclusive)
    pub fn decide(&self, results: &[AgentResult], threshold: f64) -> ConsensusDecision {
        let (score, pairs) = self.score_pairs(results);
        ConsensusDecision {
            score,
            reached: pairs > 0 && score >= threshold,
            pairs,
        }
    }

    fn score_pairs(&self, results: &[AgentResult]) -> (f64, usize) {
        if results.len() < MIN_CONSENSUS_RESULTS {
            return (0.0, 0);
        }

        let mut total = 0.0;
        let mut pairs = 0usize;
        for (i, a) in results.iter().enumerate() {
            for b in &results[i + 1..] {
                let value = self.similarity.similarity(a, b);
                total += if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
                pairs += 1;
            }
        }

        (total / pairs as f64, pairs)
    }
}

impl Default for ConsensusScorer {
    fn default() -> Self {
        Self::from_policy(ScoringPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(values: &[&str]) -> Vec<AgentResult> {
        values.iter().map(|v| AgentResult::text(*v)).collect()
    }

    #[test]
    fn test_identical_results_score_one() {
        let scorer = ConsensusScorer::default();
        let decision = scorer.decide(&texts(&["yes", "yes", "yes"]), 1.0);
        assert_eq!(decision.score, 1.0);
        assert_eq!(decision.pairs, 3);
        assert!(decision.reached);
    }

    #[test]
    fn test_yes_yes_no_scores_one_third() {
        let scorer = ConsensusScorer::default();
        let decision = scorer.decide(&texts(&["yes", "yes", "no"]), 0.6);
        assert!((decision.score - 1.0 / 3.0).abs() < 1e-9);
        assert!(!decision.reached);
    }

    #[test]
    fn test_two_agents_reduce_to_single_pair() {
        let scorer = ConsensusScorer::default();
        let decision = scorer.decide(&texts(&["approve", "approve"]), 0.5);
        assert_eq!(decision.score, 1.0);
        assert_eq!(decision.pairs, 1);
        assert!(decision.reached);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let scorer = ConsensusScorer::from_policy(ScoringPolicy::TokenOverlap);
        let decision = scorer.decide(&texts(&["alpha beta", "alpha"]), 0.5);
        assert_eq!(decision.score, 0.5);
        assert!(decision.reached);
    }

    #[test]
    fn test_fewer_than_two_results() {
        let scorer = ConsensusScorer::default();
        assert_eq!(scorer.score(&[]), 0.0);
        let decision = scorer.decide(&texts(&["yes"]), 0.5);
        assert_eq!(decision.score, 0.0);
        assert!(!decision.reached);
    }

    #[derive(Debug)]
    struct Overshoot;

    impl Similarity for Overshoot {
        fn similarity(&self, _a: &AgentResult, _b: &AgentResult) -> f64 {
            1.7
        }

        fn name(&self) -> &str {
            "overshoot"
        }
    }

    #[test]
    fn test_custom_policy_is_clamped() {
        let scorer = ConsensusScorer::new(Arc::new(Overshoot));
        assert_eq!(scorer.policy_name(), "overshoot");
        assert_eq!(scorer.score(&texts(&["a", "b"])), 1.0);
    }

    #[derive(Debug)]
    struct Undefined;

    impl Similarity for Undefined {
        fn similarity(&self, _a: &AgentResult, _b: &AgentResult) -> f64 {
            f64::NAN
        }

        fn name(&self) -> &str {
            "undefined"
        }
    }

    #[test]
    fn test_non_finite_similarity_counts_as_disagreement() {
        let scorer = ConsensusScorer::new(Arc::new(Undefined));
        let decision = scorer.decide(&texts(&["a", "a", "a"]), 0.5);
        assert_eq!(decision.score, 0.0);
        assert!(!decision.reached);
    }
}
