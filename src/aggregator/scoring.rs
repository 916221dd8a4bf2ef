//! Confluence scoring
//!
//! A score is computed over the set of DISTINCT sources that reported a
//! token inside one window. Repeats from one source never add anything.
//! Both formulas are monotone non-decreasing in the source set because
//! every weight is clamped to [0, 1].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How distinct source weights combine into a score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreFormula {
    /// Sum of weights
    #[default]
    WeightedSum,
    /// 1 - prod(1 - w): independent-evidence combination, bounded by 1
    NoisyOr,
}

#[derive(Debug, Clone)]
pub struct ConfluenceScorer {
    formula: ScoreFormula,
    weights: HashMap<String, f64>,
}

impl ConfluenceScorer {
    pub fn new(formula: ScoreFormula, weights: HashMap<String, f64>) -> Self {
        Self { formula, weights }
    }

    /// Effective weight for a source: table entry, else the signal's own weight
    pub fn weight_for(&self, source_id: &str, fallback: f64) -> f64 {
        let w = self.weights.get(source_id).copied().unwrap_or(fallback);
        if w.is_finite() {
            w.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Score a set of distinct-source weights
    pub fn score<I>(&self, weights: I) -> f64
    where
        I: IntoIterator<Item = f64>,
    {
        match self.formula {
            ScoreFormula::WeightedSum => weights.into_iter().sum(),
            ScoreFormula::NoisyOr => 1.0 - weights.into_iter().map(|w| 1.0 - w).product::<f64>(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_sum() {
        let scorer = ConfluenceScorer::new(ScoreFormula::WeightedSum, HashMap::new());
        assert!((scorer.score([0.4, 0.4]) - 0.8).abs() < 1e-9);
        assert_eq!(scorer.score(std::iter::empty()), 0.0);
    }

    #[test]
    fn test_noisy_or() {
        let scorer = ConfluenceScorer::new(ScoreFormula::NoisyOr, HashMap::new());
        // 1 - 0.6 * 0.6 = 0.64
        assert!((scorer.score([0.4, 0.4]) - 0.64).abs() < 1e-9);
        assert!(scorer.score([1.0, 0.3]) <= 1.0);
    }

    #[test]
    fn test_weight_table_overrides_and_clamps() {
        let mut table = HashMap::new();
        table.insert("twitter".to_string(), 0.25);
        table.insert("broken".to_string(), 7.0);
        let scorer = ConfluenceScorer::new(ScoreFormula::WeightedSum, table);

        assert_eq!(scorer.weight_for("twitter", 0.9), 0.25);
        assert_eq!(scorer.weight_for("unknown", 0.9), 0.9);
        assert_eq!(scorer.weight_for("broken", 0.1), 1.0);
        assert_eq!(scorer.weight_for("unknown", f64::NAN), 0.0);
        assert_eq!(scorer.weight_for("unknown", -0.5), 0.0);
    }

    #[test]
    fn test_monotone_in_distinct_sources() {
        let weights = [0.05, 0.4, 0.0, 0.2, 1.0, 0.33];
        for formula in [ScoreFormula::WeightedSum, ScoreFormula::NoisyOr] {
            let scorer = ConfluenceScorer::new(formula, HashMap::new());
            let mut last = 0.0;
            for n in 0..=weights.len() {
                let s = scorer.score(weights[..n].iter().copied());
                assert!(s >= last, "{:?} decreased at {} sources", formula, n);
                last = s;
            }
        }
    }
}
