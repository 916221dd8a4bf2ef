//! Position sizing
//!
//! Bigger entries for stronger confluence, bounded on both sides. The risk
//! manager still applies the equity-based cap afterwards.

use crate::config::{sol_to_lamports, RiskConfig};

pub struct PositionSizer {
    base: u64,
    min: u64,
    max: u64,
    score_scaling: bool,
    emit_threshold: f64,
    max_multiplier: f64,
}

impl PositionSizer {
    pub fn new(config: &RiskConfig, emit_threshold: f64) -> Self {
        Self {
            base: sol_to_lamports(config.base_size_sol),
            min: sol_to_lamports(config.min_size_sol),
            max: sol_to_lamports(config.max_size_sol),
            score_scaling: config.score_scaling,
            emit_threshold,
            max_multiplier: config.max_score_multiplier.max(1.0),
        }
    }

    /// Entry size in lamports for a candidate with this confluence score
    pub fn size_for(&self, score: f64) -> u64 {
        let mut size = self.base as f64;

        if self.score_scaling && self.emit_threshold > 0.0 && score.is_finite() {
            let multiplier = (score / self.emit_threshold).clamp(1.0, self.max_multiplier);
            size *= multiplier;
        }

        (size.round() as u64).clamp(self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizer(scaling: bool) -> PositionSizer {
        let config = RiskConfig {
            base_size_sol: 0.1,
            min_size_sol: 0.01,
            max_size_sol: 0.15,
            score_scaling: scaling,
            max_score_multiplier: 2.0,
            ..RiskConfig::default()
        };
        PositionSizer::new(&config, 0.7)
    }

    #[test]
    fn test_threshold_score_gets_base_size() {
        assert_eq!(sizer(true).size_for(0.7), 100_000_000);
    }

    #[test]
    fn test_scaling_is_capped_by_max_size() {
        // 1.4 / 0.7 = 2x base = 0.2 SOL, clamped to 0.15
        assert_eq!(sizer(true).size_for(1.4), 150_000_000);
        // 0.84 / 0.7 = 1.2x
        assert_eq!(sizer(true).size_for(0.84), 120_000_000);
    }

    #[test]
    fn test_scaling_disabled() {
        assert_eq!(sizer(false).size_for(5.0), 100_000_000);
    }
}
