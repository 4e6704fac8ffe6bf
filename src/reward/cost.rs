//! Cost Penalty
//!
//! Normalizes an iteration's raw cost against a rolling per-task-class
//! baseline. The penalty is the normalized cost minus one, so staying under
//! baseline yields a negative penalty.

use std::collections::HashMap;

const W_TIME_MS: f64 = 1.0;
const W_TOOL_CALLS: f64 = 50.0;
const W_TOKENS: f64 = 0.05;

/// Exponential moving average factor for the rolling baseline.
const BASELINE_EMA: f64 = 0.2;

const COST_CLIP_MAX: f64 = 3.0;

pub fn raw_cost(duration_ms: u64, tool_calls: u32, tokens_estimate: u64) -> f64 {
    W_TIME_MS * duration_ms as f64
        + W_TOOL_CALLS * tool_calls as f64
        + W_TOKENS * tokens_estimate as f64
}

#[derive(Debug, Default)]
pub struct CostModel {
    baselines: HashMap<String, f64>,
}

impl CostModel {
    /// Compute the penalty for one observation and fold it into the baseline.
    /// The first observation for a class defines its baseline (penalty 0).
    pub fn penalty(&mut self, task_class: &str, raw: f64) -> f64 {
        let raw = raw.max(0.0);
        let baseline = self.baselines.get(task_class).copied();
        let penalty = match baseline {
            Some(base) if base > 0.0 => (raw / base).clamp(0.0, COST_CLIP_MAX) - 1.0,
            _ => 0.0,
        };

        let next = match baseline {
            Some(base) => (1.0 - BASELINE_EMA) * base + BASELINE_EMA * raw,
            None => raw,
        };
        self.baselines.insert(task_class.to_string(), next);

        penalty
    }

    pub fn baseline(&self, task_class: &str) -> Option<f64> {
        self.baselines.get(task_class).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_is_neutral() {
        let mut model = CostModel::default();
        assert_eq!(model.penalty("code", 1000.0), 0.0);
        assert_eq!(model.baseline("code"), Some(1000.0));
    }

    #[test]
    fn test_under_baseline_is_negative() {
        let mut model = CostModel::default();
        model.penalty("code", 1000.0);
        let penalty = model.penalty("code", 500.0);
        assert!((penalty - (-0.5)).abs() < 1e-9);
    }

    #[test]
    fn test_penalty_clips_at_two() {
        let mut model = CostModel::default();
        model.penalty("code", 100.0);
        // 100x the baseline clips at the cost ceiling of 3, penalty 2.
        let penalty = model.penalty("code", 10_000.0);
        assert!((penalty - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_baseline_moves_toward_observations() {
        let mut model = CostModel::default();
        model.penalty("code", 1000.0);
        model.penalty("code", 2000.0);
        let base = model.baseline("code").unwrap();
        assert!(base > 1000.0 && base < 2000.0);
    }

    #[test]
    fn test_classes_are_independent() {
        let mut model = CostModel::default();
        model.penalty("code", 1000.0);
        assert_eq!(model.penalty("prose", 5000.0), 0.0);
    }

    #[test]
    fn test_raw_cost_blend() {
        let cost = raw_cost(1000, 2, 400);
        assert!((cost - (1000.0 + 100.0 + 20.0)).abs() < 1e-9);
    }
}
