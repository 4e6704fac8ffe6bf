//! Reward Model
//!
//! Blends the outcome reward (two-judge AI score + semantic similarity), the
//! process heuristics and the cost penalty into one `total_reward`. Non-finite
//! values never leave this boundary: any NaN or infinity fails the iteration.

pub mod cost;
pub mod judge;
pub mod process;

pub use judge::JudgePanel;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::config::RewardWeights;
use crate::engines::{cosine_similarity, Embedder};
use cost::CostModel;

/// One judge's recorded contribution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JudgeScore {
    pub model: String,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

/// Everything recorded about the judge protocol for one variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JudgeInfo {
    pub judges: Vec<JudgeScore>,
    pub tie_breaker_used: bool,
    pub final_score: Option<f64>,
}

/// Inputs to one scoring call.
#[derive(Debug, Clone)]
pub struct ScoreContext {
    pub task_class: String,
    pub task: String,
    pub output: String,
    pub assertions: Vec<String>,
    pub expected: Option<String>,
    pub duration_ms: u64,
    pub tool_calls: u32,
    pub tokens_estimate: u64,
}

/// The scored components for one variant.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredVariant {
    pub outcome_reward: f64,
    pub process_reward: f64,
    pub cost_penalty: f64,
    pub total_reward: f64,
    pub judge_info: JudgeInfo,
}

pub struct RewardModel {
    weights: RewardWeights,
    panel: JudgePanel,
    embedder: Arc<dyn Embedder>,
    cost: Mutex<CostModel>,
}

impl RewardModel {
    pub fn new(weights: RewardWeights, panel: JudgePanel, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            weights,
            panel,
            embedder,
            cost: Mutex::new(CostModel::default()),
        }
    }

    pub fn weights(&self) -> &RewardWeights {
        &self.weights
    }

    /// Score one output. Judge calls run concurrently; a failed judge degrades
    /// the outcome toward semantic similarity instead of failing the call.
    pub async fn score(&self, ctx: &ScoreContext) -> Result<ScoredVariant> {
        let (ai_score, judge_info) = self.panel.evaluate(&ctx.task, &ctx.output).await;
        let semantic = self.semantic_similarity(ctx).await;

        let outcome = match (ai_score, semantic) {
            (Some(ai), Some(sim)) => {
                self.weights.ai_blend * ai + self.weights.semantic_blend * sim
            }
            // Outcome degrades to the surviving signal.
            (Some(ai), None) => ai,
            (None, Some(sim)) => sim,
            (None, None) => 0.0,
        };

        let process = process::process_reward(&ctx.output, &ctx.assertions);

        let raw_cost = cost::raw_cost(ctx.duration_ms, ctx.tool_calls, ctx.tokens_estimate);
        let cost_penalty = {
            let mut model = self.cost.lock().expect("cost model lock");
            model.penalty(&ctx.task_class, raw_cost)
        };

        let total = self.weights.alpha * outcome
            + self.weights.beta_process * process
            + self.weights.gamma_cost * cost_penalty;

        for (name, value) in [
            ("outcome", outcome),
            ("process", process),
            ("cost_penalty", cost_penalty),
            ("total", total),
        ] {
            if !value.is_finite() {
                return Err(anyhow!("non-finite {} reward component", name));
            }
        }

        debug!(outcome, process, cost_penalty, total, "scored variant");

        Ok(ScoredVariant {
            outcome_reward: outcome,
            process_reward: process,
            cost_penalty,
            total_reward: total,
            judge_info,
        })
    }

    async fn semantic_similarity(&self, ctx: &ScoreContext) -> Option<f64> {
        let reference = match &ctx.expected {
            Some(expected) => format!("{}\n{}", ctx.task, expected),
            None => ctx.task.clone(),
        };
        let (output_vec, reference_vec) = futures_util::future::try_join(
            self.embedder.embed(&ctx.output),
            self.embedder.embed(&reference),
        )
        .await
        .ok()?;
        let sim = cosine_similarity(&output_vec, &reference_vec);
        sim.is_finite().then_some(sim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JudgeModel;
    use crate::engines::{JudgeEngine, JudgeVerdict};
    use async_trait::async_trait;
    use std::time::Duration;

    struct FixedJudge {
        scores: Vec<f64>,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl JudgeEngine for FixedJudge {
        async fn judge(&self, _model: &str, _task: &str, _output: &str) -> Result<JudgeVerdict> {
            let i = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let score = *self.scores.get(i).unwrap_or(&0.5);
            Ok(JudgeVerdict { score, rationale: None, duration_ms: 1 })
        }
    }

    struct FixedEmbedder;

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            // Orthogonal-ish toy embedding over character length parity.
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    fn panel(scores: Vec<f64>) -> JudgePanel {
        let pool = |model: &str| vec![JudgeModel { model: model.to_string(), weight: 1 }];
        JudgePanel::new(
            Arc::new(FixedJudge { scores, calls: Default::default() }),
            pool("j1"),
            pool("j2"),
            pool("j3"),
            Duration::from_secs(5),
            0.3,
        )
    }

    fn ctx() -> ScoreContext {
        ScoreContext {
            task_class: "code".to_string(),
            task: "Write a function".to_string(),
            output: "fn f() {}".to_string(),
            assertions: Vec::new(),
            expected: None,
            duration_ms: 1000,
            tool_calls: 0,
            tokens_estimate: 100,
        }
    }

    #[tokio::test]
    async fn test_total_reward_identity() {
        let model = RewardModel::new(
            RewardWeights::default(),
            panel(vec![0.8, 0.8]),
            Arc::new(FixedEmbedder),
        );
        let scored = model.score(&ctx()).await.unwrap();
        let w = RewardWeights::default();
        let expected = w.alpha * scored.outcome_reward
            + w.beta_process * scored.process_reward
            + w.gamma_cost * scored.cost_penalty;
        assert!((scored.total_reward - expected).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_first_observation_has_zero_cost_penalty() {
        let model = RewardModel::new(
            RewardWeights::default(),
            panel(vec![0.5, 0.5]),
            Arc::new(FixedEmbedder),
        );
        let scored = model.score(&ctx()).await.unwrap();
        assert!(scored.cost_penalty.abs() < 1e-9);
    }
}
