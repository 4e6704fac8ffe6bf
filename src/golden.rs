//! Golden Set Evaluator
//!
//! Deterministic KPI suite: every item runs with pinned flags (no web, fixed
//! retrieval depth, temperature zero on the local engine), is scored by the
//! reward model, and contributes to an aggregate that gates self-edits.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::engines::GenerationRequest;
use crate::operators::{EngineKind, Recipe};
use crate::reward::{process, RewardModel, ScoreContext};
use crate::runner::Collaborators;
use crate::store::{GoldenItemResult, GoldenKpi, MetaStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GoldenFlags {
    #[serde(default)]
    pub web: bool,
    #[serde(default)]
    pub rag_k: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GoldenItem {
    pub id: String,
    pub task_type: String,
    pub task_class: String,
    pub task: String,
    #[serde(default)]
    pub assertions: Vec<String>,
    #[serde(default)]
    pub inputs: Option<serde_json::Value>,
    #[serde(default)]
    pub expected: Option<String>,
    pub seed: u64,
    pub flags: GoldenFlags,
}

pub fn load_golden_set(path: impl AsRef<Path>) -> Result<Vec<GoldenItem>> {
    let raw = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("cannot read golden set at {}", path.as_ref().display()))?;
    let items: Vec<GoldenItem> =
        serde_json::from_str(&raw).context("golden set JSON is invalid")?;
    Ok(items)
}

pub struct GoldenEvaluator {
    store: MetaStore,
    reward: Arc<RewardModel>,
    collaborators: Collaborators,
    config: EngineConfig,
}

impl GoldenEvaluator {
    pub fn new(
        store: MetaStore,
        reward: Arc<RewardModel>,
        collaborators: Collaborators,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            reward,
            collaborators,
            config,
        }
    }

    /// Evaluate the golden set (optionally a subset of item ids), persist
    /// per-item results plus the aggregate, and return the aggregate.
    pub async fn run(&self, subset: Option<&[String]>) -> Result<GoldenKpi> {
        let mut items = load_golden_set(&self.config.golden_set_path)?;
        if let Some(ids) = subset {
            items.retain(|item| ids.contains(&item.id));
        }
        if items.is_empty() {
            anyhow::bail!("golden set selection is empty");
        }

        let index_hash = self
            .collaborators
            .rag
            .index_hash()
            .await
            .unwrap_or_else(|_| "unavailable".to_string());
        let model_id = self.config.endpoints.local_model.clone();

        let mut results = Vec::with_capacity(items.len());
        for item in &items {
            match self.evaluate_item(item).await {
                Ok(result) => results.push(result),
                Err(err) => {
                    warn!(item = %item.id, "golden item failed: {}", err);
                    results.push(GoldenItemResult {
                        item_id: item.id.clone(),
                        outcome_reward: 0.0,
                        process_reward: 0.0,
                        cost_penalty: 0.0,
                        total_reward: 0.0,
                        steps: 0,
                        passed: false,
                    });
                }
            }
        }

        let count = results.len() as f64;
        let kpi = GoldenKpi {
            avg_total_reward: results.iter().map(|r| r.total_reward).sum::<f64>() / count,
            avg_cost_penalty: results.iter().map(|r| r.cost_penalty).sum::<f64>() / count,
            avg_steps: results.iter().map(|r| r.steps as f64).sum::<f64>() / count,
            pass_rate: results.iter().filter(|r| r.passed).count() as f64 / count,
            items: results.len() as u32,
            model_id,
            index_hash,
            created_at: Utc::now().timestamp(),
        };

        self.store.insert_golden_run(&kpi, &results).await?;
        info!(
            pass_rate = kpi.pass_rate,
            avg_total_reward = kpi.avg_total_reward,
            items = kpi.items,
            "golden evaluation complete"
        );
        Ok(kpi)
    }

    async fn evaluate_item(&self, item: &GoldenItem) -> Result<GoldenItemResult> {
        let recipe = pinned_recipe(item);

        let mut context_blocks = Vec::new();
        let mut tool_calls = 0u32;
        if let Some(k) = recipe.rag_k {
            tool_calls += 1;
            if let Ok(snippets) = self
                .collaborators
                .rag
                .retrieve(&item.task_class, &item.task, k)
                .await
            {
                if !snippets.is_empty() {
                    context_blocks.push(format!("Reference material:\n{}", snippets.join("\n---\n")));
                }
            }
        }

        let task = match &item.inputs {
            Some(inputs) => format!("{}\n\nInputs:\n{}", item.task, inputs),
            None => item.task.clone(),
        };
        let request = GenerationRequest {
            recipe,
            task,
            context_blocks,
            seed: Some(item.seed),
        };

        let output = tokio::time::timeout(
            self.config.budget.generation_timeout,
            self.collaborators.local_engine.generate(&request),
        )
        .await
        .context("golden generation timed out")??;

        let scored = self
            .reward
            .score(&ScoreContext {
                task_class: format!("golden:{}", item.task_class),
                task: item.task.clone(),
                output: output.output.clone(),
                assertions: item.assertions.clone(),
                expected: item.expected.clone(),
                duration_ms: output.duration_ms,
                tool_calls,
                tokens_estimate: ((output.prompt_length + output.output.len()) / 4) as u64,
            })
            .await?;

        Ok(GoldenItemResult {
            item_id: item.id.clone(),
            outcome_reward: scored.outcome_reward,
            process_reward: scored.process_reward,
            cost_penalty: scored.cost_penalty,
            total_reward: scored.total_reward,
            steps: 1 + tool_calls,
            passed: process::assertions_satisfied(&output.output, &item.assertions),
        })
    }
}

/// Fixed flags for reproducibility: no web, deterministic sampling, the
/// item's configured retrieval depth only.
fn pinned_recipe(item: &GoldenItem) -> Recipe {
    let mut recipe = Recipe::default();
    recipe.temperature = 0.0;
    recipe.use_web = false;
    recipe.memory_k = None;
    recipe.rag_k = item.flags.rag_k;
    recipe.engine = EngineKind::Local;
    recipe
}
