//! Code-Loop Gate
//!
//! The gated self-edit cycle: criticize the engine's recent behavior, propose
//! a bounded patch over the allowlist, run tests and the golden suite, then
//! commit or roll back. One loop at a time; idempotent by source run.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::CodeLoopConfig;
use crate::engines::{
    EditsPackage, GenerationEngine, GenerationRequest, PatchOutcome, Patcher, TestReport,
    TestRunner,
};
use crate::golden::GoldenEvaluator;
use crate::operators::Recipe;
use crate::store::{CodeLoopRecord, GoldenKpi, MetaStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    Live,
    DryRun,
}

impl LoopMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "live" => Some(Self::Live),
            "dry_run" => Some(Self::DryRun),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::DryRun => "dry_run",
        }
    }
}

/// Patcher that records intent without touching the tree.
pub struct DryRunPatcher;

#[async_trait]
impl Patcher for DryRunPatcher {
    async fn apply(&self, edits: &EditsPackage) -> Result<PatchOutcome> {
        Ok(PatchOutcome {
            ok: true,
            diffs: edits
                .edits
                .iter()
                .map(|e| format!("--- {} ({} lines, not applied)", e.path, e.content.lines().count()))
                .collect(),
            touched_files: edits.edits.iter().map(|e| e.path.clone()).collect(),
        })
    }

    async fn rollback(&self) -> Result<()> {
        Ok(())
    }
}

/// Test runner that reports success without executing anything; the dry-run
/// counterpart to `DryRunPatcher`.
pub struct NoopTestRunner;

#[async_trait]
impl TestRunner for NoopTestRunner {
    async fn run(&self) -> Result<TestReport> {
        Ok(TestReport { passed: true, failures: Vec::new() })
    }
}

pub struct CodeLoopGate {
    store: MetaStore,
    critic_engine: Arc<dyn GenerationEngine>,
    patcher: Arc<dyn Patcher>,
    tests: Arc<dyn TestRunner>,
    config: CodeLoopConfig,
    delta_reward_min: f64,
    cost_ratio_max: f64,
}

impl CodeLoopGate {
    pub fn new(
        store: MetaStore,
        critic_engine: Arc<dyn GenerationEngine>,
        patcher: Arc<dyn Patcher>,
        tests: Arc<dyn TestRunner>,
        config: CodeLoopConfig,
        delta_reward_min: f64,
        cost_ratio_max: f64,
    ) -> Self {
        Self {
            store,
            critic_engine,
            patcher,
            tests,
            config,
            delta_reward_min,
            cost_ratio_max,
        }
    }

    /// Execute one loop. The caller holds the global code-loop slot and the
    /// timeout; idempotency by source run is checked here.
    pub async fn execute(
        &self,
        source_run_id: i64,
        mode: LoopMode,
        golden: &GoldenEvaluator,
    ) -> Result<CodeLoopRecord> {
        if let Some(existing) = self.store.get_code_loop_by_source(source_run_id).await? {
            info!(source_run_id, "returning existing code-loop artifact");
            return Ok(existing);
        }

        let run = self
            .store
            .get_run(source_run_id)
            .await?
            .ok_or_else(|| anyhow!("source run {} does not exist", source_run_id))?;

        let golden_before = golden.run(None).await.context("golden baseline failed")?;

        let critic = self.criticize(&run).await?;
        let thresholds = json!({
            "delta_reward_min": self.delta_reward_min,
            "cost_ratio_max": self.cost_ratio_max,
            "golden_pass_rate_target": self.config.golden_pass_rate_target,
            "max_loc": self.config.max_loc,
            "max_patches": self.config.max_patches,
            "max_files": self.config.max_files,
        });

        let mut record = CodeLoopRecord {
            loop_id: Uuid::new_v4().to_string(),
            source_run_id,
            mode: mode.as_str().to_string(),
            critic: critic.clone(),
            patch: json!({ "files": [], "diff": [], "edit_count": 0 }),
            tests: json!({ "passed": false, "failures": [] }),
            golden_before: Some(golden_before.clone()),
            golden_after: None,
            thresholds,
            decision: "reject".to_string(),
            created_at: Utc::now().timestamp(),
        };

        let edits = match self.propose_edits(&run, &critic).await {
            Ok(edits) => edits,
            Err(err) => {
                warn!(source_run_id, "no acceptable patch proposed: {}", err);
                record.decision = "reject".to_string();
                self.store.insert_code_loop(&record).await?;
                return Ok(record);
            }
        };

        let applied = self.patcher.apply(&edits).await.context("patch apply failed")?;
        record.patch = json!({
            "files": applied.touched_files,
            "diff": applied.diffs,
            "edit_count": edits.edits.len(),
            "rationale": edits.rationale,
        });
        if !applied.ok {
            record.decision = "reject".to_string();
            self.store.insert_code_loop(&record).await?;
            return Ok(record);
        }

        let tests = self.tests.run().await.unwrap_or(TestReport {
            passed: false,
            failures: vec!["test runner failed".to_string()],
        });
        record.tests = json!({ "passed": tests.passed, "failures": tests.failures });

        let golden_after = golden.run(None).await.context("golden re-check failed")?;
        record.golden_after = Some(golden_after.clone());

        let decision = self.decide(&tests, &golden_before, &golden_after);
        record.decision = decision.to_string();

        if decision != "commit" {
            self.patcher.rollback().await.context("rollback failed")?;
        }
        info!(source_run_id, decision, mode = mode.as_str(), "code-loop decided");

        self.store.insert_code_loop(&record).await?;
        Ok(record)
    }

    /// All gates must hold, otherwise the patch rolls back.
    fn decide(&self, tests: &TestReport, before: &GoldenKpi, after: &GoldenKpi) -> &'static str {
        if !tests.passed {
            return "rollback";
        }
        let delta = after.avg_total_reward - before.avg_total_reward;
        if delta < self.delta_reward_min {
            return "rollback";
        }
        if after.avg_cost_penalty > self.cost_ratio_max * before.avg_cost_penalty {
            return "rollback";
        }
        if after.pass_rate < self.config.golden_pass_rate_target {
            return "rollback";
        }
        "commit"
    }

    async fn criticize(&self, run: &crate::store::RunRecord) -> Result<String> {
        let variants = self.store.list_variants(run.run_id).await?;
        let summary = variants
            .iter()
            .map(|v| {
                format!(
                    "iter {} op={} total={:.3} outcome={:.3} process={:.3} cost={:.3}",
                    v.iteration_index,
                    v.operator,
                    v.total_reward,
                    v.outcome_reward,
                    v.process_reward,
                    v.cost_penalty
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let task = format!(
            r#"You are reviewing a prompt-optimization engine's recent run to find one
weakness in its reward tuning or benchmark coverage.

## Run
task_class: {}
baseline_score: {:?}
best_score: {:?}

## Scored iterations
{}

State, in a short paragraph, the single most impactful weakness you can see
and what kind of small change would address it."#,
            run.task_class, run.baseline_score, run.best_score, summary
        );

        let request = GenerationRequest {
            recipe: critic_recipe(),
            task,
            context_blocks: Vec::new(),
            seed: None,
        };
        let output = self.critic_engine.generate(&request).await?;
        Ok(output.output)
    }

    async fn propose_edits(
        &self,
        run: &crate::store::RunRecord,
        critic: &str,
    ) -> Result<EditsPackage> {
        let mut last_err = anyhow!("no patch attempts made");
        for attempt in 0..self.config.max_patches {
            let task = format!(
                r#"Based on this critique of a prompt-optimization engine, propose one
small patch. Allowed path prefixes: {:?}. Hard limits: at most {} files and
{} changed lines in total.

## Critique
{}

Reply with a single JSON object and nothing else:
{{"rationale": "<why>", "edits": [{{"path": "<file>", "content": "<full new content>"}}]}}
"#,
                self.config.allowed_paths, self.config.max_files, self.config.max_loc, critic
            );

            let request = GenerationRequest {
                recipe: critic_recipe(),
                task,
                context_blocks: Vec::new(),
                seed: None,
            };
            let reply = match self.critic_engine.generate(&request).await {
                Ok(output) => output.output,
                Err(err) => {
                    last_err = err;
                    continue;
                }
            };

            match parse_edits(&reply).and_then(|edits| self.validate_edits(edits)) {
                Ok(edits) => return Ok(edits),
                Err(err) => {
                    warn!(attempt, "patch proposal rejected: {}", err);
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    fn validate_edits(&self, edits: EditsPackage) -> Result<EditsPackage> {
        if edits.edits.is_empty() {
            return Err(anyhow!("patch contains no edits"));
        }
        if edits.edits.len() > self.config.max_files {
            return Err(anyhow!(
                "patch touches {} files, cap is {}",
                edits.edits.len(),
                self.config.max_files
            ));
        }
        let total_lines: usize = edits.edits.iter().map(|e| e.content.lines().count()).sum();
        if total_lines > self.config.max_loc {
            return Err(anyhow!(
                "patch is {} lines, cap is {}",
                total_lines,
                self.config.max_loc
            ));
        }
        for edit in &edits.edits {
            let path_ok = !edit.path.contains("..")
                && self
                    .config
                    .allowed_paths
                    .iter()
                    .any(|prefix| edit.path.starts_with(prefix.as_str()));
            if !path_ok {
                return Err(anyhow!("path '{}' is outside the allowlist", edit.path));
            }
        }
        Ok(edits)
    }
}

fn critic_recipe() -> Recipe {
    let mut recipe = Recipe::default();
    recipe.temperature = 0.2;
    recipe
}

fn parse_edits(reply: &str) -> Result<EditsPackage> {
    let trimmed = reply.trim();
    let json_slice = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    };
    serde_json::from_str(json_slice).context("edits reply was not valid JSON")
}
