//! Meta-Evolution Runner
//!
//! Executes one run: select an operator, build the candidate recipe, call the
//! generation collaborator, score, persist, publish events. Iterations are
//! sequential; collaborator failures cost one iteration, never the run.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::bandit::{self, ArmSnapshot, FrameworkQuotas};
use crate::config::EngineConfig;
use crate::engines::{
    GenerationEngine, GenerationOutput, GenerationRequest, MemoryRetriever, RagRetriever,
    WebSearcher,
};
use crate::events::{round3, RewardBreakdown, RunEvent, RunEventBus};
use crate::jobs::{CancelFlag, JobManager};
use crate::operators::{allowed_operators, EngineKind, Operator, OperatorContext, Recipe};
use crate::reward::{RewardModel, ScoreContext};
use crate::store::{MetaStore, NewVariant, RunParams, RunRecord, RunStatus};

/// Collaborator handles shared by the runner and the golden evaluator.
#[derive(Clone)]
pub struct Collaborators {
    pub local_engine: Arc<dyn GenerationEngine>,
    pub hosted_engine: Arc<dyn GenerationEngine>,
    pub memory: Arc<dyn MemoryRetriever>,
    pub rag: Arc<dyn RagRetriever>,
    pub web: Arc<dyn WebSearcher>,
}

impl Collaborators {
    fn engine_for(&self, kind: EngineKind) -> &Arc<dyn GenerationEngine> {
        match kind {
            EngineKind::Local => &self.local_engine,
            EngineKind::Hosted => &self.hosted_engine,
        }
    }
}

pub struct MetaRunner {
    store: MetaStore,
    bus: Arc<RunEventBus>,
    reward: Arc<RewardModel>,
    collaborators: Collaborators,
    jobs: Arc<JobManager>,
    config: EngineConfig,
}

enum IterationOutcome {
    Scored { variant_id: i64, total_reward: f64, cost_penalty: f64 },
    Failed,
    CancelledMidFlight,
    StorageFailure(String),
}

impl MetaRunner {
    pub fn new(
        store: MetaStore,
        bus: Arc<RunEventBus>,
        reward: Arc<RewardModel>,
        collaborators: Collaborators,
        jobs: Arc<JobManager>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            bus,
            reward,
            collaborators,
            jobs,
            config,
        }
    }

    /// Drive one run to a terminal state. Always emits a terminal event and
    /// deregisters the run.
    pub async fn run(&self, run: RunRecord, cancel: Arc<CancelFlag>) {
        let run_id = run.run_id;
        let result = self.run_inner(&run, &cancel).await;
        if let Err(err) = result {
            error!(run_id, "run failed: {}", err);
            let _ = self
                .store
                .finish_run(run_id, RunStatus::Error, Some(err.to_string()))
                .await;
            self.bus.publish(run_id, RunEvent::Error { message: err.to_string() });
        }
        self.jobs.complete_run(run_id);
    }

    async fn run_inner(&self, run: &RunRecord, cancel: &CancelFlag) -> Result<()> {
        let run_id = run.run_id;
        let allowed = allowed_operators(&run.framework_mask);
        if allowed.is_empty() {
            anyhow::bail!("framework mask leaves no operators");
        }

        let mut rng = StdRng::seed_from_u64(run.seed);
        let mut quotas = FrameworkQuotas::default();
        let mut bandit_cfg = self.config.bandit.clone();
        bandit_cfg.strategy = run.strategy;
        bandit_cfg.epsilon = run.epsilon;

        let base_recipe = self.base_recipe(run).await;
        let fewshot_examples = self
            .collaborators
            .memory
            .recall(&run.normalized_task_class, &run.task, 2)
            .await
            .unwrap_or_default();

        let mut best_score: Option<f64> = None;
        let mut best_variant: Option<i64> = None;
        let mut status = RunStatus::Complete;
        let mut cancel_reason: Option<String> = None;

        for i in 0..run.n_total {
            if cancel.is_cancelled() {
                status = RunStatus::Cancelled;
                cancel_reason = cancel.reason();
                break;
            }

            let arms = self.arm_snapshots(&run.normalized_task_class).await?;
            let Some(operator) =
                bandit::select(&arms, &allowed, Some(&quotas), &bandit_cfg, &mut rng)
            else {
                break;
            };
            quotas.record(operator.framework());
            self.bus.publish(
                run_id,
                RunEvent::IterSelected { i, operator: operator.as_str().to_string() },
            );

            let ctx = OperatorContext {
                rotation: i as usize,
                fewshot_examples: fewshot_examples.clone(),
                default_k: None,
            };
            let recipe = operator.apply(&base_recipe, &ctx);

            match self.run_iteration(run, i, operator, recipe, cancel).await {
                IterationOutcome::Scored { variant_id, total_reward, cost_penalty } => {
                    if i == 0 {
                        self.store
                            .set_run_baseline(run_id, total_reward, cost_penalty + 1.0)
                            .await?;
                    }
                    if best_score.map_or(true, |best| total_reward > best) {
                        best_score = Some(total_reward);
                        best_variant = Some(variant_id);
                        self.store.update_best(run_id, variant_id, total_reward).await?;
                    }
                }
                IterationOutcome::Failed => {}
                IterationOutcome::CancelledMidFlight => {
                    status = RunStatus::Cancelled;
                    cancel_reason = cancel.reason();
                    break;
                }
                IterationOutcome::StorageFailure(message) => {
                    anyhow::bail!("storage failure: {}", message);
                }
            }

            if cancel.is_cancelled() {
                status = RunStatus::Cancelled;
                cancel_reason = cancel.reason();
                break;
            }
        }

        if status == RunStatus::Complete {
            if let Some(variant_id) = best_variant {
                match self.store.promote_recipe(variant_id, &self.config.promotion).await {
                    Ok(Some(recipe)) => {
                        info!(run_id, recipe_id = recipe.recipe_id, approved = ?recipe.approved,
                            "best recipe promoted");
                    }
                    Ok(None) => {}
                    Err(err) => warn!(run_id, "promotion skipped: {}", err),
                }
            }
        }

        self.store.finish_run(run_id, status, None).await?;
        self.bus.publish(
            run_id,
            RunEvent::Done { status: status.as_str().to_string(), reason: cancel_reason },
        );
        info!(run_id, status = status.as_str(), best = ?best_score, "run finished");
        Ok(())
    }

    async fn run_iteration(
        &self,
        run: &RunRecord,
        i: u32,
        operator: Operator,
        recipe: Recipe,
        cancel: &CancelFlag,
    ) -> IterationOutcome {
        let run_id = run.run_id;
        self.bus.publish(run_id, RunEvent::IterGenStart { i });

        let (context_blocks, tool_calls) = self.gather_context(run, &recipe).await;
        let request = GenerationRequest {
            recipe: recipe.clone(),
            task: run.task.clone(),
            context_blocks,
            seed: Some(run.seed.wrapping_add(i as u64)),
        };

        let engine = self.collaborators.engine_for(recipe.engine);
        let generation = tokio::time::timeout(
            self.config.budget.generation_timeout,
            engine.generate(&request),
        )
        .await;

        let output: GenerationOutput = match generation {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                warn!(run_id, i, "generation failed: {}", err);
                self.bus
                    .publish(run_id, RunEvent::IterError { i, reason: err.to_string() });
                return IterationOutcome::Failed;
            }
            Err(_) => {
                warn!(run_id, i, "generation timed out");
                self.bus.publish(
                    run_id,
                    RunEvent::IterError { i, reason: "generation timeout".to_string() },
                );
                return IterationOutcome::Failed;
            }
        };

        // The in-flight iteration is abandoned when cancellation lands before
        // scoring completes.
        if cancel.is_cancelled() {
            self.bus
                .publish(run_id, RunEvent::IterError { i, reason: "cancelled".to_string() });
            return IterationOutcome::CancelledMidFlight;
        }

        self.bus.publish(
            run_id,
            RunEvent::IterGenDone {
                i,
                duration_ms: output.duration_ms,
                prompt_length: output.prompt_length,
            },
        );

        // Observers react to gen_done; let a cancel issued on that event land
        // before the score step commits.
        tokio::task::yield_now().await;
        if cancel.is_cancelled() {
            self.bus
                .publish(run_id, RunEvent::IterError { i, reason: "cancelled".to_string() });
            return IterationOutcome::CancelledMidFlight;
        }

        self.bus.publish(run_id, RunEvent::IterScoreStart { i });

        let score_ctx = ScoreContext {
            task_class: run.normalized_task_class.clone(),
            task: run.task.clone(),
            output: output.output.clone(),
            assertions: Vec::new(),
            expected: None,
            duration_ms: output.duration_ms,
            tool_calls,
            tokens_estimate: ((output.prompt_length + output.output.len()) / 4) as u64,
        };

        let scored = match self.reward.score(&score_ctx).await {
            Ok(scored) => scored,
            Err(err) => {
                warn!(run_id, i, "scoring failed: {}", err);
                self.bus
                    .publish(run_id, RunEvent::IterError { i, reason: err.to_string() });
                return IterationOutcome::Failed;
            }
        };

        self.bus.publish(
            run_id,
            RunEvent::Judge {
                i,
                models: scored.judge_info.judges.iter().map(|j| j.model.clone()).collect(),
                tie_breaker_used: scored.judge_info.tie_breaker_used,
            },
        );
        self.bus.publish(
            run_id,
            RunEvent::IterScoreDone {
                i,
                total_reward: round3(scored.total_reward),
                reward_breakdown: RewardBreakdown {
                    outcome: round3(scored.outcome_reward),
                    process: round3(scored.process_reward),
                    cost_penalty: round3(scored.cost_penalty),
                },
                judge_info: scored.judge_info.clone(),
            },
        );

        let variant = NewVariant {
            run_id,
            iteration_index: i,
            operator: operator.as_str().to_string(),
            recipe,
            prompt_length: output.prompt_length,
            output: output.output,
            duration_ms: output.duration_ms,
            outcome_reward: scored.outcome_reward,
            process_reward: scored.process_reward,
            cost_penalty: scored.cost_penalty,
            total_reward: scored.total_reward,
            judge_info: scored.judge_info,
        };

        let variant_id = match self.store.save_variant(&variant).await {
            Ok(id) => id,
            Err(err) => return IterationOutcome::StorageFailure(err.to_string()),
        };
        self.bus.publish(run_id, RunEvent::IterSaved { i, variant_id });

        if let Err(err) = self
            .store
            .update_operator_stat(
                &run.normalized_task_class,
                operator.as_str(),
                scored.total_reward,
            )
            .await
        {
            return IterationOutcome::StorageFailure(err.to_string());
        }

        IterationOutcome::Scored {
            variant_id,
            total_reward: scored.total_reward,
            cost_penalty: scored.cost_penalty,
        }
    }

    /// The base recipe operators mutate: the newest approved recipe for the
    /// task class, else the system default, with any per-run depth overrides.
    async fn base_recipe(&self, run: &RunRecord) -> Recipe {
        let mut recipe = match self.store.latest_approved_recipe(&run.task_class).await {
            Ok(Some(record)) => record.recipe,
            Ok(None) => Recipe::default(),
            Err(err) => {
                warn!(run_id = run.run_id, "recipe lookup failed, using default: {}", err);
                Recipe::default()
            }
        };
        if run.memory_k.is_some() {
            recipe.memory_k = run.memory_k;
        }
        if run.rag_k.is_some() {
            recipe.rag_k = run.rag_k;
        }
        recipe
    }

    async fn gather_context(&self, run: &RunRecord, recipe: &Recipe) -> (Vec<String>, u32) {
        let mut blocks = Vec::new();
        let mut tool_calls = 0u32;

        if let Some(k) = recipe.memory_k {
            tool_calls += 1;
            match self
                .collaborators
                .memory
                .recall(&run.normalized_task_class, &run.task, k)
                .await
            {
                Ok(snippets) if !snippets.is_empty() => {
                    blocks.push(format!("Relevant past work:\n{}", snippets.join("\n---\n")));
                }
                Ok(_) => {}
                Err(err) => warn!(run_id = run.run_id, "memory recall failed: {}", err),
            }
        }

        if let Some(k) = recipe.rag_k {
            tool_calls += 1;
            match self
                .collaborators
                .rag
                .retrieve(&run.normalized_task_class, &run.task, k)
                .await
            {
                Ok(snippets) if !snippets.is_empty() => {
                    blocks.push(format!("Reference material:\n{}", snippets.join("\n---\n")));
                }
                Ok(_) => {}
                Err(err) => warn!(run_id = run.run_id, "rag retrieval failed: {}", err),
            }
        }

        if recipe.use_web {
            tool_calls += 1;
            match self.collaborators.web.search(&run.task, 3).await {
                Ok(snippets) if !snippets.is_empty() => {
                    blocks.push(format!("Web research:\n{}", snippets.join("\n")));
                }
                Ok(_) => {}
                Err(err) => warn!(run_id = run.run_id, "web search failed: {}", err),
            }
        }

        (blocks, tool_calls)
    }

    async fn arm_snapshots(&self, task_class: &str) -> Result<HashMap<Operator, ArmSnapshot>> {
        let stats = self.store.list_operator_stats(Some(task_class)).await?;
        let mut arms = HashMap::new();
        for stat in stats {
            if let Some(op) = Operator::parse(&stat.operator) {
                arms.insert(
                    op,
                    ArmSnapshot { pulls: stat.pulls, mean_reward: stat.mean_reward },
                );
            }
        }
        Ok(arms)
    }
}

/// Validated inputs for `start_run`, before a row exists.
#[derive(Debug, Clone)]
pub struct StartRunRequest {
    pub session_id: Option<String>,
    pub task_class: String,
    pub task: String,
    pub n: Option<u32>,
    pub strategy: Option<crate::config::Strategy>,
    pub epsilon: Option<f64>,
    pub memory_k: Option<u32>,
    pub rag_k: Option<u32>,
    pub framework_mask: Option<Vec<String>>,
    pub seed: Option<u64>,
}

impl StartRunRequest {
    /// Turn the request into run parameters, or a config error.
    pub fn into_params(self, config: &EngineConfig) -> crate::error::EngineResult<RunParams> {
        use crate::error::EngineError;
        use crate::operators::Framework;

        if self.task_class.trim().is_empty() {
            return Err(EngineError::Config("task_class must not be empty".into()));
        }
        if self.task.trim().is_empty() {
            return Err(EngineError::Config("task must not be empty".into()));
        }
        let n = self.n.unwrap_or(config.budget.n_default);
        if n == 0 {
            return Err(EngineError::Config("n must be >= 1".into()));
        }
        let strategy = self.strategy.unwrap_or(config.bandit.strategy);
        let epsilon = match self.epsilon {
            Some(e) if !(0.0..=1.0).contains(&e) => {
                return Err(EngineError::Config("epsilon must be within [0,1]".into()))
            }
            Some(e) => e,
            // Stratified exploration needs less forced randomness.
            None if config.bandit.stratified_exploration => 0.3,
            None => config.bandit.epsilon,
        };

        let framework_mask = match self.framework_mask {
            Some(names) => {
                let mut mask = Vec::new();
                for name in names {
                    let framework = Framework::parse(&name).ok_or_else(|| {
                        EngineError::Config(format!("unknown framework '{}'", name))
                    })?;
                    if !mask.contains(&framework) {
                        mask.push(framework);
                    }
                }
                if mask.is_empty() {
                    return Err(EngineError::Config("framework_mask must not be empty".into()));
                }
                mask
            }
            None => Framework::ALL.to_vec(),
        };

        Ok(RunParams {
            session_id: self
                .session_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            task_class: self.task_class,
            task: self.task,
            n_total: n,
            strategy,
            epsilon,
            framework_mask,
            memory_k: self.memory_k,
            rag_k: self.rag_k,
            seed: self.seed.unwrap_or_else(rand::random),
            reward_weights: config.reward.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Strategy;

    fn request() -> StartRunRequest {
        StartRunRequest {
            session_id: None,
            task_class: "code".to_string(),
            task: "write a sort".to_string(),
            n: None,
            strategy: None,
            epsilon: None,
            memory_k: None,
            rag_k: None,
            framework_mask: None,
            seed: Some(42),
        }
    }

    #[test]
    fn test_request_defaults() {
        let cfg = EngineConfig::default();
        let params = request().into_params(&cfg).unwrap();
        assert_eq!(params.n_total, 16);
        assert_eq!(params.strategy, Strategy::Ucb1);
        // Stratified exploration lowers the default epsilon.
        assert!((params.epsilon - 0.3).abs() < 1e-9);
        assert_eq!(params.framework_mask.len(), 4);
        assert_eq!(params.seed, 42);
    }

    #[test]
    fn test_request_validation() {
        let cfg = EngineConfig::default();

        let mut bad = request();
        bad.task = "  ".to_string();
        assert!(bad.into_params(&cfg).is_err());

        let mut bad = request();
        bad.epsilon = Some(1.2);
        assert!(bad.into_params(&cfg).is_err());

        let mut bad = request();
        bad.framework_mask = Some(vec!["WARP".to_string()]);
        assert!(bad.into_params(&cfg).is_err());

        let mut bad = request();
        bad.n = Some(0);
        assert!(bad.into_params(&cfg).is_err());
    }

    #[test]
    fn test_request_mask_parsing() {
        let cfg = EngineConfig::default();
        let mut req = request();
        req.framework_mask = Some(vec!["seal".to_string(), "SAMPLING".to_string()]);
        let params = req.into_params(&cfg).unwrap();
        assert_eq!(params.framework_mask.len(), 2);
    }

    #[test]
    fn test_epsilon_default_without_stratification() {
        let mut cfg = EngineConfig::default();
        cfg.bandit.stratified_exploration = false;
        let params = request().into_params(&cfg).unwrap();
        assert!((params.epsilon - 0.6).abs() < 1e-9);
    }
}
