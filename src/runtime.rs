//! Core Runtime
//!
//! The one process-wide object threaded through request handlers. Owns the
//! store, the event bus, the job manager, the reward model and the
//! collaborator handles, and exposes every operation callable from the HTTP
//! layer or a CLI.

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};

use crate::codeloop::{CodeLoopGate, DryRunPatcher, LoopMode, NoopTestRunner};
use crate::config::EngineConfig;
use crate::engines::{
    DdgWebSearcher, Embedder, JudgeEngine, OllamaEmbedder, OllamaEngine, OpenAiCompatEngine,
    Patcher, SqliteMemoryRetriever, SqliteRagRetriever, TestRunner,
};
use crate::error::{EngineError, EngineResult};
use crate::events::{RunEventBus, Subscription};
use crate::golden::GoldenEvaluator;
use crate::jobs::JobManager;
use crate::reward::{JudgePanel, RewardModel};
use crate::runner::{Collaborators, MetaRunner, StartRunRequest};
use crate::store::analytics::{AnalyticsSnapshot, AnalyticsWindow, SnapshotCache};
use crate::store::{
    CodeLoopRecord, GoldenKpi, MetaStore, OperatorStat, RecipeRecord, RunRecord, VariantRecord,
};

pub struct CoreRuntime {
    config: EngineConfig,
    store: MetaStore,
    bus: Arc<RunEventBus>,
    jobs: Arc<JobManager>,
    runner: Arc<MetaRunner>,
    golden: GoldenEvaluator,
    code_loop: CodeLoopGate,
    snapshots: SnapshotCache,
}

impl CoreRuntime {
    /// Wire the runtime against the default collaborators: a local Ollama
    /// engine, a hosted OpenAI-compatible engine that doubles as the judge
    /// pool backend, SQLite-backed retrievers and the web searcher.
    pub async fn new(config: EngineConfig) -> Result<Arc<Self>> {
        let store = MetaStore::new(&config.db_path).await?;

        let endpoints = &config.endpoints;
        let local: Arc<dyn crate::engines::GenerationEngine> = Arc::new(OllamaEngine::new(
            endpoints.ollama_host.clone(),
            endpoints.ollama_port,
            endpoints.local_model.clone(),
        ));
        let hosted = Arc::new(OpenAiCompatEngine::new(
            endpoints.hosted_base_url.clone(),
            endpoints.hosted_api_key.clone(),
            endpoints.hosted_model.clone(),
        ));
        let judge: Arc<dyn JudgeEngine> = hosted.clone();
        let embedder: Arc<dyn Embedder> = Arc::new(OllamaEmbedder::new(
            endpoints.ollama_host.clone(),
            endpoints.ollama_port,
            endpoints.embed_model.clone(),
        ));

        let collaborators = Collaborators {
            local_engine: local,
            hosted_engine: hosted,
            memory: Arc::new(SqliteMemoryRetriever::new(&config.db_path)),
            rag: Arc::new(SqliteRagRetriever::new(&config.db_path)),
            web: Arc::new(DdgWebSearcher::new()),
        };

        Self::with_collaborators(
            config,
            store,
            collaborators,
            judge,
            embedder,
            Arc::new(DryRunPatcher),
            Arc::new(NoopTestRunner),
        )
    }

    /// Wire the runtime with explicit collaborators (tests, embedded use).
    pub fn with_collaborators(
        config: EngineConfig,
        store: MetaStore,
        collaborators: Collaborators,
        judge: Arc<dyn JudgeEngine>,
        embedder: Arc<dyn Embedder>,
        patcher: Arc<dyn Patcher>,
        test_runner: Arc<dyn TestRunner>,
    ) -> Result<Arc<Self>> {
        config.validate().map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let bus = Arc::new(RunEventBus::new(config.event_bus.clone()));
        let jobs = Arc::new(JobManager::new(
            config.code_loop.max_per_hour,
            config.runs_per_hour_per_client,
            config.budget.run_timeout,
        ));

        let panel = JudgePanel::new(
            judge,
            config.endpoints.judge_pool_1.clone(),
            config.endpoints.judge_pool_2.clone(),
            config.endpoints.judge_pool_3.clone(),
            config.budget.judge_timeout,
            config.reward.judge_disagreement_threshold,
        );
        let reward = Arc::new(RewardModel::new(config.reward.clone(), panel, embedder));

        let runner = Arc::new(MetaRunner::new(
            store.clone(),
            Arc::clone(&bus),
            Arc::clone(&reward),
            collaborators.clone(),
            Arc::clone(&jobs),
            config.clone(),
        ));

        let golden = GoldenEvaluator::new(
            store.clone(),
            Arc::clone(&reward),
            collaborators.clone(),
            config.clone(),
        );

        let code_loop = CodeLoopGate::new(
            store.clone(),
            collaborators.hosted_engine.clone(),
            patcher,
            test_runner,
            config.code_loop.clone(),
            config.promotion.delta_reward_min,
            config.promotion.cost_ratio_max,
        );

        let snapshots = SnapshotCache::new(store.clone(), config.analytics.snapshot_ttl);

        Ok(Arc::new(Self {
            config,
            store,
            bus,
            jobs,
            runner,
            golden,
            code_loop,
            snapshots,
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &MetaStore {
        &self.store
    }

    // ── Runs ────────────────────────────────────────────────────────────────

    /// Validate, rate-limit, persist and spawn a run. Returns its id.
    pub async fn start_run(
        self: &Arc<Self>,
        request: StartRunRequest,
        client_id: &str,
    ) -> EngineResult<i64> {
        let params = request.into_params(&self.config)?;
        self.jobs.admit_run(client_id)?;

        let run_id = self
            .store
            .create_run(&params)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        let run = self
            .store
            .get_run(run_id)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?
            .ok_or_else(|| EngineError::Storage("run vanished after create".into()))?;

        self.bus.register_run(run_id);
        let cancel = self.jobs.register_run(run_id);

        let runner = Arc::clone(&self.runner);
        tokio::spawn(async move {
            runner.run(run, cancel).await;
        });
        info!(run_id, client_id, "run started");
        Ok(run_id)
    }

    pub fn cancel_run(&self, run_id: i64) -> EngineResult<()> {
        if self.jobs.cancel_run(run_id) {
            Ok(())
        } else {
            Err(EngineError::NotFound(format!("active run {}", run_id)))
        }
    }

    pub fn subscribe_events(&self, run_id: i64) -> EngineResult<Subscription> {
        self.bus
            .subscribe(run_id)
            .ok_or_else(|| EngineError::NotFound(format!("run {} event stream", run_id)))
    }

    pub async fn get_run(&self, run_id: i64) -> EngineResult<RunRecord> {
        self.store
            .get_run(run_id)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?
            .ok_or_else(|| EngineError::NotFound(format!("run {}", run_id)))
    }

    pub async fn list_runs(&self, limit: u32) -> EngineResult<Vec<RunRecord>> {
        self.store
            .list_runs(limit.clamp(1, 500))
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub async fn get_variant(&self, variant_id: i64) -> EngineResult<VariantRecord> {
        self.store
            .get_variant(variant_id)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?
            .ok_or_else(|| EngineError::NotFound(format!("variant {}", variant_id)))
    }

    pub async fn list_variants(&self, run_id: i64) -> EngineResult<Vec<VariantRecord>> {
        self.store
            .list_variants(run_id)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    // ── Stats / recipes / ratings ───────────────────────────────────────────

    pub async fn list_operator_stats(
        &self,
        task_class: Option<&str>,
    ) -> EngineResult<Vec<OperatorStat>> {
        self.store
            .list_operator_stats(task_class)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub async fn reset_operator_stats(&self, task_class: &str) -> EngineResult<u64> {
        self.store
            .reset_operator_stats(task_class)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub async fn list_recipes(&self, task_class: &str) -> EngineResult<Vec<RecipeRecord>> {
        self.store
            .list_recipes(task_class)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub async fn approve_recipe(&self, recipe_id: i64) -> EngineResult<()> {
        let updated = self
            .store
            .approve_recipe(recipe_id)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        if updated {
            Ok(())
        } else {
            Err(EngineError::NotFound(format!("recipe {}", recipe_id)))
        }
    }

    pub async fn rate(
        &self,
        variant_id: i64,
        score: u8,
        feedback: Option<String>,
    ) -> EngineResult<()> {
        if !(1..=10).contains(&score) {
            return Err(EngineError::Config("score must be within [1,10]".into()));
        }
        self.store
            .insert_rating(variant_id, score, feedback)
            .await
            .map(|_| ())
            .map_err(|e| EngineError::NotFound(e.to_string()))
    }

    // ── Golden / code-loop / analytics ──────────────────────────────────────

    pub async fn run_golden(&self, subset: Option<&[String]>) -> EngineResult<GoldenKpi> {
        self.golden
            .run(subset)
            .await
            .map_err(|e| EngineError::CollaboratorFailure {
                collaborator: "golden".to_string(),
                message: e.to_string(),
            })
    }

    /// Run (or replay) the code-loop gate for a source run. At most one loop
    /// is active process-wide; completed loops replay idempotently.
    pub async fn run_code_loop(
        &self,
        source_run_id: i64,
        mode: LoopMode,
    ) -> EngineResult<CodeLoopRecord> {
        // Idempotent replay never consumes the rate limit.
        if let Ok(Some(existing)) = self.store.get_code_loop_by_source(source_run_id).await {
            return Ok(existing);
        }

        let _slot = self.jobs.begin_code_loop()?;
        let result = tokio::time::timeout(
            self.config.code_loop.timeout,
            self.code_loop.execute(source_run_id, mode, &self.golden),
        )
        .await;

        match result {
            Ok(Ok(record)) => Ok(record),
            Ok(Err(err)) => {
                error!(source_run_id, "code-loop failed: {}", err);
                Err(EngineError::CollaboratorFailure {
                    collaborator: "code_loop".to_string(),
                    message: err.to_string(),
                })
            }
            Err(_) => Err(EngineError::CollaboratorTimeout {
                collaborator: "code_loop".to_string(),
                timeout_ms: self.config.code_loop.timeout.as_millis() as u64,
            }),
        }
    }

    pub async fn analytics_snapshot(
        &self,
        window: AnalyticsWindow,
    ) -> EngineResult<AnalyticsSnapshot> {
        self.snapshots
            .get(window)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    pub fn active_run_count(&self) -> usize {
        self.jobs.active_run_count()
    }

    pub async fn health(&self) -> serde_json::Value {
        let db_ok = self.store.get_run(0).await.is_ok();
        serde_json::json!({
            "status": if db_ok { "ok" } else { "degraded" },
            "active_runs": self.active_run_count(),
        })
    }

    /// Cooperative shutdown: flag every active run and give the runners a
    /// moment to flush terminal events.
    pub async fn shutdown(&self) {
        info!(active = self.active_run_count(), "shutting down, cancelling active runs");
        self.jobs.cancel_all("shutdown");
        let mut waited = 0u64;
        while self.active_run_count() > 0 && waited < 5_000 {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            waited += 100;
        }
    }
}
