//! End-to-end scenarios against scripted collaborators: warm-start coverage,
//! event ordering, cancellation mid-iteration, judge protocol on the wire,
//! and the golden-regression code-loop gate.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::{mpsc, Semaphore};

use metaevolve::codeloop::{DryRunPatcher, LoopMode, NoopTestRunner};
use metaevolve::config::{EngineConfig, JudgeModel, Strategy};
use metaevolve::engines::{
    Embedder, GenerationEngine, GenerationOutput, GenerationRequest, JudgeEngine, JudgeVerdict,
    MemoryRetriever, RagRetriever, WebSearcher,
};
use metaevolve::events::RunEvent;
use metaevolve::runner::{Collaborators, StartRunRequest};
use metaevolve::runtime::CoreRuntime;
use metaevolve::store::{MetaStore, RunStatus};

// ── Scripted collaborators ──────────────────────────────────────────────────

/// Generation engine that reports every call and can be gated per call.
struct GatedEngine {
    id: &'static str,
    started: mpsc::UnboundedSender<u32>,
    permits: Arc<Semaphore>,
    calls: AtomicU32,
}

impl GatedEngine {
    fn new(id: &'static str) -> (Arc<Self>, mpsc::UnboundedReceiver<u32>, Arc<Semaphore>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let permits = Arc::new(Semaphore::new(0));
        let engine = Arc::new(Self {
            id,
            started: tx,
            permits: Arc::clone(&permits),
            calls: AtomicU32::new(0),
        });
        (engine, rx, permits)
    }
}

#[async_trait]
impl GenerationEngine for GatedEngine {
    fn id(&self) -> &str {
        self.id
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.started.send(call);
        let permit = self.permits.acquire().await.expect("semaphore open");
        permit.forget();
        Ok(GenerationOutput {
            output: format!(
                "1. Consider the task.\n2. Answer it.\nTherefore: done (attempt {}).",
                call
            ),
            duration_ms: 40,
            prompt_length: request.render_prompt().len(),
            engine_id: self.id.to_string(),
            model_id: "scripted".to_string(),
        })
    }
}

/// Golden-sweep engine: passes a shrinking set of items per sweep.
struct SweepEngine {
    calls: AtomicU32,
    items_per_sweep: u32,
    passes_by_sweep: Vec<u32>,
}

#[async_trait]
impl GenerationEngine for SweepEngine {
    fn id(&self) -> &str {
        "sweep"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput> {
        // Only golden items advance the sweep counter.
        if !request.task.contains("item-") {
            return Ok(GenerationOutput {
                output: "1. Noted.\nTherefore: done.".to_string(),
                duration_ms: 25,
                prompt_length: request.task.len(),
                engine_id: "sweep".to_string(),
                model_id: "scripted".to_string(),
            });
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let sweep = (call / self.items_per_sweep) as usize;
        let passes = self
            .passes_by_sweep
            .get(sweep)
            .copied()
            .unwrap_or(*self.passes_by_sweep.last().unwrap_or(&0));

        // The item index is embedded in the task text.
        let item: u32 = request
            .task
            .split("item-")
            .nth(1)
            .and_then(|rest| rest.split(':').next())
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);

        let output = if item < passes {
            format!("The answer is ok-{}. 1. verified.", item)
        } else {
            "I'm not sure this one can be satisfied.".to_string()
        };
        Ok(GenerationOutput {
            output,
            duration_ms: 25,
            prompt_length: request.task.len(),
            engine_id: "sweep".to_string(),
            model_id: "scripted".to_string(),
        })
    }
}

/// Engine whose replies follow a fixed script (critic + editor calls).
struct ScriptedEngine {
    replies: Vec<String>,
    calls: AtomicU32,
}

#[async_trait]
impl GenerationEngine for ScriptedEngine {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        let output = self
            .replies
            .get(call)
            .cloned()
            .unwrap_or_else(|| "no script left".to_string());
        Ok(GenerationOutput {
            output,
            duration_ms: 5,
            prompt_length: request.task.len(),
            engine_id: "scripted".to_string(),
            model_id: "scripted".to_string(),
        })
    }
}

struct PairJudge {
    first: f64,
    second: f64,
    tie: f64,
    calls: AtomicU32,
}

#[async_trait]
impl JudgeEngine for PairJudge {
    async fn judge(&self, model: &str, _task: &str, _output: &str) -> Result<JudgeVerdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let score = match model {
            "judge-a" => self.first,
            "judge-b" => self.second,
            _ => self.tie,
        };
        Ok(JudgeVerdict { score, rationale: None, duration_ms: 1 })
    }
}

struct FlatEmbedder;

#[async_trait]
impl Embedder for FlatEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![1.0, 0.5, 0.25])
    }
}

struct EmptyMemory;

#[async_trait]
impl MemoryRetriever for EmptyMemory {
    async fn recall(&self, _task_class: &str, _query: &str, _k: u32) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

struct EmptyRag;

#[async_trait]
impl RagRetriever for EmptyRag {
    async fn retrieve(&self, _task_class: &str, _query: &str, _k: u32) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn index_hash(&self) -> Result<String> {
        Ok("e3b0c44298fc1c14".to_string())
    }
}

struct NoWeb;

#[async_trait]
impl WebSearcher for NoWeb {
    async fn search(&self, _query: &str, _max_results: usize) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

// ── Harness ─────────────────────────────────────────────────────────────────

fn pool(model: &str) -> Vec<JudgeModel> {
    vec![JudgeModel { model: model.to_string(), weight: 1 }]
}

fn test_config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.db_path = dir
        .path()
        .join("engine.db")
        .to_string_lossy()
        .to_string();
    config.golden_set_path = dir
        .path()
        .join("golden_set.json")
        .to_string_lossy()
        .to_string();
    config.endpoints.judge_pool_1 = pool("judge-a");
    config.endpoints.judge_pool_2 = pool("judge-b");
    config.endpoints.judge_pool_3 = pool("judge-tie");
    config.event_bus.keep_alive_interval = std::time::Duration::from_secs(30);
    config
}

async fn build_runtime(
    config: EngineConfig,
    local: Arc<dyn GenerationEngine>,
    hosted: Arc<dyn GenerationEngine>,
    judge: Arc<dyn JudgeEngine>,
) -> Arc<CoreRuntime> {
    let store = MetaStore::new(&config.db_path).await.unwrap();
    let collaborators = Collaborators {
        local_engine: local,
        hosted_engine: hosted,
        memory: Arc::new(EmptyMemory),
        rag: Arc::new(EmptyRag),
        web: Arc::new(NoWeb),
    };
    CoreRuntime::with_collaborators(
        config,
        store,
        collaborators,
        judge,
        Arc::new(FlatEmbedder),
        Arc::new(DryRunPatcher),
        Arc::new(NoopTestRunner),
    )
    .unwrap()
}

fn start_request(task_class: &str, n: u32, seed: u64) -> StartRunRequest {
    StartRunRequest {
        session_id: Some("session-e2e".to_string()),
        task_class: task_class.to_string(),
        task: "Summarize the tradeoffs of async runtimes.".to_string(),
        n: Some(n),
        strategy: Some(Strategy::Ucb1),
        epsilon: None,
        memory_k: None,
        rag_k: None,
        framework_mask: None,
        seed: Some(seed),
    }
}

async fn drain_events(runtime: &Arc<CoreRuntime>, run_id: i64) -> Vec<RunEvent> {
    let mut subscription = runtime.subscribe_events(run_id).unwrap();
    let mut events = Vec::new();
    while let Some(event) = subscription.next().await {
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }
    events
}

// ── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_warm_start_covers_all_operators() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let (engine, _rx, permits) = GatedEngine::new("local");
    permits.add_permits(1000);
    let judge = Arc::new(PairJudge { first: 0.6, second: 0.6, tie: 0.5, calls: AtomicU32::new(0) });
    let runtime = build_runtime(config, engine.clone(), engine, judge).await;

    let run_id = runtime
        .start_run(start_request("warmstart", 11, 42), "client-1")
        .await
        .unwrap();
    let events = drain_events(&runtime, run_id).await;
    assert!(matches!(events.last(), Some(RunEvent::Done { status, .. }) if status == "complete"));

    let stats = runtime.list_operator_stats(Some("warmstart")).await.unwrap();
    assert_eq!(stats.len(), 11, "every operator pulled");
    for stat in &stats {
        assert_eq!(stat.pulls, 1, "{} pulled once", stat.operator);
    }
    let total_pulls: u64 = stats.iter().map(|s| s.pulls).sum();
    assert_eq!(total_pulls, 11);
}

#[tokio::test]
async fn test_event_ordering_within_run() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let (engine, mut rx, permits) = GatedEngine::new("local");
    let judge = Arc::new(PairJudge { first: 0.6, second: 0.6, tie: 0.5, calls: AtomicU32::new(0) });
    let runtime = build_runtime(config, engine.clone(), engine, judge).await;

    let run_id = runtime
        .start_run(start_request("ordering", 4, 7), "client-1")
        .await
        .unwrap();

    // Subscribe before any generation is allowed to proceed.
    let mut subscription = runtime.subscribe_events(run_id).unwrap();
    rx.recv().await;
    permits.add_permits(1000);

    let mut events = Vec::new();
    while let Some(event) = subscription.next().await {
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }

    // Per-iteration step ordering, and no event from iteration i+1 before
    // iteration i is saved.
    let mut current: Option<(u32, u8)> = None;
    let mut saved = Vec::new();
    for event in &events {
        let observed = match event {
            RunEvent::IterSelected { i, .. } => Some((*i, 0u8)),
            RunEvent::IterGenStart { i } => Some((*i, 1)),
            RunEvent::IterGenDone { i, .. } => Some((*i, 2)),
            RunEvent::IterScoreStart { i } => Some((*i, 3)),
            RunEvent::Judge { i, .. } => Some((*i, 4)),
            RunEvent::IterScoreDone { i, .. } => Some((*i, 5)),
            RunEvent::IterSaved { i, .. } => Some((*i, 6)),
            _ => None,
        };
        let Some((i, step)) = observed else { continue };
        match current {
            Some((cur_i, cur_step)) if cur_i == i => {
                assert!(step > cur_step, "iteration {} steps out of order", i);
            }
            Some((cur_i, cur_step)) => {
                assert_eq!(i, cur_i + 1, "iterations interleaved");
                assert_eq!(cur_step, 6, "iteration {} started before {} was saved", i, cur_i);
                saved.push(cur_i);
            }
            None => {}
        }
        current = Some((i, step));
    }
    if let Some((last_i, last_step)) = current {
        assert_eq!(last_step, 6);
        saved.push(last_i);
    }
    assert_eq!(*saved.last().unwrap(), 3, "all four iterations saved in order");
}

#[tokio::test]
async fn test_cancellation_on_gen_done_abandons_iteration() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let (engine, _rx, permits) = GatedEngine::new("local");
    permits.add_permits(1000);
    let judge = Arc::new(PairJudge { first: 0.6, second: 0.6, tie: 0.5, calls: AtomicU32::new(0) });
    let runtime = build_runtime(config, engine.clone(), engine, judge).await;

    let run_id = runtime
        .start_run(start_request("cancel", 5, 13), "client-1")
        .await
        .unwrap();
    let mut subscription = runtime.subscribe_events(run_id).unwrap();

    // Cancel in reaction to iteration 2's gen_done event; the runner must
    // observe the flag before scoring starts and abandon the iteration.
    let mut saw_score_done_2 = false;
    let mut abandoned_reason = String::new();
    let mut terminal_status = String::new();
    while let Some(event) = subscription.next().await {
        match &event {
            RunEvent::IterGenDone { i, .. } if *i == 2 => {
                runtime.cancel_run(run_id).unwrap();
            }
            RunEvent::IterScoreDone { i, .. } if *i == 2 => saw_score_done_2 = true,
            RunEvent::IterError { i, reason } if *i == 2 => {
                abandoned_reason = reason.clone();
            }
            RunEvent::Done { status, .. } => {
                terminal_status = status.clone();
                break;
            }
            _ => {}
        }
    }
    assert!(!saw_score_done_2, "iteration 2 must not be scored after cancel");
    assert_eq!(abandoned_reason, "cancelled");
    assert_eq!(terminal_status, "cancelled");

    let run = runtime.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    let variants = runtime.list_variants(run_id).await.unwrap();
    assert_eq!(variants.len(), 2, "exactly iterations 0 and 1 persisted");
    assert_eq!(variants[0].iteration_index, 0);
    assert_eq!(variants[1].iteration_index, 1);
}

#[tokio::test]
async fn test_judge_disagreement_recorded_on_variant() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let (engine, _rx, permits) = GatedEngine::new("local");
    permits.add_permits(1000);
    let judge = Arc::new(PairJudge { first: 0.80, second: 0.40, tie: 0.55, calls: AtomicU32::new(0) });
    let runtime = build_runtime(config, engine.clone(), engine, judge.clone()).await;

    let run_id = runtime
        .start_run(start_request("disagree", 1, 3), "client-1")
        .await
        .unwrap();
    let events = drain_events(&runtime, run_id).await;
    assert!(matches!(events.last(), Some(RunEvent::Done { .. })));

    let variants = runtime.list_variants(run_id).await.unwrap();
    assert_eq!(variants.len(), 1);
    let info = &variants[0].judge_info;
    assert!(info.tie_breaker_used);
    assert_eq!(info.judges.len(), 3);
    assert_eq!(info.final_score, Some(0.55));
    // Two initial judges plus exactly one tie-breaker.
    assert_eq!(judge.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_run_rate_limit_rejects_before_creating_rows() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.runs_per_hour_per_client = 1;
    let (engine, _rx, permits) = GatedEngine::new("local");
    permits.add_permits(1000);
    let judge = Arc::new(PairJudge { first: 0.5, second: 0.5, tie: 0.5, calls: AtomicU32::new(0) });
    let runtime = build_runtime(config, engine.clone(), engine, judge).await;

    let first = runtime
        .start_run(start_request("limits", 1, 1), "client-x")
        .await
        .unwrap();
    let _ = drain_events(&runtime, first).await;

    let rejected = runtime
        .start_run(start_request("limits", 1, 2), "client-x")
        .await;
    assert!(rejected.is_err());
    assert_eq!(runtime.list_runs(10).await.unwrap().len(), 1);
}

// ── Golden + code-loop ──────────────────────────────────────────────────────

fn write_golden_set(dir: &TempDir, items: u32) {
    let items: Vec<serde_json::Value> = (0..items)
        .map(|i| {
            serde_json::json!({
                "id": format!("golden-{}", i),
                "task_type": "qa",
                "task_class": "golden",
                "task": format!("Task item-{}: respond including the token ok-{}.", i, i),
                "assertions": [format!("ok-{}", i)],
                "seed": i,
                "flags": { "web": false, "rag_k": null }
            })
        })
        .collect();
    std::fs::write(
        dir.path().join("golden_set.json"),
        serde_json::to_string_pretty(&items).unwrap(),
    )
    .unwrap();
}

#[tokio::test]
async fn test_golden_regression_rolls_back_code_loop() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    write_golden_set(&dir, 10);

    // Local engine: 8/10 items pass on the first sweep, 7/10 on the second.
    let local = Arc::new(SweepEngine {
        calls: AtomicU32::new(0),
        items_per_sweep: 10,
        passes_by_sweep: vec![8, 7],
    });
    // Hosted engine: one critique, then a patch inside the allowlist.
    let hosted = Arc::new(ScriptedEngine {
        replies: vec![
            "The process weight undervalues assertion coverage on short tasks.".to_string(),
            r#"{"rationale": "nudge process weight", "edits": [{"path": "reward/tuning.json", "content": "{\"beta_process\": 0.25}"}]}"#.to_string(),
        ],
        calls: AtomicU32::new(0),
    });
    let judge = Arc::new(PairJudge { first: 0.6, second: 0.6, tie: 0.5, calls: AtomicU32::new(0) });
    let runtime = build_runtime(config, local, hosted, judge).await;

    // The loop needs a source run on record.
    let source_run_id = runtime
        .start_run(start_request("golden-src", 1, 5), "client-1")
        .await
        .unwrap();
    let _ = drain_events(&runtime, source_run_id).await;

    let artifact = runtime
        .run_code_loop(source_run_id, LoopMode::DryRun)
        .await
        .unwrap();

    assert_eq!(artifact.decision, "rollback");
    assert_eq!(artifact.tests["passed"], serde_json::json!(true));
    let before = artifact.golden_before.as_ref().unwrap();
    let after = artifact.golden_after.as_ref().unwrap();
    assert!((before.pass_rate - 0.8).abs() < 1e-9);
    assert!((after.pass_rate - 0.7).abs() < 1e-9);
    assert!(after.pass_rate < 0.80, "regressed below the gate target");

    // Idempotent replay by source run id.
    let replay = runtime
        .run_code_loop(source_run_id, LoopMode::DryRun)
        .await
        .unwrap();
    assert_eq!(replay.loop_id, artifact.loop_id);
}

#[tokio::test]
async fn test_golden_kpi_persisted_and_snapshot_cached() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    write_golden_set(&dir, 4);

    let local = Arc::new(SweepEngine {
        calls: AtomicU32::new(0),
        items_per_sweep: 4,
        passes_by_sweep: vec![4],
    });
    let hosted = Arc::new(ScriptedEngine { replies: vec![], calls: AtomicU32::new(0) });
    let judge = Arc::new(PairJudge { first: 0.7, second: 0.7, tie: 0.5, calls: AtomicU32::new(0) });
    let runtime = build_runtime(config, local, hosted, judge).await;

    let kpi = runtime.run_golden(None).await.unwrap();
    assert_eq!(kpi.items, 4);
    assert!((kpi.pass_rate - 1.0).abs() < 1e-9);

    let first = runtime
        .analytics_snapshot(metaevolve::store::analytics::AnalyticsWindow::Days7)
        .await
        .unwrap();
    let second = runtime
        .analytics_snapshot(metaevolve::store::analytics::AnalyticsWindow::Days7)
        .await
        .unwrap();
    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(
        serde_json::to_string(&first.totals).unwrap(),
        serde_json::to_string(&second.totals).unwrap()
    );
}
