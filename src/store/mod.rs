//! Durable Store
//!
//! Row-oriented SQLite persistence for runs, variants, bandit arms, recipes,
//! ratings, golden results, code-loop artifacts and analytics snapshots.
//! Every call opens its own connection inside `spawn_blocking`; writes are
//! retried with exponential backoff before surfacing a storage error.

pub mod analytics;

use anyhow::{anyhow, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task;
use tracing::warn;

use crate::config::{PromotionConfig, RewardWeights, Strategy};
use crate::operators::{Framework, Recipe};
use crate::reward::JudgeInfo;

const WRITE_ATTEMPTS: u32 = 3;
const WRITE_BACKOFF_BASE_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Complete,
    Error,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "complete" => Self::Complete,
            "error" => Self::Error,
            _ => Self::Cancelled,
        }
    }
}

/// Parameters for creating one run row.
#[derive(Debug, Clone)]
pub struct RunParams {
    pub session_id: String,
    pub task_class: String,
    pub task: String,
    pub n_total: u32,
    pub strategy: Strategy,
    pub epsilon: f64,
    pub framework_mask: Vec<Framework>,
    pub memory_k: Option<u32>,
    pub rag_k: Option<u32>,
    pub seed: u64,
    pub reward_weights: RewardWeights,
}

pub fn normalize_task_class(task_class: &str) -> String {
    task_class
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: i64,
    pub session_id: String,
    pub task_class: String,
    pub normalized_task_class: String,
    pub task: String,
    pub n_total: u32,
    pub strategy: Strategy,
    pub epsilon: f64,
    pub framework_mask: Vec<Framework>,
    pub memory_k: Option<u32>,
    pub rag_k: Option<u32>,
    pub seed: u64,
    pub reward_weights: RewardWeights,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub baseline_score: Option<f64>,
    pub baseline_cost: Option<f64>,
    pub best_score: Option<f64>,
    pub best_variant_id: Option<i64>,
    pub status: RunStatus,
    pub error: Option<String>,
}

/// One scored attempt, immutable once persisted.
#[derive(Debug, Clone)]
pub struct NewVariant {
    pub run_id: i64,
    pub iteration_index: u32,
    pub operator: String,
    pub recipe: Recipe,
    pub prompt_length: usize,
    pub output: String,
    pub duration_ms: u64,
    pub outcome_reward: f64,
    pub process_reward: f64,
    pub cost_penalty: f64,
    pub total_reward: f64,
    pub judge_info: JudgeInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct VariantRecord {
    pub variant_id: i64,
    pub run_id: i64,
    pub iteration_index: u32,
    pub operator: String,
    pub recipe: Recipe,
    pub prompt_length: usize,
    pub output: String,
    pub duration_ms: u64,
    pub outcome_reward: f64,
    pub process_reward: f64,
    pub cost_penalty: f64,
    pub total_reward: f64,
    pub judge_info: JudgeInfo,
    pub is_best: bool,
    pub created_at: i64,
}

/// Cross-run bandit statistics for one `(task_class, operator)` arm.
#[derive(Debug, Clone, Serialize)]
pub struct OperatorStat {
    pub task_class: String,
    pub operator: String,
    pub pulls: u64,
    pub sum_reward: f64,
    pub mean_reward: f64,
    pub last_updated: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Approval {
    Auto,
    Pending,
    Manual,
}

impl Approval {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Pending => "pending",
            Self::Manual => "manual",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "auto" => Self::Auto,
            "manual" => Self::Manual,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecipeRecord {
    pub recipe_id: i64,
    pub task_class: String,
    pub parent_variant_id: i64,
    pub recipe: Recipe,
    pub baseline_delta: f64,
    pub cost_ratio: f64,
    pub approved: Approval,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RatingRecord {
    pub rating_id: i64,
    pub variant_id: i64,
    pub score: u8,
    pub feedback: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldenItemResult {
    pub item_id: String,
    pub outcome_reward: f64,
    pub process_reward: f64,
    pub cost_penalty: f64,
    pub total_reward: f64,
    pub steps: u32,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldenKpi {
    pub avg_total_reward: f64,
    pub avg_cost_penalty: f64,
    pub avg_steps: f64,
    pub pass_rate: f64,
    pub items: u32,
    pub model_id: String,
    pub index_hash: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeLoopRecord {
    pub loop_id: String,
    pub source_run_id: i64,
    pub mode: String,
    pub critic: String,
    pub patch: serde_json::Value,
    pub tests: serde_json::Value,
    pub golden_before: Option<GoldenKpi>,
    pub golden_after: Option<GoldenKpi>,
    pub thresholds: serde_json::Value,
    pub decision: String,
    pub created_at: i64,
}

/// The durable store. Cheap to clone; connections are per call.
#[derive(Clone)]
pub struct MetaStore {
    db_path: PathBuf,
}

impl MetaStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let path_clone = path.clone();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL,
                    task_class TEXT NOT NULL,
                    normalized_task_class TEXT NOT NULL,
                    task TEXT NOT NULL,
                    n_total INTEGER NOT NULL,
                    strategy TEXT NOT NULL,
                    epsilon REAL NOT NULL,
                    framework_mask TEXT NOT NULL,
                    memory_k INTEGER,
                    rag_k INTEGER,
                    seed INTEGER NOT NULL,
                    reward_weights TEXT NOT NULL,
                    started_at INTEGER NOT NULL,
                    finished_at INTEGER,
                    baseline_score REAL,
                    baseline_cost REAL,
                    best_score REAL,
                    best_variant_id INTEGER,
                    status TEXT NOT NULL,
                    error TEXT
                );

                CREATE TABLE IF NOT EXISTS variants (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(id),
                    iteration_index INTEGER NOT NULL,
                    operator TEXT NOT NULL,
                    recipe TEXT NOT NULL,
                    prompt_length INTEGER NOT NULL,
                    output TEXT NOT NULL,
                    duration_ms INTEGER NOT NULL,
                    outcome_reward REAL NOT NULL,
                    process_reward REAL NOT NULL,
                    cost_penalty REAL NOT NULL,
                    total_reward REAL NOT NULL,
                    judge_info TEXT NOT NULL,
                    is_best INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS operator_stats (
                    task_class TEXT NOT NULL,
                    operator TEXT NOT NULL,
                    pulls INTEGER NOT NULL,
                    sum_reward REAL NOT NULL,
                    mean_reward REAL NOT NULL,
                    last_updated INTEGER NOT NULL,
                    PRIMARY KEY (task_class, operator)
                );

                CREATE TABLE IF NOT EXISTS recipes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_class TEXT NOT NULL,
                    parent_variant_id INTEGER NOT NULL REFERENCES variants(id),
                    recipe_json TEXT NOT NULL,
                    baseline_delta REAL NOT NULL,
                    cost_ratio REAL NOT NULL,
                    approved TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    UNIQUE (task_class, parent_variant_id)
                );

                CREATE TABLE IF NOT EXISTS ratings (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    variant_id INTEGER NOT NULL REFERENCES variants(id),
                    score INTEGER NOT NULL,
                    feedback TEXT,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS golden_results (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    kpi_id INTEGER NOT NULL,
                    item_id TEXT NOT NULL,
                    outcome_reward REAL NOT NULL,
                    process_reward REAL NOT NULL,
                    cost_penalty REAL NOT NULL,
                    total_reward REAL NOT NULL,
                    steps INTEGER NOT NULL,
                    passed INTEGER NOT NULL,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS golden_kpis (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    avg_total_reward REAL NOT NULL,
                    avg_cost_penalty REAL NOT NULL,
                    avg_steps REAL NOT NULL,
                    pass_rate REAL NOT NULL,
                    items INTEGER NOT NULL,
                    model_id TEXT NOT NULL,
                    index_hash TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS code_loops (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    loop_id TEXT NOT NULL,
                    source_run_id INTEGER NOT NULL UNIQUE,
                    mode TEXT NOT NULL,
                    critic TEXT NOT NULL,
                    patch TEXT NOT NULL,
                    tests TEXT NOT NULL,
                    golden_before TEXT,
                    golden_after TEXT,
                    thresholds TEXT NOT NULL,
                    decision TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS snapshots (
                    window TEXT PRIMARY KEY,
                    payload TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS rag_documents (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_class TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_variants_run ON variants(run_id);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_variants_run_iter
                    ON variants(run_id, iteration_index);
                CREATE INDEX IF NOT EXISTS idx_variants_created ON variants(created_at);
                CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(started_at);
                CREATE INDEX IF NOT EXISTS idx_ratings_variant ON ratings(variant_id);
                CREATE INDEX IF NOT EXISTS idx_rag_class ON rag_documents(task_class);
                "#,
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await??;

        Ok(Self { db_path: path })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run a blocking write with exponential backoff.
    async fn with_retries<T, F>(&self, op_name: &'static str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&Connection) -> Result<T> + Send + Sync + Clone + 'static,
    {
        let mut last_err = None;
        for attempt in 0..WRITE_ATTEMPTS {
            let path = self.db_path.clone();
            let op = op.clone();
            let result =
                task::spawn_blocking(move || op(&Connection::open(&path)?)).await?;
            match result {
                Ok(value) => return Ok(value),
                // Only engine-level failures are worth retrying; validation
                // and constraint rejections surface immediately.
                Err(err) if err.downcast_ref::<rusqlite::Error>().is_none() => return Err(err),
                Err(err) => {
                    warn!(op = op_name, attempt, "storage write failed: {}", err);
                    last_err = Some(err);
                    if attempt + 1 < WRITE_ATTEMPTS {
                        let backoff = WRITE_BACKOFF_BASE_MS * (1 << attempt);
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("{} failed", op_name)))
    }

    async fn read<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let path = self.db_path.clone();
        task::spawn_blocking(move || op(&Connection::open(&path)?)).await?
    }

    // ── Runs ────────────────────────────────────────────────────────────────

    pub async fn create_run(&self, params: &RunParams) -> Result<i64> {
        let p = params.clone();
        self.with_retries("create_run", move |conn| {
            let now = Utc::now().timestamp();
            let mask = serde_json::to_string(&p.framework_mask)?;
            let weights = serde_json::to_string(&p.reward_weights)?;
            conn.execute(
                "INSERT INTO runs (session_id, task_class, normalized_task_class, task,
                    n_total, strategy, epsilon, framework_mask, memory_k, rag_k, seed,
                    reward_weights, started_at, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 'running')",
                params![
                    &p.session_id,
                    &p.task_class,
                    normalize_task_class(&p.task_class),
                    &p.task,
                    p.n_total,
                    p.strategy.as_str(),
                    p.epsilon,
                    &mask,
                    p.memory_k,
                    p.rag_k,
                    p.seed as i64,
                    &weights,
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn get_run(&self, run_id: i64) -> Result<Option<RunRecord>> {
        self.read(move |conn| {
            conn.query_row(
                "SELECT id, session_id, task_class, normalized_task_class, task, n_total,
                        strategy, epsilon, framework_mask, memory_k, rag_k, seed,
                        reward_weights, started_at, finished_at, baseline_score,
                        baseline_cost, best_score, best_variant_id, status, error
                 FROM runs WHERE id = ?1",
                params![run_id],
                row_to_run,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    pub async fn list_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, task_class, normalized_task_class, task, n_total,
                        strategy, epsilon, framework_mask, memory_k, rag_k, seed,
                        reward_weights, started_at, finished_at, baseline_score,
                        baseline_cost, best_score, best_variant_id, status, error
                 FROM runs ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], row_to_run)?;
            let mut runs = Vec::new();
            for row in rows {
                runs.push(row?);
            }
            Ok(runs)
        })
        .await
    }

    pub async fn set_run_baseline(
        &self,
        run_id: i64,
        baseline_score: f64,
        baseline_cost: f64,
    ) -> Result<()> {
        self.with_retries("set_run_baseline", move |conn| {
            conn.execute(
                "UPDATE runs SET baseline_score = ?2, baseline_cost = ?3 WHERE id = ?1",
                params![run_id, baseline_score, baseline_cost],
            )?;
            Ok(())
        })
        .await
    }

    /// Idempotent terminal transition; only the first call takes effect.
    pub async fn finish_run(
        &self,
        run_id: i64,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.with_retries("finish_run", move |conn| {
            let now = Utc::now().timestamp();
            conn.execute(
                "UPDATE runs SET finished_at = ?2, status = ?3, error = ?4
                 WHERE id = ?1 AND finished_at IS NULL",
                params![run_id, now, status.as_str(), &error],
            )?;
            Ok(())
        })
        .await
    }

    // ── Variants ────────────────────────────────────────────────────────────

    /// Rejects if the owning run is not `running`.
    pub async fn save_variant(&self, variant: &NewVariant) -> Result<i64> {
        let v = variant.clone();
        self.with_retries("save_variant", move |conn| {
            let status: Option<String> = conn
                .query_row(
                    "SELECT status FROM runs WHERE id = ?1",
                    params![v.run_id],
                    |row| row.get(0),
                )
                .optional()?;
            match status.as_deref() {
                Some("running") => {}
                Some(other) => {
                    return Err(anyhow!("run {} is {}, not running", v.run_id, other))
                }
                None => return Err(anyhow!("run {} does not exist", v.run_id)),
            }

            let recipe = serde_json::to_string(&v.recipe)?;
            let judge_info = serde_json::to_string(&v.judge_info)?;
            conn.execute(
                "INSERT INTO variants (run_id, iteration_index, operator, recipe,
                    prompt_length, output, duration_ms, outcome_reward, process_reward,
                    cost_penalty, total_reward, judge_info, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    v.run_id,
                    v.iteration_index,
                    &v.operator,
                    &recipe,
                    v.prompt_length as i64,
                    &v.output,
                    v.duration_ms as i64,
                    v.outcome_reward,
                    v.process_reward,
                    v.cost_penalty,
                    v.total_reward,
                    &judge_info,
                    Utc::now().timestamp(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn get_variant(&self, variant_id: i64) -> Result<Option<VariantRecord>> {
        self.read(move |conn| {
            conn.query_row(
                "SELECT id, run_id, iteration_index, operator, recipe, prompt_length,
                        output, duration_ms, outcome_reward, process_reward, cost_penalty,
                        total_reward, judge_info, is_best, created_at
                 FROM variants WHERE id = ?1",
                params![variant_id],
                row_to_variant,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    pub async fn list_variants(&self, run_id: i64) -> Result<Vec<VariantRecord>> {
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, iteration_index, operator, recipe, prompt_length,
                        output, duration_ms, outcome_reward, process_reward, cost_penalty,
                        total_reward, judge_info, is_best, created_at
                 FROM variants WHERE run_id = ?1 ORDER BY iteration_index ASC",
            )?;
            let rows = stmt.query_map(params![run_id], row_to_variant)?;
            let mut variants = Vec::new();
            for row in rows {
                variants.push(row?);
            }
            Ok(variants)
        })
        .await
    }

    /// Atomically move the best marker; exactly one variant per run carries it.
    pub async fn update_best(&self, run_id: i64, variant_id: i64, score: f64) -> Result<()> {
        self.with_retries("update_best", move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "UPDATE variants SET is_best = 0 WHERE run_id = ?1",
                params![run_id],
            )?;
            tx.execute(
                "UPDATE variants SET is_best = 1 WHERE id = ?1 AND run_id = ?2",
                params![variant_id, run_id],
            )?;
            tx.execute(
                "UPDATE runs SET best_score = ?2, best_variant_id = ?3 WHERE id = ?1",
                params![run_id, score, variant_id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    // ── Bandit arms ─────────────────────────────────────────────────────────

    /// Read-modify-write of one arm inside a single transaction.
    pub async fn update_operator_stat(
        &self,
        task_class: &str,
        operator: &str,
        reward: f64,
    ) -> Result<()> {
        let class = normalize_task_class(task_class);
        let op = operator.to_string();
        self.with_retries("update_operator_stat", move |conn| {
            let tx = conn.unchecked_transaction()?;
            let now = Utc::now().timestamp();
            tx.execute(
                "INSERT INTO operator_stats (task_class, operator, pulls, sum_reward,
                    mean_reward, last_updated)
                 VALUES (?1, ?2, 1, ?3, ?3, ?4)
                 ON CONFLICT (task_class, operator) DO UPDATE SET
                    pulls = pulls + 1,
                    sum_reward = sum_reward + excluded.sum_reward,
                    mean_reward = (sum_reward + excluded.sum_reward) / (pulls + 1),
                    last_updated = excluded.last_updated",
                params![&class, &op, reward, now],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn list_operator_stats(
        &self,
        task_class: Option<&str>,
    ) -> Result<Vec<OperatorStat>> {
        let class = task_class.map(normalize_task_class);
        self.read(move |conn| {
            let mut stats = Vec::new();
            match class {
                Some(class) => {
                    let mut stmt = conn.prepare(
                        "SELECT task_class, operator, pulls, sum_reward, mean_reward,
                                last_updated
                         FROM operator_stats WHERE task_class = ?1 ORDER BY operator",
                    )?;
                    let rows = stmt.query_map(params![&class], row_to_stat)?;
                    for row in rows {
                        stats.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT task_class, operator, pulls, sum_reward, mean_reward,
                                last_updated
                         FROM operator_stats ORDER BY task_class, operator",
                    )?;
                    let rows = stmt.query_map([], row_to_stat)?;
                    for row in rows {
                        stats.push(row?);
                    }
                }
            }
            Ok(stats)
        })
        .await
    }

    pub async fn reset_operator_stats(&self, task_class: &str) -> Result<u64> {
        let class = normalize_task_class(task_class);
        self.with_retries("reset_operator_stats", move |conn| {
            let deleted = conn.execute(
                "DELETE FROM operator_stats WHERE task_class = ?1",
                params![&class],
            )?;
            Ok(deleted as u64)
        })
        .await
    }

    // ── Recipes ─────────────────────────────────────────────────────────────

    /// Promote a variant's recipe when it clears the reward delta gate.
    /// Returns `None` when the variant is not eligible.
    pub async fn promote_recipe(
        &self,
        variant_id: i64,
        promotion: &PromotionConfig,
    ) -> Result<Option<RecipeRecord>> {
        let cfg = promotion.clone();
        self.with_retries("promote_recipe", move |conn| {
            let Some((run_id, recipe_json, total_reward, cost_penalty)) = conn
                .query_row(
                    "SELECT run_id, recipe, total_reward, cost_penalty
                     FROM variants WHERE id = ?1",
                    params![variant_id],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, f64>(2)?,
                            row.get::<_, f64>(3)?,
                        ))
                    },
                )
                .optional()?
            else {
                return Err(anyhow!("variant {} does not exist", variant_id));
            };

            let (task_class, baseline_score, baseline_cost): (String, Option<f64>, Option<f64>) =
                conn.query_row(
                    "SELECT normalized_task_class, baseline_score, baseline_cost
                     FROM runs WHERE id = ?1",
                    params![run_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;

            let baseline_score = baseline_score.unwrap_or(0.0);
            // Penalties are stored as normalized cost minus one.
            let baseline_cost = baseline_cost.unwrap_or(1.0).max(1e-9);
            let delta = total_reward - baseline_score;
            let cost_ratio = (cost_penalty + 1.0) / baseline_cost;

            if delta < cfg.delta_reward_min {
                return Ok(None);
            }
            let instant = delta >= cfg.auto_approve_delta && cost_ratio <= cfg.auto_approve_cost_ratio;
            let approved = if instant || cost_ratio <= cfg.cost_ratio_max {
                Approval::Auto
            } else {
                Approval::Pending
            };

            let now = Utc::now().timestamp();
            // A collision downgrades the stored recipe to pending for re-review,
            // unless a human already approved it.
            conn.execute(
                "INSERT INTO recipes (task_class, parent_variant_id, recipe_json,
                    baseline_delta, cost_ratio, approved, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (task_class, parent_variant_id) DO UPDATE SET
                    approved = CASE WHEN recipes.approved = 'manual'
                        THEN 'manual' ELSE 'pending' END",
                params![
                    &task_class,
                    variant_id,
                    &recipe_json,
                    delta,
                    cost_ratio,
                    approved.as_str(),
                    now,
                ],
            )?;

            conn.query_row(
                "SELECT id, task_class, parent_variant_id, recipe_json, baseline_delta,
                        cost_ratio, approved, created_at
                 FROM recipes WHERE task_class = ?1 AND parent_variant_id = ?2",
                params![&task_class, variant_id],
                row_to_recipe,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    pub async fn list_recipes(&self, task_class: &str) -> Result<Vec<RecipeRecord>> {
        let class = normalize_task_class(task_class);
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, task_class, parent_variant_id, recipe_json, baseline_delta,
                        cost_ratio, approved, created_at
                 FROM recipes WHERE task_class = ?1 ORDER BY id DESC",
            )?;
            let rows = stmt.query_map(params![&class], row_to_recipe)?;
            let mut recipes = Vec::new();
            for row in rows {
                recipes.push(row?);
            }
            Ok(recipes)
        })
        .await
    }

    /// Newest approved recipe for seeding a run's base.
    pub async fn latest_approved_recipe(&self, task_class: &str) -> Result<Option<RecipeRecord>> {
        let class = normalize_task_class(task_class);
        self.read(move |conn| {
            conn.query_row(
                "SELECT id, task_class, parent_variant_id, recipe_json, baseline_delta,
                        cost_ratio, approved, created_at
                 FROM recipes
                 WHERE task_class = ?1 AND approved IN ('auto', 'manual')
                 ORDER BY id DESC LIMIT 1",
                params![&class],
                row_to_recipe,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    pub async fn approve_recipe(&self, recipe_id: i64) -> Result<bool> {
        self.with_retries("approve_recipe", move |conn| {
            let updated = conn.execute(
                "UPDATE recipes SET approved = 'manual' WHERE id = ?1",
                params![recipe_id],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    // ── Ratings ─────────────────────────────────────────────────────────────

    /// Append-only; the latest rating supersedes on read.
    pub async fn insert_rating(
        &self,
        variant_id: i64,
        score: u8,
        feedback: Option<String>,
    ) -> Result<i64> {
        self.with_retries("insert_rating", move |conn| {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT id FROM variants WHERE id = ?1",
                    params![variant_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(anyhow!("variant {} does not exist", variant_id));
            }
            conn.execute(
                "INSERT INTO ratings (variant_id, score, feedback, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![variant_id, score, &feedback, Utc::now().timestamp()],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn list_ratings(&self, variant_id: i64) -> Result<Vec<RatingRecord>> {
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, variant_id, score, feedback, created_at
                 FROM ratings WHERE variant_id = ?1 ORDER BY id DESC",
            )?;
            let rows = stmt.query_map(params![variant_id], |row| {
                Ok(RatingRecord {
                    rating_id: row.get(0)?,
                    variant_id: row.get(1)?,
                    score: row.get::<_, i64>(2)? as u8,
                    feedback: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?;
            let mut ratings = Vec::new();
            for row in rows {
                ratings.push(row?);
            }
            Ok(ratings)
        })
        .await
    }

    // ── Golden / code-loop ──────────────────────────────────────────────────

    pub async fn insert_golden_run(
        &self,
        kpi: &GoldenKpi,
        results: &[GoldenItemResult],
    ) -> Result<i64> {
        let kpi = kpi.clone();
        let results = results.to_vec();
        self.with_retries("insert_golden_run", move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO golden_kpis (avg_total_reward, avg_cost_penalty, avg_steps,
                    pass_rate, items, model_id, index_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    kpi.avg_total_reward,
                    kpi.avg_cost_penalty,
                    kpi.avg_steps,
                    kpi.pass_rate,
                    kpi.items,
                    &kpi.model_id,
                    &kpi.index_hash,
                    kpi.created_at,
                ],
            )?;
            let kpi_id = tx.last_insert_rowid();
            for item in &results {
                tx.execute(
                    "INSERT INTO golden_results (kpi_id, item_id, outcome_reward,
                        process_reward, cost_penalty, total_reward, steps, passed,
                        created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        kpi_id,
                        &item.item_id,
                        item.outcome_reward,
                        item.process_reward,
                        item.cost_penalty,
                        item.total_reward,
                        item.steps,
                        item.passed,
                        kpi.created_at,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(kpi_id)
        })
        .await
    }

    pub async fn latest_golden_kpi(&self) -> Result<Option<GoldenKpi>> {
        self.read(move |conn| {
            conn.query_row(
                "SELECT avg_total_reward, avg_cost_penalty, avg_steps, pass_rate, items,
                        model_id, index_hash, created_at
                 FROM golden_kpis ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(GoldenKpi {
                        avg_total_reward: row.get(0)?,
                        avg_cost_penalty: row.get(1)?,
                        avg_steps: row.get(2)?,
                        pass_rate: row.get(3)?,
                        items: row.get::<_, i64>(4)? as u32,
                        model_id: row.get(5)?,
                        index_hash: row.get(6)?,
                        created_at: row.get(7)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    pub async fn insert_code_loop(&self, record: &CodeLoopRecord) -> Result<()> {
        let r = record.clone();
        self.with_retries("insert_code_loop", move |conn| {
            conn.execute(
                "INSERT INTO code_loops (loop_id, source_run_id, mode, critic, patch,
                    tests, golden_before, golden_after, thresholds, decision, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    &r.loop_id,
                    r.source_run_id,
                    &r.mode,
                    &r.critic,
                    serde_json::to_string(&r.patch)?,
                    serde_json::to_string(&r.tests)?,
                    r.golden_before
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    r.golden_after
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    serde_json::to_string(&r.thresholds)?,
                    &r.decision,
                    r.created_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_code_loop_by_source(&self, source_run_id: i64) -> Result<Option<CodeLoopRecord>> {
        self.read(move |conn| {
            conn.query_row(
                "SELECT loop_id, source_run_id, mode, critic, patch, tests,
                        golden_before, golden_after, thresholds, decision, created_at
                 FROM code_loops WHERE source_run_id = ?1",
                params![source_run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, i64>(10)?,
                    ))
                },
            )
            .optional()?
            .map(
                |(loop_id, source, mode, critic, patch, tests, before, after, thresholds, decision, created_at)| {
                    Ok(CodeLoopRecord {
                        loop_id,
                        source_run_id: source,
                        mode,
                        critic,
                        patch: serde_json::from_str(&patch)?,
                        tests: serde_json::from_str(&tests)?,
                        golden_before: before.map(|s| serde_json::from_str(&s)).transpose()?,
                        golden_after: after.map(|s| serde_json::from_str(&s)).transpose()?,
                        thresholds: serde_json::from_str(&thresholds)?,
                        decision,
                        created_at,
                    })
                },
            )
            .transpose()
        })
        .await
    }

    // ── Snapshots / RAG ─────────────────────────────────────────────────────

    pub async fn snapshot_put(&self, window: &str, payload: &serde_json::Value) -> Result<()> {
        let window = window.to_string();
        let payload = payload.clone();
        self.with_retries("snapshot_put", move |conn| {
            conn.execute(
                "INSERT INTO snapshots (window, payload, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (window) DO UPDATE SET
                    payload = excluded.payload, created_at = excluded.created_at",
                params![&window, serde_json::to_string(&payload)?, Utc::now().timestamp()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn snapshot_get(&self, window: &str) -> Result<Option<(serde_json::Value, i64)>> {
        let window = window.to_string();
        self.read(move |conn| {
            conn.query_row(
                "SELECT payload, created_at FROM snapshots WHERE window = ?1",
                params![&window],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?
            .map(|(payload, created_at)| Ok((serde_json::from_str(&payload)?, created_at)))
            .transpose()
        })
        .await
    }

    pub async fn insert_rag_document(&self, task_class: &str, content: &str) -> Result<i64> {
        let class = normalize_task_class(task_class);
        let content = content.to_string();
        self.with_retries("insert_rag_document", move |conn| {
            conn.execute(
                "INSERT INTO rag_documents (task_class, content, created_at)
                 VALUES (?1, ?2, ?3)",
                params![&class, &content, Utc::now().timestamp()],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    let strategy: String = row.get(6)?;
    let mask: String = row.get(8)?;
    let weights: String = row.get(12)?;
    let status: String = row.get(19)?;
    Ok(RunRecord {
        run_id: row.get(0)?,
        session_id: row.get(1)?,
        task_class: row.get(2)?,
        normalized_task_class: row.get(3)?,
        task: row.get(4)?,
        n_total: row.get::<_, i64>(5)? as u32,
        strategy: Strategy::parse(&strategy).unwrap_or(Strategy::Ucb1),
        epsilon: row.get(7)?,
        framework_mask: serde_json::from_str(&mask).unwrap_or_default(),
        memory_k: row.get::<_, Option<i64>>(9)?.map(|v| v as u32),
        rag_k: row.get::<_, Option<i64>>(10)?.map(|v| v as u32),
        seed: row.get::<_, i64>(11)? as u64,
        reward_weights: serde_json::from_str(&weights).unwrap_or_default(),
        started_at: row.get(13)?,
        finished_at: row.get(14)?,
        baseline_score: row.get(15)?,
        baseline_cost: row.get(16)?,
        best_score: row.get(17)?,
        best_variant_id: row.get(18)?,
        status: RunStatus::parse(&status),
        error: row.get(20)?,
    })
}

fn row_to_variant(row: &rusqlite::Row<'_>) -> rusqlite::Result<VariantRecord> {
    let recipe: String = row.get(4)?;
    let judge_info: String = row.get(12)?;
    Ok(VariantRecord {
        variant_id: row.get(0)?,
        run_id: row.get(1)?,
        iteration_index: row.get::<_, i64>(2)? as u32,
        operator: row.get(3)?,
        recipe: serde_json::from_str(&recipe).unwrap_or_default(),
        prompt_length: row.get::<_, i64>(5)? as usize,
        output: row.get(6)?,
        duration_ms: row.get::<_, i64>(7)? as u64,
        outcome_reward: row.get(8)?,
        process_reward: row.get(9)?,
        cost_penalty: row.get(10)?,
        total_reward: row.get(11)?,
        judge_info: serde_json::from_str(&judge_info).unwrap_or_default(),
        is_best: row.get::<_, i64>(13)? != 0,
        created_at: row.get(14)?,
    })
}

fn row_to_stat(row: &rusqlite::Row<'_>) -> rusqlite::Result<OperatorStat> {
    Ok(OperatorStat {
        task_class: row.get(0)?,
        operator: row.get(1)?,
        pulls: row.get::<_, i64>(2)? as u64,
        sum_reward: row.get(3)?,
        mean_reward: row.get(4)?,
        last_updated: row.get(5)?,
    })
}

fn row_to_recipe(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecipeRecord> {
    let recipe: String = row.get(3)?;
    let approved: String = row.get(6)?;
    Ok(RecipeRecord {
        recipe_id: row.get(0)?,
        task_class: row.get(1)?,
        parent_variant_id: row.get(2)?,
        recipe: serde_json::from_str(&recipe).unwrap_or_default(),
        baseline_delta: row.get(4)?,
        cost_ratio: row.get(5)?,
        approved: Approval::parse(&approved),
        created_at: row.get(7)?,
    })
}
