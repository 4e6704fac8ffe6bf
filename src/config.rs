//! Engine Configuration
//!
//! Typed configuration record for the whole engine. Every recognized key maps
//! to an `EVOLV_*` environment variable; unknown `EVOLV_*` keys fail startup.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Bandit strategy for operator selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    EpsilonGreedy,
    Ucb1,
}

impl Strategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "epsilon_greedy" | "eps_greedy" | "epsilon-greedy" => Some(Self::EpsilonGreedy),
            "ucb1" | "ucb" => Some(Self::Ucb1),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EpsilonGreedy => "epsilon_greedy",
            Self::Ucb1 => "ucb1",
        }
    }
}

/// One judge model with its round-robin weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeModel {
    pub model: String,
    pub weight: u32,
}

/// Run-loop budget and deadlines.
#[derive(Debug, Clone)]
pub struct RunBudget {
    pub n_default: u32,
    /// `None` means unlimited (the default for meta-runs).
    pub run_timeout: Option<Duration>,
    pub generation_timeout: Duration,
    pub judge_timeout: Duration,
}

/// Bandit selection knobs.
#[derive(Debug, Clone)]
pub struct BanditConfig {
    pub strategy: Strategy,
    pub epsilon: f64,
    pub ucb_c: f64,
    pub warm_start_min_pulls: u64,
    pub stratified_exploration: bool,
}

/// Reward blending weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardWeights {
    pub alpha: f64,
    pub beta_process: f64,
    pub gamma_cost: f64,
    pub ai_blend: f64,
    pub semantic_blend: f64,
    pub judge_disagreement_threshold: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta_process: 0.2,
            gamma_cost: -0.0005,
            ai_blend: 0.9,
            semantic_blend: 0.1,
            judge_disagreement_threshold: 0.3,
        }
    }
}

/// Promotion thresholds for moving a variant's recipe into the recipe store.
#[derive(Debug, Clone)]
pub struct PromotionConfig {
    pub delta_reward_min: f64,
    pub cost_ratio_max: f64,
    pub auto_approve_delta: f64,
    pub auto_approve_cost_ratio: f64,
}

/// Code-loop caps and gates.
#[derive(Debug, Clone)]
pub struct CodeLoopConfig {
    pub max_per_hour: u32,
    pub timeout: Duration,
    pub max_loc: usize,
    pub max_patches: usize,
    pub max_files: usize,
    pub golden_pass_rate_target: f64,
    pub allowed_paths: Vec<String>,
}

/// Event bus sizing.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    pub queue_size: usize,
    pub keep_alive_interval: Duration,
    pub replay_grace: Duration,
}

/// Analytics snapshot cache.
#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    pub snapshot_ttl: Duration,
}

/// Collaborator endpoints and judge pools.
#[derive(Debug, Clone)]
pub struct EngineEndpoints {
    pub ollama_host: String,
    pub ollama_port: u16,
    pub local_model: String,
    pub embed_model: String,
    pub hosted_base_url: String,
    pub hosted_api_key: Option<String>,
    pub hosted_model: String,
    pub judge_pool_1: Vec<JudgeModel>,
    pub judge_pool_2: Vec<JudgeModel>,
    pub judge_pool_3: Vec<JudgeModel>,
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: String,
    pub bind_addr: String,
    pub golden_set_path: String,
    pub runs_per_hour_per_client: u32,
    pub budget: RunBudget,
    pub bandit: BanditConfig,
    pub reward: RewardWeights,
    pub promotion: PromotionConfig,
    pub code_loop: CodeLoopConfig,
    pub event_bus: EventBusConfig,
    pub analytics: AnalyticsConfig,
    pub endpoints: EngineEndpoints,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: "metaevolve.db".to_string(),
            bind_addr: "0.0.0.0:8090".to_string(),
            golden_set_path: "golden/golden_set.json".to_string(),
            runs_per_hour_per_client: 30,
            budget: RunBudget {
                n_default: 16,
                run_timeout: None,
                generation_timeout: Duration::from_secs(180),
                judge_timeout: Duration::from_secs(60),
            },
            bandit: BanditConfig {
                strategy: Strategy::Ucb1,
                epsilon: 0.6,
                ucb_c: 2.0,
                warm_start_min_pulls: 1,
                stratified_exploration: true,
            },
            reward: RewardWeights::default(),
            promotion: PromotionConfig {
                delta_reward_min: 0.05,
                cost_ratio_max: 0.9,
                auto_approve_delta: 0.2,
                auto_approve_cost_ratio: 0.8,
            },
            code_loop: CodeLoopConfig {
                max_per_hour: 3,
                timeout: Duration::from_secs(600),
                max_loc: 50,
                max_patches: 3,
                max_files: 5,
                golden_pass_rate_target: 0.80,
                allowed_paths: vec![
                    "reward/".to_string(),
                    "golden/".to_string(),
                    "tests/".to_string(),
                ],
            },
            event_bus: EventBusConfig {
                queue_size: 256,
                keep_alive_interval: Duration::from_secs(15),
                replay_grace: Duration::from_secs(60),
            },
            analytics: AnalyticsConfig {
                snapshot_ttl: Duration::from_secs(60),
            },
            endpoints: EngineEndpoints {
                ollama_host: "http://localhost".to_string(),
                ollama_port: 11434,
                local_model: "qwen2.5:7b".to_string(),
                embed_model: "nomic-embed-text".to_string(),
                hosted_base_url: "https://api.groq.com/openai/v1".to_string(),
                hosted_api_key: None,
                hosted_model: "llama-3.3-70b-versatile".to_string(),
                judge_pool_1: vec![
                    JudgeModel { model: "llama-3.3-70b-versatile".to_string(), weight: 3 },
                    JudgeModel { model: "qwen-2.5-72b".to_string(), weight: 2 },
                ],
                judge_pool_2: vec![
                    JudgeModel { model: "gemma2-9b-it".to_string(), weight: 2 },
                    JudgeModel { model: "mixtral-8x7b".to_string(), weight: 1 },
                ],
                judge_pool_3: vec![
                    JudgeModel { model: "deepseek-r1-distill-70b".to_string(), weight: 1 },
                ],
            },
        }
    }
}

const RECOGNIZED_KEYS: &[&str] = &[
    "EVOLV_DB_PATH",
    "EVOLV_BIND_ADDR",
    "EVOLV_GOLDEN_SET_PATH",
    "EVOLV_RUNS_PER_HOUR",
    "EVOLV_N_DEFAULT",
    "EVOLV_RUN_TIMEOUT_S",
    "EVOLV_GENERATION_TIMEOUT_S",
    "EVOLV_JUDGE_TIMEOUT_S",
    "EVOLV_STRATEGY",
    "EVOLV_EPSILON",
    "EVOLV_UCB_C",
    "EVOLV_WARM_START_MIN_PULLS",
    "EVOLV_STRATIFIED_EXPLORATION",
    "EVOLV_ALPHA",
    "EVOLV_BETA_PROCESS",
    "EVOLV_GAMMA_COST",
    "EVOLV_DELTA_REWARD_MIN",
    "EVOLV_COST_RATIO_MAX",
    "EVOLV_AUTO_APPROVE_DELTA",
    "EVOLV_AUTO_APPROVE_COST_RATIO",
    "EVOLV_CODE_LOOP_MAX_PER_HOUR",
    "EVOLV_CODE_LOOP_TIMEOUT_S",
    "EVOLV_CODE_LOOP_MAX_LOC",
    "EVOLV_CODE_LOOP_MAX_PATCHES",
    "EVOLV_CODE_LOOP_MAX_FILES",
    "EVOLV_GOLDEN_PASS_RATE_TARGET",
    "EVOLV_EVENT_QUEUE_SIZE",
    "EVOLV_KEEP_ALIVE_INTERVAL_S",
    "EVOLV_REPLAY_GRACE_S",
    "EVOLV_SNAPSHOT_TTL_S",
    "EVOLV_OLLAMA_HOST",
    "EVOLV_OLLAMA_PORT",
    "EVOLV_LOCAL_MODEL",
    "EVOLV_EMBED_MODEL",
    "EVOLV_HOSTED_BASE_URL",
    "EVOLV_HOSTED_API_KEY",
    "EVOLV_HOSTED_MODEL",
    "EVOLV_JUDGE_POOL_1",
    "EVOLV_JUDGE_POOL_2",
    "EVOLV_JUDGE_POOL_3",
];

fn env_get(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> EngineResult<Option<T>> {
    match env_get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| EngineError::Config(format!("{} has invalid value '{}'", key, raw))),
        None => Ok(None),
    }
}

/// Parse `model:weight,model:weight` pool definitions.
fn parse_pool(key: &str) -> EngineResult<Option<Vec<JudgeModel>>> {
    let Some(raw) = env_get(key) else {
        return Ok(None);
    };
    let mut pool = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (model, weight) = match entry.rsplit_once(':') {
            Some((m, w)) => (
                m.to_string(),
                w.parse::<u32>()
                    .map_err(|_| EngineError::Config(format!("{}: bad weight in '{}'", key, entry)))?,
            ),
            None => (entry.to_string(), 1),
        };
        pool.push(JudgeModel { model, weight });
    }
    if pool.is_empty() {
        return Err(EngineError::Config(format!("{} is empty", key)));
    }
    Ok(Some(pool))
}

impl EngineConfig {
    /// Load configuration from the environment on top of the defaults.
    pub fn from_env() -> EngineResult<Self> {
        let known: HashSet<&str> = RECOGNIZED_KEYS.iter().copied().collect();
        for (key, _) in std::env::vars() {
            if key.starts_with("EVOLV_") && !known.contains(key.as_str()) {
                return Err(EngineError::Config(format!("unknown configuration key {}", key)));
            }
        }

        let mut cfg = Self::default();

        if let Some(v) = env_get("EVOLV_DB_PATH") {
            cfg.db_path = v;
        }
        if let Some(v) = env_get("EVOLV_BIND_ADDR") {
            cfg.bind_addr = v;
        }
        if let Some(v) = env_get("EVOLV_GOLDEN_SET_PATH") {
            cfg.golden_set_path = v;
        }
        if let Some(v) = parse_env::<u32>("EVOLV_RUNS_PER_HOUR")? {
            cfg.runs_per_hour_per_client = v;
        }

        if let Some(v) = parse_env::<u32>("EVOLV_N_DEFAULT")? {
            cfg.budget.n_default = v;
        }
        if let Some(v) = parse_env::<u64>("EVOLV_RUN_TIMEOUT_S")? {
            cfg.budget.run_timeout = (v > 0).then(|| Duration::from_secs(v));
        }
        if let Some(v) = parse_env::<u64>("EVOLV_GENERATION_TIMEOUT_S")? {
            cfg.budget.generation_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_env::<u64>("EVOLV_JUDGE_TIMEOUT_S")? {
            cfg.budget.judge_timeout = Duration::from_secs(v);
        }

        if let Some(raw) = env_get("EVOLV_STRATEGY") {
            cfg.bandit.strategy = Strategy::parse(&raw)
                .ok_or_else(|| EngineError::Config(format!("unknown strategy '{}'", raw)))?;
        }
        if let Some(v) = parse_env::<f64>("EVOLV_EPSILON")? {
            cfg.bandit.epsilon = v;
        }
        if let Some(v) = parse_env::<f64>("EVOLV_UCB_C")? {
            cfg.bandit.ucb_c = v;
        }
        if let Some(v) = parse_env::<u64>("EVOLV_WARM_START_MIN_PULLS")? {
            cfg.bandit.warm_start_min_pulls = v;
        }
        if let Some(raw) = env_get("EVOLV_STRATIFIED_EXPLORATION") {
            cfg.bandit.stratified_exploration = matches!(raw.as_str(), "1" | "on" | "true");
        }

        if let Some(v) = parse_env::<f64>("EVOLV_ALPHA")? {
            cfg.reward.alpha = v;
        }
        if let Some(v) = parse_env::<f64>("EVOLV_BETA_PROCESS")? {
            cfg.reward.beta_process = v;
        }
        if let Some(v) = parse_env::<f64>("EVOLV_GAMMA_COST")? {
            cfg.reward.gamma_cost = v;
        }

        if let Some(v) = parse_env::<f64>("EVOLV_DELTA_REWARD_MIN")? {
            cfg.promotion.delta_reward_min = v;
        }
        if let Some(v) = parse_env::<f64>("EVOLV_COST_RATIO_MAX")? {
            cfg.promotion.cost_ratio_max = v;
        }
        if let Some(v) = parse_env::<f64>("EVOLV_AUTO_APPROVE_DELTA")? {
            cfg.promotion.auto_approve_delta = v;
        }
        if let Some(v) = parse_env::<f64>("EVOLV_AUTO_APPROVE_COST_RATIO")? {
            cfg.promotion.auto_approve_cost_ratio = v;
        }

        if let Some(v) = parse_env::<u32>("EVOLV_CODE_LOOP_MAX_PER_HOUR")? {
            cfg.code_loop.max_per_hour = v;
        }
        if let Some(v) = parse_env::<u64>("EVOLV_CODE_LOOP_TIMEOUT_S")? {
            cfg.code_loop.timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_env::<usize>("EVOLV_CODE_LOOP_MAX_LOC")? {
            cfg.code_loop.max_loc = v;
        }
        if let Some(v) = parse_env::<usize>("EVOLV_CODE_LOOP_MAX_PATCHES")? {
            cfg.code_loop.max_patches = v;
        }
        if let Some(v) = parse_env::<usize>("EVOLV_CODE_LOOP_MAX_FILES")? {
            cfg.code_loop.max_files = v;
        }
        if let Some(v) = parse_env::<f64>("EVOLV_GOLDEN_PASS_RATE_TARGET")? {
            cfg.code_loop.golden_pass_rate_target = v;
        }

        if let Some(v) = parse_env::<usize>("EVOLV_EVENT_QUEUE_SIZE")? {
            cfg.event_bus.queue_size = v.max(1);
        }
        if let Some(v) = parse_env::<u64>("EVOLV_KEEP_ALIVE_INTERVAL_S")? {
            cfg.event_bus.keep_alive_interval = Duration::from_secs(v.max(1));
        }
        if let Some(v) = parse_env::<u64>("EVOLV_REPLAY_GRACE_S")? {
            cfg.event_bus.replay_grace = Duration::from_secs(v);
        }
        if let Some(v) = parse_env::<u64>("EVOLV_SNAPSHOT_TTL_S")? {
            cfg.analytics.snapshot_ttl = Duration::from_secs(v);
        }

        if let Some(v) = env_get("EVOLV_OLLAMA_HOST") {
            cfg.endpoints.ollama_host = v;
        }
        if let Some(v) = parse_env::<u16>("EVOLV_OLLAMA_PORT")? {
            cfg.endpoints.ollama_port = v;
        }
        if let Some(v) = env_get("EVOLV_LOCAL_MODEL") {
            cfg.endpoints.local_model = v;
        }
        if let Some(v) = env_get("EVOLV_EMBED_MODEL") {
            cfg.endpoints.embed_model = v;
        }
        if let Some(v) = env_get("EVOLV_HOSTED_BASE_URL") {
            cfg.endpoints.hosted_base_url = v;
        }
        if let Some(v) = env_get("EVOLV_HOSTED_API_KEY") {
            cfg.endpoints.hosted_api_key = Some(v);
        }
        if let Some(v) = env_get("EVOLV_HOSTED_MODEL") {
            cfg.endpoints.hosted_model = v;
        }
        if let Some(pool) = parse_pool("EVOLV_JUDGE_POOL_1")? {
            cfg.endpoints.judge_pool_1 = pool;
        }
        if let Some(pool) = parse_pool("EVOLV_JUDGE_POOL_2")? {
            cfg.endpoints.judge_pool_2 = pool;
        }
        if let Some(pool) = parse_pool("EVOLV_JUDGE_POOL_3")? {
            cfg.endpoints.judge_pool_3 = pool;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.budget.n_default == 0 {
            return Err(EngineError::Config("n_default must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.bandit.epsilon) {
            return Err(EngineError::Config("epsilon must be within [0,1]".into()));
        }
        if self.bandit.ucb_c < 0.0 {
            return Err(EngineError::Config("ucb_c must be >= 0".into()));
        }
        if !(0.0..=1.0).contains(&self.code_loop.golden_pass_rate_target) {
            return Err(EngineError::Config(
                "golden_pass_rate_target must be within [0,1]".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.budget.n_default, 16);
        assert_eq!(cfg.bandit.strategy, Strategy::Ucb1);
        assert!(cfg.bandit.stratified_exploration);
        assert!((cfg.reward.gamma_cost + 0.0005).abs() < 1e-12);
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(Strategy::parse("ucb1"), Some(Strategy::Ucb1));
        assert_eq!(Strategy::parse("epsilon_greedy"), Some(Strategy::EpsilonGreedy));
        assert_eq!(Strategy::parse("thompson"), None);
    }

    #[test]
    fn test_epsilon_bounds_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.bandit.epsilon = 1.5;
        assert!(cfg.validate().is_err());
    }
}
