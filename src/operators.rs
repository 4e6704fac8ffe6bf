//! Operator Library
//!
//! Pure transforms from a base recipe to a concrete candidate recipe. Each
//! operator carries a framework tag; a run's framework mask restricts which
//! operators the bandit may select.

use serde::{Deserialize, Serialize};

/// Which generation backend a recipe targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Local,
    Hosted,
}

impl EngineKind {
    pub fn flipped(self) -> Self {
        match self {
            Self::Local => Self::Hosted,
            Self::Hosted => Self::Local,
        }
    }
}

/// The concrete set of generation parameters and context flags for one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub system: String,
    pub nudge: String,
    pub temperature: f64,
    pub top_k: u32,
    pub memory_k: Option<u32>,
    pub rag_k: Option<u32>,
    pub use_web: bool,
    pub engine: EngineKind,
    pub fewshot: Vec<String>,
}

impl Default for Recipe {
    fn default() -> Self {
        Self {
            system: SYSTEM_VOICES[0].to_string(),
            nudge: String::new(),
            temperature: 0.7,
            top_k: 40,
            memory_k: None,
            rag_k: None,
            use_web: false,
            engine: EngineKind::Local,
            fewshot: Vec::new(),
        }
    }
}

/// Framework groups for masking and stratified exploration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Framework {
    Seal,
    Web,
    Engine,
    Sampling,
}

impl Framework {
    pub const ALL: [Framework; 4] = [
        Framework::Seal,
        Framework::Web,
        Framework::Engine,
        Framework::Sampling,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SEAL" => Some(Self::Seal),
            "WEB" => Some(Self::Web),
            "ENGINE" => Some(Self::Engine),
            "SAMPLING" => Some(Self::Sampling),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seal => "SEAL",
            Self::Web => "WEB",
            Self::Engine => "ENGINE",
            Self::Sampling => "SAMPLING",
        }
    }
}

/// Closed operator set. Registry order below is the warm-start tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    ChangeSystem,
    ChangeNudge,
    RaiseTemp,
    LowerTemp,
    AddFewshot,
    InjectMemory,
    InjectRag,
    ToggleWeb,
    UseAltEngine,
    RaiseTopK,
    LowerTopK,
}

/// Registry in insertion order; the bandit arm key is the operator tag.
pub const REGISTRY: [Operator; 11] = [
    Operator::ChangeSystem,
    Operator::ChangeNudge,
    Operator::RaiseTemp,
    Operator::LowerTemp,
    Operator::AddFewshot,
    Operator::InjectMemory,
    Operator::InjectRag,
    Operator::ToggleWeb,
    Operator::UseAltEngine,
    Operator::RaiseTopK,
    Operator::LowerTopK,
];

const TEMP_MIN: f64 = 0.1;
const TEMP_MAX: f64 = 1.5;
const TEMP_STEP: f64 = 0.2;
const TOP_K_MIN: u32 = 5;
const TOP_K_MAX: u32 = 100;
const TOP_K_STEP: u32 = 15;
const K_DEFAULT: u32 = 3;

/// Enumerated system-prompt voices rotated by `change_system`.
pub const SYSTEM_VOICES: [&str; 5] = [
    "You are a precise assistant. Answer the task directly and completely.",
    "You are a senior engineer. Reason step by step, state assumptions, then answer.",
    "You are a meticulous analyst. Verify every claim against the task before answering.",
    "You are a pragmatic problem solver. Prefer short, concrete, actionable answers.",
    "You are a careful researcher. Cite what you know, admit what you do not.",
];

/// Nudges rotated by `change_nudge`.
pub const NUDGES: [&str; 4] = [
    "Think through the task before answering.",
    "List the requirements first, then satisfy each one explicitly.",
    "Answer, then double-check the answer against the task wording.",
    "Be concise. Remove anything that does not serve the task.",
];

/// Ambient inputs an operator may splice into a recipe.
#[derive(Debug, Clone, Default)]
pub struct OperatorContext {
    /// Rotation counter owned by the runner (one per run, advanced per apply).
    pub rotation: usize,
    /// Few-shot examples for the run's task class.
    pub fewshot_examples: Vec<String>,
    /// Default k when a recipe has no memory/rag depth yet.
    pub default_k: Option<u32>,
}

impl OperatorContext {
    fn k_default(&self) -> u32 {
        self.default_k.unwrap_or(K_DEFAULT)
    }
}

impl Operator {
    pub fn framework(&self) -> Framework {
        match self {
            Operator::ChangeSystem
            | Operator::ChangeNudge
            | Operator::RaiseTemp
            | Operator::LowerTemp
            | Operator::AddFewshot
            | Operator::InjectMemory
            | Operator::InjectRag => Framework::Seal,
            Operator::ToggleWeb => Framework::Web,
            Operator::UseAltEngine => Framework::Engine,
            Operator::RaiseTopK | Operator::LowerTopK => Framework::Sampling,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::ChangeSystem => "change_system",
            Operator::ChangeNudge => "change_nudge",
            Operator::RaiseTemp => "raise_temp",
            Operator::LowerTemp => "lower_temp",
            Operator::AddFewshot => "add_fewshot",
            Operator::InjectMemory => "inject_memory",
            Operator::InjectRag => "inject_rag",
            Operator::ToggleWeb => "toggle_web",
            Operator::UseAltEngine => "use_alt_engine",
            Operator::RaiseTopK => "raise_top_k",
            Operator::LowerTopK => "lower_top_k",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        REGISTRY.iter().copied().find(|op| op.as_str() == s)
    }

    /// Apply this operator to a base recipe, producing the candidate recipe.
    pub fn apply(&self, base: &Recipe, ctx: &OperatorContext) -> Recipe {
        let mut recipe = base.clone();
        match self {
            Operator::ChangeSystem => {
                let current = SYSTEM_VOICES
                    .iter()
                    .position(|v| *v == recipe.system)
                    .unwrap_or(ctx.rotation % SYSTEM_VOICES.len());
                recipe.system = SYSTEM_VOICES[(current + 1) % SYSTEM_VOICES.len()].to_string();
            }
            Operator::ChangeNudge => {
                let current = NUDGES.iter().position(|n| *n == recipe.nudge);
                let next = match current {
                    Some(i) => (i + 1) % NUDGES.len(),
                    None => ctx.rotation % NUDGES.len(),
                };
                recipe.nudge = NUDGES[next].to_string();
            }
            Operator::RaiseTemp => {
                recipe.temperature = (recipe.temperature + TEMP_STEP).min(TEMP_MAX);
            }
            Operator::LowerTemp => {
                recipe.temperature = (recipe.temperature - TEMP_STEP).max(TEMP_MIN);
            }
            Operator::AddFewshot => {
                if !ctx.fewshot_examples.is_empty() {
                    let idx = ctx.rotation % ctx.fewshot_examples.len();
                    let example = ctx.fewshot_examples[idx].clone();
                    if !recipe.fewshot.contains(&example) {
                        recipe.fewshot.push(example);
                    }
                }
            }
            Operator::InjectMemory => {
                recipe.memory_k = Some(recipe.memory_k.unwrap_or_else(|| ctx.k_default()));
            }
            Operator::InjectRag => {
                recipe.rag_k = Some(recipe.rag_k.unwrap_or_else(|| ctx.k_default()));
            }
            Operator::ToggleWeb => {
                recipe.use_web = !recipe.use_web;
            }
            Operator::UseAltEngine => {
                recipe.engine = recipe.engine.flipped();
            }
            Operator::RaiseTopK => {
                recipe.top_k = (recipe.top_k + TOP_K_STEP).min(TOP_K_MAX);
            }
            Operator::LowerTopK => {
                recipe.top_k = recipe.top_k.saturating_sub(TOP_K_STEP).max(TOP_K_MIN);
            }
        }
        recipe
    }
}

/// Operators visible under a framework mask, in registry order.
pub fn allowed_operators(mask: &[Framework]) -> Vec<Operator> {
    REGISTRY
        .iter()
        .copied()
        .filter(|op| mask.contains(&op.framework()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_is_closed_and_ordered() {
        assert_eq!(REGISTRY.len(), 11);
        for op in REGISTRY {
            assert_eq!(Operator::parse(op.as_str()), Some(op));
        }
    }

    #[test]
    fn test_temperature_clamps() {
        let ctx = OperatorContext::default();
        let mut recipe = Recipe::default();
        recipe.temperature = TEMP_MAX - 0.05;
        let raised = Operator::RaiseTemp.apply(&recipe, &ctx);
        assert!((raised.temperature - TEMP_MAX).abs() < 1e-9);

        recipe.temperature = TEMP_MIN + 0.05;
        let lowered = Operator::LowerTemp.apply(&recipe, &ctx);
        assert!((lowered.temperature - TEMP_MIN).abs() < 1e-9);
    }

    #[test]
    fn test_system_voice_rotates() {
        let ctx = OperatorContext::default();
        let recipe = Recipe::default();
        let next = Operator::ChangeSystem.apply(&recipe, &ctx);
        assert_eq!(next.system, SYSTEM_VOICES[1]);
        assert_ne!(next.system, recipe.system);
    }

    #[test]
    fn test_inject_memory_keeps_existing_depth() {
        let ctx = OperatorContext::default();
        let mut recipe = Recipe::default();
        recipe.memory_k = Some(7);
        let applied = Operator::InjectMemory.apply(&recipe, &ctx);
        assert_eq!(applied.memory_k, Some(7));

        recipe.memory_k = None;
        let applied = Operator::InjectMemory.apply(&recipe, &ctx);
        assert_eq!(applied.memory_k, Some(K_DEFAULT));
    }

    #[test]
    fn test_toggle_web_flips_both_ways() {
        let ctx = OperatorContext::default();
        let recipe = Recipe::default();
        let on = Operator::ToggleWeb.apply(&recipe, &ctx);
        assert!(on.use_web);
        let off = Operator::ToggleWeb.apply(&on, &ctx);
        assert!(!off.use_web);
    }

    #[test]
    fn test_mask_restricts_operator_set() {
        let seal_only = allowed_operators(&[Framework::Seal]);
        assert_eq!(seal_only.len(), 7);
        assert!(seal_only.iter().all(|op| op.framework() == Framework::Seal));

        let all = allowed_operators(&Framework::ALL);
        assert_eq!(all.len(), 11);
    }

    #[test]
    fn test_apply_is_pure() {
        let ctx = OperatorContext::default();
        let recipe = Recipe::default();
        let before = recipe.clone();
        let _ = Operator::RaiseTopK.apply(&recipe, &ctx);
        assert_eq!(recipe, before);
    }
}
