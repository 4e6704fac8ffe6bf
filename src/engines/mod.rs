//! Collaborator Contracts
//!
//! Narrow interfaces to the external systems the engine drives: generation
//! backends, judges, embeddings, retrieval, and the code-loop patcher/test
//! runner. The core depends only on these traits.

mod ollama;
mod openai;
mod retrieval;

pub use ollama::{OllamaEmbedder, OllamaEngine};
pub use openai::OpenAiCompatEngine;
pub use retrieval::{DdgWebSearcher, SqliteMemoryRetriever, SqliteRagRetriever};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::operators::Recipe;

/// One generation request assembled by the runner.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub recipe: Recipe,
    pub task: String,
    /// Memory / RAG / web snippets spliced in by the operator context.
    pub context_blocks: Vec<String>,
    /// Sampling seed; backends that support pinning honor it.
    pub seed: Option<u64>,
}

impl GenerationRequest {
    /// Full prompt text: system, context, few-shot examples, nudge, task.
    pub fn render_prompt(&self) -> String {
        let mut prompt = String::new();
        for block in &self.context_blocks {
            prompt.push_str(block);
            prompt.push_str("\n\n");
        }
        for example in &self.recipe.fewshot {
            prompt.push_str("Example:\n");
            prompt.push_str(example);
            prompt.push_str("\n\n");
        }
        if !self.recipe.nudge.is_empty() {
            prompt.push_str(&self.recipe.nudge);
            prompt.push_str("\n\n");
        }
        prompt.push_str(&self.task);
        prompt
    }
}

/// What a generation backend returns for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub output: String,
    pub duration_ms: u64,
    pub prompt_length: usize,
    pub engine_id: String,
    pub model_id: String,
}

#[async_trait]
pub trait GenerationEngine: Send + Sync {
    fn id(&self) -> &str;
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput>;
}

/// A judge's verdict on one output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub score: f64,
    pub rationale: Option<String>,
    pub duration_ms: u64,
}

#[async_trait]
pub trait JudgeEngine: Send + Sync {
    async fn judge(&self, model_id: &str, task: &str, output: &str) -> Result<JudgeVerdict>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Bounded textual snippets for recipe splicing.
#[async_trait]
pub trait MemoryRetriever: Send + Sync {
    async fn recall(&self, task_class: &str, query: &str, k: u32) -> Result<Vec<String>>;
}

#[async_trait]
pub trait RagRetriever: Send + Sync {
    async fn retrieve(&self, task_class: &str, query: &str, k: u32) -> Result<Vec<String>>;
    /// Content hash of the backing index, recorded on golden artifacts.
    async fn index_hash(&self) -> Result<String>;
}

#[async_trait]
pub trait WebSearcher: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<String>>;
}

/// One file edit inside a code-loop patch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEdit {
    pub path: String,
    pub content: String,
}

/// A bounded package of edits proposed by the code-loop critic/editor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditsPackage {
    pub edits: Vec<FileEdit>,
    pub rationale: String,
}

/// Result of applying (or reverting) an edits package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchOutcome {
    pub ok: bool,
    pub diffs: Vec<String>,
    pub touched_files: Vec<String>,
}

#[async_trait]
pub trait Patcher: Send + Sync {
    async fn apply(&self, edits: &EditsPackage) -> Result<PatchOutcome>;
    async fn rollback(&self) -> Result<()>;
}

/// Unit-test outcome for the code-loop gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub passed: bool,
    pub failures: Vec<String>,
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self) -> Result<TestReport>;
}

/// Cosine similarity between two embedding vectors, clipped to [0,1].
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::Recipe;

    #[test]
    fn test_cosine_similarity_bounds() {
        let a = vec![1.0f32, 0.0, 0.0];
        let b = vec![1.0f32, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-9);

        let c = vec![-1.0f32, 0.0, 0.0];
        // Anti-parallel vectors clip to zero rather than going negative.
        assert_eq!(cosine_similarity(&a, &c), 0.0);
        assert_eq!(cosine_similarity(&a, &[]), 0.0);
    }

    #[test]
    fn test_render_prompt_ordering() {
        let mut recipe = Recipe::default();
        recipe.nudge = "Check your work.".to_string();
        recipe.fewshot = vec!["Q: 1+1? A: 2".to_string()];
        let request = GenerationRequest {
            recipe,
            task: "What is 2+2?".to_string(),
            context_blocks: vec!["Relevant fact: arithmetic is exact.".to_string()],
            seed: None,
        };
        let prompt = request.render_prompt();
        let ctx_pos = prompt.find("Relevant fact").unwrap();
        let shot_pos = prompt.find("Example:").unwrap();
        let nudge_pos = prompt.find("Check your work").unwrap();
        let task_pos = prompt.find("What is 2+2?").unwrap();
        assert!(ctx_pos < shot_pos && shot_pos < nudge_pos && nudge_pos < task_pos);
    }
}
