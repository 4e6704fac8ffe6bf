//! Local Engine (Ollama)
//!
//! Single-model local backend plus the embedding endpoint used for semantic
//! similarity scoring.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ollama_rs::generation::chat::{request::ChatMessageRequest, ChatMessage};
use ollama_rs::generation::embeddings::request::{EmbeddingsInput, GenerateEmbeddingsRequest};
use ollama_rs::models::ModelOptions;
use ollama_rs::Ollama;
use std::time::Instant;
use tracing::debug;

use super::{Embedder, GenerationEngine, GenerationOutput, GenerationRequest};

pub struct OllamaEngine {
    client: Ollama,
    model: String,
}

impl OllamaEngine {
    pub fn new(host: impl Into<String>, port: u16, model: impl Into<String>) -> Self {
        Self {
            client: Ollama::new(host.into(), port),
            model: model.into(),
        }
    }
}

#[async_trait]
impl GenerationEngine for OllamaEngine {
    fn id(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput> {
        let prompt = request.render_prompt();
        let prompt_length = request.recipe.system.len() + prompt.len();

        let messages = vec![
            ChatMessage::system(request.recipe.system.clone()),
            ChatMessage::user(prompt),
        ];

        let options = ModelOptions::default()
            .num_ctx(8192)
            .temperature(request.recipe.temperature as f32)
            .top_k(request.recipe.top_k);

        let chat = ChatMessageRequest::new(self.model.clone(), messages).options(options);

        debug!(model = %self.model, prompt_length, "local generation call");
        let started = Instant::now();
        let response = self
            .client
            .send_chat_messages(chat)
            .await
            .context("Ollama chat call failed")?;

        Ok(GenerationOutput {
            output: response.message.content,
            duration_ms: started.elapsed().as_millis() as u64,
            prompt_length,
            engine_id: self.id().to_string(),
            model_id: self.model.clone(),
        })
    }
}

pub struct OllamaEmbedder {
    client: Ollama,
    model: String,
}

impl OllamaEmbedder {
    pub fn new(host: impl Into<String>, port: u16, model: impl Into<String>) -> Self {
        Self {
            client: Ollama::new(host.into(), port),
            model: model.into(),
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = GenerateEmbeddingsRequest::new(
            self.model.clone(),
            EmbeddingsInput::Single(text.to_string()),
        );
        let response = self
            .client
            .generate_embeddings(request)
            .await
            .context("Ollama embeddings call failed")?;
        response
            .embeddings
            .into_iter()
            .next()
            .context("Ollama returned no embedding vector")
    }
}
