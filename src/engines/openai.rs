//! Hosted Engine (OpenAI-compatible)
//!
//! Multi-model hosted backend reached over an OpenAI-compatible chat API.
//! Also hosts the judge protocol: any pool model can be addressed by id.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::json;
use std::time::Instant;
use tracing::debug;

use super::{GenerationEngine, GenerationOutput, GenerationRequest, JudgeEngine, JudgeVerdict};

pub struct OpenAiCompatEngine {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
}

impl OpenAiCompatEngine {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            api_key,
            default_model: default_model.into(),
        }
    }

    async fn chat(
        &self,
        model: &str,
        system: &str,
        prompt: &str,
        temperature: f64,
        seed: Option<u64>,
    ) -> Result<String> {
        let mut body = json!({
            "model": model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": prompt },
            ],
            "temperature": temperature,
        });
        if let Some(seed) = seed {
            body["seed"] = json!(seed);
        }

        let mut request = self
            .client
            .post(format!(
                "{}/chat/completions",
                self.base_url.trim_end_matches('/')
            ))
            .json(&body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .context("hosted chat request failed")?
            .error_for_status()
            .context("hosted chat returned error status")?
            .json::<serde_json::Value>()
            .await
            .context("hosted chat returned invalid JSON")?;

        response["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("hosted chat response had no content"))
    }
}

#[async_trait]
impl GenerationEngine for OpenAiCompatEngine {
    fn id(&self) -> &str {
        "hosted"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput> {
        let prompt = request.render_prompt();
        let prompt_length = request.recipe.system.len() + prompt.len();

        debug!(model = %self.default_model, prompt_length, "hosted generation call");
        let started = Instant::now();
        let output = self
            .chat(
                &self.default_model,
                &request.recipe.system,
                &prompt,
                request.recipe.temperature,
                request.seed,
            )
            .await?;

        Ok(GenerationOutput {
            output,
            duration_ms: started.elapsed().as_millis() as u64,
            prompt_length,
            engine_id: self.id().to_string(),
            model_id: self.default_model.clone(),
        })
    }
}

const JUDGE_SYSTEM: &str = "You are an exacting evaluator of AI task outputs. \
Score strictly and respond with JSON only.";

fn judge_prompt(task: &str, output: &str) -> String {
    format!(
        r#"Evaluate the response below against the task on five criteria:
accuracy, completeness, clarity, task relevance, practical usefulness.

## Task
{}

## Response
{}

Reply with a single JSON object and nothing else:
{{"score": <number between 0 and 1>, "rationale": "<one or two sentences>"}}
"#,
        task, output
    )
}

/// Tolerant extraction: proper JSON first, then a bare `"score": x` pattern.
fn parse_judge_reply(reply: &str) -> Result<(f64, Option<String>)> {
    let trimmed = reply.trim();
    let json_slice = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    };
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(json_slice) {
        if let Some(score) = value["score"].as_f64() {
            let rationale = value["rationale"].as_str().map(|s| s.to_string());
            return Ok((score, rationale));
        }
    }

    if let Ok(pattern) = Regex::new(r#"(?i)score[":\s]+([0-9]*\.?[0-9]+)"#) {
        if let Some(caps) = pattern.captures(trimmed) {
            if let Ok(score) = caps[1].parse::<f64>() {
                return Ok((score, None));
            }
        }
    }

    Err(anyhow!("judge reply had no parseable score"))
}

#[async_trait]
impl JudgeEngine for OpenAiCompatEngine {
    async fn judge(&self, model_id: &str, task: &str, output: &str) -> Result<JudgeVerdict> {
        let started = Instant::now();
        let reply = self
            .chat(model_id, JUDGE_SYSTEM, &judge_prompt(task, output), 0.0, None)
            .await?;
        let (score, rationale) = parse_judge_reply(&reply)?;
        Ok(JudgeVerdict {
            score,
            rationale,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_judge_reply_json() {
        let (score, rationale) =
            parse_judge_reply(r#"{"score": 0.85, "rationale": "solid and complete"}"#).unwrap();
        assert!((score - 0.85).abs() < 1e-9);
        assert_eq!(rationale.as_deref(), Some("solid and complete"));
    }

    #[test]
    fn test_parse_judge_reply_wrapped_json() {
        let reply = "Here is my verdict:\n{\"score\": 0.4}\nThanks.";
        let (score, rationale) = parse_judge_reply(reply).unwrap();
        assert!((score - 0.4).abs() < 1e-9);
        assert!(rationale.is_none());
    }

    #[test]
    fn test_parse_judge_reply_fallback_pattern() {
        let (score, _) = parse_judge_reply("SCORE: 0.72 because it is mostly right").unwrap();
        assert!((score - 0.72).abs() < 1e-9);
    }

    #[test]
    fn test_parse_judge_reply_garbage() {
        assert!(parse_judge_reply("no numbers here").is_err());
    }
}
