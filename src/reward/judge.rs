//! Judge Protocol
//!
//! Two judges drawn from separate pools under weighted round-robin, with a
//! third-pool tie-breaker when they disagree by more than the configured
//! threshold. Scores are normalized once, here, at the reward boundary.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, warn};

use super::{JudgeInfo, JudgeScore};
use crate::config::JudgeModel;
use crate::engines::JudgeEngine;

/// Smooth weighted round-robin over a judge pool.
pub struct WeightedRoundRobin {
    entries: Vec<JudgeModel>,
    current: Vec<i64>,
}

impl WeightedRoundRobin {
    pub fn new(entries: Vec<JudgeModel>) -> Self {
        let current = vec![0; entries.len()];
        Self { entries, current }
    }

    /// Pick the next model. Each draw advances every entry by its weight and
    /// selects the largest accumulated weight, keeping long-run shares
    /// proportional to the configured weights.
    pub fn next(&mut self) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }
        let total: i64 = self.entries.iter().map(|e| e.weight as i64).sum();
        for (i, entry) in self.entries.iter().enumerate() {
            self.current[i] += entry.weight as i64;
        }
        let best = self
            .current
            .iter()
            .enumerate()
            .max_by_key(|(_, v)| **v)
            .map(|(i, _)| i)?;
        self.current[best] -= total;
        Some(self.entries[best].model.clone())
    }

    /// Whether the pool can produce a model different from `model`.
    /// Zero-weight entries never win a draw, so they do not count.
    pub fn has_model_other_than(&self, model: &str) -> bool {
        self.entries.iter().any(|e| e.model != model && e.weight > 0)
    }
}

/// Normalize a raw judge score to [0,1]. Values above 1 are read as a 1–10
/// scale. Non-finite values are a failed judge call.
pub fn normalize_score(raw: f64) -> Option<f64> {
    if !raw.is_finite() {
        return None;
    }
    let scaled = if raw > 1.0 { raw / 10.0 } else { raw };
    Some(scaled.clamp(0.0, 1.0))
}

pub struct JudgePanel {
    engine: Arc<dyn JudgeEngine>,
    pool_1: Mutex<WeightedRoundRobin>,
    pool_2: Mutex<WeightedRoundRobin>,
    pool_3: Mutex<WeightedRoundRobin>,
    timeout: Duration,
    disagreement_threshold: f64,
}

impl JudgePanel {
    pub fn new(
        engine: Arc<dyn JudgeEngine>,
        pool_1: Vec<JudgeModel>,
        pool_2: Vec<JudgeModel>,
        pool_3: Vec<JudgeModel>,
        timeout: Duration,
        disagreement_threshold: f64,
    ) -> Self {
        Self {
            engine,
            pool_1: Mutex::new(WeightedRoundRobin::new(pool_1)),
            pool_2: Mutex::new(WeightedRoundRobin::new(pool_2)),
            pool_3: Mutex::new(WeightedRoundRobin::new(pool_3)),
            timeout,
            disagreement_threshold,
        }
    }

    /// Draw the next model from a pool. With `distinct_from` set, the draw
    /// never returns that model: the round-robin keeps advancing past
    /// duplicates, and a pool with no other model yields `None` so the
    /// protocol degrades to a single judge instead of judging twice with one
    /// model.
    fn draw(&self, pool: &Mutex<WeightedRoundRobin>, distinct_from: Option<&str>) -> Option<String> {
        let mut rr = pool.lock().expect("judge pool lock");
        let Some(other) = distinct_from else {
            return rr.next();
        };
        if !rr.has_model_other_than(other) {
            return None;
        }
        loop {
            let candidate = rr.next()?;
            if candidate != other {
                return Some(candidate);
            }
        }
    }

    async fn call_judge(&self, model: &str, task: &str, output: &str) -> Option<JudgeScore> {
        let verdict =
            tokio::time::timeout(self.timeout, self.engine.judge(model, task, output)).await;
        match verdict {
            Ok(Ok(verdict)) => normalize_score(verdict.score).map(|score| JudgeScore {
                model: model.to_string(),
                score,
                rationale: verdict.rationale,
            }),
            Ok(Err(err)) => {
                warn!(model, "judge call failed: {}", err);
                None
            }
            Err(_) => {
                warn!(model, "judge call timed out after {:?}", self.timeout);
                None
            }
        }
    }

    /// Run the protocol. Returns the final AI score (None when every judge
    /// failed) plus the full record for persistence.
    pub async fn evaluate(&self, task: &str, output: &str) -> (Option<f64>, JudgeInfo) {
        let model_1 = self.draw(&self.pool_1, None);
        let model_2 = self.draw(&self.pool_2, model_1.as_deref());

        let (first, second) = match (&model_1, &model_2) {
            (Some(m1), Some(m2)) => {
                futures::future::join(
                    self.call_judge(m1, task, output),
                    self.call_judge(m2, task, output),
                )
                .await
            }
            (Some(m1), None) => (self.call_judge(m1, task, output).await, None),
            (None, Some(m2)) => (None, self.call_judge(m2, task, output).await),
            (None, None) => (None, None),
        };

        let mut info = JudgeInfo::default();
        if let Some(ref judge) = first {
            info.judges.push(judge.clone());
        }
        if let Some(ref judge) = second {
            info.judges.push(judge.clone());
        }

        let final_score = match (first, second) {
            (Some(a), Some(b)) => {
                if (a.score - b.score).abs() >= self.disagreement_threshold {
                    debug!(
                        s1 = a.score,
                        s2 = b.score,
                        "judge disagreement, drawing tie-breaker"
                    );
                    match self.tie_break(task, output).await {
                        Some(tie) => {
                            let score = tie.score;
                            info.judges.push(tie);
                            info.tie_breaker_used = true;
                            Some(score)
                        }
                        // Tie-breaker failed; fall back to the mean.
                        None => Some((a.score + b.score) / 2.0),
                    }
                } else {
                    Some((a.score + b.score) / 2.0)
                }
            }
            (Some(a), None) => Some(a.score),
            (None, Some(b)) => Some(b.score),
            (None, None) => None,
        };

        info.final_score = final_score;
        (final_score, info)
    }

    async fn tie_break(&self, task: &str, output: &str) -> Option<JudgeScore> {
        let model = self.draw(&self.pool_3, None)?;
        self.call_judge(&model, task, output).await
    }
}
