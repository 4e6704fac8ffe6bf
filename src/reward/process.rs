//! Process Heuristics
//!
//! Cheap structural signals over an output: reasoning markers, code-block
//! validity, admission of uncertainty, and assertion coverage. Each sub-score
//! lands in [0,1]; the process reward is their mean.

/// Structured-reasoning markers: numbered steps, headings, connective phrases.
fn reasoning_score(output: &str) -> f64 {
    let lower = output.to_lowercase();
    let mut hits = 0u32;
    if regex::Regex::new(r"(?m)^\s*\d+[.)]\s")
        .map(|re| re.is_match(output))
        .unwrap_or(false)
    {
        hits += 1;
    }
    if regex::Regex::new(r"(?m)^\s*[-*]\s")
        .map(|re| re.is_match(output))
        .unwrap_or(false)
    {
        hits += 1;
    }
    for marker in ["because", "therefore", "first", "then", "finally", "step"] {
        if lower.contains(marker) {
            hits += 1;
            break;
        }
    }
    if output.contains('#') || output.contains("**") {
        hits += 1;
    }
    (hits as f64 / 3.0).min(1.0)
}

/// Balanced code fences and balanced brackets inside fenced blocks.
fn code_validity_score(output: &str) -> f64 {
    let fences = output.matches("```").count();
    if fences == 0 {
        return 1.0;
    }
    if fences % 2 != 0 {
        return 0.0;
    }

    let mut in_block = false;
    let mut depth_round = 0i64;
    let mut depth_square = 0i64;
    let mut depth_curly = 0i64;
    for line in output.lines() {
        if line.trim_start().starts_with("```") {
            in_block = !in_block;
            continue;
        }
        if !in_block {
            continue;
        }
        for ch in line.chars() {
            match ch {
                '(' => depth_round += 1,
                ')' => depth_round -= 1,
                '[' => depth_square += 1,
                ']' => depth_square -= 1,
                '{' => depth_curly += 1,
                '}' => depth_curly -= 1,
                _ => {}
            }
        }
    }
    if depth_round == 0 && depth_square == 0 && depth_curly == 0 {
        1.0
    } else {
        0.5
    }
}

const UNCERTAINTY_MARKERS: [&str; 7] = [
    "i'm not sure",
    "i am not sure",
    "cannot verify",
    "can't verify",
    "uncertain",
    "i don't know",
    "unable to confirm",
];

fn admits_uncertainty(output: &str) -> bool {
    let lower = output.to_lowercase();
    UNCERTAINTY_MARKERS.iter().any(|m| lower.contains(m))
}

/// Fraction of assertions literally present in the output (case-insensitive).
fn assertion_coverage(output: &str, assertions: &[String]) -> f64 {
    if assertions.is_empty() {
        return 1.0;
    }
    let lower = output.to_lowercase();
    let satisfied = assertions
        .iter()
        .filter(|a| lower.contains(&a.to_lowercase()))
        .count();
    satisfied as f64 / assertions.len() as f64
}

/// Honesty gate: full credit when every assertion holds, or when the output
/// admits it could not satisfy them; zero for confident misses.
fn hallucination_refusal_score(output: &str, assertions: &[String]) -> f64 {
    if assertion_coverage(output, assertions) >= 1.0 {
        return 1.0;
    }
    if admits_uncertainty(output) {
        1.0
    } else {
        0.0
    }
}

/// Whether every assertion is literally present in the output.
pub fn assertions_satisfied(output: &str, assertions: &[String]) -> bool {
    assertion_coverage(output, assertions) >= 1.0
}

/// The mean of the four sub-scores.
pub fn process_reward(output: &str, assertions: &[String]) -> f64 {
    let scores = [
        reasoning_score(output),
        code_validity_score(output),
        hallucination_refusal_score(output, assertions),
        assertion_coverage(output, assertions),
    ];
    scores.iter().sum::<f64>() / scores.len() as f64
}
