//! Bandit Selection
//!
//! Operator selection over per-task-class arm statistics: warm start for
//! coverage, optional stratified framework quotas, then ε-greedy or UCB1.
//! Selection is a pure function of the arm snapshot, the candidate set, the
//! configuration and the caller-owned PRNG.

use rand::Rng;
use std::collections::HashMap;

use crate::config::{BanditConfig, Strategy};
use crate::operators::{Framework, Operator};

/// Snapshot of one arm as seen at selection time.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArmSnapshot {
    pub pulls: u64,
    pub mean_reward: f64,
}

/// Per-run framework pull accounting for stratified exploration.
#[derive(Debug, Clone, Default)]
pub struct FrameworkQuotas {
    pulls: HashMap<Framework, u64>,
    total: u64,
}

impl FrameworkQuotas {
    pub fn record(&mut self, framework: Framework) {
        *self.pulls.entry(framework).or_insert(0) += 1;
        self.total += 1;
    }

    fn pulls_for(&self, framework: Framework) -> u64 {
        self.pulls.get(&framework).copied().unwrap_or(0)
    }

    /// Frameworks whose run-local share is below their share of the
    /// candidate set.
    fn below_quota(&self, allowed: &[Operator]) -> Vec<Framework> {
        if self.total == 0 {
            return Vec::new();
        }
        let total_ops = allowed.len() as f64;
        let mut shares: HashMap<Framework, f64> = HashMap::new();
        for op in allowed {
            *shares.entry(op.framework()).or_insert(0.0) += 1.0 / total_ops;
        }
        shares
            .into_iter()
            .filter(|(framework, share)| {
                (self.pulls_for(*framework) as f64) / (self.total as f64) < *share
            })
            .map(|(framework, _)| framework)
            .collect()
    }
}

/// Select the next operator for a task.
///
/// `arms` maps operator tag → cross-run statistics; missing entries mean a
/// never-pulled arm. `quotas` is consulted only when stratified exploration is
/// enabled.
pub fn select<R: Rng>(
    arms: &HashMap<Operator, ArmSnapshot>,
    allowed: &[Operator],
    quotas: Option<&FrameworkQuotas>,
    config: &BanditConfig,
    rng: &mut R,
) -> Option<Operator> {
    if allowed.is_empty() {
        return None;
    }

    let snapshot = |op: &Operator| arms.get(op).copied().unwrap_or_default();

    // Warm start: guarantee coverage of every allowed operator first.
    // Ties break by registry insertion order, which `allowed` preserves.
    let cold = allowed
        .iter()
        .copied()
        .filter(|op| snapshot(op).pulls < config.warm_start_min_pulls)
        .min_by_key(|op| snapshot(op).pulls);
    if let Some(op) = cold {
        return Some(op);
    }

    // Stratified exploration narrows candidates to under-served frameworks.
    let mut candidates: Vec<Operator> = allowed.to_vec();
    if config.stratified_exploration {
        if let Some(quotas) = quotas {
            let lagging = quotas.below_quota(allowed);
            if !lagging.is_empty() {
                let narrowed: Vec<Operator> = allowed
                    .iter()
                    .copied()
                    .filter(|op| lagging.contains(&op.framework()))
                    .collect();
                if !narrowed.is_empty() {
                    candidates = narrowed;
                }
            }
        }
    }

    let chosen = match config.strategy {
        Strategy::EpsilonGreedy => {
            if rng.gen::<f64>() < config.epsilon {
                candidates[rng.gen_range(0..candidates.len())]
            } else {
                argmax_random_tie(&candidates, rng, |op| snapshot(op).mean_reward)
            }
        }
        Strategy::Ucb1 => {
            let total_pulls: u64 = candidates.iter().map(|op| snapshot(op).pulls).sum();
            let ln_n = (total_pulls.max(1) as f64).ln();
            argmax_random_tie(&candidates, rng, |op| {
                let arm = snapshot(op);
                if arm.pulls == 0 {
                    f64::INFINITY
                } else {
                    arm.mean_reward + config.ucb_c * (ln_n / arm.pulls as f64).sqrt()
                }
            })
        }
    };
    Some(chosen)
}

fn argmax_random_tie<R: Rng, F: Fn(&Operator) -> f64>(
    candidates: &[Operator],
    rng: &mut R,
    score: F,
) -> Operator {
    let mut best = f64::NEG_INFINITY;
    let mut ties: Vec<Operator> = Vec::new();
    for op in candidates {
        let s = score(op);
        if s > best {
            best = s;
            ties.clear();
            ties.push(*op);
        } else if (s - best).abs() < 1e-12 {
            ties.push(*op);
        }
    }
    ties[rng.gen_range(0..ties.len())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::{allowed_operators, Framework, REGISTRY};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config(strategy: Strategy, epsilon: f64, stratified: bool) -> BanditConfig {
        BanditConfig {
            strategy,
            epsilon,
            ucb_c: 2.0,
            warm_start_min_pulls: 1,
            stratified_exploration: stratified,
        }
    }

    #[test]
    fn test_warm_start_covers_every_operator_once() {
        let allowed = allowed_operators(&Framework::ALL);
        let cfg = config(Strategy::Ucb1, 0.0, true);
        let mut rng = StdRng::seed_from_u64(42);

        let mut arms: HashMap<Operator, ArmSnapshot> = HashMap::new();
        let mut quotas = FrameworkQuotas::default();
        let mut selected = Vec::new();

        for _ in 0..allowed.len() {
            let op = select(&arms, &allowed, Some(&quotas), &cfg, &mut rng).unwrap();
            selected.push(op);
            let arm = arms.entry(op).or_default();
            arm.pulls += 1;
            arm.mean_reward = 0.5;
            quotas.record(op.framework());
        }

        let mut unique = selected.clone();
        unique.sort_by_key(|op| op.as_str());
        unique.dedup();
        assert_eq!(unique.len(), 11, "every operator selected exactly once");
        let total_pulls: u64 = arms.values().map(|a| a.pulls).sum();
        assert_eq!(total_pulls, 11);
        // Warm-start order follows the registry.
        assert_eq!(selected[0], REGISTRY[0]);
        assert_eq!(selected[10], REGISTRY[10]);
    }

    #[test]
    fn test_epsilon_greedy_pure_exploit_tie_break_is_uniform() {
        let allowed = vec![Operator::RaiseTemp, Operator::LowerTemp];
        let cfg = config(Strategy::EpsilonGreedy, 0.0, false);
        let mut arms = HashMap::new();
        for op in &allowed {
            arms.insert(*op, ArmSnapshot { pulls: 3, mean_reward: 0.5 });
        }

        let mut rng = StdRng::seed_from_u64(7);
        let mut first = 0u32;
        let trials = 1000;
        for _ in 0..trials {
            let op = select(&arms, &allowed, None, &cfg, &mut rng).unwrap();
            if op == Operator::RaiseTemp {
                first += 1;
            }
        }
        // Binomial(1000, 0.5): mean 500, sigma ~15.8; allow 3 sigma.
        assert!((452..=548).contains(&first), "got {}", first);
    }

    #[test]
    fn test_epsilon_greedy_exploits_best_mean() {
        let allowed = vec![Operator::RaiseTemp, Operator::LowerTemp, Operator::ToggleWeb];
        let cfg = config(Strategy::EpsilonGreedy, 0.0, false);
        let mut arms = HashMap::new();
        arms.insert(Operator::RaiseTemp, ArmSnapshot { pulls: 5, mean_reward: 0.3 });
        arms.insert(Operator::LowerTemp, ArmSnapshot { pulls: 5, mean_reward: 0.8 });
        arms.insert(Operator::ToggleWeb, ArmSnapshot { pulls: 5, mean_reward: 0.1 });

        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..50 {
            assert_eq!(
                select(&arms, &allowed, None, &cfg, &mut rng),
                Some(Operator::LowerTemp)
            );
        }
    }

    #[test]
    fn test_ucb1_prefers_underexplored_arm() {
        let allowed = vec![Operator::RaiseTemp, Operator::LowerTemp];
        let cfg = config(Strategy::Ucb1, 0.0, false);
        let mut arms = HashMap::new();
        // Same mean, very different pull counts: the bonus should win.
        arms.insert(Operator::RaiseTemp, ArmSnapshot { pulls: 100, mean_reward: 0.5 });
        arms.insert(Operator::LowerTemp, ArmSnapshot { pulls: 2, mean_reward: 0.5 });

        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(
            select(&arms, &allowed, None, &cfg, &mut rng),
            Some(Operator::LowerTemp)
        );
    }

    #[test]
    fn test_stratified_quota_narrows_candidates() {
        let allowed = allowed_operators(&Framework::ALL);
        let cfg = config(Strategy::EpsilonGreedy, 0.0, true);
        let mut arms = HashMap::new();
        for op in &allowed {
            // SEAL arms carry the best means so plain exploitation would
            // never leave SEAL.
            let mean = if op.framework() == Framework::Seal { 0.9 } else { 0.2 };
            arms.insert(*op, ArmSnapshot { pulls: 2, mean_reward: mean });
        }

        // Every pull so far went to SEAL; other frameworks are below quota.
        let mut quotas = FrameworkQuotas::default();
        for _ in 0..6 {
            quotas.record(Framework::Seal);
        }

        let mut rng = StdRng::seed_from_u64(9);
        let op = select(&arms, &allowed, Some(&quotas), &cfg, &mut rng).unwrap();
        assert_ne!(op.framework(), Framework::Seal);
    }

    #[test]
    fn test_empty_allowed_set() {
        let cfg = config(Strategy::Ucb1, 0.0, false);
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(select(&HashMap::new(), &[], None, &cfg, &mut rng), None);
    }

    #[test]
    fn test_selection_is_deterministic_for_pinned_seed() {
        let allowed = allowed_operators(&Framework::ALL);
        let cfg = config(Strategy::EpsilonGreedy, 0.6, false);
        let mut arms = HashMap::new();
        for (i, op) in allowed.iter().enumerate() {
            arms.insert(*op, ArmSnapshot { pulls: 3, mean_reward: 0.1 * i as f64 });
        }

        let run = |seed: u64| -> Vec<Operator> {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..20)
                .map(|_| select(&arms, &allowed, None, &cfg, &mut rng).unwrap())
                .collect()
        };
        assert_eq!(run(42), run(42));
    }
}
