//! Weighted route selection
//!
//! Pure scoring over candidate quotes: deterministic for identical inputs,
//! no I/O. Weights come from configuration, never from assumptions baked
//! into the logic.

use crate::config::ScoringWeights;
use crate::error::{EscrowError, EscrowResult};
use crate::routing::RouteQuote;

use rust_decimal::prelude::ToPrimitive;

/// Outcome of route selection
#[derive(Debug, Clone)]
pub struct Selection {
    pub quote: RouteQuote,
    pub score: f64,
    /// True when every candidate was estimate-only; the deal can proceed for
    /// display purposes but needs an operator to commit a real route
    pub awaiting_manual_route: bool,
}

/// Pick the best route by weighted score, tie-broken by lowest fee then
/// fewest steps. Fails with `NoExecutableRoute` on an empty candidate list.
pub fn select_route(
    candidates: &[RouteQuote],
    weights: &ScoringWeights,
) -> EscrowResult<Selection> {
    if candidates.is_empty() {
        return Err(EscrowError::NoExecutableRoute);
    }

    let fees: Vec<f64> = candidates
        .iter()
        .map(|q| q.route().estimated_fee.to_f64().unwrap_or(f64::MAX))
        .collect();
    let durations: Vec<f64> = candidates
        .iter()
        .map(|q| q.route().estimated_duration_secs as f64)
        .collect();
    let step_counts: Vec<f64> = candidates
        .iter()
        .map(|q| q.route().steps.len() as f64)
        .collect();

    let mut best_idx = 0usize;
    let mut best_score = f64::NEG_INFINITY;

    for (idx, quote) in candidates.iter().enumerate() {
        let route = quote.route();
        let score = weights.fee * (1.0 - normalize(fees[idx], &fees))
            + weights.duration * (1.0 - normalize(durations[idx], &durations))
            + weights.confidence * route.confidence_score.clamp(0.0, 1.0)
            + weights.steps * (1.0 - normalize(step_counts[idx], &step_counts));

        if better(score, idx, best_score, best_idx, &fees, &step_counts) {
            best_idx = idx;
            best_score = score;
        }
    }

    let awaiting_manual_route = candidates.iter().all(|q| !q.is_executable());

    Ok(Selection {
        quote: candidates[best_idx].clone(),
        score: best_score,
        awaiting_manual_route,
    })
}

/// Min-max normalization over the candidate list; a degenerate range maps
/// everything to 0 so the term contributes its full weight uniformly
fn normalize(value: f64, all: &[f64]) -> f64 {
    let min = all.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = all.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max <= min {
        return 0.0;
    }
    (value - min) / (max - min)
}

/// Strict ordering: score desc, then fee asc, then step count asc. First
/// candidate wins remaining ties, keeping selection stable across calls.
fn better(
    score: f64,
    idx: usize,
    best_score: f64,
    best_idx: usize,
    fees: &[f64],
    steps: &[f64],
) -> bool {
    if score > best_score {
        return true;
    }
    if score < best_score {
        return false;
    }
    if fees[idx] < fees[best_idx] {
        return true;
    }
    if fees[idx] > fees[best_idx] {
        return false;
    }
    steps[idx] < steps[best_idx]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{Route, RouteStep, StepKind};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn route(fee: i64, duration: u64, confidence: f64, steps: usize) -> Route {
        Route {
            id: Uuid::new_v4(),
            source_network: "ethereum".to_string(),
            destination_network: "polygon".to_string(),
            source_asset: "USDC".to_string(),
            destination_asset: "USDC".to_string(),
            steps: (0..steps)
                .map(|_| RouteStep {
                    kind: StepKind::Bridge,
                    provider: "hopper".to_string(),
                    source_asset: "USDC".to_string(),
                    destination_asset: "USDC".to_string(),
                })
                .collect(),
            estimated_fee: Decimal::new(fee, 2),
            estimated_duration_secs: duration,
            confidence_score: confidence,
            provider: "agg".to_string(),
        }
    }

    #[test]
    fn test_empty_candidates_fail() {
        assert!(matches!(
            select_route(&[], &ScoringWeights::default()),
            Err(EscrowError::NoExecutableRoute)
        ));
    }

    #[test]
    fn test_prefers_cheap_fast_confident() {
        let good = route(100, 300, 0.95, 1);
        let bad = route(900, 3600, 0.4, 4);
        let candidates = vec![
            RouteQuote::Live(bad),
            RouteQuote::Live(good.clone()),
        ];

        let selection = select_route(&candidates, &ScoringWeights::default()).unwrap();
        assert_eq!(selection.quote.route().id, good.id);
        assert!(!selection.awaiting_manual_route);
    }

    #[test]
    fn test_tie_broken_by_fee_then_steps() {
        // Identical scores: all normalized terms degenerate except fee/steps
        let cheap = route(100, 600, 0.9, 2);
        let pricey = route(200, 600, 0.9, 2);
        let candidates = vec![
            RouteQuote::Live(pricey),
            RouteQuote::Live(cheap.clone()),
        ];
        let weights = ScoringWeights {
            fee: 0.0,
            duration: 0.25,
            confidence: 0.3,
            steps: 0.0,
        };

        let selection = select_route(&candidates, &weights).unwrap();
        assert_eq!(selection.quote.route().id, cheap.id);

        let fewer = route(100, 600, 0.9, 1);
        let more = route(100, 600, 0.9, 3);
        let candidates = vec![
            RouteQuote::Live(more),
            RouteQuote::Live(fewer.clone()),
        ];
        let weights = ScoringWeights {
            fee: 0.0,
            duration: 0.25,
            confidence: 0.3,
            steps: 0.0,
        };
        let selection = select_route(&candidates, &weights).unwrap();
        assert_eq!(selection.quote.route().id, fewer.id);
    }

    #[test]
    fn test_all_placeholders_flag_manual_route() {
        let mut estimate = route(500, 1800, 0.0, 1);
        estimate.provider = "static-estimate".to_string();
        let candidates = vec![RouteQuote::EstimateOnly(estimate.clone())];

        let selection = select_route(&candidates, &ScoringWeights::default()).unwrap();
        assert!(selection.awaiting_manual_route);
        assert_eq!(selection.quote.route().id, estimate.id);
        assert!(!selection.quote.is_executable());
    }

    #[test]
    fn test_deterministic_for_identical_inputs() {
        let candidates = vec![
            RouteQuote::Live(route(100, 300, 0.9, 1)),
            RouteQuote::Live(route(150, 200, 0.85, 2)),
            RouteQuote::Live(route(80, 900, 0.7, 3)),
        ];
        let weights = ScoringWeights::default();

        let first = select_route(&candidates, &weights).unwrap();
        for _ in 0..10 {
            let again = select_route(&candidates, &weights).unwrap();
            assert_eq!(again.quote.route().id, first.quote.route().id);
            assert_eq!(again.score, first.score);
        }
    }
}
