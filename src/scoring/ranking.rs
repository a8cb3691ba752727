//! Ranking service.
//!
//! Scores a batch independently and orders it by `final_score` descending,
//! then `tvl_score` descending, then external pool id ascending, so equal
//! inputs always produce the same list.

use std::cmp::Ordering;

use tracing::debug;

use super::score_pool;
use crate::types::{Pool, RawPool, ScoreResult};

/// Score every pool and return the best `top_n`.
pub fn rank(pools: &[RawPool], top_n: usize) -> Vec<ScoreResult> {
    let mut scored: Vec<ScoreResult> = pools.iter().map(score_pool).collect();
    scored.sort_by(compare);
    scored.truncate(top_n);

    debug!(
        candidates = pools.len(),
        returned = scored.len(),
        "Pools ranked"
    );

    scored
}

/// Rank persisted pools, re-scoring from their stored source snapshot.
pub fn rank_persisted(pools: &[Pool], top_n: usize) -> Vec<ScoreResult> {
    let raw: Vec<RawPool> = pools.iter().map(|p| p.raw.clone()).collect();
    rank(&raw, top_n)
}

/// Total order used for ranking (best first).
pub fn compare(a: &ScoreResult, b: &ScoreResult) -> Ordering {
    b.final_score
        .total_cmp(&a.final_score)
        .then_with(|| b.tvl_score.total_cmp(&a.tvl_score))
        .then_with(|| a.pool_id().cmp(b.pool_id()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pool(id: &str, tvl: f64, apy: f64) -> RawPool {
        RawPool {
            pool: Some(id.to_string()),
            project: Some("proj".to_string()),
            tvl_usd: Some(tvl),
            apy: Some(apy),
            stablecoin: Some(true),
            ..Default::default()
        }
    }

    #[test]
    fn test_rank_sorted_descending() {
        let pools = vec![
            make_pool("a", 1e6, 2.0),
            make_pool("b", 5e9, 8.0),
            make_pool("c", 1e8, 30.0),
            make_pool("d", 10.0, 0.0),
        ];
        let ranked = rank(&pools, 10);
        assert_eq!(ranked.len(), 4);
        for pair in ranked.windows(2) {
            assert!(pair[0].final_score >= pair[1].final_score);
        }
        assert_eq!(ranked[0].pool_id(), "c");
        assert_eq!(ranked[3].pool_id(), "d");
    }

    #[test]
    fn test_rank_truncates_to_top_n() {
        let pools: Vec<RawPool> = (0..10)
            .map(|i| make_pool(&format!("p{i}"), 1e7 * (i + 1) as f64, i as f64))
            .collect();
        assert_eq!(rank(&pools, 3).len(), 3);
        assert!(rank(&pools, 0).is_empty());
        assert_eq!(rank(&pools, 50).len(), 10);
    }

    #[test]
    fn test_ties_break_by_pool_id() {
        let pools = vec![
            make_pool("zeta", 1e9, 5.0),
            make_pool("alpha", 1e9, 5.0),
            make_pool("mid", 1e9, 5.0),
        ];
        let ranked = rank(&pools, 3);
        let ids: Vec<&str> = ranked.iter().map(|s| s.pool_id()).collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_equal_final_score_prefers_higher_tvl_score() {
        let mut hi = ScoreResult {
            apy: 0.0,
            tvl_score: 90.0,
            risk_score: 0.0,
            final_score: 10.0,
            breakdown: Default::default(),
            factors: Default::default(),
            pool: make_pool("z", 0.0, 0.0),
        };
        let mut lo = hi.clone();
        lo.tvl_score = 40.0;
        lo.pool = make_pool("a", 0.0, 0.0);
        assert_eq!(compare(&hi, &lo), Ordering::Less);

        hi.final_score = 9.99;
        assert_eq!(compare(&hi, &lo), Ordering::Greater);
    }

    #[test]
    fn test_rank_is_stable_across_calls() {
        let pools = vec![
            make_pool("x", 3e7, 12.0),
            make_pool("y", 3e7, 12.0),
            make_pool("w", 2e9, 4.0),
        ];
        assert_eq!(rank(&pools, 3), rank(&pools, 3));
    }

    #[test]
    fn test_rank_empty() {
        assert!(rank(&[], 5).is_empty());
    }
}
