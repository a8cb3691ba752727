//! Yield-data source integrations.
//!
//! Defines the `YieldSource` trait the ingestion pipeline consumes and
//! provides the DefiLlama implementation. The trait is the injection seam:
//! tests swap in a mock, the binary wires the HTTP client.

pub mod defillama;

use async_trait::async_trait;

use crate::types::{ApyPoint, ApySnapshot, RawPool, RawProtocol, YieldError};

/// Abstraction over a yield-data provider.
///
/// Implementations perform a single bounded network call per method and
/// never apply scoring logic.
#[async_trait]
pub trait YieldSource: Send + Sync {
    /// Fetch the current pool list, truncated to `limit` entries when given.
    async fn fetch_pools(&self, limit: Option<usize>) -> Result<Vec<RawPool>, YieldError>;

    /// Fetch details for one protocol by slug.
    async fn fetch_protocol(&self, slug: &str) -> Result<RawProtocol, YieldError>;

    /// Fetch the historical APY series for one pool, oldest first.
    async fn fetch_apy_history(&self, pool_id: &str) -> Result<Vec<ApyPoint>, YieldError>;

    /// Source name for logging.
    fn name(&self) -> &str;
}

/// Pick the most recent reading with a non-zero APY.
///
/// Falls back to the newest reading when every APY is zero or missing.
/// When an older reading is chosen, the snapshot is marked not-latest and
/// carries the newest reading's APY alongside.
pub fn select_latest_apy(points: &[ApyPoint]) -> Option<ApySnapshot> {
    let newest = points.last()?;

    let found = points
        .iter()
        .rev()
        .enumerate()
        .find(|(_, p)| p.apy.is_some_and(|apy| apy != 0.0));

    match found {
        Some((0, point)) => Some(ApySnapshot {
            point: point.clone(),
            latest: true,
            current_apy: None,
        }),
        Some((_, point)) => Some(ApySnapshot {
            point: point.clone(),
            latest: false,
            current_apy: Some(newest.apy.unwrap_or(0.0)),
        }),
        None => Some(ApySnapshot {
            point: newest.clone(),
            latest: true,
            current_apy: None,
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn point(ts: &str, apy: Option<f64>) -> ApyPoint {
        ApyPoint {
            timestamp: Some(ts.to_string()),
            apy,
            ..Default::default()
        }
    }

    #[test]
    fn test_latest_nonzero_is_newest() {
        let pts = vec![point("t1", Some(3.0)), point("t2", Some(4.0))];
        let snap = select_latest_apy(&pts).unwrap();
        assert_eq!(snap.point.timestamp.as_deref(), Some("t2"));
        assert!(snap.latest);
        assert_eq!(snap.current_apy, None);
    }

    #[test]
    fn test_walks_back_past_zero_apy() {
        let pts = vec![
            point("t1", Some(3.0)),
            point("t2", Some(5.0)),
            point("t3", Some(0.0)),
            point("t4", None),
        ];
        let snap = select_latest_apy(&pts).unwrap();
        assert_eq!(snap.point.timestamp.as_deref(), Some("t2"));
        assert!(!snap.latest);
        assert_eq!(snap.current_apy, Some(0.0));
    }

    #[test]
    fn test_all_zero_falls_back_to_newest() {
        let pts = vec![point("t1", Some(0.0)), point("t2", None)];
        let snap = select_latest_apy(&pts).unwrap();
        assert_eq!(snap.point.timestamp.as_deref(), Some("t2"));
        assert!(snap.latest);
    }

    #[test]
    fn test_empty_series() {
        assert!(select_latest_apy(&[]).is_none());
    }
}
