//! Protocol resolution & persistence orchestrator.
//!
//! Runs a fetched batch in two phases:
//! 1. score every pool and resolve its owning protocol (lookup only);
//! 2. upsert the pools whose protocol resolved.
//!
//! Pools whose protocol is unknown are deferred, never written, and one
//! `pull_protocol` task per distinct missing slug is queued so a later
//! pass can pick them up. A failure on one pool is logged and the batch
//! carries on.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::scoring::score_pool;
use crate::storage::Repository;
use crate::tasks::{Task, TaskQueue};
use crate::types::{NewPool, RawPool, ScoreResult, YieldError};

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Outcome of one ingestion pass.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub fetched: usize,
    /// External ids written this pass, in fetch order.
    pub persisted: Vec<String>,
    /// External ids skipped because their protocol is not stored yet.
    pub deferred: Vec<String>,
    /// (external id or "<missing>", error message)
    pub failed: Vec<(String, String)>,
    /// Distinct unresolved slugs, in first-seen order.
    pub missing_protocols: Vec<String>,
    /// How many `pull_protocol` tasks were queued.
    pub protocol_tasks_submitted: usize,
    pub timestamp: DateTime<Utc>,
}

impl IngestReport {
    fn new(fetched: usize) -> Self {
        Self {
            fetched,
            persisted: Vec::new(),
            deferred: Vec::new(),
            failed: Vec::new(),
            missing_protocols: Vec::new(),
            protocol_tasks_submitted: 0,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

enum Resolution {
    Resolved(i64),
    Missing(String),
}

/// Resolves protocols and persists scored pools.
pub struct IngestOrchestrator {
    repo: Arc<dyn Repository>,
    queue: Arc<dyn TaskQueue>,
}

impl IngestOrchestrator {
    pub fn new(repo: Arc<dyn Repository>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { repo, queue }
    }

    /// Score, resolve and persist a fetched batch.
    pub async fn process_batch(&self, pools: &[RawPool]) -> IngestReport {
        let mut report = IngestReport::new(pools.len());

        // Phase 1 – score + resolve (no writes)
        let mut slug_cache: HashMap<String, Option<i64>> = HashMap::new();
        let mut ready: Vec<(ScoreResult, i64)> = Vec::new();

        for raw in pools {
            let label = pool_label(raw);

            if raw.pool.as_deref().map_or(true, str::is_empty) {
                warn!(project = ?raw.project, "Pool without external id, skipping");
                report.failed.push((label, YieldError::MissingPoolId.to_string()));
                continue;
            }

            let score = score_pool(raw);

            match self.resolve(raw, &mut slug_cache).await {
                Ok(Resolution::Resolved(protocol_id)) => ready.push((score, protocol_id)),
                Ok(Resolution::Missing(slug)) => {
                    debug!(pool_id = %label, slug = %slug, "Protocol unknown, deferring pool");
                    report.deferred.push(label);
                    if !report.missing_protocols.contains(&slug) {
                        report.missing_protocols.push(slug);
                    }
                }
                Err(e) => {
                    warn!(pool_id = %label, error = %e, "Protocol resolution failed, skipping pool");
                    report.failed.push((label, e.to_string()));
                }
            }
        }

        // Phase 2 – persist resolved pools
        for (score, protocol_id) in ready {
            let label = score.pool_id().to_string();
            let result = match NewPool::new(score, protocol_id) {
                Ok(new_pool) => self.repo.upsert_pool(&new_pool).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => report.persisted.push(label),
                Err(e) => {
                    warn!(pool_id = %label, error = %e, "Pool upsert failed, continuing");
                    report.failed.push((label, e.to_string()));
                }
            }
        }

        // Queue protocol fetches for the deferred pools
        for slug in &report.missing_protocols {
            let task = Task::PullProtocol { slug: slug.clone() };
            match self.queue.submit(&task).await {
                Ok(task_id) => {
                    debug!(slug = %slug, task_id = %task_id, "pull_protocol queued");
                    report.protocol_tasks_submitted += 1;
                }
                Err(e) => warn!(slug = %slug, error = %e, "Failed to queue pull_protocol"),
            }
        }

        log_ingest_report(&report);
        report
    }

    /// Lookup-only protocol resolution, memoised per batch.
    async fn resolve(
        &self,
        raw: &RawPool,
        cache: &mut HashMap<String, Option<i64>>,
    ) -> Result<Resolution, YieldError> {
        let slug = raw
            .project
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| YieldError::ProtocolUnresolved("<no project>".to_string()))?;

        let cached = match cache.get(slug) {
            Some(hit) => *hit,
            None => {
                let found = self.repo.find_protocol(slug).await?.map(|p| p.id);
                cache.insert(slug.to_string(), found);
                found
            }
        };

        Ok(match cached {
            Some(id) => Resolution::Resolved(id),
            None => Resolution::Missing(slug.to_string()),
        })
    }
}

fn pool_label(raw: &RawPool) -> String {
    match raw.pool.as_deref() {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => "<missing>".to_string(),
    }
}

/// Log a one-line ingestion summary.
pub fn log_ingest_report(report: &IngestReport) {
    info!(
        fetched = report.fetched,
        persisted = report.persisted.len(),
        deferred = report.deferred.len(),
        failed = report.failed.len(),
        missing_protocols = report.missing_protocols.len(),
        protocol_tasks = report.protocol_tasks_submitted,
        "Ingestion pass complete"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::{self, SqliteRepository};
    use crate::tasks::queue::{QueueSettings, SqliteTaskQueue};
    use crate::types::{NewProtocol, RawProtocol};

    async fn setup() -> (Arc<SqliteRepository>, Arc<SqliteTaskQueue>, IngestOrchestrator) {
        let db = sqlite::connect("sqlite::memory:").await.unwrap();
        let repo = Arc::new(SqliteRepository::new(db.clone()));
        let queue = Arc::new(SqliteTaskQueue::new(db, QueueSettings::default()));
        let orch = IngestOrchestrator::new(repo.clone(), queue.clone());
        (repo, queue, orch)
    }

    fn pool(id: &str, project: Option<&str>) -> RawPool {
        RawPool {
            pool: Some(id.to_string()),
            project: project.map(String::from),
            tvl_usd: Some(1e8),
            apy: Some(4.0),
            ..Default::default()
        }
    }

    async fn add_protocol(repo: &SqliteRepository, slug: &str) -> i64 {
        repo.insert_protocol(&NewProtocol::from_raw(slug, RawProtocol::default()))
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_resolved_pools_are_persisted() {
        let (repo, _queue, orch) = setup().await;
        add_protocol(&repo, "lido").await;

        let report = orch
            .process_batch(&[pool("p1", Some("lido")), pool("p2", Some("lido"))])
            .await;

        assert_eq!(report.persisted, vec!["p1", "p2"]);
        assert!(report.deferred.is_empty());
        assert_eq!(repo.count_pools().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unknown_protocol_defers_and_queues_once() {
        let (repo, queue, orch) = setup().await;
        add_protocol(&repo, "lido").await;

        let report = orch
            .process_batch(&[
                pool("p1", Some("lido")),
                pool("p2", Some("curve-dex")),
                pool("p3", Some("curve-dex")),
                pool("p4", Some("uniswap-v3")),
            ])
            .await;

        assert_eq!(report.persisted, vec!["p1"]);
        assert_eq!(report.deferred, vec!["p2", "p3", "p4"]);
        assert_eq!(report.missing_protocols, vec!["curve-dex", "uniswap-v3"]);
        assert_eq!(report.protocol_tasks_submitted, 2);
        assert!(repo.get_pool("p2").await.unwrap().is_none());
        assert_eq!(queue.stats().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_bad_records_do_not_abort_batch() {
        let (repo, _queue, orch) = setup().await;
        add_protocol(&repo, "lido").await;

        let mut no_id = pool("", Some("lido"));
        no_id.pool = None;
        let report = orch
            .process_batch(&[no_id, pool("p2", None), pool("p3", Some("lido"))])
            .await;

        assert_eq!(report.persisted, vec!["p3"]);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[0].0, "<missing>");
        assert_eq!(report.failed[1].0, "p2");
    }

    #[tokio::test]
    async fn test_resolution_by_protocol_name() {
        let (repo, _queue, orch) = setup().await;
        repo.insert_protocol(&NewProtocol::from_raw(
            "aave-v3",
            RawProtocol {
                name: Some("Aave V3".into()),
                ..Default::default()
            },
        ))
        .await
        .unwrap();

        let report = orch.process_batch(&[pool("p1", Some("AAVE V3"))]).await;
        assert_eq!(report.persisted, vec!["p1"]);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let (_repo, _queue, orch) = setup().await;
        let report = orch.process_batch(&[]).await;
        assert_eq!(report.fetched, 0);
        assert!(report.persisted.is_empty());
        assert_eq!(report.protocol_tasks_submitted, 0);
    }
}
