//! Task dispatch.
//!
//! Every handler is idempotent so a redelivered task is harmless.

use std::sync::Arc;
use tracing::{debug, info};

use super::Task;
use crate::engine::ingest::{IngestOrchestrator, IngestReport};
use crate::engine::recommender::Recommender;
use crate::sources::YieldSource;
use crate::storage::Repository;
use crate::types::{NewProtocol, Protocol, Recommendation, YieldError};

/// Result of one successfully handled task.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    ProtocolStored(Protocol),
    /// The slug was stored already, by an earlier task or a concurrent one.
    ProtocolAlreadyKnown(String),
    Ingested(IngestReport),
    Recommended(Recommendation),
}

pub struct TaskHandler {
    source: Arc<dyn YieldSource>,
    repo: Arc<dyn Repository>,
    orchestrator: IngestOrchestrator,
    recommender: Recommender,
}

impl TaskHandler {
    pub fn new(
        source: Arc<dyn YieldSource>,
        repo: Arc<dyn Repository>,
        orchestrator: IngestOrchestrator,
        recommender: Recommender,
    ) -> Self {
        Self {
            source,
            repo,
            orchestrator,
            recommender,
        }
    }

    pub async fn handle(&self, task: &Task) -> Result<TaskOutcome, YieldError> {
        match task {
            Task::PullProtocol { slug } => self.pull_protocol(slug).await,
            Task::PullPools { limit } => self.pull_pools(*limit).await,
            Task::BuildRecommendation { pool_id, user_id } => self
                .recommender
                .build_recommendation(pool_id, user_id)
                .await
                .map(TaskOutcome::Recommended),
        }
    }

    /// Fetch and store a protocol unless it is already known.
    pub async fn pull_protocol(&self, slug: &str) -> Result<TaskOutcome, YieldError> {
        if self.repo.find_protocol(slug).await?.is_some() {
            debug!(slug = %slug, "Protocol already stored, nothing to do");
            return Ok(TaskOutcome::ProtocolAlreadyKnown(slug.to_string()));
        }

        let raw = self.source.fetch_protocol(slug).await?;
        match self.repo.insert_protocol(&NewProtocol::from_raw(slug, raw)).await {
            Ok(protocol) => {
                info!(slug = %slug, id = protocol.id, "Protocol stored");
                Ok(TaskOutcome::ProtocolStored(protocol))
            }
            Err(YieldError::PersistenceConflict(_)) => {
                debug!(slug = %slug, "Protocol inserted concurrently");
                Ok(TaskOutcome::ProtocolAlreadyKnown(slug.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch up to `limit` pools and run them through the orchestrator.
    pub async fn pull_pools(&self, limit: usize) -> Result<TaskOutcome, YieldError> {
        let pools = self.source.fetch_pools(Some(limit)).await?;
        info!(source = %self.source.name(), count = pools.len(), "Pools fetched");
        Ok(TaskOutcome::Ingested(self.orchestrator.process_batch(&pools).await))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::recommender::{StaticProfiles, TemplateExplainer};
    use crate::storage::sqlite::{self, SqliteRepository};
    use crate::tasks::queue::{QueueSettings, SqliteTaskQueue};
    use crate::types::{ApyPoint, RawPool, RawProtocol};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Source whose protocol fetch loses a race: another writer stores the
    /// same slug while the request is in flight.
    struct RacingSource {
        repo: Arc<SqliteRepository>,
        protocol_calls: AtomicUsize,
    }

    #[async_trait]
    impl YieldSource for RacingSource {
        async fn fetch_pools(&self, _limit: Option<usize>) -> Result<Vec<RawPool>, YieldError> {
            Ok(Vec::new())
        }

        async fn fetch_protocol(&self, slug: &str) -> Result<RawProtocol, YieldError> {
            self.protocol_calls.fetch_add(1, Ordering::SeqCst);
            let raw = RawProtocol {
                name: Some("Lido".into()),
                ..Default::default()
            };
            self.repo
                .insert_protocol(&NewProtocol::from_raw(slug, raw.clone()))
                .await?;
            Ok(raw)
        }

        async fn fetch_apy_history(&self, _pool_id: &str) -> Result<Vec<ApyPoint>, YieldError> {
            Ok(Vec::new())
        }

        fn name(&self) -> &str {
            "racing"
        }
    }

    async fn setup() -> (Arc<SqliteRepository>, Arc<RacingSource>, TaskHandler) {
        let db = sqlite::connect("sqlite::memory:").await.unwrap();
        let repo = Arc::new(SqliteRepository::new(db.clone()));
        let queue = Arc::new(SqliteTaskQueue::new(db, QueueSettings::default()));
        let source = Arc::new(RacingSource {
            repo: repo.clone(),
            protocol_calls: AtomicUsize::new(0),
        });

        let recommender = Recommender::new(
            repo.clone(),
            source.clone(),
            Arc::new(StaticProfiles::default()),
            Arc::new(TemplateExplainer),
        );
        let orchestrator = IngestOrchestrator::new(repo.clone(), queue);
        let handler = TaskHandler::new(source.clone(), repo.clone(), orchestrator, recommender);
        (repo, source, handler)
    }

    #[tokio::test]
    async fn test_concurrent_protocol_insert_is_a_no_op() {
        let (repo, source, handler) = setup().await;

        let outcome = handler.pull_protocol("lido").await.unwrap();
        assert!(
            matches!(&outcome, TaskOutcome::ProtocolAlreadyKnown(slug) if slug == "lido"),
            "{outcome:?}"
        );
        assert_eq!(source.protocol_calls.load(Ordering::SeqCst), 1);
        assert_eq!(repo.list_protocols().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_known_protocol_skips_fetch() {
        let (repo, source, handler) = setup().await;
        repo.insert_protocol(&NewProtocol::from_raw("lido", RawProtocol::default()))
            .await
            .unwrap();

        let outcome = handler
            .handle(&Task::PullProtocol { slug: "lido".into() })
            .await
            .unwrap();
        assert!(matches!(outcome, TaskOutcome::ProtocolAlreadyKnown(_)));
        assert_eq!(source.protocol_calls.load(Ordering::SeqCst), 0);
        assert_eq!(repo.list_protocols().await.unwrap().len(), 1);
    }
}
