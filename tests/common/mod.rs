//! Shared fixtures for integration tests.
//!
//! `MockSource` stands in for the upstream API so no test touches the
//! network. Everything else is real: in-memory SQLite, the durable
//! queue, the orchestrator and the worker.

#![allow(dead_code)]

use async_trait::async_trait;
use mockall::mock;
use std::sync::Arc;
use std::time::Duration;

use yieldrank::engine::ingest::IngestOrchestrator;
use yieldrank::engine::recommender::{Recommender, StaticProfiles, TemplateExplainer};
use yieldrank::sources::YieldSource;
use yieldrank::storage::sqlite::{self, SqliteRepository};
use yieldrank::tasks::handler::TaskHandler;
use yieldrank::tasks::queue::{QueueSettings, SqliteTaskQueue};
use yieldrank::tasks::worker::Worker;
use yieldrank::types::{ApyPoint, RawPool, RawProtocol, YieldError};

mock! {
    pub Source {}

    #[async_trait]
    impl YieldSource for Source {
        async fn fetch_pools(&self, limit: Option<usize>) -> Result<Vec<RawPool>, YieldError>;
        async fn fetch_protocol(&self, slug: &str) -> Result<RawProtocol, YieldError>;
        async fn fetch_apy_history(&self, pool_id: &str) -> Result<Vec<ApyPoint>, YieldError>;
        fn name(&self) -> &str;
    }
}

/// A source mock with `name()` already stubbed.
pub fn mock_source() -> MockSource {
    let mut source = MockSource::new();
    source.expect_name().return_const("mock".to_string());
    source
}

pub fn raw_pool(id: &str, project: &str, tvl: f64, apy: f64) -> RawPool {
    RawPool {
        pool: Some(id.to_string()),
        project: Some(project.to_string()),
        chain: Some("Ethereum".into()),
        symbol: Some("USDC-WETH".into()),
        tvl_usd: Some(tvl),
        apy: Some(apy),
        stablecoin: Some(false),
        il_risk: Some("yes".into()),
        exposure: Some("multi".into()),
        sigma: Some(0.2),
        ..Default::default()
    }
}

pub fn raw_protocol(name: &str) -> RawProtocol {
    RawProtocol {
        name: Some(name.to_string()),
        audits: Some(serde_json::json!("2")),
        chains: Some(vec!["Ethereum".into()]),
        ..Default::default()
    }
}

pub fn unavailable(endpoint: &str) -> YieldError {
    YieldError::UpstreamUnavailable {
        endpoint: endpoint.to_string(),
        message: "connection refused".into(),
    }
}

/// Retries become due immediately so tests can drain the queue.
pub fn immediate_retry(max_attempts: u32) -> QueueSettings {
    QueueSettings {
        max_attempts,
        backoff_base: Duration::ZERO,
        backoff_max: Duration::ZERO,
    }
}

pub struct Harness {
    pub repo: Arc<SqliteRepository>,
    pub queue: Arc<SqliteTaskQueue>,
    pub worker: Worker,
}

pub async fn harness(source: MockSource, settings: QueueSettings) -> Harness {
    let db = sqlite::connect("sqlite::memory:").await.unwrap();
    let repo = Arc::new(SqliteRepository::new(db.clone()));
    let queue = Arc::new(SqliteTaskQueue::new(db, settings));
    let source: Arc<dyn YieldSource> = Arc::new(source);

    let recommender = Recommender::new(
        repo.clone(),
        source.clone(),
        Arc::new(StaticProfiles::default()),
        Arc::new(TemplateExplainer),
    );
    let orchestrator = IngestOrchestrator::new(repo.clone(), queue.clone());
    let handler = Arc::new(TaskHandler::new(source, repo.clone(), orchestrator, recommender));
    let worker = Worker::new(0, queue.clone(), handler, Duration::from_millis(10));

    Harness { repo, queue, worker }
}

/// Run tasks until nothing is due. Returns how many ran.
pub async fn drain(worker: &Worker) -> usize {
    let mut ran = 0;
    while worker.run_once().await.unwrap() {
        ran += 1;
        assert!(ran < 100, "queue did not drain");
    }
    ran
}
