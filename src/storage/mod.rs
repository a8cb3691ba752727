//! Persistence layer.
//!
//! The `Repository` trait is the only shared mutable resource in the
//! pipeline. The SQLite implementation gives it transactional upsert
//! semantics: pools are last-write-wins on their external id, protocols
//! are insert-once on slug.

pub mod sqlite;

use async_trait::async_trait;

use crate::types::{
    NewPool, NewProtocol, NewRecommendation, Pool, PoolFilter, Protocol, Recommendation,
    YieldError,
};

/// Protocol / pool / recommendation store.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Look up a protocol by slug, or by name (case-insensitive).
    async fn find_protocol(&self, slug_or_name: &str) -> Result<Option<Protocol>, YieldError>;

    async fn get_protocol(&self, id: i64) -> Result<Option<Protocol>, YieldError>;

    async fn list_protocols(&self) -> Result<Vec<Protocol>, YieldError>;

    /// Insert a protocol. A duplicate slug fails with `PersistenceConflict`.
    async fn insert_protocol(&self, protocol: &NewProtocol) -> Result<Protocol, YieldError>;

    /// Insert or update a pool keyed by its external id. Returns the local row id.
    async fn upsert_pool(&self, pool: &NewPool) -> Result<i64, YieldError>;

    async fn get_pool(&self, pool_id: &str) -> Result<Option<Pool>, YieldError>;

    async fn list_pools(&self, filter: &PoolFilter) -> Result<Vec<Pool>, YieldError>;

    async fn count_pools(&self) -> Result<u64, YieldError>;

    /// Append a recommendation. Existing rows are never modified.
    async fn insert_recommendation(
        &self,
        rec: &NewRecommendation,
    ) -> Result<Recommendation, YieldError>;

    async fn recommendations_for_user(&self, user_id: &str)
        -> Result<Vec<Recommendation>, YieldError>;
}
