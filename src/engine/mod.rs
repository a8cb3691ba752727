//! Ingestion and recommendation engines.
//!
//! `ingest` turns fetched pools into persisted, scored rows;
//! `recommender` turns persisted pools into per-user recommendations.

pub mod ingest;
pub mod recommender;
