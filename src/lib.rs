//! YIELDRANK: yield-pool ingestion, risk scoring and ranking
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod sources;
pub mod scoring;
pub mod storage;
pub mod engine;
pub mod tasks;
