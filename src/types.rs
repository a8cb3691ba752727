//! Shared types for the YIELDRANK service.
//!
//! Wire shapes from the yield-data source (`RawPool`, `RawProtocol`),
//! derived scoring output (`ScoreResult`), persisted entities
//! (`Protocol`, `Pool`, `Recommendation`) and the domain error enum.
//! Every other module depends on these, never the other way round.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

// ---------------------------------------------------------------------------
// Raw pool (yield-data source → Rust)
// ---------------------------------------------------------------------------

/// A liquidity pool as returned by the yield-data source.
///
/// Every field is optional: the source routinely omits or nulls fields,
/// and the scoring engine substitutes documented defaults instead of failing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPool {
    #[serde(default)]
    pub chain: Option<String>,
    /// Owning protocol slug, e.g. "aave-v3".
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    /// Opaque external pool identifier (UUID). Idempotency key for ingestion.
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default)]
    pub pool_meta: Option<String>,

    #[serde(default)]
    pub tvl_usd: Option<f64>,
    #[serde(default)]
    pub apy_base: Option<f64>,
    #[serde(default)]
    pub apy_reward: Option<f64>,
    #[serde(default)]
    pub apy: Option<f64>,
    #[serde(default, rename = "apyPct1D")]
    pub apy_pct_1d: Option<f64>,
    #[serde(default, rename = "apyPct7D")]
    pub apy_pct_7d: Option<f64>,
    #[serde(default, rename = "apyPct30D")]
    pub apy_pct_30d: Option<f64>,
    #[serde(default, rename = "apyMean30d")]
    pub apy_mean_30d: Option<f64>,
    #[serde(default)]
    pub apy_base_inception: Option<f64>,

    #[serde(default)]
    pub stablecoin: Option<bool>,
    /// "yes" | "no" (case varies in the wild).
    #[serde(default)]
    pub il_risk: Option<String>,
    /// "single" | "multi".
    #[serde(default)]
    pub exposure: Option<String>,

    #[serde(default)]
    pub mu: Option<f64>,
    /// APY volatility.
    #[serde(default)]
    pub sigma: Option<f64>,
    #[serde(default)]
    pub count: Option<i64>,
    #[serde(default)]
    pub outlier: Option<bool>,
    #[serde(default)]
    pub predictions: Option<Predictions>,

    #[serde(default)]
    pub reward_tokens: Option<Vec<String>>,
    #[serde(default)]
    pub underlying_tokens: Option<Vec<String>>,

    #[serde(default, rename = "volumeUsd1d")]
    pub volume_usd_1d: Option<f64>,
    #[serde(default, rename = "volumeUsd7d")]
    pub volume_usd_7d: Option<f64>,
}

impl RawPool {
    /// External pool id, or "" when the source omitted it.
    pub fn pool_id(&self) -> &str {
        self.pool.as_deref().unwrap_or("")
    }

    /// Display name used for persisted rows: "{project} - {symbol}".
    pub fn display_name(&self) -> String {
        format!(
            "{} - {}",
            self.project.as_deref().unwrap_or("unknown"),
            self.symbol.as_deref().unwrap_or("?"),
        )
    }
}

/// Source-side APY trend prediction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Predictions {
    #[serde(default)]
    pub predicted_class: Option<String>,
    /// Confidence of the predicted class, 0–100.
    #[serde(default)]
    pub predicted_probability: Option<f64>,
    #[serde(default)]
    pub binned_confidence: Option<i64>,
}

// ---------------------------------------------------------------------------
// Raw protocol / APY chart
// ---------------------------------------------------------------------------

/// Protocol details as returned by `protocol/{slug}`.
///
/// `id`, `audits` and `listedAt` arrive as strings or numbers depending
/// on the protocol, so they are kept as raw JSON values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawProtocol {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub chain: Option<String>,
    #[serde(default)]
    pub logo: Option<String>,
    #[serde(default)]
    pub audits: Option<serde_json::Value>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub twitter: Option<String>,
    #[serde(default)]
    pub parent_protocol: Option<String>,
    #[serde(default)]
    pub chains: Option<Vec<String>>,
    #[serde(default)]
    pub chain_tvls: Option<serde_json::Value>,
    #[serde(default)]
    pub listed_at: Option<serde_json::Value>,
}

/// One point of a pool's historical APY series (`chart/{pool}`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApyPoint {
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub tvl_usd: Option<f64>,
    #[serde(default)]
    pub apy: Option<f64>,
    #[serde(default)]
    pub apy_base: Option<f64>,
    #[serde(default)]
    pub apy_reward: Option<f64>,
}

/// Most recent meaningful APY reading for a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApySnapshot {
    pub point: ApyPoint,
    /// False when the newest reading had zero APY and an older one was used.
    pub latest: bool,
    /// APY of the newest reading, set only when `latest` is false.
    pub current_apy: Option<f64>,
}

// ---------------------------------------------------------------------------
// Score result
// ---------------------------------------------------------------------------

/// Normalised risk inputs, each in [0, 1] except the fixed penalties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskFactors {
    pub tvl_norm: f64,
    pub apy_norm: f64,
    pub volatility_norm: f64,
    pub il_penalty: f64,
    pub stablecoin_penalty: f64,
    pub prediction_penalty: f64,
    pub exposure_penalty: f64,
}

/// Human-readable explanation of a score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Breakdown {
    pub tvl: String,
    pub impermanent_loss: String,
    pub stablecoin: String,
    pub volatility_sigma: String,
    pub prediction_confidence: String,
    pub exposure: String,
    /// Threshold-triggered warnings, in fixed order.
    pub reasons: Vec<String>,
    /// `reasons` joined with spaces.
    pub explanation: String,
}

/// Output of the scoring engine for one pool.
///
/// Serialises to the display contract
/// `{apy, tvl_score, risk_score: "12.34%", final_score, breakdown, pool}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreResult {
    /// Resolved APY, rounded to 4 dp.
    pub apy: f64,
    /// Log-scaled TVL score, 0–100.
    pub tvl_score: f64,
    /// Composite risk as a percentage, 0–100.
    #[serde(serialize_with = "serialize_percent")]
    pub risk_score: f64,
    /// Relative ranking key. Unbounded and may be negative.
    pub final_score: f64,
    pub breakdown: Breakdown,
    #[serde(skip)]
    pub factors: RiskFactors,
    pub pool: RawPool,
}

impl ScoreResult {
    pub fn pool_id(&self) -> &str {
        self.pool.pool_id()
    }

    /// `risk_score` in its display form, e.g. "30.24%".
    pub fn risk_score_display(&self) -> String {
        format!("{}%", self.risk_score)
    }
}

fn serialize_percent<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{value}%"))
}

// ---------------------------------------------------------------------------
// Persisted entities
// ---------------------------------------------------------------------------

/// A protocol as stored locally. Created lazily on first sight.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Protocol {
    pub id: i64,
    /// External protocol id from the source.
    pub protocol_id: Option<String>,
    /// Resolution key: the slug pools reference in `project`.
    pub slug: String,
    pub name: String,
    pub address: Option<String>,
    pub symbol: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub chain: Option<String>,
    pub logo: Option<String>,
    pub audits: Option<String>,
    pub category: Option<String>,
    pub twitter: Option<String>,
    pub parent_protocol: Option<String>,
    pub chains: Vec<String>,
    pub chain_tvls: Option<serde_json::Value>,
    pub listed_at: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Protocol {
    /// Number of audits reported by the source, 0 when unknown.
    pub fn audit_count(&self) -> u32 {
        self.audits
            .as_deref()
            .and_then(|a| a.trim().parse::<u32>().ok())
            .unwrap_or(0)
    }
}

/// Insert payload for a protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct NewProtocol {
    pub protocol_id: Option<String>,
    pub slug: String,
    pub name: String,
    pub address: Option<String>,
    pub symbol: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub chain: Option<String>,
    pub logo: Option<String>,
    pub audits: Option<String>,
    pub category: Option<String>,
    pub twitter: Option<String>,
    pub parent_protocol: Option<String>,
    pub chains: Vec<String>,
    pub chain_tvls: Option<serde_json::Value>,
    pub listed_at: Option<i64>,
}

impl NewProtocol {
    /// Map the source schema onto a protocol row.
    ///
    /// `slug` is the key the referencing pools use, and is stored as-is
    /// so later passes resolve against it.
    pub fn from_raw(slug: &str, raw: RawProtocol) -> Self {
        Self {
            protocol_id: raw.id.as_ref().and_then(json_scalar_to_string),
            slug: slug.to_string(),
            name: raw
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| slug.to_string()),
            address: raw.address,
            symbol: raw.symbol,
            url: raw.url,
            description: raw.description,
            chain: raw.chain,
            logo: raw.logo,
            audits: raw.audits.as_ref().and_then(json_scalar_to_string),
            category: raw.category,
            twitter: raw.twitter,
            parent_protocol: raw.parent_protocol,
            chains: raw.chains.unwrap_or_default(),
            chain_tvls: raw.chain_tvls,
            listed_at: raw.listed_at.as_ref().and_then(|v| match v {
                serde_json::Value::Number(n) => n.as_i64(),
                serde_json::Value::String(s) => s.parse().ok(),
                _ => None,
            }),
        }
    }
}

fn json_scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// A pool as stored locally: the raw snapshot plus its score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pool {
    pub id: i64,
    /// External pool id (unique).
    pub pool_id: String,
    /// Local id of the owning protocol. Never null.
    pub protocol_id: i64,
    pub pool_name: String,
    pub chain: Option<String>,
    pub project: Option<String>,
    pub symbol: Option<String>,
    pub tvl_usd: f64,
    pub apy: f64,
    pub tvl_score: f64,
    pub risk_score: f64,
    pub final_score: f64,
    pub breakdown: Breakdown,
    /// Full source record from the last ingestion pass.
    pub raw: RawPool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Upsert payload for a pool. Only buildable from a score plus a resolved protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPool {
    pub pool_id: String,
    pub protocol_id: i64,
    pub pool_name: String,
    pub score: ScoreResult,
}

impl NewPool {
    pub fn new(score: ScoreResult, protocol_id: i64) -> Result<Self, YieldError> {
        let pool_id = score
            .pool
            .pool
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or(YieldError::MissingPoolId)?;
        Ok(Self {
            pool_id,
            protocol_id,
            pool_name: score.pool.display_name(),
            score,
        })
    }
}

/// Query filter for persisted pools.
#[derive(Debug, Clone, Default)]
pub struct PoolFilter {
    pub protocol: Option<String>,
    pub chain: Option<String>,
    pub min_risk_score: Option<f64>,
    pub max_risk_score: Option<f64>,
    pub min_apy: Option<f64>,
    pub max_apy: Option<f64>,
    /// "apy" | "risk_score"; anything else sorts by apy.
    pub sort_by: Option<String>,
    pub ascending: bool,
}

// ---------------------------------------------------------------------------
// Users and recommendations
// ---------------------------------------------------------------------------

/// How much risk a user is prepared to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTolerance {
    Low,
    Medium,
    High,
}

impl RiskTolerance {
    /// Highest acceptable risk percentage before the score is penalised.
    pub fn ceiling(&self) -> f64 {
        match self {
            RiskTolerance::Low => 35.0,
            RiskTolerance::Medium => 60.0,
            RiskTolerance::High => 85.0,
        }
    }
}

impl fmt::Display for RiskTolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskTolerance::Low => write!(f, "low"),
            RiskTolerance::Medium => write!(f, "medium"),
            RiskTolerance::High => write!(f, "high"),
        }
    }
}

/// Parse a tolerance (case-insensitive, a few common aliases).
impl std::str::FromStr for RiskTolerance {
    type Err = YieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" | "conservative" => Ok(RiskTolerance::Low),
            "medium" | "moderate" | "balanced" => Ok(RiskTolerance::Medium),
            "high" | "aggressive" => Ok(RiskTolerance::High),
            other => Err(YieldError::Config(format!("unknown risk tolerance: {other}"))),
        }
    }
}

/// The slice of a user profile the recommender needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub experience_level: String,
    pub primary_goal: String,
    pub risk_tolerance: RiskTolerance,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            experience_level: "beginner".to_string(),
            primary_goal: "earn steady, low-risk yield".to_string(),
            risk_tolerance: RiskTolerance::Low,
        }
    }
}

/// A stored recommendation. Rows accumulate and are never overwritten.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub id: i64,
    pub user_id: String,
    pub pool_id: i64,
    pub protocol_id: i64,
    pub score: f64,
    pub apy: f64,
    pub tvl_score: f64,
    pub risk_score: f64,
    pub projected_roi: f64,
    pub final_score: f64,
    pub details: String,
    pub breakdown: Breakdown,
    pub risk_metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a recommendation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecommendation {
    pub user_id: String,
    pub pool_id: i64,
    pub protocol_id: i64,
    pub score: f64,
    pub apy: f64,
    pub tvl_score: f64,
    pub risk_score: f64,
    pub projected_roi: f64,
    pub final_score: f64,
    pub details: String,
    pub breakdown: Breakdown,
    pub risk_metadata: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for YIELDRANK.
#[derive(Debug, thiserror::Error)]
pub enum YieldError {
    #[error("Upstream unavailable ({endpoint}): {message}")]
    UpstreamUnavailable { endpoint: String, message: String },

    #[error("Unexpected upstream payload ({endpoint}): {message}")]
    UpstreamSchemaError { endpoint: String, message: String },

    #[error("Protocol not resolved yet: {0}")]
    ProtocolUnresolved(String),

    #[error("Duplicate key: {0}")]
    PersistenceConflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Pool not found: {0}")]
    PoolNotFound(String),

    #[error("Pool record has no external pool id")]
    MissingPoolId,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl YieldError {
    /// Whether the task queue should retry the failing task.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            YieldError::UpstreamUnavailable { .. }
                | YieldError::UpstreamSchemaError { .. }
                | YieldError::Storage(_)
        )
    }
}

impl From<sqlx::Error> for YieldError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            if db.is_unique_violation() {
                return YieldError::PersistenceConflict(db.message().to_string());
            }
        }
        YieldError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for YieldError {
    fn from(e: serde_json::Error) -> Self {
        YieldError::Storage(format!("JSON column: {e}"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
