//! Per-user recommendation building.
//!
//! Re-scores a persisted pool, adjusts the score to the user's risk
//! tolerance and appends a recommendation row. Profile lookup and prose
//! generation sit behind traits so the real services can be plugged in.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::scoring::{round_dp, score_pool};
use crate::sources::{select_latest_apy, YieldSource};
use crate::storage::Repository;
use crate::types::{
    NewRecommendation, Pool, Protocol, Recommendation, RiskFactors, ScoreResult, UserProfile,
    YieldError,
};

/// Score lost per risk point above the user's ceiling.
const TOLERANCE_PENALTY: f64 = 0.5;

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Looks up the profile a recommendation is tailored to.
#[async_trait]
pub trait ProfileProvider: Send + Sync {
    async fn profile(&self, user_id: &str) -> Result<UserProfile, YieldError>;
}

/// Produces the human-readable text stored with a recommendation.
#[async_trait]
pub trait Explainer: Send + Sync {
    async fn explain(
        &self,
        pool: &Pool,
        score: &ScoreResult,
        profile: &UserProfile,
    ) -> Result<String, YieldError>;
}

/// Fixed profiles: one default plus optional per-user overrides.
#[derive(Debug, Clone, Default)]
pub struct StaticProfiles {
    default: UserProfile,
    overrides: HashMap<String, UserProfile>,
}

impl StaticProfiles {
    pub fn new(default: UserProfile) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>, profile: UserProfile) -> Self {
        self.overrides.insert(user_id.into(), profile);
        self
    }
}

#[async_trait]
impl ProfileProvider for StaticProfiles {
    async fn profile(&self, user_id: &str) -> Result<UserProfile, YieldError> {
        Ok(self
            .overrides
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone()))
    }
}

/// Builds the explanation from the score breakdown.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateExplainer;

#[async_trait]
impl Explainer for TemplateExplainer {
    async fn explain(
        &self,
        pool: &Pool,
        score: &ScoreResult,
        profile: &UserProfile,
    ) -> Result<String, YieldError> {
        let fit = if score.risk_score <= profile.risk_tolerance.ceiling() {
            "within"
        } else {
            "above"
        };
        Ok(format!(
            "{} on {} offers {:.2}% APY at {} risk, {fit} a {} risk tolerance. {}",
            pool.pool_name,
            pool.chain.as_deref().unwrap_or("an unknown chain"),
            score.apy,
            score.risk_score_display(),
            profile.risk_tolerance,
            score.breakdown.explanation,
        ))
    }
}

// ---------------------------------------------------------------------------
// Recommender
// ---------------------------------------------------------------------------

pub struct Recommender {
    repo: Arc<dyn Repository>,
    source: Arc<dyn YieldSource>,
    profiles: Arc<dyn ProfileProvider>,
    explainer: Arc<dyn Explainer>,
}

impl Recommender {
    pub fn new(
        repo: Arc<dyn Repository>,
        source: Arc<dyn YieldSource>,
        profiles: Arc<dyn ProfileProvider>,
        explainer: Arc<dyn Explainer>,
    ) -> Self {
        Self {
            repo,
            source,
            profiles,
            explainer,
        }
    }

    /// Build and store a recommendation of `pool_id` (external id) for `user_id`.
    pub async fn build_recommendation(
        &self,
        pool_id: &str,
        user_id: &str,
    ) -> Result<Recommendation, YieldError> {
        let pool = self
            .repo
            .get_pool(pool_id)
            .await?
            .ok_or_else(|| YieldError::PoolNotFound(pool_id.to_string()))?;
        let protocol = self.repo.get_protocol(pool.protocol_id).await?;
        let profile = self.profiles.profile(user_id).await?;

        let score = score_pool(&pool.raw);
        let ceiling = profile.risk_tolerance.ceiling();
        let adjusted = tolerance_adjusted_score(score.final_score, score.risk_score, ceiling);
        let projected_roi = projected_roi(score.apy, score.risk_score);

        let mut metadata = risk_metadata(&score, protocol.as_ref(), ceiling);
        match self.source.fetch_apy_history(pool_id).await {
            Ok(points) => {
                if let Some(snapshot) = select_latest_apy(&points) {
                    metadata.insert("apy_snapshot".into(), serde_json::to_value(snapshot)?);
                }
            }
            Err(e) => warn!(pool_id = %pool_id, error = %e, "APY history unavailable, omitting snapshot"),
        }

        let details = self.explainer.explain(&pool, &score, &profile).await?;

        let rec = NewRecommendation {
            user_id: user_id.to_string(),
            pool_id: pool.id,
            protocol_id: pool.protocol_id,
            score: adjusted,
            apy: score.apy,
            tvl_score: score.tvl_score,
            risk_score: score.risk_score,
            projected_roi,
            final_score: score.final_score,
            details,
            breakdown: score.breakdown.clone(),
            risk_metadata: Value::Object(metadata),
        };

        let stored = self.repo.insert_recommendation(&rec).await?;
        info!(
            user_id = %user_id,
            pool_id = %pool_id,
            score = stored.score,
            risk = stored.risk_score,
            "Recommendation stored"
        );
        Ok(stored)
    }
}

/// Final score minus a penalty for every risk point above the ceiling.
pub fn tolerance_adjusted_score(final_score: f64, risk_percent: f64, ceiling: f64) -> f64 {
    let excess = (risk_percent - ceiling).max(0.0);
    round_dp(final_score - TOLERANCE_PENALTY * excess, 2)
}

/// Risk-adjusted expected yield, in percent.
pub fn projected_roi(apy: f64, risk_percent: f64) -> f64 {
    round_dp(apy * (1.0 - risk_percent / 100.0), 4)
}

fn band(value: f64, low_below: f64, moderate_below: f64) -> &'static str {
    if value < low_below {
        "low"
    } else if value < moderate_below {
        "moderate"
    } else {
        "high"
    }
}

fn risk_metadata(score: &ScoreResult, protocol: Option<&Protocol>, ceiling: f64) -> Map<String, Value> {
    let RiskFactors {
        tvl_norm,
        volatility_norm,
        il_penalty,
        ..
    } = score.factors;

    let audits = protocol.map_or(0, Protocol::audit_count);
    if protocol.is_none() {
        debug!(pool_id = %score.pool_id(), "Owning protocol missing, treating as unaudited");
    }

    let value = json!({
        "overall_risk_score": score.risk_score,
        "liquidity_risk": band(tvl_norm, 0.5, 0.9),
        "market_risk": band(volatility_norm, 0.1, 0.5),
        "impermanent_loss_risk": if il_penalty > 0.0 { "high" } else { "low" },
        "smart_contract_risk": if audits > 0 { "low" } else { "high" },
        "within_tolerance": score.risk_score <= ceiling,
    });
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
