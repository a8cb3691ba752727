//! Risk/return scoring engine.
//!
//! Pure and total: any `RawPool`, however sparse, produces a `ScoreResult`.
//! Missing numerics default to 0, missing strings to their neutral value
//! ("no", "single"), and a missing prediction counts as fully uncertain.

pub mod ranking;

use crate::types::{Breakdown, RawPool, RiskFactors, ScoreResult};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// TVL at which the liquidity risk term reaches zero.
const TVL_RISK_CEILING_USD: f64 = 40_000_000_000.0;

/// APY at which the yield-sustainability risk term saturates.
const APY_RISK_CEILING: f64 = 500.0;

/// Sigma at which the volatility risk term saturates.
const SIGMA_RISK_CEILING: f64 = 1.0;

const W_TVL: f64 = 0.3;
const W_APY: f64 = 0.2;
const W_VOLATILITY: f64 = 0.2;
const W_PREDICTION: f64 = 0.1;

const IL_PENALTY: f64 = 0.2;
const NON_STABLECOIN_PENALTY: f64 = 0.1;
const MULTI_EXPOSURE_PENALTY: f64 = 0.05;

/// Final score = apy·0.5 + tvl_score·0.3 − risk%·0.2
const F_APY: f64 = 0.5;
const F_TVL: f64 = 0.3;
const F_RISK: f64 = 0.2;

/// Reason-string thresholds.
const HIGH_APY_WARNING: f64 = 50.0;
const LOW_TVL_WARNING_USD: f64 = 100_000_000.0;

/// Largest precision `round_dp` handles exactly; `2^53 * 10^15` fits in a u128.
const MAX_EXACT_DP: i32 = 15;

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Score a single pool.
pub fn score_pool(pool: &RawPool) -> ScoreResult {
    let apy = resolve_apy(pool);
    let tvl_usd = pool.tvl_usd.unwrap_or(0.0).max(0.0);
    let tvl_score = tvl_score(tvl_usd);

    let factors = risk_factors(pool, apy, tvl_usd);
    let risk = composite_risk(&factors);
    let risk_score = round_dp(risk * 100.0, 2);

    let final_score = round_dp(apy * F_APY + tvl_score * F_TVL - risk_score * F_RISK, 2);

    let breakdown = breakdown(pool, apy, tvl_usd, tvl_score, &factors);

    ScoreResult {
        apy: round_dp(apy, 4),
        tvl_score,
        risk_score,
        final_score,
        breakdown,
        factors,
        pool: pool.clone(),
    }
}

/// Base + reward when either half is reported, else the source's own `apy`.
pub fn resolve_apy(pool: &RawPool) -> f64 {
    if pool.apy_base.is_some() || pool.apy_reward.is_some() {
        pool.apy_base.unwrap_or(0.0) + pool.apy_reward.unwrap_or(0.0)
    } else {
        pool.apy.unwrap_or(0.0)
    }
}

/// Log-scaled TVL score: $1 → 0, ≥ $100k → 100 (clamped).
pub fn tvl_score(tvl_usd: f64) -> f64 {
    let tvl_usd = tvl_usd.max(0.0);
    round_dp((tvl_usd + 1.0).log10() * 20.0, 2).min(100.0)
}

fn risk_factors(pool: &RawPool, apy: f64, tvl_usd: f64) -> RiskFactors {
    let sigma = pool.sigma.unwrap_or(0.0).max(0.0);

    let prediction_penalty = match pool
        .predictions
        .as_ref()
        .and_then(|p| p.predicted_probability)
    {
        Some(p) if p != 0.0 => 1.0 - (p / 100.0),
        _ => 1.0,
    };

    RiskFactors {
        tvl_norm: 1.0 - (tvl_usd / TVL_RISK_CEILING_USD).min(1.0),
        apy_norm: (apy / APY_RISK_CEILING).min(1.0),
        volatility_norm: (sigma / SIGMA_RISK_CEILING).min(1.0),
        il_penalty: if has_il_risk(pool) { IL_PENALTY } else { 0.0 },
        stablecoin_penalty: if is_stablecoin(pool) { 0.0 } else { NON_STABLECOIN_PENALTY },
        prediction_penalty,
        exposure_penalty: if is_multi_exposure(pool) { MULTI_EXPOSURE_PENALTY } else { 0.0 },
    }
}

/// Weighted risk sum, clamped to [0, 1].
fn composite_risk(f: &RiskFactors) -> f64 {
    let risk = W_TVL * f.tvl_norm
        + W_APY * f.apy_norm
        + W_VOLATILITY * f.volatility_norm
        + W_PREDICTION * f.prediction_penalty
        + f.il_penalty
        + f.stablecoin_penalty
        + f.exposure_penalty;
    risk.clamp(0.0, 1.0)
}

fn has_il_risk(pool: &RawPool) -> bool {
    pool.il_risk
        .as_deref()
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("yes"))
}

fn is_stablecoin(pool: &RawPool) -> bool {
    pool.stablecoin.unwrap_or(false)
}

fn is_multi_exposure(pool: &RawPool) -> bool {
    pool.exposure
        .as_deref()
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("multi"))
}

// ---------------------------------------------------------------------------
// Breakdown
// ---------------------------------------------------------------------------

fn breakdown(
    pool: &RawPool,
    apy: f64,
    tvl_usd: f64,
    tvl_score: f64,
    factors: &RiskFactors,
) -> Breakdown {
    let il = has_il_risk(pool);
    let stable = is_stablecoin(pool);
    let multi = is_multi_exposure(pool);

    let mut reasons = Vec::new();
    if apy > HIGH_APY_WARNING {
        reasons.push("Very high APY may be unsustainable.".to_string());
    }
    if tvl_usd < LOW_TVL_WARNING_USD {
        reasons.push("Low TVL increases volatility risk.".to_string());
    }
    if il {
        reasons.push("Impermanent loss risk present.".to_string());
    }
    if !stable {
        reasons.push("Non-stablecoin pool, subject to volatility.".to_string());
    }
    if multi {
        reasons.push("Multi-token exposure increases complexity.".to_string());
    }
    if reasons.is_empty() {
        reasons.push("Pool appears relatively safe.".to_string());
    }

    let prediction_confidence = match pool
        .predictions
        .as_ref()
        .and_then(|p| p.predicted_probability)
    {
        Some(p) => format!("{p}%"),
        None => "N/A".to_string(),
    };

    Breakdown {
        tvl: format!(
            "Liquidity: ${} → score {}",
            format_usd(tvl_usd),
            tvl_score
        ),
        impermanent_loss: if il { "Yes" } else { "No" }.to_string(),
        stablecoin: if stable { "Stablecoin pool" } else { "Volatile tokens" }.to_string(),
        volatility_sigma: format!(
            "{:.3} (normalized {:.2})",
            pool.sigma.unwrap_or(0.0),
            factors.volatility_norm
        ),
        prediction_confidence,
        exposure: if multi { "Multi-asset" } else { "Single-asset" }.to_string(),
        explanation: reasons.join(" "),
        reasons,
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Round to `dp` decimal places.
///
/// Works on the exact binary value, so `2.675` (stored just below the
/// half) rounds down, and exact halves such as `0.125` go to the even
/// neighbour. Scaling by `10^dp` first can manufacture a tie:
/// `2.675 * 100.0 == 267.5`.
pub fn round_dp(value: f64, dp: i32) -> f64 {
    if !value.is_finite() || !(0..=MAX_EXACT_DP).contains(&dp) {
        let factor = 10f64.powi(dp);
        return (value * factor).round_ties_even() / factor;
    }

    // value = mantissa * 2^exponent
    let bits = value.to_bits();
    let biased = ((bits >> 52) & 0x7ff) as i32;
    let fraction = bits & ((1u64 << 52) - 1);
    let (mantissa, exponent) = if biased == 0 {
        (fraction, -1074)
    } else {
        (fraction | (1u64 << 52), biased - 1075)
    };
    if exponent >= 0 {
        // Already an integer.
        return value;
    }

    let scaled = u128::from(mantissa) * 10u128.pow(dp as u32);
    let shift = exponent.unsigned_abs();
    let units = if shift >= 128 {
        0
    } else {
        let whole = scaled >> shift;
        let rest = scaled & ((1u128 << shift) - 1);
        let half = 1u128 << (shift - 1);
        if rest > half || (rest == half && whole % 2 == 1) {
            whole + 1
        } else {
            whole
        }
    };

    let magnitude = units as f64 / 10f64.powi(dp);
    if value.is_sign_negative() {
        -magnitude
    } else {
        magnitude
    }
}

/// Whole-dollar amount with thousands separators, e.g. "2,655,534,965".
fn format_usd(value: f64) -> String {
    let whole = format!("{:.0}", value.max(0.0));
    let mut out = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
