//! DefiLlama yield-data client.
//!
//! Pools: `GET https://yields.llama.fi/pools` → `{ "status": "success", "data": [...] }`
//! Protocol: `GET https://api.llama.fi/protocol/{slug}` → protocol object
//! APY chart: `GET https://yields.llama.fi/chart/{pool}` → `{ "data": [...] }`
//! Auth: none. Every request is bounded by the client timeout (30s default).

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::YieldSource;
use crate::config::SourceConfig;
use crate::types::{ApyPoint, RawPool, RawProtocol, YieldError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const SOURCE_NAME: &str = "defillama";
const DEFAULT_POOLS_URL: &str = "https://yields.llama.fi/pools";
const DEFAULT_PROTOCOL_URL: &str = "https://api.llama.fi/protocol";
const DEFAULT_CHART_URL: &str = "https://yields.llama.fi/chart";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Longest slice of an error body kept in error messages.
const MAX_ERROR_BODY: usize = 200;

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// DefiLlama HTTP client.
pub struct DefiLlamaClient {
    http: Client,
    pools_url: String,
    protocol_url: String,
    chart_url: String,
}

impl DefiLlamaClient {
    /// Client against the public DefiLlama endpoints.
    pub fn new() -> Result<Self, YieldError> {
        Self::with_endpoints(
            DEFAULT_POOLS_URL,
            DEFAULT_PROTOCOL_URL,
            DEFAULT_CHART_URL,
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        )
    }

    /// Client built from the `[source]` config section.
    pub fn from_config(cfg: &SourceConfig) -> Result<Self, YieldError> {
        Self::with_endpoints(
            &cfg.pools_url,
            &cfg.protocol_url,
            &cfg.chart_url,
            Duration::from_secs(cfg.timeout_secs),
        )
    }

    pub fn with_endpoints(
        pools_url: &str,
        protocol_url: &str,
        chart_url: &str,
        timeout: Duration,
    ) -> Result<Self, YieldError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("YIELDRANK/0.1.0 (yield-pool-ranker)")
            .build()
            .map_err(|e| YieldError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            pools_url: pools_url.trim_end_matches('/').to_string(),
            protocol_url: protocol_url.trim_end_matches('/').to_string(),
            chart_url: chart_url.trim_end_matches('/').to_string(),
        })
    }

    // -- Internal helpers ------------------------------------------------

    /// GET a URL and return the body text, mapping transport and HTTP
    /// failures to `UpstreamUnavailable`.
    async fn get_text(&self, endpoint: &str, url: &str) -> Result<String, YieldError> {
        debug!(url = %url, "Fetching from DefiLlama");

        let resp = self.http.get(url).send().await.map_err(|e| {
            let message = if e.is_timeout() {
                format!("request timed out: {e}")
            } else {
                e.to_string()
            };
            YieldError::UpstreamUnavailable {
                endpoint: endpoint.to_string(),
                message,
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(YieldError::UpstreamUnavailable {
                endpoint: endpoint.to_string(),
                message: format!("HTTP {status}: {}", truncate(&body, MAX_ERROR_BODY)),
            });
        }

        resp.text().await.map_err(|e| YieldError::UpstreamUnavailable {
            endpoint: endpoint.to_string(),
            message: format!("failed reading body: {e}"),
        })
    }
}

#[async_trait]
impl YieldSource for DefiLlamaClient {
    async fn fetch_pools(&self, limit: Option<usize>) -> Result<Vec<RawPool>, YieldError> {
        let body = self.get_text("pools", &self.pools_url).await?;
        let mut pools: Vec<RawPool> = parse_data_list("pools", &body)?;

        if let Some(n) = limit {
            pools.truncate(n);
        }

        info!(count = pools.len(), limit = ?limit, "DefiLlama pools fetched");
        Ok(pools)
    }

    async fn fetch_protocol(&self, slug: &str) -> Result<RawProtocol, YieldError> {
        let url = format!("{}/{}", self.protocol_url, urlencoding::encode(slug));
        let body = self.get_text("protocol", &url).await?;
        let protocol = parse_protocol(&body)?;

        debug!(slug, name = ?protocol.name, "DefiLlama protocol fetched");
        Ok(protocol)
    }

    async fn fetch_apy_history(&self, pool_id: &str) -> Result<Vec<ApyPoint>, YieldError> {
        let url = format!("{}/{}", self.chart_url, urlencoding::encode(pool_id));
        let body = self.get_text("chart", &url).await?;
        parse_data_list("chart", &body)
    }

    fn name(&self) -> &str {
        SOURCE_NAME
    }
}

// ---------------------------------------------------------------------------
// Payload parsing
// ---------------------------------------------------------------------------

/// Parse a `{ "data": [...] }` envelope. A missing or non-list `data`
/// is a schema error, never an empty default.
///
/// Entries are decoded one by one: a malformed entry is logged and
/// skipped so it cannot take its siblings down with it. Only a list in
/// which every entry is malformed is treated as a schema change.
pub fn parse_data_list<T: DeserializeOwned>(endpoint: &str, body: &str) -> Result<Vec<T>, YieldError> {
    let schema_err = |message: String| YieldError::UpstreamSchemaError {
        endpoint: endpoint.to_string(),
        message,
    };

    let mut value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| schema_err(format!("invalid JSON: {e}")))?;

    let data = value
        .get_mut("data")
        .map(serde_json::Value::take)
        .ok_or_else(|| schema_err("missing top-level `data`".to_string()))?;

    let serde_json::Value::Array(entries) = data else {
        return Err(schema_err("`data` is not a list".to_string()));
    };

    let total = entries.len();
    let mut items = Vec::with_capacity(total);
    let mut last_error = None;
    for (index, entry) in entries.into_iter().enumerate() {
        match serde_json::from_value::<T>(entry) {
            Ok(item) => items.push(item),
            Err(e) => {
                warn!(endpoint, index, error = %e, "Skipping malformed entry");
                last_error = Some(e);
            }
        }
    }

    let skipped = total - items.len();
    if skipped > 0 {
        if items.is_empty() {
            let detail = last_error.map(|e| e.to_string()).unwrap_or_default();
            return Err(schema_err(format!("all {total} entries malformed: {detail}")));
        }
        warn!(endpoint, skipped, kept = items.len(), "Malformed entries skipped");
    }

    Ok(items)
}

/// Parse a protocol object. Anything other than a JSON object is a schema error.
pub fn parse_protocol(body: &str) -> Result<RawProtocol, YieldError> {
    let schema_err = |message: String| YieldError::UpstreamSchemaError {
        endpoint: "protocol".to_string(),
        message,
    };

    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| schema_err(format!("invalid JSON: {e}")))?;

    if !value.is_object() {
        return Err(schema_err("expected a protocol object".to_string()));
    }

    serde_json::from_value(value).map_err(|e| schema_err(format!("malformed protocol: {e}")))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const POOLS_BODY: &str = r#"{
        "status": "success",
        "data": [
            {"chain":"Ethereum","project":"lido","symbol":"STETH","pool":"p-1","tvlUsd":2655534964,"apyBase":2.9,"apyReward":null,"apy":2.9,"stablecoin":false,"ilRisk":"no","exposure":"single","predictions":{"predictedClass":"Stable/Up","predictedProbability":75,"binnedConfidence":2},"sigma":0.05},
            {"chain":"Arbitrum","project":"aave-v3","symbol":"USDC","pool":"p-2","tvlUsd":null,"apy":null},
            {"pool":"p-3"}
        ]
    }"#;

    #[test]
    fn test_parse_pools() {
        let pools: Vec<RawPool> = parse_data_list("pools", POOLS_BODY).unwrap();
        assert_eq!(pools.len(), 3);
        assert_eq!(pools[0].project.as_deref(), Some("lido"));
        assert_eq!(pools[1].tvl_usd, None);
        assert_eq!(pools[2].pool_id(), "p-3");
    }

    #[test]
    fn test_parse_pools_empty_list_ok() {
        let pools: Vec<RawPool> = parse_data_list("pools", r#"{"data": []}"#).unwrap();
        assert!(pools.is_empty());
    }

    #[test]
    fn test_parse_pools_missing_data_is_schema_error() {
        let err = parse_data_list::<RawPool>("pools", r#"{"status": "success"}"#).unwrap_err();
        assert!(matches!(err, YieldError::UpstreamSchemaError { .. }));
    }

    #[test]
    fn test_parse_pools_data_not_list_is_schema_error() {
        let err = parse_data_list::<RawPool>("pools", r#"{"data": {"pool": "x"}}"#).unwrap_err();
        assert!(matches!(err, YieldError::UpstreamSchemaError { .. }));
    }

    #[test]
    fn test_parse_pools_all_entries_malformed_is_schema_error() {
        let err = parse_data_list::<RawPool>("pools", r#"{"data": [{"tvlUsd": "lots"}]}"#)
            .unwrap_err();
        assert!(matches!(err, YieldError::UpstreamSchemaError { .. }));
    }

    #[test]
    fn test_parse_pools_skips_malformed_entry() {
        let body = r#"{"data": [
            {"pool": "good-1", "project": "lido", "tvlUsd": 1000000},
            {"pool": "odd", "rewardTokens": ["0xabc", null]},
            {"pool": "good-2", "project": "aave-v3"}
        ]}"#;
        let pools: Vec<RawPool> = parse_data_list("pools", body).unwrap();
        let ids: Vec<&str> = pools.iter().map(RawPool::pool_id).collect();
        assert_eq!(ids, vec!["good-1", "good-2"]);
    }

    #[test]
    fn test_parse_invalid_json_is_schema_error() {
        let err = parse_data_list::<RawPool>("pools", "<html>502</html>").unwrap_err();
        assert!(matches!(err, YieldError::UpstreamSchemaError { .. }));
    }

    #[test]
    fn test_parse_protocol() {
        let p = parse_protocol(r#"{"id":"182","name":"Lido","category":"Liquid Staking","chains":["Ethereum"]}"#)
            .unwrap();
        assert_eq!(p.name.as_deref(), Some("Lido"));
        assert_eq!(p.chains.unwrap(), vec!["Ethereum"]);
    }

    #[test]
    fn test_parse_protocol_rejects_list() {
        let err = parse_protocol("[]").unwrap_err();
        assert!(matches!(err, YieldError::UpstreamSchemaError { .. }));
    }

    #[test]
    fn test_parse_chart() {
        let pts: Vec<ApyPoint> = parse_data_list(
            "chart",
            r#"{"status":"success","data":[{"timestamp":"2024-01-01T00:00:00.000Z","tvlUsd":100,"apy":3.2,"apyBase":3.2,"apyReward":null}]}"#,
        )
        .unwrap();
        assert_eq!(pts.len(), 1);
        assert_eq!(pts[0].apy, Some(3.2));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("abc", 10), "abc");
    }

    #[test]
    fn test_client_construction_trims_urls() {
        let client = DefiLlamaClient::with_endpoints(
            "http://localhost/pools/",
            "http://localhost/protocol/",
            "http://localhost/chart",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(client.pools_url, "http://localhost/pools");
        assert_eq!(client.protocol_url, "http://localhost/protocol");
        assert_eq!(client.name(), "defillama");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_unavailable() {
        let client = DefiLlamaClient::with_endpoints(
            "http://127.0.0.1:9/pools",
            "http://127.0.0.1:9/protocol",
            "http://127.0.0.1:9/chart",
            Duration::from_secs(2),
        )
        .unwrap();
        let err = client.fetch_pools(Some(5)).await.unwrap_err();
        assert!(matches!(err, YieldError::UpstreamUnavailable { .. }));
        assert!(err.is_retryable());
    }

    /// Serve every connection with `reply`, or hold it open silently when `None`.
    async fn local_upstream(reply: Option<&'static str>) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    match reply {
                        Some(response) => {
                            let _ = socket.write_all(response.as_bytes()).await;
                            let _ = socket.shutdown().await;
                        }
                        None => tokio::time::sleep(Duration::from_secs(30)).await,
                    }
                });
            }
        });
        format!("http://{addr}")
    }

    fn client_for(base: &str, timeout: Duration) -> DefiLlamaClient {
        DefiLlamaClient::with_endpoints(
            &format!("{base}/pools"),
            &format!("{base}/protocol"),
            &format!("{base}/chart"),
            timeout,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_http_error_status_is_unavailable() {
        let base = local_upstream(Some(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Type: text/plain\r\nContent-Length: 11\r\nConnection: close\r\n\r\nbusy, later",
        ))
        .await;
        let client = client_for(&base, Duration::from_secs(5));

        let err = client.fetch_pools(None).await.unwrap_err();
        match &err {
            YieldError::UpstreamUnavailable { endpoint, message } => {
                assert_eq!(endpoint, "pools");
                assert!(message.contains("503"), "{message}");
                assert!(message.contains("busy, later"), "{message}");
            }
            other => panic!("expected UpstreamUnavailable, got {other:?}"),
        }
        assert!(err.is_retryable());

        let err = client.fetch_protocol("lido").await.unwrap_err();
        assert!(matches!(err, YieldError::UpstreamUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_stalled_upstream_times_out() {
        let base = local_upstream(None).await;
        let client = client_for(&base, Duration::from_millis(200));

        let started = std::time::Instant::now();
        let err = client.fetch_pools(Some(5)).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        match &err {
            YieldError::UpstreamUnavailable { message, .. } => {
                assert!(message.contains("timed out"), "{message}");
            }
            other => panic!("expected UpstreamUnavailable, got {other:?}"),
        }
        assert!(err.is_retryable());
    }
}
