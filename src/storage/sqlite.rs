//! SQLite repository via `sqlx`.
//!
//! Schema is created on connect. JSON-shaped columns (breakdown, raw pool
//! snapshot, chain lists, risk metadata) are stored as TEXT.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::Repository;
use crate::types::{
    Breakdown, NewPool, NewProtocol, NewRecommendation, Pool, PoolFilter, Protocol,
    Recommendation, RawPool, YieldError,
};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS protocols (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        protocol_id     TEXT,
        slug            TEXT NOT NULL UNIQUE,
        name            TEXT NOT NULL,
        address         TEXT,
        symbol          TEXT,
        url             TEXT,
        description     TEXT,
        chain           TEXT,
        logo            TEXT,
        audits          TEXT,
        category        TEXT,
        twitter         TEXT,
        parent_protocol TEXT,
        chains          TEXT NOT NULL DEFAULT '[]',
        chain_tvls      TEXT,
        listed_at       INTEGER,
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_protocols_name ON protocols (name COLLATE NOCASE)",
    r#"CREATE TABLE IF NOT EXISTS pools (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        pool_id     TEXT NOT NULL UNIQUE,
        protocol_id INTEGER NOT NULL REFERENCES protocols (id) ON DELETE CASCADE,
        pool_name   TEXT NOT NULL,
        chain       TEXT,
        project     TEXT,
        symbol      TEXT,
        tvl_usd     REAL NOT NULL,
        apy         REAL NOT NULL,
        tvl_score   REAL NOT NULL,
        risk_score  REAL NOT NULL,
        final_score REAL NOT NULL,
        breakdown   TEXT NOT NULL,
        raw         TEXT NOT NULL,
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_pools_project ON pools (project)",
    r#"CREATE TABLE IF NOT EXISTS recommendations (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id       TEXT NOT NULL,
        pool_id       INTEGER NOT NULL REFERENCES pools (id) ON DELETE CASCADE,
        protocol_id   INTEGER NOT NULL REFERENCES protocols (id) ON DELETE CASCADE,
        score         REAL NOT NULL,
        apy           REAL NOT NULL,
        tvl_score     REAL NOT NULL,
        risk_score    REAL NOT NULL,
        projected_roi REAL NOT NULL,
        final_score   REAL NOT NULL,
        details       TEXT NOT NULL,
        breakdown     TEXT NOT NULL,
        risk_metadata TEXT NOT NULL,
        created_at    TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_recommendations_user ON recommendations (user_id)",
    r#"CREATE TABLE IF NOT EXISTS tasks (
        id           TEXT PRIMARY KEY,
        name         TEXT NOT NULL,
        args         TEXT NOT NULL,
        status       TEXT NOT NULL,
        attempts     INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        run_at       INTEGER NOT NULL,
        last_error   TEXT,
        created_at   INTEGER NOT NULL,
        updated_at   INTEGER NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks (status, run_at)",
];

const POOL_COLUMNS: &str = "id, pool_id, protocol_id, pool_name, chain, project, symbol, \
    tvl_usd, apy, tvl_score, risk_score, final_score, breakdown, raw, created_at, updated_at";

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Open a SQLite pool and create the schema.
///
/// In-memory URLs get a single, never-recycled connection so every
/// caller sees the same database.
pub async fn connect(database_url: &str) -> Result<SqlitePool, YieldError> {
    let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");

    let mut options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| YieldError::Config(format!("invalid database url {database_url}: {e}")))?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(8)
    };

    let pool = pool_options.connect_with(options).await?;

    for statement in SCHEMA {
        sqlx::query(statement).execute(&pool).await?;
    }

    info!(url = %database_url, "Database ready");
    Ok(pool)
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// `Repository` backed by a SQLite pool.
#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fresh in-memory database (tests, dry runs).
    pub async fn in_memory() -> Result<Self, YieldError> {
        Ok(Self::new(connect("sqlite::memory:").await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn find_protocol(&self, slug_or_name: &str) -> Result<Option<Protocol>, YieldError> {
        let row = sqlx::query(
            "SELECT * FROM protocols \
             WHERE slug = ? OR name = ? COLLATE NOCASE \
             ORDER BY (slug = ?) DESC, id ASC LIMIT 1",
        )
        .bind(slug_or_name)
        .bind(slug_or_name)
        .bind(slug_or_name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(protocol_from_row).transpose()
    }

    async fn get_protocol(&self, id: i64) -> Result<Option<Protocol>, YieldError> {
        let row = sqlx::query("SELECT * FROM protocols WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(protocol_from_row).transpose()
    }

    async fn list_protocols(&self) -> Result<Vec<Protocol>, YieldError> {
        let rows = sqlx::query("SELECT * FROM protocols ORDER BY slug ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(protocol_from_row).collect()
    }

    async fn insert_protocol(&self, p: &NewProtocol) -> Result<Protocol, YieldError> {
        let now = Utc::now().to_rfc3339();
        let chains = serde_json::to_string(&p.chains)?;
        let chain_tvls = p.chain_tvls.as_ref().map(serde_json::to_string).transpose()?;

        let row = sqlx::query(
            "INSERT INTO protocols (protocol_id, slug, name, address, symbol, url, description, \
             chain, logo, audits, category, twitter, parent_protocol, chains, chain_tvls, listed_at, \
             created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             RETURNING *",
        )
        .bind(&p.protocol_id)
        .bind(&p.slug)
        .bind(&p.name)
        .bind(&p.address)
        .bind(&p.symbol)
        .bind(&p.url)
        .bind(&p.description)
        .bind(&p.chain)
        .bind(&p.logo)
        .bind(&p.audits)
        .bind(&p.category)
        .bind(&p.twitter)
        .bind(&p.parent_protocol)
        .bind(chains)
        .bind(chain_tvls)
        .bind(p.listed_at)
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match YieldError::from(e) {
            YieldError::PersistenceConflict(_) => {
                YieldError::PersistenceConflict(format!("protocol slug {}", p.slug))
            }
            other => other,
        })?;

        debug!(slug = %p.slug, "Protocol inserted");
        protocol_from_row(&row)
    }

    async fn upsert_pool(&self, p: &NewPool) -> Result<i64, YieldError> {
        let now = Utc::now().to_rfc3339();
        let s = &p.score;
        let breakdown = serde_json::to_string(&s.breakdown)?;
        let raw = serde_json::to_string(&s.pool)?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO pools (pool_id, protocol_id, pool_name, chain, project, symbol, tvl_usd, \
             apy, tvl_score, risk_score, final_score, breakdown, raw, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (pool_id) DO UPDATE SET \
                protocol_id = excluded.protocol_id, \
                pool_name   = excluded.pool_name, \
                chain       = excluded.chain, \
                project     = excluded.project, \
                symbol      = excluded.symbol, \
                tvl_usd     = excluded.tvl_usd, \
                apy         = excluded.apy, \
                tvl_score   = excluded.tvl_score, \
                risk_score  = excluded.risk_score, \
                final_score = excluded.final_score, \
                breakdown   = excluded.breakdown, \
                raw         = excluded.raw, \
                updated_at  = excluded.updated_at \
             RETURNING id",
        )
        .bind(&p.pool_id)
        .bind(p.protocol_id)
        .bind(&p.pool_name)
        .bind(&s.pool.chain)
        .bind(&s.pool.project)
        .bind(&s.pool.symbol)
        .bind(s.pool.tvl_usd.unwrap_or(0.0))
        .bind(s.apy)
        .bind(s.tvl_score)
        .bind(s.risk_score)
        .bind(s.final_score)
        .bind(breakdown)
        .bind(raw)
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn get_pool(&self, pool_id: &str) -> Result<Option<Pool>, YieldError> {
        let sql = format!("SELECT {POOL_COLUMNS} FROM pools WHERE pool_id = ?");
        let row = sqlx::query(&sql)
            .bind(pool_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(pool_from_row).transpose()
    }

    async fn list_pools(&self, filter: &PoolFilter) -> Result<Vec<Pool>, YieldError> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {POOL_COLUMNS} FROM pools WHERE 1 = 1"));

        if let Some(protocol) = &filter.protocol {
            qb.push(" AND project = ").push_bind(protocol.clone());
        }
        if let Some(chain) = &filter.chain {
            qb.push(" AND chain = ").push_bind(chain.clone());
        }
        if let Some(v) = filter.min_risk_score {
            qb.push(" AND risk_score >= ").push_bind(v);
        }
        if let Some(v) = filter.max_risk_score {
            qb.push(" AND risk_score <= ").push_bind(v);
        }
        if let Some(v) = filter.min_apy {
            qb.push(" AND apy >= ").push_bind(v);
        }
        if let Some(v) = filter.max_apy {
            qb.push(" AND apy <= ").push_bind(v);
        }

        let column = match filter.sort_by.as_deref() {
            Some("risk_score") => "risk_score",
            _ => "apy",
        };
        let direction = if filter.ascending { "ASC" } else { "DESC" };
        qb.push(format!(" ORDER BY {column} {direction}, pool_id ASC"));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(pool_from_row).collect()
    }

    async fn count_pools(&self) -> Result<u64, YieldError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pools")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }

    async fn insert_recommendation(
        &self,
        r: &NewRecommendation,
    ) -> Result<Recommendation, YieldError> {
        let created_at = Utc::now();
        let breakdown = serde_json::to_string(&r.breakdown)?;
        let risk_metadata = serde_json::to_string(&r.risk_metadata)?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO recommendations (user_id, pool_id, protocol_id, score, apy, tvl_score, \
             risk_score, projected_roi, final_score, details, breakdown, risk_metadata, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&r.user_id)
        .bind(r.pool_id)
        .bind(r.protocol_id)
        .bind(r.score)
        .bind(r.apy)
        .bind(r.tvl_score)
        .bind(r.risk_score)
        .bind(r.projected_roi)
        .bind(r.final_score)
        .bind(&r.details)
        .bind(breakdown)
        .bind(risk_metadata)
        .bind(created_at.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(Recommendation {
            id,
            user_id: r.user_id.clone(),
            pool_id: r.pool_id,
            protocol_id: r.protocol_id,
            score: r.score,
            apy: r.apy,
            tvl_score: r.tvl_score,
            risk_score: r.risk_score,
            projected_roi: r.projected_roi,
            final_score: r.final_score,
            details: r.details.clone(),
            breakdown: r.breakdown.clone(),
            risk_metadata: r.risk_metadata.clone(),
            created_at,
        })
    }

    async fn recommendations_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<Recommendation>, YieldError> {
        let rows = sqlx::query("SELECT * FROM recommendations WHERE user_id = ? ORDER BY id ASC")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(recommendation_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse_ts(value: &str) -> Result<DateTime<Utc>, YieldError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| YieldError::Storage(format!("bad timestamp {value}: {e}")))
}

fn protocol_from_row(row: &SqliteRow) -> Result<Protocol, YieldError> {
    let chains: String = row.try_get("chains")?;
    let chain_tvls: Option<String> = row.try_get("chain_tvls")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Protocol {
        id: row.try_get("id")?,
        protocol_id: row.try_get("protocol_id")?,
        slug: row.try_get("slug")?,
        name: row.try_get("name")?,
        address: row.try_get("address")?,
        symbol: row.try_get("symbol")?,
        url: row.try_get("url")?,
        description: row.try_get("description")?,
        chain: row.try_get("chain")?,
        logo: row.try_get("logo")?,
        audits: row.try_get("audits")?,
        category: row.try_get("category")?,
        twitter: row.try_get("twitter")?,
        parent_protocol: row.try_get("parent_protocol")?,
        chains: serde_json::from_str(&chains)?,
        chain_tvls: chain_tvls.as_deref().map(serde_json::from_str).transpose()?,
        listed_at: row.try_get("listed_at")?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn pool_from_row(row: &SqliteRow) -> Result<Pool, YieldError> {
    let breakdown: String = row.try_get("breakdown")?;
    let raw: String = row.try_get("raw")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Pool {
        id: row.try_get("id")?,
        pool_id: row.try_get("pool_id")?,
        protocol_id: row.try_get("protocol_id")?,
        pool_name: row.try_get("pool_name")?,
        chain: row.try_get("chain")?,
        project: row.try_get("project")?,
        symbol: row.try_get("symbol")?,
        tvl_usd: row.try_get("tvl_usd")?,
        apy: row.try_get("apy")?,
        tvl_score: row.try_get("tvl_score")?,
        risk_score: row.try_get("risk_score")?,
        final_score: row.try_get("final_score")?,
        breakdown: serde_json::from_str::<Breakdown>(&breakdown)?,
        raw: serde_json::from_str::<RawPool>(&raw)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn recommendation_from_row(row: &SqliteRow) -> Result<Recommendation, YieldError> {
    let breakdown: String = row.try_get("breakdown")?;
    let risk_metadata: String = row.try_get("risk_metadata")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(Recommendation {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        pool_id: row.try_get("pool_id")?,
        protocol_id: row.try_get("protocol_id")?,
        score: row.try_get("score")?,
        apy: row.try_get("apy")?,
        tvl_score: row.try_get("tvl_score")?,
        risk_score: row.try_get("risk_score")?,
        projected_roi: row.try_get("projected_roi")?,
        final_score: row.try_get("final_score")?,
        details: row.try_get("details")?,
        breakdown: serde_json::from_str(&breakdown)?,
        risk_metadata: serde_json::from_str(&risk_metadata)?,
        created_at: parse_ts(&created_at)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
