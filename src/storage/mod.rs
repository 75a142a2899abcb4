//! Persistence layer.
//!
//! SQLite via `sqlx`. The relational store is the only coordination point
//! between settlement runs: uniqueness constraints make inserts idempotent,
//! null-guarded updates make scoring monotonic, and the minter's leases and
//! transaction make crediting exactly-once.

pub mod collaborators;
pub mod episodes;
pub mod lease;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::types::SettlementError;

/// How long a connection waits on the write lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Open a connection pool. File databases are created if missing and run
/// in WAL mode so readers never block the minting writer.
pub async fn connect(url: &str, max_connections: u32) -> Result<SqlitePool> {
    let in_memory = url.contains(":memory:");
    let mut options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("Invalid database url: {url}"))?
        .create_if_missing(true)
        .busy_timeout(BUSY_TIMEOUT);
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    // Each connection to `:memory:` is its own database.
    let max_connections = if in_memory { 1 } else { max_connections.max(1) };

    let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections);
    if in_memory {
        // Closing the only connection would drop the database with it.
        pool_options = pool_options.idle_timeout(None).max_lifetime(None);
    }

    let pool = pool_options
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;

    info!(url, max_connections, "Database pool ready");
    Ok(pool)
}

/// Single-connection in-memory database with the settlement and
/// collaborator schemas applied. Used by tests and dry runs.
pub async fn open_in_memory() -> Result<SqlitePool> {
    let pool = connect("sqlite::memory:", 1).await?;
    collaborators::create_tables(&pool).await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Create the settlement tables and indexes if they do not exist.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alpha_episodes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            market_update_id INTEGER NOT NULL UNIQUE,
            post_id INTEGER NOT NULL,
            event_id INTEGER NOT NULL,
            trader_id INTEGER NOT NULL,
            bucket_start INTEGER NOT NULL,
            episode_type TEXT NOT NULL CHECK (episode_type IN ('belief', 'attention')),
            is_meaningful INTEGER NOT NULL,
            p_before REAL NOT NULL,
            p_after REAL NOT NULL,
            s_early REAL,
            s_early_at INTEGER,
            s_mid REAL,
            s_mid_at INTEGER,
            s_final REAL,
            s_final_at INTEGER,
            combined_score REAL,
            lease_token TEXT,
            lease_expires_at INTEGER,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create alpha_episodes")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_alpha_episodes_event ON alpha_episodes(event_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_alpha_episodes_lease ON alpha_episodes(lease_token)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alpha_payouts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            episode_id INTEGER NOT NULL REFERENCES alpha_episodes(id),
            component TEXT NOT NULL CHECK (component IN ('early', 'mid', 'final')),
            post_id INTEGER NOT NULL,
            author_id INTEGER NOT NULL,
            event_id INTEGER NOT NULL,
            score_component REAL NOT NULL,
            mint_rate REAL NOT NULL,
            reward_ledger INTEGER NOT NULL CHECK (reward_ledger >= 0),
            payout_status TEXT NOT NULL CHECK (payout_status IN ('minted', 'skipped_by_cap')),
            created_at INTEGER NOT NULL,
            UNIQUE (episode_id, component)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create alpha_payouts")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_alpha_payouts_post_time ON alpha_payouts(post_id, created_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_alpha_payouts_author_time ON alpha_payouts(author_id, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alpha_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at INTEGER NOT NULL,
            finished_at INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('completed', 'skipped', 'failed')),
            updates_pulled INTEGER NOT NULL DEFAULT 0,
            episodes_created INTEGER NOT NULL DEFAULT 0,
            episodes_existing INTEGER NOT NULL DEFAULT 0,
            build_failures INTEGER NOT NULL DEFAULT 0,
            episodes_examined INTEGER NOT NULL DEFAULT 0,
            early_scored INTEGER NOT NULL DEFAULT 0,
            mid_scored INTEGER NOT NULL DEFAULT 0,
            final_scored INTEGER NOT NULL DEFAULT 0,
            score_failures INTEGER NOT NULL DEFAULT 0,
            episodes_claimed INTEGER NOT NULL DEFAULT 0,
            payouts_minted INTEGER NOT NULL DEFAULT 0,
            payouts_zero INTEGER NOT NULL DEFAULT 0,
            payouts_capped INTEGER NOT NULL DEFAULT 0,
            ledger_minted INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            events_json TEXT NOT NULL DEFAULT '[]'
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create alpha_runs")?;

    debug!("Settlement schema ready");
    Ok(())
}

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

/// Timestamps are stored as Unix seconds.
pub fn to_db_time(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

pub fn from_db_time(secs: i64) -> Result<DateTime<Utc>, SettlementError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| SettlementError::CorruptRow(format!("timestamp out of range: {secs}")))
}

pub fn from_db_time_opt(secs: Option<i64>) -> Result<Option<DateTime<Utc>>, SettlementError> {
    secs.map(from_db_time).transpose()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
