//! Batch run audit trail.
//!
//! Every orchestrator invocation leaves exactly one `alpha_runs` row, including
//! skipped and failed runs, so operators can see what each run did.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use super::builder::BuildReport;
use super::minter::MintReport;
use super::scorer::ScoreReport;
use crate::storage::{from_db_time, to_db_time};
use crate::types::SettlementError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    /// Settlement disabled by configuration.
    Skipped,
    /// At least one phase returned an error.
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Skipped => "skipped",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(RunStatus::Completed),
            "skipped" => Ok(RunStatus::Skipped),
            "failed" => Ok(RunStatus::Failed),
            other => Err(SettlementError::CorruptRow(format!("unknown run status: {other}"))),
        }
    }
}

/// What one batch invocation did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Row id once recorded.
    pub run_id: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub status: RunStatus,
    pub build: BuildReport,
    pub score: ScoreReport,
    pub mint: MintReport,
    pub error_count: u64,
    /// Human-readable trail, e.g. `"mint: Author 7 of post 3 has no ledger account"`.
    pub events: Vec<String>,
}

impl RunSummary {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: None,
            started_at,
            finished_at: started_at,
            duration_ms: 0,
            status: RunStatus::Completed,
            build: BuildReport::default(),
            score: ScoreReport::default(),
            mint: MintReport::default(),
            error_count: 0,
            events: Vec::new(),
        }
    }

    /// Record a phase failure without stopping the run.
    pub fn phase_failed(&mut self, phase: &str, error: &anyhow::Error) {
        self.error_count += 1;
        self.events.push(format!("{phase}: {error:#}"));
    }

    pub fn note(&mut self, event: impl Into<String>) {
        self.events.push(event.into());
    }
}

#[derive(Debug, FromRow)]
struct RunRow {
    id: i64,
    started_at: i64,
    finished_at: i64,
    duration_ms: i64,
    status: String,
    updates_pulled: i64,
    episodes_created: i64,
    episodes_existing: i64,
    build_failures: i64,
    episodes_examined: i64,
    early_scored: i64,
    mid_scored: i64,
    final_scored: i64,
    score_failures: i64,
    episodes_claimed: i64,
    payouts_minted: i64,
    payouts_zero: i64,
    payouts_capped: i64,
    ledger_minted: i64,
    error_count: i64,
    events_json: String,
}

impl TryFrom<RunRow> for RunSummary {
    type Error = anyhow::Error;

    fn try_from(row: RunRow) -> Result<Self> {
        let events: Vec<String> = serde_json::from_str(&row.events_json)
            .with_context(|| format!("Corrupt event trail on run {}", row.id))?;
        Ok(RunSummary {
            run_id: Some(row.id),
            started_at: from_db_time(row.started_at)?,
            finished_at: from_db_time(row.finished_at)?,
            duration_ms: row.duration_ms,
            status: row.status.parse()?,
            build: BuildReport {
                pulled: row.updates_pulled as u64,
                created: row.episodes_created as u64,
                existing: row.episodes_existing as u64,
                failed: row.build_failures as u64,
            },
            score: ScoreReport {
                examined: row.episodes_examined as u64,
                early_scored: row.early_scored as u64,
                mid_scored: row.mid_scored as u64,
                final_scored: row.final_scored as u64,
                failed: row.score_failures as u64,
            },
            mint: MintReport {
                claimed: row.episodes_claimed as u64,
                minted: row.payouts_minted as u64,
                zero: row.payouts_zero as u64,
                capped: row.payouts_capped as u64,
                ledger_minted: row.ledger_minted,
            },
            error_count: row.error_count as u64,
            events,
        })
    }
}

/// Append-only writer and reader for `alpha_runs`.
#[derive(Clone)]
pub struct RunLogger {
    pool: SqlitePool,
}

impl RunLogger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a finished run. Returns the new row id.
    pub async fn record(&self, summary: &RunSummary) -> Result<i64> {
        let events_json = serde_json::to_string(&summary.events)?;
        let result = sqlx::query(
            r#"
            INSERT INTO alpha_runs
                (started_at, finished_at, duration_ms, status,
                 updates_pulled, episodes_created, episodes_existing, build_failures,
                 episodes_examined, early_scored, mid_scored, final_scored, score_failures,
                 episodes_claimed, payouts_minted, payouts_zero, payouts_capped, ledger_minted,
                 error_count, events_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(to_db_time(summary.started_at))
        .bind(to_db_time(summary.finished_at))
        .bind(summary.duration_ms)
        .bind(summary.status.as_str())
        .bind(summary.build.pulled as i64)
        .bind(summary.build.created as i64)
        .bind(summary.build.existing as i64)
        .bind(summary.build.failed as i64)
        .bind(summary.score.examined as i64)
        .bind(summary.score.early_scored as i64)
        .bind(summary.score.mid_scored as i64)
        .bind(summary.score.final_scored as i64)
        .bind(summary.score.failed as i64)
        .bind(summary.mint.claimed as i64)
        .bind(summary.mint.minted as i64)
        .bind(summary.mint.zero as i64)
        .bind(summary.mint.capped as i64)
        .bind(summary.mint.ledger_minted)
        .bind(summary.error_count as i64)
        .bind(events_json)
        .execute(&self.pool)
        .await
        .context("Failed to record run")?;

        let run_id = result.last_insert_rowid();
        debug!(run_id, status = %summary.status, "Run recorded");
        Ok(run_id)
    }

    /// Latest runs, newest first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<RunSummary>> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, started_at, finished_at, duration_ms, status,
                   updates_pulled, episodes_created, episodes_existing, build_failures,
                   episodes_examined, early_scored, mid_scored, final_scored, score_failures,
                   episodes_claimed, payouts_minted, payouts_zero, payouts_capped, ledger_minted,
                   error_count, events_json
            FROM alpha_runs
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .context("Failed to load recent runs")?;

        rows.into_iter().map(RunSummary::try_from).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
