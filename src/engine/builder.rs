//! Episode builder.
//!
//! Turns attributed market updates into durable episode rows. The pull is
//! a bounded, oldest-first work queue keyed on `(created_at, id)`; inserts
//! ignore conflicts on the market update reference, so repeated or
//! overlapping builds never create a second episode for the same trade.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use tracing::{debug, info, warn};

use crate::config::SettlementConfig;
use crate::storage::{from_db_time, to_db_time};
use crate::types::{snap_decimal, EpisodeType, MarketUpdate, SettlementError};

/// Episodes are grouped into 15-minute buckets.
pub const BUCKET_SECS: i64 = 15 * 60;

/// Rows fetched per queue pull.
const PAGE_SIZE: i64 = 100;

// ---------------------------------------------------------------------------
// Work queue
// ---------------------------------------------------------------------------

/// Keyset position in the unattributed-update queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCursor {
    pub created_at: i64,
    pub id: i64,
}

/// Restricts the queue to `event_id % count == index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    pub count: i64,
    pub index: i64,
}

#[derive(Debug, FromRow)]
struct MarketUpdateRow {
    id: i64,
    event_id: i64,
    trader_id: i64,
    prev_prob: f64,
    new_prob: f64,
    stake_ledger: i64,
    had_prior_position: i64,
    referral_post_id: Option<i64>,
    created_at: i64,
}

impl MarketUpdateRow {
    fn cursor(&self) -> QueueCursor {
        QueueCursor {
            created_at: self.created_at,
            id: self.id,
        }
    }

    fn into_update(self) -> Result<MarketUpdate> {
        Ok(MarketUpdate {
            id: self.id,
            event_id: self.event_id,
            trader_id: self.trader_id,
            prev_prob: self.prev_prob,
            new_prob: self.new_prob,
            stake_ledger: self.stake_ledger,
            had_prior_position: self.had_prior_position != 0,
            referral_post_id: self.referral_post_id,
            created_at: from_db_time(self.created_at)?,
        })
    }
}

/// Next page of referral-bearing updates without an episode, oldest first.
async fn pull_unattributed(
    pool: &SqlitePool,
    after: Option<QueueCursor>,
    shard: Shard,
    limit: i64,
) -> Result<Vec<MarketUpdateRow>> {
    let (after_ts, after_id) = after.map_or((i64::MIN, i64::MIN), |c| (c.created_at, c.id));

    let rows = sqlx::query_as::<_, MarketUpdateRow>(
        r#"
        SELECT mu.id, mu.event_id, mu.trader_id, mu.prev_prob, mu.new_prob,
               mu.stake_ledger, mu.had_prior_position, mu.referral_post_id, mu.created_at
        FROM market_updates mu
        WHERE mu.referral_post_id IS NOT NULL
          AND NOT EXISTS (SELECT 1 FROM alpha_episodes e WHERE e.market_update_id = mu.id)
          AND (mu.created_at > ?1 OR (mu.created_at = ?1 AND mu.id > ?2))
          AND ((mu.event_id % ?3) + ?3) % ?3 = ?4
        ORDER BY mu.created_at ASC, mu.id ASC
        LIMIT ?5
        "#,
    )
    .bind(after_ts)
    .bind(after_id)
    .bind(shard.count)
    .bind(shard.index)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("Failed to pull unattributed market updates")?;

    Ok(rows)
}

// ---------------------------------------------------------------------------
// Episode derivation
// ---------------------------------------------------------------------------

/// An episode ready to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeDraft {
    pub market_update_id: i64,
    pub post_id: i64,
    pub event_id: i64,
    pub trader_id: i64,
    pub bucket_start: DateTime<Utc>,
    pub episode_type: EpisodeType,
    pub is_meaningful: bool,
    pub p_before: f64,
    pub p_after: f64,
}

/// Floor a timestamp to the start of its 15-minute bucket.
pub fn bucket_start(at: DateTime<Utc>) -> DateTime<Utc> {
    let secs = at.timestamp();
    let floored = secs - secs.rem_euclid(BUCKET_SECS);
    DateTime::from_timestamp(floored, 0).unwrap_or(at)
}

/// A move is meaningful if either the probability shift or the stake
/// clears its threshold. The shift is compared at score precision, so a
/// move of exactly the threshold counts.
pub fn is_meaningful(update: &MarketUpdate, config: &SettlementConfig) -> bool {
    let moved = match (snap_decimal(update.prob_delta()), snap_decimal(config.min_prob_delta)) {
        (Some(delta), Some(min)) => delta >= min,
        _ => update.prob_delta() >= config.min_prob_delta,
    };
    moved || update.stake_ledger >= config.min_stake_ledger
}

/// Derive an episode from an update. An update without a referral post is
/// a corrupt queue row.
pub fn draft_episode(update: &MarketUpdate, config: &SettlementConfig) -> Result<EpisodeDraft, SettlementError> {
    let post_id = update.referral_post_id.ok_or_else(|| {
        SettlementError::CorruptRow(format!("market update {} has no referral post", update.id))
    })?;
    Ok(EpisodeDraft {
        market_update_id: update.id,
        post_id,
        event_id: update.event_id,
        trader_id: update.trader_id,
        bucket_start: bucket_start(update.created_at),
        episode_type: EpisodeType::from_prior_position(update.had_prior_position),
        is_meaningful: is_meaningful(update, config),
        p_before: update.prev_prob,
        p_after: update.new_prob,
    })
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Counters from one build pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub pulled: u64,
    pub created: u64,
    /// Insert ignored because another run already created the episode.
    pub existing: u64,
    pub failed: u64,
}

pub struct EpisodeBuilder {
    pool: SqlitePool,
    config: SettlementConfig,
    shard: Shard,
}

impl EpisodeBuilder {
    pub fn new(pool: SqlitePool, config: SettlementConfig) -> Self {
        let shard = Shard {
            count: config.shard_count,
            index: config.shard_index,
        };
        Self { pool, config, shard }
    }

    /// Build episodes for up to `build_batch_size` queued updates.
    ///
    /// Individual rows that fail to convert or insert are logged and
    /// skipped; only queue-level failures abort the pass.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<BuildReport> {
        let mut report = BuildReport::default();
        let mut cursor: Option<QueueCursor> = None;
        let budget = self.config.build_batch_size;

        while (report.pulled as i64) < budget {
            let limit = PAGE_SIZE.min(budget - report.pulled as i64);
            let page = pull_unattributed(&self.pool, cursor, self.shard, limit).await?;
            let page_len = page.len() as i64;

            for row in page {
                cursor = Some(row.cursor());
                report.pulled += 1;
                let update_id = row.id;

                match self.build_one(row, now).await {
                    Ok(true) => report.created += 1,
                    Ok(false) => report.existing += 1,
                    Err(e) => {
                        report.failed += 1;
                        warn!(market_update_id = update_id, error = %e, "Episode build failed, skipping");
                    }
                }
            }

            if page_len < limit {
                break;
            }
        }

        info!(
            pulled = report.pulled,
            created = report.created,
            existing = report.existing,
            failed = report.failed,
            "Episode build complete"
        );
        Ok(report)
    }

    /// Returns `true` if a new episode row was inserted.
    async fn build_one(&self, row: MarketUpdateRow, now: DateTime<Utc>) -> Result<bool> {
        let update = row.into_update()?;
        let draft = draft_episode(&update, &self.config)?;

        let result = sqlx::query(
            r#"
            INSERT INTO alpha_episodes
                (market_update_id, post_id, event_id, trader_id, bucket_start,
                 episode_type, is_meaningful, p_before, p_after, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(market_update_id) DO NOTHING
            "#,
        )
        .bind(draft.market_update_id)
        .bind(draft.post_id)
        .bind(draft.event_id)
        .bind(draft.trader_id)
        .bind(to_db_time(draft.bucket_start))
        .bind(draft.episode_type.as_str())
        .bind(draft.is_meaningful)
        .bind(draft.p_before)
        .bind(draft.p_after)
        .bind(to_db_time(now))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to insert episode for update {}", draft.market_update_id))?;

        let inserted = result.rows_affected() > 0;
        debug!(
            market_update_id = draft.market_update_id,
            post_id = draft.post_id,
            episode_type = %draft.episode_type,
            meaningful = draft.is_meaningful,
            inserted,
            "Episode drafted"
        );
        Ok(inserted)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
