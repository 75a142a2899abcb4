//! Payout minter.
//!
//! Converts newly scored horizons into ledger credits. Candidates are
//! claimed through an [`EpisodeLease`], then every payout and credit of the
//! batch is written in a single transaction: either the whole batch commits
//! or none of it does. Each `(episode, component)` pair settles exactly
//! once, as `minted` (possibly zero or clipped to the remaining cap) or as
//! `skipped_by_cap`.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::FromRow;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::config::SettlementConfig;
use crate::storage::collaborators::{credit_ledger, post_author};
use crate::storage::lease::{EpisodeLease, LeaseBatch};
use crate::storage::to_db_time;
use crate::types::{snap_decimal, EpisodeType, Horizon, PayoutStatus, SettlementError};

/// Author reliability factor. Every author currently counts fully.
const RELIABILITY: f64 = 1.0;

/// Length of the trailing cap window.
pub const CAP_WINDOW_SECS: i64 = 86_400;

// ---------------------------------------------------------------------------
// Reward arithmetic
// ---------------------------------------------------------------------------

/// Multiplier applied to an episode of the given type.
pub fn type_multiplier(episode_type: EpisodeType, config: &SettlementConfig) -> f64 {
    match episode_type {
        EpisodeType::Belief => config.belief_multiplier,
        EpisodeType::Attention => config.attention_multiplier,
    }
}

/// Weight applied to a horizon's score.
pub fn horizon_weight(horizon: Horizon, config: &SettlementConfig) -> f64 {
    match horizon {
        Horizon::Early => config.early_weight,
        Horizon::Mid => config.mid_weight,
        Horizon::Final => config.final_weight,
    }
}

fn to_decimal(name: &str, value: f64) -> Result<Decimal, SettlementError> {
    snap_decimal(value)
        .ok_or_else(|| SettlementError::RewardOverflow(format!("{name} {value} is not representable")))
}

fn checked_product(factors: &[Decimal]) -> Result<Decimal, SettlementError> {
    factors.iter().try_fold(Decimal::ONE, |acc, f| {
        acc.checked_mul(*f)
            .ok_or_else(|| SettlementError::RewardOverflow(format!("{acc} times {f} overflows")))
    })
}

/// `reliability × type multiplier × horizon weight × score`, with the score
/// snapped to 12 decimal places so float noise cannot shave a unit off the
/// floor.
pub fn component_score(
    score: f64,
    episode_type: EpisodeType,
    horizon: Horizon,
    config: &SettlementConfig,
) -> Result<Decimal, SettlementError> {
    checked_product(&[
        to_decimal("reliability", RELIABILITY)?,
        to_decimal("type multiplier", type_multiplier(episode_type, config))?,
        to_decimal("horizon weight", horizon_weight(horizon, config))?,
        to_decimal("score", score)?,
    ])
}

/// Whole ledger units for a component score; any fraction is dropped.
///
/// A reward that does not fit the ledger is an error, never a silent zero.
pub fn reward_ledger(component_score: Decimal, config: &SettlementConfig) -> Result<i64, SettlementError> {
    let rate = to_decimal("mint rate", config.mint_rate_ledger_per_point)?;
    let raw = checked_product(&[component_score, rate])?.floor();
    let reward = raw
        .to_i64()
        .ok_or_else(|| SettlementError::RewardOverflow(format!("reward {raw} exceeds the ledger range")))?;
    Ok(reward.max(0))
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Counters from one minting pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MintReport {
    pub claimed: u64,
    pub minted: u64,
    /// Components settled with a zero reward.
    pub zero: u64,
    pub capped: u64,
    /// Total ledger units credited.
    pub ledger_minted: i64,
}

#[derive(Debug, FromRow)]
struct MintRow {
    id: i64,
    post_id: i64,
    event_id: i64,
    episode_type: String,
    s_early: Option<f64>,
    s_mid: Option<f64>,
    s_final: Option<f64>,
}

impl MintRow {
    fn score(&self, horizon: Horizon) -> Option<f64> {
        match horizon {
            Horizon::Early => self.s_early,
            Horizon::Mid => self.s_mid,
            Horizon::Final => self.s_final,
        }
    }
}

/// One payout row about to be written.
struct PayoutDraft {
    episode_id: i64,
    component: Horizon,
    post_id: i64,
    author_id: i64,
    event_id: i64,
    score_component: f64,
    reward_ledger: i64,
    status: PayoutStatus,
}

// ---------------------------------------------------------------------------
// Minter
// ---------------------------------------------------------------------------

pub struct PayoutMinter {
    pool: SqlitePool,
    config: SettlementConfig,
    lease: Box<dyn EpisodeLease>,
}

impl PayoutMinter {
    pub fn new(pool: SqlitePool, config: SettlementConfig, lease: Box<dyn EpisodeLease>) -> Self {
        Self { pool, config, lease }
    }

    /// Claim, mint, release.
    ///
    /// The lease is released whether or not the mint transaction committed,
    /// so a failed batch is immediately retryable with the same candidates.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<MintReport> {
        let batch = self.lease.claim(self.config.mint_batch_size, now).await?;
        if batch.is_empty() {
            debug!("No episodes awaiting payout");
            return Ok(MintReport::default());
        }

        let outcome = self.mint_batch(&batch, now).await;

        if let Err(e) = self.lease.release(&batch).await {
            warn!(token = %batch.token, error = %e, "Lease release failed, will expire");
        }

        let report = outcome?;
        info!(
            claimed = report.claimed,
            minted = report.minted,
            zero = report.zero,
            capped = report.capped,
            ledger = report.ledger_minted,
            "Payout minting complete"
        );
        Ok(report)
    }

    async fn mint_batch(&self, batch: &LeaseBatch, now: DateTime<Utc>) -> Result<MintReport> {
        let mut tx = self.pool.begin().await.context("Failed to open mint transaction")?;

        // Renewing first takes the write lock before anything is read, and
        // tells us which episodes we still hold.
        let renewed = sqlx::query(
            "UPDATE alpha_episodes SET lease_expires_at = ? WHERE lease_token = ?",
        )
        .bind(to_db_time(now + self.lease.ttl()))
        .bind(&batch.token)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if renewed == 0 {
            return Err(SettlementError::LeaseLost {
                token: batch.token.clone(),
            }
            .into());
        }

        let rows = sqlx::query_as::<_, MintRow>(
            r#"
            SELECT id, post_id, event_id, episode_type, s_early, s_mid, s_final
            FROM alpha_episodes
            WHERE lease_token = ?
            ORDER BY id
            "#,
        )
        .bind(&batch.token)
        .fetch_all(&mut *tx)
        .await?;

        let mut report = MintReport {
            claimed: rows.len() as u64,
            ..Default::default()
        };

        for row in rows {
            self.mint_episode(&mut *tx, &row, now, &mut report).await?;
        }

        tx.commit().await.context("Failed to commit mint transaction")?;
        Ok(report)
    }

    async fn mint_episode(
        &self,
        conn: &mut SqliteConnection,
        row: &MintRow,
        now: DateTime<Utc>,
        report: &mut MintReport,
    ) -> Result<()> {
        let episode_type: EpisodeType = row.episode_type.parse()?;
        let author_id = post_author(&mut *conn, row.post_id)
            .await?
            .ok_or(SettlementError::UnknownPost {
                episode_id: row.id,
                post_id: row.post_id,
            })?;

        let paid: HashSet<String> = sqlx::query_scalar::<_, String>(
            "SELECT component FROM alpha_payouts WHERE episode_id = ?",
        )
        .bind(row.id)
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .collect();

        for horizon in Horizon::ALL {
            let Some(score) = row.score(horizon) else {
                continue;
            };
            if paid.contains(horizon.as_str()) {
                continue;
            }

            // Overflow aborts the batch rather than settling the component at zero.
            let component = component_score(score, episode_type, horizon, &self.config)?;
            let reward = reward_ledger(component, &self.config)?;
            let mut draft = PayoutDraft {
                episode_id: row.id,
                component: horizon,
                post_id: row.post_id,
                author_id,
                event_id: row.event_id,
                score_component: component.to_f64().unwrap_or(0.0),
                reward_ledger: reward,
                status: PayoutStatus::Minted,
            };

            if reward == 0 {
                if self.insert_payout(&mut *conn, &draft, now).await? {
                    report.zero += 1;
                }
                continue;
            }

            let window_start = now - Duration::seconds(CAP_WINDOW_SECS);
            let post_remaining = self.config.cap_per_post_per_day_ledger
                - minted_since(&mut *conn, "post_id", row.post_id, window_start).await?;
            let author_remaining = self.config.cap_per_author_per_day_ledger
                - minted_since(&mut *conn, "author_id", author_id, window_start).await?;

            if post_remaining <= 0 || author_remaining <= 0 {
                draft.status = PayoutStatus::SkippedByCap;
                if self.insert_payout(&mut *conn, &draft, now).await? {
                    report.capped += 1;
                    debug!(
                        episode_id = row.id,
                        component = %horizon,
                        intended = reward,
                        post_remaining,
                        author_remaining,
                        "Payout skipped by cap"
                    );
                }
                continue;
            }

            draft.reward_ledger = reward.min(post_remaining).min(author_remaining);
            if !self.insert_payout(&mut *conn, &draft, now).await? {
                continue;
            }

            let credited = credit_ledger(&mut *conn, author_id, draft.reward_ledger).await?;
            if credited == 0 {
                return Err(SettlementError::UnknownAuthor {
                    author_id,
                    post_id: row.post_id,
                }
                .into());
            }

            report.minted += 1;
            report.ledger_minted += draft.reward_ledger;
            debug!(
                episode_id = row.id,
                component = %horizon,
                author_id,
                reward = draft.reward_ledger,
                intended = reward,
                "Payout minted"
            );
        }

        sqlx::query(
            r#"
            UPDATE alpha_episodes
            SET combined_score = (
                SELECT COALESCE(SUM(score_component), 0.0)
                FROM alpha_payouts WHERE episode_id = ?1
            )
            WHERE id = ?1
            "#,
        )
        .bind(row.id)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Returns `false` when the component was already settled elsewhere.
    async fn insert_payout(
        &self,
        conn: &mut SqliteConnection,
        draft: &PayoutDraft,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO alpha_payouts
                (episode_id, component, post_id, author_id, event_id,
                 score_component, mint_rate, reward_ledger, payout_status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(episode_id, component) DO NOTHING
            "#,
        )
        .bind(draft.episode_id)
        .bind(draft.component.as_str())
        .bind(draft.post_id)
        .bind(draft.author_id)
        .bind(draft.event_id)
        .bind(draft.score_component)
        .bind(self.config.mint_rate_ledger_per_point)
        .bind(draft.reward_ledger)
        .bind(draft.status.as_str())
        .bind(to_db_time(now))
        .execute(conn)
        .await
        .with_context(|| {
            format!(
                "Failed to insert {} payout for episode {}",
                draft.component, draft.episode_id
            )
        })?;
        Ok(result.rows_affected() > 0)
    }
}

/// Ledger units minted for a post or author since `since`.
async fn minted_since(
    conn: &mut SqliteConnection,
    key: &'static str,
    id: i64,
    since: DateTime<Utc>,
) -> Result<i64> {
    let sql = format!(
        "SELECT COALESCE(SUM(reward_ledger), 0) FROM alpha_payouts
         WHERE {key} = ? AND payout_status = 'minted' AND created_at > ?"
    );
    let total = sqlx::query_scalar::<_, i64>(&sql)
        .bind(id)
        .bind(to_db_time(since))
        .fetch_one(conn)
        .await?;
    Ok(total)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
